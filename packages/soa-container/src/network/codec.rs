//! Transport framing: splits the TCP byte stream into complete
//! length-prefixed frames and writes response frames back unchanged.
//!
//! The decoder only peeks the 4-byte prefix; the yielded frame keeps it, so
//! the protocol codec parses the whole frame on its own.

use bytes::{Bytes, BytesMut};
use soa_core::frame::{peek_length, LENGTH_PREFIX_SIZE};
use tokio_util::codec::{Decoder, Encoder};

/// Transport-fatal framing errors. Any of these closes the connection.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
}

/// `Decoder` yielding complete frames, prefix included; `Encoder` passing
/// already-encoded frames through.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_length: usize,
}

impl FrameCodec {
    /// `max_frame_length` bounds the declared length (prefix excluded).
    #[must_use]
    pub fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        let Some(declared) = peek_length(src) else {
            return Ok(None);
        };
        let declared = declared as usize;
        if declared > self.max_frame_length {
            return Err(FrameError::TooLarge {
                size: declared,
                max: self.max_frame_length,
            });
        }

        let total = LENGTH_PREFIX_SIZE + declared;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        Ok(Some(src.split_to(total).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        dst.extend_from_slice(&frame);
        Ok(())
    }
}
