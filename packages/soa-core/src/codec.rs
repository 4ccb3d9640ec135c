//! Pluggable protocol codec and the default `MessagePack` implementation.
//!
//! The request pipeline only depends on [`ProtocolCodec`]: it decodes a
//! header, sequence id and body out of a complete frame, and encodes a
//! response frame from a header and body. The byte grammar inside the frame
//! belongs to the codec.
//!
//! # `MsgPackProtocol` layout
//!
//! ```text
//! | length: u32 BE | header length: u32 BE | header (MsgPack map) | body |
//! ```
//!
//! `length` counts everything after itself. The header is serialized with
//! `rmp_serde::to_vec_named`, so encoding the same header twice yields the
//! same bytes.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::frame::{peek_length, LENGTH_PREFIX_SIZE};
use crate::header::{MessageType, SoaHeader};

/// Errors raised while decoding or encoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("frame declares {declared} payload bytes but carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("malformed header: {0}")]
    MalformedHeader(#[from] rmp_serde::decode::Error),
    #[error("failed to encode header: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("frame of {size} bytes exceeds the u32 length prefix")]
    FrameTooLarge { size: usize },
}

/// A fully decoded message: header, sequence id, message kind and the
/// still-encoded body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    pub header: SoaHeader,
    pub seq_id: i32,
    pub message_type: MessageType,
    pub body: Bytes,
}

/// Decodes headers from frames and encodes frames from headers.
///
/// Implementations must be deterministic: decoding the same bytes twice
/// yields equal headers, and encoding the same input twice yields identical
/// bytes.
pub trait ProtocolCodec: Send + Sync + 'static {
    /// Decodes a complete frame, length prefix included.
    ///
    /// # Errors
    ///
    /// Returns a `CodecError` when the frame is truncated, its prefix
    /// disagrees with its size, or the header cannot be parsed.
    fn decode(&self, frame: Bytes) -> Result<DecodedMessage, CodecError>;

    /// Encodes a complete frame, length prefix included.
    ///
    /// # Errors
    ///
    /// Returns a `CodecError` when the header cannot be serialized or the
    /// frame would not fit the length prefix.
    fn encode(
        &self,
        header: &SoaHeader,
        seq_id: i32,
        message_type: MessageType,
        body: &[u8],
    ) -> Result<Bytes, CodecError>;
}

// ---------------------------------------------------------------------------
// Wire envelope
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeRef<'a> {
    service_name: &'a str,
    method_name: &'a str,
    version_name: &'a str,
    seq_id: i32,
    message_type: MessageType,
    resp_code: Option<&'a str>,
    resp_message: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    service_name: String,
    method_name: String,
    version_name: String,
    seq_id: i32,
    message_type: MessageType,
    #[serde(default)]
    resp_code: Option<String>,
    #[serde(default)]
    resp_message: Option<String>,
}

/// Size of the header-length field that follows the frame length prefix.
const HEADER_LENGTH_SIZE: usize = 4;

// ---------------------------------------------------------------------------
// MsgPackProtocol
// ---------------------------------------------------------------------------

/// Default codec: a `MessagePack` header envelope followed by an opaque body.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackProtocol;

impl ProtocolCodec for MsgPackProtocol {
    fn decode(&self, frame: Bytes) -> Result<DecodedMessage, CodecError> {
        let fixed = LENGTH_PREFIX_SIZE + HEADER_LENGTH_SIZE;
        if frame.len() < fixed {
            return Err(CodecError::Truncated {
                needed: fixed,
                available: frame.len(),
            });
        }

        let declared = peek_length(&frame).map_or(0, |len| len as usize);
        let actual = frame.len() - LENGTH_PREFIX_SIZE;
        if declared != actual {
            return Err(CodecError::LengthMismatch { declared, actual });
        }

        let header_len = peek_length(&frame[LENGTH_PREFIX_SIZE..]).map_or(0, |len| len as usize);
        let header_end = fixed.saturating_add(header_len);
        if header_end > frame.len() {
            return Err(CodecError::Truncated {
                needed: header_end,
                available: frame.len(),
            });
        }

        let envelope: Envelope = rmp_serde::from_slice(&frame[fixed..header_end])?;
        let header = SoaHeader::new(
            envelope.service_name,
            envelope.version_name,
            envelope.method_name,
        )
        .with_response(envelope.resp_code, envelope.resp_message);

        Ok(DecodedMessage {
            header,
            seq_id: envelope.seq_id,
            message_type: envelope.message_type,
            body: frame.slice(header_end..),
        })
    }

    fn encode(
        &self,
        header: &SoaHeader,
        seq_id: i32,
        message_type: MessageType,
        body: &[u8],
    ) -> Result<Bytes, CodecError> {
        let envelope = rmp_serde::to_vec_named(&EnvelopeRef {
            service_name: &header.service_name,
            method_name: &header.method_name,
            version_name: &header.version_name,
            seq_id,
            message_type,
            resp_code: header.resp_code(),
            resp_message: header.resp_message(),
        })?;

        let payload_len = HEADER_LENGTH_SIZE + envelope.len() + body.len();
        let length = u32::try_from(payload_len)
            .map_err(|_| CodecError::FrameTooLarge { size: payload_len })?;
        // The envelope is strictly smaller than the whole payload.
        #[allow(clippy::cast_possible_truncation)]
        let header_len = envelope.len() as u32;

        let mut out = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload_len);
        out.put_u32(length);
        out.put_u32(header_len);
        out.put_slice(&envelope);
        out.put_slice(body);
        Ok(out.freeze())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn header() -> SoaHeader {
        SoaHeader::new("com.isuwang.soa.order.OrderService", "1.0.0", "createOrder")
    }

    #[test]
    fn encode_then_decode_keeps_header_and_body() {
        let frame = MsgPackProtocol
            .encode(&header(), 7, MessageType::Call, b"payload")
            .unwrap();

        let decoded = MsgPackProtocol.decode(frame).unwrap();
        assert_eq!(decoded.header, header());
        assert_eq!(decoded.seq_id, 7);
        assert_eq!(decoded.message_type, MessageType::Call);
        assert_eq!(&decoded.body[..], b"payload");
    }

    #[test]
    fn length_prefix_covers_everything_after_it() {
        let frame = MsgPackProtocol
            .encode(&header(), 1, MessageType::Call, b"abc")
            .unwrap();
        assert_eq!(
            peek_length(&frame).unwrap() as usize,
            frame.len() - LENGTH_PREFIX_SIZE
        );
    }

    #[test]
    fn response_fields_survive_the_wire() {
        let mut h = header();
        h.set_response(Some("Err-Core-002".into()), Some("no available server found".into()));
        let frame = MsgPackProtocol
            .encode(&h, 3, MessageType::Reply, &[])
            .unwrap();

        let decoded = MsgPackProtocol.decode(frame).unwrap();
        assert_eq!(decoded.header.resp_code(), Some("Err-Core-002"));
        assert_eq!(
            decoded.header.resp_message(),
            Some("no available server found")
        );
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let err = MsgPackProtocol
            .decode(Bytes::from_static(&[0, 0, 0]))
            .unwrap_err();
        assert!(matches!(err, CodecError::Truncated { available: 3, .. }));
    }

    #[test]
    fn mismatched_prefix_is_rejected() {
        let frame = MsgPackProtocol
            .encode(&header(), 1, MessageType::Call, b"abc")
            .unwrap();
        let short = frame.slice(..frame.len() - 1);
        let err = MsgPackProtocol.decode(short).unwrap_err();
        assert!(matches!(err, CodecError::LengthMismatch { .. }));
    }

    #[test]
    fn header_length_past_end_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(4 + 2);
        buf.put_u32(100);
        buf.put_slice(&[0x80, 0x80]);
        let err = MsgPackProtocol.decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { needed: 108, .. }));
    }

    #[test]
    fn garbage_header_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u32(4 + 3);
        buf.put_u32(3);
        buf.put_slice(&[0xc1, 0xc1, 0xc1]);
        let err = MsgPackProtocol.decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, CodecError::MalformedHeader(_)));
    }

    fn arb_header() -> impl Strategy<Value = SoaHeader> {
        (
            "[a-zA-Z.]{1,40}",
            "[0-9.]{1,8}",
            "[a-zA-Z]{1,20}",
            proptest::option::of("[A-Za-z0-9-]{1,16}"),
            proptest::option::of(".{0,32}"),
        )
            .prop_map(|(service, version, method, code, message)| {
                SoaHeader::new(service, version, method).with_response(code, message)
            })
    }

    proptest! {
        #[test]
        fn decoding_same_frame_twice_is_identical(
            header in arb_header(),
            seq_id in any::<i32>(),
            body in proptest::collection::vec(any::<u8>(), 0..256),
        ) {
            let frame = MsgPackProtocol.encode(&header, seq_id, MessageType::Call, &body).unwrap();
            let first = MsgPackProtocol.decode(frame.clone()).unwrap();
            let second = MsgPackProtocol.decode(frame).unwrap();
            prop_assert_eq!(first, second);
        }

        #[test]
        fn encoding_same_input_twice_is_byte_identical(
            header in arb_header(),
            seq_id in any::<i32>(),
            body in proptest::collection::vec(any::<u8>(), 0..256),
        ) {
            let first = MsgPackProtocol.encode(&header, seq_id, MessageType::Reply, &body).unwrap();
            let second = MsgPackProtocol.encode(&header, seq_id, MessageType::Reply, &body).unwrap();
            prop_assert_eq!(first, second);
        }
    }
}
