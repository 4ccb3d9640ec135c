//! Length-prefixed frame helpers.
//!
//! # Wire format
//!
//! ```text
//! +----------------------+-----------------------------+
//! | length: u32 (BE)     | payload: `length` bytes     |
//! +----------------------+-----------------------------+
//! ```
//!
//! The length covers every byte after the prefix. The prefix is only peeked
//! here; the protocol codec re-reads it when it decodes the frame.

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Reads the declared payload length without consuming the prefix.
///
/// Returns `None` when fewer than [`LENGTH_PREFIX_SIZE`] bytes are available.
#[must_use]
pub fn peek_length(buf: &[u8]) -> Option<u32> {
    let prefix: [u8; LENGTH_PREFIX_SIZE] = buf.get(..LENGTH_PREFIX_SIZE)?.try_into().ok()?;
    Some(u32::from_be_bytes(prefix))
}

/// Bytes a request occupies on the wire, prefix included. Used for the
/// request-bytes metric.
///
/// Returns `None` when the prefix itself is incomplete.
#[must_use]
pub fn request_size(frame: &[u8]) -> Option<u64> {
    peek_length(frame).map(|len| u64::from(len) + LENGTH_PREFIX_SIZE as u64)
}
