use std::time::{Duration, Instant};

use crate::header::SoaHeader;

/// Per-request state, created when a frame is read and moved to whichever
/// thread runs the request pipeline. Never shared between requests.
#[derive(Debug)]
pub struct RequestContext {
    header: SoaHeader,
    seq_id: i32,
    started_at: Instant,
    request_bytes: u64,
}

impl RequestContext {
    /// `started_at` is the instant the frame was taken off the connection;
    /// `request_bytes` is the frame size including its length prefix.
    #[must_use]
    pub fn new(header: SoaHeader, seq_id: i32, started_at: Instant, request_bytes: u64) -> Self {
        Self {
            header,
            seq_id,
            started_at,
            request_bytes,
        }
    }

    #[must_use]
    pub fn header(&self) -> &SoaHeader {
        &self.header
    }

    /// Mutable header access for the response path.
    pub fn header_mut(&mut self) -> &mut SoaHeader {
        &mut self.header
    }

    #[must_use]
    pub fn seq_id(&self) -> i32 {
        self.seq_id
    }

    #[must_use]
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    #[must_use]
    pub fn request_bytes(&self) -> u64 {
        self.request_bytes
    }

    /// Time since the frame was read.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}
