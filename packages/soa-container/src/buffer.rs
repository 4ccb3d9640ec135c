//! Input buffer ownership and release accounting.
//!
//! Every frame taken off a connection is wrapped in an [`InputFrame`] that
//! holds a [`BufferLease`]. The lease is released exactly once: either
//! explicitly through [`InputFrame::release`] or, on any other exit path
//! (early return, panic unwinding, a dropped task), when the frame is
//! dropped. The tracker counts both sides so leaks are observable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

#[derive(Debug, Default)]
struct Counters {
    acquired: AtomicU64,
    released: AtomicU64,
}

/// Counts input buffers handed out and released. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct BufferTracker {
    counters: Arc<Counters>,
}

impl BufferTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of a frame read off the wire.
    #[must_use]
    pub fn acquire(&self, bytes: Bytes) -> InputFrame {
        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        InputFrame {
            bytes,
            _lease: BufferLease {
                counters: Arc::clone(&self.counters),
            },
        }
    }

    #[must_use]
    pub fn acquired(&self) -> u64 {
        self.counters.acquired.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn released(&self) -> u64 {
        self.counters.released.load(Ordering::Relaxed)
    }

    /// Buffers acquired but not yet released.
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        self.acquired().saturating_sub(self.released())
    }
}

/// RAII release marker; counts one release when dropped.
#[derive(Debug)]
struct BufferLease {
    counters: Arc<Counters>,
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        self.counters.released.fetch_add(1, Ordering::Relaxed);
    }
}

/// A complete inbound frame with single-owner release semantics.
#[derive(Debug)]
pub struct InputFrame {
    bytes: Bytes,
    _lease: BufferLease,
}

impl InputFrame {
    /// Frame bytes, length prefix included. Cloning `Bytes` is a refcount
    /// bump, not a copy.
    #[must_use]
    pub fn bytes(&self) -> Bytes {
        self.bytes.clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Releases the frame. Consuming `self` makes a second release
    /// impossible.
    pub fn release(self) {
        tracing::trace!(len = self.bytes.len(), "input buffer released");
    }
}
