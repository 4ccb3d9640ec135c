//! Live TCP connections and their outbound queues.
//!
//! Each connection owns an unbounded channel drained by its writer task. The
//! sending half, wrapped in a [`ConnectionHandle`], is the [`ResponseSink`]
//! handed to every request read from that connection, so worker threads can
//! answer without touching the socket. Queueing a reply never blocks and
//! never drops it; only a connection whose writer is gone refuses frames.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::pipeline::{ConnectionInfo, ResponseSink, WriteError};

/// Registry-assigned connection id. Starts at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Work item for a connection's writer task.
#[derive(Debug)]
pub enum OutboundMessage {
    /// A complete, already-encoded frame.
    Frame(Bytes),
    /// Flush what is queued ahead of this message, then close.
    Close,
}

/// Sending side of one connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub info: ConnectionInfo,
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl ConnectionHandle {
    /// Queues a close after everything already queued.
    ///
    /// Returns `false` when the writer is already gone.
    pub fn close(&self) -> bool {
        self.tx.send(OutboundMessage::Close).is_ok()
    }
}

impl ResponseSink for ConnectionHandle {
    fn write(&self, frame: Bytes) -> Result<(), WriteError> {
        self.tx
            .send(OutboundMessage::Frame(frame))
            .map_err(|_| WriteError::Closed)
    }
}

/// Concurrent table of live connections.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a connection, returning its handle and the receiver its
    /// writer task drains.
    pub fn register(
        &self,
        peer: Option<SocketAddr>,
        local: Option<SocketAddr>,
    ) -> (Arc<ConnectionHandle>, mpsc::UnboundedReceiver<OutboundMessage>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(ConnectionHandle {
            id,
            info: ConnectionInfo { peer, local },
            tx,
        });
        self.connections.insert(id, Arc::clone(&handle));
        (handle, rx)
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.remove(&id).map(|(_, handle)| handle)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Removes and returns every connection. Used when shutting down.
    pub fn drain_all(&self) -> Vec<Arc<ConnectionHandle>> {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.remove(id))
            .collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_sequential_from_one() {
        let registry = ConnectionRegistry::default();
        let (a, _rx_a) = registry.register(None, None);
        let (b, _rx_b) = registry.register(None, None);
        assert_eq!(a.id, ConnectionId(1));
        assert_eq!(b.id, ConnectionId(2));
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = ConnectionRegistry::default();
        let (handle, _rx) = registry.register(None, None);
        assert!(registry.remove(handle.id).is_some());
        assert!(registry.remove(handle.id).is_none());
        assert!(registry.remove(ConnectionId(99)).is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn drain_all_empties_the_registry() {
        let registry = ConnectionRegistry::default();
        let (_a, _rx_a) = registry.register(None, None);
        let (_b, _rx_b) = registry.register(None, None);
        assert_eq!(registry.drain_all().len(), 2);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn write_queues_frames_in_order() {
        let registry = ConnectionRegistry::default();
        let (handle, mut rx) = registry.register(None, None);
        handle.write(Bytes::from_static(b"one")).unwrap();
        handle.write(Bytes::from_static(b"two")).unwrap();
        assert!(handle.close());

        assert!(matches!(rx.try_recv().unwrap(), OutboundMessage::Frame(f) if f == "one"));
        assert!(matches!(rx.try_recv().unwrap(), OutboundMessage::Frame(f) if f == "two"));
        assert!(matches!(rx.try_recv().unwrap(), OutboundMessage::Close));
    }

    #[test]
    fn burst_of_replies_is_queued_without_loss() {
        let registry = ConnectionRegistry::default();
        let (handle, mut rx) = registry.register(None, None);
        let writers: Vec<_> = (0..8u8)
            .map(|n| {
                let handle = Arc::clone(&handle);
                std::thread::spawn(move || {
                    for i in 0..64u8 {
                        handle.write(Bytes::from(vec![n, i])).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let mut received = 0;
        while let Ok(OutboundMessage::Frame(_)) = rx.try_recv() {
            received += 1;
        }
        assert_eq!(received, 8 * 64);
    }

    #[test]
    fn closed_connection_is_a_write_error() {
        let registry = ConnectionRegistry::default();
        let (handle, rx) = registry.register(None, None);
        drop(rx);
        assert!(!handle.close());
        assert!(matches!(
            handle.write(Bytes::from_static(b"a")),
            Err(WriteError::Closed)
        ));
    }
}
