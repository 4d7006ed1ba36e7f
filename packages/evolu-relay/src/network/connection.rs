//! Connection registry and per-connection backpressure.
//!
//! Every relay connection is a client subscribed to exactly one owner's
//! mailbox (there is no inter-relay clustering in this design); registered
//! connections get a bounded mpsc channel so a single slow reader can never
//! block a broadcast to the rest of an owner's subscribers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;

use super::config::ConnectionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Message queued for delivery to a connection's WebSocket write loop.
#[derive(Debug)]
pub enum OutboundMessage {
    Binary(Vec<u8>),
    Close(Option<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    Timeout,
    Disconnected,
}

/// Handle to a single connection, providing send capabilities and metadata access.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub tx: mpsc::Sender<OutboundMessage>,
    pub connected_at: Instant,
}

impl ConnectionHandle {
    /// Attempts to send a message without blocking. Returns `false` if the
    /// channel is full or the connection has closed.
    #[must_use]
    pub fn try_send(&self, msg: OutboundMessage) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    pub async fn send_timeout(&self, msg: OutboundMessage, timeout: Duration) -> Result<(), SendError> {
        match tokio::time::timeout(timeout, self.tx.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Disconnected),
            Err(_) => Err(SendError::Timeout),
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Thread-safe registry of all active connections, plus the many-to-many
/// owner-id to connection-id subscription relation the relay broadcast uses.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    subscribers: DashMap<String, Vec<ConnectionId>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register(&self, config: &ConnectionConfig) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(config.outbound_channel_capacity);
        let handle = Arc::new(ConnectionHandle {
            id,
            tx,
            connected_at: Instant::now(),
        });
        self.connections.insert(id, Arc::clone(&handle));
        (handle, rx)
    }

    /// Removes a connection, and its subscription to `owner_id` if any.
    pub fn remove(&self, id: ConnectionId, owner_id: &str) {
        self.connections.remove(&id);
        self.unsubscribe(owner_id, id);
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Adds `conn` to `owner_id`'s subscriber set. O(1) amortized; duplicate
    /// subscribes for the same connection are idempotent.
    pub fn subscribe(&self, owner_id: &str, conn: ConnectionId) {
        let mut subs = self.subscribers.entry(owner_id.to_string()).or_default();
        if !subs.contains(&conn) {
            subs.push(conn);
        }
    }

    pub fn unsubscribe(&self, owner_id: &str, conn: ConnectionId) {
        if let Some(mut subs) = self.subscribers.get_mut(owner_id) {
            subs.retain(|c| *c != conn);
        }
    }

    /// Sends `bytes` to every subscriber of `owner_id` except `origin`.
    /// Non-blocking: a full channel is silently skipped rather than stalling
    /// the broadcast.
    pub fn broadcast_except(&self, owner_id: &str, origin: ConnectionId, bytes: &[u8]) {
        let Some(subs) = self.subscribers.get(owner_id) else {
            return;
        };
        for conn_id in subs.iter().filter(|c| **c != origin) {
            if let Some(handle) = self.connections.get(conn_id) {
                let _ = handle.try_send(OutboundMessage::Binary(bytes.to_vec()));
            }
        }
    }

    /// Removes and returns all connections, for graceful shutdown.
    pub fn drain_all(&self) -> Vec<Arc<ConnectionHandle>> {
        let keys: Vec<ConnectionId> = self.connections.iter().map(|e| *e.key()).collect();
        let mut handles = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, handle)) = self.connections.remove(&key) {
                handles.push(handle);
            }
        }
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ConnectionConfig {
        ConnectionConfig::default()
    }

    #[test]
    fn registry_register_and_count() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = registry.register(&test_config());
        assert_eq!(registry.count(), 1);
        assert_eq!(handle.id, ConnectionId(1));
    }

    #[test]
    fn subscribe_and_broadcast_reaches_other_subscribers_only() {
        let registry = ConnectionRegistry::new();
        let config = ConnectionConfig {
            outbound_channel_capacity: 4,
            ..test_config()
        };
        let (h1, mut rx1) = registry.register(&config);
        let (h2, mut rx2) = registry.register(&config);
        registry.subscribe("owner-a", h1.id);
        registry.subscribe("owner-a", h2.id);

        registry.broadcast_except("owner-a", h1.id, &[1, 2, 3]);

        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn unsubscribe_stops_further_broadcasts() {
        let registry = ConnectionRegistry::new();
        let config = test_config();
        let (h1, _rx1) = registry.register(&config);
        let (h2, mut rx2) = registry.register(&config);
        registry.subscribe("owner-a", h1.id);
        registry.subscribe("owner-a", h2.id);
        registry.unsubscribe("owner-a", h2.id);

        registry.broadcast_except("owner-a", h1.id, &[9]);
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn remove_clears_connection_and_subscription() {
        let registry = ConnectionRegistry::new();
        let config = test_config();
        let (h1, _rx1) = registry.register(&config);
        registry.subscribe("owner-a", h1.id);

        registry.remove(h1.id, "owner-a");
        assert_eq!(registry.count(), 0);

        let (h2, mut rx2) = registry.register(&config);
        registry.subscribe("owner-a", h2.id);
        registry.broadcast_except("owner-a", h2.id, &[1]);
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn connection_handle_try_send_full() {
        let registry = ConnectionRegistry::new();
        let config = ConnectionConfig {
            outbound_channel_capacity: 1,
            ..test_config()
        };
        let (handle, _rx) = registry.register(&config);
        assert!(handle.try_send(OutboundMessage::Binary(vec![1])));
        assert!(!handle.try_send(OutboundMessage::Binary(vec![2])));
    }

    #[tokio::test]
    async fn connection_handle_send_timeout_disconnected() {
        let registry = ConnectionRegistry::new();
        let config = test_config();
        let (handle, rx) = registry.register(&config);
        drop(rx);

        let result = handle
            .send_timeout(OutboundMessage::Binary(vec![1]), Duration::from_millis(50))
            .await;
        assert_eq!(result, Err(SendError::Disconnected));
    }
}
