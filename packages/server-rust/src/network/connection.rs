//! Hub connection tracking.
//!
//! Every hub socket gets a bounded outbound channel drained by its write
//! loop and a cancellation token that fires when the socket goes away, so
//! invocations still running for that connection stop with it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::config::ConnectionConfig;

/// Unique identifier for a connection, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Frame queued for a connection's write loop.
#[derive(Debug)]
pub enum OutboundMessage {
    /// A JSON text frame.
    Text(String),
    /// A close frame with an optional reason.
    Close(Option<String>),
}

/// Error returned when sending a message to a connection fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The channel stayed full for the whole timeout.
    Timeout,
    /// The write loop has exited.
    Disconnected,
}

/// Handle to one hub connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    /// Hub the socket is attached to.
    pub hub: String,
    tx: mpsc::Sender<OutboundMessage>,
    /// Parent token of every invocation on this connection.
    pub cancel: CancellationToken,
    pub connected_at: Instant,
}

impl ConnectionHandle {
    /// Enqueue without waiting. `false` if the channel is full or closed.
    #[must_use]
    pub fn try_send(&self, msg: OutboundMessage) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    /// Enqueue, waiting at most `timeout` for room.
    ///
    /// # Errors
    ///
    /// Returns `SendError::Timeout` if the channel remains full for the
    /// entire timeout and `SendError::Disconnected` if the write loop is gone.
    pub async fn send_timeout(
        &self,
        msg: OutboundMessage,
        timeout: Duration,
    ) -> Result<(), SendError> {
        match tokio::time::timeout(timeout, self.tx.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Disconnected),
            Err(_) => Err(SendError::Timeout),
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed() && !self.cancel.is_cancelled()
    }
}

/// Thread-safe registry of all active hub connections.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Connection IDs start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a connection to `hub`, returning its handle and the receiver
    /// its write loop drains.
    pub fn register(
        &self,
        hub: &str,
        config: &ConnectionConfig,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(config.outbound_channel_capacity.max(1));

        let handle = Arc::new(ConnectionHandle {
            id,
            hub: hub.to_string(),
            tx,
            cancel: CancellationToken::new(),
            connected_at: Instant::now(),
        });

        self.connections.insert(id, Arc::clone(&handle));
        (handle, rx)
    }

    /// Remove a connection and cancel whatever it still has in flight.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        let removed = self.connections.remove(&id).map(|(_, handle)| handle);
        if let Some(handle) = &removed {
            handle.cancel.cancel();
        }
        removed
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&id).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn count_by_hub(&self, hub: &str) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().hub == hub)
            .count()
    }

    /// Ask every connection to close. Connections leave the registry as
    /// their sockets finish.
    pub fn close_all(&self, reason: &str) -> usize {
        let mut closed = 0;
        for entry in &self.connections {
            let handle = entry.value();
            // A full channel still gets cancelled below.
            let _ = handle.try_send(OutboundMessage::Close(Some(reason.to_string())));
            handle.cancel.cancel();
            closed += 1;
        }
        closed
    }

    /// Wait until no connections remain, up to `timeout`. Returns whether
    /// the registry emptied in time.
    pub async fn wait_until_empty(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.connections.is_empty() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
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

    fn small_channel_config() -> ConnectionConfig {
        ConnectionConfig {
            outbound_channel_capacity: 2,
            ..ConnectionConfig::default()
        }
    }

    #[test]
    fn ids_start_at_one_and_count_by_hub() {
        let registry = ConnectionRegistry::new();
        let config = ConnectionConfig::default();

        let (h1, _rx1) = registry.register("chat", &config);
        let (h2, _rx2) = registry.register("chat", &config);
        let (_h3, _rx3) = registry.register("orders", &config);

        assert_eq!(h1.id, ConnectionId(1));
        assert_eq!(h2.id, ConnectionId(2));
        assert_eq!(registry.count(), 3);
        assert_eq!(registry.count_by_hub("chat"), 2);
        assert!(registry.get(h1.id).is_some());
        assert!(registry.get(ConnectionId(999)).is_none());
    }

    #[test]
    fn remove_cancels_in_flight_work() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = registry.register("chat", &ConnectionConfig::default());
        let invocation = handle.cancel.child_token();

        assert!(registry.remove(handle.id).is_some());
        assert!(invocation.is_cancelled());
        assert!(!handle.is_connected());
        assert!(registry.remove(handle.id).is_none());
    }

    #[test]
    fn try_send_respects_capacity() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = registry.register("chat", &small_channel_config());

        assert!(handle.try_send(OutboundMessage::Text("1".into())));
        assert!(handle.try_send(OutboundMessage::Text("2".into())));
        assert!(!handle.try_send(OutboundMessage::Text("3".into())));
    }

    #[tokio::test]
    async fn send_timeout_reports_disconnect() {
        let registry = ConnectionRegistry::new();
        let (handle, rx) = registry.register("chat", &ConnectionConfig::default());
        drop(rx);

        let result = handle
            .send_timeout(OutboundMessage::Text("{}".into()), Duration::from_secs(1))
            .await;
        assert_eq!(result, Err(SendError::Disconnected));
    }

    #[tokio::test]
    async fn send_timeout_reports_full_channel() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = registry.register("chat", &small_channel_config());
        assert!(handle.try_send(OutboundMessage::Text("1".into())));
        assert!(handle.try_send(OutboundMessage::Text("2".into())));

        let result = handle
            .send_timeout(OutboundMessage::Text("3".into()), Duration::from_millis(20))
            .await;
        assert_eq!(result, Err(SendError::Timeout));
    }

    #[tokio::test]
    async fn close_all_then_drain() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (handle, mut rx) = registry.register("chat", &ConnectionConfig::default());

        assert_eq!(registry.close_all("server shutting down"), 1);
        assert!(matches!(rx.recv().await, Some(OutboundMessage::Close(Some(_)))));
        assert!(handle.cancel.is_cancelled());
        assert!(!registry.wait_until_empty(Duration::from_millis(20)).await);

        let remover = Arc::clone(&registry);
        let id = handle.id;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            remover.remove(id);
        });
        assert!(registry.wait_until_empty(Duration::from_secs(1)).await);
    }
}
