//! WebSocket `Transport` implementation: one `sync` round-trip per call,
//! reconnecting with exponential backoff+jitter when the connection has
//! dropped. The relay URL encodes the owner id in its path segment; this
//! type holds exactly one live connection, matching the "exactly one owning
//! sync loop per (replica, owner)" contract -- callers construct one
//! `WebSocketTransport` per `Owner`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::protocol::{self, SyncRequest, SyncResponse};
use crate::sync_engine::Transport;
use crate::{Error, Result};

const INITIAL_BACKOFF_MS: u64 = 250;
const MAX_BACKOFF_MS: u64 = 30_000;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Reconnect/backoff state shared across calls. `parking_lot`/plain mutexes
/// are reserved for non-async-held critical sections elsewhere in this
/// crate (clock, merkle tree); the connection itself is held across
/// `.await` points, so this uses `tokio::sync::Mutex` per the same split the
/// rest of the crate follows.
pub struct WebSocketTransport {
    url: String,
    conn: Mutex<Option<WsStream>>,
    backoff_ms: AtomicU64,
}

impl WebSocketTransport {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            conn: Mutex::new(None),
            backoff_ms: AtomicU64::new(INITIAL_BACKOFF_MS),
        }
    }

    fn record_failure_and_backoff(&self) -> Duration {
        let current = self.backoff_ms.load(Ordering::Relaxed);
        let next = (current * 2).min(MAX_BACKOFF_MS);
        self.backoff_ms.store(next, Ordering::Relaxed);
        // Full jitter: a point uniformly in [0, current), per the standard
        // "decorrelated/full jitter" backoff shape -- avoids every
        // disconnected client reconnecting in lockstep.
        let jitter = rand::random::<u64>() % current.max(1);
        Duration::from_millis(jitter)
    }

    fn reset_backoff(&self) {
        self.backoff_ms.store(INITIAL_BACKOFF_MS, Ordering::Relaxed);
    }

    async fn ensure_connected<'a>(
        &self,
        guard: &mut tokio::sync::MutexGuard<'a, Option<WsStream>>,
    ) -> Result<()> {
        if guard.is_some() {
            return Ok(());
        }
        match connect_async(&self.url).await {
            Ok((stream, _response)) => {
                **guard = Some(stream);
                self.reset_backoff();
                tracing::info!(url = %self.url, "relay connection established");
                Ok(())
            }
            Err(err) => {
                let wait = self.record_failure_and_backoff();
                tracing::warn!(url = %self.url, error = %err, backoff_ms = wait.as_millis() as u64, "relay connection failed");
                tokio::time::sleep(wait).await;
                Err(Error::Network(err.to_string()))
            }
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn sync(&self, request: SyncRequest) -> Result<SyncResponse> {
        let mut guard = self.conn.lock().await;
        self.ensure_connected(&mut guard).await?;

        let stream = guard.as_mut().expect("just connected");
        let body = protocol::encode(&request)?;

        if let Err(err) = stream.send(WsMessage::Binary(body.into())).await {
            *guard = None;
            return Err(Error::Network(err.to_string()));
        }

        loop {
            match stream.next().await {
                Some(Ok(WsMessage::Binary(bytes))) => {
                    return protocol::decode(&bytes);
                }
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
                Some(Ok(WsMessage::Close(frame))) => {
                    *guard = None;
                    let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                    return Err(Error::Network(format!("relay closed connection: {reason}")));
                }
                Some(Ok(WsMessage::Text(_))) => {
                    // The relay never sends text frames; tolerate but skip.
                    continue;
                }
                Some(Ok(WsMessage::Frame(_))) => continue,
                Some(Err(err)) => {
                    *guard = None;
                    return Err(Error::Network(err.to_string()));
                }
                None => {
                    *guard = None;
                    return Err(Error::Network("relay connection closed".to_string()));
                }
            }
        }
    }
}
