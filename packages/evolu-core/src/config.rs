//! Replica-wide configuration, constructed programmatically by the embedding
//! application. There is no env/file parsing layer here by design -- `Config`
//! is plain `serde`-(de)serializable so an embedder can load it from
//! TOML/JSON itself if it wants one.

use serde::{Deserialize, Serialize};

use crate::hlc::DEFAULT_MAX_DRIFT_MS;
use crate::owner::Owner;

/// One configured sync peer. `WebSocket` is the only transport kind this
/// crate ships a client for; other variants are recognized on the wire but
/// rejected at `Config` construction time if no matching `Transport` is
/// registered with the facade.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "PascalCase")]
pub enum TransportDescriptor {
    WebSocket { url: String },
}

impl Default for TransportDescriptor {
    fn default() -> Self {
        TransportDescriptor::WebSocket {
            url: "wss://free.evoluhq.com".to_string(),
        }
    }
}

/// Replica-wide configuration. Every optional field has a `Default`, per the
/// "recognized options" table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Replica name, used as the storage/DB filename.
    pub name: String,
    /// Ordered list of transports to sync against; the first is tried first.
    pub transports: Vec<TransportDescriptor>,
    /// HLC drift tolerance, in milliseconds.
    pub max_drift_ms: u64,
    /// Use volatile (in-memory) storage instead of a persistent file.
    pub in_memory: bool,
    /// Inject an existing owner instead of generating a fresh one.
    #[serde(skip)]
    pub initial_owner: Option<Owner>,
    /// User-defined SQL index DDL, applied once at startup by the embedder's
    /// SQL engine (this crate never executes SQL itself).
    pub indexes: Vec<String>,
    /// URL to navigate to after a reset/restore cycle. A UI-layer concern;
    /// carried here only because it is part of the documented config surface.
    pub reload_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "Evolu".to_string(),
            transports: vec![TransportDescriptor::default()],
            max_drift_ms: DEFAULT_MAX_DRIFT_MS,
            in_memory: false,
            initial_owner: None,
            indexes: Vec::new(),
            reload_url: "/".to_string(),
        }
    }
}
