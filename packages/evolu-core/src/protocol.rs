//! Wire types exchanged with the relay.
//!
//! Encoded with MessagePack (`rmp-serde`) rather than JSON: messages are
//! mostly binary (encrypted content, raw timestamps) and the relay fans
//! these out to every subscriber of an owner, so encoding cost is paid on
//! the hot path. Field names are `camelCase` to match the relay's and any
//! JS client's expectations.

use serde::{Deserialize, Serialize};

use crate::hlc::Timestamp;

/// A message as it travels the wire: cleartext timestamp (the relay indexes
/// and merkle-inserts by it without ever decrypting), opaque sealed content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedMessage {
    pub timestamp: Timestamp,
    #[serde(with = "serde_bytes")]
    pub content: Vec<u8>,
}

/// Sent from client to relay: "here is my owner id, merkle tree and write
/// key, and here are any messages of mine you might be missing; tell me
/// what I'm missing of yours."
///
/// `user_id` is the owner id the request is for -- the relay's mailbox key.
/// The WebSocket/HTTP transports additionally carry it in the URL path
/// segment for routing without decoding the body, but the wire record
/// itself still carries it per the documented format, so a relay
/// implementation that multiplexes owners over a single connection (rather
/// than one socket per owner, the shape this crate's transports use) has
/// enough information to route from the body alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub user_id: String,
    pub node_id: String,
    pub write_key: Option<String>,
    pub merkle_tree_json: String,
    pub messages: Vec<EncryptedMessage>,
}

/// Sent from relay to client: the relay's own merkle tree (for further
/// divergence narrowing) plus any messages the request's range was missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub merkle_tree_json: String,
    pub messages: Vec<EncryptedMessage>,
}

/// Encodes a value to the length-prefix-free MessagePack wire format used
/// for both WebSocket frames and test fixtures.
pub fn encode<T: Serialize>(value: &T) -> crate::Result<Vec<u8>> {
    rmp_serde::to_vec_named(value).map_err(|e| crate::Error::Unexpected(anyhow::anyhow!(e)))
}

/// Decodes a value previously produced by [`encode`].
pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> crate::Result<T> {
    rmp_serde::from_slice(bytes).map_err(|e| crate::Error::Unexpected(anyhow::anyhow!(e)))
}
