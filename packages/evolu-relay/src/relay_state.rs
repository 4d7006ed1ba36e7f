//! Per-owner mailbox: the relay's half of the sync protocol.
//!
//! The relay never decrypts -- it only ever sees [`EncryptedMessage`]s keyed
//! by their cleartext timestamp, and diffs its own `MerkleTree` against
//! whatever tree the client sends. Authorization and quota are policy hooks
//! (`is_owner_allowed`, `quota_exceeded`) rather than anything baked into the
//! mailbox itself, matching the "policy hooks" design note.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use evolu_core::{EncryptedMessage, MerkleTree, NodeId, SyncResponse, Timestamp};
use subtle::ConstantTimeEq;

use crate::error::{RelayError, Result};
use crate::network::NetworkConfig;

/// Compares two write keys without leaking timing information about where
/// (or whether) they first differ.
fn write_keys_match(stored: &str, supplied: &str) -> bool {
    stored.as_bytes().ct_eq(supplied.as_bytes()).into()
}

/// One owner's server-side mailbox: accumulated messages plus the merkle
/// tree kept symmetric to every client's.
#[derive(Default)]
struct OwnerState {
    tree: MerkleTree,
    messages: BTreeMap<[u8; 16], EncryptedMessage>,
    /// The write key first seen for this owner, used to gate further writes.
    /// `None` until the first message arrives for a fresh owner.
    write_key: Option<String>,
}

/// Shared, `DashMap`-backed relay state: one independent lock per owner
/// rather than a single global lock, so unrelated owners never contend.
pub struct RelayState {
    owners: DashMap<String, OwnerState>,
    config: Arc<NetworkConfig>,
}

impl RelayState {
    #[must_use]
    pub fn new(config: Arc<NetworkConfig>) -> Self {
        Self {
            owners: DashMap::new(),
            config,
        }
    }

    /// Authorization policy hook. Every owner id is currently accepted; a
    /// deployment that wants an allowlist or a paid-tier check replaces this.
    #[must_use]
    pub fn is_owner_allowed(&self, _owner_id: &str) -> bool {
        true
    }

    /// Quota policy hook: rejects once an owner's stored message count
    /// reaches the configured threshold. `None` threshold means unlimited.
    #[must_use]
    pub fn quota_exceeded(&self, owner_id: &str) -> bool {
        let Some(limit) = self.config.quota_messages_per_owner else {
            return false;
        };
        self.owners
            .get(owner_id)
            .is_some_and(|o| o.messages.len() >= limit)
    }

    /// Applies `incoming` to the owner's mailbox (deduplicated by
    /// timestamp), diffs the resulting tree against `client_tree_json`, and
    /// returns the response to hand back to the submitting client plus the
    /// newly accepted messages to broadcast to every other subscriber.
    pub fn apply_and_diff(
        &self,
        owner_id: &str,
        write_key: Option<&str>,
        incoming: &[EncryptedMessage],
        client_tree_json: &str,
    ) -> Result<(SyncResponse, Vec<EncryptedMessage>)> {
        if !incoming.is_empty() && self.quota_exceeded(owner_id) {
            return Err(RelayError::QuotaExceeded);
        }

        let mut entry = self
            .owners
            .entry(owner_id.to_string())
            .or_insert_with(OwnerState::default);

        if !incoming.is_empty() {
            match (&entry.write_key, write_key) {
                (Some(stored), Some(supplied)) if !write_keys_match(stored, supplied) => {
                    return Err(RelayError::Unauthorized);
                }
                (None, Some(supplied)) => entry.write_key = Some(supplied.to_string()),
                (Some(_), None) => return Err(RelayError::Unauthorized),
                _ => {}
            }
        }

        let mut newly_accepted = Vec::new();
        for message in incoming {
            let key = message.timestamp.to_binary();
            if let std::collections::btree_map::Entry::Vacant(v) = entry.messages.entry(key) {
                v.insert(message.clone());
                entry.tree.insert(&message.timestamp);
                newly_accepted.push(message.clone());
            }
        }

        let client_tree = MerkleTree::from_json_string(client_tree_json)?;
        let messages = match MerkleTree::diff(&entry.tree, &client_tree) {
            Some(since_millis) => {
                let lower_bound = Timestamp {
                    millis: since_millis,
                    counter: 0,
                    node_id: NodeId([0; 8]),
                }
                .to_binary();
                entry
                    .messages
                    .range(lower_bound..)
                    .take(self.config.default_batch_limit)
                    .map(|(_, m)| m.clone())
                    .collect()
            }
            None => Vec::new(),
        };

        Ok((
            SyncResponse {
                merkle_tree_json: entry.tree.to_json_string(),
                messages,
            },
            newly_accepted,
        ))
    }

    #[must_use]
    pub fn owner_message_count(&self, owner_id: &str) -> usize {
        self.owners.get(owner_id).map_or(0, |o| o.messages.len())
    }

    #[must_use]
    pub fn owner_count(&self) -> usize {
        self.owners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evolu_core::crypto;

    fn msg(millis: u64, node: u8) -> EncryptedMessage {
        let ts = Timestamp {
            millis,
            counter: 0,
            node_id: NodeId([node; 8]),
        };
        EncryptedMessage {
            timestamp: ts,
            content: vec![1, 2, 3],
        }
    }

    fn state() -> RelayState {
        RelayState::new(Arc::new(NetworkConfig::default()))
    }

    #[test]
    fn first_message_establishes_write_key() {
        let relay = state();
        let (resp, accepted) = relay
            .apply_and_diff("owner-a", Some("key1"), &[msg(100, 1)], "{\"hash\":0}")
            .unwrap();
        assert_eq!(accepted.len(), 1);
        assert!(!resp.merkle_tree_json.is_empty());
    }

    #[test]
    fn mismatched_write_key_is_rejected() {
        let relay = state();
        relay
            .apply_and_diff("owner-a", Some("key1"), &[msg(100, 1)], "{\"hash\":0}")
            .unwrap();
        let err = relay
            .apply_and_diff("owner-a", Some("key2"), &[msg(200, 1)], "{\"hash\":0}")
            .unwrap_err();
        assert!(matches!(err, RelayError::Unauthorized));
    }

    #[test]
    fn duplicate_message_is_not_rebroadcast() {
        let relay = state();
        let m = msg(100, 1);
        relay
            .apply_and_diff("owner-a", Some("key1"), &[m.clone()], "{\"hash\":0}")
            .unwrap();
        let (_resp, accepted) = relay
            .apply_and_diff("owner-a", Some("key1"), &[m], "{\"hash\":0}")
            .unwrap();
        assert!(accepted.is_empty());
    }

    #[test]
    fn diverging_client_tree_yields_missing_messages() {
        let relay = state();
        relay
            .apply_and_diff("owner-a", Some("key1"), &[msg(100, 1), msg(200, 2)], "{\"hash\":0}")
            .unwrap();

        // An empty-tree client, i.e. has nothing, should be told about both messages.
        let (resp, _) = relay
            .apply_and_diff("owner-a", None, &[], "{\"hash\":0}")
            .unwrap();
        assert_eq!(resp.messages.len(), 2);
    }

    #[test]
    fn converged_tree_yields_no_messages() {
        let relay = state();
        let (first, _) = relay
            .apply_and_diff("owner-a", Some("key1"), &[msg(100, 1)], "{\"hash\":0}")
            .unwrap();
        let (second, _) = relay
            .apply_and_diff("owner-a", Some("key1"), &[], &first.merkle_tree_json)
            .unwrap();
        assert!(second.messages.is_empty());
    }

    #[test]
    fn quota_exceeded_rejects_further_writes() {
        let config = Arc::new(NetworkConfig {
            quota_messages_per_owner: Some(1),
            ..NetworkConfig::default()
        });
        let relay = RelayState::new(config);
        relay
            .apply_and_diff("owner-a", Some("key1"), &[msg(100, 1)], "{\"hash\":0}")
            .unwrap();
        let err = relay
            .apply_and_diff("owner-a", Some("key1"), &[msg(200, 1)], "{\"hash\":0}")
            .unwrap_err();
        assert!(matches!(err, RelayError::QuotaExceeded));
    }

    #[test]
    fn relay_never_needs_to_decrypt_to_apply() {
        // Sanity: the content the relay stores is whatever bytes arrived,
        // crypto is irrelevant to mailbox bookkeeping.
        let key = [7u8; 32];
        let plaintext = evolu_core::Message {
            timestamp: Timestamp {
                millis: 1,
                counter: 0,
                node_id: NodeId([1; 8]),
            },
            table: "todos".to_string(),
            row: evolu_core::Id::new(),
            column: "title".to_string(),
            value: evolu_core::Value::Text("hi".to_string()),
        };
        let sealed = crypto::encrypt(&key, &plaintext).unwrap();
        let em = EncryptedMessage {
            timestamp: plaintext.timestamp,
            content: sealed,
        };
        let relay = state();
        let (_resp, accepted) = relay
            .apply_and_diff("owner-a", Some("key1"), &[em], "{\"hash\":0}")
            .unwrap();
        assert_eq!(accepted.len(), 1);
    }
}
