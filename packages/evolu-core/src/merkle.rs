//! `MerkleTree`: a ternary, minute-bucketed prefix trie over HLC timestamps.
//!
//! Keys are the base-3 digits of `floor(millis / 60000)`, up to 16 trits
//! deep. Every node's hash is the XOR of its children's hashes, with leaves
//! additionally XORing in the hash of each timestamp that falls under them.
//! XOR is commutative and its own inverse, so insertion order never affects
//! the resulting tree -- two replicas that have seen the same set of
//! timestamps always agree on the root hash regardless of delivery order.

use serde_json::{Map, Value};

use crate::hash::fnv1a_hash;
use crate::hlc::Timestamp;
use crate::{Error, Result};

const DEPTH: usize = 16;

fn timestamp_hash(ts: &Timestamp) -> u32 {
    fnv1a_hash(&ts.to_binary())
}

fn minute_digits(millis: u64) -> [u8; DEPTH] {
    let mut minute = millis / 60_000;
    let mut digits = [0u8; DEPTH];
    for i in (0..DEPTH).rev() {
        digits[i] = (minute % 3) as u8;
        minute /= 3;
    }
    digits
}

/// Parses up to `DEPTH` base-3 digits (left-padded conceptually, but here the
/// prefix is padded on the right with zero digits to reach `DEPTH`) back into
/// a minute count, then converts to millis.
fn key_to_millis(prefix: &[u8]) -> u64 {
    let mut minute: u64 = 0;
    for i in 0..DEPTH {
        let digit = prefix.get(i).copied().unwrap_or(0) as u64;
        minute = minute * 3 + digit;
    }
    minute * 60_000
}

#[derive(Debug, Clone, Default)]
struct MerkleNode {
    hash: u32,
    children: [Option<Box<MerkleNode>>; 3],
}

impl MerkleNode {
    fn child_hash(&self, i: usize) -> Option<u32> {
        self.children[i].as_deref().map(|n| n.hash)
    }
}

/// A ternary prefix trie whose root hash summarizes every timestamp inserted
/// into it.
#[derive(Debug, Clone, Default)]
pub struct MerkleTree {
    root: MerkleNode,
}

impl MerkleTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn root_hash(&self) -> u32 {
        self.root.hash
    }

    /// Inserts a timestamp, XORing its hash into every node on the path from
    /// root to the timestamp's minute-bucket leaf.
    pub fn insert(&mut self, ts: &Timestamp) {
        let digits = minute_digits(ts.millis);
        let h = timestamp_hash(ts);
        let mut node = &mut self.root;
        node.hash ^= h;
        for &d in &digits {
            let slot = &mut node.children[d as usize];
            let child = slot.get_or_insert_with(|| Box::new(MerkleNode::default()));
            child.hash ^= h;
            node = child;
        }
    }

    /// Locates the earliest point of divergence between two trees.
    ///
    /// Returns `None` if the trees are identical. Otherwise descends from the
    /// root, at each level picking the first child index ('0', '1', or '2')
    /// whose hash differs between the two trees (a missing child counts as
    /// differing from a present one). Descent stops -- returning the millis
    /// boundary of the current prefix -- once no child differs (meaning the
    /// remaining divergence is a pure addition below this prefix) or once
    /// `DEPTH` levels have been consumed.
    #[must_use]
    pub fn diff(a: &MerkleTree, b: &MerkleTree) -> Option<u64> {
        if a.root.hash == b.root.hash {
            return None;
        }
        let mut prefix = Vec::with_capacity(DEPTH);
        let mut a_node = &a.root;
        let mut b_node = &b.root;
        loop {
            let mut differing = None;
            for k in 0..3 {
                if a_node.child_hash(k) != b_node.child_hash(k) {
                    differing = Some(k);
                    break;
                }
            }
            let Some(k) = differing else {
                return Some(key_to_millis(&prefix));
            };
            prefix.push(k as u8);
            if prefix.len() == DEPTH {
                return Some(key_to_millis(&prefix));
            }
            match (a_node.children[k].as_deref(), b_node.children[k].as_deref()) {
                (Some(an), Some(bn)) => {
                    a_node = an;
                    b_node = bn;
                }
                // One side has no node at this prefix at all: there is
                // nothing further to descend into, the divergence starts
                // exactly here.
                _ => return Some(key_to_millis(&prefix)),
            }
        }
    }

    /// Serializes to the sparse JSON representation used on the wire
    /// (`{"hash": N, "0": {...}, "1": {...}, "2": {...}}`, omitting absent
    /// children), kept for relay wire compatibility even though the
    /// in-memory representation above is a denser arena-free tree.
    #[must_use]
    pub fn to_json_string(&self) -> String {
        node_to_json(&self.root).to_string()
    }

    pub fn from_json_string(s: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(s).map_err(|e| Error::Unexpected(anyhow::anyhow!(e)))?;
        Ok(Self {
            root: node_from_json(&value)?,
        })
    }
}

fn node_to_json(node: &MerkleNode) -> Value {
    let mut map = Map::new();
    map.insert("hash".to_string(), Value::from(node.hash));
    for (i, child) in node.children.iter().enumerate() {
        if let Some(child) = child {
            map.insert(i.to_string(), node_to_json(child));
        }
    }
    Value::Object(map)
}

fn node_from_json(value: &Value) -> Result<MerkleNode> {
    let obj = value
        .as_object()
        .ok_or_else(|| Error::Unexpected(anyhow::anyhow!("merkle node must be a JSON object")))?;
    let hash = obj
        .get("hash")
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::Unexpected(anyhow::anyhow!("merkle node missing hash")))? as u32;
    let mut children: [Option<Box<MerkleNode>>; 3] = [None, None, None];
    for (i, slot) in children.iter_mut().enumerate() {
        if let Some(child_value) = obj.get(&i.to_string()) {
            *slot = Some(Box::new(node_from_json(child_value)?));
        }
    }
    Ok(MerkleNode { hash, children })
}
