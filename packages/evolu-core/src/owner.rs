//! Owner identity: mnemonic-derived encryption key, write key, and id.
//!
//! Key derivation follows SLIP-21 (hierarchical deterministic derivation over
//! HMAC-SHA512, symmetric-key variant rather than BIP-32's EC-keyed one),
//! rooted at the BIP-39 seed produced from the owner's mnemonic. Generating
//! and validating mnemonics themselves is out of scope here -- the `bip39`
//! crate is used strictly to turn an existing mnemonic into a seed.

use bip39::Mnemonic;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha512};

use crate::id::{NodeId, OwnerId};

type HmacSha512 = Hmac<Sha512>;

const SLIP21_SEED_KEY: &[u8] = b"Symmetric key seed";

pub(crate) fn sha512_all(data: &[u8]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(data);
    let out = hasher.finalize();
    let mut buf = [0u8; 64];
    buf.copy_from_slice(&out);
    buf
}

struct Slip21Node {
    chain_code: [u8; 32],
    key: [u8; 32],
}

fn slip21_master(seed: &[u8]) -> Slip21Node {
    let mut mac = HmacSha512::new_from_slice(SLIP21_SEED_KEY).expect("hmac accepts any key size");
    mac.update(seed);
    split_node(&mac.finalize().into_bytes())
}

fn slip21_child(parent: &Slip21Node, label: &str) -> Slip21Node {
    let mut mac =
        HmacSha512::new_from_slice(&parent.chain_code).expect("hmac accepts any key size");
    mac.update(&[0u8]);
    mac.update(label.as_bytes());
    split_node(&mac.finalize().into_bytes())
}

fn split_node(bytes: &[u8]) -> Slip21Node {
    let mut chain_code = [0u8; 32];
    let mut key = [0u8; 32];
    chain_code.copy_from_slice(&bytes[0..32]);
    key.copy_from_slice(&bytes[32..64]);
    Slip21Node { chain_code, key }
}

/// Derives the 32-byte SLIP-21 key at the given path, e.g. `["evolu", "owner"]`.
fn derive_key(seed: &[u8], path: &[&str]) -> [u8; 32] {
    let mut node = slip21_master(seed);
    for label in path {
        node = slip21_child(&node, label);
    }
    node.key
}

/// A user identity, shared across that user's own devices. One `Owner` per
/// local replica; resetting deletes local data, restoring recreates the
/// `Owner` from its mnemonic.
#[derive(Clone)]
pub struct Owner {
    pub id: OwnerId,
    pub mnemonic: Mnemonic,
    /// 32-byte XChaCha20-Poly1305 key, derived at SLIP-21 path `["evolu","owner"]`.
    pub encryption_key: [u8; 32],
    /// 16-byte key used to authorize pushes to the relay for this owner.
    pub write_key: [u8; 16],
}

impl Owner {
    /// Generates a fresh 12-word mnemonic and derives a new owner from it.
    #[must_use]
    pub fn create() -> Self {
        let mut entropy = [0u8; 16]; // 128 bits -> 12 words
        rand::rng().fill_bytes(&mut entropy);
        let mnemonic = Mnemonic::from_entropy(&entropy).expect("16 bytes is valid BIP-39 entropy");
        Self::from_mnemonic(mnemonic)
    }

    /// Restores an owner deterministically from an existing mnemonic phrase.
    pub fn restore(phrase: &str) -> crate::Result<Self> {
        let mnemonic: Mnemonic = phrase
            .parse()
            .map_err(|e| crate::Error::Unexpected(anyhow::anyhow!("invalid mnemonic: {e}")))?;
        Ok(Self::from_mnemonic(mnemonic))
    }

    fn from_mnemonic(mnemonic: Mnemonic) -> Self {
        let seed = mnemonic.to_seed("");
        let encryption_key = derive_key(&seed, &["evolu", "owner"]);
        let write_key_full = derive_key(&seed, &["evolu", "owner", "writeKey"]);
        let mut write_key = [0u8; 16];
        write_key.copy_from_slice(&write_key_full[0..16]);
        let id = OwnerId::from_seed(&encryption_key);
        Self {
            id,
            mnemonic,
            encryption_key,
            write_key,
        }
    }

    #[must_use]
    pub fn mnemonic_phrase(&self) -> String {
        self.mnemonic.to_string()
    }
}

/// Generates a device-local `NodeId`, distinct from any `Owner`.
#[must_use]
pub fn create_node_id() -> NodeId {
    NodeId::random()
}
