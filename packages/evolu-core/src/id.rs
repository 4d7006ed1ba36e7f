//! Branded identifier types.
//!
//! `Id`, `OwnerId` and `NodeId` are newtype wrappers that validate their
//! representation at construction, the same "branded scalar" pattern the
//! rest of the data model uses for `TimestampString`.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

const ID_ALPHABET: &[char] = &[
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S',
    'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l',
    'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4',
    '5', '6', '7', '8', '9', '_', '-',
];

const ID_LEN: usize = 21;

/// A 21-character URL-safe row/owner identifier, generated via NanoID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id(String);

impl Id {
    /// Generates a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(nanoid::nanoid!(ID_LEN, ID_ALPHABET))
    }

    /// Deterministically derives an id from a 32-byte seed, used for
    /// `OwnerId` derivation from a mnemonic-derived seed.
    #[must_use]
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let mut out = String::with_capacity(ID_LEN);
        // Simple seeded stream: repeatedly re-hash the seed with a counter to
        // draw enough bytes to index the alphabet without bias, matching the
        // spirit of a PRNG-backed nanoid generator but deterministic.
        let mut counter: u32 = 0;
        let mut pool: Vec<u8> = Vec::new();
        while out.len() < ID_LEN {
            if pool.is_empty() {
                let mut buf = seed.to_vec();
                buf.extend_from_slice(&counter.to_be_bytes());
                pool = crate::owner::sha512_all(&buf).to_vec();
                counter += 1;
            }
            let byte = pool.remove(0);
            // Rejection sampling: alphabet has 64 symbols, so any byte works
            // via modulo without meaningful bias (64 divides 256 evenly).
            out.push(ID_ALPHABET[(byte as usize) % ID_ALPHABET.len()]);
        }
        Self(out)
    }

    /// Validates and wraps an externally supplied id (e.g. read back from
    /// storage or the wire).
    pub fn try_from_string(s: String) -> Result<Self, crate::Error> {
        if s.chars().count() == ID_LEN && s.chars().all(|c| ID_ALPHABET.contains(&c)) {
            Ok(Self(s))
        } else {
            Err(crate::Error::Unexpected(anyhow::anyhow!(
                "invalid id: {s}"
            )))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An `Id` known to identify an `Owner`, derived deterministically from the
/// owner's mnemonic rather than randomly generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerId(Id);

impl OwnerId {
    #[must_use]
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self(Id::from_seed(seed))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 64 bits of device-local randomness, 16 hex characters when displayed.
/// Generated once per device and persisted; collisions between devices are
/// tolerated (~1 in 37M at 1M devices) and self-heal via message overwrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 8]);

impl NodeId {
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; 8];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[must_use]
    pub fn to_hex(self) -> String {
        hex_encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, crate::Error> {
        if s.len() != 16 {
            return Err(crate::Error::Unexpected(anyhow::anyhow!(
                "node id must be 16 hex chars, got {}",
                s.len()
            )));
        }
        let mut bytes = [0u8; 8];
        for i in 0..8 {
            bytes[i] = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|e| crate::Error::Unexpected(anyhow::anyhow!(e)))?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}
