//! AEAD encryption of message content for the wire.
//!
//! Each `EncryptedMessage` carries a plaintext `Timestamp` (needed by the
//! relay to index and merkle-insert it without decrypting) and an
//! XChaCha20-Poly1305-sealed `MessageContent` (table/row/column/value),
//! readable only by holders of the owner's `encryption_key`. The 24-byte
//! nonce is generated fresh per message and stored alongside the ciphertext
//! rather than derived, since XChaCha20's extended nonce space makes random
//! generation safe for the volumes a single owner produces.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::{Error, Result};

const NONCE_LEN: usize = 24;

/// The decrypted payload of a message: everything except the timestamp,
/// which travels in the clear.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    pub table: String,
    pub row: String,
    pub column: String,
    pub value: crate::value::Value,
}

impl From<&Message> for MessageContent {
    fn from(m: &Message) -> Self {
        Self {
            table: m.table.clone(),
            row: m.row.as_str().to_string(),
            column: m.column.clone(),
            value: m.value.clone(),
        }
    }
}

/// Encrypts a `Message`'s content under `encryption_key`, producing the
/// nonce-prefixed ciphertext stored in `EncryptedMessage::content`.
pub fn encrypt(encryption_key: &[u8; 32], message: &Message) -> Result<Vec<u8>> {
    let content = MessageContent::from(message);
    let plaintext =
        rmp_serde::to_vec_named(&content).map_err(|e| Error::Unexpected(anyhow::anyhow!(e)))?;

    let cipher = XChaCha20Poly1305::new(encryption_key.into());
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_ref())
        .map_err(|_| Error::Decrypt)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts a nonce-prefixed ciphertext produced by [`encrypt`] and
/// reassembles the full `Message` by pairing it with the cleartext
/// timestamp the relay already had.
pub fn decrypt(
    encryption_key: &[u8; 32],
    timestamp: crate::hlc::Timestamp,
    sealed: &[u8],
) -> Result<Message> {
    if sealed.len() < NONCE_LEN {
        return Err(Error::Decrypt);
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let nonce = XNonce::from_slice(nonce_bytes);
    let cipher = XChaCha20Poly1305::new(encryption_key.into());
    let plaintext = cipher.decrypt(nonce, ciphertext).map_err(|_| Error::Decrypt)?;
    let content: MessageContent =
        rmp_serde::from_slice(&plaintext).map_err(|_| Error::Decrypt)?;
    Ok(Message {
        timestamp,
        table: content.table,
        row: crate::id::Id::try_from_string(content.row)?,
        column: content.column,
        value: content.value,
    })
}
