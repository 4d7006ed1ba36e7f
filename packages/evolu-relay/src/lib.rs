//! Evolu relay -- an axum/tokio server that stores and forwards encrypted
//! sync messages on behalf of owners, without ever decrypting them.
//!
//! The relay keeps one mailbox per owner (merkle tree + message log), gates
//! writes with a first-write-wins write key, and answers sync requests over
//! both a long-lived WebSocket and a one-shot HTTP endpoint.

pub mod error;
pub mod network;
pub mod relay_state;

pub use error::{RelayError, Result};
pub use network::{AppState, NetworkConfig, NetworkModule};
pub use relay_state::RelayState;
