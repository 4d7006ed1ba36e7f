//! Error taxonomy shared across the Evolu core crate.
//!
//! Mirrors the component boundaries of the sync engine: clock errors abort the
//! enclosing transaction, storage errors propagate as-is, decrypt/network
//! errors are surfaced but never block local mutations (callers decide how to
//! degrade).

use thiserror::Error;

/// Crate-wide error type. Library code returns this; `anyhow` is reserved for
/// the facade and binary entry points.
#[derive(Debug, Error)]
pub enum Error {
    #[error("clock drift detected: now={now}ms next={next}ms exceeds max_drift")]
    TimestampDrift { now: u64, next: u64 },

    #[error("HLC counter overflow at millis={millis}")]
    TimestampCounterOverflow { millis: u64 },

    #[error("timestamp millis {0} out of representable range")]
    TimestampTimeOutOfRange(u64),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("decrypt failed")]
    Decrypt,

    #[error("network error: {0}")]
    Network(String),

    #[error("server error: status={0}")]
    Server(u16),

    #[error("payment required")]
    PaymentRequired,

    #[error("sync did not converge after {0} rounds")]
    NotSynced(u32),

    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
