//! Error taxonomy for the relay. Mirrors the status codes the wire protocol
//! exposes over both transports: WS close code or HTTP status.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("owner not allowed")]
    Unauthorized,

    #[error("message quota exceeded for owner")]
    QuotaExceeded,

    #[error("malformed sync request: {0}")]
    Protocol(String),

    #[error(transparent)]
    Core(#[from] evolu_core::Error),
}

impl RelayError {
    /// The HTTP status this error maps to, per the documented 200/401/402/400
    /// contract.
    #[must_use]
    pub fn status_code(&self) -> http::StatusCode {
        match self {
            RelayError::Unauthorized => http::StatusCode::UNAUTHORIZED,
            RelayError::QuotaExceeded => http::StatusCode::PAYMENT_REQUIRED,
            RelayError::Protocol(_) | RelayError::Core(_) => http::StatusCode::BAD_REQUEST,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
