//! Rendezvous relay error types.
//!
//! Protocol-level failures (wrong password, absent join target, and so on)
//! never surface as errors: they are communicated to clients as specific
//! outbound events, or dropped with local diagnostic logging. The error
//! type here covers infrastructure failures only.

use thiserror::Error;

/// Rendezvous relay error type.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error (actor mailbox or response channel failure).
    #[error("Internal error: {0}")]
    Internal(String),
}
