//! Secret types for protecting sensitive values from accidental logging.
//!
//! This module re-exports types from the [`secrecy`] crate. Use them for all
//! sensitive values, which in this codebase means session join passwords.
//!
//! `SecretString` implements `Debug` with redaction, so any struct that
//! derives `Debug` while holding one gets safe logging behavior for free:
//! a password can never leak through `{:?}` or a tracing field. Access to
//! the actual value requires an explicit `expose_secret()` call, and the
//! backing memory is zeroized on drop.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct JoinAttempt {
//!     target: String,
//!     password: SecretString, // Debug shows "[REDACTED]"
//! }
//!
//! let attempt = JoinAttempt {
//!     target: "room-owner".to_string(),
//!     password: SecretString::from("hunter2"),
//! };
//!
//! // Safe: the password is redacted
//! println!("{attempt:?}");
//!
//! // Explicit access only
//! let password: &str = attempt.password.expose_secret();
//! # assert_eq!(password, "hunter2");
//! ```
//!
//! With the `serde` feature enabled (it is, workspace-wide), `SecretString`
//! deserializes straight out of inbound JSON frames, so a supplied join
//! password is redacted from the moment it is parsed.

// Re-export the main types from secrecy
pub use secrecy::{ExposeSecret, SecretBox, SecretString};
