//! # Relay Test Utilities
//!
//! Shared test utilities for the Rendezvous Relay.
//!
//! This crate provides in-process test clients and envelope fixtures for
//! exercising the relay dispatcher without a real WebSocket connection.
//!
//! ## Modules
//!
//! - `mock_client` - In-process client with outbound event assertions
//! - `fixtures` - Envelope builders for the routing operations
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relay_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let relay = test_relay("relay-1");
//!     let mut alice = TestClient::register(&relay, 1, "alice").await;
//!     let mut bob = TestClient::register(&relay, 2, "bob").await;
//!
//!     alice
//!         .send(&relay, EnvelopeBuilder::new("alice", "bob").join().build())
//!         .await;
//!
//!     alice.expect_peer_connected("bob").await;
//!     bob.expect_peer_connected("alice").await;
//! }
//! ```

pub mod fixtures;
pub mod mock_client;

pub use fixtures::*;
pub use mock_client::*;
