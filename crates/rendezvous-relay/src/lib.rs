//! Rendezvous Relay Service Library
//!
//! This library provides the core functionality for the rendezvous relay -
//! a stateful WebSocket signaling server for peer-to-peer session
//! negotiation. It never carries media; it routes only the small negotiation
//! messages (offers, candidates, control messages) that let two remote
//! endpoints discover each other and agree how to connect directly:
//!
//! - In-memory session registry and lazily-built connection graph
//! - Addressed message routing with lazy rendezvous (edges form on first
//!   successful exchange, not up front)
//! - Password-gated join requests with per-connection attempt limiting
//! - Bounded retry loop for joining an endpoint that has not yet appeared
//! - Deferred moderation handoff, delivered when the sender departs
//! - Presence queries, identity rename and departure cleanup
//!
//! # Architecture
//!
//! All registry state is owned by a single dispatcher actor:
//!
//! ```text
//! RelayActor (singleton per relay instance)
//! ├── owns the session registry and connection graph
//! ├── processes inbound commands one at a time, in arrival order
//! └── spawns one timer task per pending join retry
//!     └── each tick re-enters the dispatcher; cancellable on success
//! ```
//!
//! Transport connections hold a cloneable [`actors::RelayActorHandle`];
//! every mutation flows through the actor's mailbox, so each command's state
//! transition is atomic relative to all others regardless of how many
//! connection tasks feed it.
//!
//! # Modules
//!
//! - [`actors`] - The relay dispatcher actor, session state and join retry
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types (infrastructure failures only; protocol
//!   failures are outbound events, never errors)
//! - [`transport`] - WebSocket adapter and JSON wire frames
//! - [`observability`] - Health and status endpoints

pub mod actors;
pub mod config;
pub mod errors;
pub mod observability;
pub mod transport;
