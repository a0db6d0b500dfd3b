//! Actor implementations for the rendezvous relay.
//!
//! A single dispatcher actor owns all mutable state; transports and retry
//! timers talk to it through [`RelayActorHandle`].

pub mod messages;
pub mod metrics;
pub mod relay;
pub mod retry;
pub mod session;

pub use messages::{
    Envelope, ForwardedMessage, MessageKind, OutboundEvent, PublicModerator, RelayCommand,
    RelayStatus, RouteAck, SYSTEM_RECIPIENT,
};
pub use metrics::{MetricsSnapshot, RelayMetrics};
pub use relay::{RelayActorHandle, RelaySettings};
pub use session::{ClientHandle, Session};
