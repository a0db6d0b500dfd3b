//! Common data types for the rendezvous relay.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a transport connection.
///
/// Allocated by the transport layer, one per accepted connection. The relay
/// uses it to tell connections apart even when two connections claim the
/// same identity (e.g. a reconnect racing departure cleanup).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Opaque, caller-defined structured metadata attached to a session.
///
/// Clients send arbitrary JSON here; the relay never inspects it, only
/// replaces it wholesale and forwards it. Defaults to an empty object.
pub type ExtraData = serde_json::Value;

/// An empty `ExtraData` value (the default for a fresh session).
#[must_use]
pub fn empty_extra() -> ExtraData {
    serde_json::Value::Object(serde_json::Map::new())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId(42).to_string(), "conn-42");
    }

    #[test]
    fn test_empty_extra_is_object() {
        let extra = empty_extra();
        assert!(extra.is_object());
        assert_eq!(extra, serde_json::json!({}));
    }

    #[test]
    fn test_connection_id_round_trips_through_serde() {
        let id = ConnectionId(7);
        let json = serde_json::to_string(&id).unwrap();
        let back: ConnectionId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
