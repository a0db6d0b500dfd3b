//! Envelope builders for relay routing tests.
//!
//! Builds the addressed envelopes clients send, including the payload
//! flags that select join requests, moderation handoffs and presence
//! probes. Flags are overlaid onto the payload at `build()` time, so they
//! survive a later `payload()` call in either order.

use rendezvous_relay::actors::{Envelope, SYSTEM_RECIPIENT};
use serde_json::{json, Value};
use uuid::Uuid;

/// The message-event name test connections register with.
pub const TEST_MESSAGE_EVENT: &str = "relay-message";

/// Builder for test envelopes.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    sender: String,
    remote_user_id: String,
    payload: Value,
    flags: Vec<&'static str>,
    presence_target: Option<String>,
    password: Option<String>,
    extra: Value,
}

impl EnvelopeBuilder {
    /// Create a plain envelope from `sender` to `remote`.
    #[must_use]
    pub fn new(sender: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            remote_user_id: remote.into(),
            payload: json!({}),
            flags: Vec::new(),
            presence_target: None,
            password: None,
            extra: json!({}),
        }
    }

    /// Set the opaque payload body.
    #[must_use]
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Mark the envelope as a join request.
    #[must_use]
    pub fn join(mut self) -> Self {
        self.flags.push("newParticipationRequest");
        self
    }

    /// Mark the envelope as a moderation handoff; `fired_on_leave` defers
    /// delivery until the sender departs.
    #[must_use]
    pub fn handoff(mut self, fired_on_leave: bool) -> Self {
        self.flags.push("shiftedModerationControl");
        if fired_on_leave {
            self.flags.push("firedOnLeave");
        }
        self
    }

    /// Turn the envelope into a presence probe for `target`, addressed to
    /// the system recipient.
    #[must_use]
    pub fn presence(mut self, target: impl Into<String>) -> Self {
        self.remote_user_id = SYSTEM_RECIPIENT.to_string();
        self.flags.push("detectPresence");
        self.presence_target = Some(target.into());
        self
    }

    /// Attach a password for a gated join.
    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Attach sender metadata.
    #[must_use]
    pub fn extra(mut self, extra: Value) -> Self {
        self.extra = extra;
        self
    }

    /// Build the envelope.
    ///
    /// # Panics
    ///
    /// Panics if flags were requested on a non-object payload.
    #[must_use]
    pub fn build(self) -> Envelope {
        let mut payload = self.payload;
        if !self.flags.is_empty() || self.presence_target.is_some() {
            let map = payload
                .as_object_mut()
                .expect("flags require an object payload");
            for flag in self.flags {
                map.insert(flag.to_string(), Value::Bool(true));
            }
            if let Some(target) = self.presence_target {
                map.insert("userid".to_string(), Value::String(target));
            }
        }

        Envelope {
            sender: self.sender,
            remote_user_id: self.remote_user_id,
            payload,
            password: self.password.map(Into::into),
            extra: self.extra,
        }
    }
}

/// Generate a random test identity.
#[must_use]
pub fn random_userid(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}
