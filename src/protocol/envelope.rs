//! Outbound envelopes and the id-allocating builder.
//!
//! # Format
//!
//! ```json
//! { "id": 0, "type": "Subscribe", "endpoint": "state" }
//! { "id": 1, "type": "Call", "method": "configure", "arguments": { ... } }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identifiers::MessageId;

use super::Method;

// ============================================================================
// MessageType
// ============================================================================

/// Envelope type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// Standing interest in an endpoint.
    Subscribe,
    /// Cancels a subscription (carries the subscription's id).
    Unsubscribe,
    /// One-shot read of an endpoint.
    Get,
    /// Invocation of a catalog method.
    Call,
}

// ============================================================================
// Envelope
// ============================================================================

/// One protocol message.
///
/// Immutable once built; only its id is retained after transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    id: MessageId,

    #[serde(rename = "type")]
    message_type: MessageType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<Method>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    arguments: Option<Value>,
}

impl Envelope {
    /// Correlation id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Envelope type.
    #[inline]
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Target endpoint (SUBSCRIBE and GET).
    #[inline]
    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Invoked method (CALL).
    #[inline]
    #[must_use]
    pub fn method(&self) -> Option<Method> {
        self.method
    }

    /// Call arguments, if any.
    #[inline]
    #[must_use]
    pub fn arguments(&self) -> Option<&Value> {
        self.arguments.as_ref()
    }

    /// Short description for log fields.
    #[must_use]
    pub fn target(&self) -> &str {
        match (self.method, self.endpoint.as_deref()) {
            (Some(method), _) => method.as_str(),
            (None, Some(endpoint)) => endpoint,
            (None, None) => "",
        }
    }

    /// Test helper: returns this envelope with its id replaced.
    #[cfg(test)]
    #[must_use]
    pub(crate) fn with_id(mut self, id: MessageId) -> Self {
        self.id = id;
        self
    }
}

// ============================================================================
// EnvelopeBuilder
// ============================================================================

/// Builds envelopes with strictly increasing ids, starting at 0.
///
/// Exactly one builder exists per connection; it is owned by the
/// connection manager, which hands out the only reference to it.
#[derive(Debug)]
pub struct EnvelopeBuilder {
    next_id: AtomicU64,
}

impl EnvelopeBuilder {
    pub(crate) const fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
        }
    }

    fn allocate(&self) -> MessageId {
        MessageId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn build(
        &self,
        message_type: MessageType,
        endpoint: Option<String>,
        method: Option<Method>,
        arguments: Option<Value>,
    ) -> Envelope {
        Envelope {
            id: self.allocate(),
            message_type,
            endpoint,
            method,
            arguments,
        }
    }

    /// Builds a SUBSCRIBE for `endpoint`.
    #[must_use]
    pub fn new_subscribe(&self, endpoint: impl Into<String>) -> Envelope {
        self.build(MessageType::Subscribe, Some(endpoint.into()), None, None)
    }

    /// Builds an UNSUBSCRIBE.
    #[must_use]
    pub fn new_unsubscribe(&self) -> Envelope {
        self.build(MessageType::Unsubscribe, None, None, None)
    }

    /// Builds the UNSUBSCRIBE cancelling the subscription the remote side
    /// knows as `subscription`.
    ///
    /// Carries the subscription's own id and allocates none.
    #[must_use]
    pub fn new_unsubscribe_for(&self, subscription: MessageId) -> Envelope {
        Envelope {
            id: subscription,
            message_type: MessageType::Unsubscribe,
            endpoint: None,
            method: None,
            arguments: None,
        }
    }

    /// Builds a GET for `endpoint`.
    #[must_use]
    pub fn new_get(&self, endpoint: impl Into<String>) -> Envelope {
        self.build(MessageType::Get, Some(endpoint.into()), None, None)
    }

    /// Builds a CALL without arguments.
    #[must_use]
    pub fn new_call(&self, method: Method) -> Envelope {
        self.build(MessageType::Call, None, Some(method), None)
    }

    /// Builds a CALL carrying `arguments`.
    #[must_use]
    pub fn new_call_with(&self, method: Method, arguments: Value) -> Envelope {
        self.build(MessageType::Call, None, Some(method), Some(arguments))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_ids_start_at_zero() {
        let builder = EnvelopeBuilder::new();
        assert_eq!(builder.new_get("state").id(), MessageId::new(0));
        assert_eq!(builder.new_call(Method::Run).id(), MessageId::new(1));
    }

    #[test]
    fn test_subscribe_serialization() {
        let builder = EnvelopeBuilder::new();
        let envelope = builder.new_subscribe("state");
        let value = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(value, json!({ "id": 0, "type": "Subscribe", "endpoint": "state" }));
    }

    #[test]
    fn test_call_serialization() {
        let builder = EnvelopeBuilder::new();
        let envelope = builder.new_call_with(Method::Configure, json!({ "exposure": 0.1 }));
        let value = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(
            value,
            json!({
                "id": 0,
                "type": "Call",
                "method": "configure",
                "arguments": { "exposure": 0.1 }
            })
        );
    }

    #[test]
    fn test_call_without_arguments_omits_field() {
        let builder = EnvelopeBuilder::new();
        let json = serde_json::to_string(&builder.new_call(Method::Abort)).expect("serialize");
        assert_eq!(json, r#"{"id":0,"type":"Call","method":"abort"}"#);
    }

    #[test]
    fn test_unsubscribe_retargeted() {
        let builder = EnvelopeBuilder::new();
        let subscribe = builder.new_subscribe("health");
        let unsubscribe = builder.new_unsubscribe_for(subscribe.id());
        assert_eq!(unsubscribe.id(), subscribe.id());
        assert_eq!(unsubscribe.message_type(), MessageType::Unsubscribe);
        assert_eq!(unsubscribe.endpoint(), None);

        // No id was consumed.
        assert_eq!(builder.new_get("state").id(), MessageId::new(1));
    }

    #[test]
    fn test_unsubscribe_allocates_id() {
        let builder = EnvelopeBuilder::new();
        assert_eq!(builder.new_unsubscribe().id(), MessageId::new(0));
        assert_eq!(builder.new_unsubscribe().id(), MessageId::new(1));
    }

    #[test]
    fn test_target() {
        let builder = EnvelopeBuilder::new();
        assert_eq!(builder.new_get("completedSteps").target(), "completedSteps");
        assert_eq!(builder.new_call(Method::Pause).target(), "pause");
    }

    #[test]
    fn test_concurrent_ids_unique() {
        let builder = Arc::new(EnvelopeBuilder::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let builder = Arc::clone(&builder);
                std::thread::spawn(move || {
                    (0..500)
                        .map(|_| builder.new_get("state").id().as_u64())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread"))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 8 * 500);
    }

    proptest! {
        #[test]
        fn prop_ids_strictly_increasing(kinds in proptest::collection::vec(0u8..5, 1..64)) {
            let builder = EnvelopeBuilder::new();
            let mut last: Option<MessageId> = None;
            for kind in kinds {
                let envelope = match kind {
                    0 => builder.new_subscribe("state"),
                    1 => builder.new_unsubscribe(),
                    2 => builder.new_get("health"),
                    3 => builder.new_call(Method::Run),
                    _ => builder.new_call_with(Method::Pause, json!({ "completedSteps": 3 })),
                };
                if let Some(previous) = last {
                    prop_assert!(envelope.id() > previous);
                }
                last = Some(envelope.id());
            }
        }
    }
}
