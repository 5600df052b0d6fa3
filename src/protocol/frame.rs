//! Inbound frames.
//!
//! The core correlates solely on `id`; everything else is kept as an opaque
//! JSON map for the device layer to interpret.
//!
//! # Format
//!
//! ```json
//! { "id": 3, "type": "Return", "value": { ... } }
//! { "id": 4, "type": "Error", "message": "Device is in state Fault" }
//! ```

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, from_str};

use crate::error::{Error, Result};
use crate::identifiers::MessageId;

// ============================================================================
// FrameType
// ============================================================================

/// Type discriminator found in the frame body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Reply to a CALL.
    Return,
    /// Reply to a GET.
    Value,
    /// Full update on a subscription.
    Update,
    /// Partial update on a subscription.
    Delta,
    /// Error reply.
    Error,
    /// Missing or unrecognized type.
    Unknown,
}

impl FrameType {
    fn from_name(name: &str) -> Self {
        match name {
            "Return" => Self::Return,
            "Value" => Self::Value,
            "Update" => Self::Update,
            "Delta" => Self::Delta,
            "Error" => Self::Error,
            _ => Self::Unknown,
        }
    }
}

// ============================================================================
// Frame
// ============================================================================

/// A reply or event received from the remote side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Correlation id.
    pub id: MessageId,

    /// Everything except the id.
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Frame {
    /// Parses a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the text is not an object with a numeric `id`.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(from_str(text)?)
    }

    /// Returns the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        self.body
            .get("type")
            .and_then(Value::as_str)
            .map_or(FrameType::Unknown, FrameType::from_name)
    }

    /// Returns `true` if the remote side reported an error.
    #[inline]
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.frame_type() == FrameType::Error
    }

    /// Returns the `value` field.
    #[inline]
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        self.body.get("value")
    }

    /// Returns the `message` field.
    #[inline]
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.body.get("message").and_then(Value::as_str)
    }

    /// Converts an error frame into [`Error::Remote`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Remote`] if the frame type is `Error`.
    pub fn into_result(self) -> Result<Self> {
        if self.is_error() {
            let message = self.message().unwrap_or("unknown error").to_string();
            return Err(Error::remote(message));
        }
        Ok(self)
    }

    /// Extracts the `value` field, returning an error for error frames.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Remote`] if the frame type is `Error`.
    pub fn into_value(self) -> Result<Value> {
        let mut frame = self.into_result()?;
        Ok(frame.body.remove("value").unwrap_or(Value::Null))
    }
}

// ============================================================================
// Tests
// ============================================================================
