//! Error types for the Malcolm client.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use malcolm_client::{Method, Result};
//!
//! async fn example(device: &Device) -> Result<()> {
//!     device.call(Method::Reset, None).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Connection | [`Error::NotConnected`], [`Error::CommunicationFailure`], [`Error::Closed`], [`Error::Connection`], [`Error::ConnectionTimeout`] |
//! | Correlation | [`Error::Timeout`], [`Error::StateTimeout`], [`Error::ProtocolViolation`], [`Error::SubscriptionNotFound`] |
//! | Catalog | [`Error::UnknownMethod`] |
//! | Remote | [`Error::Remote`] |
//! | External | [`Error::Json`], [`Error::WebSocket`] |

// ============================================================================
// Imports
// ============================================================================

use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::{MessageId, SubscriptionId};

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when client configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Send attempted while the transport is down.
    ///
    /// Fails fast; the core never queues or retries the message.
    #[error("Not connected")]
    NotConnected,

    /// Transport dropped while the call was outstanding.
    #[error("Communication failure: connection lost")]
    CommunicationFailure,

    /// The client was explicitly disconnected.
    ///
    /// Also resolves calls outstanding at the time of the disconnect.
    #[error("Connection closed")]
    Closed,

    /// Transport could not be established.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Connection not established within the wait period.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // Correlation Errors
    // ========================================================================
    /// No response within the caller-specified deadline.
    #[error("Request {id} timed out after {timeout_ms}ms")]
    Timeout {
        /// The message ID that timed out.
        id: MessageId,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// No acceptable state reported within the wait period.
    #[error("Device {device} reported no awaited state within {timeout_ms}ms")]
    StateTimeout {
        /// Device being watched.
        device: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Id collision or otherwise malformed exchange.
    #[error("Protocol violation: {message}")]
    ProtocolViolation {
        /// Description of the violation.
        message: String,
    },

    /// Subscription id is not (or no longer) registered.
    #[error("Subscription not found: {id}")]
    SubscriptionNotFound {
        /// The unknown subscription.
        id: SubscriptionId,
    },

    // ========================================================================
    // Catalog Errors
    // ========================================================================
    /// Method name not in the catalog.
    #[error("Unknown method: {name}")]
    UnknownMethod {
        /// The unrecognized name.
        name: String,
    },

    // ========================================================================
    // Remote Errors
    // ========================================================================
    /// The remote side answered with an error frame.
    #[error("Malcolm error: {message}")]
    Remote {
        /// Message reported by the remote side.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates a timeout error.
    #[inline]
    pub fn timeout(id: MessageId, timeout_ms: u64) -> Self {
        Self::Timeout { id, timeout_ms }
    }

    /// Creates a state wait timeout error.
    #[inline]
    pub fn state_timeout(device: impl Into<String>, timeout_ms: u64) -> Self {
        Self::StateTimeout {
            device: device.into(),
            timeout_ms,
        }
    }

    /// Creates a protocol violation error.
    #[inline]
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    /// Creates a subscription not found error.
    #[inline]
    pub fn subscription_not_found(id: SubscriptionId) -> Self {
        Self::SubscriptionNotFound { id }
    }

    /// Creates an unknown method error.
    #[inline]
    pub fn unknown_method(name: impl Into<String>) -> Self {
        Self::UnknownMethod { name: name.into() }
    }

    /// Creates a remote error.
    #[inline]
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::ConnectionTimeout { .. } | Self::StateTimeout { .. }
        )
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::NotConnected
                | Self::CommunicationFailure
                | Self::Closed
                | Self::Connection { .. }
                | Self::ConnectionTimeout { .. }
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry once the connection is back.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NotConnected
                | Self::CommunicationFailure
                | Self::Timeout { .. }
                | Self::ConnectionTimeout { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
