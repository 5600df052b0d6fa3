//! Malcolm client - correlated request/response and subscriptions over one
//! connection.
//!
//! This library talks to a Malcolm hardware-control service. Any number of
//! logical devices share a single physical connection; every message they
//! send carries a unique id, and every inbound frame is routed back to the
//! call or subscription that owns its id.
//!
//! # Architecture
//!
//! - **Envelope builder**: allocates ids from one atomic counter per
//!   connection
//! - **Correlation table**: id → pending call or subscription listeners
//! - **Connection manager**: owns the transport, reconnects forever with
//!   backoff, restores subscriptions, fans out connection state
//! - **Client facade**: calls, gets, subscribe/unsubscribe for devices
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use malcolm_client::{Frame, MalcolmClient, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = MalcolmClient::builder()
//!         .url("ws://localhost:8008")
//!         .build()?;
//!     client.wait_connected(Duration::from_secs(5)).await?;
//!
//!     let scan = client.device("BL45P-ML-SCAN-01");
//!     println!("state: {}", scan.state().await?);
//!
//!     scan.subscribe(
//!         "completedSteps",
//!         Arc::new(|frame: &Frame| println!("step {:?}", frame.value())),
//!     )?;
//!     scan.run().await?;
//!
//!     client.disconnect();
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | [`MalcolmClient`], [`Device`] and configuration |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | Envelopes, frames and the method catalog |
//! | [`transport`] | Connection manager, correlation table, transports |

// ============================================================================
// Modules
// ============================================================================

/// Client facade and device handles.
///
/// Use [`MalcolmClient::builder()`] to create a configured client.
pub mod client;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers for messages, subscriptions and listeners.
pub mod identifiers;

/// Wire message types.
pub mod protocol;

/// Connection management and transports.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Client types
pub use client::{ClientBuilder, ClientOptions, Device, MalcolmClient, SubscriptionHandle};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{ListenerId, MessageId, SubscriptionId};

// Protocol types
pub use protocol::{Envelope, Frame, FrameType, MessageType, Method, MethodMeta};

// Transport types
pub use transport::{
    ConnectionState, ConnectionStateListener, Listener, ReconnectPolicy, Transport,
    WebSocketTransport,
};
