//! Malcolm protocol message types.
//!
//! This module defines the message format exchanged with the Malcolm
//! service.
//!
//! # Protocol Overview
//!
//! | Message Type | Direction | Purpose |
//! |--------------|-----------|---------|
//! | `Envelope` (Subscribe) | Local → Remote | Standing interest in an endpoint |
//! | `Envelope` (Unsubscribe) | Local → Remote | Cancel a subscription |
//! | `Envelope` (Get) | Local → Remote | Read an endpoint |
//! | `Envelope` (Call) | Local → Remote | Invoke a catalog method |
//! | `Frame` | Remote → Local | Reply or subscription event, keyed by id |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `envelope` | Envelope and id-allocating builder |
//! | `frame` | Inbound reply/event frames |
//! | `method` | Method catalog and metadata |

// ============================================================================
// Submodules
// ============================================================================

/// Outbound envelopes.
pub mod envelope;

/// Inbound frames.
pub mod frame;

/// Method catalog.
pub mod method;

// ============================================================================
// Re-exports
// ============================================================================

pub use envelope::{Envelope, EnvelopeBuilder, MessageType};
pub use frame::{Frame, FrameType};
pub use method::{Method, MethodMeta};
