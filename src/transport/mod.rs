//! Transport layer.
//!
//! This module handles the single shared connection to the Malcolm
//! service: the physical link, request/response correlation, subscription
//! fan-out and reconnection.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐                          ┌─────────────────┐
//! │  Devices (callers)   │                          │  Malcolm        │
//! │         │            │        WebSocket         │  service        │
//! │  ConnectionManager   │◄────────────────────────►│                 │
//! │   ├ EnvelopeBuilder  │     one physical link    │                 │
//! │   └ CorrelationTable │                          │                 │
//! └──────────────────────┘                          └─────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `correlation` | Id → pending call / subscription table |
//! | `link` | `Transport` trait and `Link` channels |
//! | `manager` | Connection task, reconnect loop, state fan-out |
//! | `memory` | In-memory transport for tests |
//! | `reconnect` | Backoff policy |
//! | `websocket` | WebSocket transport |

// ============================================================================
// Submodules
// ============================================================================

/// Correlation table.
pub mod correlation;

/// Transport seam.
pub mod link;

/// Connection manager.
pub mod manager;

/// In-memory transport.
pub mod memory;

/// Reconnect backoff policy.
pub mod reconnect;

/// WebSocket transport.
pub mod websocket;

// ============================================================================
// Re-exports
// ============================================================================

pub use correlation::{Attach, Completion, CorrelationTable, Listener, Release};
pub use link::{Link, Transport};
pub use manager::{ConnectionManager, ConnectionState, ConnectionStateListener};
pub use memory::{MemoryPeer, MemoryServer, MemoryTransport};
pub use reconnect::ReconnectPolicy;
pub use websocket::WebSocketTransport;
