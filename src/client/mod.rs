//! Client facade module.
//!
//! This module provides the entry point devices use to talk to a Malcolm
//! service.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`MalcolmClient`] | Calls, gets and subscriptions over one connection |
//! | [`ClientBuilder`] | Fluent configuration builder |
//! | [`ClientOptions`] | Timeouts and reconnect policy |
//! | [`Device`] | Handle for one named device |
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use malcolm_client::{MalcolmClient, Result};
//!
//! # async fn example() -> Result<()> {
//! let client = MalcolmClient::builder()
//!     .url("ws://localhost:8008")
//!     .build()?;
//! client.wait_connected(Duration::from_secs(5)).await?;
//!
//! let scan = client.device("BL45P-ML-SCAN-01");
//! println!("state: {}", scan.state().await?);
//! scan.reset().await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Fluent builder pattern for client configuration.
pub mod builder;

/// Core client implementation.
pub mod core;

/// Named device handle.
pub mod device;

/// Timeouts and reconnect policy.
pub mod options;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::ClientBuilder;
pub use core::{MalcolmClient, SubscriptionHandle};
pub use device::Device;
pub use options::ClientOptions;
