//! Client timeouts and reconnect configuration.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use malcolm_client::ClientOptions;
//!
//! let options = ClientOptions::new()
//!     .with_default_timeout(Duration::from_secs(10))
//!     .with_run_timeout(Duration::from_secs(3600));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use crate::protocol::Method;
use crate::transport::ReconnectPolicy;

// ============================================================================
// Constants
// ============================================================================

/// Standard operations: get, abort, reset, ...
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Configure and pause, which may move hardware.
const DEFAULT_CONFIGURE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Run blocks for the length of the scan.
const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(2 * 24 * 60 * 60);

// ============================================================================
// ClientOptions
// ============================================================================

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// Timeout for calls and gets without a more specific class.
    pub default_timeout: Duration,

    /// Timeout for CONFIGURE and PAUSE.
    pub configure_timeout: Duration,

    /// Timeout for RUN.
    pub run_timeout: Duration,

    /// Backoff between connect attempts.
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl ClientOptions {
    /// Creates options with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            configure_timeout: DEFAULT_CONFIGURE_TIMEOUT,
            run_timeout: DEFAULT_RUN_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ClientOptions {
    /// Sets the default timeout.
    #[inline]
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Sets the configure/pause timeout.
    #[inline]
    #[must_use]
    pub fn with_configure_timeout(mut self, timeout: Duration) -> Self {
        self.configure_timeout = timeout;
        self
    }

    /// Sets the run timeout.
    #[inline]
    #[must_use]
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }

    /// Sets the reconnect policy.
    #[inline]
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
}

// ============================================================================
// Lookup
// ============================================================================

impl ClientOptions {
    /// Timeout class for a method call.
    #[must_use]
    pub fn timeout_for(&self, method: Method) -> Duration {
        match method {
            Method::Run => self.run_timeout,
            Method::Configure | Method::Pause => self.configure_timeout,
            Method::Abort
            | Method::Disable
            | Method::Reset
            | Method::Resume
            | Method::Validate => self.default_timeout,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
