//! Builder pattern for client configuration.
//!
//! Provides a fluent API for configuring and creating [`MalcolmClient`]
//! instances.
//!
//! # Example
//!
//! ```no_run
//! use malcolm_client::MalcolmClient;
//!
//! # async fn example() -> malcolm_client::Result<()> {
//! let client = MalcolmClient::builder()
//!     .url("ws://localhost:8008")
//!     .build()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::transport::{ConnectionManager, ReconnectPolicy, Transport, WebSocketTransport};

use super::core::MalcolmClient;
use super::options::ClientOptions;

// ============================================================================
// ClientBuilder
// ============================================================================

/// Builder for configuring a [`MalcolmClient`].
///
/// Use [`MalcolmClient::builder()`] to create a new builder.
#[derive(Default)]
pub struct ClientBuilder {
    /// WebSocket URL of the service.
    url: Option<String>,
    /// Explicit transport, overriding `url`.
    transport: Option<Box<dyn Transport>>,
    /// Timeouts and reconnect policy.
    options: ClientOptions,
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("url", &self.url)
            .field("transport", &self.transport.as_ref().map(|t| t.describe()))
            .field("options", &self.options)
            .finish()
    }
}

// ============================================================================
// ClientBuilder Implementation
// ============================================================================

impl ClientBuilder {
    /// Creates a new builder with default options.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the WebSocket URL of the Malcolm service.
    #[inline]
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Uses a custom transport instead of a WebSocket URL.
    #[inline]
    #[must_use]
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    /// Replaces all options.
    #[inline]
    #[must_use]
    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the default call timeout.
    #[inline]
    #[must_use]
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.options.default_timeout = timeout;
        self
    }

    /// Sets the reconnect policy.
    #[inline]
    #[must_use]
    pub fn reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.options.reconnect = reconnect;
        self
    }

    /// Validates the configuration and starts the connection task.
    ///
    /// Returns immediately; use [`MalcolmClient::wait_connected`] to wait
    /// for the first connection.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if neither a URL nor a transport is set
    /// - [`Error::Config`] if the URL is invalid
    /// - [`Error::Config`] if a timeout is zero
    /// - [`Error::Config`] if called outside a tokio runtime
    pub fn build(self) -> Result<MalcolmClient> {
        self.validate_options()?;

        let options = self.options;
        let transport: Box<dyn Transport> = match (self.transport, self.url) {
            (Some(transport), _) => transport,
            (None, Some(url)) => Box::new(WebSocketTransport::new(&url)?),
            (None, None) => {
                return Err(Error::config("either a url or a transport must be set"));
            }
        };

        let manager = ConnectionManager::start(transport, options.reconnect)?;
        Ok(MalcolmClient::new(manager, options))
    }
}

// ============================================================================
// Validation
// ============================================================================

impl ClientBuilder {
    fn validate_options(&self) -> Result<()> {
        let options = &self.options;
        let timeouts = [
            ("default_timeout", options.default_timeout),
            ("configure_timeout", options.configure_timeout),
            ("run_timeout", options.run_timeout),
        ];

        if let Some((name, _)) = timeouts.iter().find(|(_, t)| t.is_zero()) {
            return Err(Error::config(format!("{name} must be greater than zero")));
        }

        if options.reconnect.base_delay.is_zero() {
            return Err(Error::config(
                "reconnect base_delay must be greater than zero",
            ));
        }

        if options.reconnect.base_delay > options.reconnect.max_delay {
            return Err(Error::config(
                "reconnect base_delay must not exceed max_delay",
            ));
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
