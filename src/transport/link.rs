//! Transport seam.
//!
//! A [`Transport`] produces a fresh [`Link`] per connect attempt. The link is
//! a pair of text-frame channels; the inbound channel closing means the
//! physical connection was lost.

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

// ============================================================================
// Link
// ============================================================================

/// One established physical connection.
#[derive(Debug)]
pub struct Link {
    /// Serialized envelopes to transmit.
    pub outbound: mpsc::UnboundedSender<String>,
    /// Frames received from the remote side.
    pub inbound: mpsc::UnboundedReceiver<String>,
}

impl Link {
    /// Creates a link from its two halves.
    #[inline]
    #[must_use]
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self { outbound, inbound }
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Raw message transport to the Malcolm service.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establishes a new physical connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote end cannot be reached; the caller
    /// retries according to its reconnect policy.
    async fn connect(&self) -> Result<Link>;

    /// Human-readable endpoint, for logging.
    fn describe(&self) -> String;
}

#[async_trait]
impl Transport for Box<dyn Transport> {
    async fn connect(&self) -> Result<Link> {
        (**self).connect().await
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}
