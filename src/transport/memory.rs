//! In-memory transport.
//!
//! Connects the client to a scripted peer over channels. Used by the
//! integration tests and benchmarks to play the remote side, including
//! refusing connections and dropping them mid-session.
//!
//! # Example
//!
//! ```ignore
//! let (transport, mut server) = MemoryTransport::pair();
//! let client = MalcolmClient::builder().transport(transport).build()?;
//!
//! let mut peer = server.accept().await.expect("client connected");
//! let request = peer.recv().await.expect("envelope");
//! peer.send(&json!({ "id": request["id"], "type": "Return" }));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::{Link, Transport};

// ============================================================================
// MemoryTransport
// ============================================================================

/// Client half: each `connect` hands a fresh [`MemoryPeer`] to the server.
pub struct MemoryTransport {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
    available: Arc<AtomicBool>,
}

impl MemoryTransport {
    /// Creates a connected transport/server pair. The server accepts
    /// connections until [`MemoryServer::set_available`] turns it off.
    #[must_use]
    pub fn pair() -> (Self, MemoryServer) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let available = Arc::new(AtomicBool::new(true));

        let transport = Self {
            accept_tx,
            available: Arc::clone(&available),
        };
        let server = MemoryServer {
            accept_rx,
            available,
        };

        (transport, server)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<Link> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::connection("memory server unavailable"));
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let peer = MemoryPeer {
            from_client: outbound_rx,
            to_client: inbound_tx,
        };
        self.accept_tx
            .send(peer)
            .map_err(|_| Error::connection("memory server dropped"))?;

        debug!("Memory link established");
        Ok(Link::new(outbound_tx, inbound_rx))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

// ============================================================================
// MemoryServer
// ============================================================================

/// Server half: yields one [`MemoryPeer`] per client connection.
pub struct MemoryServer {
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
    available: Arc<AtomicBool>,
}

impl MemoryServer {
    /// Waits for the next client connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }

    /// Accepts or refuses future connect attempts.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

// ============================================================================
// MemoryPeer
// ============================================================================

/// The remote side of one connection. Dropping it simulates transport loss.
pub struct MemoryPeer {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<String>,
}

impl MemoryPeer {
    /// Receives the next envelope the client sent, as JSON.
    ///
    /// Returns `None` once the client side of the link is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        loop {
            let text = self.from_client.recv().await?;
            match serde_json::from_str(&text) {
                Ok(value) => return Some(value),
                Err(e) => warn!(error = %e, "Peer received malformed envelope"),
            }
        }
    }

    /// Sends a frame to the client.
    ///
    /// Returns `false` if the client side of the link is gone.
    pub fn send(&self, frame: &Value) -> bool {
        self.send_raw(frame.to_string())
    }

    /// Sends raw text to the client, bypassing JSON encoding.
    pub fn send_raw(&self, text: impl Into<String>) -> bool {
        self.to_client.send(text.into()).is_ok()
    }

    /// Drops the connection.
    pub fn close(self) {
        drop(self);
    }
}
