//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use malcolm_client::transport::{MemoryPeer, MemoryServer, MemoryTransport};
use malcolm_client::{MalcolmClient, ReconnectPolicy};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Constants
// ============================================================================

/// Upper bound for anything the tests wait on.
pub const WAIT: Duration = Duration::from_secs(2);

// ============================================================================
// Functions
// ============================================================================

/// Initialize tracing/logging. Honors `RUST_LOG`; safe to call repeatedly.
pub fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("malcolm_client=warn"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_test_writer()
        .try_init();
}

/// Reconnect quickly so loss/reconnect tests stay fast.
pub fn fast_reconnect() -> ReconnectPolicy {
    ReconnectPolicy::new(Duration::from_millis(10), Duration::from_millis(40))
}

/// A client connected to an in-memory peer.
pub async fn connected() -> anyhow::Result<(MalcolmClient, MemoryServer, MemoryPeer)> {
    init_logging();

    let (transport, mut server) = MemoryTransport::pair();
    let client = MalcolmClient::builder()
        .transport(transport)
        .reconnect(fast_reconnect())
        .build()?;

    let peer = tokio::time::timeout(WAIT, server.accept())
        .await?
        .ok_or_else(|| anyhow::anyhow!("server closed"))?;
    client.wait_connected(WAIT).await?;

    Ok((client, server, peer))
}

/// Receives the next envelope or fails the test.
pub async fn next_envelope(peer: &mut MemoryPeer) -> anyhow::Result<serde_json::Value> {
    tokio::time::timeout(WAIT, peer.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("link closed"))
}

/// Shared event log for listeners.
pub fn recorder<T: Send + 'static>() -> Arc<Mutex<Vec<T>>> {
    Arc::new(Mutex::new(Vec::new()))
}
