//! Client facade over the shared connection.
//!
//! The [`MalcolmClient`] is what devices talk to: it builds envelopes,
//! waits for replies, and keeps one physical subscription per endpoint no
//! matter how many listeners are interested in it.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use malcolm_client::{Frame, MalcolmClient, Method};
//!
//! # async fn example() -> malcolm_client::Result<()> {
//! let client = MalcolmClient::builder()
//!     .url("ws://localhost:8008")
//!     .build()?;
//! client.wait_connected(Duration::from_secs(5)).await?;
//!
//! let state = client.get("BL45P-ML-SCAN-01", "state").await?;
//! client.call("BL45P-ML-SCAN-01", Method::Reset, None).await?;
//!
//! let handle = client.subscribe(
//!     "BL45P-ML-SCAN-01",
//!     "completedSteps",
//!     Arc::new(|frame: &Frame| println!("{:?}", frame.value())),
//! )?;
//! client.unsubscribe("BL45P-ML-SCAN-01", handle.id, &[handle.listener])?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::Result;
use crate::identifiers::{ListenerId, SubscriptionId};
use crate::protocol::{Envelope, EnvelopeBuilder, Frame, Method, MethodMeta};
use crate::transport::{ConnectionManager, ConnectionState, ConnectionStateListener, Listener};

use super::builder::ClientBuilder;
use super::device::Device;
use super::options::ClientOptions;

// ============================================================================
// Types
// ============================================================================

/// Internal shared state for the client.
pub(crate) struct ClientInner {
    /// The single shared connection.
    pub manager: ConnectionManager,

    /// Timeouts and reconnect policy.
    pub options: ClientOptions,
}

/// A listener's membership in a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    /// Subscription the listener joined; shared by all listeners of the
    /// same endpoint.
    pub id: SubscriptionId,
    /// The listener itself.
    pub listener: ListenerId,
}

// ============================================================================
// MalcolmClient
// ============================================================================

/// Client for one Malcolm service.
///
/// Cheap to clone; every clone shares the same connection, envelope
/// builder and correlation table.
#[derive(Clone)]
pub struct MalcolmClient {
    /// Shared inner state.
    pub(crate) inner: Arc<ClientInner>,
}

// ============================================================================
// MalcolmClient - Display
// ============================================================================

impl fmt::Debug for MalcolmClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.inner.manager.table();
        f.debug_struct("MalcolmClient")
            .field("state", &self.connection_state())
            .field("pending", &table.pending_count())
            .field("subscriptions", &table.subscription_count())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// MalcolmClient - Construction
// ============================================================================

impl MalcolmClient {
    /// Creates a configuration builder for the client.
    #[inline]
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub(crate) fn new(manager: ConnectionManager, options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(ClientInner { manager, options }),
        }
    }

    /// Returns a handle for one named device.
    #[inline]
    #[must_use]
    pub fn device(&self, name: impl Into<String>) -> Device {
        Device::new(name, self.clone())
    }

    /// Active configuration.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// The connection's envelope builder, for hand-built envelopes.
    #[inline]
    #[must_use]
    pub fn envelopes(&self) -> &EnvelopeBuilder {
        self.inner.manager.envelopes()
    }

    /// The underlying connection manager.
    #[inline]
    #[must_use]
    pub fn manager(&self) -> &ConnectionManager {
        &self.inner.manager
    }
}

// ============================================================================
// MalcolmClient - Calls
// ============================================================================

impl MalcolmClient {
    /// Sends an envelope and waits for its reply with the default timeout.
    ///
    /// # Errors
    ///
    /// See [`MalcolmClient::send_with_timeout`].
    pub async fn send(&self, device: &str, envelope: &Envelope) -> Result<Frame> {
        self.send_with_timeout(device, envelope, self.inner.options.default_timeout)
            .await
    }

    /// Sends an envelope and waits for its reply.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] / [`Error::Closed`] if it cannot be sent
    /// - [`Error::Timeout`] if no reply arrives in time
    /// - [`Error::CommunicationFailure`] if the connection drops meanwhile
    /// - [`Error::Remote`] if the reply is an error frame
    pub async fn send_with_timeout(
        &self,
        device: &str,
        envelope: &Envelope,
        timeout: Duration,
    ) -> Result<Frame> {
        self.inner
            .manager
            .send_and_wait(device, envelope, timeout)
            .await?
            .into_result()
    }

    /// Invokes a method with the default timeout.
    ///
    /// # Errors
    ///
    /// See [`MalcolmClient::send_with_timeout`].
    pub async fn call(&self, device: &str, method: Method, arguments: Option<Value>) -> Result<Frame> {
        self.call_with_timeout(device, method, arguments, self.inner.options.default_timeout)
            .await
    }

    /// Invokes a method.
    ///
    /// # Errors
    ///
    /// See [`MalcolmClient::send_with_timeout`].
    pub async fn call_with_timeout(
        &self,
        device: &str,
        method: Method,
        arguments: Option<Value>,
        timeout: Duration,
    ) -> Result<Frame> {
        let envelopes = self.envelopes();
        let envelope = match arguments {
            Some(arguments) => envelopes.new_call_with(method, arguments),
            None => envelopes.new_call(method),
        };

        debug!(device, %method, id = %envelope.id(), "Calling method");
        self.send_with_timeout(device, &envelope, timeout).await
    }

    /// Reads an endpoint with the default timeout.
    ///
    /// # Errors
    ///
    /// See [`MalcolmClient::send_with_timeout`].
    pub async fn get(&self, device: &str, endpoint: &str) -> Result<Frame> {
        self.get_with_timeout(device, endpoint, self.inner.options.default_timeout)
            .await
    }

    /// Reads an endpoint.
    ///
    /// # Errors
    ///
    /// See [`MalcolmClient::send_with_timeout`].
    pub async fn get_with_timeout(
        &self,
        device: &str,
        endpoint: &str,
        timeout: Duration,
    ) -> Result<Frame> {
        let envelope = self.envelopes().new_get(endpoint);
        self.send_with_timeout(device, &envelope, timeout).await
    }

    /// Fetches a method's calling contract.
    ///
    /// # Errors
    ///
    /// See [`MalcolmClient::send_with_timeout`].
    pub async fn describe(&self, device: &str, method: Method) -> Result<MethodMeta> {
        let value = self.get(device, method.meta_endpoint()).await?.into_value()?;
        Ok(MethodMeta::from_value(method, &value))
    }
}

// ============================================================================
// MalcolmClient - Subscriptions
// ============================================================================

impl MalcolmClient {
    /// Adds a listener for events on `endpoint`.
    ///
    /// The first listener for an endpoint sends a SUBSCRIBE; later ones
    /// join the existing subscription without remote traffic. Listeners run
    /// on the inbound delivery task and must return promptly.
    ///
    /// # Errors
    ///
    /// - [`Error::Closed`] after [`MalcolmClient::disconnect`]
    /// - [`Error::NotConnected`] if a SUBSCRIBE is needed and the
    ///   connection is down; nothing is registered in that case
    pub fn subscribe(
        &self,
        device: &str,
        endpoint: &str,
        listener: Listener,
    ) -> Result<SubscriptionHandle> {
        let attach = self.inner.manager.subscribe(device, endpoint, listener)?;
        Ok(SubscriptionHandle {
            id: attach.subscription,
            listener: attach.listener,
        })
    }

    /// Subscribes and receives events on a channel instead of a callback.
    ///
    /// The receiver is fed from the inbound task; the caller drains it on
    /// whichever task or thread suits it.
    ///
    /// # Errors
    ///
    /// See [`MalcolmClient::subscribe`].
    pub fn subscribe_channel(
        &self,
        device: &str,
        endpoint: &str,
    ) -> Result<(SubscriptionHandle, mpsc::UnboundedReceiver<Frame>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener: Listener = Arc::new(move |frame: &Frame| {
            let _ = tx.send(frame.clone());
        });

        let handle = self.subscribe(device, endpoint, listener)?;
        Ok((handle, rx))
    }

    /// Removes listeners from a subscription, or all of them if
    /// `listeners` is empty.
    ///
    /// When no listener remains the subscription is dropped locally and an
    /// UNSUBSCRIBE is sent.
    ///
    /// # Errors
    ///
    /// - [`Error::SubscriptionNotFound`] if the subscription is unknown
    /// - Any send error for the UNSUBSCRIBE; the subscription is already
    ///   gone locally when this is returned
    pub fn unsubscribe(
        &self,
        device: &str,
        subscription: SubscriptionId,
        listeners: &[ListenerId],
    ) -> Result<()> {
        self.inner
            .manager
            .unsubscribe(device, subscription, listeners)
            .map(|_| ())
    }
}

// ============================================================================
// MalcolmClient - Connection
// ============================================================================

impl MalcolmClient {
    /// Registers a connection-state listener.
    pub fn subscribe_connection_state(
        &self,
        device: &str,
        listener: ConnectionStateListener,
    ) -> ListenerId {
        self.inner.manager.subscribe_connection_state(device, listener)
    }

    /// Removes a connection-state listener.
    ///
    /// Returns `false` if it was not registered.
    pub fn unsubscribe_connection_state(&self, id: ListenerId) -> bool {
        self.inner.manager.unsubscribe_connection_state(id)
    }

    /// Current connection state.
    #[inline]
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.manager.state()
    }

    /// Returns `true` while connected.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.manager.is_connected()
    }

    /// Waits until the connection is established.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionTimeout`] if not connected within `timeout`
    /// - [`Error::Closed`] if the client is disconnected
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        self.inner.manager.wait_connected(timeout).await
    }

    /// Tears down the connection and stops reconnecting.
    ///
    /// Outstanding calls fail with [`Error::Closed`], as does every later
    /// call. [`Error::CommunicationFailure`] is only reported for a lost
    /// link. Idempotent.
    pub fn disconnect(&self) {
        self.inner.manager.disconnect();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::error::Error;

    use parking_lot::Mutex;
    use serde_json::json;

    use crate::transport::{MemoryPeer, MemoryServer, MemoryTransport, ReconnectPolicy};

    const WAIT: Duration = Duration::from_secs(2);

    async fn connected_client() -> (MalcolmClient, MemoryServer, MemoryPeer) {
        let (transport, mut server) = MemoryTransport::pair();
        let client = MalcolmClient::builder()
            .transport(transport)
            .reconnect(ReconnectPolicy::new(
                Duration::from_millis(10),
                Duration::from_millis(40),
            ))
            .build()
            .expect("build");

        let peer = server.accept().await.expect("peer");
        client.wait_connected(WAIT).await.expect("connected");
        (client, server, peer)
    }

    fn noop() -> Listener {
        Arc::new(|_: &Frame| {})
    }

    #[tokio::test]
    async fn test_call_sends_lowercase_method() {
        let (client, _server, mut peer) = connected_client().await;

        let caller = client.clone();
        let call = tokio::spawn(async move {
            caller
                .call("dev", Method::Configure, Some(json!({ "exposure": 0.1 })))
                .await
        });

        let request = peer.recv().await.expect("request");
        assert_eq!(request["type"], "Call");
        assert_eq!(request["method"], "configure");
        assert_eq!(request["arguments"]["exposure"], 0.1);
        peer.send(&json!({ "id": request["id"], "type": "Return", "value": null }));

        call.await.expect("join").expect("reply");
        client.disconnect();
    }

    #[tokio::test]
    async fn test_error_frame_becomes_remote_error() {
        let (client, _server, mut peer) = connected_client().await;

        let caller = client.clone();
        let get = tokio::spawn(async move { caller.get("dev", "state").await });

        let request = peer.recv().await.expect("request");
        peer.send(&json!({ "id": request["id"], "type": "Error", "message": "No such block" }));

        let result = get.await.expect("join");
        assert!(matches!(result, Err(Error::Remote { message }) if message == "No such block"));
        client.disconnect();
    }

    #[tokio::test]
    async fn test_describe_reads_defaults() {
        let (client, _server, mut peer) = connected_client().await;

        let caller = client.clone();
        let describe = tokio::spawn(async move { caller.describe("dev", Method::Configure).await });

        let request = peer.recv().await.expect("request");
        assert_eq!(request["type"], "Get");
        assert_eq!(request["endpoint"], "configure");
        peer.send(&json!({
            "id": request["id"],
            "type": "Return",
            "value": { "meta": { "defaults": { "fileDir": "/tmp" } } }
        }));

        let meta = describe.await.expect("join").expect("meta");
        assert_eq!(meta.method, Method::Configure);
        assert_eq!(meta.default_for("fileDir"), Some(&json!("/tmp")));
        client.disconnect();
    }

    #[tokio::test]
    async fn test_second_subscriber_shares_subscription() {
        let (client, _server, mut peer) = connected_client().await;

        let first = client.subscribe("a", "state", noop()).expect("first");
        let second = client.subscribe("b", "state", noop()).expect("second");

        assert_eq!(first.id, second.id);
        assert_ne!(first.listener, second.listener);
        assert_eq!(client.manager().table().subscription_count(), 1);

        let request = peer.recv().await.expect("subscribe");
        assert_eq!(request["type"], "Subscribe");
        assert_eq!(request["endpoint"], "state");

        // Only one SUBSCRIBE went out.
        let next = tokio::time::timeout(Duration::from_millis(50), peer.recv()).await;
        assert!(next.is_err());
        client.disconnect();
    }

    #[tokio::test]
    async fn test_unsubscribe_last_listener_sends_unsubscribe() {
        let (client, _server, mut peer) = connected_client().await;

        let first = client.subscribe("a", "health", noop()).expect("first");
        let second = client.subscribe("b", "health", noop()).expect("second");
        let subscribe = peer.recv().await.expect("subscribe");

        client.unsubscribe("a", first.id, &[first.listener]).expect("partial");
        assert_eq!(client.manager().table().subscription_count(), 1);

        client.unsubscribe("b", second.id, &[second.listener]).expect("last");
        let unsubscribe = peer.recv().await.expect("unsubscribe");
        assert_eq!(unsubscribe["type"], "Unsubscribe");
        assert_eq!(unsubscribe["id"], subscribe["id"]);
        assert_eq!(client.manager().table().subscription_count(), 0);

        let again = client.unsubscribe("b", second.id, &[]);
        assert!(matches!(again, Err(Error::SubscriptionNotFound { .. })));
        client.disconnect();
    }

    #[tokio::test]
    async fn test_subscribe_while_disconnected_registers_nothing() {
        let (transport, server) = MemoryTransport::pair();
        server.set_available(false);
        let client = MalcolmClient::builder()
            .transport(transport)
            .build()
            .expect("build");

        let result = client.subscribe("dev", "state", noop());
        assert!(matches!(result, Err(Error::NotConnected)));
        assert_eq!(client.manager().table().subscription_count(), 0);

        client.disconnect();
        let result = client.subscribe("dev", "state", noop());
        assert!(matches!(result, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_subscribe_channel_receives_events() {
        let (client, _server, mut peer) = connected_client().await;

        let (_handle, mut events) = client.subscribe_channel("dev", "completedSteps").expect("subscribe");
        let request = peer.recv().await.expect("subscribe");

        peer.send(&json!({ "id": request["id"], "type": "Update", "value": 1 }));
        peer.send(&json!({ "id": request["id"], "type": "Update", "value": 2 }));

        let first = events.recv().await.expect("event");
        let second = events.recv().await.expect("event");
        assert_eq!(first.value(), Some(&json!(1)));
        assert_eq!(second.value(), Some(&json!(2)));
        client.disconnect();
    }

    #[tokio::test]
    async fn test_disconnect_notifies_state_listener() {
        let (client, _server, _peer) = connected_client().await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        client.subscribe_connection_state(
            "dev",
            Arc::new(move |connected: bool| seen_clone.lock().push(connected)),
        );

        client.disconnect();
        assert_eq!(*seen.lock(), vec![false]);
        assert_eq!(client.connection_state(), ConnectionState::Closed);
    }
}
