//! Connection manager.
//!
//! Owns the physical transport, the reconnect loop and the connection
//! state, and delivers inbound frames to the [`CorrelationTable`].
//!
//! # Connection Task
//!
//! [`ConnectionManager::start`] spawns one tokio task that handles:
//!
//! - Connect attempts, retried forever with [`ReconnectPolicy`] backoff
//! - Restoring every live subscription after a reconnect
//! - Reading inbound frames and completing them by id
//! - Failing all pending calls when the transport drops
//!
//! # Subscription Control
//!
//! Creating or cancelling a subscription (table update plus SUBSCRIBE or
//! UNSUBSCRIBE) and installing a fresh link (snapshot, install, restore)
//! are serialized by one control lock. A subscription therefore exists in
//! the table only once its SUBSCRIBE went out on the current link or will
//! be restored on the next one, never both.
//!
//! # State Machine
//!
//! ```text
//! Disconnected ──connect ok──► Connected ──transport lost──► Disconnected
//!      │                           │
//!      └──────── disconnect() ─────┴──────────────────────► Closed
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::to_string;
use tokio::runtime::Handle;
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{ListenerId, SubscriptionId};
use crate::protocol::{Envelope, EnvelopeBuilder, Frame};

use super::{Attach, CorrelationTable, Link, Listener, ReconnectPolicy, Release, Transport};

// ============================================================================
// Types
// ============================================================================

/// Connection-state callback; receives `true` on connect, `false` on loss.
///
/// Invoked on the connection task (or the thread calling
/// [`ConnectionManager::disconnect`]); listeners needing a particular
/// thread must redispatch themselves.
pub type ConnectionStateListener = Arc<dyn Fn(bool) + Send + Sync>;

// ============================================================================
// ConnectionState
// ============================================================================

/// State of the physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Not connected; reconnect attempts are running.
    Disconnected = 0,
    /// Transport established.
    Connected = 1,
    /// Explicitly disconnected; terminal.
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connected,
            2 => Self::Closed,
            _ => Self::Disconnected,
        }
    }
}

// ============================================================================
// ConnectionManager
// ============================================================================

/// Shared connection to the Malcolm service.
///
/// Cheap to clone; all clones drive the same connection task. The task
/// runs until [`ConnectionManager::disconnect`] is called.
///
/// # Thread Safety
///
/// `ConnectionManager` is `Send + Sync` and can be shared across tasks.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

struct Shared {
    transport: Box<dyn Transport>,
    reconnect: ReconnectPolicy,
    envelopes: EnvelopeBuilder,
    table: CorrelationTable,
    /// Lock-free copy of the state for readers.
    state: AtomicU8,
    /// Same state, for waiters.
    state_tx: watch::Sender<ConnectionState>,
    /// Sender of the live link; `None` while disconnected.
    outbound: RwLock<Option<mpsc::UnboundedSender<String>>>,
    state_listeners: Mutex<Vec<(ListenerId, ConnectionStateListener)>>,
    /// Serializes subscription control against link installation.
    control: Mutex<()>,
    shutdown: Notify,
}

impl ConnectionManager {
    /// Starts the connection task on the current tokio runtime.
    ///
    /// Returns immediately; the state is [`ConnectionState::Disconnected`]
    /// until the first connect attempt succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if called outside a tokio runtime.
    pub fn start(transport: impl Transport, reconnect: ReconnectPolicy) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|_| Error::config("ConnectionManager must be started inside a tokio runtime"))?;

        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            transport: Box::new(transport),
            reconnect,
            envelopes: EnvelopeBuilder::new(),
            table: CorrelationTable::new(),
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            state_tx,
            outbound: RwLock::new(None),
            state_listeners: Mutex::new(Vec::new()),
            control: Mutex::new(()),
            shutdown: Notify::new(),
        });

        info!(transport = %shared.transport.describe(), "Connection manager started");
        handle.spawn(Arc::clone(&shared).run());

        Ok(Self { shared })
    }

    /// The connection's only envelope builder.
    #[inline]
    #[must_use]
    pub fn envelopes(&self) -> &EnvelopeBuilder {
        &self.shared.envelopes
    }

    /// The connection's correlation table.
    #[inline]
    #[must_use]
    pub fn table(&self) -> &CorrelationTable {
        &self.shared.table
    }

    /// Current connection state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.current_state()
    }

    /// Returns `true` while the transport is established.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Serializes and transmits an envelope.
    ///
    /// `device` only attributes the log line.
    ///
    /// # Errors
    ///
    /// - [`Error::Closed`] after [`ConnectionManager::disconnect`]
    /// - [`Error::NotConnected`] if the transport is down (never queued)
    /// - [`Error::Json`] if serialization fails
    pub fn send(&self, device: &str, envelope: &Envelope) -> Result<()> {
        if self.state() == ConnectionState::Closed {
            return Err(Error::Closed);
        }

        let json = to_string(envelope)?;

        let outbound = self.shared.outbound.read();
        let tx = outbound.as_ref().ok_or(Error::NotConnected)?;
        tx.send(json).map_err(|_| Error::NotConnected)?;

        trace!(
            device,
            id = %envelope.id(),
            kind = ?envelope.message_type(),
            target = envelope.target(),
            "Envelope sent"
        );
        Ok(())
    }

    /// Sends an envelope and waits for the frame carrying its id.
    ///
    /// # Errors
    ///
    /// - [`Error::ProtocolViolation`] if the id is already in flight
    /// - [`Error::NotConnected`] / [`Error::Closed`] if it cannot be sent
    /// - [`Error::Timeout`] if no reply arrives within `request_timeout`;
    ///   the pending call is removed and a late reply is dropped
    /// - [`Error::CommunicationFailure`] if the transport drops meanwhile
    pub async fn send_and_wait(
        &self,
        device: &str,
        envelope: &Envelope,
        request_timeout: Duration,
    ) -> Result<Frame> {
        let id = envelope.id();
        let table = &self.shared.table;

        let response_rx = table.register_pending(id)?;
        if let Err(e) = self.send(device, envelope) {
            table.remove_pending(id);
            return Err(e);
        }

        match timeout(request_timeout, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::CommunicationFailure),
            Err(_) => {
                table.remove_pending(id);
                debug!(device, %id, "Pending call timed out");
                Err(Error::timeout(id, request_timeout.as_millis() as u64))
            }
        }
    }

    /// Adds a listener to the subscription for `endpoint`, creating it and
    /// sending its SUBSCRIBE if none exists.
    ///
    /// Joining an existing subscription needs no traffic and succeeds while
    /// disconnected; the subscription is restored on reconnect.
    ///
    /// # Errors
    ///
    /// - [`Error::Closed`] after [`ConnectionManager::disconnect`]
    /// - [`Error::NotConnected`] if a SUBSCRIBE is needed and the link is
    ///   down; nothing is registered
    /// - Any send error for the SUBSCRIBE; only this caller's listener is
    ///   removed
    pub fn subscribe(&self, device: &str, endpoint: &str, listener: Listener) -> Result<Attach> {
        let shared = &self.shared;
        let _control = shared.control.lock();

        if self.state() == ConnectionState::Closed {
            return Err(Error::Closed);
        }
        if shared.table.subscription_for(endpoint).is_none() && shared.outbound.read().is_none() {
            return Err(Error::NotConnected);
        }

        let attach = shared
            .table
            .attach(endpoint, listener, || shared.envelopes.new_subscribe(endpoint))?;

        if let Some(envelope) = &attach.subscribe {
            if let Err(e) = self.send(device, envelope) {
                let _ = shared.table.remove_listener(attach.subscription, attach.listener);
                return Err(e);
            }
            debug!(device, endpoint, subscription = %attach.subscription, "Subscribed");
        } else {
            debug!(device, endpoint, subscription = %attach.subscription, "Joined subscription");
        }

        Ok(attach)
    }

    /// Removes listeners from a subscription, or all of them if `listeners`
    /// is empty, sending UNSUBSCRIBE once none remain.
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
    ) -> Result<Release> {
        let shared = &self.shared;
        let _control = shared.control.lock();

        let release = shared.table.remove_listeners(subscription, listeners)?;
        match &release {
            Release::Retained { remaining } => {
                debug!(device, %subscription, remaining, "Listeners removed");
            }
            Release::Emptied { wire_id, endpoint } => {
                let envelope = shared.envelopes.new_unsubscribe_for(*wire_id);
                self.send(device, &envelope)?;
                debug!(device, %subscription, %endpoint, "Unsubscribed");
            }
        }

        Ok(release)
    }

    /// Registers a connection-state listener.
    ///
    /// Listeners are called in registration order on every transition; no
    /// call is made for the state at registration time.
    pub fn subscribe_connection_state(
        &self,
        device: &str,
        listener: ConnectionStateListener,
    ) -> ListenerId {
        let id = ListenerId::next();
        self.shared.state_listeners.lock().push((id, listener));
        debug!(device, %id, "Connection-state listener registered");
        id
    }

    /// Removes a connection-state listener.
    ///
    /// Returns `false` if it was not registered.
    pub fn unsubscribe_connection_state(&self, id: ListenerId) -> bool {
        let mut listeners = self.shared.state_listeners.lock();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Waits until the connection is established.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionTimeout`] if not connected within `wait`
    /// - [`Error::Closed`] if the manager is (or becomes) closed
    pub async fn wait_connected(&self, wait: Duration) -> Result<()> {
        let mut state_rx = self.shared.state_tx.subscribe();
        let settled = state_rx.wait_for(|state| *state != ConnectionState::Disconnected);

        match timeout(wait, settled).await {
            Ok(Ok(state)) if *state == ConnectionState::Connected => Ok(()),
            Ok(_) => Err(Error::Closed),
            Err(_) => Err(Error::connection_timeout(wait.as_millis() as u64)),
        }
    }

    /// Tears down the transport and stops reconnecting.
    ///
    /// Outstanding calls fail with [`Error::Closed`] rather than
    /// [`Error::CommunicationFailure`], which is reserved for a link lost
    /// while the client still wants it; later operations fail with
    /// [`Error::Closed`] too. Idempotent.
    pub fn disconnect(&self) {
        let shared = &self.shared;
        let previous =
            ConnectionState::from_u8(shared.state.swap(ConnectionState::Closed as u8, Ordering::SeqCst));
        if previous == ConnectionState::Closed {
            return;
        }

        shared.state_tx.send_replace(ConnectionState::Closed);
        shared.outbound.write().take();
        shared.shutdown.notify_one();

        let failed = shared.table.fail_all_pending(|| Error::Closed);
        info!(failed, "Connection closed");

        if previous == ConnectionState::Connected {
            shared.notify_state(false);
        }
    }
}

// ============================================================================
// Connection Task
// ============================================================================

impl Shared {
    fn current_state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Connect / serve / reconnect until closed.
    async fn run(self: Arc<Self>) {
        let mut attempt: u32 = 0;

        loop {
            if self.current_state() == ConnectionState::Closed {
                break;
            }

            if attempt > 0 {
                let delay = self.reconnect.delay(attempt);
                trace!(attempt, delay_ms = delay.as_millis() as u64, "Waiting before reconnect");
                tokio::select! {
                    () = sleep(delay) => {}
                    () = self.shutdown.notified() => break,
                }
            }

            let connected = tokio::select! {
                result = self.transport.connect() => result,
                () = self.shutdown.notified() => break,
            };

            match connected {
                Ok(Link {
                    outbound,
                    mut inbound,
                }) => {
                    if !self.on_connected(outbound) {
                        break;
                    }
                    attempt = 1;

                    let shutdown = self.serve(&mut inbound).await;
                    self.on_disconnected();
                    if shutdown {
                        break;
                    }
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    if attempt == 1 {
                        warn!(error = %e, transport = %self.transport.describe(), "Connect attempt failed");
                    } else {
                        debug!(error = %e, attempt, "Connect attempt failed");
                    }
                }
            }
        }

        self.outbound.write().take();
        debug!("Connection task terminated");
    }

    /// Installs a fresh link. Returns `false` if the manager was closed
    /// while connecting.
    fn on_connected(&self, outbound: mpsc::UnboundedSender<String>) -> bool {
        {
            // Snapshot, install and restore as one step: a subscription is
            // either in the snapshot or created afterwards over the new link.
            let _control = self.control.lock();
            let live = self.table.live_subscriptions();

            *self.outbound.write() = Some(outbound);

            let flipped = self.state.compare_exchange(
                ConnectionState::Disconnected as u8,
                ConnectionState::Connected as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            if flipped.is_err() {
                self.outbound.write().take();
                return false;
            }

            self.state_tx.send_replace(ConnectionState::Connected);
            info!(transport = %self.transport.describe(), "Connected");

            self.resubscribe(live);
        }

        self.notify_state(true);
        true
    }

    /// Re-sends SUBSCRIBE for each subscription under a new id.
    fn resubscribe(&self, live: Vec<(SubscriptionId, String)>) {
        if live.is_empty() {
            return;
        }

        let outbound = self.outbound.read();
        let Some(tx) = outbound.as_ref() else {
            return;
        };

        let mut restored = 0usize;
        for (subscription, endpoint) in live {
            let envelope = self.envelopes.new_subscribe(endpoint);
            if let Err(e) = self.table.rebind(subscription, envelope.id()) {
                debug!(%subscription, error = %e, "Subscription not restored");
                continue;
            }

            let json = match to_string(&envelope) {
                Ok(json) => json,
                Err(e) => {
                    warn!(%subscription, error = %e, "Failed to encode SUBSCRIBE");
                    continue;
                }
            };
            if tx.send(json).is_err() {
                warn!("Link closed while restoring subscriptions");
                break;
            }

            trace!(%subscription, id = %envelope.id(), endpoint = envelope.target(), "Subscription restored");
            restored += 1;
        }

        info!(restored, "Subscriptions restored");
    }

    /// Delivers inbound frames until the link drops (`false`) or shutdown
    /// is requested (`true`).
    async fn serve(&self, inbound: &mut mpsc::UnboundedReceiver<String>) -> bool {
        loop {
            tokio::select! {
                frame = inbound.recv() => {
                    match frame {
                        Some(text) => self.dispatch(&text),
                        None => return false,
                    }
                }

                () = self.shutdown.notified() => return true,
            }
        }
    }

    /// Correlates one inbound frame. Must not block.
    fn dispatch(&self, text: &str) {
        match Frame::parse(text) {
            Ok(frame) => {
                let id = frame.id;
                self.table.complete(id, Ok(frame));
            }
            Err(e) => warn!(error = %e, "Dropping malformed frame"),
        }
    }

    fn on_disconnected(&self) {
        self.outbound.write().take();

        let flipped = self.state.compare_exchange(
            ConnectionState::Connected as u8,
            ConnectionState::Disconnected as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if flipped.is_err() {
            // Closed by disconnect(), which already failed the calls.
            return;
        }

        self.state_tx.send_replace(ConnectionState::Disconnected);
        warn!(transport = %self.transport.describe(), "Connection lost");

        self.table.fail_all_pending(|| Error::CommunicationFailure);
        self.notify_state(false);
    }

    fn notify_state(&self, connected: bool) {
        let listeners: Vec<ConnectionStateListener> = self
            .state_listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in &listeners {
            listener(connected);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
