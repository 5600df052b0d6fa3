//! Correlation table.
//!
//! Maps in-flight request ids to waiting callers and subscription ids to
//! their registered listeners. This is the only structure mutated both by
//! caller tasks and by the inbound delivery task.
//!
//! # Locking
//!
//! A single short-lived mutex guards the maps. Listener callbacks are never
//! invoked while it is held: the listener list is snapshotted first, so a
//! slow listener cannot stall registration or completion of other ids, and
//! a listener may call back into the table.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{ListenerId, MessageId, SubscriptionId};
use crate::protocol::{Envelope, Frame};

// ============================================================================
// Types
// ============================================================================

/// Subscription event callback.
///
/// Invoked on the inbound delivery task; must return promptly and hand
/// slow work off to another task.
pub type Listener = Arc<dyn Fn(&Frame) + Send + Sync>;

/// Completion slot of a pending call.
type Waiter = oneshot::Sender<Result<Frame>>;

/// What an id currently resolves to.
enum Route {
    /// A blocking call awaiting its single response.
    Pending(Waiter),
    /// The current wire id of a subscription.
    Subscription(SubscriptionId),
}

/// Standing interest in one endpoint.
struct SubscriptionEntry {
    /// Id of the SUBSCRIBE currently live on the connection.
    wire_id: MessageId,
    endpoint: String,
    /// In registration order.
    listeners: Vec<(ListenerId, Listener)>,
}

#[derive(Default)]
struct Tables {
    routes: FxHashMap<MessageId, Route>,
    subscriptions: FxHashMap<SubscriptionId, SubscriptionEntry>,
    endpoints: FxHashMap<String, SubscriptionId>,
}

// ============================================================================
// Outcomes
// ============================================================================

/// Outcome of [`CorrelationTable::complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// A pending call was resolved.
    Call,
    /// The frame was fanned out to a subscription's listeners.
    Event {
        /// Number of listeners invoked.
        listeners: usize,
    },
    /// No pending call or subscription uses this id.
    Unmatched,
}

/// Outcome of removing listeners from a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    /// Listeners remain; the subscription stays live.
    Retained {
        /// Listeners still registered.
        remaining: usize,
    },
    /// The listener set became empty and the subscription was dropped.
    ///
    /// The caller must send an UNSUBSCRIBE carrying `wire_id`.
    Emptied {
        /// Id the remote side knows the subscription by.
        wire_id: MessageId,
        /// Endpoint that was subscribed.
        endpoint: String,
    },
}

/// Result of [`CorrelationTable::attach`].
#[derive(Debug)]
pub struct Attach {
    /// Subscription the listener joined.
    pub subscription: SubscriptionId,
    /// Handle of the added listener.
    pub listener: ListenerId,
    /// SUBSCRIBE to transmit, present only when the subscription is new.
    pub subscribe: Option<Envelope>,
}

// ============================================================================
// CorrelationTable
// ============================================================================

/// Id → pending call / subscription map.
///
/// An id is registered as either a pending call or a subscription, never
/// both.
#[derive(Default)]
pub struct CorrelationTable {
    tables: Mutex<Tables>,
}

impl CorrelationTable {
    /// Creates an empty table.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------------
    // Pending calls
    // ------------------------------------------------------------------------

    /// Registers a pending call and returns the receiver its result arrives on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolViolation`] if `id` is already registered.
    pub fn register_pending(&self, id: MessageId) -> Result<oneshot::Receiver<Result<Frame>>> {
        let (tx, rx) = oneshot::channel();

        let mut tables = self.tables.lock();
        if tables.routes.contains_key(&id) {
            return Err(Error::protocol_violation(format!(
                "id {id} is already registered"
            )));
        }
        tables.routes.insert(id, Route::Pending(tx));

        Ok(rx)
    }

    /// Removes a pending call without resolving it.
    ///
    /// Returns `false` if `id` was not a pending call.
    pub fn remove_pending(&self, id: MessageId) -> bool {
        let mut tables = self.tables.lock();
        if matches!(tables.routes.get(&id), Some(Route::Pending(_))) {
            tables.routes.remove(&id);
            true
        } else {
            false
        }
    }

    /// Resolves `id`.
    ///
    /// A pending call is completed and removed; a subscription receives the
    /// frame as an event, fanned out in listener registration order; anything
    /// else is logged and dropped.
    pub fn complete(&self, id: MessageId, result: Result<Frame>) -> Completion {
        let listeners = {
            let mut tables = self.tables.lock();
            let subscription = match tables.routes.get(&id) {
                None => {
                    debug!(%id, "Dropping frame for unmatched id");
                    return Completion::Unmatched;
                }
                Some(Route::Subscription(subscription)) => *subscription,
                Some(Route::Pending(_)) => {
                    if let Some(Route::Pending(tx)) = tables.routes.remove(&id) {
                        drop(tables);
                        let _ = tx.send(result);
                        trace!(%id, "Pending call completed");
                    }
                    return Completion::Call;
                }
            };

            match tables.subscriptions.get(&subscription) {
                Some(entry) => entry
                    .listeners
                    .iter()
                    .map(|(_, listener)| Arc::clone(listener))
                    .collect::<Vec<_>>(),
                None => Vec::new(),
            }
        };

        let frame = match result {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%id, error = %e, "Error delivered to subscription, ignoring");
                return Completion::Event { listeners: 0 };
            }
        };

        for listener in &listeners {
            listener(&frame);
        }

        trace!(%id, listeners = listeners.len(), "Event delivered");
        Completion::Event {
            listeners: listeners.len(),
        }
    }

    /// Resolves every pending call with an error built by `error`.
    ///
    /// Subscriptions are retained so they can be restored after reconnect.
    /// Returns the number of calls failed.
    pub fn fail_all_pending(&self, error: impl Fn() -> Error) -> usize {
        let waiters: Vec<Waiter> = {
            let mut tables = self.tables.lock();
            tables
                .routes
                .extract_if(|_, route| matches!(route, Route::Pending(_)))
                .filter_map(|(_, route)| match route {
                    Route::Pending(tx) => Some(tx),
                    Route::Subscription(_) => None,
                })
                .collect()
        };

        let count = waiters.len();
        for tx in waiters {
            let _ = tx.send(Err(error()));
        }

        if count > 0 {
            debug!(count, "Failed pending calls");
        }
        count
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    /// Registers a subscription created by the SUBSCRIBE with id `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolViolation`] if `id` is already registered or
    /// `endpoint` already has a live subscription.
    pub fn register_subscription(
        &self,
        id: MessageId,
        endpoint: impl Into<String>,
    ) -> Result<SubscriptionId> {
        let endpoint = endpoint.into();
        let mut tables = self.tables.lock();
        Self::insert_subscription(&mut tables, id, endpoint)
    }

    fn insert_subscription(
        tables: &mut Tables,
        id: MessageId,
        endpoint: String,
    ) -> Result<SubscriptionId> {
        if tables.routes.contains_key(&id) {
            return Err(Error::protocol_violation(format!(
                "id {id} is already registered"
            )));
        }
        if tables.endpoints.contains_key(&endpoint) {
            return Err(Error::protocol_violation(format!(
                "endpoint '{endpoint}' is already subscribed"
            )));
        }

        let subscription = SubscriptionId::from_message(id);
        tables.routes.insert(id, Route::Subscription(subscription));
        tables.endpoints.insert(endpoint.clone(), subscription);
        tables.subscriptions.insert(
            subscription,
            SubscriptionEntry {
                wire_id: id,
                endpoint,
                listeners: Vec::new(),
            },
        );

        Ok(subscription)
    }

    /// Adds a listener to a subscription.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SubscriptionNotFound`] if the subscription is unknown.
    pub fn add_listener(&self, subscription: SubscriptionId, listener: Listener) -> Result<ListenerId> {
        let mut tables = self.tables.lock();
        let entry = tables
            .subscriptions
            .get_mut(&subscription)
            .ok_or_else(|| Error::subscription_not_found(subscription))?;

        let id = ListenerId::next();
        entry.listeners.push((id, listener));
        Ok(id)
    }

    /// Joins the live subscription for `endpoint`, creating it if needed.
    ///
    /// Lookup and creation happen under one lock, so concurrent callers on
    /// the same endpoint share a single SUBSCRIBE. `new_subscribe` is only
    /// invoked when no subscription exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolViolation`] if the new envelope's id collides.
    pub fn attach(
        &self,
        endpoint: &str,
        listener: Listener,
        new_subscribe: impl FnOnce() -> Envelope,
    ) -> Result<Attach> {
        let mut tables = self.tables.lock();

        let (subscription, subscribe) = match tables.endpoints.get(endpoint) {
            Some(subscription) => (*subscription, None),
            None => {
                let envelope = new_subscribe();
                let subscription =
                    Self::insert_subscription(&mut tables, envelope.id(), endpoint.to_string())?;
                (subscription, Some(envelope))
            }
        };

        let listener_id = ListenerId::next();
        if let Some(entry) = tables.subscriptions.get_mut(&subscription) {
            entry.listeners.push((listener_id, listener));
        }

        Ok(Attach {
            subscription,
            listener: listener_id,
            subscribe,
        })
    }

    /// Removes one listener.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SubscriptionNotFound`] if the subscription is unknown.
    pub fn remove_listener(&self, subscription: SubscriptionId, listener: ListenerId) -> Result<Release> {
        self.remove_listeners(subscription, &[listener])
    }

    /// Removes the named listeners, or all of them if `listeners` is empty.
    ///
    /// When the listener set becomes empty the subscription is dropped from
    /// the table and [`Release::Emptied`] tells the caller which id to
    /// unsubscribe.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SubscriptionNotFound`] if the subscription is unknown.
    pub fn remove_listeners(
        &self,
        subscription: SubscriptionId,
        listeners: &[ListenerId],
    ) -> Result<Release> {
        let mut tables = self.tables.lock();
        let entry = tables
            .subscriptions
            .get_mut(&subscription)
            .ok_or_else(|| Error::subscription_not_found(subscription))?;

        if listeners.is_empty() {
            entry.listeners.clear();
        } else {
            entry.listeners.retain(|(id, _)| !listeners.contains(id));
        }

        let remaining = entry.listeners.len();
        if remaining > 0 {
            return Ok(Release::Retained { remaining });
        }

        match Self::remove_subscription(&mut tables, subscription) {
            Some((wire_id, endpoint)) => Ok(Release::Emptied { wire_id, endpoint }),
            None => Err(Error::subscription_not_found(subscription)),
        }
    }

    /// Drops a subscription regardless of its listeners.
    ///
    /// Returns the wire id and endpoint, or `None` if it was not registered.
    pub fn drop_subscription(&self, subscription: SubscriptionId) -> Option<(MessageId, String)> {
        let mut tables = self.tables.lock();
        Self::remove_subscription(&mut tables, subscription)
    }

    fn remove_subscription(
        tables: &mut Tables,
        subscription: SubscriptionId,
    ) -> Option<(MessageId, String)> {
        let entry = tables.subscriptions.remove(&subscription)?;
        tables.routes.remove(&entry.wire_id);
        tables.endpoints.remove(&entry.endpoint);
        Some((entry.wire_id, entry.endpoint))
    }

    /// Snapshot of live subscriptions and their endpoints.
    #[must_use]
    pub fn live_subscriptions(&self) -> Vec<(SubscriptionId, String)> {
        let tables = self.tables.lock();
        let mut live: Vec<_> = tables
            .subscriptions
            .iter()
            .map(|(id, entry)| (*id, entry.endpoint.clone()))
            .collect();
        live.sort_unstable_by_key(|(id, _)| *id);
        live
    }

    /// Moves a subscription to the id of a fresh SUBSCRIBE.
    ///
    /// # Errors
    ///
    /// - [`Error::SubscriptionNotFound`] if the subscription is unknown
    /// - [`Error::ProtocolViolation`] if `wire_id` is already registered
    pub fn rebind(&self, subscription: SubscriptionId, wire_id: MessageId) -> Result<()> {
        let mut tables = self.tables.lock();
        if tables.routes.contains_key(&wire_id) {
            return Err(Error::protocol_violation(format!(
                "id {wire_id} is already registered"
            )));
        }

        let entry = tables
            .subscriptions
            .get_mut(&subscription)
            .ok_or_else(|| Error::subscription_not_found(subscription))?;
        let previous = std::mem::replace(&mut entry.wire_id, wire_id);

        tables.routes.remove(&previous);
        tables.routes.insert(wire_id, Route::Subscription(subscription));

        trace!(%subscription, %previous, %wire_id, "Subscription rebound");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    /// Live subscription for `endpoint`, if any.
    #[must_use]
    pub fn subscription_for(&self, endpoint: &str) -> Option<SubscriptionId> {
        self.tables.lock().endpoints.get(endpoint).copied()
    }

    /// Current wire id of a subscription.
    #[must_use]
    pub fn resolve(&self, subscription: SubscriptionId) -> Option<MessageId> {
        self.tables
            .lock()
            .subscriptions
            .get(&subscription)
            .map(|entry| entry.wire_id)
    }

    /// Returns `true` if `id` routes to a pending call or subscription.
    #[inline]
    #[must_use]
    pub fn is_registered(&self, id: MessageId) -> bool {
        self.tables.lock().routes.contains_key(&id)
    }

    /// Number of outstanding pending calls.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.tables
            .lock()
            .routes
            .values()
            .filter(|route| matches!(route, Route::Pending(_)))
            .count()
    }

    /// Number of live subscriptions.
    #[inline]
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.tables.lock().subscriptions.len()
    }

    /// Number of listeners on a subscription (0 if unknown).
    #[must_use]
    pub fn listener_count(&self, subscription: SubscriptionId) -> usize {
        self.tables
            .lock()
            .subscriptions
            .get(&subscription)
            .map_or(0, |entry| entry.listeners.len())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    fn frame(id: u64) -> Frame {
        Frame::parse(&json!({ "id": id, "type": "Update", "value": id }).to_string())
            .expect("frame")
    }

    fn recording_listener(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Listener {
        let log = Arc::clone(log);
        Arc::new(move |_frame: &Frame| log.lock().push(name))
    }

    #[tokio::test]
    async fn test_complete_resolves_pending() {
        let table = CorrelationTable::new();
        let id = MessageId::new(1);
        let rx = table.register_pending(id).expect("register");

        assert_eq!(table.complete(id, Ok(frame(1))), Completion::Call);

        let result = rx.await.expect("sender kept").expect("ok frame");
        assert_eq!(result.id, id);
        assert!(!table.is_registered(id));
    }

    #[test]
    fn test_second_complete_is_noop() {
        let table = CorrelationTable::new();
        let id = MessageId::new(2);
        let _rx = table.register_pending(id).expect("register");

        assert_eq!(table.complete(id, Ok(frame(2))), Completion::Call);
        assert_eq!(table.complete(id, Ok(frame(2))), Completion::Unmatched);
    }

    #[test]
    fn test_duplicate_pending_rejected() {
        let table = CorrelationTable::new();
        let id = MessageId::new(3);
        let _rx = table.register_pending(id).expect("register");

        let err = table.register_pending(id).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation { .. }));
    }

    #[test]
    fn test_pending_and_subscription_ids_exclusive() {
        let table = CorrelationTable::new();
        let id = MessageId::new(4);
        table.register_subscription(id, "state").expect("subscribe");

        assert!(table.register_pending(id).is_err());
    }

    #[test]
    fn test_remove_pending() {
        let table = CorrelationTable::new();
        let id = MessageId::new(5);
        let _rx = table.register_pending(id).expect("register");

        assert!(table.remove_pending(id));
        assert!(!table.remove_pending(id));
        assert_eq!(table.pending_count(), 0);
    }

    #[test]
    fn test_fan_out_in_registration_order() {
        let table = CorrelationTable::new();
        let id = MessageId::new(10);
        let subscription = table.register_subscription(id, "state").expect("subscribe");

        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            table
                .add_listener(subscription, recording_listener(&log, name))
                .expect("listener");
        }

        assert_eq!(
            table.complete(id, Ok(frame(10))),
            Completion::Event { listeners: 3 }
        );
        assert_eq!(*log.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_listener_may_reenter_table() {
        let table = Arc::new(CorrelationTable::new());
        let id = MessageId::new(11);
        let subscription = table.register_subscription(id, "health").expect("subscribe");

        let seen = Arc::new(AtomicUsize::new(0));
        let table_clone = Arc::clone(&table);
        let seen_clone = Arc::clone(&seen);
        table
            .add_listener(
                subscription,
                Arc::new(move |_frame: &Frame| {
                    let _rx = table_clone.register_pending(MessageId::new(99));
                    seen_clone.store(table_clone.pending_count(), Ordering::SeqCst);
                }),
            )
            .expect("listener");

        table.complete(id, Ok(frame(11)));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_attach_shares_subscription() {
        let table = CorrelationTable::new();
        let mut next = 20;
        let mut make = || {
            next += 1;
            crate::protocol::EnvelopeBuilder::new().new_subscribe("state").with_id(MessageId::new(next))
        };

        let log = Arc::new(Mutex::new(Vec::new()));
        let first = table
            .attach("state", recording_listener(&log, "a"), &mut make)
            .expect("attach");
        let second = table
            .attach("state", recording_listener(&log, "b"), &mut make)
            .expect("attach");

        assert!(first.subscribe.is_some());
        assert!(second.subscribe.is_none());
        assert_eq!(first.subscription, second.subscription);
        assert_eq!(table.listener_count(first.subscription), 2);
        assert_eq!(table.subscription_count(), 1);
    }

    #[test]
    fn test_remove_last_listener_empties() {
        let table = CorrelationTable::new();
        let id = MessageId::new(30);
        let subscription = table.register_subscription(id, "state").expect("subscribe");
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = table
            .add_listener(subscription, recording_listener(&log, "a"))
            .expect("listener");
        let b = table
            .add_listener(subscription, recording_listener(&log, "b"))
            .expect("listener");

        assert_eq!(
            table.remove_listener(subscription, a).expect("remove"),
            Release::Retained { remaining: 1 }
        );
        assert_eq!(
            table.remove_listener(subscription, b).expect("remove"),
            Release::Emptied {
                wire_id: id,
                endpoint: "state".to_string()
            }
        );

        assert!(!table.is_registered(id));
        assert_eq!(table.resolve(subscription), None);
        assert_eq!(table.subscription_for("state"), None);
        assert_eq!(table.complete(id, Ok(frame(30))), Completion::Unmatched);
    }

    #[test]
    fn test_remove_all_listeners() {
        let table = CorrelationTable::new();
        let subscription = table
            .register_subscription(MessageId::new(31), "completedSteps")
            .expect("subscribe");
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b"] {
            table
                .add_listener(subscription, recording_listener(&log, name))
                .expect("listener");
        }

        let release = table.remove_listeners(subscription, &[]).expect("remove");
        assert!(matches!(release, Release::Emptied { .. }));
        assert!(table.remove_listeners(subscription, &[]).is_err());
    }

    #[tokio::test]
    async fn test_fail_all_pending_retains_subscriptions() {
        let table = CorrelationTable::new();
        let rx1 = table.register_pending(MessageId::new(40)).expect("register");
        let rx2 = table.register_pending(MessageId::new(41)).expect("register");
        table
            .register_subscription(MessageId::new(42), "state")
            .expect("subscribe");

        assert_eq!(table.fail_all_pending(|| Error::CommunicationFailure), 2);

        for rx in [rx1, rx2] {
            let result = rx.await.expect("sender kept");
            assert!(matches!(result, Err(Error::CommunicationFailure)));
        }
        assert_eq!(table.pending_count(), 0);
        assert_eq!(table.subscription_count(), 1);
        assert!(table.is_registered(MessageId::new(42)));
    }

    #[test]
    fn test_rebind_moves_route() {
        let table = CorrelationTable::new();
        let old = MessageId::new(50);
        let new = MessageId::new(77);
        let subscription = table.register_subscription(old, "state").expect("subscribe");
        let log = Arc::new(Mutex::new(Vec::new()));
        table
            .add_listener(subscription, recording_listener(&log, "a"))
            .expect("listener");

        table.rebind(subscription, new).expect("rebind");

        assert_eq!(table.resolve(subscription), Some(new));
        assert_eq!(table.complete(old, Ok(frame(50))), Completion::Unmatched);
        assert_eq!(
            table.complete(new, Ok(frame(77))),
            Completion::Event { listeners: 1 }
        );
        assert_eq!(table.live_subscriptions(), vec![(subscription, "state".to_string())]);
    }

    #[test]
    fn test_unknown_subscription() {
        let table = CorrelationTable::new();
        let missing = SubscriptionId::from_message(MessageId::new(60));
        let noop: Listener = Arc::new(|_frame: &Frame| {});

        assert!(matches!(
            table.add_listener(missing, noop),
            Err(Error::SubscriptionNotFound { .. })
        ));
        assert!(table.drop_subscription(missing).is_none());
    }
}
