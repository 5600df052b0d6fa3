//! Named device handle.
//!
//! A [`Device`] binds a device name to the shared client. The name only
//! attributes log lines; all devices share one connection.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::identifiers::{ListenerId, SubscriptionId};
use crate::protocol::{Frame, Method, MethodMeta};
use crate::transport::{ConnectionStateListener, Listener};

use super::core::{MalcolmClient, SubscriptionHandle};

// ============================================================================
// Constants
// ============================================================================

/// Endpoint carrying the device state machine.
pub const STATE_ENDPOINT: &str = "state";

/// Endpoint carrying the device health.
pub const HEALTH_ENDPOINT: &str = "health";

/// Endpoint counting completed scan steps.
pub const COMPLETED_STEPS_ENDPOINT: &str = "completedSteps";

/// Endpoint whose value is the whole block.
pub const BLOCK_ENDPOINT: &str = "";

/// States in which the device is busy moving between rest states.
const TRANSIENT_STATES: [&str; 9] = [
    "Resetting",
    "Disabling",
    "Loading",
    "Saving",
    "Configuring",
    "Running",
    "PostRun",
    "Seeking",
    "Aborting",
];

// ============================================================================
// Functions
// ============================================================================

/// Extracts a state name from a state value or update.
///
/// Accepts a bare string or an attribute object carrying it under `value`.
#[must_use]
pub fn state_name(value: &Value) -> Option<&str> {
    value
        .as_str()
        .or_else(|| value.get("value").and_then(Value::as_str))
}

/// Returns `true` for states the device passes through while working.
#[must_use]
pub fn is_transient_state(state: &str) -> bool {
    TRANSIENT_STATES
        .iter()
        .any(|transient| transient.eq_ignore_ascii_case(state))
}

// ============================================================================
// Device
// ============================================================================

/// Handle for one remote device.
#[derive(Clone)]
pub struct Device {
    name: String,
    client: MalcolmClient,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Device {
    pub(crate) fn new(name: impl Into<String>, client: MalcolmClient) -> Self {
        Self {
            name: name.into(),
            client,
        }
    }

    /// Device name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The client this device talks through.
    #[inline]
    #[must_use]
    pub fn client(&self) -> &MalcolmClient {
        &self.client
    }
}

// ============================================================================
// Device - Attributes
// ============================================================================

impl Device {
    /// Reads the device state.
    ///
    /// # Errors
    ///
    /// See [`MalcolmClient::send_with_timeout`].
    pub async fn state(&self) -> Result<Value> {
        self.attribute(STATE_ENDPOINT).await
    }

    /// Reads the device health.
    ///
    /// # Errors
    ///
    /// See [`MalcolmClient::send_with_timeout`].
    pub async fn health(&self) -> Result<Value> {
        self.attribute(HEALTH_ENDPOINT).await
    }

    /// Reads the value of any endpoint.
    ///
    /// # Errors
    ///
    /// See [`MalcolmClient::send_with_timeout`].
    pub async fn attribute(&self, endpoint: &str) -> Result<Value> {
        self.client.get(&self.name, endpoint).await?.into_value()
    }

    /// Reads every attribute of the device, keyed by name.
    ///
    /// Entries of the block that are not attributes (methods, metadata)
    /// are left out.
    ///
    /// # Errors
    ///
    /// - [`Error::ProtocolViolation`] if the block is not an object
    /// - See [`MalcolmClient::send_with_timeout`]
    pub async fn attributes(&self) -> Result<Map<String, Value>> {
        let block = self.attribute(BLOCK_ENDPOINT).await?;
        let Value::Object(entries) = block else {
            return Err(Error::protocol_violation(format!(
                "block of device '{}' is not an object",
                self.name
            )));
        };

        Ok(entries
            .into_iter()
            .filter(|(_, entry)| entry.get("value").is_some())
            .collect())
    }

    /// Returns `true` while the device is in a transient state.
    ///
    /// # Errors
    ///
    /// - [`Error::ProtocolViolation`] if the state value is malformed
    /// - See [`MalcolmClient::send_with_timeout`]
    pub async fn is_locked(&self) -> Result<bool> {
        let value = self.state().await?;
        let state = state_name(&value)
            .ok_or_else(|| Error::protocol_violation(format!("malformed state: {value}")))?;
        Ok(is_transient_state(state))
    }

    /// Fetches a method's calling contract.
    ///
    /// # Errors
    ///
    /// See [`MalcolmClient::send_with_timeout`].
    pub async fn describe(&self, method: Method) -> Result<MethodMeta> {
        self.client.describe(&self.name, method).await
    }

    /// Waits for the first reported state not in `ignored`.
    ///
    /// Subscribes to the state endpoint for the duration of the wait; the
    /// listener is removed again whatever the outcome. Updates without a
    /// state value are skipped. `ignored` matches case-insensitively.
    ///
    /// # Errors
    ///
    /// - [`Error::StateTimeout`] if no acceptable state arrives in time
    /// - [`Error::Remote`] if the subscription reports an error
    /// - See [`MalcolmClient::subscribe`]
    pub async fn wait_for_state(&self, timeout: Duration, ignored: &[&str]) -> Result<String> {
        let (handle, mut events) = self.client.subscribe_channel(&self.name, STATE_ENDPOINT)?;

        let awaited = async {
            while let Some(frame) = events.recv().await {
                let frame = frame.into_result()?;
                let Some(state) = frame.value().and_then(state_name) else {
                    trace!(device = %self.name, "State update without a value");
                    continue;
                };

                if ignored.iter().any(|skip| skip.eq_ignore_ascii_case(state)) {
                    trace!(device = %self.name, state, "Ignoring state");
                    continue;
                }
                return Ok(state.to_string());
            }
            Err(Error::CommunicationFailure)
        };
        let outcome = tokio::time::timeout(timeout, awaited).await;

        if let Err(e) = self.client.unsubscribe(&self.name, handle.id, &[handle.listener]) {
            debug!(device = %self.name, error = %e, "State listener not removed cleanly");
        }

        outcome.map_err(|_| Error::state_timeout(&self.name, timeout.as_millis() as u64))?
    }
}

// ============================================================================
// Device - Methods
// ============================================================================

impl Device {
    /// Invokes a method with the timeout of its class.
    ///
    /// # Errors
    ///
    /// See [`MalcolmClient::send_with_timeout`].
    pub async fn call(&self, method: Method, arguments: Option<Value>) -> Result<Frame> {
        let timeout = self.client.options().timeout_for(method);
        self.client
            .call_with_timeout(&self.name, method, arguments, timeout)
            .await
    }

    /// Aborts the current operation.
    ///
    /// # Errors
    ///
    /// See [`Device::call`].
    pub async fn abort(&self) -> Result<Frame> {
        self.call(Method::Abort, None).await
    }

    /// Configures the device for a scan.
    ///
    /// # Errors
    ///
    /// See [`Device::call`].
    pub async fn configure(&self, parameters: Value) -> Result<Frame> {
        self.call(Method::Configure, Some(parameters)).await
    }

    /// Disables the device.
    ///
    /// # Errors
    ///
    /// See [`Device::call`].
    pub async fn disable(&self) -> Result<Frame> {
        self.call(Method::Disable, None).await
    }

    /// Pauses a running scan, optionally seeking to a step.
    ///
    /// # Errors
    ///
    /// See [`Device::call`].
    pub async fn pause(&self, seek: Option<Value>) -> Result<Frame> {
        self.call(Method::Pause, seek).await
    }

    /// Resets the device after an abort or fault.
    ///
    /// # Errors
    ///
    /// See [`Device::call`].
    pub async fn reset(&self) -> Result<Frame> {
        self.call(Method::Reset, None).await
    }

    /// Resumes a paused scan.
    ///
    /// # Errors
    ///
    /// See [`Device::call`].
    pub async fn resume(&self) -> Result<Frame> {
        self.call(Method::Resume, None).await
    }

    /// Runs the configured scan to completion.
    ///
    /// # Errors
    ///
    /// See [`Device::call`].
    pub async fn run(&self) -> Result<Frame> {
        self.call(Method::Run, None).await
    }

    /// Validates scan parameters without applying them.
    ///
    /// # Errors
    ///
    /// See [`Device::call`].
    pub async fn validate(&self, parameters: Value) -> Result<Frame> {
        self.call(Method::Validate, Some(parameters)).await
    }
}

// ============================================================================
// Device - Subscriptions
// ============================================================================

impl Device {
    /// Adds a listener for events on `endpoint`.
    ///
    /// # Errors
    ///
    /// See [`MalcolmClient::subscribe`].
    pub fn subscribe(&self, endpoint: &str, listener: Listener) -> Result<SubscriptionHandle> {
        self.client.subscribe(&self.name, endpoint, listener)
    }

    /// Removes listeners, or all of them if `listeners` is empty.
    ///
    /// # Errors
    ///
    /// See [`MalcolmClient::unsubscribe`].
    pub fn unsubscribe(&self, subscription: SubscriptionId, listeners: &[ListenerId]) -> Result<()> {
        self.client.unsubscribe(&self.name, subscription, listeners)
    }

    /// Registers for connection-state transitions.
    pub fn on_connection_state(&self, listener: ConnectionStateListener) -> ListenerId {
        self.client.subscribe_connection_state(&self.name, listener)
    }
}

// ============================================================================
// Tests
// ============================================================================
