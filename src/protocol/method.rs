//! Method catalog.
//!
//! The closed set of remote operations a Malcolm device accepts, and the
//! metadata describing each operation's calling contract.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

// ============================================================================
// Method
// ============================================================================

/// A remote operation name.
///
/// Serialized as the lower-case form of the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// Abort the current run.
    Abort,
    /// Configure the device for a scan.
    Configure,
    /// Disable the device.
    Disable,
    /// Pause the current run.
    Pause,
    /// Reset the device after a fault or abort.
    Reset,
    /// Resume a paused run.
    Resume,
    /// Start a run.
    Run,
    /// Validate a configuration without applying it.
    Validate,
}

impl Method {
    /// Every catalog entry, in declaration order.
    pub const ALL: [Method; 8] = [
        Method::Abort,
        Method::Configure,
        Method::Disable,
        Method::Pause,
        Method::Reset,
        Method::Resume,
        Method::Run,
        Method::Validate,
    ];

    /// Parses a method name, ignoring case.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownMethod`] if `name` is not in the catalog.
    pub fn parse(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|method| method.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::unknown_method(name))
    }

    /// Returns the wire name.
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Abort => "abort",
            Self::Configure => "configure",
            Self::Disable => "disable",
            Self::Pause => "pause",
            Self::Reset => "reset",
            Self::Resume => "resume",
            Self::Run => "run",
            Self::Validate => "validate",
        }
    }

    /// Returns the endpoint queried for this method's metadata.
    #[inline]
    #[must_use]
    pub const fn meta_endpoint(self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// ============================================================================
// MethodMeta
// ============================================================================

/// Calling contract of one method, as reported by the remote side.
///
/// Only the default arguments are modeled.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodMeta {
    /// The method this describes.
    pub method: Method,
    /// Argument name to default value, if the method reports any.
    pub defaults: Option<Map<String, Value>>,
}

impl MethodMeta {
    /// Extracts metadata from the value returned by a GET on the method.
    ///
    /// Accepts the defaults either under `meta.defaults` or directly under
    /// `defaults`.
    #[must_use]
    pub fn from_value(method: Method, value: &Value) -> Self {
        let defaults = value
            .pointer("/meta/defaults")
            .or_else(|| value.get("defaults"))
            .and_then(Value::as_object)
            .cloned();

        Self { method, defaults }
    }

    /// Returns the default for one argument.
    #[inline]
    #[must_use]
    pub fn default_for(&self, argument: &str) -> Option<&Value> {
        self.defaults.as_ref().and_then(|d| d.get(argument))
    }
}

// ============================================================================
// Tests
// ============================================================================
