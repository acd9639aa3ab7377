//! On-the-wire QMP message types.

use qemukit_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single command as it appears on the wire.
///
/// The argument key set is command-defined and deliberately not validated
/// here. The id, when set, is echoed back by the peer but is never used for
/// reply correlation (see [`QmpClient`](super::QmpClient)).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QmpCommand {
    pub execute: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl QmpCommand {
    pub fn new(execute: impl Into<String>) -> Self {
        Self {
            execute: execute.into(),
            arguments: None,
            id: None,
        }
    }
}

/// The one-shot hello the hypervisor emits before accepting commands.
#[derive(Debug, Clone, Deserialize)]
pub struct QmpGreeting {
    #[serde(rename = "QMP")]
    pub qmp: QmpGreetingInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QmpGreetingInfo {
    pub version: QmpVersionInfo,
    #[serde(default)]
    pub capabilities: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QmpVersionInfo {
    pub qemu: QmpVersionTriple,
    #[serde(default)]
    pub package: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct QmpVersionTriple {
    pub major: u64,
    pub minor: u64,
    pub micro: u64,
}

/// A reply to a previously submitted command: exactly one of a success
/// payload or an error, plus the echoed id when the command carried one.
#[derive(Debug, Clone)]
pub struct QmpResponse {
    pub ret: Option<Value>,
    pub error: Option<QmpError>,
    pub id: Option<Value>,
}

impl QmpResponse {
    /// Extracts a reply from a decoded message known to carry a `return` or
    /// `error` key.
    pub(crate) fn from_object(obj: &Map<String, Value>) -> Self {
        Self {
            ret: obj.get("return").cloned(),
            error: obj
                .get("error")
                .and_then(|e| serde_json::from_value(e.clone()).ok()),
            id: obj.get("id").cloned(),
        }
    }

    /// Unwraps the reply into the success payload or the peer's error.
    pub fn into_result(self) -> Result<Value> {
        if let Some(err) = self.error {
            return Err(Error::Monitor {
                class: err.class,
                desc: err.desc,
            });
        }
        self.ret.ok_or_else(|| {
            Error::InvalidResponse("reply carries neither return nor error".to_string())
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QmpError {
    pub class: String,
    pub desc: String,
}

/// An asynchronous event; may arrive at any time after the greeting.
#[derive(Debug, Clone, Deserialize)]
pub struct QmpEvent {
    pub event: String,
    #[serde(default)]
    pub data: Option<Value>,
    pub timestamp: QmpTimestamp,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct QmpTimestamp {
    pub seconds: i64,
    pub microseconds: i64,
}

/// Parsed reply of `query-status`.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryStatus {
    pub status: String,
    pub running: bool,
    pub singlestep: bool,
}
