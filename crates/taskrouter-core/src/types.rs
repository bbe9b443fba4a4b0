//! Core types for taskrouter-core
//!
//! Identifiers, lifecycle statuses and the payload shapes shared by the
//! envelope decoder, the entities and the REST collaborator.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::borrow::Borrow;
use std::fmt;
use tracing::debug;

/// Freeform task attributes. Always a JSON object.
pub type Attributes = Map<String, Value>;

// ============ Sid ============

/// Well-known two-letter sid prefixes. Diagnostic only.
pub mod prefix {
    pub const WORKER: &str = "WK";
    pub const TASK: &str = "WT";
    pub const RESERVATION: &str = "WR";
    pub const QUEUE: &str = "WQ";
    pub const WORKFLOW: &str = "WW";
    pub const ACTIVITY: &str = "WA";
}

/// Opaque server-assigned identifier.
///
/// The two-letter prefix is a human convention; nothing in this crate
/// branches on it except diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sid(String);

impl Sid {
    pub fn new(sid: impl Into<String>) -> Self {
        Self(sid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First two characters, if the sid is long enough.
    pub fn prefix(&self) -> Option<&str> {
        self.0.get(..2)
    }

    pub fn has_prefix(&self, expected: &str) -> bool {
        self.prefix() == Some(expected)
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Sid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Sid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for Sid {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Kind of entity an envelope targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Worker,
    Reservation,
    Task,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Worker => "worker",
            EntityKind::Reservation => "reservation",
            EntityKind::Task => "task",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============ Statuses ============

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Reserved,
    Assigned,
    Wrapping,
    Canceled,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Reserved => "reserved",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Wrapping => "wrapping",
            TaskStatus::Canceled => "canceled",
            TaskStatus::Completed => "completed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "reserved" => Some(TaskStatus::Reserved),
            "assigned" => Some(TaskStatus::Assigned),
            "wrapping" => Some(TaskStatus::Wrapping),
            "canceled" => Some(TaskStatus::Canceled),
            "completed" => Some(TaskStatus::Completed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Canceled | TaskStatus::Completed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reservation lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Pending,
    Accepted,
    Rejected,
    Timeout,
    Canceled,
    Rescinded,
    Wrapping,
    Completed,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Accepted => "accepted",
            ReservationStatus::Rejected => "rejected",
            ReservationStatus::Timeout => "timeout",
            ReservationStatus::Canceled => "canceled",
            ReservationStatus::Rescinded => "rescinded",
            ReservationStatus::Wrapping => "wrapping",
            ReservationStatus::Completed => "completed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReservationStatus::Pending),
            "accepted" => Some(ReservationStatus::Accepted),
            "rejected" => Some(ReservationStatus::Rejected),
            "timeout" => Some(ReservationStatus::Timeout),
            "canceled" => Some(ReservationStatus::Canceled),
            "rescinded" => Some(ReservationStatus::Rescinded),
            "wrapping" => Some(ReservationStatus::Wrapping),
            "completed" => Some(ReservationStatus::Completed),
            _ => None,
        }
    }

    /// Terminal for the reservation lifecycle (wrapping is not).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReservationStatus::Completed
                | ReservationStatus::Rejected
                | ReservationStatus::Timeout
                | ReservationStatus::Canceled
                | ReservationStatus::Rescinded
        )
    }

    /// Whether a task-level terminal event is still expected to follow this
    /// status. Rejected, timed out and rescinded reservations hand the task
    /// back to the backend, so nothing more arrives for it on this worker.
    pub fn expects_task_terminal(&self) -> bool {
        matches!(self, ReservationStatus::Completed | ReservationStatus::Canceled)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============ Payloads ============

/// Worker activity (availability state)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub sid: Sid,
    pub name: String,
    pub available: bool,
}

/// Task fields as delivered by the backend. Every field is optional so
/// partial payloads can be merged; the sid may come from the envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<Sid>,
    #[serde(
        default,
        deserialize_with = "deserialize_known_status",
        skip_serializing_if = "Option::is_none"
    )]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_attributes",
        skip_serializing_if = "Option::is_none"
    )]
    pub attributes: Option<Attributes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_sid: Option<Sid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_sid: Option<Sid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_channel_unique_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// Reservation as returned by a full-state fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationPayload {
    pub sid: Sid,
    pub status: ReservationStatus,
    pub task: TaskPayload,
}

/// Authoritative state of the worker at one instant, used to reconcile
/// after (re)connecting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(default)]
    pub activity: Option<Activity>,
    #[serde(default)]
    pub reservations: Vec<ReservationPayload>,
}

/// Accepts attributes either as a JSON object or as a JSON-encoded string
/// containing an object. `null` and `""` map to an empty object.
pub fn attributes_from_value(value: Value) -> Result<Attributes, String> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Attributes::new()),
        Value::String(s) if s.trim().is_empty() => Ok(Attributes::new()),
        Value::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(format!("attributes must be an object, got {other}")),
            Err(e) => Err(format!("attributes are not valid JSON: {e}")),
        },
        other => Err(format!("attributes must be an object, got {other}")),
    }
}

pub(crate) fn deserialize_attributes<'de, D>(deserializer: D) -> Result<Option<Attributes>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None => Ok(None),
        Some(v) => attributes_from_value(v)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Status that newer backends may extend. Values this client does not know
/// decode as absent instead of failing the whole payload.
pub(crate) fn deserialize_known_status<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let Some(value) = Option::<Value>::deserialize(deserializer)? else {
        return Ok(None);
    };
    match serde_json::from_value(value.clone()) {
        Ok(status) => Ok(Some(status)),
        Err(_) => {
            debug!(status = %value, "Ignoring unknown status");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_task_status_is_absent() {
        let payload: TaskPayload =
            serde_json::from_value(json!({ "sid": "WT1", "status": "transferring" })).unwrap();
        assert_eq!(payload.status, None);
        assert_eq!(payload.sid, Some(Sid::from("WT1")));

        let payload: TaskPayload = serde_json::from_value(json!({ "status": "wrapping" })).unwrap();
        assert_eq!(payload.status, Some(TaskStatus::Wrapping));
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Reserved,
            TaskStatus::Assigned,
            TaskStatus::Wrapping,
            TaskStatus::Canceled,
            TaskStatus::Completed,
        ] {
            assert_eq!(TaskStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(ReservationStatus::from_str("timeout"), Some(ReservationStatus::Timeout));
        assert_eq!(ReservationStatus::from_str("timedOut"), None);
    }

    #[test]
    fn test_wrapping_is_not_terminal() {
        assert!(!ReservationStatus::Wrapping.is_terminal());
        assert!(ReservationStatus::Rescinded.is_terminal());
        assert!(!TaskStatus::Wrapping.is_terminal());
        assert!(TaskStatus::Canceled.is_terminal());
    }

    #[test]
    fn test_sid_prefix() {
        let sid = Sid::from("WT0123");
        assert_eq!(sid.prefix(), Some("WT"));
        assert!(sid.has_prefix(prefix::TASK));
        assert!(!sid.has_prefix(prefix::QUEUE));
        assert_eq!(Sid::from("W").prefix(), None);
    }

    #[test]
    fn test_attributes_accept_string_or_object() {
        let from_obj = attributes_from_value(json!({"selected_language": "es"})).unwrap();
        let from_str = attributes_from_value(json!("{\"selected_language\": \"es\"}")).unwrap();
        assert_eq!(from_obj, from_str);
        assert!(attributes_from_value(json!("")).unwrap().is_empty());
        assert!(attributes_from_value(json!("[1,2]")).is_err());
        assert!(attributes_from_value(json!(3)).is_err());
    }

    #[test]
    fn test_task_payload_partial() {
        let payload: TaskPayload = serde_json::from_value(json!({
            "sid": "WT1",
            "attributes": "{\"a\": 1}"
        }))
        .unwrap();
        assert_eq!(payload.sid, Some(Sid::from("WT1")));
        assert_eq!(payload.status, None);
        assert_eq!(payload.attributes.unwrap()["a"], json!(1));
    }
}
