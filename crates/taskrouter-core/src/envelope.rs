//! Inbound envelope decoding
//!
//! ```json
//! {
//!   "event_type": "reservation.created",
//!   "sequence": 42,
//!   "event_data": {
//!     "sid": "WR...",
//!     "task_sid": "WT...",
//!     "reservation_status": "pending",
//!     "task": { "status": "reserved", "attributes": "{\"selected_language\":\"es\"}" }
//!   }
//! }
//! ```
//!
//! Task fields may arrive either embedded under `task` or flattened onto
//! `event_data`; [`EventData::task_payload`] folds both into one payload.

use serde::Deserialize;

use crate::entity::{ReservationEventKind, TaskEventKind};
use crate::error::EnvelopeError;
use crate::types::{
    deserialize_attributes, deserialize_known_status, Activity, Attributes, EntityKind,
    ReservationStatus, Sid, TaskPayload, TaskStatus,
};

pub const HEARTBEAT_EVENT: &str = "heartbeat";
pub const ACTIVITY_EVENT: &str = "worker.activity.update";

/// What an envelope asks the router to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Task(TaskEventKind),
    Reservation(ReservationEventKind),
    ActivityUpdated,
    Heartbeat,
    Unknown(String),
}

impl EventKind {
    pub fn parse(event_type: &str) -> Self {
        if event_type == HEARTBEAT_EVENT {
            return EventKind::Heartbeat;
        }
        if event_type == ACTIVITY_EVENT {
            return EventKind::ActivityUpdated;
        }
        let parsed = match event_type.split_once('.') {
            Some(("task", rest)) => TaskEventKind::from_str(rest).map(EventKind::Task),
            Some(("reservation", rest)) => {
                ReservationEventKind::from_str(rest).map(EventKind::Reservation)
            }
            _ => None,
        };
        parsed.unwrap_or_else(|| EventKind::Unknown(event_type.to_string()))
    }

    pub fn entity_kind(&self) -> Option<EntityKind> {
        match self {
            EventKind::Task(_) => Some(EntityKind::Task),
            EventKind::Reservation(_) => Some(EntityKind::Reservation),
            EventKind::ActivityUpdated => Some(EntityKind::Worker),
            EventKind::Heartbeat | EventKind::Unknown(_) => None,
        }
    }
}

/// `event_data` of an envelope. Everything is optional on the wire.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventData {
    #[serde(default)]
    pub sid: Option<Sid>,
    #[serde(default)]
    pub task_sid: Option<Sid>,
    #[serde(default, deserialize_with = "deserialize_known_status")]
    pub reservation_status: Option<ReservationStatus>,
    #[serde(default, deserialize_with = "deserialize_known_status")]
    pub task_status: Option<TaskStatus>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default, deserialize_with = "deserialize_attributes")]
    pub attributes: Option<Attributes>,
    #[serde(default)]
    pub queue_sid: Option<Sid>,
    #[serde(default)]
    pub workflow_sid: Option<Sid>,
    #[serde(default)]
    pub task_channel_unique_name: Option<String>,
    #[serde(default)]
    pub task: Option<TaskPayload>,
    #[serde(default)]
    pub activity_sid: Option<Sid>,
    #[serde(default)]
    pub activity_name: Option<String>,
    #[serde(default)]
    pub available: Option<bool>,
}

impl EventData {
    /// Task fields of this event. Embedded `task` fields win over flat ones.
    ///
    /// `reason` is only taken from the flat fields for task events; on a
    /// reservation event it describes the reservation, not the task.
    pub fn task_payload(&self, task_event: bool) -> TaskPayload {
        let mut payload = self.task.clone().unwrap_or_default();
        if payload.sid.is_none() {
            payload.sid = if task_event {
                self.sid.clone().or_else(|| self.task_sid.clone())
            } else {
                self.task_sid.clone()
            };
        }
        if payload.status.is_none() {
            payload.status = self.task_status;
        }
        if payload.reason.is_none() && task_event {
            payload.reason = self.reason.clone();
        }
        if payload.attributes.is_none() {
            payload.attributes = self.attributes.clone();
        }
        if payload.queue_sid.is_none() {
            payload.queue_sid = self.queue_sid.clone();
        }
        if payload.workflow_sid.is_none() {
            payload.workflow_sid = self.workflow_sid.clone();
        }
        if payload.task_channel_unique_name.is_none() {
            payload.task_channel_unique_name = self.task_channel_unique_name.clone();
        }
        payload
    }
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    event_type: String,
    #[serde(default)]
    event_data: EventData,
    #[serde(default)]
    sequence: Option<u64>,
}

/// One decoded channel message
#[derive(Debug, Clone)]
pub struct Envelope {
    pub event_type: String,
    pub kind: EventKind,
    pub sequence: Option<u64>,
    pub data: EventData,
}

impl Envelope {
    pub fn decode(raw: &[u8]) -> Result<Self, EnvelopeError> {
        let raw: RawEnvelope = serde_json::from_slice(raw)?;
        Ok(Self {
            kind: EventKind::parse(&raw.event_type),
            event_type: raw.event_type,
            sequence: raw.sequence,
            data: raw.event_data,
        })
    }

    /// Sid of the entity this envelope targets.
    pub fn target_sid(&self) -> Result<&Sid, EnvelopeError> {
        let sid = match self.kind {
            EventKind::ActivityUpdated => self.data.activity_sid.as_ref(),
            EventKind::Task(_) => self.data.sid.as_ref().or(self.data.task_sid.as_ref()),
            _ => self.data.sid.as_ref(),
        };
        sid.ok_or_else(|| self.missing(if self.kind == EventKind::ActivityUpdated {
            "activity_sid"
        } else {
            "sid"
        }))
    }

    /// Task sid referenced by a reservation event.
    pub fn task_sid(&self) -> Result<Sid, EnvelopeError> {
        self.data
            .task
            .as_ref()
            .and_then(|t| t.sid.clone())
            .or_else(|| self.data.task_sid.clone())
            .ok_or_else(|| self.missing("task_sid"))
    }

    pub fn activity(&self) -> Result<Activity, EnvelopeError> {
        Ok(Activity {
            sid: self.target_sid()?.clone(),
            name: self.data.activity_name.clone().unwrap_or_default(),
            available: self.data.available.unwrap_or(false),
        })
    }

    fn missing(&self, field: &'static str) -> EnvelopeError {
        EnvelopeError::MissingField {
            event_type: self.event_type.clone(),
            field,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(value: serde_json::Value) -> Envelope {
        Envelope::decode(value.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn test_parse_event_types() {
        assert_eq!(EventKind::parse("task.updated"), EventKind::Task(TaskEventKind::Updated));
        assert_eq!(
            EventKind::parse("reservation.timeout"),
            EventKind::Reservation(ReservationEventKind::Timeout)
        );
        assert_eq!(EventKind::parse("worker.activity.update"), EventKind::ActivityUpdated);
        assert_eq!(EventKind::parse("heartbeat"), EventKind::Heartbeat);
        assert_eq!(
            EventKind::parse("task.transferred"),
            EventKind::Unknown("task.transferred".into())
        );
        assert_eq!(EventKind::parse("bogus"), EventKind::Unknown("bogus".into()));
    }

    #[test]
    fn test_embedded_task_wins_over_flat_fields() {
        let envelope = decode(json!({
            "event_type": "reservation.created",
            "sequence": 7,
            "event_data": {
                "sid": "WR1",
                "task_sid": "WT1",
                "reason": "reservation reason",
                "queue_sid": "WQ-flat",
                "task": {
                    "status": "reserved",
                    "queue_sid": "WQ1",
                    "attributes": "{\"selected_language\": \"es\"}"
                }
            }
        }));

        assert_eq!(envelope.sequence, Some(7));
        assert_eq!(envelope.target_sid().unwrap().as_str(), "WR1");
        assert_eq!(envelope.task_sid().unwrap().as_str(), "WT1");

        let task = envelope.data.task_payload(false);
        assert_eq!(task.sid, Some(Sid::from("WT1")));
        assert_eq!(task.queue_sid, Some(Sid::from("WQ1")));
        assert_eq!(task.reason, None);
        assert_eq!(task.attributes.unwrap()["selected_language"], json!("es"));
    }

    #[test]
    fn test_flat_task_event() {
        let envelope = decode(json!({
            "event_type": "task.canceled",
            "event_data": { "sid": "WT1", "reason": "Time to go home" }
        }));
        let task = envelope.data.task_payload(true);
        assert_eq!(task.sid, Some(Sid::from("WT1")));
        assert_eq!(task.reason.as_deref(), Some("Time to go home"));
    }

    #[test]
    fn test_unknown_statuses_decode_as_absent() {
        let envelope = decode(json!({
            "event_type": "reservation.created",
            "event_data": {
                "sid": "WR1",
                "task_sid": "WT1",
                "reservation_status": "parked",
                "task_status": "transferring",
                "task": { "status": "transferring", "priority": 5 }
            }
        }));

        assert_eq!(envelope.data.reservation_status, None);
        assert_eq!(envelope.data.task_status, None);
        let task = envelope.data.task_payload(false);
        assert_eq!(task.status, None);
        assert_eq!(task.priority, Some(5));
    }

    #[test]
    fn test_missing_sid() {
        let envelope = decode(json!({ "event_type": "task.updated", "event_data": {} }));
        assert!(matches!(
            envelope.target_sid(),
            Err(EnvelopeError::MissingField { field: "sid", .. })
        ));
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(Envelope::decode(b"{not json"), Err(EnvelopeError::Json(_))));
        assert!(Envelope::decode(b"{\"event_data\": {}}").is_err());
    }

    #[test]
    fn test_activity() {
        let envelope = decode(json!({
            "event_type": "worker.activity.update",
            "event_data": { "activity_sid": "WA1", "activity_name": "Idle", "available": true }
        }));
        let activity = envelope.activity().unwrap();
        assert_eq!(activity.name, "Idle");
        assert!(activity.available);
    }
}
