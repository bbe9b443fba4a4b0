//! Unit-test helpers: an in-memory [`TaskRouterApi`] and envelope builders.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::api::TaskRouterApi;
use crate::error::ApiError;
use crate::session::Session;
use crate::types::{Sid, StateSnapshot};

/// Records every call; fails them all while `fail` is set.
#[derive(Default)]
pub(crate) struct MockApi {
    pub(crate) calls: Mutex<Vec<String>>,
    pub(crate) fail: Mutex<bool>,
    pub(crate) snapshot: Mutex<StateSnapshot>,
}

impl MockApi {
    fn record(&self, call: String) -> Result<(), ApiError> {
        self.calls.lock().push(call);
        if *self.fail.lock() {
            return Err(ApiError::Status {
                status: 400,
                body: "rejected by mock".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TaskRouterApi for MockApi {
    async fn accept_reservation(&self, reservation_sid: &Sid) -> Result<(), ApiError> {
        self.record(format!("accept {reservation_sid}"))
    }

    async fn reject_reservation(
        &self,
        reservation_sid: &Sid,
        activity_sid: Option<&Sid>,
    ) -> Result<(), ApiError> {
        let activity = activity_sid.map(Sid::as_str).unwrap_or("-");
        self.record(format!("reject {reservation_sid} {activity}"))
    }

    async fn complete_task(&self, task_sid: &Sid, reason: &str) -> Result<(), ApiError> {
        self.record(format!("complete {task_sid} {reason}"))
    }

    async fn wrapup_task(&self, task_sid: &Sid, reason: &str) -> Result<(), ApiError> {
        self.record(format!("wrapup {task_sid} {reason}"))
    }

    async fn update_worker_activity(&self, activity_sid: &Sid) -> Result<(), ApiError> {
        self.record(format!("activity {activity_sid}"))
    }

    async fn fetch_state(&self) -> Result<StateSnapshot, ApiError> {
        self.record("fetch".to_string())?;
        Ok(self.snapshot.lock().clone())
    }
}

pub(crate) fn session(api: Arc<MockApi>) -> Arc<Session> {
    Session::new(Sid::from("WK1"), api)
}

/// Encoded envelope
pub(crate) fn envelope(event_type: &str, data: Value) -> Vec<u8> {
    json!({ "event_type": event_type, "event_data": data })
        .to_string()
        .into_bytes()
}

pub(crate) fn envelope_seq(event_type: &str, sequence: u64, data: Value) -> Vec<u8> {
    json!({ "event_type": event_type, "sequence": sequence, "event_data": data })
        .to_string()
        .into_bytes()
}

/// `reservation.created` for `WR1` owning `WT1` in Spanish
pub(crate) fn reservation_created() -> Vec<u8> {
    envelope(
        "reservation.created",
        json!({
            "sid": "WR1",
            "reservation_status": "pending",
            "task_sid": "WT1",
            "task": {
                "status": "reserved",
                "attributes": { "selected_language": "es" },
                "queue_sid": "WQ1",
                "workflow_sid": "WW1",
                "task_channel_unique_name": "default"
            }
        }),
    )
}
