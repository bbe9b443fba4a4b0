//! Task entity
//!
//! ```text
//! pending ─► reserved ─► assigned ─► wrapping ─► completed
//!               │            │
//!               └────────────┴─► canceled
//! ```
//!
//! Status only moves on lifecycle events (`canceled`, `wrapup`,
//! `completed`). `updated` refreshes the payload and never touches status.

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::action::{commit_then_confirm, ActionKind};
use crate::error::{ActionError, EntityError};
use crate::event::{Emitter, ListenerId};
use crate::session::Session;
use crate::types::{prefix, Attributes, EntityKind, Sid, TaskPayload, TaskStatus};

/// Inbound event kinds that target a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskEventKind {
    Created,
    Updated,
    Canceled,
    Wrapup,
    Completed,
}

impl TaskEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskEventKind::Created => "created",
            TaskEventKind::Updated => "updated",
            TaskEventKind::Canceled => "canceled",
            TaskEventKind::Wrapup => "wrapup",
            TaskEventKind::Completed => "completed",
        }
    }

    /// Map the suffix of a `task.*` event type.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "created" => Some(TaskEventKind::Created),
            "updated" => Some(TaskEventKind::Updated),
            "canceled" => Some(TaskEventKind::Canceled),
            "wrapup" => Some(TaskEventKind::Wrapup),
            "completed" => Some(TaskEventKind::Completed),
            _ => None,
        }
    }

    /// Lifecycle event that leads to `status`, if any.
    pub fn for_status(status: TaskStatus) -> Option<Self> {
        match status {
            TaskStatus::Canceled => Some(TaskEventKind::Canceled),
            TaskStatus::Wrapping => Some(TaskEventKind::Wrapup),
            TaskStatus::Completed => Some(TaskEventKind::Completed),
            _ => None,
        }
    }

    fn target_status(&self) -> Option<TaskStatus> {
        match self {
            TaskEventKind::Canceled => Some(TaskStatus::Canceled),
            TaskEventKind::Wrapup => Some(TaskStatus::Wrapping),
            TaskEventKind::Completed => Some(TaskStatus::Completed),
            TaskEventKind::Created | TaskEventKind::Updated => None,
        }
    }

    fn allowed_from(&self, from: TaskStatus) -> bool {
        match self {
            TaskEventKind::Created | TaskEventKind::Updated => true,
            TaskEventKind::Canceled => !from.is_terminal(),
            TaskEventKind::Wrapup => matches!(
                from,
                TaskStatus::Pending | TaskStatus::Reserved | TaskStatus::Assigned
            ),
            TaskEventKind::Completed => from != TaskStatus::Canceled,
        }
    }
}

/// Event emitted by a [`Task`]. Carries the same instance the registry holds.
#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub kind: TaskEventKind,
    pub task: Arc<Task>,
}

/// Point-in-time copy of a task's fields
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub sid: Sid,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub attributes: Attributes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_sid: Option<Sid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_sid: Option<Sid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_channel_unique_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
struct TaskState {
    status: TaskStatus,
    reason: Option<String>,
    attributes: Attributes,
    queue_sid: Option<Sid>,
    workflow_sid: Option<Sid>,
    task_channel_unique_name: Option<String>,
    age: Option<u64>,
    priority: Option<i64>,
    timeout: Option<u64>,
}

impl TaskState {
    /// Copy every field present in `payload` except status.
    /// Attributes are replaced wholesale, never merged.
    fn merge(&mut self, payload: &TaskPayload) {
        if let Some(attributes) = &payload.attributes {
            self.attributes = attributes.clone();
        }
        if let Some(reason) = &payload.reason {
            self.reason = Some(reason.clone());
        }
        if let Some(v) = &payload.queue_sid {
            self.queue_sid = Some(v.clone());
        }
        if let Some(v) = &payload.workflow_sid {
            self.workflow_sid = Some(v.clone());
        }
        if let Some(v) = &payload.task_channel_unique_name {
            self.task_channel_unique_name = Some(v.clone());
        }
        if payload.age.is_some() {
            self.age = payload.age;
        }
        if payload.priority.is_some() {
            self.priority = payload.priority;
        }
        if payload.timeout.is_some() {
            self.timeout = payload.timeout;
        }
    }
}

/// A unit of work offered to this worker through a reservation.
///
/// Instances are shared as `Arc<Task>` and mutated in place, so a reference
/// captured before an update observes the update.
pub struct Task {
    sid: Sid,
    state: RwLock<TaskState>,
    emitter: Emitter<TaskEvent>,
    session: Weak<Session>,
}

impl Task {
    pub(crate) fn new(sid: Sid, payload: &TaskPayload, session: Weak<Session>) -> Arc<Self> {
        if !sid.has_prefix(prefix::TASK) {
            debug!(sid = %sid, "Task sid has unexpected prefix");
        }
        let mut state = TaskState {
            status: payload.status.unwrap_or(TaskStatus::Reserved),
            reason: None,
            attributes: Attributes::new(),
            queue_sid: None,
            workflow_sid: None,
            task_channel_unique_name: None,
            age: None,
            priority: None,
            timeout: None,
        };
        state.merge(payload);

        Arc::new(Self {
            sid,
            state: RwLock::new(state),
            emitter: Emitter::new(),
            session,
        })
    }

    pub fn sid(&self) -> &Sid {
        &self.sid
    }

    pub fn status(&self) -> TaskStatus {
        self.state.read().status
    }

    pub fn reason(&self) -> Option<String> {
        self.state.read().reason.clone()
    }

    pub fn attributes(&self) -> Attributes {
        self.state.read().attributes.clone()
    }

    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.state.read().attributes.get(key).cloned()
    }

    pub fn queue_sid(&self) -> Option<Sid> {
        self.state.read().queue_sid.clone()
    }

    pub fn workflow_sid(&self) -> Option<Sid> {
        self.state.read().workflow_sid.clone()
    }

    pub fn task_channel_unique_name(&self) -> Option<String> {
        self.state.read().task_channel_unique_name.clone()
    }

    pub fn age(&self) -> Option<u64> {
        self.state.read().age
    }

    pub fn priority(&self) -> Option<i64> {
        self.state.read().priority
    }

    pub fn timeout(&self) -> Option<u64> {
        self.state.read().timeout
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let state = self.state.read();
        TaskSnapshot {
            sid: self.sid.clone(),
            status: state.status,
            reason: state.reason.clone(),
            attributes: state.attributes.clone(),
            queue_sid: state.queue_sid.clone(),
            workflow_sid: state.workflow_sid.clone(),
            task_channel_unique_name: state.task_channel_unique_name.clone(),
            age: state.age,
            priority: state.priority,
            timeout: state.timeout,
        }
    }

    /// Listen for `updated`, `canceled`, `wrapup` and `completed`.
    pub fn on<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        self.emitter.on(f)
    }

    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<TaskEvent> {
        self.emitter.subscribe()
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.emitter.off(id)
    }

    /// Complete the task. Resolves once the `completed` event has been applied.
    pub async fn complete(self: &Arc<Self>, reason: &str) -> Result<Arc<Task>, ActionError> {
        let session = self.session.upgrade().ok_or(ActionError::SessionClosed)?;
        let request = session.api.complete_task(&self.sid, reason);
        commit_then_confirm(&session.pending, &self.sid, ActionKind::Complete, request).await?;
        Ok(self.clone())
    }

    /// Move the task to wrapping. Resolves once the `wrapup` event has been applied.
    pub async fn wrap_up(self: &Arc<Self>, reason: &str) -> Result<Arc<Task>, ActionError> {
        let session = self.session.upgrade().ok_or(ActionError::SessionClosed)?;
        let request = session.api.wrapup_task(&self.sid, reason);
        commit_then_confirm(&session.pending, &self.sid, ActionKind::WrapUp, request).await?;
        Ok(self.clone())
    }

    /// Apply an inbound event in place and emit it.
    ///
    /// A live `updated` is always emitted, since the backend may have
    /// changed fields this client does not keep. Lifecycle events return
    /// `Ok(false)` when they would not change anything, which makes
    /// repeated delivery a no-op. `Created` only refreshes fields and is
    /// never emitted.
    pub(crate) fn apply(
        self: &Arc<Self>,
        kind: TaskEventKind,
        payload: &TaskPayload,
    ) -> Result<bool, EntityError> {
        self.transition(kind, payload, kind == TaskEventKind::Updated)
    }

    /// Merge a snapshot payload, emitting `updated` only when a kept field
    /// actually changed.
    pub(crate) fn reconcile(self: &Arc<Self>, payload: &TaskPayload) -> Result<bool, EntityError> {
        self.transition(TaskEventKind::Updated, payload, false)
    }

    fn transition(
        self: &Arc<Self>,
        kind: TaskEventKind,
        payload: &TaskPayload,
        always_emit: bool,
    ) -> Result<bool, EntityError> {
        let changed = {
            let mut state = self.state.write();
            let mut next = state.clone();
            next.merge(payload);

            match kind.target_status() {
                Some(target) if target == state.status => {}
                Some(target) => {
                    if !kind.allowed_from(state.status) {
                        return Err(EntityError::InvalidTransition {
                            kind: EntityKind::Task,
                            sid: self.sid.clone(),
                            from: state.status.to_string(),
                            event: kind.as_str().to_string(),
                        });
                    }
                    next.status = target;
                }
                None => {
                    if kind == TaskEventKind::Created {
                        if let Some(status) = payload.status {
                            if TaskEventKind::for_status(status).is_none()
                                && TaskEventKind::for_status(state.status).is_none()
                            {
                                next.status = status;
                            }
                        }
                    }
                }
            }

            let changed = next != *state;
            if changed {
                *state = next;
            }
            changed
        };

        let emit = changed || always_emit;
        if emit {
            debug!(sid = %self.sid, event = kind.as_str(), status = %self.status(), changed, "Task updated");
            if kind != TaskEventKind::Created {
                self.emitter.emit(TaskEvent {
                    kind,
                    task: self.clone(),
                });
            }
        }
        Ok(emit)
    }

    /// Merge fields carried alongside a reservation event without emitting.
    ///
    /// Status follows the payload only between pre-lifecycle statuses
    /// (pending, reserved, assigned); wrapping, canceled and completed are
    /// reached through task events alone.
    pub(crate) fn refresh(&self, payload: &TaskPayload) -> bool {
        let mut state = self.state.write();
        let mut next = state.clone();
        next.merge(payload);
        if let Some(status) = payload.status {
            if TaskEventKind::for_status(status).is_none()
                && TaskEventKind::for_status(state.status).is_none()
            {
                next.status = status;
            }
        }
        let changed = next != *state;
        if changed {
            *state = next;
        }
        changed
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("sid", &self.sid)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn payload(attributes: Value) -> TaskPayload {
        TaskPayload {
            sid: Some(Sid::from("WT100")),
            status: Some(TaskStatus::Reserved),
            attributes: Some(attributes.as_object().cloned().unwrap()),
            queue_sid: Some(Sid::from("WQ1")),
            workflow_sid: Some(Sid::from("WW1")),
            task_channel_unique_name: Some("default".into()),
            ..Default::default()
        }
    }

    fn new_task() -> Arc<Task> {
        Task::new(
            Sid::from("WT100"),
            &payload(json!({"selected_language": "es"})),
            Weak::new(),
        )
    }

    fn record(task: &Arc<Task>) -> Arc<Mutex<Vec<TaskEventKind>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        task.on(move |e| s.lock().push(e.kind));
        seen
    }

    #[test]
    fn test_updated_replaces_attributes_keeps_status() {
        let task = new_task();
        let seen = record(&task);

        let update = TaskPayload {
            attributes: Some(json!({"selected_language": "en"}).as_object().cloned().unwrap()),
            status: Some(TaskStatus::Pending),
            ..Default::default()
        };
        assert!(task.apply(TaskEventKind::Updated, &update).unwrap());

        assert_eq!(task.status(), TaskStatus::Reserved);
        assert_eq!(task.attribute("selected_language"), Some(json!("en")));
        assert_eq!(task.attributes().len(), 1);
        assert_eq!(*seen.lock(), vec![TaskEventKind::Updated]);
    }

    #[test]
    fn test_updated_with_same_fields_still_emits() {
        let task = new_task();
        let seen = record(&task);
        let before = task.snapshot();

        // Same attributes; anything else the backend changed is not kept here.
        let same = payload(json!({"selected_language": "es"}));
        assert!(task.apply(TaskEventKind::Updated, &same).unwrap());
        assert!(task.apply(TaskEventKind::Updated, &same).unwrap());

        assert_eq!(task.snapshot(), before);
        assert_eq!(*seen.lock(), vec![TaskEventKind::Updated, TaskEventKind::Updated]);
    }

    #[test]
    fn test_reconcile_is_silent_when_unchanged() {
        let task = new_task();
        let seen = record(&task);

        assert!(!task.reconcile(&payload(json!({"selected_language": "es"}))).unwrap());
        assert!(seen.lock().is_empty());

        assert!(task.reconcile(&payload(json!({"selected_language": "en"}))).unwrap());
        assert_eq!(*seen.lock(), vec![TaskEventKind::Updated]);
    }

    #[test]
    fn test_attributes_are_replaced_not_merged() {
        let task = Task::new(
            Sid::from("WT1"),
            &payload(json!({"a": 1, "b": 2})),
            Weak::new(),
        );
        let update = TaskPayload {
            attributes: Some(json!({"c": 3}).as_object().cloned().unwrap()),
            ..Default::default()
        };
        task.apply(TaskEventKind::Updated, &update).unwrap();
        assert_eq!(Value::Object(task.attributes()), json!({"c": 3}));
    }

    #[test]
    fn test_cancel_sets_reason_and_preserves_attributes() {
        let task = new_task();
        let seen = record(&task);
        let cancel = TaskPayload {
            reason: Some("Time to go home".into()),
            ..Default::default()
        };

        assert!(task.apply(TaskEventKind::Canceled, &cancel).unwrap());
        assert_eq!(task.status(), TaskStatus::Canceled);
        assert_eq!(task.reason().as_deref(), Some("Time to go home"));
        assert_eq!(task.attribute("selected_language"), Some(json!("es")));
        assert_eq!(*seen.lock(), vec![TaskEventKind::Canceled]);
    }

    #[test]
    fn test_repeated_terminal_event_is_noop() {
        let task = new_task();
        let seen = record(&task);
        let complete = TaskPayload {
            reason: Some("done".into()),
            ..Default::default()
        };

        assert!(task.apply(TaskEventKind::Completed, &complete).unwrap());
        let once = task.snapshot();
        assert!(!task.apply(TaskEventKind::Completed, &complete).unwrap());

        assert_eq!(task.snapshot(), once);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_invalid_transition_leaves_task_unchanged() {
        let task = new_task();
        task.apply(TaskEventKind::Canceled, &TaskPayload::default())
            .unwrap();
        let before = task.snapshot();

        let err = task
            .apply(
                TaskEventKind::Wrapup,
                &TaskPayload {
                    reason: Some("late".into()),
                    ..Default::default()
                },
            )
            .unwrap_err();

        assert!(matches!(err, EntityError::InvalidTransition { .. }));
        assert_eq!(task.snapshot(), before);
    }

    #[test]
    fn test_wrapup_then_complete() {
        let task = new_task();
        let seen = record(&task);
        task.apply(
            TaskEventKind::Wrapup,
            &TaskPayload {
                reason: Some("Wrapping Task".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(task.status(), TaskStatus::Wrapping);

        task.apply(
            TaskEventKind::Completed,
            &TaskPayload {
                reason: Some("Completing Task".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.reason().as_deref(), Some("Completing Task"));
        assert_eq!(
            *seen.lock(),
            vec![TaskEventKind::Wrapup, TaskEventKind::Completed]
        );
    }

    #[test]
    fn test_listener_sees_same_instance() {
        let task = new_task();
        let same = Arc::new(Mutex::new(false));
        let s = same.clone();
        let expected = Arc::as_ptr(&task) as usize;
        task.on(move |e| *s.lock() = Arc::as_ptr(&e.task) as usize == expected);

        task.apply(TaskEventKind::Updated, &payload(json!({"x": 1})))
            .unwrap();
        assert!(*same.lock());
    }

    #[tokio::test]
    async fn test_actions_without_session_fail() {
        let task = new_task();
        assert!(matches!(
            task.complete("done").await,
            Err(ActionError::SessionClosed)
        ));
    }
}
