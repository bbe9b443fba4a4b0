//! Reservation entity
//!
//! ```text
//! pending ─┬─► accepted ─┬─► wrapping ─► completed
//!          │             ├─► completed
//!          │             └─► canceled
//!          └─► rejected | timeout | canceled | rescinded
//! ```

use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::debug;

use super::task::{Task, TaskSnapshot};
use crate::action::{commit_then_confirm, ActionKind};
use crate::error::{ActionError, EntityError};
use crate::event::{Emitter, ListenerId};
use crate::session::Session;
use crate::types::{prefix, EntityKind, ReservationStatus, Sid, TaskPayload};

/// Inbound event kinds that target a reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReservationEventKind {
    Created,
    Accepted,
    Rejected,
    Timeout,
    Canceled,
    Rescinded,
    Wrapup,
    Completed,
}

impl ReservationEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationEventKind::Created => "created",
            ReservationEventKind::Accepted => "accepted",
            ReservationEventKind::Rejected => "rejected",
            ReservationEventKind::Timeout => "timeout",
            ReservationEventKind::Canceled => "canceled",
            ReservationEventKind::Rescinded => "rescinded",
            ReservationEventKind::Wrapup => "wrapup",
            ReservationEventKind::Completed => "completed",
        }
    }

    /// Map the suffix of a `reservation.*` event type.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "created" => Some(ReservationEventKind::Created),
            "accepted" => Some(ReservationEventKind::Accepted),
            "rejected" => Some(ReservationEventKind::Rejected),
            "timeout" => Some(ReservationEventKind::Timeout),
            "canceled" => Some(ReservationEventKind::Canceled),
            "rescinded" => Some(ReservationEventKind::Rescinded),
            "wrapup" => Some(ReservationEventKind::Wrapup),
            "completed" => Some(ReservationEventKind::Completed),
            _ => None,
        }
    }

    pub fn target_status(&self) -> ReservationStatus {
        match self {
            ReservationEventKind::Created => ReservationStatus::Pending,
            ReservationEventKind::Accepted => ReservationStatus::Accepted,
            ReservationEventKind::Rejected => ReservationStatus::Rejected,
            ReservationEventKind::Timeout => ReservationStatus::Timeout,
            ReservationEventKind::Canceled => ReservationStatus::Canceled,
            ReservationEventKind::Rescinded => ReservationStatus::Rescinded,
            ReservationEventKind::Wrapup => ReservationStatus::Wrapping,
            ReservationEventKind::Completed => ReservationStatus::Completed,
        }
    }

    pub fn for_status(status: ReservationStatus) -> Self {
        match status {
            ReservationStatus::Pending => ReservationEventKind::Created,
            ReservationStatus::Accepted => ReservationEventKind::Accepted,
            ReservationStatus::Rejected => ReservationEventKind::Rejected,
            ReservationStatus::Timeout => ReservationEventKind::Timeout,
            ReservationStatus::Canceled => ReservationEventKind::Canceled,
            ReservationStatus::Rescinded => ReservationEventKind::Rescinded,
            ReservationStatus::Wrapping => ReservationEventKind::Wrapup,
            ReservationStatus::Completed => ReservationEventKind::Completed,
        }
    }

    fn allowed_from(&self, from: ReservationStatus) -> bool {
        use ReservationStatus as S;
        match self {
            ReservationEventKind::Created => false,
            ReservationEventKind::Accepted
            | ReservationEventKind::Rejected
            | ReservationEventKind::Timeout
            | ReservationEventKind::Rescinded => from == S::Pending,
            ReservationEventKind::Canceled => matches!(from, S::Pending | S::Accepted),
            ReservationEventKind::Wrapup => from == S::Accepted,
            ReservationEventKind::Completed => matches!(from, S::Accepted | S::Wrapping),
        }
    }
}

/// Event emitted by a [`Reservation`]
#[derive(Debug, Clone)]
pub struct ReservationEvent {
    pub kind: ReservationEventKind,
    pub reservation: Arc<Reservation>,
}

/// Point-in-time copy of a reservation and its task
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationSnapshot {
    pub sid: Sid,
    pub status: ReservationStatus,
    pub task: TaskSnapshot,
}

/// Binding of one task to this worker.
///
/// Owns its task for its whole lifetime; the task reference never changes.
pub struct Reservation {
    sid: Sid,
    status: RwLock<ReservationStatus>,
    task: Arc<Task>,
    emitter: Emitter<ReservationEvent>,
    session: Weak<Session>,
}

impl Reservation {
    pub(crate) fn new(
        sid: Sid,
        status: ReservationStatus,
        task: Arc<Task>,
        session: Weak<Session>,
    ) -> Arc<Self> {
        if !sid.has_prefix(prefix::RESERVATION) {
            debug!(sid = %sid, "Reservation sid has unexpected prefix");
        }
        Arc::new(Self {
            sid,
            status: RwLock::new(status),
            task,
            emitter: Emitter::new(),
            session,
        })
    }

    pub fn sid(&self) -> &Sid {
        &self.sid
    }

    pub fn status(&self) -> ReservationStatus {
        *self.status.read()
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// Sid of the owning worker, while its session is alive.
    pub fn worker_sid(&self) -> Option<Sid> {
        self.session.upgrade().map(|s| s.worker_sid.clone())
    }

    pub fn snapshot(&self) -> ReservationSnapshot {
        ReservationSnapshot {
            sid: self.sid.clone(),
            status: self.status(),
            task: self.task.snapshot(),
        }
    }

    pub fn on<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&ReservationEvent) + Send + Sync + 'static,
    {
        self.emitter.on(f)
    }

    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<ReservationEvent> {
        self.emitter.subscribe()
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.emitter.off(id)
    }

    /// Accept the reservation.
    ///
    /// Resolves with this same instance only after the `accepted` event has
    /// been applied locally, so the caller sees fully updated state.
    pub async fn accept(self: &Arc<Self>) -> Result<Arc<Reservation>, ActionError> {
        let session = self.session.upgrade().ok_or(ActionError::SessionClosed)?;
        let request = session.api.accept_reservation(&self.sid);
        commit_then_confirm(&session.pending, &self.sid, ActionKind::Accept, request).await?;
        Ok(self.clone())
    }

    /// Reject the reservation, optionally moving the worker to `activity_sid`.
    pub async fn reject(
        self: &Arc<Self>,
        activity_sid: Option<&Sid>,
    ) -> Result<Arc<Reservation>, ActionError> {
        let session = self.session.upgrade().ok_or(ActionError::SessionClosed)?;
        let request = session.api.reject_reservation(&self.sid, activity_sid);
        commit_then_confirm(&session.pending, &self.sid, ActionKind::Reject, request).await?;
        Ok(self.clone())
    }

    /// Apply a status event in place and emit it.
    ///
    /// Task fields carried by the event are merged into the owned task
    /// without emitting task events. Returns `Ok(false)` for a repeat of
    /// the current status.
    pub(crate) fn apply(
        self: &Arc<Self>,
        kind: ReservationEventKind,
        task_payload: &TaskPayload,
    ) -> Result<bool, EntityError> {
        let target = kind.target_status();
        {
            let mut status = self.status.write();
            if *status == target {
                drop(status);
                self.task.refresh(task_payload);
                return Ok(false);
            }
            if !kind.allowed_from(*status) {
                return Err(EntityError::InvalidTransition {
                    kind: EntityKind::Reservation,
                    sid: self.sid.clone(),
                    from: status.to_string(),
                    event: kind.as_str().to_string(),
                });
            }
            *status = target;
        }

        self.task.refresh(task_payload);
        debug!(sid = %self.sid, event = kind.as_str(), "Reservation updated");
        self.emitter.emit(ReservationEvent {
            kind,
            reservation: self.clone(),
        });
        Ok(true)
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("sid", &self.sid)
            .field("status", &self.status())
            .field("task", &self.task)
            .finish()
    }
}
