//! Event Envelope Router
//!
//! Decodes channel messages, finds (or creates) the target entity, applies
//! the event and settles whatever depends on it: pending local actions,
//! worker-level events and reservation removal.
//!
//! Envelopes are applied in arrival order. A failure affects only the
//! envelope that caused it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::action::ActionKind;
use crate::entity::{Reservation, ReservationEventKind, Task, TaskEventKind};
use crate::envelope::{Envelope, EventKind};
use crate::error::{ActionError, EnvelopeError, RouteError};
use crate::session::Session;
use crate::types::{
    Activity, EntityKind, ReservationPayload, ReservationStatus, Sid, StateSnapshot, TaskPayload,
    TaskStatus,
};
use crate::worker::WorkerEvent;

/// What happened to one envelope
#[derive(Debug)]
pub enum RouteOutcome {
    Applied,
    /// Valid, but the entity already had this state
    Unchanged,
    /// Sequence already applied for this sid and event type
    Duplicate,
    /// Heartbeat or unknown event type
    Ignored,
    Dropped(RouteError),
}

impl RouteOutcome {
    fn from_result(result: Result<bool, RouteError>) -> Self {
        match result {
            Ok(true) => RouteOutcome::Applied,
            Ok(false) => RouteOutcome::Unchanged,
            Err(e) => RouteOutcome::Dropped(e),
        }
    }
}

pub(crate) struct EventRouter {
    session: Arc<Session>,
    /// Highest sequence applied per (sid, event type) on this connection
    sequences: HashMap<(Sid, String), u64>,
    /// Terminal reservations waiting for their task's terminal event
    removals: HashMap<Sid, Instant>,
    removal_grace: Duration,
}

impl EventRouter {
    pub(crate) fn new(session: Arc<Session>, removal_grace: Duration) -> Self {
        Self {
            session,
            sequences: HashMap::new(),
            removals: HashMap::new(),
            removal_grace,
        }
    }

    /// Decode and apply one raw envelope.
    pub(crate) fn route(&mut self, raw: &[u8]) -> RouteOutcome {
        match Envelope::decode(raw) {
            Ok(envelope) => self.route_envelope(envelope),
            Err(e) => {
                warn!(error = %e, "Dropping undecodable envelope");
                RouteOutcome::Dropped(e.into())
            }
        }
    }

    pub(crate) fn route_envelope(&mut self, envelope: Envelope) -> RouteOutcome {
        match &envelope.kind {
            EventKind::Heartbeat => return RouteOutcome::Ignored,
            EventKind::Unknown(event_type) => {
                warn!(event_type = %event_type, "Ignoring unknown event type");
                return RouteOutcome::Ignored;
            }
            _ => {}
        }

        let sid = match envelope.target_sid() {
            Ok(sid) => sid.clone(),
            Err(e) => {
                warn!(event_type = %envelope.event_type, error = %e, "Dropping envelope");
                return RouteOutcome::Dropped(e.into());
            }
        };

        let seq_key = (sid, envelope.event_type.clone());
        if let Some(seq) = envelope.sequence {
            if self.sequences.get(&seq_key).is_some_and(|last| *last >= seq) {
                debug!(sid = %seq_key.0, event_type = %seq_key.1, sequence = seq, "Duplicate envelope");
                return RouteOutcome::Duplicate;
            }
        }

        let result = match &envelope.kind {
            EventKind::Reservation(ReservationEventKind::Created) => {
                self.on_reservation_created(&envelope)
            }
            EventKind::Reservation(kind) => self.on_reservation_event(&envelope, *kind),
            EventKind::Task(kind) => self.on_task_event(&envelope, *kind),
            EventKind::ActivityUpdated => envelope
                .activity()
                .map(|activity| self.set_activity(activity))
                .map_err(RouteError::from),
            EventKind::Heartbeat | EventKind::Unknown(_) => Ok(false),
        };

        match &result {
            Ok(_) => {
                if let Some(seq) = envelope.sequence {
                    self.sequences.insert(seq_key, seq);
                }
            }
            Err(e) => {
                warn!(event_type = %envelope.event_type, sid = %seq_key.0, error = %e, "Dropping envelope");
            }
        }
        RouteOutcome::from_result(result)
    }

    fn on_reservation_created(&mut self, envelope: &Envelope) -> Result<bool, RouteError> {
        let sid = envelope.target_sid()?.clone();
        let task_sid = envelope.task_sid()?;
        let status = envelope
            .data
            .reservation_status
            .unwrap_or(ReservationStatus::Pending);
        let payload = envelope.data.task_payload(false);

        let (reservation, created) = self.session.registry.get_or_create_reservation(
            &sid,
            status,
            &task_sid,
            &payload,
            Arc::downgrade(&self.session),
        );
        if !created {
            return Ok(reservation.task().refresh(&payload));
        }

        info!(sid = %sid, task_sid = %task_sid, status = %status, "Reservation created");
        self.session
            .events
            .emit(WorkerEvent::ReservationCreated(reservation.clone()));
        self.settle_reservation(&reservation);
        Ok(true)
    }

    fn on_reservation_event(
        &mut self,
        envelope: &Envelope,
        kind: ReservationEventKind,
    ) -> Result<bool, RouteError> {
        let sid = envelope.target_sid()?;
        let payload = envelope.data.task_payload(false);
        let (reservation, changed) = self
            .session
            .registry
            .apply_reservation(sid, kind, &payload)?;

        if changed {
            info!(sid = %sid, event = kind.as_str(), "Reservation event applied");
            self.session.events.emit(WorkerEvent::ReservationUpdated {
                reservation: reservation.clone(),
                kind,
            });
        }
        self.settle_reservation(&reservation);
        Ok(changed)
    }

    fn on_task_event(&mut self, envelope: &Envelope, kind: TaskEventKind) -> Result<bool, RouteError> {
        let sid = envelope.target_sid()?;
        let payload = envelope.data.task_payload(true);
        let (task, changed) = self.session.registry.apply_task(sid, kind, &payload)?;

        if changed {
            info!(sid = %sid, event = kind.as_str(), status = %task.status(), "Task event applied");
        }
        self.settle_task(&task);
        Ok(changed)
    }

    /// Replace the current activity. Returns whether it changed.
    fn set_activity(&mut self, activity: Activity) -> bool {
        let changed = {
            let mut current = self.session.activity.write();
            if current.as_ref() == Some(&activity) {
                false
            } else {
                *current = Some(activity.clone());
                true
            }
        };
        self.session
            .pending
            .resolve(&activity.sid, ActionKind::Activity);
        if changed {
            info!(activity_sid = %activity.sid, name = %activity.name, available = activity.available, "Activity updated");
            self.session.events.emit(WorkerEvent::ActivityUpdated(activity));
        }
        changed
    }

    /// Settle accept/reject waiters and the removal policy for the
    /// reservation's current status.
    fn settle_reservation(&mut self, reservation: &Arc<Reservation>) {
        let sid = reservation.sid();
        let status = reservation.status();
        let pending = &self.session.pending;
        let superseded = || ActionError::Superseded {
            kind: EntityKind::Reservation,
            sid: sid.clone(),
            status: status.to_string(),
        };

        match status {
            ReservationStatus::Pending => {}
            ReservationStatus::Accepted
            | ReservationStatus::Wrapping
            | ReservationStatus::Completed => {
                pending.resolve(sid, ActionKind::Accept);
                pending.fail(sid, ActionKind::Reject, superseded());
            }
            ReservationStatus::Rejected => {
                pending.resolve(sid, ActionKind::Reject);
                pending.fail(sid, ActionKind::Accept, superseded());
            }
            ReservationStatus::Timeout
            | ReservationStatus::Canceled
            | ReservationStatus::Rescinded => {
                pending.fail(sid, ActionKind::Accept, superseded());
                pending.fail(sid, ActionKind::Reject, superseded());
            }
        }

        if !status.is_terminal() {
            return;
        }
        let task_done = reservation.task().status().is_terminal();
        if self.removal_grace.is_zero() || !status.expects_task_terminal() || task_done {
            self.remove(sid);
        } else if !self.removals.contains_key(sid) {
            debug!(sid = %sid, grace = ?self.removal_grace, "Reservation removal deferred");
            self.removals
                .insert(sid.clone(), Instant::now() + self.removal_grace);
        }
    }

    /// Settle complete/wrapup waiters; a terminal task releases its
    /// terminal reservations.
    fn settle_task(&mut self, task: &Arc<Task>) {
        let sid = task.sid();
        let status = task.status();
        let pending = &self.session.pending;
        let superseded = || ActionError::Superseded {
            kind: EntityKind::Task,
            sid: sid.clone(),
            status: status.to_string(),
        };

        match status {
            TaskStatus::Wrapping => {
                pending.resolve(sid, ActionKind::WrapUp);
            }
            TaskStatus::Completed => {
                pending.resolve(sid, ActionKind::Complete);
                pending.fail(sid, ActionKind::WrapUp, superseded());
            }
            TaskStatus::Canceled => {
                pending.fail(sid, ActionKind::Complete, superseded());
                pending.fail(sid, ActionKind::WrapUp, superseded());
            }
            TaskStatus::Pending | TaskStatus::Reserved | TaskStatus::Assigned => {}
        }

        if !status.is_terminal() {
            return;
        }
        for reservation in self.session.registry.reservations_for_task(sid) {
            if reservation.status().is_terminal() {
                self.remove(reservation.sid());
            }
        }
    }

    fn remove(&mut self, sid: &Sid) {
        self.removals.remove(sid);
        if let Some(reservation) = self.session.registry.remove_reservation(sid) {
            let task_sid = reservation.task().sid();
            let task_gone = self.session.registry.task(task_sid.as_str()).is_none();
            self.sequences
                .retain(|(key, _), _| key != sid && !(task_gone && key == task_sid));
            info!(sid = %sid, status = %reservation.status(), "Reservation removed");
            self.session
                .events
                .emit(WorkerEvent::ReservationRemoved(reservation));
        }
    }

    /// Remove reservations whose grace period has elapsed.
    pub(crate) fn sweep_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<Sid> = self
            .removals
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(sid, _)| sid.clone())
            .collect();
        for sid in &expired {
            debug!(sid = %sid, "Removal grace elapsed");
            self.remove(sid);
        }
        expired.len()
    }

    pub(crate) fn next_removal_deadline(&self) -> Option<Instant> {
        self.removals.values().min().copied()
    }

    /// Reconcile local state with a full snapshot fetched after the
    /// channel (re)opened.
    ///
    /// Entities whose state already matches emit nothing. Reservations the
    /// backend no longer reports are removed. Returns the number of
    /// reservations that changed.
    pub(crate) fn resync(&mut self, snapshot: StateSnapshot) -> usize {
        self.sequences.clear();
        if let Some(activity) = snapshot.activity {
            self.set_activity(activity);
        }

        let mut seen = HashSet::new();
        let mut changed = 0;
        for payload in snapshot.reservations {
            seen.insert(payload.sid.clone());
            match self.resync_reservation(&payload) {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(e) => warn!(sid = %payload.sid, error = %e, "Resync skipped reservation"),
            }
        }

        for reservation in self.session.registry.reservations() {
            if !seen.contains(reservation.sid()) {
                debug!(sid = %reservation.sid(), "Reservation missing from snapshot");
                self.remove(reservation.sid());
                changed += 1;
            }
        }

        info!(
            reservations = self.session.registry.len(),
            changed, "State resynchronized"
        );
        changed
    }

    fn resync_reservation(&mut self, payload: &ReservationPayload) -> Result<bool, RouteError> {
        let Some(existing) = self.session.registry.reservation(payload.sid.as_str()) else {
            let task_sid = payload.task.sid.clone().ok_or(EnvelopeError::MissingField {
                event_type: "snapshot".to_string(),
                field: "task_sid",
            })?;
            let (reservation, _) = self.session.registry.get_or_create_reservation(
                &payload.sid,
                payload.status,
                &task_sid,
                &payload.task,
                Arc::downgrade(&self.session),
            );
            self.session
                .events
                .emit(WorkerEvent::ReservationCreated(reservation.clone()));
            self.settle_reservation(&reservation);
            return Ok(true);
        };

        let task_changed = self.resync_task(existing.task(), &payload.task)?;

        let mut status_changed = false;
        for kind in catch_up(existing.status(), payload.status) {
            let (_, applied) = self
                .session
                .registry
                .apply_reservation(existing.sid(), kind, &payload.task)?;
            if applied {
                status_changed = true;
                self.session.events.emit(WorkerEvent::ReservationUpdated {
                    reservation: existing.clone(),
                    kind,
                });
            }
        }
        self.settle_reservation(&existing);
        Ok(task_changed || status_changed)
    }

    fn resync_task(&mut self, task: &Arc<Task>, payload: &TaskPayload) -> Result<bool, RouteError> {
        let lifecycle = payload
            .status
            .filter(|status| *status != task.status())
            .and_then(TaskEventKind::for_status);

        let changed = match lifecycle {
            Some(kind) => self
                .session
                .registry
                .apply_task(task.sid(), kind, payload)?
                .1,
            None => {
                let updated = task.reconcile(payload)?;
                task.refresh(payload) || updated
            }
        };
        self.settle_task(task);
        Ok(changed)
    }
}

/// Reservation events that move `from` to `to`. A pending reservation the
/// backend already reports as wrapping or completed is accepted first.
fn catch_up(from: ReservationStatus, to: ReservationStatus) -> Vec<ReservationEventKind> {
    if from == to {
        return Vec::new();
    }
    let target = ReservationEventKind::for_status(to);
    match (from, to) {
        (ReservationStatus::Pending, ReservationStatus::Wrapping)
        | (ReservationStatus::Pending, ReservationStatus::Completed) => {
            vec![ReservationEventKind::Accepted, target]
        }
        _ => vec![target],
    }
}
