//! Entity Registry
//!
//! One live instance per sid per session. Only the processing loop writes;
//! the maps are behind a lock so application code can read at any time.
//! The lock is never held while an entity applies an event or emits.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::entity::{Reservation, ReservationEventKind, Task, TaskEventKind};
use crate::error::EntityError;
use crate::session::Session;
use crate::types::{EntityKind, ReservationStatus, Sid, TaskPayload};

#[derive(Default)]
struct RegistryInner {
    tasks: HashMap<Sid, Arc<Task>>,
    reservations: HashMap<Sid, Arc<Reservation>>,
    /// Reservation insertion order
    order: Vec<Sid>,
}

/// Sid → instance maps for tasks and reservations
#[derive(Default)]
pub struct EntityRegistry {
    inner: RwLock<RegistryInner>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing reservation for `sid`, or a new one owning the task
    /// described by `task_payload` (itself looked up or created).
    pub(crate) fn get_or_create_reservation(
        &self,
        sid: &Sid,
        status: ReservationStatus,
        task_sid: &Sid,
        task_payload: &TaskPayload,
        session: Weak<Session>,
    ) -> (Arc<Reservation>, bool) {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.reservations.get(sid) {
            return (existing.clone(), false);
        }

        let (task, created) = Self::task_entry(&mut inner, task_sid, task_payload, session.clone());
        if !created {
            task.refresh(task_payload);
        }
        let reservation = Reservation::new(sid.clone(), status, task, session);
        inner.reservations.insert(sid.clone(), reservation.clone());
        inner.order.push(sid.clone());
        debug!(sid = %sid, task_sid = %task_sid, "Reservation registered");
        (reservation, true)
    }

    pub fn task(&self, sid: &str) -> Option<Arc<Task>> {
        self.inner.read().tasks.get(sid).cloned()
    }

    pub fn reservation(&self, sid: &str) -> Option<Arc<Reservation>> {
        self.inner.read().reservations.get(sid).cloned()
    }

    /// Active reservations in insertion order
    pub fn reservations(&self) -> Vec<Arc<Reservation>> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|sid| inner.reservations.get(sid).cloned())
            .collect()
    }

    /// Active reservations owning the task `task_sid`
    pub fn reservations_for_task(&self, task_sid: &Sid) -> Vec<Arc<Reservation>> {
        self.reservations()
            .into_iter()
            .filter(|r| r.task().sid() == task_sid)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().reservations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn task_count(&self) -> usize {
        self.inner.read().tasks.len()
    }

    /// Apply a task event to the registered instance.
    pub(crate) fn apply_task(
        &self,
        sid: &Sid,
        kind: TaskEventKind,
        payload: &TaskPayload,
    ) -> Result<(Arc<Task>, bool), EntityError> {
        let task = self.task(sid.as_str()).ok_or_else(|| EntityError::UnknownEntity {
            kind: EntityKind::Task,
            sid: sid.clone(),
        })?;
        let changed = task.apply(kind, payload)?;
        Ok((task, changed))
    }

    /// Apply a reservation event to the registered instance.
    pub(crate) fn apply_reservation(
        &self,
        sid: &Sid,
        kind: ReservationEventKind,
        task_payload: &TaskPayload,
    ) -> Result<(Arc<Reservation>, bool), EntityError> {
        let reservation =
            self.reservation(sid.as_str())
                .ok_or_else(|| EntityError::UnknownEntity {
                    kind: EntityKind::Reservation,
                    sid: sid.clone(),
                })?;
        let changed = reservation.apply(kind, task_payload)?;
        Ok((reservation, changed))
    }

    /// Drop a reservation from the active set. Its task leaves the index
    /// once no remaining reservation owns it; existing `Arc`s stay valid.
    pub(crate) fn remove_reservation(&self, sid: &Sid) -> Option<Arc<Reservation>> {
        let mut inner = self.inner.write();
        let removed = inner.reservations.remove(sid)?;
        inner.order.retain(|s| s != sid);

        let task_sid = removed.task().sid();
        let still_owned = inner
            .reservations
            .values()
            .any(|r| r.task().sid() == task_sid);
        if !still_owned {
            inner.tasks.remove(task_sid);
        }
        debug!(sid = %sid, "Reservation unregistered");
        Some(removed)
    }

    fn task_entry(
        inner: &mut RegistryInner,
        sid: &Sid,
        payload: &TaskPayload,
        session: Weak<Session>,
    ) -> (Arc<Task>, bool) {
        if let Some(existing) = inner.tasks.get(sid) {
            return (existing.clone(), false);
        }
        let task = Task::new(sid.clone(), payload, session);
        inner.tasks.insert(sid.clone(), task.clone());
        (task, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskStatus;
    use serde_json::json;

    fn task_payload(lang: &str) -> TaskPayload {
        TaskPayload {
            status: Some(TaskStatus::Reserved),
            attributes: json!({ "selected_language": lang }).as_object().cloned(),
            ..Default::default()
        }
    }

    fn register(registry: &EntityRegistry, sid: &str, task_sid: &str) -> (Arc<Reservation>, bool) {
        registry.get_or_create_reservation(
            &Sid::from(sid),
            ReservationStatus::Pending,
            &Sid::from(task_sid),
            &task_payload("es"),
            Weak::new(),
        )
    }

    #[test]
    fn test_get_or_create_returns_same_instance() {
        let registry = EntityRegistry::new();
        let (first, created) = register(&registry, "WR1", "WT1");
        assert!(created);
        let (second, created) = register(&registry, "WR1", "WT1");
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_apply_mutates_in_place() {
        let registry = EntityRegistry::new();
        let (reservation, _) = register(&registry, "WR1", "WT1");
        let held = reservation.task().clone();

        let (task, changed) = registry
            .apply_task(&Sid::from("WT1"), TaskEventKind::Updated, &task_payload("en"))
            .unwrap();

        assert!(changed);
        assert!(Arc::ptr_eq(&task, &held));
        assert!(Arc::ptr_eq(&registry.task("WT1").unwrap(), reservation.task()));
        assert_eq!(held.attribute("selected_language"), Some(json!("en")));
    }

    #[test]
    fn test_apply_unknown_sid() {
        let registry = EntityRegistry::new();
        let err = registry
            .apply_task(&Sid::from("WT9"), TaskEventKind::Canceled, &TaskPayload::default())
            .unwrap_err();
        assert_eq!(
            err,
            EntityError::UnknownEntity {
                kind: EntityKind::Task,
                sid: Sid::from("WT9")
            }
        );
        assert!(registry
            .apply_reservation(&Sid::from("WR9"), ReservationEventKind::Accepted, &TaskPayload::default())
            .is_err());
    }

    #[test]
    fn test_insertion_order_and_removal() {
        let registry = EntityRegistry::new();
        register(&registry, "WR2", "WT2");
        register(&registry, "WR1", "WT1");
        register(&registry, "WR3", "WT1");

        let sids: Vec<_> = registry.reservations().iter().map(|r| r.sid().to_string()).collect();
        assert_eq!(sids, vec!["WR2", "WR1", "WR3"]);
        assert_eq!(registry.task_count(), 2);

        let removed = registry.remove_reservation(&Sid::from("WR1")).unwrap();
        // WT1 is still owned by WR3
        assert!(registry.task("WT1").is_some());
        registry.remove_reservation(&Sid::from("WR3"));
        assert!(registry.task("WT1").is_none());
        // The removed reservation still reaches its task
        assert_eq!(removed.task().sid().as_str(), "WT1");
        assert_eq!(registry.len(), 1);
    }
}
