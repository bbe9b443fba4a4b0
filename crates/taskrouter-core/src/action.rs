//! Pending local actions
//!
//! Local actions never touch entity state. They register a waiter keyed by
//! (sid, action), issue the REST call, and then wait until the processing
//! loop applies the corroborating channel event and resolves the waiter.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{ActionError, ApiError};
use crate::types::Sid;

/// Which corroborating event a waiter is looking for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ActionKind {
    Accept,
    Reject,
    Complete,
    WrapUp,
    /// Keyed by the requested activity sid.
    Activity,
}

type Key = (Sid, ActionKind);
type Reply = oneshot::Sender<Result<(), ActionError>>;

/// A registered waiter. Dropping it without waiting leaves a stale entry
/// that is cleaned up on the next resolve or fail for its key.
pub(crate) struct Waiter {
    key: Key,
    id: u64,
    rx: oneshot::Receiver<Result<(), ActionError>>,
}

impl Waiter {
    pub(crate) async fn wait(self) -> Result<(), ActionError> {
        self.rx.await.unwrap_or(Err(ActionError::SessionClosed))
    }
}

#[derive(Default)]
pub(crate) struct PendingActions {
    waiters: Mutex<HashMap<Key, Vec<(u64, Reply)>>>,
    next_id: AtomicU64,
}

impl PendingActions {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, sid: &Sid, kind: ActionKind) -> Waiter {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = (sid.clone(), kind);
        self.waiters
            .lock()
            .entry(key.clone())
            .or_default()
            .push((id, tx));
        Waiter { key, id, rx }
    }

    /// Drop a waiter whose REST call failed.
    pub(crate) fn cancel(&self, waiter: &Waiter) {
        let mut waiters = self.waiters.lock();
        if let Some(list) = waiters.get_mut(&waiter.key) {
            list.retain(|(id, _)| *id != waiter.id);
            if list.is_empty() {
                waiters.remove(&waiter.key);
            }
        }
    }

    /// Resolve every waiter for (sid, kind). Returns how many were woken.
    pub(crate) fn resolve(&self, sid: &Sid, kind: ActionKind) -> usize {
        self.complete(sid, kind, || Ok(()))
    }

    pub(crate) fn fail(&self, sid: &Sid, kind: ActionKind, err: ActionError) -> usize {
        self.complete(sid, kind, || Err(err.clone()))
    }

    /// Fail every outstanding waiter, e.g. when the session ends.
    pub(crate) fn fail_all(&self, err: ActionError) -> usize {
        let drained: Vec<_> = self.waiters.lock().drain().collect();
        let mut count = 0;
        for (_, list) in drained {
            for (_, tx) in list {
                if tx.send(Err(err.clone())).is_ok() {
                    count += 1;
                }
            }
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.lock().values().map(Vec::len).sum()
    }

    fn complete<F>(&self, sid: &Sid, kind: ActionKind, result: F) -> usize
    where
        F: Fn() -> Result<(), ActionError>,
    {
        let list = self.waiters.lock().remove(&(sid.clone(), kind));
        let Some(list) = list else {
            return 0;
        };
        let mut count = 0;
        for (_, tx) in list {
            if tx.send(result()).is_ok() {
                count += 1;
            }
        }
        if count > 0 {
            debug!(sid = %sid, ?kind, count, "Pending action settled");
        }
        count
    }
}

/// Register, call the backend, then wait for the corroborating event.
///
/// The waiter is registered before the request so an event that overtakes
/// the REST response is never missed.
pub(crate) async fn commit_then_confirm<Fut>(
    pending: &PendingActions,
    sid: &Sid,
    kind: ActionKind,
    request: Fut,
) -> Result<(), ActionError>
where
    Fut: Future<Output = Result<(), ApiError>>,
{
    let waiter = pending.register(sid, kind);
    if let Err(e) = request.await {
        pending.cancel(&waiter);
        return Err(ActionError::Rejected(e));
    }
    waiter.wait().await
}
