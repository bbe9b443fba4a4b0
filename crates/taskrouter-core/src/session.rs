//! Worker session
//!
//! Everything one connected worker shares between its facade, its router
//! and its entities. Entities only hold a `Weak` to it.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::action::PendingActions;
use crate::api::TaskRouterApi;
use crate::event::Emitter;
use crate::registry::EntityRegistry;
use crate::types::{Activity, Sid};
use crate::worker::WorkerEvent;

pub(crate) struct Session {
    pub(crate) worker_sid: Sid,
    pub(crate) api: Arc<dyn TaskRouterApi>,
    pub(crate) pending: PendingActions,
    pub(crate) registry: EntityRegistry,
    pub(crate) activity: RwLock<Option<Activity>>,
    pub(crate) events: Emitter<WorkerEvent>,
}

impl Session {
    pub(crate) fn new(worker_sid: Sid, api: Arc<dyn TaskRouterApi>) -> Arc<Self> {
        Arc::new(Self {
            worker_sid,
            api,
            pending: PendingActions::new(),
            registry: EntityRegistry::new(),
            activity: RwLock::new(None),
            events: Emitter::new(),
        })
    }
}
