//! Worker Facade
//!
//! Entry point for application code. A [`Worker`] owns one session: the
//! registry, the channel manager and the single processing loop that
//! applies every channel event in arrival order.
//!
//! ```text
//! Transport ─► ChannelManager ─► mpsc ─► processing loop ─► EventRouter ─► entities
//!                                              │                 │
//!                                              └─ fetch_state    └─► WorkerEvent listeners
//! ```

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{error, info, warn};

use crate::action::{commit_then_confirm, ActionKind};
use crate::api::TaskRouterApi;
use crate::channel::{ChannelEvent, ChannelManager, ChannelState, Transport};
use crate::config::WorkerOptions;
use crate::entity::{Reservation, ReservationEventKind, Task};
use crate::error::{ActionError, ConfigError, ConnectionError, WorkerError};
use crate::event::ListenerId;
use crate::router::EventRouter;
use crate::session::Session;
use crate::types::{Activity, Sid};

/// Channel events waiting for the processing loop
const CHANNEL_QUEUE: usize = 1024;

/// Worker-level events
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A reservation entered the active set
    ReservationCreated(Arc<Reservation>),
    /// A reservation status event was applied
    ReservationUpdated {
        reservation: Arc<Reservation>,
        kind: ReservationEventKind,
    },
    /// A reservation left the active set
    ReservationRemoved(Arc<Reservation>),
    ActivityUpdated(Activity),
    /// State is synchronized with the backend (after every connect)
    Ready,
    /// The channel dropped; a reconnect is under way
    Disconnected(ConnectionError),
    Error(WorkerError),
}

/// A connected worker session
pub struct Worker {
    session: Arc<Session>,
    options: WorkerOptions,
    transport: Arc<dyn Transport>,
    channel_state: watch::Receiver<ChannelState>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl Worker {
    /// Create a worker. Nothing connects until [`Worker::start`].
    pub fn new(
        options: WorkerOptions,
        transport: Arc<dyn Transport>,
        api: Arc<dyn TaskRouterApi>,
    ) -> Result<Self, ConfigError> {
        options.validate()?;
        let session = Session::new(Sid::from(options.worker_sid.as_str()), api);
        let (_, channel_state) = watch::channel(ChannelState::Closed);
        Ok(Self {
            session,
            options,
            transport,
            channel_state,
            shutdown_tx: None,
            handles: Vec::new(),
        })
    }

    pub fn sid(&self) -> &Sid {
        &self.session.worker_sid
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Active reservations in insertion order
    pub fn reservations(&self) -> Vec<Arc<Reservation>> {
        self.session.registry.reservations()
    }

    pub fn reservation(&self, sid: &str) -> Option<Arc<Reservation>> {
        self.session.registry.reservation(sid)
    }

    pub fn reservation_count(&self) -> usize {
        self.session.registry.len()
    }

    /// Task owned by an active reservation
    pub fn task(&self, sid: &str) -> Option<Arc<Task>> {
        self.session.registry.task(sid)
    }

    pub fn activity(&self) -> Option<Activity> {
        self.session.activity.read().clone()
    }

    pub fn channel_state(&self) -> ChannelState {
        *self.channel_state.borrow()
    }

    /// Watch channel state transitions
    pub fn watch_channel_state(&self) -> watch::Receiver<ChannelState> {
        self.channel_state.clone()
    }

    /// Whether the channel and the processing loop are both still up.
    /// False once retries are exhausted, even before [`Worker::shutdown`].
    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some() && self.handles.iter().all(|h| !h.is_finished())
    }

    /// Register a callback for worker events. It runs on the processing
    /// loop and must not block.
    pub fn on<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&WorkerEvent) + Send + Sync + 'static,
    {
        self.session.events.on(f)
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<WorkerEvent> {
        self.session.events.subscribe()
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.session.events.off(id)
    }

    /// Connect and start processing. Calling it on a running worker is a
    /// no-op; a worker whose channel failed permanently starts over.
    pub fn start(&mut self) {
        if self.is_running() {
            warn!(worker_sid = %self.sid(), "Worker already started");
            return;
        }
        if let Some(stale) = self.shutdown_tx.take() {
            let _ = stale.send(());
            self.handles.clear();
        }

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_QUEUE);

        let manager = ChannelManager::new(
            self.options.channel_url(),
            self.options.channel_headers(),
            self.options.channel.clone(),
            self.transport.clone(),
        );
        self.channel_state = manager.state();
        self.handles
            .push(tokio::spawn(manager.run(event_tx, shutdown_tx.subscribe())));

        let router = EventRouter::new(self.session.clone(), self.options.removal_grace());
        let connect_activity = self
            .options
            .connect_activity_sid
            .as_deref()
            .map(Sid::from);
        self.handles.push(tokio::spawn(process(
            self.session.clone(),
            router,
            event_rx,
            shutdown_tx.subscribe(),
            connect_activity,
        )));

        self.shutdown_tx = Some(shutdown_tx);
        info!(worker_sid = %self.sid(), url = %self.options.channel_url(), "Worker started");
    }

    /// Move the worker to another activity.
    ///
    /// Resolves once the backend's activity update has been applied.
    pub async fn update_activity(&self, activity_sid: &Sid) -> Result<Activity, ActionError> {
        update_activity(&self.session, activity_sid).await
    }

    /// Close the channel and stop processing. Outstanding actions fail
    /// with [`ActionError::ConnectionLost`].
    pub async fn shutdown(&mut self) {
        let Some(tx) = self.shutdown_tx.take() else {
            return;
        };
        self.session.pending.fail_all(ActionError::ConnectionLost);
        let _ = tx.send(());
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
        info!(worker_sid = %self.sid(), "Worker stopped");
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn update_activity(session: &Session, activity_sid: &Sid) -> Result<Activity, ActionError> {
    if let Some(current) = session.activity.read().clone() {
        if current.sid == *activity_sid {
            return Ok(current);
        }
    }
    let request = session.api.update_worker_activity(activity_sid);
    commit_then_confirm(&session.pending, activity_sid, ActionKind::Activity, request).await?;
    session
        .activity
        .read()
        .clone()
        .ok_or(ActionError::SessionClosed)
}

/// The processing loop. The only place entities are mutated.
async fn process(
    session: Arc<Session>,
    mut router: EventRouter,
    mut events: mpsc::Receiver<ChannelEvent>,
    mut shutdown: broadcast::Receiver<()>,
    connect_activity: Option<Sid>,
) {
    let mut synced = false;

    loop {
        let deadline = router.next_removal_deadline();
        tokio::select! {
            event = events.recv() => match event {
                Some(ChannelEvent::Opened) => {
                    match session.api.fetch_state().await {
                        Ok(snapshot) => {
                            router.resync(snapshot);
                            session.events.emit(WorkerEvent::Ready);
                            if !synced {
                                synced = true;
                                if let Some(activity_sid) = connect_activity.clone() {
                                    let session = session.clone();
                                    tokio::spawn(async move {
                                        if let Err(e) = update_activity(&session, &activity_sid).await {
                                            warn!(activity_sid = %activity_sid, error = %e, "Failed to set connect activity");
                                        }
                                    });
                                }
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "State sync failed, applying incremental events only");
                            session.events.emit(WorkerEvent::Error(WorkerError::Sync(e)));
                        }
                    }
                }
                Some(ChannelEvent::Message(bytes)) => {
                    router.route(&bytes);
                }
                Some(ChannelEvent::Closed(e)) => {
                    session.events.emit(WorkerEvent::Disconnected(e));
                }
                Some(ChannelEvent::Fatal(e)) => {
                    error!(error = %e, "Signaling channel failed permanently");
                    session.pending.fail_all(ActionError::ConnectionLost);
                    session.events.emit(WorkerEvent::Error(WorkerError::Connection(e)));
                    break;
                }
                None => break,
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                router.sweep_expired(Instant::now());
            }
            _ = shutdown.recv() => break,
        }
    }

    session.pending.fail_all(ActionError::SessionClosed);
    info!(worker_sid = %session.worker_sid, "Processing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockApi;

    fn options() -> WorkerOptions {
        WorkerOptions {
            worker_sid: "WK1".into(),
            account_sid: "AC1".into(),
            ws_server: "ws://localhost/{accountSid}/{workerSid}".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_new_validates_options() {
        let result = Worker::new(
            WorkerOptions::default(),
            Arc::new(crate::channel::WsTransport::new()),
            Arc::new(MockApi::default()),
        );
        assert!(matches!(result, Err(ConfigError::Missing("worker_sid"))));
    }

    #[tokio::test]
    async fn test_idle_worker() {
        let mut worker = Worker::new(
            options(),
            Arc::new(crate::channel::WsTransport::new()),
            Arc::new(MockApi::default()),
        )
        .unwrap();

        assert_eq!(worker.sid().as_str(), "WK1");
        assert_eq!(worker.reservation_count(), 0);
        assert!(worker.activity().is_none());
        assert_eq!(worker.channel_state(), ChannelState::Closed);
        assert!(!worker.is_running());
        // Shutdown before start is a no-op.
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_update_activity_to_current_is_immediate() {
        let api = Arc::new(MockApi::default());
        let worker = Worker::new(options(), Arc::new(crate::channel::WsTransport::new()), api.clone()).unwrap();
        let idle = Activity {
            sid: Sid::from("WA1"),
            name: "Idle".into(),
            available: true,
        };
        *worker.session.activity.write() = Some(idle.clone());

        assert_eq!(worker.update_activity(&Sid::from("WA1")).await.unwrap(), idle);
        assert!(api.calls.lock().is_empty());
    }
}
