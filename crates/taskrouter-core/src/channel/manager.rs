//! Channel Manager
//!
//! Connects, keeps the connection alive, reconnects with backoff, and
//! forwards every inbound message in arrival order.

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::transport::{Connection, Frame, Transport};
use crate::config::ChannelOptions;
use crate::error::ConnectionError;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Connecting,
    Open,
    Reconnecting,
}

/// What the manager hands to the processing loop
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A connection is open; state must be resynchronized before the
    /// messages that follow are applied.
    Opened,
    Message(Vec<u8>),
    /// The connection dropped; a reconnect is scheduled.
    Closed(ConnectionError),
    /// Retries exhausted; the manager has stopped.
    Fatal(ConnectionError),
}

enum PumpExit {
    Lost(ConnectionError),
    ConsumerGone,
}

/// Owns one logical channel for a worker session
pub struct ChannelManager {
    url: String,
    headers: Vec<(String, String)>,
    options: ChannelOptions,
    transport: Arc<dyn Transport>,
    state_tx: watch::Sender<ChannelState>,
}

impl ChannelManager {
    pub fn new(
        url: String,
        headers: Vec<(String, String)>,
        options: ChannelOptions,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Closed);
        Self {
            url,
            headers,
            options,
            transport,
            state_tx,
        }
    }

    /// Watch state transitions
    pub fn state(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    /// Run until shutdown, retries are exhausted, or `events` is dropped.
    pub async fn run(
        self,
        events: mpsc::Sender<ChannelEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut backoff = Backoff::new(self.options.initial_backoff(), self.options.max_backoff());
        // Failed connects since the last open; a dropped connection is not one.
        let mut failures: u32 = 0;
        self.set_state(ChannelState::Connecting);

        loop {
            let connected = tokio::select! {
                r = self.transport.connect(&self.url, &self.headers) => r,
                _ = shutdown.recv() => break,
            };

            match connected {
                Ok(mut conn) => {
                    backoff.reset();
                    failures = 0;
                    self.set_state(ChannelState::Open);
                    info!(url = %self.url, "Signaling channel open");
                    if events.send(ChannelEvent::Opened).await.is_err() {
                        break;
                    }

                    let exit = tokio::select! {
                        exit = Self::pump(conn.as_mut(), &events, &self.options) => exit,
                        _ = shutdown.recv() => {
                            let _ = conn.send(Frame::Close).await;
                            break;
                        }
                    };
                    match exit {
                        PumpExit::ConsumerGone => break,
                        PumpExit::Lost(err) => {
                            warn!(error = %err, "Signaling channel lost, reconnecting...");
                            if events.send(ChannelEvent::Closed(err)).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    warn!(error = %err, attempt = failures, "Signaling channel connect failed");
                    if let Some(max) = self.options.max_reconnect_attempts {
                        if failures >= max {
                            error!(attempts = failures, last_error = %err, "Giving up on signaling channel");
                            let _ = events
                                .send(ChannelEvent::Fatal(ConnectionError::RetriesExhausted {
                                    attempts: failures,
                                }))
                                .await;
                            break;
                        }
                    }
                }
            }

            let delay = backoff.next_delay();
            self.set_state(ChannelState::Reconnecting);
            debug!(?delay, "Waiting before reconnect");
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.recv() => break,
            }
        }

        self.set_state(ChannelState::Closed);
        info!("Signaling channel closed");
    }

    /// Forward inbound frames and send heartbeats until the connection is lost.
    async fn pump(
        conn: &mut dyn Connection,
        events: &mpsc::Sender<ChannelEvent>,
        options: &ChannelOptions,
    ) -> PumpExit {
        let timeout = options.heartbeat_timeout();
        let mut heartbeat = interval(options.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        heartbeat.tick().await;
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                frame = conn.next() => match frame {
                    Some(Ok(Frame::Message(bytes))) => {
                        last_inbound = Instant::now();
                        if events.send(ChannelEvent::Message(bytes)).await.is_err() {
                            return PumpExit::ConsumerGone;
                        }
                    }
                    Some(Ok(Frame::Heartbeat)) => last_inbound = Instant::now(),
                    Some(Ok(Frame::Close)) | None => return PumpExit::Lost(ConnectionError::Closed),
                    Some(Err(e)) => return PumpExit::Lost(e),
                },
                _ = heartbeat.tick() => {
                    if let Err(e) = conn.send(Frame::Heartbeat).await {
                        return PumpExit::Lost(e);
                    }
                }
                _ = sleep_until(last_inbound + timeout) => {
                    return PumpExit::Lost(ConnectionError::HeartbeatTimeout(timeout));
                }
            }
        }
    }

    fn set_state(&self, state: ChannelState) {
        self.state_tx.send_replace(state);
    }
}
