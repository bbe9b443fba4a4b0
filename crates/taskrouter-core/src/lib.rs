//! taskrouter-core - worker-side synchronization engine
//!
//! Keeps a local mirror of a worker, its reservations and their tasks in
//! sync with a task-routing backend over a persistent signaling channel.
//! Entities are shared as `Arc`s and mutated in place, so a reference taken
//! before an update always observes it.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use taskrouter_core::{HttpApi, Worker, WorkerEvent, WorkerOptions, WsTransport};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut options = WorkerOptions::load(&WorkerOptions::default_path())?;
//!     options.apply_env();
//!
//!     let api = Arc::new(HttpApi::new(&options)?);
//!     let mut worker = Worker::new(options, Arc::new(WsTransport::new()), api)?;
//!     let mut events = worker.subscribe();
//!     worker.start();
//!
//!     while let Some(event) = events.recv().await {
//!         if let WorkerEvent::ReservationCreated(reservation) = event {
//!             reservation.accept().await?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

mod action;
pub mod api;
pub mod channel;
pub mod config;
pub mod entity;
pub mod envelope;
pub mod error;
pub mod event;
pub mod registry;
pub mod router;
mod session;
pub mod types;
pub mod worker;

#[cfg(test)]
mod testing;

pub use api::{HttpApi, TaskRouterApi};
pub use channel::{ChannelState, Connection, Frame, Transport, WsTransport};
pub use config::{ChannelOptions, WorkerOptions};
pub use entity::{
    Reservation, ReservationEvent, ReservationEventKind, ReservationSnapshot, Task, TaskEvent,
    TaskEventKind, TaskSnapshot,
};
pub use error::{
    ActionError, ApiError, ConfigError, ConnectionError, EntityError, EnvelopeError, RouteError,
    WorkerError,
};
pub use event::{Emitter, ListenerId};
pub use router::RouteOutcome;
pub use types::{
    Activity, Attributes, EntityKind, ReservationPayload, ReservationStatus, Sid, StateSnapshot,
    TaskPayload, TaskStatus,
};
pub use worker::{Worker, WorkerEvent};
