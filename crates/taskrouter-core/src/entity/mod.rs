//! Server-authoritative entities mirrored locally
//!
//! - `Task`: a unit of work and its lifecycle
//! - `Reservation`: the binding of one task to this worker

mod reservation;
mod task;

pub use reservation::{Reservation, ReservationEvent, ReservationEventKind, ReservationSnapshot};
pub use task::{Task, TaskEvent, TaskEventKind, TaskSnapshot};
