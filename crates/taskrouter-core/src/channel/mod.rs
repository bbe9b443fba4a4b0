//! Signaling channel
//!
//! Owns the persistent connection to the backend and turns it into a single
//! ordered stream of [`ChannelEvent`]s for the worker's processing loop.
//!
//! ```text
//! closed ─► connecting ─► open ─┬─► reconnecting ─► connecting ...
//!                               └─► closed
//! ```

mod backoff;
mod manager;
mod transport;
mod ws;

pub use backoff::Backoff;
pub use manager::{ChannelEvent, ChannelManager, ChannelState};
pub use transport::{Connection, Frame, Transport};
pub use ws::WsTransport;
