//! Transport seam
//!
//! The channel manager only needs to open a connection, send frames and
//! read frames. TLS, framing and the socket itself live behind this trait.

use async_trait::async_trait;

use crate::error::ConnectionError;

/// One unit on the wire, as the channel manager sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// An event envelope (or any application payload)
    Message(Vec<u8>),
    /// Keepalive in either direction
    Heartbeat,
    Close,
}

/// An open connection
#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), ConnectionError>;

    /// Next inbound frame. `None` once the connection is gone.
    async fn next(&mut self) -> Option<Result<Frame, ConnectionError>>;
}

/// Opens connections
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<Box<dyn Connection>, ConnectionError>;
}
