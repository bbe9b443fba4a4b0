//! Error taxonomy
//!
//! | Error | Raised by | Handling |
//! |-------|-----------|----------|
//! | [`ConnectionError`] | channel manager | reconnect; surfaced after retries are exhausted |
//! | [`EnvelopeError`] | envelope decoder | logged, envelope dropped |
//! | [`EntityError`] | registry / entities | logged, envelope dropped, entity unchanged |
//! | [`ActionError`] | local actions | returned to the caller's future |
//! | [`ApiError`] | REST collaborator | wrapped in [`ActionError::Rejected`] |
//! | [`ConfigError`] | option loading | returned to the binary |
//! | [`WorkerError`] | processing loop | emitted as `WorkerEvent::Error` |
//!
//! Nothing raised while processing an envelope escapes the processing loop.

use std::path::PathBuf;
use std::time::Duration;

use crate::types::{EntityKind, Sid};

/// Transport failed to establish or maintain the channel.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    #[error("Failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("Failed to send frame: {0}")]
    Send(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("No inbound traffic for {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("Channel closed by peer")]
    Closed,

    #[error("Gave up reconnecting after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

/// An inbound envelope could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Envelope is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Envelope {event_type} is missing {field}")]
    MissingField {
        event_type: String,
        field: &'static str,
    },
}

/// An event could not be applied to an entity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntityError {
    #[error("Unknown {kind} {sid}")]
    UnknownEntity { kind: EntityKind, sid: Sid },

    #[error("Invalid transition for {kind} {sid}: {event} while {from}")]
    InvalidTransition {
        kind: EntityKind,
        sid: Sid,
        from: String,
        event: String,
    },
}

/// REST collaborator failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ApiError::Decode(e.to_string())
        } else {
            ApiError::Http(e.to_string())
        }
    }
}

/// A local action (accept, reject, complete, wrap up, activity update)
/// did not reach its corroborating event.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ActionError {
    #[error("Backend rejected the action: {0}")]
    Rejected(#[from] ApiError),

    #[error("Superseded: {kind} {sid} moved to {status}")]
    Superseded {
        kind: EntityKind,
        sid: Sid,
        status: String,
    },

    #[error("Connection lost before the action was confirmed")]
    ConnectionLost,

    #[error("Session is closed")]
    SessionClosed,
}

/// Option loading failure.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Missing required option: {0}")]
    Missing(&'static str),
}

/// Any failure while routing one envelope. Never escapes the processing loop.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Entity(#[from] EntityError),
}

/// Session-level failure reported to worker listeners.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("State sync failed: {0}")]
    Sync(#[from] ApiError),
}
