//! Error types for Conclave.

use thiserror::Error;

use crate::identity::MeetingId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed identifier: {input:?}")]
    MalformedIdentifier { input: String },

    #[error("Unknown recipient: {0}")]
    UnknownRecipient(String),

    #[error("Meeting {meeting} timed out waiting for: {}", missing.join(", "))]
    MeetingTimeout {
        meeting: MeetingId,
        missing: Vec<String>,
    },

    #[error("Meeting {0} has ended")]
    MeetingEnded(MeetingId),

    #[error("Delivery to {recipient} failed: {reason}")]
    Delivery { recipient: String, reason: String },

    #[error("Stream protocol error: {0}")]
    StreamProtocol(String),

    #[error("Queue is closed")]
    QueueClosed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}
