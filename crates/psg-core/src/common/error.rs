//! Error types for the request dispatch engine.
//!
//! This module defines the central `Error` enum. Errors of this type never
//! reach the client directly: processors turn them into protocol message
//! chunks, and the HTTP layer maps the few that escape dispatch into status
//! codes.
//!
//! ## Error Cases
//! - `ChannelError`: A transport or connection failure. OSG calls retry on it.
//! - `InvalidRequest`: The client request was malformed.
//! - `ServiceShutdown`: A request arrived while the service was shutting down.
//! - `Canceled`: The processor was canceled while work was in flight.
//! - `Backend`: A backend reported a failed command.
//! - `LogicError`: An internal protocol invariant was violated.
//! - `BadId2Info`: An id2_info value could not be parsed.
//! - `NotOwningThread`: A loop queue was drained from a foreign thread.

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the dispatch engine.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// Connection or channel failure (e.g., a dropped socket or closed
    /// channel).
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// The client request was invalid.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,

    /// The work was abandoned because the processor was canceled.
    #[error("Processing canceled")]
    Canceled,

    /// The backend accepted the request but failed to execute it.
    #[error("Backend error: {message}")]
    Backend { message: String },

    /// An internal invariant was violated, e.g. a reply serial number outside
    /// of the request batch.
    #[error("Logic error: {message}")]
    LogicError { message: String },

    /// The id2_info string of a blob is malformed.
    #[error("Bad id2_info '{value}': {reason}")]
    BadId2Info { value: String, reason: String },

    /// A loop binder queue was drained from a thread that does not own it.
    #[error("Loop queue accessed from a thread that does not own it")]
    NotOwningThread,
}

impl Error {
    /// Whether a retry on a fresh connection may succeed.
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::ChannelError { .. })
    }
}
