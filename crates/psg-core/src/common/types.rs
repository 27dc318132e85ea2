//! # Shared status and diagnostic types
//!
//! Everything the reply protocol and the dispatcher agree on lives here:
//!
//! - [`Severity`] - diagnostic severity carried in `message` chunks
//! - [`status`] - HTTP-like status codes used for aggregation
//! - [`ErrorCode`] - numeric `code=` values of `message` chunks
//! - [`ProcessorStatus`] - the lifecycle state of a processor instance
//! - [`StartProcessing`] and [`SignalSource`] - dispatcher signal vocabulary

use core::fmt;

/// Diagnostic severity, ordered from least to most severe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Trace,
    Info,
    Warning,
    Error,
    Critical,
    Fatal,
}

impl Severity {
    /// The lowercase literal used in the `severity=` field.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
            Self::Fatal => "fatal",
        }
    }

    /// `Error` and above degrade a processor; anything lower is a message.
    pub const fn is_error(self) -> bool {
        matches!(self, Self::Error | Self::Critical | Self::Fatal)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP-like status codes used in `status=` fields and for request
/// aggregation.
pub mod status {
    pub const OK: u16 = 200;
    pub const BAD_REQUEST: u16 = 400;
    pub const FORBIDDEN: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const CLIENT_CLOSED: u16 = 499;
    pub const INTERNAL: u16 = 500;
    pub const SERVICE_UNAVAILABLE: u16 = 503;
}

/// Values of the `code=` field of message chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    None = 0,
    UnknownSatellite = 300,
    BadUrl = 301,
    NoBioseqInfo = 302,
    BadId2Info = 304,
    UnresolvedSeqId = 305,
    MalformedParameter = 307,
    BlobPropsNotFound = 309,
    UnknownResolvedSatellite = 311,
    BlobChunkNotFound = 312,
    BlobRetrievalIsNotAuthorized = 314,
    UnknownError = 315,
    NoProcessor = 316,
    LmdbError = 317,
    AccVerHistoryNotFound = 318,
    CassandraError = 320,
    OsgError = 321,
    ClientError = 322,
}

impl ErrorCode {
    pub const fn value(self) -> u32 {
        self as u32
    }
}

/// The lifecycle state of a processor instance.
///
/// `InProgress` is the only non-terminal state. Exactly one transition out of
/// it is allowed; see [`crate::processor::ProcessorState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProcessorStatus {
    InProgress = 0,
    Done = 1,
    NotFound = 2,
    Canceled = 3,
    Error = 4,
    Unknown = 5,
}

impl ProcessorStatus {
    pub(crate) const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::InProgress,
            1 => Self::Done,
            2 => Self::NotFound,
            3 => Self::Canceled,
            4 => Self::Error,
            _ => Self::Unknown,
        }
    }

    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }

    /// Maps a finish status to the code used for request aggregation.
    pub const fn to_http_status(self) -> u16 {
        match self {
            Self::Done => status::OK,
            Self::NotFound => status::NOT_FOUND,
            Self::Canceled => status::CLIENT_CLOSED,
            Self::InProgress | Self::Error | Self::Unknown => status::INTERNAL,
        }
    }

    /// Maps an accumulated processor-local status code to a finish status.
    ///
    /// Codes below 500 other than 404 are reported as messages and leave the
    /// processor `Done`.
    pub const fn from_http_status(code: u16) -> Self {
        match code {
            status::NOT_FOUND => Self::NotFound,
            c if c >= status::INTERNAL => Self::Error,
            _ => Self::Done,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in-progress",
            Self::Done => "done",
            Self::NotFound => "not-found",
            Self::Canceled => "canceled",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ProcessorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answer to a processor announcing that it is about to send data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartProcessing {
    Proceed,
    Cancel,
}

/// Who reported that a processor finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalSource {
    Processor,
    Framework,
}

impl SignalSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Processor => "processor",
            Self::Framework => "framework",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering_splits_messages_from_errors() {
        assert!(!Severity::Trace.is_error());
        assert!(!Severity::Warning.is_error());
        assert!(Severity::Error.is_error());
        assert!(Severity::Fatal.is_error());
        assert!(Severity::Warning < Severity::Error);
    }

    #[test]
    fn status_mapping() {
        assert_eq!(ProcessorStatus::Canceled.to_http_status(), 499);
        assert_eq!(ProcessorStatus::NotFound.to_http_status(), 404);
        assert_eq!(ProcessorStatus::Unknown.to_http_status(), 500);
        assert_eq!(ProcessorStatus::Done.to_http_status(), 200);
        assert_eq!(ProcessorStatus::from_http_status(403), ProcessorStatus::Done);
        assert_eq!(ProcessorStatus::from_http_status(404), ProcessorStatus::NotFound);
        assert_eq!(ProcessorStatus::from_http_status(500), ProcessorStatus::Error);
    }

    #[test]
    fn status_round_trips_through_raw() {
        for s in [
            ProcessorStatus::InProgress,
            ProcessorStatus::Done,
            ProcessorStatus::NotFound,
            ProcessorStatus::Canceled,
            ProcessorStatus::Error,
            ProcessorStatus::Unknown,
        ] {
            assert_eq!(ProcessorStatus::from_u8(s as u8), s);
        }
    }
}
