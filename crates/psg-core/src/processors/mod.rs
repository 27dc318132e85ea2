//! Backend processors.
//!
//! | Module | Serves |
//! |--------|--------|
//! | [`cass`] | resolve, get, getblob, get_tse_chunk, get_na, get_acc_ver_history |
//! | [`osg`] | resolve and getblob through the OSG/ID2 remote protocol |
//! | [`cdd`] | `CDD` named annotations |
//! | [`snp`] | `SNP*` named annotations |
//! | [`wgs`] | resolve and get for WGS accessions |
//! | [`dummy`] | anything, producing nothing |

use crate::common::{ProcessorStatus, StartProcessing, status};
use crate::processor::ProcessorContext;
use parking_lot::Mutex;
use portable_atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;

pub mod cass;
pub mod cdd;
pub mod dummy;
pub mod osg;
pub mod snp;
pub mod wgs;

/// Asks the dispatcher for the right to send, once per processor.
#[derive(Debug, Default)]
pub(crate) struct StartGate(OnceLock<StartProcessing>);

impl StartGate {
    /// `true` when the processor may write to the reply.
    pub(crate) fn admit(&self, ctx: &ProcessorContext) -> bool {
        *self.0.get_or_init(|| ctx.signal_start_processing()) == StartProcessing::Proceed
    }
}

/// The worst status code a processor has hit so far.
#[derive(Debug)]
pub(crate) struct LocalStatus(AtomicU16);

impl LocalStatus {
    pub(crate) const fn new() -> Self {
        Self(AtomicU16::new(status::OK))
    }

    pub(crate) fn raise(&self, code: u16) {
        self.0.fetch_max(code, Ordering::AcqRel);
    }

    pub(crate) fn get(&self) -> u16 {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn finish_status(&self) -> ProcessorStatus {
        ProcessorStatus::from_http_status(self.get())
    }
}

/// Encodes `value` as a JSON item payload. A failure is logged, raises the
/// processor status to 500 and yields `None`.
pub(crate) fn to_json<T: serde::Serialize>(value: &T, local: &LocalStatus, what: &str) -> Option<Vec<u8>> {
    match serde_json::to_vec(value) {
        Ok(content) => Some(content),
        Err(_e) => {
            #[cfg(feature = "tracing")]
            tracing::error!("Cannot serialize {what}: {_e}");
            #[cfg(not(feature = "tracing"))]
            let _ = what;
            local.raise(status::INTERNAL);
            None
        }
    }
}

/// Named annotations a processor should send: those it claims with a priority
/// higher than every earlier claimant.
pub(crate) fn claim(ctx: &ProcessorContext, name: &str) -> bool {
    ctx.request().claim_resource(name, ctx.priority()) < ctx.priority()
}

#[derive(Debug, Default)]
struct BackgroundState {
    running: bool,
    canceled: bool,
}

/// Tracks a fetch running on a detached thread so that exactly one of
/// `cancel` and the fetch completion reports the finish.
#[derive(Debug, Default)]
pub(crate) struct Background(Mutex<BackgroundState>);

impl Background {
    /// Refuses when the processor was already canceled.
    pub(crate) fn start(&self) -> bool {
        let mut state = self.0.lock();
        if state.canceled {
            return false;
        }
        state.running = true;
        true
    }

    /// Returns `true` when a cancel arrived while the fetch was running; the
    /// finish signal is then owed by the caller.
    pub(crate) fn end(&self) -> bool {
        let mut state = self.0.lock();
        state.running = false;
        state.canceled
    }

    /// Returns `true` when a fetch is still running, in which case its
    /// completion signals the finish.
    pub(crate) fn cancel(&self) -> bool {
        let mut state = self.0.lock();
        state.canceled = true;
        state.running
    }

    pub(crate) fn is_running(&self) -> bool {
        self.0.lock().running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Unencodable;

    impl serde::Serialize for Unencodable {
        fn serialize<S: serde::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("no JSON form"))
        }
    }

    #[test]
    fn encoding_failure_raises_the_status() {
        let local = LocalStatus::new();
        assert!(to_json(&Unencodable, &local, "record").is_none());
        assert_eq!(local.get(), status::INTERNAL);
        assert_eq!(local.finish_status(), ProcessorStatus::Error);
    }

    #[test]
    fn encoded_records_leave_the_status_alone() {
        let local = LocalStatus::new();
        assert_eq!(to_json(&[1, 2], &local, "record").as_deref(), Some(&b"[1,2]"[..]));
        assert_eq!(local.get(), status::OK);
    }
}
