use bytes::Bytes;
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, Ordering};
use psg_core::reply::Transport;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A [`Transport`] feeding an HTTP response body through an unbounded
/// channel.
///
/// The sender is dropped after the last chunk, which ends the body stream.
/// A failed send means the body was dropped, i.e. the client went away.
pub struct ChannelTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    finished: AtomicBool,
    closed: AtomicBool,
}

impl ChannelTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            tx: Mutex::new(Some(tx)),
            finished: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };
        (Arc::new(transport), rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, chunks: Vec<Bytes>, is_last: bool) {
        let mut guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return;
        };
        let delivered = chunks.into_iter().all(|chunk| tx.send(chunk).is_ok());
        if !delivered {
            #[cfg(feature = "tracing")]
            tracing::debug!("Reply body dropped, discarding output");
            self.closed.store(true, Ordering::Release);
            *guard = None;
            return;
        }
        if is_last {
            self.finished.store(true, Ordering::Release);
            *guard = None;
        }
    }

    fn notify_client_connection_drop(&self) {
        self.closed.store(true, Ordering::Release);
        self.tx.lock().take();
    }

    fn is_output_ready(&self) -> bool {
        !self.is_closed()
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
