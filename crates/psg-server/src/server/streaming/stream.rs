use crate::server::{
    pool::manager::InflightGuard,
    telemetry::{RequestOutcome, record_outcome},
};
use bytes::{Bytes, BytesMut};
use core::{
    convert::Infallible,
    pin::Pin,
    task::{Context, Poll, ready},
};
use futures::{Stream, StreamExt};
use psg_core::{dispatcher::Dispatcher, reply::Reply, request::Request};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Ends the dispatcher bookkeeping of a request when its body goes away.
///
/// If the reply had not completed by then, the client dropped the
/// connection: the remaining processors are canceled first.
pub struct RequestGuard {
    dispatcher: Arc<Dispatcher>,
    request: Arc<Request>,
    reply: Arc<Reply>,
    _inflight: InflightGuard,
}

impl RequestGuard {
    pub const fn new(
        dispatcher: Arc<Dispatcher>,
        request: Arc<Request>,
        reply: Arc<Reply>,
        inflight: InflightGuard,
    ) -> Self {
        Self {
            dispatcher,
            request,
            reply,
            _inflight: inflight,
        }
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        let request_id = self.request.id();
        let canceled = !self.reply.is_finished();
        if canceled {
            #[cfg(feature = "tracing")]
            tracing::info!(request_id, "Client dropped the connection before the reply completed");
            self.dispatcher.signal_connection_canceled(request_id);
        }
        self.dispatcher.notify_request_finished(request_id);

        record_outcome(&RequestOutcome {
            kind: self.request.kind().as_str(),
            status: self.request.overall_status(),
            canceled,
            duration_ms: self.request.created().elapsed().as_secs_f64() * 1000.0,
            chunks: self.reply.total_chunks() as u64,
        });
    }
}

/// The response body of one request.
///
/// Chunks already queued when the body is polled are merged into a single
/// frame, up to `merge_limit` chunks.
pub struct ReplyStream {
    chunks: UnboundedReceiverStream<Bytes>,
    merge_limit: usize,
    _guard: RequestGuard,
}

impl ReplyStream {
    pub fn new(rx: mpsc::UnboundedReceiver<Bytes>, merge_limit: usize, guard: RequestGuard) -> Self {
        Self {
            chunks: UnboundedReceiverStream::new(rx),
            merge_limit: merge_limit.max(1),
            _guard: guard,
        }
    }
}

impl Stream for ReplyStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(first) = ready!(this.chunks.poll_next_unpin(cx)) else {
            return Poll::Ready(None);
        };

        let mut merged: Option<BytesMut> = None;
        for _ in 1..this.merge_limit {
            match this.chunks.poll_next_unpin(cx) {
                Poll::Ready(Some(next)) => merged
                    .get_or_insert_with(|| BytesMut::from(&first[..]))
                    .extend_from_slice(&next),
                Poll::Ready(None) | Poll::Pending => break,
            }
        }

        Poll::Ready(Some(Ok(merged.map_or(first, BytesMut::freeze))))
    }
}
