use super::{
    request::WorkRequest,
    stream::{ReplyStream, RequestGuard},
    transport::ChannelTransport,
};
use crate::server::{pool::manager::WorkerPool, telemetry::record_forced_finish};
use psg_core::{dispatcher::Dispatcher, reply::Reply, request::Request};
use std::sync::Arc;
use tokio::time::{Instant, sleep_until};

/// Dispatches `request` and returns the body its reply streams into.
///
/// Every processor that accepted the request is queued on the worker pool.
/// One that cannot be queued (the pool is shutting down) is canceled, so the
/// reply still completes. A request nobody accepts is answered with the
/// "no processor" reply before this returns. A request with a timeout gets a
/// timer that finishes whatever is still running once the deadline passes.
pub async fn start_reply(
    request: Request,
    dispatcher: &Arc<Dispatcher>,
    worker_pool: &Arc<WorkerPool>,
    merge_limit: usize,
) -> ReplyStream {
    let (transport, rx) = ChannelTransport::new();
    let reply = Arc::new(Reply::new(transport));
    let request = Arc::new(request);
    let guard = RequestGuard::new(
        Arc::clone(dispatcher),
        Arc::clone(&request),
        Arc::clone(&reply),
        worker_pool.track_request(),
    );

    let processors = dispatcher.dispatch_request(Arc::clone(&request), Arc::clone(&reply));
    if processors.is_empty() {
        dispatcher.reply_no_processors(&request, &reply);
    } else if let Some(deadline) = request.deadline() {
        arm_deadline(dispatcher, request.id(), Instant::from_std(deadline));
    }

    for processor in processors {
        let queued = worker_pool
            .send_to_next_worker(WorkRequest::Process {
                processor: Arc::clone(&processor),
                dispatcher: Arc::clone(dispatcher),
                request_id: request.id(),
            })
            .await;
        if let Err(_e) = queued {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                request_id = request.id(),
                "Cannot queue {}: {_e}",
                processor.name()
            );
            processor.cancel();
        }
    }

    ReplyStream::new(rx, merge_limit, guard)
}

fn arm_deadline(dispatcher: &Arc<Dispatcher>, request_id: usize, deadline: Instant) {
    let dispatcher = Arc::downgrade(dispatcher);
    tokio::spawn(async move {
        sleep_until(deadline).await;
        let Some(dispatcher) = dispatcher.upgrade() else {
            return;
        };
        let expired = dispatcher.expire_request(request_id);
        if expired > 0 {
            #[cfg(feature = "tracing")]
            tracing::warn!(request_id, "Deadline passed with {expired} processor(s) still running");
            record_forced_finish("deadline", expired as u64);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use parking_lot::Mutex;
    use std::time::Duration;
    use psg_core::{
        ProcessorStatus,
        processor::{Processor, ProcessorContext, ProcessorState},
        request::{AccVerHistoryRequest, CacheUsage, RequestPayload, SeqIdQuery},
    };

    /// Accepts every request and only finishes when canceled.
    #[derive(Default)]
    struct Idle {
        created: Mutex<Vec<Arc<IdleProcessor>>>,
    }

    struct IdleProcessor {
        ctx: ProcessorContext,
        state: ProcessorState,
    }

    impl Processor for Idle {
        fn can_process(&self, _request: &Request, _reply: &Reply) -> bool {
            true
        }

        fn create_processor(&self, ctx: ProcessorContext) -> Option<Arc<dyn Processor>> {
            let processor = Arc::new(IdleProcessor {
                ctx,
                state: ProcessorState::new(),
            });
            self.created.lock().push(Arc::clone(&processor));
            Some(processor)
        }

        fn process(&self) {}

        fn cancel(&self) {}

        fn status(&self) -> ProcessorStatus {
            ProcessorStatus::InProgress
        }

        fn name(&self) -> &'static str {
            "idle"
        }

        fn group_name(&self) -> &'static str {
            "IDLE"
        }
    }

    impl Processor for IdleProcessor {
        fn can_process(&self, _request: &Request, _reply: &Reply) -> bool {
            false
        }

        fn create_processor(&self, _ctx: ProcessorContext) -> Option<Arc<dyn Processor>> {
            None
        }

        fn process(&self) {}

        fn cancel(&self) {
            if self.state.cancel() {
                self.ctx.signal_finish_processing();
            }
        }

        fn status(&self) -> ProcessorStatus {
            self.state.get()
        }

        fn name(&self) -> &'static str {
            "idle"
        }

        fn group_name(&self) -> &'static str {
            "IDLE"
        }
    }

    /// Accepts every request with a processor whose `process()` panics.
    struct Crashing;

    impl Processor for Crashing {
        fn can_process(&self, _request: &Request, _reply: &Reply) -> bool {
            true
        }

        fn create_processor(&self, ctx: ProcessorContext) -> Option<Arc<dyn Processor>> {
            Some(Arc::new(CrashingProcessor {
                ctx,
                state: ProcessorState::new(),
            }))
        }

        fn process(&self) {}

        fn cancel(&self) {}

        fn status(&self) -> ProcessorStatus {
            ProcessorStatus::InProgress
        }

        fn name(&self) -> &'static str {
            "crashing"
        }

        fn group_name(&self) -> &'static str {
            "CRASHING"
        }
    }

    struct CrashingProcessor {
        ctx: ProcessorContext,
        state: ProcessorState,
    }

    impl Processor for CrashingProcessor {
        fn can_process(&self, _request: &Request, _reply: &Reply) -> bool {
            false
        }

        fn create_processor(&self, _ctx: ProcessorContext) -> Option<Arc<dyn Processor>> {
            None
        }

        fn process(&self) {
            let _ = self.ctx.signal_start_processing();
            panic!("backend exploded");
        }

        fn cancel(&self) {
            if self.state.cancel() {
                self.ctx.signal_finish_processing();
            }
        }

        fn status(&self) -> ProcessorStatus {
            self.state.get()
        }

        fn name(&self) -> &'static str {
            "crashing"
        }

        fn group_name(&self) -> &'static str {
            "CRASHING"
        }
    }

    async fn body_text(body: ReplyStream) -> String {
        let frames: Vec<_> = tokio::time::timeout(Duration::from_secs(5), body.collect())
            .await
            .expect("reply did not complete");
        frames
            .into_iter()
            .map(|frame| String::from_utf8_lossy(&frame.unwrap()).into_owned())
            .collect()
    }

    fn request() -> Request {
        Request::new(RequestPayload::AccVerHistory(AccVerHistoryRequest {
            seq_id: SeqIdQuery::new("NC_000001"),
            use_cache: CacheUsage::Default,
        }))
    }

    #[tokio::test]
    async fn dropping_the_body_cancels_the_request() {
        let idle = Arc::new(Idle::default());
        let mut dispatcher = Dispatcher::new();
        dispatcher.add_processor(Arc::clone(&idle) as Arc<dyn Processor>);
        let dispatcher = Arc::new(dispatcher);
        let pool = Arc::new(WorkerPool::spawn(1, 4, 0));

        let body = start_reply(request(), &dispatcher, &pool, 8).await;
        assert_eq!(dispatcher.group_count(), 1);
        assert_eq!(pool.inflight(), 1);

        drop(body);

        let created = idle.created.lock();
        assert_eq!(created[0].status(), ProcessorStatus::Canceled);
        assert_eq!(dispatcher.group_count(), 0);
        assert_eq!(pool.inflight(), 0);
    }

    #[tokio::test]
    async fn unserved_request_gets_the_no_processor_reply() {
        let dispatcher = Arc::new(Dispatcher::new());
        let pool = Arc::new(WorkerPool::spawn(1, 4, 0));

        let body = start_reply(request(), &dispatcher, &pool, 8).await;
        let text = body_text(body).await;

        assert!(text.contains("item_type=reply&chunk_type=message"));
        assert!(text.contains("status=404"));
        assert_eq!(pool.inflight(), 0);
    }

    #[tokio::test]
    async fn shut_down_pool_cancels_the_processors() {
        let idle = Arc::new(Idle::default());
        let mut dispatcher = Dispatcher::new();
        dispatcher.add_processor(Arc::clone(&idle) as Arc<dyn Processor>);
        let dispatcher = Arc::new(dispatcher);
        let pool = Arc::new(WorkerPool::spawn(1, 4, 0));
        pool.shutdown().await.unwrap();

        let body = start_reply(request(), &dispatcher, &pool, 8).await;
        let frames: Vec<_> = body.collect().await;

        assert!(!frames.is_empty());
        let created = idle.created.lock();
        assert_eq!(created[0].status(), ProcessorStatus::Canceled);
    }

    #[tokio::test]
    async fn panicking_processor_still_completes_the_reply() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.add_processor(Arc::new(Crashing) as Arc<dyn Processor>);
        let dispatcher = Arc::new(dispatcher);
        let pool = Arc::new(WorkerPool::spawn(1, 4, 0));

        let body = start_reply(request(), &dispatcher, &pool, 8).await;
        let text = body_text(body).await;

        assert!(text.contains("item_type=processor&chunk_type=message"));
        assert!(text.contains("status=500"));
        assert!(text.contains("item_type=reply&chunk_type=meta"));
        assert_eq!(dispatcher.group_count(), 0);
        assert_eq!(pool.inflight(), 0);
    }

    #[tokio::test]
    async fn deadline_finishes_a_stuck_request() {
        let idle = Arc::new(Idle::default());
        let mut dispatcher = Dispatcher::new();
        dispatcher.add_processor(Arc::clone(&idle) as Arc<dyn Processor>);
        let dispatcher = Arc::new(dispatcher);
        let pool = Arc::new(WorkerPool::spawn(1, 4, 0));

        let request = request().with_timeout(Duration::from_millis(50));
        let body = start_reply(request, &dispatcher, &pool, 8).await;
        let text = body_text(body).await;

        assert!(text.contains("status=500"));
        assert!(text.contains("item_type=reply&chunk_type=meta"));
        assert_eq!(idle.created.lock()[0].status(), ProcessorStatus::Canceled);
    }
}
