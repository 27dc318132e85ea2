use super::memory::MemoryOsgPool;
use super::*;
use crate::backend::BlobRecord;
use crate::common::{Error, ProcessorStatus};
use crate::config::{OsgSettings, Settings};
use crate::dispatcher::Dispatcher;
use crate::loop_binder::LoopBinder;
use crate::processor::Processor;
use crate::protocol::OutputFormat;
use crate::reply::{MemoryTransport, Reply};
use crate::request::{
    BlobBySatSatKeyRequest, BlobId, BlobOptions, CacheUsage, IncludeInfo, Request, RequestPayload,
    ResolveRequest, SeqIdQuery,
};
use core::time::Duration;
use std::time::Instant;

fn getblob_request() -> Request {
    Request::new(RequestPayload::BlobBySatSatKey(BlobBySatSatKeyRequest {
        blob_id: BlobId::new(25, 77),
        options: BlobOptions::default(),
    }))
}

fn getblob_body() -> Vec<OsgRequestBody> {
    vec![OsgRequestBody::GetBlob { sat: 25, sat_key: 77 }]
}

fn pool(max_size: usize) -> Arc<MemoryOsgPool> {
    let pool = MemoryOsgPool::new(max_size);
    pool.insert_blob(
        25,
        BlobRecord {
            sat_key: 77,
            last_modified: 5,
            size: 6,
            ..Default::default()
        },
        vec![bytes::Bytes::from_static(b"ABCDEF")],
    );
    pool.insert_bioseq(crate::backend::BioseqInfo {
        accession: "XX_000001".into(),
        version: 1,
        ..Default::default()
    });
    Arc::new(pool)
}

fn caller(pool: &Arc<MemoryOsgPool>, retry_count: f64) -> OsgCaller {
    OsgCaller::new(Arc::clone(pool) as Arc<dyn OsgConnectionPool>, retry_count)
}

#[test]
fn stale_connections_cost_a_fraction_of_the_budget() {
    let pool = pool(4);
    pool.warm_up();
    pool.fail_sends(100);
    let result = caller(&pool, 2.0).call(&getblob_request(), getblob_body());

    assert!(matches!(result, Err(Error::ChannelError { .. })));
    // 2.0, 1.75, 1.5, 1.25, then the last attempt at 1.0.
    assert_eq!(pool.send_count(), 5);
}

#[test]
fn fresh_connection_costs_a_whole_retry() {
    let pool = pool(4);
    pool.fail_sends(100);
    let result = caller(&pool, 2.0).call(&getblob_request(), getblob_body());

    assert!(result.is_err());
    assert_eq!(pool.send_count(), 2);
}

#[test]
fn a_retry_recovers_from_one_failure() {
    let pool = pool(4);
    pool.fail_sends(1);
    let fetches = caller(&pool, 2.0)
        .call(&getblob_request(), getblob_body())
        .unwrap();

    assert_eq!(pool.send_count(), 2);
    assert_eq!(fetches.len(), 1);
    assert!(fetches[0].is_ended());
    assert!(matches!(fetches[0].replies[0].body, OsgReplyBody::Blob { .. }));
}

#[test]
fn failed_allocation_is_retried() {
    let pool = pool(4);
    pool.fail_allocations(1);
    assert!(caller(&pool, 2.0).call(&getblob_request(), getblob_body()).is_ok());
    assert_eq!(pool.send_count(), 1);

    let pool = self::pool(4);
    pool.fail_allocations(1);
    assert!(caller(&pool, 1.0).call(&getblob_request(), getblob_body()).is_err());
}

#[test]
fn passed_deadline_allows_one_attempt() {
    let pool = pool(4);
    pool.fail_sends(100);
    let request = getblob_request().with_timeout(Duration::ZERO);
    assert!(caller(&pool, 5.0).call(&request, getblob_body()).is_err());
    assert_eq!(pool.send_count(), 1);
}

#[test]
fn serial_outside_the_batch_is_a_logic_error() {
    let pool = pool(4);
    pool.shift_serials(50);
    let result = caller(&pool, 3.0).call(&getblob_request(), getblob_body());

    assert!(matches!(result, Err(Error::LogicError { .. })));
    assert_eq!(pool.send_count(), 1);
}

#[test]
fn failed_command_is_not_retried() {
    let pool = pool(4);
    pool.reject_commands();
    let result = caller(&pool, 3.0).call(&getblob_request(), getblob_body());

    assert!(matches!(result, Err(Error::Backend { .. })));
    assert_eq!(pool.send_count(), 1);
}

#[test]
fn packet_carries_init_and_incremented_hops() {
    let pool = pool(4);
    let request = getblob_request().with_hops(2);
    caller(&pool, 1.0).call(&request, getblob_body()).unwrap();

    let packets = pool.packets();
    assert_eq!(packets.len(), 1);
    let requests = &packets[0].requests;
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].body, OsgRequestBody::Init);
    assert!(requests.iter().all(|r| r.hops == 3));
    assert_eq!(requests[1].serial, requests[0].serial + 1);
}

struct Setup {
    dispatcher: Arc<Dispatcher>,
    pool: Arc<MemoryOsgPool>,
}

fn setup(binder: Option<Arc<LoopBinder>>) -> Setup {
    let pool = pool(4);
    let settings = Settings {
        osg: OsgSettings {
            sats: vec![25],
            namespaces: vec!["XX_".into()],
            async_processing: binder.is_some(),
            ..OsgSettings::default()
        },
        ..Settings::default()
    };
    let services = Arc::new(OsgServices {
        caller: caller(&pool, 2.0),
        binder,
        settings: Arc::new(settings),
    });
    let mut dispatcher = Dispatcher::new();
    dispatcher.add_processor(Arc::new(OsgFactory::new(services)));
    Setup {
        dispatcher: Arc::new(dispatcher),
        pool,
    }
}

fn field<'a>(header: &'a [(String, String)], key: &str) -> Option<&'a str> {
    header.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

fn count(transport: &MemoryTransport, item_type: &str, chunk_type: &str) -> usize {
    transport
        .headers()
        .iter()
        .filter(|h| field(h, "item_type") == Some(item_type) && field(h, "chunk_type") == Some(chunk_type))
        .count()
}

fn dispatch(setup: &Setup, request: Request) -> (Arc<MemoryTransport>, Vec<Arc<dyn Processor>>) {
    let transport = MemoryTransport::new();
    let reply = Arc::new(Reply::new(transport.clone()));
    let processors = setup.dispatcher.dispatch_request(Arc::new(request), reply);
    (transport, processors)
}

#[test]
fn only_configured_sats_and_namespaces_are_served() {
    let s = setup(None);
    let (_, processors) = dispatch(&s, getblob_request());
    assert_eq!(processors.len(), 1);

    let other = Request::new(RequestPayload::BlobBySatSatKey(BlobBySatSatKeyRequest {
        blob_id: BlobId::new(4, 77),
        options: BlobOptions::default(),
    }));
    assert!(dispatch(&s, other).1.is_empty());

    let resolve = |seq_id: &str| {
        Request::new(RequestPayload::Resolve(ResolveRequest {
            seq_id: SeqIdQuery::new(seq_id),
            include: IncludeInfo::default(),
            output_format: OutputFormat::Json,
            use_cache: CacheUsage::Default,
        }))
    };
    assert_eq!(dispatch(&s, resolve("XX_000001.1")).1.len(), 1);
    assert!(dispatch(&s, resolve("NC_000001.11")).1.is_empty());
}

#[test]
fn inline_fetch_sends_props_and_data() {
    let s = setup(None);
    let (transport, processors) = dispatch(&s, getblob_request());
    processors[0].process();

    assert_eq!(processors[0].status(), ProcessorStatus::Done);
    assert!(transport.is_finished());
    assert_eq!(count(&transport, "blob_prop", "data"), 1);
    assert_eq!(count(&transport, "blob", "data"), 1);
    assert_eq!(s.pool.send_count(), 1);
}

#[test]
fn inline_resolve_sends_bioseq_info() {
    let s = setup(None);
    let request = Request::new(RequestPayload::Resolve(ResolveRequest {
        seq_id: SeqIdQuery::new("XX_000001.1"),
        include: IncludeInfo::default(),
        output_format: OutputFormat::Json,
        use_cache: CacheUsage::Default,
    }));
    let (transport, processors) = dispatch(&s, request);
    processors[0].process();

    assert_eq!(processors[0].name(), "OSG-resolve");
    assert_eq!(count(&transport, "bioseq_info", "data"), 1);
}

#[test]
fn missing_blob_is_not_found() {
    let s = setup(None);
    let request = Request::new(RequestPayload::BlobBySatSatKey(BlobBySatSatKeyRequest {
        blob_id: BlobId::new(25, 78),
        options: BlobOptions::default(),
    }));
    let (transport, processors) = dispatch(&s, request);
    processors[0].process();

    assert_eq!(processors[0].status(), ProcessorStatus::NotFound);
    let headers = transport.headers();
    let msg = headers
        .iter()
        .find(|h| field(h, "item_type") == Some("processor"))
        .unwrap();
    assert_eq!(field(msg, "status"), Some("404"));
}

#[test]
fn exhausted_retries_fail_the_processor() {
    let s = setup(None);
    s.pool.fail_sends(100);
    let (transport, processors) = dispatch(&s, getblob_request());
    processors[0].process();

    assert_eq!(processors[0].status(), ProcessorStatus::Error);
    assert_eq!(count(&transport, "processor", "message"), 1);
    assert!(transport.is_finished());
}

fn pump_until(binder: &LoopBinder, mut done: impl FnMut(usize) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut ran = 0;
    while !done(ran) && Instant::now() < deadline {
        ran += binder.run_pending().unwrap();
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn background_fetch_completes_on_the_owning_loop() {
    let binder = LoopBinder::for_current_thread();
    let s = setup(Some(Arc::clone(&binder)));
    let (transport, processors) = dispatch(&s, getblob_request());
    processors[0].process();

    pump_until(&binder, |ran| ran > 0);
    assert_eq!(processors[0].status(), ProcessorStatus::Done);
    assert!(transport.is_finished());
    assert_eq!(count(&transport, "blob", "data"), 1);
}

#[test]
fn cancel_during_background_fetch_finishes_when_it_returns() {
    let binder = LoopBinder::for_current_thread();
    let s = setup(Some(Arc::clone(&binder)));
    let (transport, processors) = dispatch(&s, getblob_request());
    processors[0].process();
    processors[0].cancel();

    assert_eq!(processors[0].status(), ProcessorStatus::Canceled);
    pump_until(&binder, |ran| ran > 0);
    assert!(transport.is_finished());
    assert_eq!(count(&transport, "blob", "data"), 0);
}

#[test]
fn late_completion_after_teardown_is_ignored() {
    let binder = LoopBinder::for_current_thread();
    let s = setup(Some(Arc::clone(&binder)));
    let request = getblob_request();
    let request_id = request.id();
    let (transport, processors) = dispatch(&s, request);
    processors[0].process();
    assert!(transport.headers().is_empty());

    // Tear the request down before the background result is delivered.
    s.dispatcher.signal_connection_canceled(request_id);
    s.dispatcher.notify_request_finished(request_id);
    assert_eq!(s.dispatcher.group_count(), 0);
    drop(processors);

    let mut total = 0;
    pump_until(&binder, |ran| {
        total = ran;
        ran > 0
    });
    assert_eq!(total, 1);
    assert!(!transport.is_finished());
    assert_eq!(count(&transport, "blob", "data"), 0);
}

#[test]
fn disabled_osg_accepts_nothing() {
    let pool = pool(4);
    let settings = Settings {
        osg: OsgSettings {
            enabled: false,
            sats: vec![25],
            ..OsgSettings::default()
        },
        ..Settings::default()
    };
    let factory = OsgFactory::new(Arc::new(OsgServices {
        caller: caller(&pool, 2.0),
        binder: None,
        settings: Arc::new(settings),
    }));
    let reply = Reply::new(MemoryTransport::new());
    assert!(!factory.can_process(&getblob_request(), &reply));
}
