use super::*;
use crate::backend::memory::{Delivery, MemoryBioseqStore, MemoryBlobStore, MemoryLookupCache};
use crate::backend::{BioseqInfo, BlobRecord, NamedAnnotRecord};
use crate::common::{ProcessorStatus, status};
use crate::dispatcher::Dispatcher;
use crate::protocol::OutputFormat;
use crate::reply::MemoryTransport;
use crate::request::{
    AnnotRequest, BlobBySatSatKeyRequest, BlobBySeqIdRequest, BlobId, BlobOptions, IncludeInfo,
    ResolveRequest, TseChunkRequest, TseOption,
};
use bytes::Bytes;

type Header = Vec<(String, String)>;

fn field<'a>(header: &'a Header, key: &str) -> Option<&'a str> {
    header.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

fn of_type<'a>(headers: &'a [Header], item_type: &str, chunk_type: &str) -> Vec<&'a Header> {
    headers
        .iter()
        .filter(|h| field(h, "item_type") == Some(item_type) && field(h, "chunk_type") == Some(chunk_type))
        .collect()
}

fn bioseq() -> BioseqInfo {
    BioseqInfo {
        accession: "NC_000001".into(),
        version: 11,
        seq_id_type: 10,
        length: 248_956_422,
        sat: 4,
        sat_key: 100,
        ..Default::default()
    }
}

fn record(sat_key: i32, size: u64) -> BlobRecord {
    BlobRecord {
        sat_key,
        last_modified: 1_000,
        size,
        n_chunks: 2,
        ..Default::default()
    }
}

fn chunks() -> Vec<Bytes> {
    vec![Bytes::from_static(b"AAA"), Bytes::from_static(b"BBB")]
}

struct Harness {
    dispatcher: Arc<Dispatcher>,
    store: Arc<MemoryBlobStore>,
    services: Arc<CassServices>,
}

impl Harness {
    fn new(store: MemoryBlobStore, bioseq: MemoryBioseqStore, cache: Option<MemoryLookupCache>) -> Self {
        let store = Arc::new(store);
        let mut settings = Settings::default();
        settings.exclude_cache.resend_timeout = core::time::Duration::from_secs(60);
        let services = Arc::new(CassServices::new(
            Arc::clone(&store) as Arc<dyn BlobStore>,
            Arc::new(bioseq),
            cache.map(|c| Arc::new(c) as Arc<dyn LookupCache>),
            Arc::new(settings),
        ));
        let mut dispatcher = Dispatcher::new();
        for factory in CassFactory::all(&services) {
            dispatcher.add_processor(factory);
        }
        Self {
            dispatcher: Arc::new(dispatcher),
            store,
            services,
        }
    }

    fn standard() -> Self {
        let mut store = MemoryBlobStore::new(Delivery::Inline);
        store.insert_blob(4, record(100, 100), chunks());
        let mut bioseq_store = MemoryBioseqStore::new(Delivery::Inline);
        bioseq_store.insert_bioseq(bioseq());
        Self::new(store, bioseq_store, None)
    }

    /// Runs `payload` to completion and returns the request, the processors,
    /// and the parsed headers.
    fn run(&self, payload: RequestPayload) -> (Arc<Request>, Vec<Arc<dyn Processor>>, Vec<Header>) {
        let request = Arc::new(Request::new(payload));
        let transport = MemoryTransport::new();
        let reply = Arc::new(Reply::new(transport.clone()));
        let processors = self.dispatcher.dispatch_request(Arc::clone(&request), reply);
        for p in &processors {
            p.process();
        }
        assert!(transport.is_finished(), "reply was not completed");
        (request, processors, transport.headers())
    }
}

fn get_blob(blob_id: BlobId, tse_option: TseOption) -> RequestPayload {
    RequestPayload::BlobBySatSatKey(BlobBySatSatKeyRequest {
        blob_id,
        options: BlobOptions {
            tse_option,
            ..BlobOptions::default()
        },
    })
}

fn get_by_seq_id(options: BlobOptions) -> RequestPayload {
    RequestPayload::BlobBySeqId(BlobBySeqIdRequest {
        seq_id: SeqIdQuery::new("NC_000001.11"),
        options,
    })
}

#[test]
fn resolve_sends_one_bioseq_info_item() {
    let h = Harness::standard();
    let (_, processors, headers) = h.run(RequestPayload::Resolve(ResolveRequest {
        seq_id: SeqIdQuery::new("NC_000001.11"),
        include: IncludeInfo::from_names(["canonical_id", "length"]).unwrap(),
        output_format: OutputFormat::Json,
        use_cache: CacheUsage::Default,
    }));

    assert_eq!(processors.len(), 1);
    assert_eq!(processors[0].name(), "Cassandra-resolve");
    assert_eq!(processors[0].status(), ProcessorStatus::Done);
    assert_eq!(of_type(&headers, "bioseq_info", "data").len(), 1);
    let meta = of_type(&headers, "bioseq_info", "meta");
    assert_eq!(field(meta[0], "n_chunks"), Some("2"));
    let done = of_type(&headers, "reply", "meta");
    assert_eq!(field(done[0], "n_chunks"), Some("3"));
}

#[test]
fn unresolved_seq_id_is_not_found() {
    let h = Harness::new(
        MemoryBlobStore::new(Delivery::Inline),
        MemoryBioseqStore::new(Delivery::Inline),
        None,
    );
    let (request, processors, headers) = h.run(get_by_seq_id(BlobOptions::default()));

    assert_eq!(processors[0].status(), ProcessorStatus::NotFound);
    let msg = of_type(&headers, "processor", "message");
    assert_eq!(field(msg[0], "status"), Some("404"));
    assert_eq!(field(msg[0], "code"), Some("305"));
    assert_eq!(request.overall_status(), status::NOT_FOUND);
}

#[test]
fn getblob_orig_sends_props_then_data() {
    let h = Harness::standard();
    let (_, processors, headers) = h.run(get_blob(BlobId::new(4, 100), TseOption::Orig));

    assert_eq!(processors[0].status(), ProcessorStatus::Done);
    assert_eq!(of_type(&headers, "blob_prop", "data").len(), 1);
    let prop_meta = of_type(&headers, "blob_prop", "meta");
    assert_eq!(field(prop_meta[0], "n_chunks"), Some("2"));

    let data = of_type(&headers, "blob", "data");
    assert_eq!(data.len(), 2);
    assert_eq!(field(data[0], "blob_id"), Some("4.100"));
    assert_eq!(field(data[0], "blob_chunk"), Some("0"));
    assert_eq!(field(data[1], "blob_chunk"), Some("1"));
    assert_eq!(field(data[0], "last_modified"), Some("1000"));
    let blob_meta = of_type(&headers, "blob", "meta");
    assert_eq!(field(blob_meta[0], "n_chunks"), Some("3"));
    assert_eq!(h.store.loads(), [BlobId::new(4, 100), BlobId::new(4, 100)]);
}

#[test]
fn tse_none_sends_only_props() {
    let h = Harness::standard();
    let (_, _, headers) = h.run(get_blob(BlobId::new(4, 100), TseOption::None));

    assert_eq!(of_type(&headers, "blob_prop", "data").len(), 1);
    assert!(of_type(&headers, "blob", "data").is_empty());
    assert_eq!(h.store.loads(), [BlobId::new(4, 100)]);
}

#[test]
fn unknown_blob_by_address_is_not_found() {
    let h = Harness::standard();
    let (_, processors, headers) = h.run(get_blob(BlobId::new(4, 555), TseOption::Orig));

    assert_eq!(processors[0].status(), ProcessorStatus::NotFound);
    let msg = of_type(&headers, "blob_prop", "message");
    assert_eq!(field(msg[0], "status"), Some("404"));
    assert_eq!(field(msg[0], "code"), Some("309"));
}

#[test]
fn missing_blob_behind_seq_id_is_an_inconsistency() {
    let mut store = MemoryBlobStore::new(Delivery::Inline);
    store.add_sat(4);
    let mut bioseq_store = MemoryBioseqStore::new(Delivery::Inline);
    bioseq_store.insert_bioseq(bioseq());
    let h = Harness::new(store, bioseq_store, None);
    let (_, processors, headers) = h.run(get_by_seq_id(BlobOptions::default()));

    assert_eq!(processors[0].status(), ProcessorStatus::Error);
    let msg = of_type(&headers, "blob_prop", "message");
    assert_eq!(field(msg[0], "status"), Some("500"));
}

#[test]
fn withdrawn_blob_is_refused_with_its_comment() {
    let mut store = MemoryBlobStore::new(Delivery::Inline);
    let withdrawn = BlobRecord {
        withdrawn: true,
        ..record(200, 100)
    };
    store.insert_blob(4, withdrawn, chunks());
    store.insert_comment(BlobId::new(4, 200), "withdrawn by the submitter");
    let h = Harness::new(store, MemoryBioseqStore::new(Delivery::Inline), None);
    let (request, processors, headers) = h.run(get_blob(BlobId::new(4, 200), TseOption::Orig));

    assert_eq!(processors[0].status(), ProcessorStatus::Done);
    assert_eq!(request.overall_status(), status::FORBIDDEN);
    assert!(of_type(&headers, "blob", "data").is_empty());
    let msg = of_type(&headers, "blob", "message");
    assert_eq!(field(msg[0], "status"), Some("403"));
    assert_eq!(field(msg[0], "code"), Some("314"));
    assert_eq!(of_type(&headers, "public_comment", "data").len(), 1);
}

#[test]
fn storage_error_fails_the_processor() {
    let h = Harness::standard();
    h.store
        .fail_blob(BlobId::new(4, 100), BackendError::storage("read timeout"));
    let (_, processors, headers) = h.run(get_blob(BlobId::new(4, 100), TseOption::Orig));

    assert_eq!(processors[0].status(), ProcessorStatus::Error);
    let msg = of_type(&headers, "blob_prop", "message");
    assert_eq!(field(msg[0], "status"), Some("500"));
    assert_eq!(of_type(&headers, "blob_prop", "meta").len(), 1);
}

#[test]
fn cache_only_miss_is_not_found() {
    let mut store = MemoryBlobStore::new(Delivery::Inline);
    store.insert_blob(4, record(100, 100), chunks());
    let h = Harness::new(
        store,
        MemoryBioseqStore::new(Delivery::Inline),
        Some(MemoryLookupCache::default()),
    );
    let payload = RequestPayload::BlobBySatSatKey(BlobBySatSatKeyRequest {
        blob_id: BlobId::new(4, 100),
        options: BlobOptions {
            use_cache: CacheUsage::CacheOnly,
            ..BlobOptions::default()
        },
    });
    let (_, processors, headers) = h.run(payload);

    assert_eq!(processors[0].status(), ProcessorStatus::NotFound);
    assert!(h.store.loads().is_empty());
    let msg = of_type(&headers, "blob_prop", "message");
    assert_eq!(field(msg[0], "status"), Some("404"));
}

#[test]
fn cached_props_skip_the_property_lookup() {
    let mut store = MemoryBlobStore::new(Delivery::Inline);
    store.insert_blob(4, record(100, 100), chunks());
    let mut cache = MemoryLookupCache::default();
    cache.insert_blob_prop(4, record(100, 100));
    let h = Harness::new(store, MemoryBioseqStore::new(Delivery::Inline), Some(cache));
    let (_, _, headers) = h.run(get_blob(BlobId::new(4, 100), TseOption::Orig));

    assert_eq!(of_type(&headers, "blob", "data").len(), 2);
    // Only the data load reached the store.
    assert_eq!(h.store.loads(), [BlobId::new(4, 100)]);
}

/// Main blob 4.300 split into info 4.310 and chunks 4.308, 4.309.
fn split_harness(main_size: u64) -> Harness {
    let mut store = MemoryBlobStore::new(Delivery::Inline);
    store.insert_blob(
        4,
        BlobRecord {
            id2_info: Some("4.310.2".into()),
            ..record(300, main_size)
        },
        chunks(),
    );
    for sat_key in [308, 309, 310] {
        store.insert_blob(4, record(sat_key, 10), chunks());
    }
    Harness::new(store, MemoryBioseqStore::new(Delivery::Inline), None)
}

#[test]
fn whole_tse_fetches_split_info_and_every_chunk() {
    let h = split_harness(1_000_000);
    let (_, processors, headers) = h.run(get_blob(BlobId::new(4, 300), TseOption::Whole));

    assert_eq!(processors[0].status(), ProcessorStatus::Done);
    assert_eq!(
        h.store.loads(),
        [BlobId::new(4, 300), BlobId::new(4, 310), BlobId::new(4, 308), BlobId::new(4, 309)]
    );
    let data = of_type(&headers, "blob", "data");
    assert_eq!(data.len(), 6);
    assert!(data.iter().all(|h| field(h, "id2_info") == Some("4.310.2")));
    let info_chunks = data
        .iter()
        .filter(|h| field(h, "id2_chunk") == Some("999999999"))
        .count();
    assert_eq!(info_chunks, 2);
}

#[test]
fn slim_tse_skips_chunks_of_large_blobs() {
    let h = split_harness(1_000_000);
    h.run(get_blob(BlobId::new(4, 300), TseOption::Slim));
    assert_eq!(h.store.loads(), [BlobId::new(4, 300), BlobId::new(4, 310)]);
}

#[test]
fn smart_tse_sends_chunks_of_small_blobs() {
    let h = split_harness(100);
    h.run(get_blob(BlobId::new(4, 300), TseOption::Smart));
    assert_eq!(h.store.loads().len(), 4);
}

#[test]
fn split_info_is_served_from_cache_the_second_time() {
    let h = split_harness(1_000_000);
    h.run(get_blob(BlobId::new(4, 300), TseOption::Slim));
    assert_eq!(h.services.split_info.len(), 1);

    let (_, _, headers) = h.run(get_blob(BlobId::new(4, 300), TseOption::Slim));
    assert_eq!(
        h.store.loads(),
        [BlobId::new(4, 300), BlobId::new(4, 310), BlobId::new(4, 300)]
    );
    let data = of_type(&headers, "blob", "data");
    assert_eq!(data.len(), 2);
    assert!(data.iter().all(|h| field(h, "id2_chunk") == Some("999999999")));
}

#[test]
fn bad_id2_info_is_reported() {
    let mut store = MemoryBlobStore::new(Delivery::Inline);
    store.insert_blob(
        4,
        BlobRecord {
            id2_info: Some("4.x.2".into()),
            ..record(300, 100)
        },
        chunks(),
    );
    let h = Harness::new(store, MemoryBioseqStore::new(Delivery::Inline), None);
    let (_, processors, headers) = h.run(get_blob(BlobId::new(4, 300), TseOption::Smart));

    assert_eq!(processors[0].status(), ProcessorStatus::Error);
    let msg = of_type(&headers, "blob_prop", "message");
    assert_eq!(field(msg[0], "code"), Some("304"));
}

#[test]
fn tse_chunk_request_loads_one_chunk() {
    let h = split_harness(100);
    let (_, processors, headers) = h.run(RequestPayload::TseChunk(TseChunkRequest {
        id2_chunk: 1,
        id2_info: "4.310.2".into(),
        use_cache: CacheUsage::Default,
    }));

    assert_eq!(processors[0].name(), "Cassandra-gettsechunk");
    assert_eq!(processors[0].status(), ProcessorStatus::Done);
    assert_eq!(h.store.loads(), [BlobId::new(4, 308)]);
    let props = of_type(&headers, "blob_prop", "data");
    assert_eq!(field(props[0], "id2_chunk"), Some("1"));
    assert_eq!(of_type(&headers, "blob", "data").len(), 2);
}

#[test]
fn tse_chunk_out_of_range_is_not_found() {
    let h = split_harness(100);
    let (_, processors, headers) = h.run(RequestPayload::TseChunk(TseChunkRequest {
        id2_chunk: 5,
        id2_info: "4.310.2".into(),
        use_cache: CacheUsage::Default,
    }));

    assert_eq!(processors[0].status(), ProcessorStatus::NotFound);
    let msg = of_type(&headers, "processor", "message");
    assert_eq!(field(msg[0], "code"), Some("312"));
    assert!(h.store.loads().is_empty());
}

fn client_options(client_id: &str) -> BlobOptions {
    BlobOptions {
        client_id: client_id.into(),
        ..BlobOptions::default()
    }
}

#[test]
fn blob_sent_to_a_client_is_skipped_next_time() {
    let h = Harness::standard();
    let (_, _, first) = h.run(get_by_seq_id(client_options("c1")));
    assert_eq!(of_type(&first, "blob", "data").len(), 2);

    let (_, _, second) = h.run(get_by_seq_id(client_options("c1")));
    assert!(of_type(&second, "blob", "data").is_empty());
    let skipped = of_type(&second, "blob", "meta");
    assert_eq!(field(skipped[0], "reason"), Some("sent"));
    assert!(field(skipped[0], "sent_seconds_ago").is_some());

    // Another client still gets it.
    let (_, _, other) = h.run(get_by_seq_id(client_options("c2")));
    assert_eq!(of_type(&other, "blob", "data").len(), 2);
}

#[test]
fn blob_in_flight_for_a_client_is_skipped() {
    let h = Harness::standard();
    h.services.exclude.add("c1", BlobId::new(4, 100));
    let (_, _, headers) = h.run(get_by_seq_id(client_options("c1")));

    let skipped = of_type(&headers, "blob", "meta");
    assert_eq!(field(skipped[0], "reason"), Some("inprogress"));
    assert!(h.store.loads().is_empty());
}

#[test]
fn concurrent_requests_of_one_client_send_the_blob_once() {
    for _ in 0..20 {
        let h = Harness::standard();
        let barrier = std::sync::Barrier::new(2);
        let results: Vec<Vec<Header>> = std::thread::scope(|s| {
            let runs: Vec<_> = (0..2)
                .map(|_| {
                    let (h, barrier) = (&h, &barrier);
                    s.spawn(move || {
                        barrier.wait();
                        h.run(get_by_seq_id(client_options("c1"))).2
                    })
                })
                .collect();
            runs.into_iter().map(|run| run.join().unwrap()).collect()
        });

        let sent: usize = results.iter().map(|r| of_type(r, "blob", "data").len()).sum();
        assert_eq!(sent, 2);
        let skipped: Vec<_> = results
            .iter()
            .flat_map(|r| of_type(r, "blob", "meta"))
            .filter_map(|m| field(m, "reason"))
            .collect();
        assert_eq!(skipped.len(), 1);
        assert!(matches!(skipped[0], "inprogress" | "sent"));
    }
}

#[test]
fn skipping_can_be_turned_off() {
    let h = Harness::standard();
    h.services.exclude.add("c1", BlobId::new(4, 100));
    let options = BlobOptions {
        auto_blob_skipping: false,
        ..client_options("c1")
    };
    let (_, _, headers) = h.run(get_by_seq_id(options));
    assert_eq!(of_type(&headers, "blob", "data").len(), 2);
}

#[test]
fn explicitly_excluded_blob_is_skipped() {
    let h = Harness::standard();
    let options = BlobOptions {
        exclude_blobs: vec![BlobId::new(4, 100)],
        ..BlobOptions::default()
    };
    let (_, processors, headers) = h.run(get_by_seq_id(options));

    assert_eq!(processors[0].status(), ProcessorStatus::Done);
    let skipped = of_type(&headers, "blob", "meta");
    assert_eq!(field(skipped[0], "reason"), Some("excluded"));
    assert!(h.store.loads().is_empty());
}

#[test]
fn failed_send_frees_the_exclude_slot() {
    let h = Harness::standard();
    h.store
        .fail_blob(BlobId::new(4, 100), BackendError::storage("read timeout"));
    h.run(get_by_seq_id(client_options("c1")));
    assert_eq!(h.services.exclude.blob_count("c1"), 0);
}

#[test]
fn named_annotations_are_sent_once_per_name() {
    let mut bioseq_store = MemoryBioseqStore::new(Delivery::Inline);
    bioseq_store.insert_bioseq(bioseq());
    bioseq_store.insert_annotation(NamedAnnotRecord {
        accession: "NC_000001".into(),
        version: 11,
        annot_name: "NA000000001.1".into(),
        sat: 4,
        sat_key: 100,
        ..Default::default()
    });
    let mut store = MemoryBlobStore::new(Delivery::Inline);
    store.insert_blob(4, record(100, 100), chunks());
    let h = Harness::new(store, bioseq_store, None);
    let (_, processors, headers) = h.run(RequestPayload::Annot(AnnotRequest {
        seq_id: SeqIdQuery::new("NC_000001.11"),
        names: vec!["NA000000001.1".into(), "NA000000002.1".into()],
        options: BlobOptions {
            tse_option: TseOption::None,
            ..BlobOptions::default()
        },
    }));

    assert_eq!(processors[0].status(), ProcessorStatus::Done);
    let na = of_type(&headers, "bioseq_na", "data");
    assert_eq!(na.len(), 1);
    assert_eq!(field(na[0], "na"), Some("NA000000001.1"));
    assert!(h.store.loads().is_empty());
}

#[test]
fn threaded_delivery_completes_the_reply() {
    let mut store = MemoryBlobStore::new(Delivery::Threaded);
    store.insert_blob(4, record(100, 100), chunks());
    let mut bioseq_store = MemoryBioseqStore::new(Delivery::Threaded);
    bioseq_store.insert_bioseq(bioseq());
    let h = Harness::new(store, bioseq_store, None);

    let request = Arc::new(Request::new(get_by_seq_id(BlobOptions::default())));
    let transport = MemoryTransport::new();
    let reply = Arc::new(Reply::new(transport.clone()));
    for p in h.dispatcher.dispatch_request(request, reply) {
        p.process();
    }
    let deadline = std::time::Instant::now() + core::time::Duration::from_secs(5);
    while !transport.is_finished() && std::time::Instant::now() < deadline {
        std::thread::sleep(core::time::Duration::from_millis(5));
    }
    assert!(transport.is_finished());
    assert_eq!(of_type(&transport.headers(), "blob", "data").len(), 2);
}

#[test]
fn cancel_before_processing_finishes_as_canceled() {
    let h = Harness::standard();
    let request = Arc::new(Request::new(get_blob(BlobId::new(4, 100), TseOption::Orig)));
    let transport = MemoryTransport::new();
    let reply = Arc::new(Reply::new(transport.clone()));
    let processors = h.dispatcher.dispatch_request(request, reply);

    processors[0].cancel();
    assert_eq!(processors[0].status(), ProcessorStatus::Canceled);
    assert!(transport.is_finished());

    processors[0].process();
    assert_eq!(processors[0].status(), ProcessorStatus::Canceled);
    assert!(of_type(&transport.headers(), "blob", "data").is_empty());
}

fn history_request(seq_id: &str) -> RequestPayload {
    RequestPayload::AccVerHistory(crate::request::AccVerHistoryRequest {
        seq_id: SeqIdQuery::new(seq_id),
        use_cache: CacheUsage::Default,
    })
}

#[test]
fn history_sends_one_item_per_version() {
    let mut bioseq_store = MemoryBioseqStore::new(Delivery::Inline);
    bioseq_store.insert_bioseq(bioseq());
    for version in [10, 11] {
        bioseq_store.insert_history(crate::backend::AccVerHistoryRecord {
            accession: "NC_000001".into(),
            version,
            sat: 4,
            sat_key: 100,
            ..Default::default()
        });
    }
    let h = Harness::new(MemoryBlobStore::new(Delivery::Inline), bioseq_store, None);
    let (_, processors, headers) = h.run(history_request("NC_000001.11"));

    assert_eq!(processors[0].name(), "Cassandra-accession-version-history");
    assert_eq!(processors[0].status(), ProcessorStatus::Done);
    assert_eq!(of_type(&headers, "acc_ver_history", "data").len(), 2);
    let meta = of_type(&headers, "acc_ver_history", "meta");
    assert!(meta.iter().all(|m| field(m, "n_chunks") == Some("2")));
    let done = of_type(&headers, "reply", "meta");
    assert_eq!(field(done[0], "n_chunks"), Some("5"));
}

#[test]
fn history_of_unknown_seq_id_is_not_found() {
    let h = Harness::standard();
    let (_, processors, headers) = h.run(history_request("XY_999999.1"));

    assert_eq!(processors[0].status(), ProcessorStatus::NotFound);
    assert!(of_type(&headers, "acc_ver_history", "data").is_empty());
    let msg = of_type(&headers, "processor", "message");
    assert_eq!(field(msg[0], "status"), Some("404"));
}
