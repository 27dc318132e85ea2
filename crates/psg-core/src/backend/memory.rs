//! In-process implementations of the collaborator traits.
//!
//! They back the unit tests and the server's fixture mode. Callbacks are
//! delivered either on the calling thread before `wait` returns
//! ([`Delivery::Inline`]) or from a short-lived thread
//! ([`Delivery::Threaded`]), which exercises the cross-thread paths of the
//! processors.

use super::{
    AccVerHistoryRecord, AnnotCallback, BackendError, BioseqInfo, BioseqStore, BlobRecord,
    BlobStore, BlobTask, CacheLookup, CddClient, ChunkCallback, CommentCallback, DataReadyCallback,
    ErrorCallback, HistoryCallback, LookupCache, NamedAnnotRecord, PropsCallback,
    PublicCommentTask, ResolveCallback, SnpClient, WgsBlob, WgsClient,
};
use crate::common::Result;
use crate::request::{BlobId, SeqIdQuery};
use bytes::Bytes;
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};
use serde::Deserialize;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    thread,
};

/// Where backend callbacks run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Delivery {
    /// On the thread calling `wait`, before it returns.
    #[default]
    Inline,
    /// On a fresh thread.
    Threaded,
}

impl Delivery {
    fn run(self, job: impl FnOnce() + Send + 'static) {
        match self {
            Self::Inline => job(),
            Self::Threaded => {
                // A failed spawn falls back to the calling thread.
                let job = Arc::new(Mutex::new(Some(job)));
                let spawned = Arc::clone(&job);
                let result = thread::Builder::new()
                    .name("memory-backend".into())
                    .spawn(move || {
                        if let Some(job) = spawned.lock().take() {
                            job();
                        }
                    });
                if result.is_err() {
                    if let Some(job) = job.lock().take() {
                        job();
                    }
                }
            }
        }
    }
}

#[derive(Clone)]
struct StoredBlob {
    record: BlobRecord,
    chunks: Vec<Bytes>,
}

/// A blob table held in memory.
#[derive(Default)]
pub struct MemoryBlobStore {
    delivery: Delivery,
    sats: HashSet<i32>,
    blobs: HashMap<BlobId, StoredBlob>,
    comments: HashMap<BlobId, String>,
    failures: Mutex<HashMap<BlobId, BackendError>>,
    loads: Mutex<Vec<BlobId>>,
}

impl MemoryBlobStore {
    pub fn new(delivery: Delivery) -> Self {
        Self {
            delivery,
            ..Default::default()
        }
    }

    /// Declares `sat` as served by this store even without blobs in it.
    pub fn add_sat(&mut self, sat: i32) {
        self.sats.insert(sat);
    }

    pub fn insert_blob(&mut self, sat: i32, record: BlobRecord, chunks: Vec<Bytes>) {
        self.sats.insert(sat);
        self.blobs
            .insert(BlobId::new(sat, record.sat_key), StoredBlob { record, chunks });
    }

    pub fn insert_comment(&mut self, blob_id: BlobId, comment: impl Into<String>) {
        self.comments.insert(blob_id, comment.into());
    }

    /// Every later load of `blob_id` reports `error` instead of data.
    pub fn fail_blob(&self, blob_id: BlobId, error: BackendError) {
        self.failures.lock().insert(blob_id, error);
    }

    /// Blob ids passed to `load_blob`, in call order.
    pub fn loads(&self) -> Vec<BlobId> {
        self.loads.lock().clone()
    }
}

impl BlobStore for MemoryBlobStore {
    fn knows_sat(&self, sat: i32) -> bool {
        self.sats.contains(&sat)
    }

    fn load_blob(
        &self,
        blob_id: BlobId,
        props: Option<BlobRecord>,
        load_chunks: bool,
    ) -> Arc<dyn BlobTask> {
        self.loads.lock().push(blob_id);
        Arc::new(MemoryBlobTask {
            delivery: self.delivery,
            props,
            load_chunks,
            stored: self.blobs.get(&blob_id).cloned(),
            failure: self.failures.lock().get(&blob_id).cloned(),
            sat_key: blob_id.sat_key,
            callbacks: Mutex::new(BlobCallbacks::default()),
            canceled: Arc::new(AtomicBool::new(false)),
        })
    }

    fn load_public_comment(&self, blob_id: BlobId, _record: &BlobRecord) -> Arc<dyn PublicCommentTask> {
        Arc::new(MemoryCommentTask {
            delivery: self.delivery,
            comment: self.comments.get(&blob_id).cloned(),
            callbacks: Mutex::new(CommentCallbacks::default()),
            canceled: Arc::new(AtomicBool::new(false)),
        })
    }
}

#[derive(Default)]
struct BlobCallbacks {
    props: Option<PropsCallback>,
    chunk: Option<ChunkCallback>,
    error: Option<ErrorCallback>,
    data_ready: Option<DataReadyCallback>,
}

struct MemoryBlobTask {
    delivery: Delivery,
    props: Option<BlobRecord>,
    load_chunks: bool,
    stored: Option<StoredBlob>,
    failure: Option<BackendError>,
    sat_key: i32,
    callbacks: Mutex<BlobCallbacks>,
    canceled: Arc<AtomicBool>,
}

impl BlobTask for MemoryBlobTask {
    fn set_data_ready_cb(&self, cb: DataReadyCallback) {
        self.callbacks.lock().data_ready = Some(cb);
    }

    fn set_error_cb(&self, cb: ErrorCallback) {
        self.callbacks.lock().error = Some(cb);
    }

    fn set_props_callback(&self, cb: PropsCallback) {
        self.callbacks.lock().props = Some(cb);
    }

    fn set_chunk_callback(&self, cb: ChunkCallback) {
        self.callbacks.lock().chunk = Some(cb);
    }

    fn wait(&self) {
        let mut cbs = core::mem::take(&mut *self.callbacks.lock());
        let canceled = Arc::clone(&self.canceled);
        let props = self.props.clone();
        let stored = self.stored.clone();
        let failure = self.failure.clone();
        let load_chunks = self.load_chunks;
        let sat_key = self.sat_key;

        self.delivery.run(move || {
            let live = || !canceled.load(Ordering::Acquire);
            if !live() {
                return;
            }
            if let Some(error) = failure {
                if let Some(cb) = cbs.error.as_mut() {
                    cb(error);
                }
                return;
            }
            let chunks = match (props, stored) {
                (Some(_), Some(stored)) => stored.chunks,
                (Some(_), None) => Vec::new(),
                (None, Some(stored)) => {
                    if let Some(cb) = cbs.props.as_mut() {
                        cb(&stored.record, true);
                    }
                    stored.chunks
                }
                (None, None) => {
                    if let Some(cb) = cbs.props.as_mut() {
                        let missing = BlobRecord {
                            sat_key,
                            ..Default::default()
                        };
                        cb(&missing, false);
                    }
                    return;
                }
            };
            if !load_chunks {
                return;
            }
            if let Some(cb) = cbs.chunk.as_mut() {
                for (no, chunk) in chunks.iter().enumerate() {
                    if !live() {
                        return;
                    }
                    cb(chunk, no as i32);
                }
                if live() {
                    cb(&[], -1);
                }
            }
            if let Some(cb) = cbs.data_ready.as_ref() {
                cb();
            }
        });
    }

    fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }
}

#[derive(Default)]
struct CommentCallbacks {
    comment: Option<CommentCallback>,
    error: Option<ErrorCallback>,
}

struct MemoryCommentTask {
    delivery: Delivery,
    comment: Option<String>,
    callbacks: Mutex<CommentCallbacks>,
    canceled: Arc<AtomicBool>,
}

impl PublicCommentTask for MemoryCommentTask {
    fn set_comment_callback(&self, cb: CommentCallback) {
        self.callbacks.lock().comment = Some(cb);
    }

    fn set_error_cb(&self, cb: ErrorCallback) {
        self.callbacks.lock().error = Some(cb);
    }

    fn wait(&self) {
        let mut cbs = core::mem::take(&mut *self.callbacks.lock());
        let comment = self.comment.clone();
        let canceled = Arc::clone(&self.canceled);
        self.delivery.run(move || {
            if canceled.load(Ordering::Acquire) {
                return;
            }
            if let Some(cb) = cbs.comment.as_mut() {
                cb(comment);
            }
        });
    }

    fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }
}

/// A lookup cache over fixed data; can be switched into a failing state.
#[derive(Default)]
pub struct MemoryLookupCache {
    blob_props: HashMap<BlobId, BlobRecord>,
    bioseqs: Vec<BioseqInfo>,
    broken: AtomicBool,
}

impl MemoryLookupCache {
    pub fn insert_blob_prop(&mut self, sat: i32, record: BlobRecord) {
        self.blob_props.insert(BlobId::new(sat, record.sat_key), record);
    }

    pub fn insert_bioseq(&mut self, info: BioseqInfo) {
        self.bioseqs.push(info);
    }

    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::Release);
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }
}

impl LookupCache for MemoryLookupCache {
    fn lookup_blob_prop(&self, sat: i32, sat_key: i32, last_modified: Option<i64>) -> CacheLookup<BlobRecord> {
        if self.is_broken() {
            return CacheLookup::Error("lookup cache is unavailable".into());
        }
        match self.blob_props.get(&BlobId::new(sat, sat_key)) {
            Some(r) if last_modified.is_none_or(|lm| lm == r.last_modified) => CacheLookup::Hit(r.clone()),
            _ => CacheLookup::NotHit,
        }
    }

    fn lookup_bioseq_info(&self, query: &SeqIdQuery) -> CacheLookup<BioseqInfo> {
        if self.is_broken() {
            return CacheLookup::Error("lookup cache is unavailable".into());
        }
        best_match(&self.bioseqs, query).map_or(CacheLookup::NotHit, CacheLookup::Hit)
    }
}

/// The latest version among the records matching `query`.
fn best_match(bioseqs: &[BioseqInfo], query: &SeqIdQuery) -> Option<BioseqInfo> {
    bioseqs
        .iter()
        .filter(|b| b.matches(query))
        .max_by_key(|b| b.version)
        .cloned()
}

/// Bioseq, named annotation and history tables held in memory.
#[derive(Default)]
pub struct MemoryBioseqStore {
    delivery: Delivery,
    bioseqs: Vec<BioseqInfo>,
    annotations: Vec<NamedAnnotRecord>,
    history: Vec<AccVerHistoryRecord>,
    failure: Mutex<Option<BackendError>>,
    resolves: AtomicUsize,
}

impl MemoryBioseqStore {
    pub fn new(delivery: Delivery) -> Self {
        Self {
            delivery,
            ..Default::default()
        }
    }

    pub fn insert_bioseq(&mut self, info: BioseqInfo) {
        self.bioseqs.push(info);
    }

    pub fn insert_annotation(&mut self, annot: NamedAnnotRecord) {
        self.annotations.push(annot);
    }

    pub fn insert_history(&mut self, record: AccVerHistoryRecord) {
        self.history.push(record);
    }

    /// Every later call answers with `error`.
    pub fn fail_with(&self, error: BackendError) {
        *self.failure.lock() = Some(error);
    }

    /// Number of `resolve` calls that reached the store.
    pub fn resolve_count(&self) -> usize {
        self.resolves.load(Ordering::Relaxed)
    }

    fn failure(&self) -> Option<BackendError> {
        self.failure.lock().clone()
    }
}

impl BioseqStore for MemoryBioseqStore {
    fn resolve(&self, query: &SeqIdQuery, cb: ResolveCallback) {
        self.resolves.fetch_add(1, Ordering::Relaxed);
        let result = match self.failure() {
            Some(e) => Err(e),
            None => Ok(best_match(&self.bioseqs, query)),
        };
        self.delivery.run(move || cb(result));
    }

    fn named_annotations(&self, info: &BioseqInfo, names: &[String], cb: AnnotCallback) {
        let result = match self.failure() {
            Some(e) => Err(e),
            None => Ok(self
                .annotations
                .iter()
                .filter(|a| {
                    a.accession == info.accession
                        && a.version == info.version
                        && names.iter().any(|n| *n == a.annot_name)
                })
                .cloned()
                .collect()),
        };
        self.delivery.run(move || cb(result));
    }

    fn acc_ver_history(&self, accession: &str, cb: HistoryCallback) {
        let result = match self.failure() {
            Some(e) => Err(e),
            None => Ok(self
                .history
                .iter()
                .filter(|h| h.accession == accession)
                .cloned()
                .collect()),
        };
        self.delivery.run(move || cb(result));
    }
}

fn annot_matches(annot: &NamedAnnotRecord, query: &SeqIdQuery) -> bool {
    let (accession, version) = query.accession_version();
    annot.accession == accession && version.is_none_or(|v| v == annot.version)
}

#[derive(Default)]
pub struct MemoryCddClient {
    annotations: Vec<NamedAnnotRecord>,
}

impl MemoryCddClient {
    pub fn new(annotations: Vec<NamedAnnotRecord>) -> Self {
        Self { annotations }
    }
}

impl CddClient for MemoryCddClient {
    fn fetch_annotation(&self, query: &SeqIdQuery) -> Result<Option<NamedAnnotRecord>> {
        Ok(self
            .annotations
            .iter()
            .find(|a| annot_matches(a, query))
            .cloned())
    }
}

#[derive(Default)]
pub struct MemorySnpClient {
    annotations: Vec<NamedAnnotRecord>,
}

impl MemorySnpClient {
    pub fn new(annotations: Vec<NamedAnnotRecord>) -> Self {
        Self { annotations }
    }
}

impl SnpClient for MemorySnpClient {
    fn fetch_annotations(&self, query: &SeqIdQuery, names: &[String]) -> Result<Vec<NamedAnnotRecord>> {
        Ok(self
            .annotations
            .iter()
            .filter(|a| annot_matches(a, query) && names.contains(&a.annot_name))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryWgsClient {
    bioseqs: Vec<BioseqInfo>,
    blobs: HashMap<String, WgsBlob>,
}

impl MemoryWgsClient {
    pub fn insert(&mut self, info: BioseqInfo, blob: Option<WgsBlob>) {
        if let Some(blob) = blob {
            self.blobs.insert(info.accession.clone(), blob);
        }
        self.bioseqs.push(info);
    }
}

impl WgsClient for MemoryWgsClient {
    fn resolve(&self, query: &SeqIdQuery) -> Result<Option<BioseqInfo>> {
        Ok(best_match(&self.bioseqs, query))
    }

    fn fetch_blob(&self, query: &SeqIdQuery) -> Result<Option<WgsBlob>> {
        Ok(best_match(&self.bioseqs, query).and_then(|info| self.blobs.get(&info.accession).cloned()))
    }
}

/// A blob entry of a [`Fixture`]. Chunks are given as text.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct FixtureBlob {
    pub sat: i32,
    #[serde(flatten)]
    pub record: BlobRecord,
    pub chunks: Vec<String>,
    pub comment: Option<String>,
    /// Also present in the lookup cache.
    pub cached: bool,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct FixtureWgs {
    #[serde(flatten)]
    pub info: BioseqInfo,
    pub blob_id: Option<String>,
    pub chunks: Vec<String>,
}

/// Everything the in-memory backends serve, loadable from JSON.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Fixture {
    pub blobs: Vec<FixtureBlob>,
    pub bioseqs: Vec<BioseqInfo>,
    /// Subset of `bioseqs` (by accession) also present in the lookup cache.
    pub cached_bioseqs: Vec<String>,
    pub annotations: Vec<NamedAnnotRecord>,
    pub history: Vec<AccVerHistoryRecord>,
    pub cdd: Vec<NamedAnnotRecord>,
    pub snp: Vec<NamedAnnotRecord>,
    pub wgs: Vec<FixtureWgs>,
}

/// The in-memory backends built from one [`Fixture`].
pub struct MemoryBackends {
    pub blobs: Arc<MemoryBlobStore>,
    pub bioseqs: Arc<MemoryBioseqStore>,
    pub cache: Arc<MemoryLookupCache>,
    pub cdd: Arc<MemoryCddClient>,
    pub snp: Arc<MemorySnpClient>,
    pub wgs: Arc<MemoryWgsClient>,
}

impl Fixture {
    pub fn into_backends(self, delivery: Delivery) -> MemoryBackends {
        let mut blobs = MemoryBlobStore::new(delivery);
        let mut cache = MemoryLookupCache::default();
        for blob in self.blobs {
            let id = BlobId::new(blob.sat, blob.record.sat_key);
            if blob.cached {
                cache.insert_blob_prop(blob.sat, blob.record.clone());
            }
            if let Some(comment) = blob.comment {
                blobs.insert_comment(id, comment);
            }
            let chunks = blob.chunks.into_iter().map(Bytes::from).collect();
            blobs.insert_blob(blob.sat, blob.record, chunks);
        }

        let mut bioseqs = MemoryBioseqStore::new(delivery);
        for info in self.bioseqs {
            if self.cached_bioseqs.contains(&info.accession) {
                cache.insert_bioseq(info.clone());
            }
            blobs.add_sat(info.sat);
            bioseqs.insert_bioseq(info);
        }
        for annot in self.annotations {
            bioseqs.insert_annotation(annot);
        }
        for record in self.history {
            bioseqs.insert_history(record);
        }

        let mut wgs = MemoryWgsClient::default();
        for entry in self.wgs {
            let blob = entry.blob_id.map(|blob_id| WgsBlob {
                blob_id,
                chunks: entry.chunks.into_iter().map(Bytes::from).collect(),
            });
            wgs.insert(entry.info, blob);
        }

        MemoryBackends {
            blobs: Arc::new(blobs),
            bioseqs: Arc::new(bioseqs),
            cache: Arc::new(cache),
            cdd: Arc::new(MemoryCddClient::new(self.cdd)),
            snp: Arc::new(MemorySnpClient::new(self.snp)),
            wgs: Arc::new(wgs),
        }
    }
}
