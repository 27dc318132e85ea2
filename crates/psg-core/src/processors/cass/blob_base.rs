use super::fetch::{CassBlobFetch, CommentFetch, FetchRole};
use super::{CassProcessorKind, CassServices, GROUP_NAME};
use crate::backend::{BackendError, BioseqInfo, BlobRecord, CacheLookup, Id2Info, NamedAnnotRecord};
use crate::cache::AddResult;
use crate::common::{ErrorCode, ProcessorStatus, status};
use crate::processor::{Processor, ProcessorContext, ProcessorState};
use crate::processors::{LocalStatus, StartGate, claim, to_json};
use crate::protocol::{SPLIT_INFO_CHUNK, SkipReason};
use crate::reply::{Diagnostic, Reply};
use crate::request::{BlobId, BlobOptions, CacheUsage, Request, RequestPayload, TseOption};
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

#[derive(Default)]
struct Inner {
    fetches: Vec<Arc<CassBlobFetch>>,
    comments: Vec<Arc<CommentFetch>>,
    /// Seq-id resolutions and annotation lookups still outstanding.
    pending: usize,
    /// Blobs registered in the exclude cache by this request.
    excluded: Vec<BlobId>,
}

/// Serves get, getblob, get_tse_chunk and get_na out of the blob storage.
///
/// Work is a set of blob fetches plus a few lookups. New fetches are always
/// registered before the fetch that spawned them is marked finished, so the
/// processor finishes exactly when the last piece of work does.
pub struct CassBlobProcessor {
    ctx: ProcessorContext,
    services: Arc<CassServices>,
    kind: CassProcessorKind,
    options: BlobOptions,
    state: ProcessorState,
    local: LocalStatus,
    gate: StartGate,
    canceled: AtomicBool,
    finalized: AtomicBool,
    inner: Mutex<Inner>,
    me: Weak<Self>,
}

impl CassBlobProcessor {
    pub(super) fn create(
        ctx: ProcessorContext,
        services: Arc<CassServices>,
        kind: CassProcessorKind,
    ) -> Option<Arc<dyn Processor>> {
        let options = match ctx.request().payload() {
            RequestPayload::BlobBySatSatKey(r) => r.options.clone(),
            RequestPayload::BlobBySeqId(r) => r.options.clone(),
            RequestPayload::Annot(r) => r.options.clone(),
            RequestPayload::TseChunk(r) => BlobOptions {
                tse_option: TseOption::Unknown,
                use_cache: r.use_cache,
                ..BlobOptions::default()
            },
            _ => return None,
        };
        Some(Arc::new_cyclic(|me| Self {
            ctx,
            services,
            kind,
            options,
            state: ProcessorState::new(),
            local: LocalStatus::new(),
            gate: StartGate::default(),
            canceled: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            inner: Mutex::new(Inner::default()),
            me: me.clone(),
        }))
    }

    fn pid(&self) -> &'static str {
        self.kind.name()
    }

    fn reply(&self) -> &Reply {
        self.ctx.reply()
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Asks for the right to write; on refusal goes down the cancel path.
    fn admit(&self) -> bool {
        if self.gate.admit(&self.ctx) {
            return true;
        }
        self.cancel();
        false
    }

    fn processor_message(&self, code: u16, error_code: ErrorCode, text: &str) {
        self.local.raise(code);
        let reply = self.reply();
        reply.prepare_processor_message(reply.item_id(), self.pid(), Diagnostic::error(text, code, error_code));
    }

    // ---------------------------------------------------------------
    // Starting points
    // ---------------------------------------------------------------

    fn start_lookup(&self) {
        self.inner.lock().pending += 1;
    }

    fn end_lookup(&self) {
        let mut inner = self.inner.lock();
        inner.pending = inner.pending.saturating_sub(1);
    }

    /// Registers `new` and marks `done` finished in one step, then starts the
    /// loaders outside the lock.
    fn launch(&self, new: Vec<Arc<CassBlobFetch>>, done: Option<&CassBlobFetch>) {
        {
            let mut inner = self.inner.lock();
            inner.fetches.extend(new.iter().cloned());
            if let Some(done) = done {
                done.mark_finished();
            }
        }
        for fetch in new {
            if let Some(task) = fetch.task() {
                if self.is_canceled() {
                    task.cancel();
                    fetch.mark_finished();
                } else {
                    task.wait();
                }
            }
        }
    }

    /// Creates a fetch and its loader with callbacks wired back here. The
    /// loader is not started.
    fn new_fetch(
        &self,
        blob_id: BlobId,
        role: FetchRole,
        derived: bool,
        id2: Option<(i64, String)>,
        props: Option<BlobRecord>,
    ) -> Arc<CassBlobFetch> {
        let collect = id2.as_ref().is_some_and(|(chunk, _)| *chunk == SPLIT_INFO_CHUNK);
        let fetch = Arc::new(CassBlobFetch::new(blob_id, role, derived, id2, collect));
        if let Some(props) = &props {
            fetch.set_last_modified(props.last_modified);
        }
        let load_chunks = role != FetchRole::Main;
        let task = self.services.store.load_blob(blob_id, props, load_chunks);

        let (me, weak) = (self.me.clone(), Arc::downgrade(&fetch));
        task.set_props_callback(Box::new(move |record, found| {
            if let (Some(me), Some(fetch)) = (me.upgrade(), weak.upgrade()) {
                me.on_props(&fetch, record, found);
                me.peek();
            }
        }));
        let (me, weak) = (self.me.clone(), Arc::downgrade(&fetch));
        task.set_chunk_callback(Box::new(move |data, chunk_no| {
            if let (Some(me), Some(fetch)) = (me.upgrade(), weak.upgrade()) {
                me.on_chunk(&fetch, data, chunk_no);
                me.peek();
            }
        }));
        let (me, weak) = (self.me.clone(), Arc::downgrade(&fetch));
        task.set_error_cb(Box::new(move |error| {
            if let (Some(me), Some(fetch)) = (me.upgrade(), weak.upgrade()) {
                me.on_error(&fetch, error);
                me.peek();
            }
        }));
        if let Some(cb) = self.reply().data_ready_cb() {
            task.set_data_ready_cb(cb);
        }
        fetch.set_task(task);
        fetch
    }

    /// Fetches the properties of `blob_id`, from the lookup cache when
    /// allowed.
    fn start_blob(&self, blob_id: BlobId, derived: bool) {
        let use_cache = self.options.use_cache;
        let cached = match (&self.services.cache, use_cache) {
            (_, CacheUsage::DbOnly) => None,
            (Some(cache), _) => Some(cache.lookup_blob_prop(
                blob_id.sat,
                blob_id.sat_key,
                self.options.last_modified,
            )),
            (None, _) => Some(CacheLookup::NotHit),
        };
        match (cached, use_cache) {
            (Some(CacheLookup::Hit(record)), _) => {
                let fetch = Arc::new(CassBlobFetch::new(blob_id, FetchRole::Main, derived, None, false));
                self.launch(vec![Arc::clone(&fetch)], None);
                self.on_props(&fetch, &record, true);
            }
            (Some(CacheLookup::NotHit), CacheUsage::CacheOnly) => {
                let fetch = Arc::new(CassBlobFetch::new(blob_id, FetchRole::Main, derived, None, false));
                self.launch(vec![Arc::clone(&fetch)], None);
                let missing = BlobRecord {
                    sat_key: blob_id.sat_key,
                    ..BlobRecord::default()
                };
                self.on_props(&fetch, &missing, false);
            }
            (Some(CacheLookup::Error(message)), CacheUsage::CacheOnly) => {
                let fetch = Arc::new(CassBlobFetch::new(blob_id, FetchRole::Main, derived, None, false));
                self.launch(vec![Arc::clone(&fetch)], None);
                self.on_error(&fetch, BackendError::lookup_cache(message));
            }
            _ => {
                let fetch = self.new_fetch(blob_id, FetchRole::Main, derived, None, None);
                self.launch(vec![fetch], None);
            }
        }
    }

    /// Applies the client's skip rules to a blob found through a lookup,
    /// then fetches it.
    fn start_derived_blob(&self, blob_id: BlobId) {
        if self.options.exclude_blobs.contains(&blob_id) {
            if self.admit() {
                self.reply()
                    .prepare_blob_excluded(self.pid(), &blob_id.to_string(), SkipReason::Excluded, None);
            }
            return;
        }
        let client_id = &self.options.client_id;
        if !client_id.is_empty() {
            match self.services.exclude.add(client_id, blob_id) {
                AddResult::Added => self.inner.lock().excluded.push(blob_id),
                AddResult::InProgress if self.options.auto_blob_skipping => {
                    if self.admit() {
                        self.reply().prepare_blob_excluded(
                            self.pid(),
                            &blob_id.to_string(),
                            SkipReason::InProgress,
                            None,
                        );
                    }
                    return;
                }
                AddResult::Completed {
                    sent_ago,
                    until_resend,
                } if self.options.auto_blob_skipping => {
                    if self.admit() {
                        self.reply().prepare_blob_excluded_sent(
                            self.pid(),
                            &blob_id.to_string(),
                            sent_ago,
                            until_resend,
                            None,
                        );
                    }
                    return;
                }
                _ => {}
            }
        }
        self.start_blob(blob_id, true);
    }

    fn start_tse_chunk(&self, id2_chunk: i64, id2_info: &str) {
        let id2 = match id2_info.parse::<Id2Info>() {
            Ok(id2) => id2,
            Err(e) => {
                if self.admit() {
                    self.processor_message(status::INTERNAL, ErrorCode::BadId2Info, &e.to_string());
                }
                return;
            }
        };
        let new = if id2_chunk == SPLIT_INFO_CHUNK {
            self.split_info_fetch(&id2, false).into_iter().collect()
        } else if let Some(blob_id) = id2.chunk_blob(id2_chunk) {
            vec![self.new_fetch(blob_id, FetchRole::Split, false, Some((id2_chunk, id2.to_string())), None)]
        } else {
            if self.admit() {
                let text = format!("Invalid id2_chunk {id2_chunk} for id2_info {id2}");
                self.processor_message(status::NOT_FOUND, ErrorCode::BlobChunkNotFound, &text);
            }
            return;
        };
        self.launch(new, None);
    }

    /// The split-info fetch, or `None` when the cached copy was sent right
    /// away.
    fn split_info_fetch(&self, id2: &Id2Info, derived: bool) -> Option<Arc<CassBlobFetch>> {
        let info_blob = id2.info_blob();
        let id2_info = id2.to_string();
        if let Some(chunks) = self.services.split_info.get(&info_blob) {
            if self.admit() {
                let reply = self.reply();
                let item = reply.item_id();
                for (no, chunk) in chunks.iter().enumerate() {
                    reply.prepare_tse_blob_data(item, self.pid(), no as i32, SPLIT_INFO_CHUNK, &id2_info, chunk);
                }
                reply.prepare_blob_completion(item, self.pid(), chunks.len() + 1);
            }
            return None;
        }
        Some(self.new_fetch(info_blob, FetchRole::Split, derived, Some((SPLIT_INFO_CHUNK, id2_info)), None))
    }

    fn chunk_fetches(&self, id2: &Id2Info, derived: bool) -> Vec<Arc<CassBlobFetch>> {
        let id2_info = id2.to_string();
        (1..=i64::from(id2.chunks))
            .filter_map(|k| {
                let blob_id = id2.chunk_blob(k)?;
                Some(self.new_fetch(blob_id, FetchRole::Split, derived, Some((k, id2_info.clone())), None))
            })
            .collect()
    }

    // ---------------------------------------------------------------
    // Lookup callbacks
    // ---------------------------------------------------------------

    fn on_seq_id_resolved(&self, result: Result<Option<BioseqInfo>, BackendError>) {
        if !self.is_canceled() {
            match result {
                Ok(Some(info)) => self.start_derived_blob(info.blob_id()),
                Ok(None) => {
                    if self.admit() {
                        let text = format!("Could not resolve seq_id {}", self.seq_id_text());
                        self.processor_message(status::NOT_FOUND, ErrorCode::UnresolvedSeqId, &text);
                    }
                }
                Err(e) => {
                    if self.admit() {
                        self.processor_message(e.status.max(status::INTERNAL), e.code, &e.message);
                    }
                }
            }
        }
        self.end_lookup();
    }

    fn on_annot_resolved(&self, result: Result<Option<BioseqInfo>, BackendError>, names: Vec<String>) {
        if !self.is_canceled() {
            match result {
                Ok(Some(info)) => {
                    self.start_lookup();
                    let me = self.me.clone();
                    self.services.bioseq.named_annotations(
                        &info,
                        &names,
                        Box::new(move |result| {
                            if let Some(me) = me.upgrade() {
                                me.on_annotations(result);
                                me.peek();
                            }
                        }),
                    );
                }
                Ok(None) => {
                    if self.admit() {
                        let text = format!("Could not resolve seq_id {}", self.seq_id_text());
                        self.processor_message(status::NOT_FOUND, ErrorCode::UnresolvedSeqId, &text);
                    }
                }
                Err(e) => {
                    if self.admit() {
                        self.processor_message(e.status.max(status::INTERNAL), e.code, &e.message);
                    }
                }
            }
        }
        self.end_lookup();
    }

    fn on_annotations(&self, result: Result<Vec<NamedAnnotRecord>, BackendError>) {
        if !self.is_canceled() {
            match result {
                Ok(records) if records.is_empty() => self.local.raise(status::NOT_FOUND),
                Ok(records) => self.send_annotations(&records),
                Err(e) => {
                    if self.admit() {
                        self.processor_message(e.status.max(status::INTERNAL), e.code, &e.message);
                    }
                }
            }
        }
        self.end_lookup();
    }

    fn send_annotations(&self, records: &[NamedAnnotRecord]) {
        for record in records {
            if !claim(&self.ctx, &record.annot_name) {
                continue;
            }
            if !self.admit() {
                return;
            }
            let Some(content) = to_json(record, &self.local, "named annotation") else {
                continue;
            };
            self.reply()
                .prepare_named_annotation_data(&record.annot_name, self.pid(), &content);
            if self.options.tse_option != TseOption::None {
                self.start_derived_blob(record.blob_id());
            }
        }
    }

    fn seq_id_text(&self) -> String {
        self.ctx
            .request()
            .payload()
            .seq_id()
            .map(ToString::to_string)
            .unwrap_or_default()
    }

    // ---------------------------------------------------------------
    // Blob callbacks
    // ---------------------------------------------------------------

    fn on_props(&self, fetch: &CassBlobFetch, record: &BlobRecord, found: bool) {
        if fetch.is_finished() || self.is_canceled() || !self.admit() {
            return;
        }
        let (reply, pid) = (self.reply(), self.pid());
        if !found {
            let code = if fetch.derived {
                #[cfg(feature = "tracing")]
                tracing::error!(
                    request_id = self.ctx.request().id(),
                    "Data inconsistency: blob {} is referenced but its properties are missing",
                    fetch.blob_id
                );
                status::INTERNAL
            } else {
                status::NOT_FOUND
            };
            self.local.raise(code);
            let text = format!("Blob {} properties are not found", fetch.blob_id);
            fetch.send_prop_message(reply, pid, Diagnostic::error(&text, code, ErrorCode::BlobPropsNotFound));
            fetch.send_prop_completion(reply, pid);
            self.forget_excluded(fetch.blob_id);
            fetch.mark_finished();
            return;
        }

        fetch.set_last_modified(record.last_modified);
        if fetch.role == FetchRole::Main && record.needs_public_comment() {
            self.start_public_comment(fetch.blob_id, record);
        }
        let Some(content) = to_json(record, &self.local, "blob properties") else {
            let text = format!("Blob {} properties cannot be encoded", fetch.blob_id);
            fetch.send_prop_message(reply, pid, Diagnostic::error(&text, status::INTERNAL, ErrorCode::UnknownError));
            fetch.send_prop_completion(reply, pid);
            self.forget_excluded(fetch.blob_id);
            fetch.mark_finished();
            return;
        };
        fetch.send_prop_data(reply, pid, &content);

        if record.is_restricted() {
            fetch.send_prop_completion(reply, pid);
            let text = format!("Blob {} retrieval is not authorized", fetch.blob_id);
            fetch.send_blob_message(
                reply,
                pid,
                Diagnostic::error(&text, status::FORBIDDEN, ErrorCode::BlobRetrievalIsNotAuthorized),
            );
            fetch.send_blob_completion(reply, pid);
            self.ctx.request().update_overall_status(status::FORBIDDEN);
            self.forget_excluded(fetch.blob_id);
            fetch.mark_finished();
            return;
        }

        match fetch.role {
            FetchRole::Main => self.choose_tse_strategy(fetch, record),
            FetchRole::Original | FetchRole::Split => fetch.send_prop_completion(reply, pid),
        }
    }

    /// Decides which blobs to send for a main fetch whose properties just
    /// arrived.
    fn choose_tse_strategy(&self, fetch: &CassBlobFetch, record: &BlobRecord) {
        let (reply, pid) = (self.reply(), self.pid());
        let id2 = match record.id2_info.as_deref().filter(|s| !s.is_empty()) {
            None => None,
            Some(text) => match text.parse::<Id2Info>() {
                Ok(id2) => Some(id2),
                Err(e) => {
                    self.local.raise(status::INTERNAL);
                    fetch.send_prop_message(
                        reply,
                        pid,
                        Diagnostic::error(&e.to_string(), status::INTERNAL, ErrorCode::BadId2Info),
                    );
                    fetch.send_prop_completion(reply, pid);
                    fetch.mark_finished();
                    return;
                }
            },
        };

        let threshold = self.services.settings.send_blob_if_small.max(self.options.send_blob_if_small);
        let small = record.size <= threshold;
        let derived = fetch.derived;
        let original = || self.new_fetch(fetch.blob_id, FetchRole::Original, derived, None, Some(record.clone()));

        let mut new = Vec::new();
        match (self.options.tse_option, id2) {
            (TseOption::None | TseOption::Unknown, _) => {}
            (TseOption::Orig, _) | (TseOption::Smart | TseOption::Whole, None) => new.push(original()),
            (TseOption::Slim, None) => {
                if small {
                    new.push(original());
                }
            }
            (TseOption::Slim | TseOption::Smart, Some(id2)) => {
                new.extend(self.split_info_fetch(&id2, derived));
                if small {
                    new.extend(self.chunk_fetches(&id2, derived));
                }
            }
            (TseOption::Whole, Some(id2)) => {
                new.extend(self.split_info_fetch(&id2, derived));
                new.extend(self.chunk_fetches(&id2, derived));
            }
        }
        fetch.send_prop_completion(reply, pid);
        self.launch(new, Some(fetch));
    }

    fn on_chunk(&self, fetch: &CassBlobFetch, data: &[u8], chunk_no: i32) {
        if fetch.is_finished() || self.is_canceled() || !self.admit() {
            return;
        }
        let (reply, pid) = (self.reply(), self.pid());
        if chunk_no >= 0 {
            fetch.send_blob_data(reply, pid, chunk_no, data);
            return;
        }
        fetch.send_blob_completion(reply, pid);
        if fetch.collects() {
            self.services.split_info.put(fetch.blob_id, fetch.take_collected());
        }
        fetch.mark_finished();
    }

    fn on_error(&self, fetch: &CassBlobFetch, error: BackendError) {
        if fetch.is_finished() || self.is_canceled() || !self.admit() {
            return;
        }
        let (reply, pid) = (self.reply(), self.pid());
        if !error.severity.is_error() {
            reply.prepare_processor_message(
                reply.item_id(),
                pid,
                Diagnostic::new(&error.message, error.status, error.code, error.severity),
            );
            return;
        }
        #[cfg(feature = "tracing")]
        tracing::error!(request_id = self.ctx.request().id(), "Blob {} failed: {error}", fetch.blob_id);
        self.local.raise(status::INTERNAL);
        let msg = Diagnostic::new(&error.message, status::INTERNAL, error.code, error.severity);
        if fetch.prop_sent() {
            fetch.send_blob_message(reply, pid, msg);
            fetch.send_blob_completion(reply, pid);
        } else {
            fetch.send_prop_message(reply, pid, msg);
            fetch.send_prop_completion(reply, pid);
        }
        self.forget_excluded(fetch.blob_id);
        fetch.mark_finished();
    }

    fn start_public_comment(&self, blob_id: BlobId, record: &BlobRecord) {
        let task = self.services.store.load_public_comment(blob_id, record);
        let comment = Arc::new(CommentFetch::default());
        let last_modified = record.last_modified;

        let (me, weak) = (self.me.clone(), Arc::downgrade(&comment));
        task.set_comment_callback(Box::new(move |text| {
            if let (Some(me), Some(comment)) = (me.upgrade(), weak.upgrade()) {
                me.on_comment(&comment, blob_id, last_modified, text);
                me.peek();
            }
        }));
        let (me, weak) = (self.me.clone(), Arc::downgrade(&comment));
        task.set_error_cb(Box::new(move |error| {
            if let (Some(me), Some(comment)) = (me.upgrade(), weak.upgrade()) {
                me.on_comment_error(&comment, error);
                me.peek();
            }
        }));
        comment.set_task(Arc::clone(&task));
        self.inner.lock().comments.push(comment);
        task.wait();
    }

    fn on_comment(&self, comment: &CommentFetch, blob_id: BlobId, last_modified: i64, text: Option<String>) {
        if comment.is_finished() || self.is_canceled() {
            return;
        }
        if let Some(text) = text {
            if self.admit() {
                self.reply()
                    .prepare_public_comment(self.pid(), &text, &blob_id.to_string(), Some(last_modified));
            }
        }
        comment.mark_finished();
    }

    /// A failed comment lookup never fails the request.
    fn on_comment_error(&self, comment: &CommentFetch, error: BackendError) {
        if comment.is_finished() || self.is_canceled() {
            return;
        }
        if self.admit() {
            let reply = self.reply();
            reply.prepare_processor_message(
                reply.item_id(),
                self.pid(),
                Diagnostic::new(&error.message, error.status, error.code, error.severity),
            );
        }
        comment.mark_finished();
    }

    // ---------------------------------------------------------------
    // Completion
    // ---------------------------------------------------------------

    fn forget_excluded(&self, blob_id: BlobId) {
        let registered = {
            let mut inner = self.inner.lock();
            let before = inner.excluded.len();
            inner.excluded.retain(|b| *b != blob_id);
            before != inner.excluded.len()
        };
        if registered {
            self.services.exclude.remove(&self.options.client_id, blob_id);
        }
    }

    /// Finalizes once no lookup, fetch, or comment is outstanding.
    fn peek(&self) {
        if self.finalized.load(Ordering::Acquire) {
            return;
        }
        let done = {
            let inner = self.inner.lock();
            inner.pending == 0
                && inner.fetches.iter().all(|f| f.is_finished())
                && inner.comments.iter().all(|c| c.is_finished())
        };
        if done {
            self.finalize();
        }
    }

    fn finalize(&self) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }
        let excluded = core::mem::take(&mut self.inner.lock().excluded);
        let canceled = self.is_canceled();
        for blob_id in excluded {
            if canceled {
                self.services.exclude.remove(&self.options.client_id, blob_id);
            } else {
                self.services.exclude.set_completed(&self.options.client_id, blob_id);
            }
        }
        if !canceled {
            self.state.try_finish(self.local.finish_status());
            self.reply().send_accumulated();
        }
        self.ctx.trace(&format!("{} finished: {}", self.pid(), self.state.get()));
        self.ctx.signal_finish_processing();
    }
}

impl Processor for CassBlobProcessor {
    fn can_process(&self, _request: &Request, _reply: &Reply) -> bool {
        false
    }

    fn create_processor(&self, _ctx: ProcessorContext) -> Option<Arc<dyn Processor>> {
        None
    }

    fn process(&self) {
        self.ctx.trace(&format!("{} started", self.pid()));
        match self.ctx.request().payload() {
            RequestPayload::BlobBySatSatKey(r) => self.start_blob(r.blob_id, false),
            RequestPayload::BlobBySeqId(r) => {
                self.start_lookup();
                let me = self.me.clone();
                self.services.resolve_seq_id(
                    &r.seq_id,
                    r.options.use_cache,
                    Box::new(move |result| {
                        if let Some(me) = me.upgrade() {
                            me.on_seq_id_resolved(result);
                            me.peek();
                        }
                    }),
                );
            }
            RequestPayload::Annot(r) => {
                self.start_lookup();
                let me = self.me.clone();
                let names = r.names.clone();
                self.services.resolve_seq_id(
                    &r.seq_id,
                    r.options.use_cache,
                    Box::new(move |result| {
                        if let Some(me) = me.upgrade() {
                            me.on_annot_resolved(result, names);
                            me.peek();
                        }
                    }),
                );
            }
            RequestPayload::TseChunk(r) => self.start_tse_chunk(r.id2_chunk, &r.id2_info),
            _ => {}
        }
        self.peek();
    }

    fn cancel(&self) {
        if self.canceled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.cancel();
        let (fetches, comments) = {
            let mut inner = self.inner.lock();
            inner.pending = 0;
            (inner.fetches.clone(), inner.comments.clone())
        };
        for fetch in fetches {
            fetch.cancel();
        }
        for comment in comments {
            comment.cancel();
        }
        self.peek();
    }

    fn status(&self) -> ProcessorStatus {
        self.state.get()
    }

    fn name(&self) -> &'static str {
        self.pid()
    }

    fn group_name(&self) -> &'static str {
        GROUP_NAME
    }
}
