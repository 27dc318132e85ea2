use crate::backend::{BlobTask, PublicCommentTask};
use crate::reply::{Diagnostic, Reply};
use crate::request::BlobId;
use bytes::Bytes;
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// What a blob fetch is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum FetchRole {
    /// Properties of the requested blob; they decide what else to fetch.
    Main,
    /// Data of the requested blob, properties already known.
    Original,
    /// The split-info blob or one of the split chunks.
    Split,
}

#[derive(Default)]
struct Counters {
    total_sent: usize,
    prop_sent: bool,
    finished: bool,
    collected: Vec<Bytes>,
}

/// One outstanding blob load and the reply items it writes.
///
/// The counters lock is held while writing so chunks of one fetch keep their
/// order. It is never held while taking the processor lock.
pub(super) struct CassBlobFetch {
    pub blob_id: BlobId,
    pub role: FetchRole,
    /// Reached through a seq-id or annotation lookup rather than named by
    /// the client.
    pub derived: bool,
    /// `(id2_chunk, id2_info)` for split items.
    id2: Option<(i64, String)>,
    /// Keep data chunks for the split-info cache.
    collect: bool,
    counters: Mutex<Counters>,
    last_modified: OnceLock<i64>,
    prop_item: OnceLock<usize>,
    blob_item: OnceLock<usize>,
    task: OnceLock<Arc<dyn BlobTask>>,
}

impl CassBlobFetch {
    pub fn new(blob_id: BlobId, role: FetchRole, derived: bool, id2: Option<(i64, String)>, collect: bool) -> Self {
        Self {
            blob_id,
            role,
            derived,
            id2,
            collect,
            counters: Mutex::new(Counters {
                // Original fetches never send properties.
                prop_sent: role == FetchRole::Original,
                ..Counters::default()
            }),
            last_modified: OnceLock::new(),
            prop_item: OnceLock::new(),
            blob_item: OnceLock::new(),
            task: OnceLock::new(),
        }
    }

    pub fn set_task(&self, task: Arc<dyn BlobTask>) {
        let _ = self.task.set(task);
    }

    pub fn task(&self) -> Option<&Arc<dyn BlobTask>> {
        self.task.get()
    }

    pub fn set_last_modified(&self, last_modified: i64) {
        let _ = self.last_modified.set(last_modified);
    }

    pub fn last_modified(&self) -> Option<i64> {
        self.last_modified.get().copied()
    }

    pub fn is_finished(&self) -> bool {
        self.counters.lock().finished
    }

    pub fn mark_finished(&self) {
        self.counters.lock().finished = true;
    }

    /// Stops the loader and marks the fetch finished.
    pub fn cancel(&self) {
        if let Some(task) = self.task.get() {
            task.cancel();
        }
        self.mark_finished();
    }

    pub fn prop_sent(&self) -> bool {
        self.counters.lock().prop_sent
    }

    pub fn collects(&self) -> bool {
        self.collect
    }

    pub fn take_collected(&self) -> Vec<Bytes> {
        core::mem::take(&mut self.counters.lock().collected)
    }

    fn prop_item(&self, reply: &Reply) -> usize {
        *self.prop_item.get_or_init(|| reply.item_id())
    }

    fn blob_item(&self, reply: &Reply) -> usize {
        *self.blob_item.get_or_init(|| reply.item_id())
    }

    pub fn send_prop_data(&self, reply: &Reply, pid: &str, content: &[u8]) {
        let mut counters = self.counters.lock();
        let item = self.prop_item(reply);
        match &self.id2 {
            Some((chunk, info)) => reply.prepare_tse_blob_prop_data(item, pid, *chunk, info, content),
            None => reply.prepare_blob_prop_data(
                item,
                pid,
                &self.blob_id.to_string(),
                content,
                self.last_modified(),
            ),
        }
        counters.total_sent += 1;
    }

    pub fn send_prop_message(&self, reply: &Reply, pid: &str, msg: Diagnostic<'_>) {
        let mut counters = self.counters.lock();
        let item = self.prop_item(reply);
        match &self.id2 {
            Some((chunk, info)) => reply.prepare_tse_blob_prop_message(item, pid, *chunk, info, msg),
            None => reply.prepare_blob_prop_message(item, pid, msg),
        }
        counters.total_sent += 1;
    }

    pub fn send_prop_completion(&self, reply: &Reply, pid: &str) {
        let mut counters = self.counters.lock();
        let item = self.prop_item(reply);
        reply.prepare_blob_prop_completion(item, pid, counters.total_sent + 1);
        counters.total_sent = 0;
        counters.prop_sent = true;
    }

    pub fn send_blob_data(&self, reply: &Reply, pid: &str, chunk_no: i32, data: &[u8]) {
        let mut counters = self.counters.lock();
        let item = self.blob_item(reply);
        match &self.id2 {
            Some((chunk, info)) => reply.prepare_tse_blob_data(item, pid, chunk_no, *chunk, info, data),
            None => reply.prepare_blob_data(
                item,
                pid,
                &self.blob_id.to_string(),
                chunk_no,
                data,
                self.last_modified(),
            ),
        }
        counters.total_sent += 1;
        if self.collect {
            counters.collected.push(Bytes::copy_from_slice(data));
        }
    }

    pub fn send_blob_message(&self, reply: &Reply, pid: &str, msg: Diagnostic<'_>) {
        let mut counters = self.counters.lock();
        let item = self.blob_item(reply);
        match &self.id2 {
            Some((chunk, info)) => reply.prepare_tse_blob_message(item, pid, *chunk, info, msg),
            None => reply.prepare_blob_message(
                item,
                pid,
                &self.blob_id.to_string(),
                self.last_modified(),
                msg,
            ),
        }
        counters.total_sent += 1;
    }

    pub fn send_blob_completion(&self, reply: &Reply, pid: &str) {
        let mut counters = self.counters.lock();
        let item = self.blob_item(reply);
        reply.prepare_blob_completion(item, pid, counters.total_sent + 1);
        counters.total_sent += 1;
    }
}

/// A public comment side-fetch.
#[derive(Default)]
pub(super) struct CommentFetch {
    finished: AtomicBool,
    task: OnceLock<Arc<dyn PublicCommentTask>>,
}

impl CommentFetch {
    pub fn set_task(&self, task: Arc<dyn PublicCommentTask>) {
        let _ = self.task.set(task);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    pub fn cancel(&self) {
        if let Some(task) = self.task.get() {
            task.cancel();
        }
        self.mark_finished();
    }
}
