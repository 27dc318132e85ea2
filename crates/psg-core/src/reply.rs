//! The reply sink shared by all processors of a request.
//!
//! Processors never write to the connection themselves. They call the
//! `prepare_*` methods of [`Reply`], which format chunk headers and append
//! them, together with payloads, to an in-memory list. [`Reply::flush`]
//! swaps that list out and hands it to the [`Transport`].
//!
//! The chunk list lock is held only while appending or swapping, never while
//! the transport runs.
//!
//! Every `prepare_*` call counts the logical chunks it produced so the final
//! reply completion can report the exact total.

use crate::common::{ErrorCode, Severity, status};
use crate::protocol::{
    ChunkHeader, ChunkType, ItemType, OutputFormat, SkipReason, format_seconds,
};
use bytes::Bytes;
use core::time::Duration;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};
use std::{sync::Arc, time::Instant};

/// Invoked by backends when more output may be produced.
pub type DataReadyCallback = Arc<dyn Fn() + Send + Sync>;

/// The connection side of a reply.
pub trait Transport: Send + Sync {
    /// Writes chunks; `is_last` means no more writes will follow.
    fn send(&self, chunks: Vec<Bytes>, is_last: bool);

    /// Writes chunks produced so far without finishing the reply.
    fn send_accumulated(&self, chunks: Vec<Bytes>) {
        self.send(chunks, false);
    }

    /// The client went away; pending output may be dropped.
    fn notify_client_connection_drop(&self);

    fn is_output_ready(&self) -> bool {
        true
    }

    /// The last chunk has been written.
    fn is_finished(&self) -> bool;

    /// The underlying connection is gone.
    fn is_closed(&self) -> bool;

    fn data_ready_cb(&self) -> Option<DataReadyCallback> {
        None
    }
}

/// Text, status, code and severity of a message chunk.
#[derive(Clone, Copy, Debug)]
pub struct Diagnostic<'a> {
    pub text: &'a str,
    pub status: u16,
    pub code: ErrorCode,
    pub severity: Severity,
}

impl<'a> Diagnostic<'a> {
    pub const fn new(text: &'a str, status: u16, code: ErrorCode, severity: Severity) -> Self {
        Self {
            text,
            status,
            code,
            severity,
        }
    }

    pub const fn error(text: &'a str, status: u16, code: ErrorCode) -> Self {
        Self::new(text, status, code, Severity::Error)
    }
}

#[derive(Default)]
struct Chunks {
    list: Vec<Bytes>,
    total: usize,
}

/// Thread-safe accumulator of protocol chunks for one request.
pub struct Reply {
    transport: Arc<dyn Transport>,
    chunks: Mutex<Chunks>,
    connection_canceled: AtomicBool,
    completed: AtomicBool,
    next_item_id: CachePadded<AtomicUsize>,
}

impl Reply {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            chunks: Mutex::new(Chunks::default()),
            connection_canceled: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            next_item_id: CachePadded::new(AtomicUsize::new(1)),
        }
    }

    /// Hands out the next item id. Item 0 is the reply itself.
    pub fn item_id(&self) -> usize {
        self.next_item_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Latches the connection as canceled; all later writes are dropped.
    pub fn connection_cancel(&self) {
        if !self.connection_canceled.swap(true, Ordering::AcqRel) {
            self.transport.notify_client_connection_drop();
        }
    }

    pub fn is_connection_canceled(&self) -> bool {
        self.connection_canceled.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.completed.load(Ordering::Acquire) || self.transport.is_finished()
    }

    pub fn is_output_ready(&self) -> bool {
        self.transport.is_output_ready()
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    pub fn data_ready_cb(&self) -> Option<DataReadyCallback> {
        self.transport.data_ready_cb()
    }

    /// Total logical chunks prepared so far.
    pub fn total_chunks(&self) -> usize {
        self.chunks.lock().total
    }

    fn is_writable(&self) -> bool {
        !self.is_connection_canceled() && !self.completed.load(Ordering::Acquire)
    }

    /// Appends a header and optional payload as one logical chunk, plus an
    /// optional trailing completion header as a second one.
    fn append(&self, header: String, payload: Option<&[u8]>, completion: Option<String>) {
        if !self.is_writable() {
            return;
        }
        let mut chunks = self.chunks.lock();
        chunks.list.push(Bytes::from(header));
        if let Some(payload) = payload.filter(|p| !p.is_empty()) {
            chunks.list.push(Bytes::copy_from_slice(payload));
        }
        chunks.total += 1;
        if let Some(completion) = completion {
            chunks.list.push(Bytes::from(completion));
            chunks.total += 1;
        }
    }

    fn take_chunks(&self) -> Vec<Bytes> {
        core::mem::take(&mut self.chunks.lock().list)
    }

    /// Sends everything accumulated so far. With `is_last`, the reply is
    /// closed for writing.
    pub fn flush(&self, is_last: bool) {
        if self.is_connection_canceled() {
            return;
        }
        if is_last && self.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        let chunks = self.take_chunks();
        self.transport.send(chunks, is_last);
    }

    pub fn send_accumulated(&self) {
        if !self.is_writable() {
            return;
        }
        let chunks = self.take_chunks();
        if !chunks.is_empty() {
            self.transport.send_accumulated(chunks);
        }
    }

    pub fn prepare_bioseq_data(
        &self,
        item_id: usize,
        processor_id: &str,
        content: &[u8],
        format: OutputFormat,
    ) {
        let header = ChunkHeader::item(item_id, processor_id, ItemType::BioseqInfo, ChunkType::Data)
            .size(content.len())
            .field("fmt", format.as_str())
            .finish();
        self.append(header, Some(content), None);
    }

    pub fn prepare_bioseq_message(&self, item_id: usize, processor_id: &str, msg: Diagnostic<'_>) {
        let header = message_header(item_id, processor_id, ItemType::BioseqInfo, msg).finish();
        self.append(header, Some(msg.text.as_bytes()), None);
    }

    pub fn prepare_bioseq_completion(&self, item_id: usize, processor_id: &str, n_chunks: usize) {
        self.append(
            completion_header(item_id, processor_id, ItemType::BioseqInfo, n_chunks),
            None,
            None,
        );
    }

    pub fn prepare_blob_prop_data(
        &self,
        item_id: usize,
        processor_id: &str,
        blob_id: &str,
        content: &[u8],
        last_modified: Option<i64>,
    ) {
        let header = ChunkHeader::item(item_id, processor_id, ItemType::BlobProp, ChunkType::Data)
            .size(content.len())
            .blob_id(blob_id)
            .last_modified(last_modified)
            .finish();
        self.append(header, Some(content), None);
    }

    pub fn prepare_tse_blob_prop_data(
        &self,
        item_id: usize,
        processor_id: &str,
        id2_chunk: i64,
        id2_info: &str,
        content: &[u8],
    ) {
        let header = ChunkHeader::item(item_id, processor_id, ItemType::BlobProp, ChunkType::Data)
            .size(content.len())
            .id2(id2_chunk, id2_info)
            .finish();
        self.append(header, Some(content), None);
    }

    pub fn prepare_blob_prop_message(&self, item_id: usize, processor_id: &str, msg: Diagnostic<'_>) {
        let header = message_header(item_id, processor_id, ItemType::BlobProp, msg).finish();
        self.append(header, Some(msg.text.as_bytes()), None);
    }

    pub fn prepare_tse_blob_prop_message(
        &self,
        item_id: usize,
        processor_id: &str,
        id2_chunk: i64,
        id2_info: &str,
        msg: Diagnostic<'_>,
    ) {
        let header = message_header(item_id, processor_id, ItemType::BlobProp, msg)
            .id2(id2_chunk, id2_info)
            .finish();
        self.append(header, Some(msg.text.as_bytes()), None);
    }

    pub fn prepare_blob_prop_completion(&self, item_id: usize, processor_id: &str, n_chunks: usize) {
        self.append(
            completion_header(item_id, processor_id, ItemType::BlobProp, n_chunks),
            None,
            None,
        );
    }

    pub fn prepare_blob_data(
        &self,
        item_id: usize,
        processor_id: &str,
        blob_id: &str,
        chunk_no: i32,
        data: &[u8],
        last_modified: Option<i64>,
    ) {
        let header = ChunkHeader::item(item_id, processor_id, ItemType::Blob, ChunkType::Data)
            .size(data.len())
            .blob_id(blob_id)
            .last_modified(last_modified)
            .field("blob_chunk", chunk_no)
            .finish();
        self.append(header, Some(data), None);
    }

    pub fn prepare_tse_blob_data(
        &self,
        item_id: usize,
        processor_id: &str,
        chunk_no: i32,
        id2_chunk: i64,
        id2_info: &str,
        data: &[u8],
    ) {
        let header = ChunkHeader::item(item_id, processor_id, ItemType::Blob, ChunkType::Data)
            .size(data.len())
            .field("blob_chunk", chunk_no)
            .id2(id2_chunk, id2_info)
            .finish();
        self.append(header, Some(data), None);
    }

    pub fn prepare_blob_message(
        &self,
        item_id: usize,
        processor_id: &str,
        blob_id: &str,
        last_modified: Option<i64>,
        msg: Diagnostic<'_>,
    ) {
        let header = ChunkHeader::item(item_id, processor_id, ItemType::Blob, ChunkType::Message)
            .size(msg.text.len())
            .blob_id(blob_id)
            .last_modified(last_modified)
            .diagnostics(msg.status, msg.code.value(), msg.severity)
            .finish();
        self.append(header, Some(msg.text.as_bytes()), None);
    }

    pub fn prepare_tse_blob_message(
        &self,
        item_id: usize,
        processor_id: &str,
        id2_chunk: i64,
        id2_info: &str,
        msg: Diagnostic<'_>,
    ) {
        let header = ChunkHeader::item(item_id, processor_id, ItemType::Blob, ChunkType::Message)
            .id2(id2_chunk, id2_info)
            .size(msg.text.len())
            .diagnostics(msg.status, msg.code.value(), msg.severity)
            .finish();
        self.append(header, Some(msg.text.as_bytes()), None);
    }

    pub fn prepare_blob_completion(&self, item_id: usize, processor_id: &str, n_chunks: usize) {
        self.append(
            completion_header(item_id, processor_id, ItemType::Blob, n_chunks),
            None,
            None,
        );
    }

    /// Tells the client a blob was skipped. Uses a fresh item id.
    pub fn prepare_blob_excluded(
        &self,
        processor_id: &str,
        blob_id: &str,
        reason: SkipReason,
        last_modified: Option<i64>,
    ) {
        let header = excluded_header(self.item_id(), processor_id, blob_id, last_modified)
            .field("reason", reason.as_str())
            .finish();
        self.append(header, None, None);
    }

    /// Like [`Reply::prepare_blob_excluded`] with reason `sent`, plus the
    /// time since it was sent and the time left until it may be resent.
    pub fn prepare_blob_excluded_sent(
        &self,
        processor_id: &str,
        blob_id: &str,
        sent_ago: Duration,
        until_resend: Duration,
        last_modified: Option<i64>,
    ) {
        let header = excluded_header(self.item_id(), processor_id, blob_id, last_modified)
            .field("reason", SkipReason::Sent.as_str())
            .field("sent_seconds_ago", format_seconds(sent_ago))
            .field("time_until_resend", format_seconds(until_resend))
            .finish();
        self.append(header, None, None);
    }

    pub fn prepare_tse_blob_excluded(
        &self,
        processor_id: &str,
        reason: SkipReason,
        blob_id: &str,
        id2_chunk: i64,
        id2_info: &str,
    ) {
        let header = ChunkHeader::item(self.item_id(), processor_id, ItemType::Blob, ChunkType::Meta)
            .blob_id(blob_id)
            .id2(id2_chunk, id2_info)
            .n_chunks(1)
            .field("reason", reason.as_str())
            .finish();
        self.append(header, None, None);
    }

    /// A message attached to the reply itself rather than to an item.
    pub fn prepare_reply_message(&self, msg: Diagnostic<'_>) {
        let header = ChunkHeader::new(0)
            .item_type(ItemType::Reply)
            .chunk_type(ChunkType::Message)
            .size(msg.text.len())
            .diagnostics(msg.status, msg.code.value(), msg.severity)
            .finish();
        self.append(header, Some(msg.text.as_bytes()), None);
    }

    /// A self-contained processor message item (message plus completion).
    pub fn prepare_processor_message(&self, item_id: usize, processor_id: &str, msg: Diagnostic<'_>) {
        let header = message_header(item_id, processor_id, ItemType::Processor, msg).finish();
        let completion = completion_header(item_id, processor_id, ItemType::Processor, 2);
        self.append(header, Some(msg.text.as_bytes()), Some(completion));
    }

    pub fn prepare_public_comment(
        &self,
        processor_id: &str,
        comment: &str,
        blob_id: &str,
        last_modified: Option<i64>,
    ) {
        let item_id = self.item_id();
        let header = ChunkHeader::item(item_id, processor_id, ItemType::PublicComment, ChunkType::Data)
            .blob_id(blob_id)
            .last_modified(last_modified)
            .size(comment.len())
            .finish();
        let completion = completion_header(item_id, processor_id, ItemType::PublicComment, 2);
        self.append(header, Some(comment.as_bytes()), Some(completion));
    }

    pub fn prepare_tse_public_comment(
        &self,
        processor_id: &str,
        comment: &str,
        id2_chunk: i64,
        id2_info: &str,
    ) {
        let item_id = self.item_id();
        let header = ChunkHeader::item(item_id, processor_id, ItemType::PublicComment, ChunkType::Data)
            .id2(id2_chunk, id2_info)
            .size(comment.len())
            .finish();
        let completion = completion_header(item_id, processor_id, ItemType::PublicComment, 2);
        self.append(header, Some(comment.as_bytes()), Some(completion));
    }

    pub fn prepare_named_annotation_data(&self, annot_name: &str, processor_id: &str, content: &[u8]) {
        let item_id = self.item_id();
        let header = ChunkHeader::item(item_id, processor_id, ItemType::BioseqNa, ChunkType::Data)
            .size(content.len())
            .field("na", annot_name)
            .finish();
        let completion = completion_header(item_id, processor_id, ItemType::BioseqNa, 2);
        self.append(header, Some(content), Some(completion));
    }

    pub fn prepare_acc_ver_history_data(&self, processor_id: &str, content: &[u8]) {
        let item_id = self.item_id();
        let header = ChunkHeader::item(item_id, processor_id, ItemType::AccVerHistory, ChunkType::Data)
            .size(content.len())
            .finish();
        let completion = completion_header(item_id, processor_id, ItemType::AccVerHistory, 2);
        self.append(header, Some(content), Some(completion));
    }

    /// The final chunk of the reply, carrying the grand total including
    /// itself.
    pub fn prepare_reply_completion(&self) {
        if !self.is_writable() || self.transport.is_closed() {
            return;
        }
        let mut chunks = self.chunks.lock();
        chunks.total += 1;
        let header = ChunkHeader::new(0)
            .item_type(ItemType::Reply)
            .chunk_type(ChunkType::Meta)
            .n_chunks(chunks.total)
            .finish();
        chunks.list.push(Bytes::from(header));
    }

    /// Sends a trace message stamped with the microseconds since `created`.
    pub fn send_trace(&self, msg: &str, created: Instant) {
        let text = format!("Timestamp (mks): {}\n{msg}", created.elapsed().as_micros());
        self.prepare_reply_message(Diagnostic::new(&text, status::OK, ErrorCode::None, Severity::Trace));
    }
}

fn message_header(
    item_id: usize,
    processor_id: &str,
    item_type: ItemType,
    msg: Diagnostic<'_>,
) -> ChunkHeader {
    ChunkHeader::item(item_id, processor_id, item_type, ChunkType::Message)
        .size(msg.text.len())
        .diagnostics(msg.status, msg.code.value(), msg.severity)
}

fn completion_header(item_id: usize, processor_id: &str, item_type: ItemType, n_chunks: usize) -> String {
    ChunkHeader::item(item_id, processor_id, item_type, ChunkType::Meta)
        .n_chunks(n_chunks)
        .finish()
}

fn excluded_header(
    item_id: usize,
    processor_id: &str,
    blob_id: &str,
    last_modified: Option<i64>,
) -> ChunkHeader {
    ChunkHeader::item(item_id, processor_id, ItemType::Blob, ChunkType::Meta)
        .blob_id(blob_id)
        .last_modified(last_modified)
        .n_chunks(1)
}

/// A transport that keeps everything in memory.
///
/// Used by tests and by in-process callers that want the whole reply at once.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    chunks: Vec<Bytes>,
    finished: bool,
    dropped: bool,
    sends: usize,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn chunks(&self) -> Vec<Bytes> {
        self.state.lock().chunks.clone()
    }

    /// The parsed header fields of every header chunk, in order.
    pub fn headers(&self) -> Vec<Vec<(String, String)>> {
        self.state
            .lock()
            .chunks
            .iter()
            .filter_map(|c| crate::protocol::parse_header(c))
            .collect()
    }

    /// The last chunk was received.
    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub fn was_dropped(&self) -> bool {
        self.state.lock().dropped
    }

    pub fn send_count(&self) -> usize {
        self.state.lock().sends
    }
}

impl Transport for MemoryTransport {
    fn send(&self, chunks: Vec<Bytes>, is_last: bool) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        state.sends += 1;
        state.chunks.extend(chunks);
        state.finished = is_last;
    }

    fn notify_client_connection_drop(&self) {
        self.state.lock().dropped = true;
    }

    fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    fn is_closed(&self) -> bool {
        self.state.lock().dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field<'a>(header: &'a [(String, String)], key: &str) -> Option<&'a str> {
        header.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    fn reply() -> (Arc<MemoryTransport>, Reply) {
        let transport = MemoryTransport::new();
        let reply = Reply::new(transport.clone());
        (transport, reply)
    }

    #[test]
    fn reply_completion_counts_every_chunk_including_itself() {
        let (transport, reply) = reply();
        let item = reply.item_id();
        assert_eq!(item, 1);
        reply.prepare_bioseq_data(item, "p", b"{}", OutputFormat::Json);
        reply.prepare_bioseq_completion(item, "p", 2);
        reply.prepare_processor_message(
            reply.item_id(),
            "p",
            Diagnostic::new("note", 200, ErrorCode::None, Severity::Info),
        );
        reply.prepare_reply_completion();
        reply.flush(true);

        let headers = transport.headers();
        let last = headers.last().unwrap();
        assert_eq!(field(last, "item_type"), Some("reply"));
        assert_eq!(field(last, "n_chunks"), Some("5"));
        assert!(transport.is_finished());
    }

    #[test]
    fn writes_after_connection_cancel_are_dropped() {
        let (transport, reply) = reply();
        reply.prepare_bioseq_data(1, "p", b"{}", OutputFormat::Json);
        reply.connection_cancel();
        reply.connection_cancel();
        reply.prepare_bioseq_completion(1, "p", 2);
        reply.prepare_reply_completion();
        reply.flush(true);
        assert!(transport.was_dropped());
        assert_eq!(transport.send_count(), 0);
        assert_eq!(reply.total_chunks(), 1);
    }

    #[test]
    fn empty_blob_payload_is_not_pushed_but_counted() {
        let (transport, reply) = reply();
        reply.prepare_blob_data(1, "p", "4.1", 0, b"", None);
        reply.flush(false);
        assert_eq!(transport.chunks().len(), 1);
        assert_eq!(reply.total_chunks(), 1);
    }

    #[test]
    fn nothing_is_written_after_the_last_flush() {
        let (transport, reply) = reply();
        reply.prepare_reply_completion();
        reply.flush(true);
        reply.prepare_bioseq_data(1, "p", b"{}", OutputFormat::Json);
        reply.flush(true);
        assert_eq!(transport.chunks().len(), 1);
    }

    #[test]
    fn excluded_sent_carries_timing() {
        let (transport, reply) = reply();
        reply.prepare_blob_excluded_sent(
            "p",
            "4.1",
            Duration::from_millis(150),
            Duration::from_millis(50),
            Some(7),
        );
        reply.flush(false);
        let headers = transport.headers();
        let h = &headers[0];
        assert_eq!(field(h, "reason"), Some("sent"));
        assert_eq!(field(h, "sent_seconds_ago"), Some("0.150000"));
        assert_eq!(field(h, "time_until_resend"), Some("0.050000"));
        assert_eq!(field(h, "n_chunks"), Some("1"));
        assert_eq!(field(h, "last_modified"), Some("7"));
    }

    #[test]
    fn trace_is_a_reply_message() {
        let (transport, reply) = reply();
        reply.send_trace("started", Instant::now());
        reply.flush(false);
        let headers = transport.headers();
        assert_eq!(field(&headers[0], "severity"), Some("trace"));
        assert_eq!(field(&headers[0], "item_id"), Some("0"));
        let payload = &transport.chunks()[1];
        assert!(payload.starts_with(b"Timestamp (mks): "));
        assert!(payload.ends_with(b"\nstarted"));
    }

    #[test]
    fn concurrent_appends_keep_per_thread_order() {
        let (transport, reply) = reply();
        std::thread::scope(|s| {
            for t in 0..4 {
                let reply = &reply;
                s.spawn(move || {
                    for n in 0..50 {
                        reply.prepare_blob_data(t + 1, "p", "1.1", n, b"x", None);
                    }
                });
            }
        });
        reply.flush(false);
        assert_eq!(reply.total_chunks(), 200);
        for t in 1..=4 {
            let chunk_numbers: Vec<i32> = transport
                .headers()
                .iter()
                .filter(|h| field(h, "item_id") == Some(t.to_string().as_str()))
                .map(|h| field(h, "blob_chunk").unwrap().parse().unwrap())
                .collect();
            assert_eq!(chunk_numbers, (0..50).collect::<Vec<_>>());
        }
    }
}
