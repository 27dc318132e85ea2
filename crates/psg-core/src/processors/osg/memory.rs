//! An in-process OSG server and connection pool.
//!
//! Connections are reused: a released connection goes back to the idle list
//! and keeps counting serial numbers, so only the first packet on it is
//! "fresh". Faults can be injected to exercise the retry rules.

use super::{
    OsgConnection, OsgConnectionPool, OsgError, OsgPacket, OsgReply, OsgReplyBody, OsgRequestBody,
    OsgSeverity,
};
use crate::backend::{BioseqInfo, BlobRecord};
use crate::common::{Error, Result};
use crate::request::{BlobId, SeqIdQuery};
use bytes::Bytes;
use parking_lot::Mutex;
use portable_atomic::{AtomicI64, AtomicUsize, Ordering};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

#[derive(Default)]
struct Faults {
    failing_sends: usize,
    failing_allocations: usize,
    failed_command: bool,
    serial_offset: i64,
}

#[derive(Default)]
struct ServerData {
    bioseqs: Mutex<Vec<BioseqInfo>>,
    blobs: Mutex<HashMap<BlobId, (BlobRecord, Vec<Bytes>)>>,
    faults: Mutex<Faults>,
    packets: Mutex<Vec<OsgPacket>>,
    sends: AtomicUsize,
    opened: AtomicUsize,
}

impl ServerData {
    fn answer(&self, body: &OsgRequestBody) -> OsgReplyBody {
        match body {
            OsgRequestBody::Init => OsgReplyBody::Init,
            OsgRequestBody::Resolve { seq_id, seq_id_type } => {
                let query = SeqIdQuery {
                    seq_id: seq_id.clone(),
                    seq_id_type: *seq_id_type,
                };
                self.bioseqs
                    .lock()
                    .iter()
                    .filter(|b| b.matches(&query))
                    .max_by_key(|b| b.version)
                    .cloned()
                    .map_or(OsgReplyBody::NotFound, OsgReplyBody::BioseqInfo)
            }
            OsgRequestBody::GetBlob { sat, sat_key } => self
                .blobs
                .lock()
                .get(&BlobId::new(*sat, *sat_key))
                .map_or(OsgReplyBody::NotFound, |(props, chunks)| OsgReplyBody::Blob {
                    props: props.clone(),
                    chunks: chunks.clone(),
                }),
        }
    }
}

pub struct MemoryOsgConnection {
    server: Arc<ServerData>,
    next_serial: AtomicI64,
    inbox: Mutex<VecDeque<OsgReply>>,
}

impl OsgConnection for MemoryOsgConnection {
    fn allocate_serial_number(&self) -> i64 {
        self.next_serial.fetch_add(1, Ordering::Relaxed)
    }

    fn send_packet(&self, packet: &OsgPacket) -> Result<()> {
        self.server.sends.fetch_add(1, Ordering::Relaxed);
        let (failed_command, serial_offset) = {
            let mut faults = self.server.faults.lock();
            if faults.failing_sends > 0 {
                faults.failing_sends -= 1;
                return Err(Error::ChannelError {
                    context: "connection reset by peer".into(),
                });
            }
            (faults.failed_command, faults.serial_offset)
        };
        self.server.packets.lock().push(packet.clone());
        let mut inbox = self.inbox.lock();
        for request in &packet.requests {
            let errors = if failed_command && request.body != OsgRequestBody::Init {
                vec![OsgError {
                    severity: OsgSeverity::FailedCommand,
                    message: "command rejected".into(),
                }]
            } else {
                Vec::new()
            };
            inbox.push_back(OsgReply {
                serial: request.serial + serial_offset,
                end_of_reply: true,
                body: self.server.answer(&request.body),
                errors,
            });
        }
        Ok(())
    }

    fn receive_reply(&self) -> Result<OsgReply> {
        self.inbox.lock().pop_front().ok_or_else(|| Error::ChannelError {
            context: "no reply pending".into(),
        })
    }
}

/// A pool over [`MemoryOsgConnection`]s sharing one set of data.
pub struct MemoryOsgPool {
    server: Arc<ServerData>,
    idle: Mutex<Vec<Arc<dyn OsgConnection>>>,
    max_size: usize,
}

impl MemoryOsgPool {
    pub fn new(max_size: usize) -> Self {
        Self {
            server: Arc::new(ServerData::default()),
            idle: Mutex::new(Vec::new()),
            max_size,
        }
    }

    pub fn insert_bioseq(&self, info: BioseqInfo) {
        self.server.bioseqs.lock().push(info);
    }

    pub fn insert_blob(&self, sat: i32, props: BlobRecord, chunks: Vec<Bytes>) {
        let blob_id = BlobId::new(sat, props.sat_key);
        self.server.blobs.lock().insert(blob_id, (props, chunks));
    }

    /// Opens a connection that has already used some serial numbers and
    /// parks it in the idle list.
    pub fn warm_up(&self) {
        let connection = self.open();
        connection.next_serial.store(100, Ordering::Relaxed);
        self.idle.lock().push(connection);
    }

    /// The next `n` packets fail with a channel error.
    pub fn fail_sends(&self, n: usize) {
        self.server.faults.lock().failing_sends = n;
    }

    /// The next `n` allocations fail.
    pub fn fail_allocations(&self, n: usize) {
        self.server.faults.lock().failing_allocations = n;
    }

    /// Every fetch reply carries a `FailedCommand` error.
    pub fn reject_commands(&self) {
        self.server.faults.lock().failed_command = true;
    }

    /// Replies come back with serials shifted by `offset`.
    pub fn shift_serials(&self, offset: i64) {
        self.server.faults.lock().serial_offset = offset;
    }

    /// Packets that reached the server.
    pub fn packets(&self) -> Vec<OsgPacket> {
        self.server.packets.lock().clone()
    }

    pub fn send_count(&self) -> usize {
        self.server.sends.load(Ordering::Relaxed)
    }

    pub fn opened_count(&self) -> usize {
        self.server.opened.load(Ordering::Relaxed)
    }

    fn open(&self) -> Arc<MemoryOsgConnection> {
        self.server.opened.fetch_add(1, Ordering::Relaxed);
        Arc::new(MemoryOsgConnection {
            server: Arc::clone(&self.server),
            next_serial: AtomicI64::new(1),
            inbox: Mutex::new(VecDeque::new()),
        })
    }
}

impl OsgConnectionPool for MemoryOsgPool {
    fn allocate(&self) -> Result<Arc<dyn OsgConnection>> {
        {
            let mut faults = self.server.faults.lock();
            if faults.failing_allocations > 0 {
                faults.failing_allocations -= 1;
                return Err(Error::ChannelError {
                    context: "cannot connect to the ID2 server".into(),
                });
            }
        }
        if let Some(connection) = self.idle.lock().pop() {
            return Ok(connection);
        }
        Ok(self.open())
    }

    fn release(&self, connection: Arc<dyn OsgConnection>) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max_size {
            idle.push(connection);
        }
    }

    fn max_size(&self) -> usize {
        self.max_size
    }
}
