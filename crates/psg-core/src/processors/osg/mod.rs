//! Processors talking to an ID2 server through a pool of OSG connections.
//!
//! A request becomes one [`OsgPacket`]: an init request followed by one
//! fetch per needed object. Every request in the packet gets its own serial
//! number, and replies are matched back by serial. See [`OsgCaller`] for the
//! retry rules.

use crate::backend::{BioseqInfo, BlobRecord};
use crate::common::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

mod caller;
pub mod memory;
mod processor;

#[cfg(test)]
mod tests;

pub use caller::{OsgCaller, OsgFetch};
pub use processor::{OsgFactory, OsgProcessor, OsgServices};

pub const GROUP_NAME: &str = "OSG";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OsgRequestBody {
    Init,
    Resolve { seq_id: String, seq_id_type: Option<i32> },
    GetBlob { sat: i32, sat_key: i32 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsgRequest {
    pub serial: i64,
    /// Proxy hops so far, including this one.
    pub hops: u32,
    pub body: OsgRequestBody,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsgPacket {
    pub requests: Vec<OsgRequest>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsgSeverity {
    Warning,
    Error,
    /// The server refused the whole command; never retried.
    FailedCommand,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsgError {
    pub severity: OsgSeverity,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OsgReplyBody {
    Empty,
    Init,
    BioseqInfo(BioseqInfo),
    Blob { props: BlobRecord, chunks: Vec<Bytes> },
    NotFound,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OsgReply {
    pub serial: i64,
    /// The last reply for this serial.
    pub end_of_reply: bool,
    pub body: OsgReplyBody,
    pub errors: Vec<OsgError>,
}

/// One connection to an ID2 server. Calls block.
pub trait OsgConnection: Send + Sync {
    /// Serial numbers start at 1 on a fresh connection.
    fn allocate_serial_number(&self) -> i64;
    fn send_packet(&self, packet: &OsgPacket) -> Result<()>;
    fn receive_reply(&self) -> Result<OsgReply>;
}

pub trait OsgConnectionPool: Send + Sync {
    fn allocate(&self) -> Result<Arc<dyn OsgConnection>>;
    fn release(&self, connection: Arc<dyn OsgConnection>);
    fn max_size(&self) -> usize;
}
