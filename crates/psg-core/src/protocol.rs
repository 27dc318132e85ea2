//! Chunk header formatting for the PSG reply protocol.
//!
//! A reply is a sequence of chunk headers, each optionally followed by a raw
//! payload chunk:
//!
//! ```text
//! \n\nPSG-Reply-Chunk: item_id=1&processor_id=Cassandra-resolve&item_type=bioseq_info&chunk_type=data&size=42&fmt=json\n
//! ```
//!
//! Field order is significant to existing clients, so [`ChunkHeader`] writes
//! fields exactly in the order its methods are called.

use crate::common::Severity;
use core::fmt::{self, Write};
use core::time::Duration;

/// Every chunk header starts with this prefix.
pub const CHUNK_PREFIX: &str = "\n\nPSG-Reply-Chunk: ";

/// `id2_chunk` value reserved for the split-info blob itself.
pub const SPLIT_INFO_CHUNK: i64 = 999_999_999;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemType {
    BioseqInfo,
    BlobProp,
    Blob,
    BioseqNa,
    Reply,
    AccVerHistory,
    Processor,
    PublicComment,
}

impl ItemType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BioseqInfo => "bioseq_info",
            Self::BlobProp => "blob_prop",
            Self::Blob => "blob",
            Self::BioseqNa => "bioseq_na",
            Self::Reply => "reply",
            Self::AccVerHistory => "acc_ver_history",
            Self::Processor => "processor",
            Self::PublicComment => "public_comment",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkType {
    Data,
    Meta,
    Message,
}

impl ChunkType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Meta => "meta",
            Self::Message => "message",
        }
    }
}

/// Why a blob was not sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// The client listed the blob in `exclude_blobs`.
    Excluded,
    /// Another request from the same client is sending it right now.
    InProgress,
    /// Another request from the same client already sent it.
    Sent,
}

impl SkipReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Excluded => "excluded",
            Self::InProgress => "inprogress",
            Self::Sent => "sent",
        }
    }
}

/// Payload format of bioseq info items.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Json,
    Protobuf,
}

impl OutputFormat {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Protobuf => "protobuf",
        }
    }
}

impl core::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" | "native" => Ok(Self::Json),
            "protobuf" => Ok(Self::Protobuf),
            other => Err(format!("unknown output format '{other}'")),
        }
    }
}

/// Builder for a single chunk header line.
#[derive(Debug)]
pub struct ChunkHeader {
    buf: String,
}

impl ChunkHeader {
    /// Starts a header for `item_id`.
    pub fn new(item_id: usize) -> Self {
        let mut buf = String::with_capacity(160);
        buf.push_str(CHUNK_PREFIX);
        let _ = write!(buf, "item_id={item_id}");
        Self { buf }
    }

    /// Starts a header for a processor item, the usual four leading fields.
    pub fn item(
        item_id: usize,
        processor_id: &str,
        item_type: ItemType,
        chunk_type: ChunkType,
    ) -> Self {
        Self::new(item_id)
            .processor_id(processor_id)
            .item_type(item_type)
            .chunk_type(chunk_type)
    }

    pub fn field(mut self, key: &str, value: impl fmt::Display) -> Self {
        let _ = write!(self.buf, "&{key}={value}");
        self
    }

    pub fn processor_id(mut self, processor_id: &str) -> Self {
        self.buf.push_str("&processor_id=");
        self.buf.extend(url_encode(processor_id));
        self
    }

    pub fn item_type(self, item_type: ItemType) -> Self {
        self.field("item_type", item_type.as_str())
    }

    pub fn chunk_type(self, chunk_type: ChunkType) -> Self {
        self.field("chunk_type", chunk_type.as_str())
    }

    pub fn size(self, size: usize) -> Self {
        self.field("size", size)
    }

    pub fn n_chunks(self, n_chunks: usize) -> Self {
        self.field("n_chunks", n_chunks)
    }

    pub fn blob_id(self, blob_id: &str) -> Self {
        self.field("blob_id", blob_id)
    }

    /// Writes `last_modified` only when it is known.
    pub fn last_modified(self, last_modified: Option<i64>) -> Self {
        match last_modified {
            Some(lm) if lm != -1 => self.field("last_modified", lm),
            _ => self,
        }
    }

    pub fn id2(self, id2_chunk: i64, id2_info: &str) -> Self {
        self.field("id2_chunk", id2_chunk)
            .field("id2_info", id2_info)
    }

    /// `status`, `code` and `severity`, always written together.
    pub fn diagnostics(self, status: u16, code: u32, severity: Severity) -> Self {
        self.field("status", status)
            .field("code", code)
            .field("severity", severity.as_str())
    }

    /// Terminates the header line.
    pub fn finish(mut self) -> String {
        self.buf.push('\n');
        self.buf
    }
}

/// URL-encodes a header value the way form fields are encoded.
pub fn url_encode(value: &str) -> impl Iterator<Item = &str> {
    url::form_urlencoded::byte_serialize(value.as_bytes())
}

/// Formats a duration as `S.uuuuuu` seconds.
pub fn format_seconds(duration: Duration) -> String {
    format!("{}.{:06}", duration.as_secs(), duration.subsec_micros())
}

/// Splits a reply header line into its `key=value` fields.
///
/// Returns `None` for chunks that are not headers.
pub fn parse_header(chunk: &[u8]) -> Option<Vec<(String, String)>> {
    let text = core::str::from_utf8(chunk).ok()?;
    let body = text.strip_prefix(CHUNK_PREFIX)?.strip_suffix('\n')?;
    Some(
        url::form_urlencoded::parse(body.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_preserves_call_order() {
        let header = ChunkHeader::item(3, "Cassandra-getblob", ItemType::Blob, ChunkType::Data)
            .size(10)
            .blob_id("4.123")
            .last_modified(Some(1_700_000_000))
            .field("blob_chunk", 0)
            .finish();
        assert_eq!(
            header,
            "\n\nPSG-Reply-Chunk: item_id=3&processor_id=Cassandra-getblob&item_type=blob\
             &chunk_type=data&size=10&blob_id=4.123&last_modified=1700000000&blob_chunk=0\n"
        );
    }

    #[test]
    fn unknown_last_modified_is_omitted() {
        let header = ChunkHeader::new(1).last_modified(Some(-1)).finish();
        assert!(!header.contains("last_modified"));
        let header = ChunkHeader::new(1).last_modified(None).finish();
        assert!(!header.contains("last_modified"));
    }

    #[test]
    fn processor_id_is_url_encoded() {
        let header = ChunkHeader::new(1).processor_id("OSG & friends").finish();
        assert!(header.contains("processor_id=OSG+%26+friends"));
        let fields = parse_header(header.as_bytes()).unwrap();
        assert_eq!(fields[1], ("processor_id".to_string(), "OSG & friends".to_string()));
    }

    #[test]
    fn seconds_are_zero_padded() {
        assert_eq!(format_seconds(Duration::from_micros(1_000_050)), "1.000050");
        assert_eq!(format_seconds(Duration::ZERO), "0.000000");
    }

    #[test]
    fn payload_is_not_a_header() {
        assert!(parse_header(b"{\"accession\":\"NC_000001\"}").is_none());
    }
}
