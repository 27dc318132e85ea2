//! Collaborator interfaces consumed by the processors.
//!
//! The storage driver, the local lookup cache, and the CDD/WGS/SNP clients
//! are all reached through the traits below. [`memory`] implements every one
//! of them over plain in-process data.
//!
//! Blob loading is callback based: a [`BlobTask`] is configured with
//! callbacks and started with [`BlobTask::wait`], which returns immediately.
//! Callbacks may then fire on any thread, or on the calling thread before
//! `wait` returns.

use crate::common::{Error, ErrorCode, Result, Severity, status};
use crate::request::{BlobId, IncludeInfo, SeqIdQuery};
use bytes::Bytes;
use core::{fmt, str::FromStr};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub mod memory;

/// Blob properties as stored in the blob table.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobRecord {
    pub sat_key: i32,
    pub last_modified: i64,
    pub size: u64,
    pub n_chunks: i32,
    pub class: i32,
    pub withdrawn: bool,
    pub suppressed: bool,
    pub confidential: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id2_info: Option<String>,
}

impl BlobRecord {
    /// Withdrawn and confidential blobs are never sent.
    pub const fn is_restricted(&self) -> bool {
        self.withdrawn || self.confidential
    }

    /// Suppressed and withdrawn blobs come with a public comment.
    pub const fn needs_public_comment(&self) -> bool {
        self.withdrawn || self.suppressed
    }
}

/// Layout of a split blob: `sat.info.chunks[.split_version]`.
///
/// The info blob lives at `sat_key = info`; chunk `k` (1-based) at
/// `info - chunks - 1 + k`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Id2Info {
    pub sat: i32,
    pub info: i32,
    pub chunks: i32,
    pub split_version: Option<i32>,
}

impl Id2Info {
    pub const fn info_blob(&self) -> BlobId {
        BlobId::new(self.sat, self.info)
    }

    /// The blob holding chunk `k`, or `None` unless `1 <= k <= chunks`.
    pub fn chunk_blob(&self, k: i64) -> Option<BlobId> {
        if !(1..=i64::from(self.chunks)).contains(&k) {
            return None;
        }
        let sat_key = i64::from(self.info) - i64::from(self.chunks) - 1 + k;
        i32::try_from(sat_key).ok().map(|sat_key| BlobId::new(self.sat, sat_key))
    }
}

impl FromStr for Id2Info {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = |reason: &str| Error::BadId2Info {
            value: s.to_owned(),
            reason: reason.to_owned(),
        };
        let parts: Vec<&str> = s.split('.').collect();
        if !(3..=4).contains(&parts.len()) {
            return Err(bad("expected 3 or 4 dot separated parts"));
        }
        let mut numbers = [0_i32; 4];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            *slot = part.parse().map_err(|_| bad("non-numeric part"))?;
        }
        let info = Self {
            sat: numbers[0],
            info: numbers[1],
            chunks: numbers[2],
            split_version: (parts.len() == 4).then_some(numbers[3]),
        };
        if info.chunks < 0 || info.info <= info.chunks {
            return Err(bad("inconsistent info and chunk numbers"));
        }
        Ok(info)
    }
}

impl fmt::Display for Id2Info {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.sat, self.info, self.chunks)?;
        if let Some(v) = self.split_version {
            write!(f, ".{v}")?;
        }
        Ok(())
    }
}

/// One entry of the bioseq info table.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BioseqInfo {
    pub accession: String,
    pub version: i32,
    pub seq_id_type: i32,
    pub name: String,
    pub mol: i32,
    pub length: i64,
    pub state: i32,
    pub sat: i32,
    pub sat_key: i32,
    pub tax_id: i32,
    pub hash: i32,
    pub date_changed: i64,
    pub gi: Option<i64>,
    /// Secondary ids as `(seq_id_type, content)`.
    pub seq_ids: Vec<(i32, String)>,
}

/// Protobuf rendition of [`BioseqInfo`] for `fmt=protobuf` replies.
#[derive(Clone, PartialEq, prost::Message)]
pub struct BioseqInfoProto {
    #[prost(string, optional, tag = "1")]
    pub accession: Option<String>,
    #[prost(int32, optional, tag = "2")]
    pub version: Option<i32>,
    #[prost(int32, optional, tag = "3")]
    pub seq_id_type: Option<i32>,
    #[prost(string, repeated, tag = "4")]
    pub seq_ids: Vec<String>,
    #[prost(int32, optional, tag = "5")]
    pub mol: Option<i32>,
    #[prost(int64, optional, tag = "6")]
    pub length: Option<i64>,
    #[prost(int32, optional, tag = "7")]
    pub state: Option<i32>,
    #[prost(string, optional, tag = "8")]
    pub blob_id: Option<String>,
    #[prost(int32, optional, tag = "9")]
    pub tax_id: Option<i32>,
    #[prost(int32, optional, tag = "10")]
    pub hash: Option<i32>,
    #[prost(int64, optional, tag = "11")]
    pub date_changed: Option<i64>,
    #[prost(int64, optional, tag = "12")]
    pub gi: Option<i64>,
    #[prost(string, optional, tag = "13")]
    pub name: Option<String>,
}

impl BioseqInfo {
    pub const fn blob_id(&self) -> BlobId {
        BlobId::new(self.sat, self.sat_key)
    }

    /// Whether the record answers `query`: same accession and, when the query
    /// names one, same version and seq-id type; or the same gi.
    pub fn matches(&self, query: &SeqIdQuery) -> bool {
        if query.seq_id_type.is_some_and(|t| t != self.seq_id_type) {
            return false;
        }
        let (accession, version) = query.accession_version();
        if accession == self.accession {
            return version.is_none_or(|v| v == self.version);
        }
        query.gi().is_some_and(|gi| self.gi == Some(gi))
    }

    /// JSON object holding only the fields selected by `include`.
    pub fn to_json(&self, include: IncludeInfo) -> Vec<u8> {
        let mut obj = serde_json::Map::new();
        let mut put = |key: &str, value: serde_json::Value| {
            obj.insert(key.to_owned(), value);
        };
        if include.contains(IncludeInfo::CANONICAL_ID) {
            put("accession", self.accession.clone().into());
            put("version", self.version.into());
            put("seq_id_type", self.seq_id_type.into());
        }
        if include.contains(IncludeInfo::SEQ_IDS) {
            put(
                "seq_ids",
                self.seq_ids
                    .iter()
                    .map(|(t, id)| serde_json::json!([t, id]))
                    .collect::<Vec<_>>()
                    .into(),
            );
        }
        if include.contains(IncludeInfo::MOL_TYPE) {
            put("mol", self.mol.into());
        }
        if include.contains(IncludeInfo::LENGTH) {
            put("length", self.length.into());
        }
        if include.contains(IncludeInfo::STATE) {
            put("state", self.state.into());
        }
        if include.contains(IncludeInfo::BLOB_ID) {
            put("sat", self.sat.into());
            put("sat_key", self.sat_key.into());
        }
        if include.contains(IncludeInfo::TAX_ID) {
            put("tax_id", self.tax_id.into());
        }
        if include.contains(IncludeInfo::HASH) {
            put("hash", self.hash.into());
        }
        if include.contains(IncludeInfo::DATE_CHANGED) {
            put("date_changed", self.date_changed.into());
        }
        if include.contains(IncludeInfo::GI) {
            if let Some(gi) = self.gi {
                put("gi", gi.into());
            }
        }
        if include.contains(IncludeInfo::NAME) {
            put("name", self.name.clone().into());
        }
        serde_json::Value::Object(obj).to_string().into_bytes()
    }

    pub fn to_protobuf(&self, include: IncludeInfo) -> Vec<u8> {
        use prost::Message;

        let pick = |flag: IncludeInfo| include.contains(flag);
        let canonical = pick(IncludeInfo::CANONICAL_ID);
        let proto = BioseqInfoProto {
            accession: canonical.then(|| self.accession.clone()),
            version: canonical.then_some(self.version),
            seq_id_type: canonical.then_some(self.seq_id_type),
            seq_ids: if pick(IncludeInfo::SEQ_IDS) {
                self.seq_ids.iter().map(|(t, id)| format!("{t}|{id}")).collect()
            } else {
                Vec::new()
            },
            mol: pick(IncludeInfo::MOL_TYPE).then_some(self.mol),
            length: pick(IncludeInfo::LENGTH).then_some(self.length),
            state: pick(IncludeInfo::STATE).then_some(self.state),
            blob_id: pick(IncludeInfo::BLOB_ID).then(|| self.blob_id().to_string()),
            tax_id: pick(IncludeInfo::TAX_ID).then_some(self.tax_id),
            hash: pick(IncludeInfo::HASH).then_some(self.hash),
            date_changed: pick(IncludeInfo::DATE_CHANGED).then_some(self.date_changed),
            gi: self.gi.filter(|_| pick(IncludeInfo::GI)),
            name: pick(IncludeInfo::NAME).then(|| self.name.clone()),
        };
        proto.encode_to_vec()
    }
}

/// A named annotation attached to a sequence.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamedAnnotRecord {
    pub accession: String,
    pub version: i32,
    pub seq_id_type: i32,
    pub annot_name: String,
    pub sat: i32,
    pub sat_key: i32,
    pub last_modified: i64,
    pub start: i64,
    pub stop: i64,
}

impl NamedAnnotRecord {
    pub const fn blob_id(&self) -> BlobId {
        BlobId::new(self.sat, self.sat_key)
    }
}

/// One version of an accession.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccVerHistoryRecord {
    pub accession: String,
    pub version: i32,
    pub seq_id_type: i32,
    pub gi: i64,
    pub date: i64,
    pub sat: i32,
    pub sat_key: i32,
    pub chain: i64,
}

/// A failure reported by a backend through an error callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendError {
    pub status: u16,
    pub code: ErrorCode,
    pub severity: Severity,
    pub message: String,
}

impl BackendError {
    pub fn new(status: u16, code: ErrorCode, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            severity,
            message: message.into(),
        }
    }

    /// An error-severity storage failure.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(status::INTERNAL, ErrorCode::CassandraError, Severity::Error, message)
    }

    pub fn lookup_cache(message: impl Into<String>) -> Self {
        Self::new(status::INTERNAL, ErrorCode::LmdbError, Severity::Error, message)
    }

    pub fn client(message: impl Into<String>) -> Self {
        Self::new(status::INTERNAL, ErrorCode::ClientError, Severity::Error, message)
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.status, self.severity, self.message)
    }
}

impl From<BackendError> for Error {
    fn from(e: BackendError) -> Self {
        Self::Backend { message: e.message }
    }
}

pub type DataReadyCallback = crate::reply::DataReadyCallback;
/// `(record, found)`.
pub type PropsCallback = Box<dyn FnMut(&BlobRecord, bool) + Send>;
/// `(data, chunk_no)`; `chunk_no == -1` ends the blob.
pub type ChunkCallback = Box<dyn FnMut(&[u8], i32) + Send>;
pub type ErrorCallback = Box<dyn FnMut(BackendError) + Send>;
/// `Some(comment)` when the blob has one.
pub type CommentCallback = Box<dyn FnMut(Option<String>) + Send>;

/// An in-flight blob load.
pub trait BlobTask: Send + Sync {
    fn set_data_ready_cb(&self, cb: DataReadyCallback);
    fn set_error_cb(&self, cb: ErrorCallback);
    /// Not called when the task was created with known properties.
    fn set_props_callback(&self, cb: PropsCallback);
    fn set_chunk_callback(&self, cb: ChunkCallback);
    /// Starts the load. Never blocks on I/O.
    fn wait(&self);
    /// Stops delivering callbacks.
    fn cancel(&self);
}

/// An in-flight public comment lookup.
pub trait PublicCommentTask: Send + Sync {
    fn set_comment_callback(&self, cb: CommentCallback);
    fn set_error_cb(&self, cb: ErrorCallback);
    fn wait(&self);
    fn cancel(&self);
}

/// The blob storage driver.
pub trait BlobStore: Send + Sync {
    fn knows_sat(&self, sat: i32) -> bool;

    /// With `props` given, the task skips the property lookup. With
    /// `load_chunks == false`, it only looks up properties.
    fn load_blob(
        &self,
        blob_id: BlobId,
        props: Option<BlobRecord>,
        load_chunks: bool,
    ) -> Arc<dyn BlobTask>;

    fn load_public_comment(&self, blob_id: BlobId, record: &BlobRecord) -> Arc<dyn PublicCommentTask>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheLookup<T> {
    Hit(T),
    NotHit,
    Error(String),
}

/// The local (LMDB) lookup cache. Lookups are synchronous.
pub trait LookupCache: Send + Sync {
    fn lookup_blob_prop(&self, sat: i32, sat_key: i32, last_modified: Option<i64>) -> CacheLookup<BlobRecord>;
    fn lookup_bioseq_info(&self, query: &SeqIdQuery) -> CacheLookup<BioseqInfo>;
}

pub type ResolveCallback = Box<dyn FnOnce(core::result::Result<Option<BioseqInfo>, BackendError>) + Send>;
pub type AnnotCallback = Box<dyn FnOnce(core::result::Result<Vec<NamedAnnotRecord>, BackendError>) + Send>;
pub type HistoryCallback = Box<dyn FnOnce(core::result::Result<Vec<AccVerHistoryRecord>, BackendError>) + Send>;

/// Sequence metadata tables. Every call answers exactly once through its
/// callback.
pub trait BioseqStore: Send + Sync {
    fn resolve(&self, query: &SeqIdQuery, cb: ResolveCallback);
    fn named_annotations(&self, info: &BioseqInfo, names: &[String], cb: AnnotCallback);
    fn acc_ver_history(&self, accession: &str, cb: HistoryCallback);
}

/// Conserved domain annotations.
pub trait CddClient: Send + Sync {
    fn fetch_annotation(&self, query: &SeqIdQuery) -> Result<Option<NamedAnnotRecord>>;
}

/// SNP annotation tracks. `names` are the requested `SNP*` names.
pub trait SnpClient: Send + Sync {
    fn fetch_annotations(&self, query: &SeqIdQuery, names: &[String]) -> Result<Vec<NamedAnnotRecord>>;
}

/// A blob served out of WGS/VDB data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WgsBlob {
    pub blob_id: String,
    pub chunks: Vec<Bytes>,
}

/// Whole-genome-shotgun sequence data.
pub trait WgsClient: Send + Sync {
    fn resolve(&self, query: &SeqIdQuery) -> Result<Option<BioseqInfo>>;
    fn fetch_blob(&self, query: &SeqIdQuery) -> Result<Option<WgsBlob>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id2_info_numbering() {
        let id2: Id2Info = "4.1000.3".parse().unwrap();
        assert_eq!(id2.info_blob(), BlobId::new(4, 1000));
        assert_eq!(id2.chunk_blob(1), Some(BlobId::new(4, 997)));
        assert_eq!(id2.chunk_blob(3), Some(BlobId::new(4, 999)));
        assert_eq!(id2.to_string(), "4.1000.3");

        let versioned: Id2Info = "4.1000.3.2".parse().unwrap();
        assert_eq!(versioned.split_version, Some(2));
        assert_eq!(versioned.to_string(), "4.1000.3.2");
    }

    #[test]
    fn chunk_numbers_outside_the_split_have_no_blob() {
        let id2: Id2Info = "4.1000.3".parse().unwrap();
        for k in [0, 4, -1, i64::MAX, i64::MIN] {
            assert_eq!(id2.chunk_blob(k), None, "chunk {k}");
        }

        // Unvalidated numbers near the i32 limits do not overflow.
        let edge = Id2Info {
            sat: 4,
            info: i32::MIN,
            chunks: i32::MAX,
            split_version: None,
        };
        assert_eq!(edge.chunk_blob(1), None);
        assert_eq!(edge.chunk_blob(i64::from(i32::MAX)), None);
    }

    #[test]
    fn malformed_id2_info() {
        for bad in ["", "4.1000", "4.x.3", "4.1000.3.2.1", "4.2.3"] {
            assert!(
                matches!(bad.parse::<Id2Info>(), Err(Error::BadId2Info { .. })),
                "{bad} parsed"
            );
        }
    }

    fn info() -> BioseqInfo {
        BioseqInfo {
            accession: "NC_000001".into(),
            version: 11,
            seq_id_type: 10,
            length: 248_956_422,
            gi: Some(568_815_597),
            ..Default::default()
        }
    }

    #[test]
    fn matching() {
        let info = info();
        assert!(info.matches(&SeqIdQuery::new("NC_000001.11")));
        assert!(info.matches(&SeqIdQuery::new("NC_000001")));
        assert!(!info.matches(&SeqIdQuery::new("NC_000001.10")));
        assert!(info.matches(&SeqIdQuery::new("gi|568815597")));
        let typed = SeqIdQuery {
            seq_id: "NC_000001.11".into(),
            seq_id_type: Some(5),
        };
        assert!(!info.matches(&typed));
    }

    #[test]
    fn json_honors_include_info() {
        let include = IncludeInfo::CANONICAL_ID.union(IncludeInfo::LENGTH);
        let value: serde_json::Value = serde_json::from_slice(&info().to_json(include)).unwrap();
        assert_eq!(value["accession"], "NC_000001");
        assert_eq!(value["version"], 11);
        assert_eq!(value["length"], 248_956_422);
        assert!(value.get("tax_id").is_none());
        assert!(value.get("gi").is_none());
    }

    #[test]
    fn protobuf_honors_include_info() {
        use prost::Message;
        let bytes = info().to_protobuf(IncludeInfo::LENGTH);
        let proto = BioseqInfoProto::decode(bytes.as_slice()).unwrap();
        assert_eq!(proto.length, Some(248_956_422));
        assert_eq!(proto.accession, None);
    }
}
