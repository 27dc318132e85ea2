//! Decoded client requests.
//!
//! A [`Request`] is created once by the HTTP layer and shared (via `Arc`) by
//! every processor working on it. Apart from the request-level overall status
//! and the resource claims, it is immutable.

use crate::common::{Error, Result, status};
use crate::protocol::OutputFormat;
use core::{fmt, str::FromStr, time::Duration};
use parking_lot::Mutex;
use portable_atomic::{AtomicU16, AtomicUsize, Ordering};
use std::{collections::HashMap, time::Instant};

static NEXT_REQUEST_ID: AtomicUsize = AtomicUsize::new(1);

/// Cassandra blob address: satellite number and key within it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobId {
    pub sat: i32,
    pub sat_key: i32,
}

impl BlobId {
    pub const fn new(sat: i32, sat_key: i32) -> Self {
        Self { sat, sat_key }
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.sat, self.sat_key)
    }
}

impl FromStr for BlobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidRequest {
            reason: format!("malformed blob id '{s}', expected <sat>.<sat_key>"),
        };
        let (sat, sat_key) = s.split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            sat: sat.trim().parse().map_err(|_| invalid())?,
            sat_key: sat_key.trim().parse().map_err(|_| invalid())?,
        })
    }
}

/// How the local cache participates in a lookup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CacheUsage {
    CacheOnly,
    DbOnly,
    #[default]
    Default,
}

impl FromStr for CacheUsage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "yes" => Ok(Self::CacheOnly),
            "no" => Ok(Self::DbOnly),
            "" | "default" => Ok(Self::Default),
            other => Err(Error::InvalidRequest {
                reason: format!("use_cache must be yes, no or default, got '{other}'"),
            }),
        }
    }
}

/// How much of a split (TSE) blob to send.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TseOption {
    None,
    Slim,
    Smart,
    Whole,
    #[default]
    Orig,
    /// Used by sub-fetches whose strategy is decided by their parent.
    Unknown,
}

impl FromStr for TseOption {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "slim" => Ok(Self::Slim),
            "smart" => Ok(Self::Smart),
            "whole" => Ok(Self::Whole),
            "orig" => Ok(Self::Orig),
            other => Err(Error::InvalidRequest {
                reason: format!("unknown tse option '{other}'"),
            }),
        }
    }
}

/// Which bioseq info fields a resolve request wants back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IncludeInfo(u32);

impl IncludeInfo {
    pub const CANONICAL_ID: Self = Self(1 << 0);
    pub const SEQ_IDS: Self = Self(1 << 1);
    pub const MOL_TYPE: Self = Self(1 << 2);
    pub const LENGTH: Self = Self(1 << 3);
    pub const STATE: Self = Self(1 << 4);
    pub const BLOB_ID: Self = Self(1 << 5);
    pub const TAX_ID: Self = Self(1 << 6);
    pub const HASH: Self = Self(1 << 7);
    pub const DATE_CHANGED: Self = Self(1 << 8);
    pub const GI: Self = Self(1 << 9);
    pub const NAME: Self = Self(1 << 10);
    pub const ALL: Self = Self((1 << 11) - 1);

    const NAMES: [(&'static str, Self); 11] = [
        ("canonical_id", Self::CANONICAL_ID),
        ("seq_ids", Self::SEQ_IDS),
        ("mol_type", Self::MOL_TYPE),
        ("length", Self::LENGTH),
        ("state", Self::STATE),
        ("blob_id", Self::BLOB_ID),
        ("tax_id", Self::TAX_ID),
        ("hash", Self::HASH),
        ("date_changed", Self::DATE_CHANGED),
        ("gi", Self::GI),
        ("name", Self::NAME),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Parses a list of field names. `canonical-id` and `canonical_id` are
    /// both accepted; `all` selects every field.
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let mut include = Self::empty();
        for raw in names {
            let name = raw.trim().replace('-', "_");
            if name.is_empty() {
                continue;
            }
            if name == "all" {
                return Ok(Self::ALL);
            }
            let flag = Self::NAMES
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, f)| *f)
                .ok_or_else(|| Error::InvalidRequest {
                    reason: format!("unknown include_info field '{raw}'"),
                })?;
            include = include.union(flag);
        }
        Ok(include)
    }
}

impl Default for IncludeInfo {
    fn default() -> Self {
        Self::ALL
    }
}

/// A seq-id as the client typed it, with an optional explicit type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SeqIdQuery {
    pub seq_id: String,
    pub seq_id_type: Option<i32>,
}

impl SeqIdQuery {
    pub fn new(seq_id: impl Into<String>) -> Self {
        Self {
            seq_id: seq_id.into(),
            seq_id_type: None,
        }
    }

    /// Splits `ACCESSION.VERSION`; a missing or non-numeric version yields
    /// `None`.
    pub fn accession_version(&self) -> (&str, Option<i32>) {
        let id = self.seq_id.rsplit('|').next().unwrap_or(&self.seq_id);
        match id.rsplit_once('.') {
            Some((acc, ver)) => match ver.parse() {
                Ok(v) => (acc, Some(v)),
                Err(_) => (id, None),
            },
            None => (id, None),
        }
    }

    /// The numeric gi, for `gi|N` or a bare number.
    pub fn gi(&self) -> Option<i64> {
        let raw = self.seq_id.strip_prefix("gi|").unwrap_or(&self.seq_id);
        raw.parse().ok()
    }
}

impl fmt::Display for SeqIdQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.seq_id)
    }
}

/// Options shared by every request that may end up streaming a blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobOptions {
    pub tse_option: TseOption,
    pub use_cache: CacheUsage,
    pub client_id: String,
    /// Per-request size threshold for slim and smart TSE options.
    pub send_blob_if_small: u64,
    pub exclude_blobs: Vec<BlobId>,
    pub auto_blob_skipping: bool,
    pub last_modified: Option<i64>,
}

impl Default for BlobOptions {
    fn default() -> Self {
        Self {
            tse_option: TseOption::default(),
            use_cache: CacheUsage::default(),
            client_id: String::new(),
            send_blob_if_small: 0,
            exclude_blobs: Vec::new(),
            auto_blob_skipping: true,
            last_modified: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolveRequest {
    pub seq_id: SeqIdQuery,
    pub include: IncludeInfo,
    pub output_format: OutputFormat,
    pub use_cache: CacheUsage,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobBySeqIdRequest {
    pub seq_id: SeqIdQuery,
    pub options: BlobOptions,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobBySatSatKeyRequest {
    pub blob_id: BlobId,
    pub options: BlobOptions,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnnotRequest {
    pub seq_id: SeqIdQuery,
    pub names: Vec<String>,
    pub options: BlobOptions,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TseChunkRequest {
    pub id2_chunk: i64,
    pub id2_info: String,
    pub use_cache: CacheUsage,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccVerHistoryRequest {
    pub seq_id: SeqIdQuery,
    pub use_cache: CacheUsage,
}

/// The typed body of a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestPayload {
    Resolve(ResolveRequest),
    BlobBySeqId(BlobBySeqIdRequest),
    BlobBySatSatKey(BlobBySatSatKeyRequest),
    Annot(AnnotRequest),
    TseChunk(TseChunkRequest),
    AccVerHistory(AccVerHistoryRequest),
}

/// Discriminant of [`RequestPayload`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Resolve,
    BlobBySeqId,
    BlobBySatSatKey,
    Annot,
    TseChunk,
    AccVerHistory,
}

impl RequestKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Resolve => "resolve",
            Self::BlobBySeqId => "get",
            Self::BlobBySatSatKey => "getblob",
            Self::Annot => "get_na",
            Self::TseChunk => "get_tse_chunk",
            Self::AccVerHistory => "get_acc_ver_history",
        }
    }
}

impl RequestPayload {
    pub const fn kind(&self) -> RequestKind {
        match self {
            Self::Resolve(_) => RequestKind::Resolve,
            Self::BlobBySeqId(_) => RequestKind::BlobBySeqId,
            Self::BlobBySatSatKey(_) => RequestKind::BlobBySatSatKey,
            Self::Annot(_) => RequestKind::Annot,
            Self::TseChunk(_) => RequestKind::TseChunk,
            Self::AccVerHistory(_) => RequestKind::AccVerHistory,
        }
    }

    /// The seq-id the request is about, if it names one.
    pub fn seq_id(&self) -> Option<&SeqIdQuery> {
        match self {
            Self::Resolve(r) => Some(&r.seq_id),
            Self::BlobBySeqId(r) => Some(&r.seq_id),
            Self::Annot(r) => Some(&r.seq_id),
            Self::AccVerHistory(r) => Some(&r.seq_id),
            Self::BlobBySatSatKey(_) | Self::TseChunk(_) => None,
        }
    }
}

/// A client request shared by all processors serving it.
#[derive(Debug)]
pub struct Request {
    id: usize,
    payload: RequestPayload,
    created: Instant,
    deadline: Option<Instant>,
    trace: bool,
    hops: u32,
    overall_status: AtomicU16,
    claims: Mutex<HashMap<String, u32>>,
}

impl Request {
    pub fn new(payload: RequestPayload) -> Self {
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            payload,
            created: Instant::now(),
            deadline: None,
            trace: false,
            hops: 0,
            overall_status: AtomicU16::new(status::OK),
            claims: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(self.created + timeout);
        self
    }

    #[must_use]
    pub fn with_hops(mut self, hops: u32) -> Self {
        self.hops = hops;
        self
    }

    pub const fn id(&self) -> usize {
        self.id
    }

    pub const fn payload(&self) -> &RequestPayload {
        &self.payload
    }

    pub const fn kind(&self) -> RequestKind {
        self.payload.kind()
    }

    pub const fn created(&self) -> Instant {
        self.created
    }

    pub const fn need_trace(&self) -> bool {
        self.trace
    }

    pub const fn hops(&self) -> u32 {
        self.hops
    }

    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Raises the request-level status; lower codes never overwrite higher
    /// ones.
    pub fn update_overall_status(&self, code: u16) {
        self.overall_status.fetch_max(code, Ordering::AcqRel);
    }

    pub fn overall_status(&self) -> u16 {
        self.overall_status.load(Ordering::Acquire)
    }

    /// Registers `priority` as a claimant of `resource` within this request
    /// and returns the highest priority that claimed it before (0 if none).
    ///
    /// A processor only sends the resource when the returned value is lower
    /// than its own priority.
    pub fn claim_resource(&self, resource: &str, priority: u32) -> u32 {
        let mut claims = self.claims.lock();
        let entry = claims.entry(resource.to_owned()).or_insert(0);
        let previous = *entry;
        if priority > previous {
            *entry = priority;
        }
        previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(seq_id: &str) -> Request {
        Request::new(RequestPayload::Resolve(ResolveRequest {
            seq_id: SeqIdQuery::new(seq_id),
            include: IncludeInfo::default(),
            output_format: OutputFormat::Json,
            use_cache: CacheUsage::Default,
        }))
    }

    #[test]
    fn request_ids_are_unique() {
        let a = resolve("A");
        let b = resolve("B");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn overall_status_only_grows() {
        let r = resolve("A");
        assert_eq!(r.overall_status(), 200);
        r.update_overall_status(404);
        r.update_overall_status(403);
        assert_eq!(r.overall_status(), 404);
        r.update_overall_status(500);
        assert_eq!(r.overall_status(), 500);
    }

    #[test]
    fn resource_claims_report_the_highest_previous_priority() {
        let r = resolve("A");
        assert_eq!(r.claim_resource("NA000000001.1", 3), 0);
        assert_eq!(r.claim_resource("NA000000001.1", 5), 3);
        assert_eq!(r.claim_resource("NA000000001.1", 4), 5);
        assert_eq!(r.claim_resource("NA000000002.1", 1), 0);
    }

    #[test]
    fn include_info_parses_both_spellings() {
        let inc = IncludeInfo::from_names("canonical-id,length".split(',')).unwrap();
        assert!(inc.contains(IncludeInfo::CANONICAL_ID));
        assert!(inc.contains(IncludeInfo::LENGTH));
        assert!(!inc.contains(IncludeInfo::TAX_ID));
        assert!(IncludeInfo::from_names(["bogus"]).is_err());
        assert_eq!(IncludeInfo::from_names(["all"]).unwrap(), IncludeInfo::ALL);
    }

    #[test]
    fn seq_id_splits_accession_and_version() {
        assert_eq!(SeqIdQuery::new("NC_000001.11").accession_version(), ("NC_000001", Some(11)));
        assert_eq!(SeqIdQuery::new("ref|NC_000001.11").accession_version(), ("NC_000001", Some(11)));
        assert_eq!(SeqIdQuery::new("NC_000001").accession_version(), ("NC_000001", None));
        assert_eq!(SeqIdQuery::new("gi|12345").gi(), Some(12345));
        assert_eq!(SeqIdQuery::new("NC_000001").gi(), None);
    }

    #[test]
    fn blob_id_parses() {
        assert_eq!("4.123".parse::<BlobId>().unwrap(), BlobId::new(4, 123));
        assert!("4".parse::<BlobId>().is_err());
        assert!("a.b".parse::<BlobId>().is_err());
        assert_eq!(BlobId::new(4, 123).to_string(), "4.123");
    }

    #[test]
    fn deadline() {
        let r = resolve("A").with_timeout(Duration::ZERO);
        assert!(r.deadline_passed());
        assert!(!resolve("A").deadline_passed());
    }
}
