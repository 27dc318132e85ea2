//! Processors backed by the Cassandra blob storage and the local cache.
//!
//! One [`CassFactory`] is registered per [`CassProcessorKind`]. All of them
//! share a [`CassServices`] bundle holding the storage handles and the
//! process-wide caches.

use crate::backend::{
    BackendError, BioseqStore, BlobStore, CacheLookup, Id2Info, LookupCache, ResolveCallback,
};
use crate::cache::{ExcludeBlobCache, SplitInfoCache};
use crate::config::Settings;
use crate::processor::{Processor, ProcessorContext};
use crate::reply::Reply;
use crate::request::{CacheUsage, Request, RequestKind, RequestPayload, SeqIdQuery};
use std::sync::Arc;

mod blob_base;
mod fetch;
mod history;
mod resolve;

#[cfg(test)]
mod tests;

pub use blob_base::CassBlobProcessor;
pub use history::CassAccVerHistoryProcessor;
pub use resolve::CassResolveProcessor;

pub const GROUP_NAME: &str = "CASSANDRA";

/// Storage handles and caches shared by every Cassandra processor.
pub struct CassServices {
    pub store: Arc<dyn BlobStore>,
    pub bioseq: Arc<dyn BioseqStore>,
    pub cache: Option<Arc<dyn LookupCache>>,
    pub exclude: Arc<ExcludeBlobCache>,
    pub split_info: Arc<SplitInfoCache>,
    pub settings: Arc<Settings>,
}

impl CassServices {
    pub fn new(
        store: Arc<dyn BlobStore>,
        bioseq: Arc<dyn BioseqStore>,
        cache: Option<Arc<dyn LookupCache>>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            store,
            bioseq,
            cache,
            exclude: Arc::new(ExcludeBlobCache::new(settings.exclude_cache.clone())),
            split_info: Arc::new(SplitInfoCache::new(settings.split_info_cache_size)),
            settings,
        }
    }

    /// Resolves `query` honoring `use_cache`. `cb` runs exactly once, possibly
    /// before this returns.
    pub(crate) fn resolve_seq_id(&self, query: &SeqIdQuery, use_cache: CacheUsage, cb: ResolveCallback) {
        let cached = match (&self.cache, use_cache) {
            (_, CacheUsage::DbOnly) => None,
            (Some(cache), _) => Some(cache.lookup_bioseq_info(query)),
            (None, _) => Some(CacheLookup::NotHit),
        };
        match (cached, use_cache) {
            (Some(CacheLookup::Hit(info)), _) => cb(Ok(Some(info))),
            (Some(CacheLookup::NotHit), CacheUsage::CacheOnly) => cb(Ok(None)),
            (Some(CacheLookup::Error(message)), CacheUsage::CacheOnly) => {
                cb(Err(BackendError::lookup_cache(message)))
            }
            (Some(CacheLookup::Error(_message)), _) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Lookup cache failed ({_message}), falling back to the database");
                self.bioseq.resolve(query, cb);
            }
            _ => self.bioseq.resolve(query, cb),
        }
    }
}

/// The Cassandra processors, in registration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CassProcessorKind {
    GetBlob,
    Get,
    TseChunk,
    Annot,
    Resolve,
    AccVerHistory,
}

impl CassProcessorKind {
    pub const ALL: [Self; 6] = [
        Self::GetBlob,
        Self::Get,
        Self::TseChunk,
        Self::Annot,
        Self::Resolve,
        Self::AccVerHistory,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::GetBlob => "Cassandra-getblob",
            Self::Get => "Cassandra-get",
            Self::TseChunk => "Cassandra-gettsechunk",
            Self::Annot => "Cassandra-getna",
            Self::Resolve => "Cassandra-resolve",
            Self::AccVerHistory => "Cassandra-accession-version-history",
        }
    }

    pub const fn request_kind(self) -> RequestKind {
        match self {
            Self::GetBlob => RequestKind::BlobBySatSatKey,
            Self::Get => RequestKind::BlobBySeqId,
            Self::TseChunk => RequestKind::TseChunk,
            Self::Annot => RequestKind::Annot,
            Self::Resolve => RequestKind::Resolve,
            Self::AccVerHistory => RequestKind::AccVerHistory,
        }
    }
}

/// Registry entry creating Cassandra processors of one kind.
pub struct CassFactory {
    kind: CassProcessorKind,
    services: Arc<CassServices>,
}

impl CassFactory {
    pub fn new(kind: CassProcessorKind, services: Arc<CassServices>) -> Self {
        Self { kind, services }
    }

    /// One factory per kind, in registration order.
    pub fn all(services: &Arc<CassServices>) -> Vec<Arc<dyn Processor>> {
        CassProcessorKind::ALL
            .into_iter()
            .map(|kind| Arc::new(Self::new(kind, Arc::clone(services))) as Arc<dyn Processor>)
            .collect()
    }
}

impl Processor for CassFactory {
    fn what_can_process(&self) -> Vec<RequestKind> {
        vec![self.kind.request_kind()]
    }

    fn can_process(&self, request: &Request, _reply: &Reply) -> bool {
        if request.kind() != self.kind.request_kind() {
            return false;
        }
        match request.payload() {
            RequestPayload::BlobBySatSatKey(r) => self.services.store.knows_sat(r.blob_id.sat),
            RequestPayload::TseChunk(r) => r
                .id2_info
                .parse::<Id2Info>()
                .is_ok_and(|id2| self.services.store.knows_sat(id2.sat)),
            RequestPayload::Annot(r) => !r.names.is_empty(),
            _ => true,
        }
    }

    fn create_processor(&self, ctx: ProcessorContext) -> Option<Arc<dyn Processor>> {
        let services = Arc::clone(&self.services);
        match self.kind {
            CassProcessorKind::Resolve => CassResolveProcessor::create(ctx, services),
            CassProcessorKind::AccVerHistory => CassAccVerHistoryProcessor::create(ctx, services),
            kind => CassBlobProcessor::create(ctx, services, kind),
        }
    }

    fn process(&self) {}

    fn cancel(&self) {}

    fn status(&self) -> crate::common::ProcessorStatus {
        crate::common::ProcessorStatus::InProgress
    }

    fn name(&self) -> &'static str {
        self.kind.name()
    }

    fn group_name(&self) -> &'static str {
        GROUP_NAME
    }
}
