use crate::request::BlobId;
use bytes::Bytes;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

struct Entry {
    chunks: Arc<[Bytes]>,
    tick: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<BlobId, Entry>,
    tick: u64,
}

/// Assembled id2 split-info blobs, keyed by the info blob id.
///
/// Least recently used entries are purged down to 80% of `max_size` once the
/// limit is exceeded. A `max_size` of 0 disables the cache.
pub struct SplitInfoCache {
    max_size: usize,
    inner: Mutex<Inner>,
}

impl SplitInfoCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn get(&self, blob_id: &BlobId) -> Option<Arc<[Bytes]>> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        let entry = inner.entries.get_mut(blob_id)?;
        entry.tick = tick;
        Some(Arc::clone(&entry.chunks))
    }

    pub fn put(&self, blob_id: BlobId, chunks: Vec<Bytes>) {
        if self.max_size == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        inner.entries.insert(
            blob_id,
            Entry {
                chunks: chunks.into(),
                tick,
            },
        );
        if inner.entries.len() > self.max_size {
            let low_water = self.max_size * 8 / 10;
            let mut by_use: Vec<(u64, BlobId)> =
                inner.entries.iter().map(|(id, e)| (e.tick, *id)).collect();
            by_use.sort_unstable();
            let excess = inner.entries.len() - low_water;
            for (_, id) in by_use.into_iter().take(excess) {
                inner.entries.remove(&id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
