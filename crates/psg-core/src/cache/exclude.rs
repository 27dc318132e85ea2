use crate::config::ExcludeCacheSettings;
use crate::request::BlobId;
use core::time::Duration;
use parking_lot::Mutex;
use std::{collections::HashMap, time::Instant};

/// Outcome of registering a blob for a client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddResult {
    /// The caller should send the blob and later report it completed.
    Added,
    /// Another request of the same client is sending it.
    InProgress,
    /// Already sent to the client recently.
    Completed {
        sent_ago: Duration,
        until_resend: Duration,
    },
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    completed: bool,
    stamp: Instant,
}

#[derive(Debug)]
struct ClientBlobs {
    blobs: HashMap<BlobId, Entry>,
    last_touch: Instant,
}

impl ClientBlobs {
    fn new(now: Instant) -> Self {
        Self {
            blobs: HashMap::new(),
            last_touch: now,
        }
    }

    /// Drops the oldest `percentage` of entries, at least one.
    fn purge_oldest(&mut self, percentage: u8) {
        let count = (self.blobs.len() * usize::from(percentage) / 100).max(1);
        let mut by_age: Vec<(Instant, BlobId)> =
            self.blobs.iter().map(|(id, e)| (e.stamp, *id)).collect();
        by_age.sort_unstable();
        for (_, id) in by_age.into_iter().take(count) {
            self.blobs.remove(&id);
        }
    }
}

/// Blobs that were (or are being) sent to each client.
///
/// Shared by every request of the process; bounded per client.
#[derive(Debug)]
pub struct ExcludeBlobCache {
    settings: ExcludeCacheSettings,
    clients: Mutex<HashMap<String, ClientBlobs>>,
}

impl ExcludeBlobCache {
    pub fn new(settings: ExcludeCacheSettings) -> Self {
        Self {
            settings,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn add(&self, client_id: &str, blob_id: BlobId) -> AddResult {
        self.add_at(client_id, blob_id, Instant::now())
    }

    fn add_at(&self, client_id: &str, blob_id: BlobId, now: Instant) -> AddResult {
        let mut clients = self.clients.lock();
        let client = clients
            .entry(client_id.to_owned())
            .or_insert_with(|| ClientBlobs::new(now));
        client.last_touch = now;

        if let Some(entry) = client.blobs.get_mut(&blob_id) {
            if !entry.completed {
                return AddResult::InProgress;
            }
            let sent_ago = now.saturating_duration_since(entry.stamp);
            if sent_ago < self.settings.resend_timeout {
                return AddResult::Completed {
                    sent_ago,
                    until_resend: self.settings.resend_timeout - sent_ago,
                };
            }
            *entry = Entry {
                completed: false,
                stamp: now,
            };
            return AddResult::Added;
        }

        client.blobs.insert(
            blob_id,
            Entry {
                completed: false,
                stamp: now,
            },
        );
        if client.blobs.len() > self.settings.max_size {
            client.purge_oldest(self.settings.purge_percentage);
        }
        AddResult::Added
    }

    /// Marks the blob as fully sent. Returns `false` if it is not tracked.
    pub fn set_completed(&self, client_id: &str, blob_id: BlobId) -> bool {
        let mut clients = self.clients.lock();
        let Some(entry) = clients
            .get_mut(client_id)
            .and_then(|c| c.blobs.get_mut(&blob_id))
        else {
            return false;
        };
        *entry = Entry {
            completed: true,
            stamp: Instant::now(),
        };
        true
    }

    /// Forgets the blob, e.g. after its retrieval failed.
    pub fn remove(&self, client_id: &str, blob_id: BlobId) -> bool {
        self.clients
            .lock()
            .get_mut(client_id)
            .is_some_and(|c| c.blobs.remove(&blob_id).is_some())
    }

    /// Drops clients idle for longer than the inactivity timeout. Returns the
    /// number of clients removed.
    pub fn purge_inactive(&self, now: Instant) -> usize {
        let timeout = self.settings.inactivity_timeout;
        let mut clients = self.clients.lock();
        let before = clients.len();
        clients.retain(|_, c| now.saturating_duration_since(c.last_touch) <= timeout);
        before - clients.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn blob_count(&self, client_id: &str) -> usize {
        self.clients
            .lock()
            .get(client_id)
            .map_or(0, |c| c.blobs.len())
    }
}
