use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::job::StatusRecord;

struct Entry {
    record: StatusRecord,
    cancel: CancellationToken,
    /// Set once the record turns terminal.
    expires_at: Option<Instant>,
}

/// Process-wide map from job identifier to its latest status.
///
/// Terminal records are retained for `retention` and then evicted; processing records
/// never expire. The lock is only held for map operations, never across an await.
pub struct StatusRegistry {
    entries: RwLock<HashMap<Uuid, Entry>>,
    retention: Duration,
}

impl StatusRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            retention,
        }
    }

    /// Insert the initial record for `id` and hand back its cancellation token.
    pub fn register(&self, id: Uuid, record: StatusRecord) -> CancellationToken {
        let cancel = CancellationToken::new();
        let expires_at = self.expiry_for(&record);
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            id,
            Entry {
                record,
                cancel: cancel.clone(),
                expires_at,
            },
        );
        cancel
    }

    /// Replace the record for `id`. Returns `false` if the entry is gone (cleaned up
    /// while the job was still running), in which case nothing is written.
    pub fn update(&self, id: Uuid, record: StatusRecord) -> bool {
        let expires_at = self.expiry_for(&record);
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        match entries.get_mut(&id) {
            Some(entry) => {
                entry.record = record;
                entry.expires_at = expires_at;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: Uuid) -> Option<StatusRecord> {
        self.get_at(id, Instant::now())
    }

    pub(crate) fn get_at(&self, id: Uuid, now: Instant) -> Option<StatusRecord> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(&id)
            .filter(|entry| entry.expires_at.map_or(true, |at| at > now))
            .map(|entry| entry.record.clone())
    }

    pub fn remove(&self, id: Uuid) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        match entries.remove(&id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Request cancellation of a running job. Returns `false` for unknown or
    /// already finished jobs.
    pub fn cancel(&self, id: Uuid) -> bool {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        match entries.get(&id) {
            Some(entry) if !entry.record.status.is_terminal() => {
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Drop terminal records whose retention has elapsed.
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    pub(crate) fn evict_expired_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of jobs still processing.
    pub fn active(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .values()
            .filter(|entry| !entry.record.status.is_terminal())
            .count()
    }

    fn expiry_for(&self, record: &StatusRecord) -> Option<Instant> {
        record
            .status
            .is_terminal()
            .then(|| Instant::now() + self.retention)
    }
}
