//! Download leases
//!
//! A lease marks an archive as being emitted. A delete claims the archive
//! exclusively: it is refused while any lease is held, and no lease can be
//! taken while it runs. Both checks happen on the same map entry, so a
//! download cannot slip in between a delete's check and its removal.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

use crate::storage::ArchiveKey;

#[derive(Debug, Default)]
struct LeaseState {
    readers: usize,
    deleting: bool,
}

/// Reader counts and delete claims by archive key
#[derive(Clone, Default)]
pub struct LeaseTable {
    leases: Arc<DashMap<ArchiveKey, LeaseState>>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a lease; released when the guard drops
    ///
    /// `None` while the archive is being deleted.
    pub fn acquire(&self, key: &ArchiveKey) -> Option<DownloadLease> {
        let mut state = self.leases.entry(key.clone()).or_default();
        if state.deleting {
            return None;
        }
        state.readers += 1;
        drop(state);

        Some(DownloadLease {
            leases: Arc::clone(&self.leases),
            key: key.clone(),
        })
    }

    /// Claim an archive for deletion
    ///
    /// `None` while it is leased or another delete holds it.
    pub fn begin_delete(&self, key: &ArchiveKey) -> Option<DeleteGuard> {
        match self.leases.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                entry.insert(LeaseState {
                    readers: 0,
                    deleting: true,
                });
                Some(DeleteGuard {
                    leases: Arc::clone(&self.leases),
                    key: key.clone(),
                })
            }
        }
    }

    pub fn is_leased(&self, key: &ArchiveKey) -> bool {
        self.leases.get(key).is_some_and(|state| state.readers > 0)
    }

    /// Number of archives with at least one lease
    pub fn len(&self) -> usize {
        self.leases.iter().filter(|state| state.readers > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Guard for one held lease
pub struct DownloadLease {
    leases: Arc<DashMap<ArchiveKey, LeaseState>>,
    key: ArchiveKey,
}

impl DownloadLease {
    pub fn key(&self) -> &ArchiveKey {
        &self.key
    }
}

impl Drop for DownloadLease {
    fn drop(&mut self) {
        if let Some(mut state) = self.leases.get_mut(&self.key) {
            state.readers = state.readers.saturating_sub(1);
        }
        self.leases
            .remove_if(&self.key, |_, state| state.readers == 0 && !state.deleting);
    }
}

/// Exclusive delete claim on one archive
pub struct DeleteGuard {
    leases: Arc<DashMap<ArchiveKey, LeaseState>>,
    key: ArchiveKey,
}

impl Drop for DeleteGuard {
    fn drop(&mut self) {
        self.leases.remove_if(&self.key, |_, state| state.deleting);
    }
}
