//! Process-lifetime resolution cache.
//!
//! Maps a [`ResourceKey`] to the URI that last served it, or to the
//! [`Resolution::Unavailable`] sentinel once every endpoint has been exhausted.
//! There is no eviction: the key universe is the finite collection.

use crate::loader::key::ResourceKey;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(String),
    /// Every candidate failed; callers should go straight to their fallback.
    Unavailable,
}

#[derive(Debug, Clone, Default)]
pub struct ResolutionCache {
    entries: Arc<DashMap<ResourceKey, Resolution>>,
}

impl ResolutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ResourceKey) -> Option<Resolution> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Store a resolution. Returns `true` if the entry was written.
    ///
    /// Entries are write-once: a resolved URI is never replaced. The only
    /// permitted overwrite is upgrading `Unavailable` to a resolved URI.
    pub fn set(&self, key: ResourceKey, value: Resolution) -> bool {
        match self.entries.entry(key) {
            Entry::Vacant(slot) => {
                trace!(key = %slot.key(), ?value, "cache entry stored");
                slot.insert(value);
                true
            }
            Entry::Occupied(mut slot) => {
                let upgrade = matches!(slot.get(), Resolution::Unavailable)
                    && matches!(value, Resolution::Resolved(_));
                if !upgrade {
                    return false;
                }
                trace!(key = %slot.key(), ?value, "cache sentinel upgraded");
                slot.insert(value);
                true
            }
        }
    }

    /// Drop a key so the next load goes back to the network.
    pub fn invalidate(&self, key: &ResourceKey) -> Option<Resolution> {
        self.entries.remove(key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
