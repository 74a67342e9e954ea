//! Newest known edition per signed subspace.

use cask_core::{ClientUri, ContentHash, Key, SubspaceKey};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Mutex;

/// Remembers the highest edition seen for each `(public key, document)`
/// pair. Shared by every resolution of one process.
#[derive(Debug, Default)]
pub struct EditionTracker {
    latest: Mutex<HashMap<(ContentHash, String), u64>>,
}

impl EditionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a verified subspace block. Returns whether it is the first
    /// edition seen for its subspace or newer than the known one.
    pub fn observe(&self, key: &SubspaceKey) -> bool {
        let mut latest = self
            .latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match latest.entry(key.subspace_id()) {
            Entry::Vacant(slot) => {
                slot.insert(key.edition());
                true
            }
            Entry::Occupied(mut slot) if key.edition() > *slot.get() => {
                tracing::debug!(doc = key.doc_name(), edition = key.edition(), "newer edition observed");
                slot.insert(key.edition());
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    /// The newest known edition of `uri`'s subspace, if it is newer than the
    /// one requested.
    pub fn check(&self, uri: &ClientUri) -> Option<ClientUri> {
        let Key::Subspace(key) = uri.key() else {
            return None;
        };
        let latest = self
            .latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match latest.get(&key.subspace_id()) {
            Some(&edition) if edition > key.edition() => Some(uri.with_edition(edition)),
            _ => None,
        }
    }

    pub fn latest(&self, key: &SubspaceKey) -> Option<u64> {
        self.latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&key.subspace_id())
            .copied()
    }
}
