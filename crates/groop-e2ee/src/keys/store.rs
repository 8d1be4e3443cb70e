/// GroupKeyStore: per-session cache of plaintext group keys.
///
/// Pure state: no I/O, never fetches. Entries only come from a successful
/// unwrap or from local generation at setup. Keys zeroize when dropped, so
/// `evict` and `clear` wipe them (best effort).
use std::collections::{BTreeMap, HashMap};

use crate::crypto::GroupKey;
use crate::types::{Epoch, GroupId};

/// In-memory cache `(group_id, epoch) -> key`.
#[derive(Default)]
pub struct GroupKeyStore {
    keys: HashMap<GroupId, BTreeMap<Epoch, GroupKey>>,
}

impl GroupKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest cached epoch and its key.
    pub fn get(&self, group_id: &GroupId) -> Option<(Epoch, GroupKey)> {
        self.keys
            .get(group_id)?
            .iter()
            .next_back()
            .map(|(epoch, key)| (*epoch, key.clone()))
    }

    /// Key of one exact epoch.
    pub fn get_epoch(&self, group_id: &GroupId, epoch: Epoch) -> Option<GroupKey> {
        self.keys.get(group_id)?.get(&epoch).cloned()
    }

    /// Insert or overwrite a key.
    pub fn put(&mut self, group_id: GroupId, epoch: Epoch, key: GroupKey) {
        self.keys.entry(group_id).or_default().insert(epoch, key);
    }

    /// Drop every key of a group (group leave).
    pub fn evict(&mut self, group_id: &GroupId) -> bool {
        self.keys.remove(group_id).is_some()
    }

    /// Drop everything (logout).
    pub fn clear(&mut self) {
        self.keys.clear();
    }

    pub fn contains(&self, group_id: &GroupId) -> bool {
        self.keys.contains_key(group_id)
    }

    /// Number of groups with at least one cached key.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
