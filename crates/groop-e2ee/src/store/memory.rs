/// In-memory collaborators for tests and the simulator.
///
/// `MemoryDocumentStore` is shared by every simulated device (clone it; all
/// clones see the same documents). Envelopes and epochs are kept as
/// MessagePack bytes under their document paths, like a real store would.
/// Failures and latency can be injected per operation.
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use zeroize::Zeroizing;

use super::{paths, DocumentStore, SecureStorage, StoreError, UserKeyRecord};
use crate::keys::{GroupKeyEpoch, KeyEnvelope};
use crate::types::{Epoch, GroupId, UserId};

/// Store operations, for failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    UserRecord,
    PublishPublicKey,
    EncryptionEnabled,
    SetEncryptionEnabled,
    CurrentEpoch,
    WriteEpoch,
    KeyEnvelope,
    WriteKeyEnvelope,
    DeleteKeyEnvelope,
}

struct Failure {
    error: StoreError,
    /// `None` fails forever.
    remaining: Option<u32>,
}

#[derive(Default)]
struct DocState {
    users: HashMap<UserId, UserKeyRecord>,
    encryption_enabled: HashMap<GroupId, bool>,
    epochs: HashMap<GroupId, BTreeMap<Epoch, Vec<u8>>>,
    envelopes: BTreeMap<String, Vec<u8>>,
    failures: HashMap<StoreOp, Failure>,
    calls: HashMap<StoreOp, usize>,
    latency: Option<Duration>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared in-memory document store.
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    state: Arc<Mutex<DocState>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Seeding & inspection ─────────────────────────────────────────────

    /// Create a user profile, as onboarding would.
    pub fn register_user(&self, user_id: impl Into<UserId>, needs_key_generation: bool) {
        lock(&self.state).users.insert(
            user_id.into(),
            UserKeyRecord {
                public_key: None,
                needs_key_generation,
            },
        );
    }

    pub fn user(&self, user_id: &UserId) -> Option<UserKeyRecord> {
        lock(&self.state).users.get(user_id).cloned()
    }

    pub fn is_encryption_enabled(&self, group_id: &GroupId) -> bool {
        lock(&self.state)
            .encryption_enabled
            .get(group_id)
            .copied()
            .unwrap_or(false)
    }

    /// Number of envelopes stored for a group, all epochs.
    pub fn envelope_count(&self, group_id: &GroupId) -> usize {
        let prefix = format!("{}/keys/", paths::groop(group_id));
        lock(&self.state)
            .envelopes
            .keys()
            .filter(|path| path.starts_with(&prefix))
            .count()
    }

    /// Raw stored bytes at an envelope path.
    pub fn raw_envelope(&self, path: &str) -> Option<Vec<u8>> {
        lock(&self.state).envelopes.get(path).cloned()
    }

    /// Overwrite the raw bytes at an envelope path.
    pub fn put_raw_envelope(&self, path: impl Into<String>, bytes: Vec<u8>) {
        lock(&self.state).envelopes.insert(path.into(), bytes);
    }

    // ── Fault injection ──────────────────────────────────────────────────

    /// Make `op` fail with `error` until [`clear_failures`](Self::clear_failures).
    pub fn fail_always(&self, op: StoreOp, error: StoreError) {
        lock(&self.state).failures.insert(
            op,
            Failure {
                error,
                remaining: None,
            },
        );
    }

    /// Make the next `times` calls of `op` fail with `error`.
    pub fn fail_times(&self, op: StoreOp, error: StoreError, times: u32) {
        if times == 0 {
            return;
        }
        lock(&self.state).failures.insert(
            op,
            Failure {
                error,
                remaining: Some(times),
            },
        );
    }

    pub fn clear_failures(&self) {
        lock(&self.state).failures.clear();
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        lock(&self.state).latency = latency;
    }

    /// How many times `op` was attempted (including failed attempts).
    pub fn calls(&self, op: StoreOp) -> usize {
        lock(&self.state).calls.get(&op).copied().unwrap_or(0)
    }

    // ── Internal ─────────────────────────────────────────────────────────

    /// Count the call, apply latency, then return an injected failure if any.
    async fn enter(&self, op: StoreOp) -> Result<(), StoreError> {
        let latency = {
            let mut state = lock(&self.state);
            *state.calls.entry(op).or_default() += 1;
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = lock(&self.state);
        let (error, exhausted) = match state.failures.get_mut(&op) {
            None => return Ok(()),
            Some(Failure {
                error,
                remaining: None,
            }) => return Err(error.clone()),
            Some(Failure {
                error,
                remaining: Some(n),
            }) => {
                *n = n.saturating_sub(1);
                (error.clone(), *n == 0)
            }
        };
        if exhausted {
            state.failures.remove(&op);
        }
        Err(error)
    }
}

fn corrupt(path: String, e: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt {
        path,
        reason: e.to_string(),
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn user_record(&self, user_id: &UserId) -> Result<Option<UserKeyRecord>, StoreError> {
        self.enter(StoreOp::UserRecord).await?;
        Ok(lock(&self.state).users.get(user_id).cloned())
    }

    async fn publish_public_key(
        &self,
        user_id: &UserId,
        public_key: &str,
    ) -> Result<(), StoreError> {
        self.enter(StoreOp::PublishPublicKey).await?;
        let mut state = lock(&self.state);
        let record = state.users.entry(user_id.clone()).or_default();
        record.public_key = Some(public_key.to_string());
        record.needs_key_generation = false;
        Ok(())
    }

    async fn encryption_enabled(&self, group_id: &GroupId) -> Result<bool, StoreError> {
        self.enter(StoreOp::EncryptionEnabled).await?;
        Ok(self.is_encryption_enabled(group_id))
    }

    async fn set_encryption_enabled(
        &self,
        group_id: &GroupId,
        enabled: bool,
    ) -> Result<(), StoreError> {
        self.enter(StoreOp::SetEncryptionEnabled).await?;
        lock(&self.state)
            .encryption_enabled
            .insert(group_id.clone(), enabled);
        Ok(())
    }

    async fn current_epoch(&self, group_id: &GroupId) -> Result<Option<GroupKeyEpoch>, StoreError> {
        self.enter(StoreOp::CurrentEpoch).await?;
        let state = lock(&self.state);
        let Some((epoch, bytes)) = state
            .epochs
            .get(group_id)
            .and_then(|epochs| epochs.iter().next_back())
        else {
            return Ok(None);
        };
        GroupKeyEpoch::from_bytes(bytes)
            .map(Some)
            .map_err(|e| corrupt(paths::epoch(group_id, *epoch), e))
    }

    async fn write_epoch(&self, epoch: &GroupKeyEpoch) -> Result<(), StoreError> {
        self.enter(StoreOp::WriteEpoch).await?;
        let path = paths::epoch(&epoch.group_id, epoch.epoch);
        let bytes = epoch.to_bytes().map_err(|e| corrupt(path, e))?;
        lock(&self.state)
            .epochs
            .entry(epoch.group_id.clone())
            .or_default()
            .insert(epoch.epoch, bytes);
        Ok(())
    }

    async fn key_envelope(
        &self,
        group_id: &GroupId,
        epoch: Epoch,
        recipient_id: &UserId,
    ) -> Result<Option<KeyEnvelope>, StoreError> {
        self.enter(StoreOp::KeyEnvelope).await?;
        let path = paths::envelope(group_id, epoch, recipient_id);
        let Some(bytes) = lock(&self.state).envelopes.get(&path).cloned() else {
            return Ok(None);
        };
        KeyEnvelope::from_bytes(&bytes)
            .map(Some)
            .map_err(|e| corrupt(path, e))
    }

    async fn write_key_envelope(&self, envelope: &KeyEnvelope) -> Result<(), StoreError> {
        self.enter(StoreOp::WriteKeyEnvelope).await?;
        let path = paths::envelope(envelope.group_id(), envelope.epoch(), envelope.recipient_id());
        let bytes = envelope.to_bytes().map_err(|e| corrupt(path.clone(), e))?;
        lock(&self.state).envelopes.insert(path, bytes);
        Ok(())
    }

    async fn delete_key_envelope(
        &self,
        group_id: &GroupId,
        epoch: Epoch,
        recipient_id: &UserId,
    ) -> Result<(), StoreError> {
        self.enter(StoreOp::DeleteKeyEnvelope).await?;
        lock(&self.state)
            .envelopes
            .remove(&paths::envelope(group_id, epoch, recipient_id));
        Ok(())
    }
}

// ── MemorySecureStorage ──────────────────────────────────────────────────

/// Per-device secure storage. Blobs zeroize when replaced or dropped.
#[derive(Clone, Default)]
pub struct MemorySecureStorage {
    blobs: Arc<Mutex<HashMap<UserId, Zeroizing<Vec<u8>>>>>,
    fail_writes: Arc<Mutex<bool>>,
}

impl MemorySecureStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        *lock(&self.fail_writes) = fail;
    }

    pub fn contains(&self, user_id: &UserId) -> bool {
        lock(&self.blobs).contains_key(user_id)
    }
}

#[async_trait::async_trait]
impl SecureStorage for MemorySecureStorage {
    async fn load(&self, user_id: &UserId) -> Result<Option<Zeroizing<Vec<u8>>>, StoreError> {
        Ok(lock(&self.blobs).get(user_id).cloned())
    }

    async fn store(&self, user_id: &UserId, blob: &[u8]) -> Result<(), StoreError> {
        if *lock(&self.fail_writes) {
            return Err(StoreError::Unavailable("secure storage locked".into()));
        }
        lock(&self.blobs).insert(user_id.clone(), Zeroizing::new(blob.to_vec()));
        Ok(())
    }

    async fn delete(&self, user_id: &UserId) -> Result<(), StoreError> {
        lock(&self.blobs).remove(user_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_creates_and_clears_flag() {
        let store = MemoryDocumentStore::new();
        store.register_user("alice", true);
        store
            .publish_public_key(&"alice".into(), "AAAA")
            .await
            .unwrap();

        let record = store.user(&"alice".into()).unwrap();
        assert_eq!(record.public_key.as_deref(), Some("AAAA"));
        assert!(!record.needs_key_generation);
    }

    #[tokio::test]
    async fn fail_times_then_recovers() {
        let store = MemoryDocumentStore::new();
        store.fail_times(
            StoreOp::UserRecord,
            StoreError::Unavailable("offline".into()),
            2,
        );

        assert!(store.user_record(&"a".into()).await.is_err());
        assert!(store.user_record(&"a".into()).await.is_err());
        assert!(store.user_record(&"a".into()).await.is_ok());
        assert_eq!(store.calls(StoreOp::UserRecord), 3);
    }

    #[tokio::test]
    async fn fail_always_until_cleared() {
        let store = MemoryDocumentStore::new();
        store.fail_always(
            StoreOp::SetEncryptionEnabled,
            StoreError::PermissionDenied("rules".into()),
        );
        for _ in 0..3 {
            assert!(store.set_encryption_enabled(&"G".into(), true).await.is_err());
        }
        store.clear_failures();
        store.set_encryption_enabled(&"G".into(), true).await.unwrap();
        assert!(store.is_encryption_enabled(&"G".into()));
    }

    #[tokio::test]
    async fn corrupt_envelope_reported() {
        let store = MemoryDocumentStore::new();
        let path = paths::envelope(&"G".into(), 0, &"bob".into());
        store.put_raw_envelope(path.clone(), vec![0xc1, 0x00]);

        let result = store.key_envelope(&"G".into(), 0, &"bob".into()).await;
        assert!(matches!(result, Err(StoreError::Corrupt { path: p, .. }) if p == path));
    }

    #[tokio::test]
    async fn secure_storage_roundtrip() {
        let storage = MemorySecureStorage::new();
        let user = UserId::from("alice");
        assert!(storage.load(&user).await.unwrap().is_none());

        storage.store(&user, &[7u8; 41]).await.unwrap();
        assert_eq!(storage.load(&user).await.unwrap().unwrap().as_slice(), &[7u8; 41]);

        storage.delete(&user).await.unwrap();
        assert!(!storage.contains(&user));
    }

    #[tokio::test]
    async fn secure_storage_write_failure() {
        let storage = MemorySecureStorage::new();
        storage.set_fail_writes(true);
        assert!(storage.store(&"a".into(), &[1]).await.is_err());
    }
}
