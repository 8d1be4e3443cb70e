/// Collaborator seams: the remote document store and local secure storage.
///
/// In production: implemented by the app's document-store client and the
/// platform keychain. In tests: the in-memory doubles in [`memory`].
pub mod memory;

#[cfg(feature = "keyring")]
pub mod keyring;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::keys::{GroupKeyEpoch, KeyEnvelope};
use crate::types::{Epoch, GroupId, UserId};

pub use memory::{MemoryDocumentStore, MemorySecureStorage, StoreOp};

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Unreachable or timed out. Transient.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Rejected by the store's access rules. Not retried.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("corrupt record at {path}: {reason}")]
    Corrupt { path: String, reason: String },
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// The key-related fields of `users/{uid}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserKeyRecord {
    /// Base64 X25519 public key, once published.
    pub public_key: Option<String>,
    pub needs_key_generation: bool,
}

/// Document paths owned by the store. Used by backends and in log lines.
pub mod paths {
    use crate::types::{Epoch, GroupId, UserId};

    pub fn user(user_id: &UserId) -> String {
        format!("users/{user_id}")
    }

    pub fn groop(group_id: &GroupId) -> String {
        format!("groops/{group_id}")
    }

    pub fn epoch(group_id: &GroupId, epoch: Epoch) -> String {
        format!("groops/{group_id}/keys/{epoch}")
    }

    pub fn envelope(group_id: &GroupId, epoch: Epoch, recipient_id: &UserId) -> String {
        format!("groops/{group_id}/keys/{epoch}/{recipient_id}")
    }
}

/// Remote document store, as far as key management needs it.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read `users/{uid}` key fields. `None` if the profile does not exist.
    async fn user_record(&self, user_id: &UserId) -> Result<Option<UserKeyRecord>, StoreError>;

    /// Write `users/{uid}.publicKey` and clear `needsKeyGeneration`.
    async fn publish_public_key(&self, user_id: &UserId, public_key: &str)
        -> Result<(), StoreError>;

    /// Read `groops/{groupId}.encryptionEnabled` (false if absent).
    async fn encryption_enabled(&self, group_id: &GroupId) -> Result<bool, StoreError>;

    async fn set_encryption_enabled(&self, group_id: &GroupId, enabled: bool)
        -> Result<(), StoreError>;

    /// Latest key epoch record of a group.
    async fn current_epoch(&self, group_id: &GroupId) -> Result<Option<GroupKeyEpoch>, StoreError>;

    async fn write_epoch(&self, epoch: &GroupKeyEpoch) -> Result<(), StoreError>;

    async fn key_envelope(
        &self,
        group_id: &GroupId,
        epoch: Epoch,
        recipient_id: &UserId,
    ) -> Result<Option<KeyEnvelope>, StoreError>;

    /// Upsert keyed by `(group, epoch, recipient)`; last write wins.
    async fn write_key_envelope(&self, envelope: &KeyEnvelope) -> Result<(), StoreError>;

    async fn delete_key_envelope(
        &self,
        group_id: &GroupId,
        epoch: Epoch,
        recipient_id: &UserId,
    ) -> Result<(), StoreError>;
}

/// Platform secure storage holding one private-key blob per user.
#[async_trait::async_trait]
pub trait SecureStorage: Send + Sync {
    async fn load(&self, user_id: &UserId) -> Result<Option<Zeroizing<Vec<u8>>>, StoreError>;

    async fn store(&self, user_id: &UserId, blob: &[u8]) -> Result<(), StoreError>;

    async fn delete(&self, user_id: &UserId) -> Result<(), StoreError>;
}
