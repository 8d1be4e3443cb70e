/// IdentityKeyManager: one X25519 keypair per user on this device.
///
/// The private key lives in [`SecureStorage`]; the public key is published
/// to `users/{uid}.publicKey`. Generation happens at most once per user:
/// the cache lock is held across the whole load-or-generate sequence.
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::types::Identity;
use crate::crypto::{PrivateKey, PublicKey};
use crate::error::E2eeError;
use crate::exchange::retry::{check_cancelled, RetryPolicy};
use crate::store::{DocumentStore, SecureStorage};
use crate::types::{now_ms, UserId};

pub struct IdentityKeyManager {
    directory: Arc<dyn DocumentStore>,
    secure: Arc<dyn SecureStorage>,
    retry: RetryPolicy,
    cache: Mutex<HashMap<UserId, Arc<Identity>>>,
}

impl IdentityKeyManager {
    pub fn new(
        directory: Arc<dyn DocumentStore>,
        secure: Arc<dyn SecureStorage>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            directory,
            secure,
            retry,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Load or create the identity of `user_id`.
    ///
    /// A fresh key is written to secure storage before it is published, so
    /// a failed publish is repaired by the next call instead of orphaning a
    /// published key nobody holds.
    pub async fn ensure_identity(
        &self,
        user_id: &UserId,
        cancel: &CancellationToken,
    ) -> Result<Arc<Identity>, E2eeError> {
        let mut cache = self.cache.lock().await;
        if let Some(identity) = cache.get(user_id) {
            return Ok(identity.clone());
        }
        check_cancelled(cancel)?;

        let identity = match self.load_from_storage(user_id).await? {
            Some(identity) => {
                match self.reconcile(&identity, cancel).await {
                    Ok(_) => {}
                    Err(E2eeError::Cancelled) => return Err(E2eeError::Cancelled),
                    Err(e) => {
                        tracing::warn!("identity of {user_id}: directory repair deferred: {e}")
                    }
                }
                identity
            }
            None => self.generate(user_id).await?,
        };

        let identity = Arc::new(identity);
        cache.insert(user_id.clone(), identity.clone());
        Ok(identity)
    }

    /// The identity of `user_id` if this device already has one. Never generates.
    pub async fn load_identity(&self, user_id: &UserId) -> Result<Option<Arc<Identity>>, E2eeError> {
        let mut cache = self.cache.lock().await;
        if let Some(identity) = cache.get(user_id) {
            return Ok(Some(identity.clone()));
        }
        let Some(identity) = self.load_from_storage(user_id).await? else {
            return Ok(None);
        };
        let identity = Arc::new(identity);
        cache.insert(user_id.clone(), identity.clone());
        Ok(Some(identity))
    }

    /// Published public key of any user.
    pub async fn get_public_key(
        &self,
        user_id: &UserId,
        cancel: &CancellationToken,
    ) -> Result<PublicKey, E2eeError> {
        let record = self
            .retry
            .run("user lookup", Some(cancel), || self.directory.user_record(user_id))
            .await?;

        let encoded = record
            .and_then(|r| r.public_key)
            .ok_or_else(|| E2eeError::IdentityNotFound {
                user_id: user_id.clone(),
            })?;

        PublicKey::from_base64(&encoded).map_err(|e| E2eeError::DirectoryLookup {
            user_id: user_id.clone(),
            reason: e.to_string(),
        })
    }

    /// Bring the profile in line with this device: ensure the identity, then
    /// re-publish if the directory lost the key or asks for one.
    pub async fn sync_profile(
        &self,
        user_id: &UserId,
        cancel: &CancellationToken,
    ) -> Result<Arc<Identity>, E2eeError> {
        let identity = self.ensure_identity(user_id, cancel).await?;
        if self.reconcile(&identity, cancel).await? {
            tracing::info!("re-published identity key for {user_id}");
        }
        Ok(identity)
    }

    /// Drop every cached identity (logout). Secure storage is untouched.
    pub async fn forget_local(&self) {
        self.cache.lock().await.clear();
    }

    // ── Internal ─────────────────────────────────────────────────────────

    async fn load_from_storage(&self, user_id: &UserId) -> Result<Option<Identity>, E2eeError> {
        let blob = self
            .secure
            .load(user_id)
            .await
            .map_err(|e| E2eeError::Storage(e.to_string()))?;
        blob.map(|blob| Identity::from_blob(user_id.clone(), &blob))
            .transpose()
    }

    async fn generate(&self, user_id: &UserId) -> Result<Identity, E2eeError> {
        let identity = Identity::new(user_id.clone(), PrivateKey::try_generate()?, now_ms());

        self.secure
            .store(user_id, &identity.to_blob())
            .await
            .map_err(|e| E2eeError::Storage(e.to_string()))?;

        // The local key exists from here on; the publish always runs.
        let encoded = identity.public_key.to_base64();
        self.retry
            .run("publish public key", None, || {
                self.directory.publish_public_key(user_id, &encoded)
            })
            .await?;

        tracing::info!(
            "generated identity key for {user_id} ({})",
            identity.public_key.fingerprint()
        );
        Ok(identity)
    }

    /// Re-publish when the directory disagrees with the local key.
    /// Returns whether a publish happened.
    async fn reconcile(
        &self,
        identity: &Identity,
        cancel: &CancellationToken,
    ) -> Result<bool, E2eeError> {
        let user_id = &identity.user_id;
        let record = self
            .retry
            .run("user lookup", Some(cancel), || self.directory.user_record(user_id))
            .await?
            .unwrap_or_default();

        let encoded = identity.public_key.to_base64();
        let in_sync = record.public_key.as_deref() == Some(encoded.as_str())
            && !record.needs_key_generation;
        if in_sync {
            return Ok(false);
        }
        check_cancelled(cancel)?;

        tracing::debug!(
            "directory out of sync for {user_id} (needs_key_generation={}), publishing",
            record.needs_key_generation
        );
        self.retry
            .run("publish public key", None, || {
                self.directory.publish_public_key(user_id, &encoded)
            })
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::E2eeConfig;
    use crate::store::{MemoryDocumentStore, MemorySecureStorage, StoreError, StoreOp};

    fn manager(
        directory: &MemoryDocumentStore,
        secure: &MemorySecureStorage,
    ) -> IdentityKeyManager {
        IdentityKeyManager::new(
            Arc::new(directory.clone()),
            Arc::new(secure.clone()),
            RetryPolicy::from_config(&E2eeConfig::new()),
        )
    }

    #[tokio::test]
    async fn first_use_generates_stores_and_publishes() {
        let directory = MemoryDocumentStore::new();
        let secure = MemorySecureStorage::new();
        directory.register_user("alice", true);
        let ids = manager(&directory, &secure);
        let cancel = CancellationToken::new();

        let identity = ids.ensure_identity(&"alice".into(), &cancel).await.unwrap();

        let record = directory.user(&"alice".into()).unwrap();
        assert_eq!(record.public_key, Some(identity.public_key.to_base64()));
        assert!(!record.needs_key_generation);
        assert!(secure.contains(&"alice".into()));
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let directory = MemoryDocumentStore::new();
        let secure = MemorySecureStorage::new();
        let ids = manager(&directory, &secure);
        let cancel = CancellationToken::new();

        let first = ids.ensure_identity(&"alice".into(), &cancel).await.unwrap();
        let second = ids.ensure_identity(&"alice".into(), &cancel).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(directory.calls(StoreOp::PublishPublicKey), 1);
    }

    #[tokio::test]
    async fn existing_local_key_survives_restart() {
        let directory = MemoryDocumentStore::new();
        let secure = MemorySecureStorage::new();
        let cancel = CancellationToken::new();

        let before = manager(&directory, &secure)
            .ensure_identity(&"alice".into(), &cancel)
            .await
            .unwrap();
        let after = manager(&directory, &secure)
            .ensure_identity(&"alice".into(), &cancel)
            .await
            .unwrap();

        assert_eq!(before.public_key, after.public_key);
        assert_eq!(directory.calls(StoreOp::PublishPublicKey), 1);
    }

    #[tokio::test]
    async fn failed_publish_repaired_on_next_start() {
        let directory = MemoryDocumentStore::new();
        let secure = MemorySecureStorage::new();
        let cancel = CancellationToken::new();
        directory.register_user("alice", true);
        directory.fail_always(
            StoreOp::PublishPublicKey,
            StoreError::PermissionDenied("rules".into()),
        );

        let result = manager(&directory, &secure)
            .ensure_identity(&"alice".into(), &cancel)
            .await;
        assert!(matches!(result, Err(E2eeError::PermissionDenied(_))));
        assert!(secure.contains(&"alice".into()));

        directory.clear_failures();
        let identity = manager(&directory, &secure)
            .ensure_identity(&"alice".into(), &cancel)
            .await
            .unwrap();
        let record = directory.user(&"alice".into()).unwrap();
        assert_eq!(record.public_key, Some(identity.public_key.to_base64()));
        assert!(!record.needs_key_generation);
    }

    #[tokio::test]
    async fn sync_profile_republishes_on_flag() {
        let directory = MemoryDocumentStore::new();
        let secure = MemorySecureStorage::new();
        let ids = manager(&directory, &secure);
        let cancel = CancellationToken::new();
        ids.ensure_identity(&"alice".into(), &cancel).await.unwrap();

        // The backend asks for a key again (e.g. profile restored from backup).
        directory.register_user("alice", true);
        ids.sync_profile(&"alice".into(), &cancel).await.unwrap();

        let record = directory.user(&"alice".into()).unwrap();
        assert!(record.public_key.is_some());
        assert!(!record.needs_key_generation);
        assert_eq!(directory.calls(StoreOp::PublishPublicKey), 2);
    }

    #[tokio::test]
    async fn get_public_key_errors() {
        let directory = MemoryDocumentStore::new();
        let secure = MemorySecureStorage::new();
        let ids = manager(&directory, &secure);
        let cancel = CancellationToken::new();

        directory.register_user("bob", true);
        assert!(matches!(
            ids.get_public_key(&"bob".into(), &cancel).await,
            Err(E2eeError::IdentityNotFound { .. })
        ));
        assert!(matches!(
            ids.get_public_key(&"nobody".into(), &cancel).await,
            Err(E2eeError::IdentityNotFound { .. })
        ));

        directory
            .publish_public_key(&"bob".into(), "not base64!")
            .await
            .unwrap();
        assert!(matches!(
            ids.get_public_key(&"bob".into(), &cancel).await,
            Err(E2eeError::DirectoryLookup { .. })
        ));
    }

    #[tokio::test]
    async fn load_identity_never_generates() {
        let directory = MemoryDocumentStore::new();
        let secure = MemorySecureStorage::new();
        let ids = manager(&directory, &secure);

        assert!(ids.load_identity(&"alice".into()).await.unwrap().is_none());
        assert!(!secure.contains(&"alice".into()));
    }

    #[tokio::test]
    async fn storage_failure_is_storage_error() {
        let directory = MemoryDocumentStore::new();
        let secure = MemorySecureStorage::new();
        secure.set_fail_writes(true);
        let result = manager(&directory, &secure)
            .ensure_identity(&"alice".into(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(E2eeError::Storage(_))));
        assert_eq!(directory.calls(StoreOp::PublishPublicKey), 0);
    }

    #[tokio::test]
    async fn cancelled_before_generation() {
        let directory = MemoryDocumentStore::new();
        let secure = MemorySecureStorage::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = manager(&directory, &secure)
            .ensure_identity(&"alice".into(), &cancel)
            .await;
        assert!(matches!(result, Err(E2eeError::Cancelled)));
        assert!(!secure.contains(&"alice".into()));
    }
}
