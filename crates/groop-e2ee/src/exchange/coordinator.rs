/// KeyExchangeCoordinator: group key creation, admission of new members and
/// local key resolution.
///
/// One per device. Holds the session key cache; every remote call goes
/// through the [`RetryPolicy`]. Cancellation is checked only between steps:
/// once a write set has started (epoch + envelope + flag, or envelope +
/// rollback) it runs to completion.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use super::retry::{check_cancelled, RetryPolicy};
use crate::crypto::GroupKey;
use crate::error::E2eeError;
use crate::identity::IdentityKeyManager;
use crate::keys::{GroupKeyEpoch, GroupKeyStore, KeyEnvelope, WrappedKeyEnvelope};
use crate::store::{paths, DocumentStore};
use crate::types::{Epoch, GroupId, UserId};

pub struct KeyExchangeCoordinator {
    local_user: UserId,
    identities: Arc<IdentityKeyManager>,
    keys: Mutex<GroupKeyStore>,
    store: Arc<dyn DocumentStore>,
    retry: RetryPolicy,
}

impl KeyExchangeCoordinator {
    pub fn new(
        local_user: UserId,
        identities: Arc<IdentityKeyManager>,
        store: Arc<dyn DocumentStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            local_user,
            identities,
            keys: Mutex::new(GroupKeyStore::new()),
            store,
            retry,
        }
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn identities(&self) -> &Arc<IdentityKeyManager> {
        &self.identities
    }

    // ── Setup ────────────────────────────────────────────────────────────

    /// Create epoch 0 of `group_id` and wrap it for its creator.
    ///
    /// On an already-enabled group no key is created: the call succeeds if
    /// this device can resolve the existing key.
    pub async fn setup_groop_encryption(
        &self,
        group_id: &GroupId,
        creator_id: &UserId,
        cancel: &CancellationToken,
    ) -> Result<(), E2eeError> {
        if creator_id != &self.local_user {
            return Err(E2eeError::Setup {
                group_id: group_id.clone(),
                reason: format!("creator {creator_id} is not the local user {}", self.local_user),
            });
        }
        check_cancelled(cancel)?;

        let enabled = self
            .retry
            .run("read encryption flag", Some(cancel), || {
                self.store.encryption_enabled(group_id)
            })
            .await?;
        if enabled {
            if self.has_usable_key(group_id, cancel).await? {
                tracing::debug!("{group_id} already encrypted, key resolved");
                return Ok(());
            }
            return Err(E2eeError::Setup {
                group_id: group_id.clone(),
                reason: "encryption already enabled but this device holds no usable key".into(),
            });
        }

        let identity = self.identities.ensure_identity(creator_id, cancel).await?;
        let key = GroupKey::try_generate()?;
        let epoch = GroupKeyEpoch::initial(group_id.clone(), creator_id.clone());
        let envelope = KeyEnvelope::Wrapped(WrappedKeyEnvelope::seal_for(
            &key,
            group_id,
            epoch.epoch,
            creator_id,
            &identity.public_key,
            creator_id,
        )?);
        check_cancelled(cancel)?;

        // Write set: epoch, envelope, flag. No cancellation past this point.
        let rejected = |e: E2eeError| {
            if e.is_transient() {
                e
            } else {
                E2eeError::Setup {
                    group_id: group_id.clone(),
                    reason: format!("write rejected: {e}"),
                }
            }
        };
        self.retry
            .run("write key epoch", None, || self.store.write_epoch(&epoch))
            .await
            .map_err(rejected)?;
        self.retry
            .run("write key envelope", None, || {
                self.store.write_key_envelope(&envelope)
            })
            .await
            .map_err(rejected)?;

        if let Err(e) = self
            .retry
            .run("enable encryption", None, || {
                self.store.set_encryption_enabled(group_id, true)
            })
            .await
        {
            // The write may have landed with its acknowledgement lost. The
            // envelope goes only once the flag is known to be off.
            match self
                .retry
                .run("confirm encryption flag", None, || {
                    self.store.encryption_enabled(group_id)
                })
                .await
            {
                Ok(true) => {
                    tracing::warn!(
                        "enabling encryption on {group_id} reported {e} but the flag is set"
                    );
                }
                Ok(false) => {
                    tracing::warn!("enabling encryption on {group_id} failed ({e}), rolling back");
                    self.roll_back_envelope(group_id, epoch.epoch, creator_id).await;
                    return Err(E2eeError::Setup {
                        group_id: group_id.clone(),
                        reason: format!("could not enable encryption: {e}"),
                    });
                }
                Err(confirm) => {
                    tracing::warn!(
                        "enabling encryption on {group_id} failed ({e}), flag unknown ({confirm}), keeping the envelope"
                    );
                    return Err(E2eeError::Setup {
                        group_id: group_id.clone(),
                        reason: format!("could not enable encryption: {e}"),
                    });
                }
            }
        }

        self.keys().put(group_id.clone(), epoch.epoch, key);
        tracing::info!("encryption enabled on {group_id} (epoch {})", epoch.epoch);
        Ok(())
    }

    // ── Admission ────────────────────────────────────────────────────────

    /// Wrap the current key of `group_id` for `new_member_id`.
    ///
    /// Idempotent: an envelope already wrapped for the member's current
    /// public key is left alone. A stale one is replaced.
    pub async fn handle_new_member_joined(
        &self,
        group_id: &GroupId,
        new_member_id: &UserId,
        existing_member_ids: &[UserId],
        cancel: &CancellationToken,
    ) -> Result<(), E2eeError> {
        tracing::debug!(
            "{new_member_id} joined {group_id} ({} existing members{})",
            existing_member_ids.len(),
            if existing_member_ids.contains(new_member_id) {
                ", already listed"
            } else {
                ""
            }
        );

        let Some(epoch) = self.current_epoch(group_id, cancel).await? else {
            return Err(E2eeError::GroupNotEncrypted {
                group_id: group_id.clone(),
            });
        };

        let Some(key) = self.key_for_epoch(group_id, epoch, cancel).await? else {
            return Err(E2eeError::KeyUnavailableLocally {
                group_id: group_id.clone(),
            });
        };

        let recipient_pk = match self.identities.get_public_key(new_member_id, cancel).await {
            Ok(pk) => pk,
            Err(E2eeError::IdentityNotFound { user_id }) => {
                return Err(E2eeError::RecipientNotReady { user_id })
            }
            Err(e) => return Err(e),
        };

        let existing = self
            .retry
            .run("read key envelope", Some(cancel), || {
                self.store.key_envelope(group_id, epoch, new_member_id)
            })
            .await;
        match existing {
            Ok(Some(KeyEnvelope::Wrapped(w))) if w.is_wrapped_for(&recipient_pk) => {
                tracing::debug!("{new_member_id} already holds {group_id} epoch {epoch}");
                return Ok(());
            }
            Ok(Some(KeyEnvelope::Wrapped(w))) => tracing::info!(
                "replacing stale envelope for {new_member_id} in {group_id} ({} -> {})",
                w.recipient_key_fingerprint,
                recipient_pk.fingerprint()
            ),
            Ok(None) => {}
            Err(E2eeError::Deserialization(reason)) => {
                tracing::warn!("overwriting unreadable envelope for {new_member_id}: {reason}")
            }
            Err(e) => return Err(e),
        }

        let envelope = KeyEnvelope::Wrapped(WrappedKeyEnvelope::seal_for(
            &key,
            group_id,
            epoch,
            new_member_id,
            &recipient_pk,
            &self.local_user,
        )?);
        check_cancelled(cancel)?;

        self.retry
            .run("write key envelope", None, || {
                self.store.write_key_envelope(&envelope)
            })
            .await?;
        tracing::info!("wrapped {group_id} epoch {epoch} for {new_member_id}");
        Ok(())
    }

    // ── Resolution ───────────────────────────────────────────────────────

    /// Whether this device can encrypt for `group_id`, unwrapping its own
    /// envelope if the key is not cached yet.
    ///
    /// A missing or unopenable envelope is `false`; only store failures and
    /// cancellation are errors.
    pub async fn has_usable_key(
        &self,
        group_id: &GroupId,
        cancel: &CancellationToken,
    ) -> Result<bool, E2eeError> {
        if self.keys().contains(group_id) {
            return Ok(true);
        }
        let Some(epoch) = self.current_epoch(group_id, cancel).await? else {
            return Ok(false);
        };
        Ok(self.key_for_epoch(group_id, epoch, cancel).await?.is_some())
    }

    /// Current epoch of an encrypted group; `None` if encryption is off.
    pub async fn current_epoch(
        &self,
        group_id: &GroupId,
        cancel: &CancellationToken,
    ) -> Result<Option<Epoch>, E2eeError> {
        let enabled = self
            .retry
            .run("read encryption flag", Some(cancel), || {
                self.store.encryption_enabled(group_id)
            })
            .await?;
        if !enabled {
            return Ok(None);
        }
        check_cancelled(cancel)?;

        let record = self
            .retry
            .run("read key epoch", Some(cancel), || {
                self.store.current_epoch(group_id)
            })
            .await?;
        Ok(record.map(|r| r.epoch))
    }

    /// Key of one epoch: from the cache, else by unwrapping the local user's
    /// envelope. `None` if there is no envelope or it does not open.
    pub async fn key_for_epoch(
        &self,
        group_id: &GroupId,
        epoch: Epoch,
        cancel: &CancellationToken,
    ) -> Result<Option<GroupKey>, E2eeError> {
        if let Some(key) = self.keys().get_epoch(group_id, epoch) {
            return Ok(Some(key));
        }

        let Some(identity) = self.identities.load_identity(&self.local_user).await? else {
            tracing::debug!("no local identity for {}, cannot unwrap", self.local_user);
            return Ok(None);
        };
        check_cancelled(cancel)?;

        let envelope = match self
            .retry
            .run("read key envelope", Some(cancel), || {
                self.store.key_envelope(group_id, epoch, &self.local_user)
            })
            .await
        {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return Ok(None),
            Err(E2eeError::Deserialization(reason)) => {
                tracing::warn!("unreadable envelope in {group_id}: {reason}");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let key = match envelope {
            KeyEnvelope::Wrapped(wrapped) => match wrapped.open(identity.private_key()) {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!(
                        "{} does not open with the local key ({e})",
                        paths::envelope(group_id, epoch, &self.local_user)
                    );
                    return Ok(None);
                }
            },
        };

        self.keys().put(group_id.clone(), epoch, key.clone());
        tracing::debug!("unwrapped {group_id} epoch {epoch}");
        Ok(Some(key))
    }

    /// Latest cached key of a group. No I/O.
    pub fn current_key(&self, group_id: &GroupId) -> Option<(Epoch, GroupKey)> {
        self.keys().get(group_id)
    }

    /// Forget the keys of a group (leave).
    pub fn evict_group(&self, group_id: &GroupId) -> bool {
        self.keys().evict(group_id)
    }

    /// Forget every key (logout).
    pub fn clear_keys(&self) {
        self.keys().clear();
    }

    async fn roll_back_envelope(&self, group_id: &GroupId, epoch: Epoch, recipient_id: &UserId) {
        if let Err(e) = self
            .retry
            .run("roll back key envelope", None, || {
                self.store.delete_key_envelope(group_id, epoch, recipient_id)
            })
            .await
        {
            tracing::error!(
                "rollback of {} failed: {e}",
                paths::envelope(group_id, epoch, recipient_id)
            );
        }
    }

    fn keys(&self) -> MutexGuard<'_, GroupKeyStore> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
