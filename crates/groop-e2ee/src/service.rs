/// Session object and the two service facades the chat layer consumes.
///
/// `E2eeSession::start` wires identity, coordinator and state machine for
/// one signed-in user; `shutdown` tears them down. `EncryptionService` and
/// `KeyExchangeService` are cheap handles into the same session.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::cipher::{self, message_associated_data};
use crate::config::E2eeConfig;
use crate::crypto::GroupKey;
use crate::error::E2eeError;
use crate::exchange::{KeyExchangeCoordinator, RetryPolicy};
use crate::identity::IdentityKeyManager;
use crate::keys::EncryptedMessage;
use crate::state::{
    EncryptionState, EncryptionStateMachine, InboundMessage, MemberKeyAvailability, StateChange,
    LOCKED_PLACEHOLDER,
};
use crate::store::{DocumentStore, SecureStorage};
use crate::types::{Epoch, GroupId, UserId};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct SessionInner {
    config: E2eeConfig,
    local_user: UserId,
    coordinator: Arc<KeyExchangeCoordinator>,
    states: Mutex<EncryptionStateMachine>,
    changes: broadcast::Sender<StateChange>,
    /// Parent of every per-group token; cancelled on shutdown.
    cancel: CancellationToken,
    group_tokens: Mutex<HashMap<GroupId, CancellationToken>>,
}

/// E2EE for one signed-in user on this device.
///
/// Clone freely: all clones share the same key cache and state.
#[derive(Clone)]
pub struct E2eeSession {
    inner: Arc<SessionInner>,
}

impl E2eeSession {
    /// Build the session and make sure the local identity exists and is
    /// published. An offline start is tolerated when the key is already
    /// on this device.
    pub async fn start(
        config: E2eeConfig,
        local_user: impl Into<UserId>,
        store: Arc<dyn DocumentStore>,
        secure: Arc<dyn SecureStorage>,
    ) -> Result<Self, E2eeError> {
        let local_user = local_user.into();
        let retry = RetryPolicy::from_config(&config);
        let identities = Arc::new(IdentityKeyManager::new(store.clone(), secure, retry.clone()));
        let cancel = CancellationToken::new();

        match identities.sync_profile(&local_user, &cancel).await {
            Ok(identity) => tracing::info!(
                "e2ee session for {local_user} ({})",
                identity.public_key.fingerprint()
            ),
            Err(e) if e.is_transient() => {
                tracing::warn!("e2ee session for {local_user} started offline: {e}")
            }
            Err(e) => return Err(e),
        }

        let coordinator = Arc::new(KeyExchangeCoordinator::new(
            local_user.clone(),
            identities,
            store,
            retry,
        ));
        let (changes, _) = broadcast::channel(config.state_channel_capacity);

        Ok(Self {
            inner: Arc::new(SessionInner {
                config,
                local_user,
                coordinator,
                states: Mutex::new(EncryptionStateMachine::new()),
                changes,
                cancel,
                group_tokens: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn encryption(&self) -> EncryptionService {
        EncryptionService {
            session: self.clone(),
        }
    }

    pub fn key_exchange(&self) -> KeyExchangeService {
        KeyExchangeService {
            session: self.clone(),
        }
    }

    pub fn local_user(&self) -> &UserId {
        &self.inner.local_user
    }

    pub fn coordinator(&self) -> &Arc<KeyExchangeCoordinator> {
        &self.inner.coordinator
    }

    pub fn config(&self) -> &E2eeConfig {
        &self.inner.config
    }

    // ── State ────────────────────────────────────────────────────────────

    pub fn state(&self, group_id: &GroupId) -> EncryptionState {
        lock(&self.inner.states).state(group_id)
    }

    pub fn availability(&self, group_id: &GroupId) -> MemberKeyAvailability {
        lock(&self.inner.states).availability(group_id)
    }

    pub fn can_send(&self, group_id: &GroupId) -> bool {
        lock(&self.inner.states).can_send(group_id)
    }

    pub fn can_retry(&self, group_id: &GroupId) -> bool {
        lock(&self.inner.states).can_retry(group_id)
    }

    /// Every state transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.inner.changes.subscribe()
    }

    /// Resolve the key of `group_id` and update its state.
    pub async fn refresh(&self, group_id: &GroupId) -> Result<bool, E2eeError> {
        let change = lock(&self.inner.states).begin(group_id);
        self.publish(change);
        self.resolve(group_id).await
    }

    /// Explicit user retry after Unavailable or Failed.
    pub async fn retry(&self, group_id: &GroupId) -> Result<bool, E2eeError> {
        let change = lock(&self.inner.states).retry(group_id);
        self.publish(change);
        self.resolve(group_id).await
    }

    /// Navigation away: cancel in-flight lookups, forget the derived state.
    /// Cached keys stay.
    pub fn close_group(&self, group_id: &GroupId) {
        if let Some(token) = lock(&self.inner.group_tokens).remove(group_id) {
            token.cancel();
        }
        let change = lock(&self.inner.states).reset(group_id);
        self.publish(change);
    }

    /// Group leave: like [`close_group`](Self::close_group), and evict keys.
    pub fn leave_group(&self, group_id: &GroupId) {
        self.close_group(group_id);
        if self.inner.coordinator.evict_group(group_id) {
            tracing::debug!("evicted keys of {group_id}");
        }
    }

    /// Logout: cancel everything, wipe cached keys and identity.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        lock(&self.inner.group_tokens).clear();
        self.inner.coordinator.clear_keys();
        self.inner.coordinator.identities().forget_local().await;

        let changes = lock(&self.inner.states).clear();
        for change in changes {
            self.publish(Some(change));
        }
        tracing::info!("e2ee session for {} shut down", self.inner.local_user);
    }

    // ── Internal ─────────────────────────────────────────────────────────

    async fn resolve(&self, group_id: &GroupId) -> Result<bool, E2eeError> {
        let token = self.group_token(group_id);
        let outcome = self.inner.coordinator.has_usable_key(group_id, &token).await;
        let change = lock(&self.inner.states).apply_outcome(group_id, &outcome);
        self.publish(change);
        outcome
    }

    fn mark_available(&self, group_id: &GroupId) {
        let change = lock(&self.inner.states).confirm_key(group_id);
        self.publish(change);
    }

    /// Per-group child of the session token; replaced once cancelled.
    fn group_token(&self, group_id: &GroupId) -> CancellationToken {
        let mut tokens = lock(&self.inner.group_tokens);
        if let Some(token) = tokens.get(group_id) {
            if !token.is_cancelled() {
                return token.clone();
            }
        }
        let token = self.inner.cancel.child_token();
        tokens.insert(group_id.clone(), token.clone());
        token
    }

    fn publish(&self, change: Option<StateChange>) {
        let Some(change) = change else {
            return;
        };
        tracing::debug!("{}: {} -> {}", change.group_id, change.from, change.to);
        // Err only means nobody is subscribed.
        let _ = self.inner.changes.send(change);
    }
}

// ── EncryptionService ────────────────────────────────────────────────────

/// Outcome of decrypting one message. On failure `text` is the locked
/// placeholder, never ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptResult {
    pub text: String,
    pub success: bool,
}

impl DecryptResult {
    fn locked() -> Self {
        Self {
            text: LOCKED_PLACEHOLDER.to_string(),
            success: false,
        }
    }
}

#[derive(Clone)]
pub struct EncryptionService {
    session: E2eeSession,
}

impl EncryptionService {
    /// Whether this device holds (or can unwrap) the key of `group_id`.
    pub async fn has_groop_key(&self, group_id: &GroupId) -> Result<bool, E2eeError> {
        self.session.refresh(group_id).await
    }

    /// Encrypt a chat message. Without a key this fails; there is no
    /// plaintext fallback.
    pub async fn encrypt(
        &self,
        group_id: &GroupId,
        plaintext: &str,
    ) -> Result<EncryptedMessage, E2eeError> {
        let coordinator = self.session.coordinator();
        let (epoch, key) = match coordinator.current_key(group_id) {
            Some(cached) => cached,
            None => {
                self.session.refresh(group_id).await?;
                coordinator
                    .current_key(group_id)
                    .ok_or_else(|| E2eeError::KeyUnavailableLocally {
                        group_id: group_id.clone(),
                    })?
            }
        };

        let sealed = cipher::seal(
            &key,
            plaintext.as_bytes(),
            &message_associated_data(group_id, epoch),
        )?;
        Ok(EncryptedMessage::new(
            group_id.clone(),
            self.session.local_user().clone(),
            epoch,
            sealed,
        ))
    }

    /// Decrypt one message. Never fails: anything short of a verified
    /// plaintext is `success = false`.
    pub async fn decrypt(&self, group_id: &GroupId, message: &EncryptedMessage) -> DecryptResult {
        let token = self.session.group_token(group_id);
        let key = match self
            .session
            .coordinator()
            .key_for_epoch(group_id, message.epoch, &token)
            .await
        {
            Ok(Some(key)) => key,
            Ok(None) => {
                tracing::debug!("no key for {group_id} epoch {}", message.epoch);
                return DecryptResult::locked();
            }
            Err(e) => {
                tracing::debug!("key lookup for {group_id} failed: {e}");
                return DecryptResult::locked();
            }
        };

        match open_message(&key, group_id, message) {
            Ok(text) => DecryptResult {
                text,
                success: true,
            },
            Err(e) => {
                tracing::debug!("message {} stays locked: {e}", message.message_id);
                DecryptResult::locked()
            }
        }
    }

    /// Decrypt a page of history in batches, yielding between batches.
    ///
    /// Keys are resolved once per epoch. If the group is closed midway, the
    /// remaining messages stay pending (`is_decrypted == None`).
    pub async fn decrypt_history(
        &self,
        group_id: &GroupId,
        messages: &[EncryptedMessage],
    ) -> Vec<InboundMessage> {
        let token = self.session.group_token(group_id);
        let batch_size = self.session.config().history_batch_size;
        let coordinator = self.session.coordinator();

        let mut keys: HashMap<Epoch, Option<GroupKey>> = HashMap::new();
        let mut out = Vec::with_capacity(messages.len());

        for (i, batch) in messages.chunks(batch_size).enumerate() {
            if i > 0 {
                tokio::task::yield_now().await;
            }
            for message in batch {
                let pending = InboundMessage::pending(message);
                if token.is_cancelled() {
                    out.push(pending);
                    continue;
                }

                if !keys.contains_key(&message.epoch) {
                    match coordinator
                        .key_for_epoch(group_id, message.epoch, &token)
                        .await
                    {
                        Ok(key) => {
                            keys.insert(message.epoch, key);
                        }
                        Err(E2eeError::Cancelled) => {
                            out.push(pending);
                            continue;
                        }
                        Err(e) => {
                            tracing::debug!("key lookup for {group_id} failed: {e}");
                            keys.insert(message.epoch, None);
                        }
                    }
                }

                let opened = match keys.get(&message.epoch) {
                    Some(Some(key)) => open_message(key, group_id, message).ok(),
                    _ => None,
                };
                out.push(match opened {
                    Some(text) => pending.decrypted(text),
                    None => pending.locked(),
                });
            }
        }

        let locked = out.iter().filter(|m| m.is_decrypted == Some(false)).count();
        if locked > 0 {
            tracing::debug!("{group_id}: {locked}/{} history messages locked", out.len());
        }
        out
    }
}

fn open_message(
    key: &GroupKey,
    group_id: &GroupId,
    message: &EncryptedMessage,
) -> Result<String, E2eeError> {
    if &message.group_id != group_id {
        return Err(E2eeError::Authentication);
    }
    let plaintext = cipher::open(
        key,
        &message.sealed(),
        &message_associated_data(group_id, message.epoch),
    )?;
    String::from_utf8(plaintext.to_vec())
        .map_err(|e| E2eeError::Deserialization(format!("message text: {e}")))
}

// ── KeyExchangeService ───────────────────────────────────────────────────

#[derive(Clone)]
pub struct KeyExchangeService {
    session: E2eeSession,
}

impl KeyExchangeService {
    /// Enable encryption on a new group, keyed for its creator.
    pub async fn setup_groop_encryption(
        &self,
        group_id: &GroupId,
        creator_id: &UserId,
    ) -> Result<(), E2eeError> {
        let token = self.session.group_token(group_id);
        self.session
            .coordinator()
            .setup_groop_encryption(group_id, creator_id, &token)
            .await?;
        self.session.mark_available(group_id);
        Ok(())
    }

    /// Admit a member who just joined, run on a keyed member's device.
    pub async fn handle_new_member_joined(
        &self,
        group_id: &GroupId,
        new_member_id: &UserId,
        existing_member_ids: &[UserId],
    ) -> Result<(), E2eeError> {
        let token = self.session.group_token(group_id);
        self.session
            .coordinator()
            .handle_new_member_joined(group_id, new_member_id, existing_member_ids, &token)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryDocumentStore, MemorySecureStorage, StoreError, StoreOp};

    async fn session(user: &str, store: &MemoryDocumentStore) -> E2eeSession {
        E2eeSession::start(
            E2eeConfig::new(),
            user,
            Arc::new(store.clone()),
            Arc::new(MemorySecureStorage::new()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn start_publishes_identity() {
        let store = MemoryDocumentStore::new();
        store.register_user("alice", true);
        session("alice", &store).await;

        let record = store.user(&"alice".into()).unwrap();
        assert!(record.public_key.is_some());
        assert!(!record.needs_key_generation);
    }

    #[tokio::test]
    async fn encrypt_decrypt_roundtrip() {
        let store = MemoryDocumentStore::new();
        let alice = session("alice", &store).await;
        let group = GroupId::from("G1");

        alice
            .key_exchange()
            .setup_groop_encryption(&group, &"alice".into())
            .await
            .unwrap();
        assert!(alice.can_send(&group));

        let message = alice.encryption().encrypt(&group, "hello").await.unwrap();
        assert_eq!(message.sender_id, UserId::from("alice"));
        assert_ne!(message.ciphertext, b"hello".to_vec());

        let result = alice.encryption().decrypt(&group, &message).await;
        assert!(result.success);
        assert_eq!(result.text, "hello");
    }

    #[tokio::test]
    async fn encrypt_without_key_fails() {
        let store = MemoryDocumentStore::new();
        let alice = session("alice", &store).await;
        let result = alice.encryption().encrypt(&"G1".into(), "hello").await;
        assert!(matches!(result, Err(E2eeError::KeyUnavailableLocally { .. })));
    }

    #[tokio::test]
    async fn message_moved_to_other_group_stays_locked() {
        let store = MemoryDocumentStore::new();
        let alice = session("alice", &store).await;
        let g1 = GroupId::from("G1");
        let g2 = GroupId::from("G2");
        for g in [&g1, &g2] {
            alice
                .key_exchange()
                .setup_groop_encryption(g, &"alice".into())
                .await
                .unwrap();
        }

        let mut message = alice.encryption().encrypt(&g1, "secret").await.unwrap();
        message.group_id = g2.clone();
        let result = alice.encryption().decrypt(&g2, &message).await;
        assert!(!result.success);
        assert_eq!(result.text, LOCKED_PLACEHOLDER);
    }

    #[tokio::test]
    async fn state_changes_are_broadcast() {
        let store = MemoryDocumentStore::new();
        let alice = session("alice", &store).await;
        let mut changes = alice.subscribe();
        let group = GroupId::from("G1");

        alice
            .key_exchange()
            .setup_groop_encryption(&group, &"alice".into())
            .await
            .unwrap();

        let change = changes.recv().await.unwrap();
        assert_eq!(change.from, EncryptionState::Uninitialized);
        assert_eq!(change.to, EncryptionState::Available);

        alice.leave_group(&group);
        assert_eq!(changes.recv().await.unwrap().to, EncryptionState::Uninitialized);
        alice.encryption().has_groop_key(&group).await.unwrap();
        assert_eq!(changes.recv().await.unwrap().to, EncryptionState::Pending);
        assert_eq!(changes.recv().await.unwrap().to, EncryptionState::Available);
    }

    #[tokio::test]
    async fn setup_recovers_failed_group() {
        let store = MemoryDocumentStore::new();
        let alice = session("alice", &store).await;
        let group = GroupId::from("G1");
        store.fail_always(
            StoreOp::EncryptionEnabled,
            StoreError::PermissionDenied("rules".into()),
        );
        assert!(alice.encryption().has_groop_key(&group).await.is_err());
        assert!(matches!(alice.state(&group), EncryptionState::Failed { .. }));

        store.clear_failures();
        alice
            .key_exchange()
            .setup_groop_encryption(&group, &"alice".into())
            .await
            .unwrap();
        assert_eq!(alice.state(&group), EncryptionState::Available);
        assert!(alice.can_send(&group));
    }

    #[tokio::test]
    async fn shutdown_wipes_keys_and_state() {
        let store = MemoryDocumentStore::new();
        let alice = session("alice", &store).await;
        let group = GroupId::from("G1");
        alice
            .key_exchange()
            .setup_groop_encryption(&group, &"alice".into())
            .await
            .unwrap();

        alice.shutdown().await;

        assert!(alice.coordinator().current_key(&group).is_none());
        assert_eq!(alice.state(&group), EncryptionState::Uninitialized);
        assert!(matches!(
            alice.refresh(&group).await,
            Err(E2eeError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn leave_group_evicts_key() {
        let store = MemoryDocumentStore::new();
        let alice = session("alice", &store).await;
        let group = GroupId::from("G1");
        alice
            .key_exchange()
            .setup_groop_encryption(&group, &"alice".into())
            .await
            .unwrap();

        alice.leave_group(&group);
        assert!(alice.coordinator().current_key(&group).is_none());
        assert_eq!(alice.state(&group), EncryptionState::Uninitialized);

        // Still a member in the store: the key resolves again on re-entry.
        assert!(alice.encryption().has_groop_key(&group).await.unwrap());
        assert!(alice.can_send(&group));
    }
}
