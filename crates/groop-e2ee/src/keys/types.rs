/// Persisted key-exchange records and the encrypted message shape.
///
/// Everything here is safe to hand to the document store: plaintext group
/// keys and private keys never appear in these types.
use serde::{Deserialize, Serialize};

use crate::cipher::{Sealed, TAG_LEN};
use crate::crypto::{
    unwrap_group_key, wrap_associated_data, wrap_group_key, GroupKey, PrivateKey, PublicKey,
    WrappedKey, NONCE_LEN,
};
use crate::error::E2eeError;
use crate::types::{now_ms, Epoch, GroupId, UserId, INITIAL_EPOCH};

// ── GroupKeyEpoch ────────────────────────────────────────────────────────

/// Metadata of a group key version. The key itself is never stored remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupKeyEpoch {
    pub group_id: GroupId,
    pub epoch: Epoch,
    pub created_by: UserId,
    pub created_at: u64,
}

impl GroupKeyEpoch {
    /// Epoch 0, created at group setup.
    pub fn initial(group_id: GroupId, created_by: UserId) -> Self {
        Self {
            group_id,
            epoch: INITIAL_EPOCH,
            created_by,
            created_at: now_ms(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, E2eeError> {
        rmp_serde::to_vec_named(self).map_err(Into::into)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, E2eeError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }
}

// ── WrappedKeyEnvelope ───────────────────────────────────────────────────

/// A group key wrapped for exactly one recipient.
///
/// One per `(group_id, epoch, recipient_id)`. Written by whichever keyholder
/// admitted the recipient; only the recipient's device can open it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKeyEnvelope {
    pub group_id: GroupId,
    pub epoch: Epoch,
    pub recipient_id: UserId,
    pub encrypted_key_blob: Vec<u8>,
    pub ephemeral_public_key: [u8; 32],
    pub nonce: [u8; NONCE_LEN],
    /// Fingerprint of the recipient public key this was wrapped for.
    pub recipient_key_fingerprint: String,
    pub wrapped_by: UserId,
    pub created_at: u64,
}

impl WrappedKeyEnvelope {
    /// Wrap `key` for `recipient_id` under `recipient_pk`.
    pub fn seal_for(
        key: &GroupKey,
        group_id: &GroupId,
        epoch: Epoch,
        recipient_id: &UserId,
        recipient_pk: &PublicKey,
        wrapped_by: &UserId,
    ) -> Result<Self, E2eeError> {
        let context = wrap_associated_data(group_id, epoch, recipient_id);
        let wrapped = wrap_group_key(key, recipient_pk, &context)?;
        Ok(Self {
            group_id: group_id.clone(),
            epoch,
            recipient_id: recipient_id.clone(),
            encrypted_key_blob: wrapped.ciphertext,
            ephemeral_public_key: wrapped.ephemeral_pk,
            nonce: wrapped.nonce,
            recipient_key_fingerprint: recipient_pk.fingerprint(),
            wrapped_by: wrapped_by.clone(),
            created_at: now_ms(),
        })
    }

    /// Unwrap with the recipient's private key.
    pub fn open(&self, recipient_secret: &PrivateKey) -> Result<GroupKey, E2eeError> {
        let context = wrap_associated_data(&self.group_id, self.epoch, &self.recipient_id);
        let wrapped = WrappedKey {
            ciphertext: self.encrypted_key_blob.clone(),
            nonce: self.nonce,
            ephemeral_pk: self.ephemeral_public_key,
        };
        unwrap_group_key(&wrapped, recipient_secret, &context)
    }

    /// Whether this envelope targets `public_key` (the recipient's current key).
    pub fn is_wrapped_for(&self, public_key: &PublicKey) -> bool {
        self.recipient_key_fingerprint == public_key.fingerprint()
    }
}

// ── KeyEnvelope ──────────────────────────────────────────────────────────

/// Every kind of key envelope the store can hold.
///
/// Closed on purpose: a new kind (e.g. a rotation envelope) must be handled
/// at every match site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyEnvelope {
    Wrapped(WrappedKeyEnvelope),
}

impl KeyEnvelope {
    pub fn group_id(&self) -> &GroupId {
        match self {
            KeyEnvelope::Wrapped(w) => &w.group_id,
        }
    }

    pub fn epoch(&self) -> Epoch {
        match self {
            KeyEnvelope::Wrapped(w) => w.epoch,
        }
    }

    pub fn recipient_id(&self) -> &UserId {
        match self {
            KeyEnvelope::Wrapped(w) => &w.recipient_id,
        }
    }

    /// Serialize to MessagePack (named fields).
    pub fn to_bytes(&self) -> Result<Vec<u8>, E2eeError> {
        rmp_serde::to_vec_named(self).map_err(Into::into)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, E2eeError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }
}

// ── EncryptedMessage ─────────────────────────────────────────────────────

/// A chat message as stored. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    pub message_id: String,
    pub group_id: GroupId,
    pub sender_id: UserId,
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    pub auth_tag: [u8; TAG_LEN],
    pub epoch: Epoch,
    pub created_at: u64,
}

impl EncryptedMessage {
    pub fn new(group_id: GroupId, sender_id: UserId, epoch: Epoch, sealed: Sealed) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            group_id,
            sender_id,
            ciphertext: sealed.ciphertext,
            nonce: sealed.nonce,
            auth_tag: sealed.auth_tag,
            epoch,
            created_at: now_ms(),
        }
    }

    /// Cipher view of this message.
    pub fn sealed(&self) -> Sealed {
        Sealed {
            ciphertext: self.ciphertext.clone(),
            nonce: self.nonce,
            auth_tag: self.auth_tag,
        }
    }
}
