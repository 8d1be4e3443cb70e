/// Errors for the groop E2EE layer.
///
/// Collaborator failures arrive as [`StoreError`] and are converted at the
/// coordinator boundary. Only `Network` is transient; `RecipientNotReady`
/// and `KeyUnavailableLocally` mean "retry later" to the caller.
use crate::store::StoreError;
use crate::types::{GroupId, UserId};

#[derive(Debug, thiserror::Error)]
pub enum E2eeError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("no published identity key for {user_id}")]
    IdentityNotFound { user_id: UserId },

    #[error("directory lookup for {user_id} failed: {reason}")]
    DirectoryLookup { user_id: UserId, reason: String },

    #[error("key wrap failed: {0}")]
    KeyWrap(String),

    #[error("no plaintext key for {group_id} on this device")]
    KeyUnavailableLocally { group_id: GroupId },

    #[error("recipient {user_id} has not generated an identity key yet")]
    RecipientNotReady { user_id: UserId },

    #[error("authentication failed")]
    Authentication,

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("encryption setup for {group_id} failed: {reason}")]
    Setup { group_id: GroupId, reason: String },

    #[error("group {group_id} has no key epoch")]
    GroupNotEncrypted { group_id: GroupId },

    #[error("network error: {0}")]
    Network(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("secure storage error: {0}")]
    Storage(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl E2eeError {
    /// Transient failure worth an automatic retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, E2eeError::Network(_))
    }

    /// Failure the caller should surface as "try again later", not as fatal.
    pub fn is_retry_later(&self) -> bool {
        matches!(
            self,
            E2eeError::Network(_)
                | E2eeError::RecipientNotReady { .. }
                | E2eeError::KeyUnavailableLocally { .. }
        )
    }
}

impl From<StoreError> for E2eeError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(reason) => E2eeError::Network(reason),
            StoreError::PermissionDenied(reason) => E2eeError::PermissionDenied(reason),
            StoreError::Corrupt { path, reason } => {
                E2eeError::Deserialization(format!("{path}: {reason}"))
            }
        }
    }
}

impl From<rmp_serde::encode::Error> for E2eeError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        E2eeError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for E2eeError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        E2eeError::Deserialization(e.to_string())
    }
}
