use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::{PrivateKey, PublicKey};
use crate::error::E2eeError;
use crate::types::UserId;

/// Secure-storage blob layout version.
const BLOB_VERSION: u8 = 1;
/// version (1) + secret (32) + created_at (8, little-endian).
const BLOB_LEN: usize = 1 + 32 + 8;

/// Asymmetric algorithm of an identity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    X25519,
}

/// A user's identity keypair on this device.
///
/// The private half stays in this process and in secure storage.
#[derive(Debug)]
pub struct Identity {
    pub user_id: UserId,
    pub public_key: PublicKey,
    private_key: PrivateKey,
    pub algorithm: KeyAlgorithm,
    pub created_at: u64,
}

impl Identity {
    pub(crate) fn new(user_id: UserId, private_key: PrivateKey, created_at: u64) -> Self {
        Self {
            user_id,
            public_key: private_key.public_key(),
            private_key,
            algorithm: KeyAlgorithm::X25519,
            created_at,
        }
    }

    pub(crate) fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    /// Encode the private half for secure storage.
    pub(crate) fn to_blob(&self) -> Zeroizing<Vec<u8>> {
        let mut blob = Zeroizing::new(Vec::with_capacity(BLOB_LEN));
        blob.push(BLOB_VERSION);
        blob.extend_from_slice(self.private_key.to_bytes().as_slice());
        blob.extend_from_slice(&self.created_at.to_le_bytes());
        blob
    }

    /// Decode a secure-storage blob written by [`to_blob`](Self::to_blob).
    pub(crate) fn from_blob(user_id: UserId, blob: &[u8]) -> Result<Self, E2eeError> {
        if blob.len() != BLOB_LEN {
            return Err(E2eeError::Storage(format!(
                "identity blob for {user_id} has {} bytes, expected {BLOB_LEN}",
                blob.len()
            )));
        }
        if blob[0] != BLOB_VERSION {
            return Err(E2eeError::Storage(format!(
                "identity blob for {user_id} has unknown version {}",
                blob[0]
            )));
        }

        let mut secret = Zeroizing::new([0u8; 32]);
        secret.copy_from_slice(&blob[1..33]);
        let mut created_at = [0u8; 8];
        created_at.copy_from_slice(&blob[33..BLOB_LEN]);

        Ok(Self::new(
            user_id,
            PrivateKey::from_bytes(*secret),
            u64::from_le_bytes(created_at),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_roundtrip_keeps_keypair() {
        let identity = Identity::new("alice".into(), PrivateKey::generate(), 1_700_000_000_000);
        let blob = identity.to_blob();
        assert_eq!(blob.len(), BLOB_LEN);

        let restored = Identity::from_blob("alice".into(), &blob).unwrap();
        assert_eq!(restored.public_key, identity.public_key);
        assert_eq!(restored.created_at, identity.created_at);
        assert_eq!(restored.algorithm, KeyAlgorithm::X25519);
    }

    #[test]
    fn truncated_blob_rejected() {
        let identity = Identity::new("alice".into(), PrivateKey::generate(), 0);
        let blob = identity.to_blob();
        let result = Identity::from_blob("alice".into(), &blob[..20]);
        assert!(matches!(result, Err(E2eeError::Storage(_))));
    }

    #[test]
    fn unknown_version_rejected() {
        let identity = Identity::new("alice".into(), PrivateKey::generate(), 0);
        let mut blob = identity.to_blob();
        blob[0] = 9;
        let result = Identity::from_blob("alice".into(), &blob);
        assert!(matches!(result, Err(E2eeError::Storage(reason)) if reason.contains("version 9")));
    }

    #[test]
    fn debug_hides_private_key() {
        let identity = Identity::new("alice".into(), PrivateKey::generate(), 0);
        assert!(format!("{identity:?}").contains("PrivateKey(..)"));
    }
}
