/// OS keychain backend for the local identity key (`keyring` feature).
///
/// One entry per user, holding the base64 identity blob.
use base64::{engine::general_purpose, Engine as _};
use keyring::Entry;
use zeroize::Zeroizing;

use super::{SecureStorage, StoreError};
use crate::types::UserId;

const SERVICE_NAME: &str = "GroopE2ee";
const IDENTITY_KEY: &str = "identity";

/// OS keychain backend (Keychain, Credential Manager, Secret Service).
///
/// The keyring API is blocking, so every call runs on the blocking pool.
#[derive(Debug, Clone)]
pub struct KeyringSecureStorage {
    service: String,
}

impl KeyringSecureStorage {
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
        }
    }

    /// Use a custom keychain service name (e.g. per build flavour).
    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(service: &str, user_id: &UserId) -> Result<Entry, StoreError> {
        Entry::new(service, &format!("{IDENTITY_KEY}:{user_id}"))
            .map_err(|e| StoreError::Unavailable(format!("keyring init: {e}")))
    }
}

impl Default for KeyringSecureStorage {
    fn default() -> Self {
        Self::new()
    }
}

async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> Result<T, StoreError> + Send + 'static,
) -> Result<T, StoreError> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Unavailable(format!("keyring task: {e}")))?
}

#[async_trait::async_trait]
impl SecureStorage for KeyringSecureStorage {
    async fn load(&self, user_id: &UserId) -> Result<Option<Zeroizing<Vec<u8>>>, StoreError> {
        let service = self.service.clone();
        let user_id = user_id.clone();
        blocking(move || {
            let entry = Self::entry(&service, &user_id)?;
            let encoded = match entry.get_password() {
                Ok(encoded) => Zeroizing::new(encoded),
                Err(keyring::Error::NoEntry) => return Ok(None),
                Err(e) => return Err(StoreError::Unavailable(format!("load identity: {e}"))),
            };
            let decoded = general_purpose::STANDARD
                .decode(encoded.as_bytes())
                .map_err(|e| StoreError::Corrupt {
                    path: format!("keyring:{service}/{user_id}"),
                    reason: e.to_string(),
                })?;
            Ok(Some(Zeroizing::new(decoded)))
        })
        .await
    }

    async fn store(&self, user_id: &UserId, blob: &[u8]) -> Result<(), StoreError> {
        let service = self.service.clone();
        let user_id = user_id.clone();
        let encoded = Zeroizing::new(general_purpose::STANDARD.encode(blob));
        blocking(move || {
            Self::entry(&service, &user_id)?
                .set_password(&encoded)
                .map_err(|e| StoreError::Unavailable(format!("store identity: {e}")))
        })
        .await
    }

    async fn delete(&self, user_id: &UserId) -> Result<(), StoreError> {
        let service = self.service.clone();
        let user_id = user_id.clone();
        blocking(move || match Self::entry(&service, &user_id)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StoreError::Unavailable(format!("delete identity: {e}"))),
        })
        .await
    }
}
