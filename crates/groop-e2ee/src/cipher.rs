//! Message cipher: XChaCha20-Poly1305 with a detached tag.
//!
//! Pure and synchronous. Every `seal` draws a fresh random 24-byte nonce.
//! Associated data binds the group and epoch, so a ciphertext replayed into
//! another group or epoch fails to open.

use chacha20poly1305::{
    aead::{
        rand_core::{OsRng, RngCore},
        AeadInPlace, KeyInit,
    },
    Key, Tag, XChaCha20Poly1305, XNonce,
};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::{GroupKey, NONCE_LEN};
use crate::error::E2eeError;
use crate::types::{Epoch, GroupId};

/// Poly1305 tag length.
pub const TAG_LEN: usize = 16;

/// Output of [`seal`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    pub auth_tag: [u8; TAG_LEN],
}

/// Associated data for a chat message of `group_id` at `epoch`.
pub fn message_associated_data(group_id: &GroupId, epoch: Epoch) -> Vec<u8> {
    let mut ad = Vec::with_capacity(24 + group_id.0.len());
    ad.extend_from_slice(b"groop-msg-v1");
    ad.extend_from_slice(&(group_id.0.len() as u32).to_be_bytes());
    ad.extend_from_slice(group_id.0.as_bytes());
    ad.extend_from_slice(&epoch.to_be_bytes());
    ad
}

/// Encrypt `plaintext` under `key`.
pub fn seal(key: &GroupKey, plaintext: &[u8], associated_data: &[u8]) -> Result<Sealed, E2eeError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from(nonce_bytes);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(&nonce, associated_data, &mut buffer)
        .map_err(|e| E2eeError::Encryption(e.to_string()))?;

    let mut auth_tag = [0u8; TAG_LEN];
    auth_tag.copy_from_slice(&tag);

    Ok(Sealed {
        ciphertext: buffer,
        nonce: nonce_bytes,
        auth_tag,
    })
}

/// Decrypt and verify `sealed`.
///
/// A wrong key, wrong associated data and tampering are indistinguishable:
/// all fail with `Authentication`.
pub fn open(
    key: &GroupKey,
    sealed: &Sealed,
    associated_data: &[u8],
) -> Result<Zeroizing<Vec<u8>>, E2eeError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let nonce = XNonce::from(sealed.nonce);
    let tag = Tag::from_slice(&sealed.auth_tag);

    let mut buffer = Zeroizing::new(sealed.ciphertext.clone());
    cipher
        .decrypt_in_place_detached(&nonce, associated_data, buffer.as_mut_slice(), tag)
        .map_err(|_| E2eeError::Authentication)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ad() -> Vec<u8> {
        message_associated_data(&"G1".into(), 0)
    }

    #[test]
    fn seal_open_roundtrip() {
        let key = GroupKey::generate();
        let sealed = seal(&key, b"meet at the station at 9", &ad()).unwrap();
        let opened = open(&key, &sealed, &ad()).unwrap();
        assert_eq!(opened.as_slice(), b"meet at the station at 9");
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let key = GroupKey::generate();
        let sealed = seal(&key, b"", &ad()).unwrap();
        assert!(sealed.ciphertext.is_empty());
        assert!(open(&key, &sealed, &ad()).unwrap().is_empty());
    }

    #[test]
    fn ciphertext_has_no_overhead_with_detached_tag() {
        let key = GroupKey::generate();
        let sealed = seal(&key, b"twelve bytes", &ad()).unwrap();
        assert_eq!(sealed.ciphertext.len(), 12);
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = seal(&GroupKey::generate(), b"secret", &ad()).unwrap();
        let result = open(&GroupKey::generate(), &sealed, &ad());
        assert!(matches!(result, Err(E2eeError::Authentication)));
    }

    #[test]
    fn replay_into_other_group_fails() {
        let key = GroupKey::generate();
        let sealed = seal(&key, b"secret", &ad()).unwrap();
        let other = message_associated_data(&"G2".into(), 0);
        assert!(open(&key, &sealed, &other).is_err());
    }

    #[test]
    fn replay_into_other_epoch_fails() {
        let key = GroupKey::generate();
        let sealed = seal(&key, b"secret", &ad()).unwrap();
        let other = message_associated_data(&"G1".into(), 1);
        assert!(open(&key, &sealed, &other).is_err());
    }

    #[test]
    fn tampered_tag_fails() {
        let key = GroupKey::generate();
        let mut sealed = seal(&key, b"secret", &ad()).unwrap();
        sealed.auth_tag[15] ^= 0x80;
        assert!(matches!(
            open(&key, &sealed, &ad()),
            Err(E2eeError::Authentication)
        ));
    }

    #[test]
    fn nonces_are_fresh() {
        let key = GroupKey::generate();
        let a = seal(&key, b"same", &ad()).unwrap();
        let b = seal(&key, b"same", &ad()).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn associated_data_is_length_prefixed() {
        // "G1" + epoch 0x31 must not collide with "G11" + epoch 0.
        let a = message_associated_data(&"G1".into(), 0x3100_0000);
        let b = message_associated_data(&"G11".into(), 0);
        assert_ne!(a, b);
    }
}
