/// Key material and key wrapping for groop E2EE.
///
/// Identity keys are X25519. A group key is 32 random bytes, wrapped for one
/// recipient with an ephemeral X25519 exchange + HKDF-SHA256 +
/// XChaCha20-Poly1305 (ECIES-style). The HKDF salt binds both public keys,
/// so only the recipient's current private key unwraps it.
use std::fmt;

use base64::{engine::general_purpose, Engine as _};
use chacha20poly1305::{
    aead::{
        rand_core::{OsRng, RngCore},
        Aead, KeyInit, Payload,
    },
    Key, XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519Secret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::E2eeError;
use crate::types::{Epoch, GroupId, UserId};

/// HKDF info string for domain separation.
const WRAP_INFO: &[u8] = b"groop-e2ee-key-wrap-xchacha20poly1305-v1";

/// Symmetric key length (group keys and derived wrapping keys).
pub const KEY_LEN: usize = 32;

/// XChaCha20 extended nonce length.
pub const NONCE_LEN: usize = 24;

/// Bytes of SHA-256 kept in a public key fingerprint.
const FINGERPRINT_LEN: usize = 8;

// ── GroupKey ─────────────────────────────────────────────────────────────

/// Plaintext symmetric key of one group epoch.
///
/// Never serialized. Zeroized on drop; compared in constant time.
#[derive(Clone, ZeroizeOnDrop)]
pub struct GroupKey([u8; KEY_LEN]);

impl GroupKey {
    /// Generate a fresh random group key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        let key = Self(bytes);
        bytes.zeroize();
        key
    }

    /// Like [`generate`](Self::generate), reporting RNG failure instead of panicking.
    pub fn try_generate() -> Result<Self, E2eeError> {
        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        OsRng
            .try_fill_bytes(&mut bytes[..])
            .map_err(|e| E2eeError::KeyGeneration(e.to_string()))?;
        Ok(Self(*bytes))
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl PartialEq for GroupKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for GroupKey {}

impl fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GroupKey(..)")
    }
}

// ── PublicKey ────────────────────────────────────────────────────────────

/// X25519 public identity key, as published in the user directory.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Directory encoding (`users/{uid}.publicKey`).
    pub fn to_base64(&self) -> String {
        general_purpose::STANDARD.encode(self.0)
    }

    /// Parse the directory encoding.
    pub fn from_base64(encoded: &str) -> Result<Self, E2eeError> {
        let bytes = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| E2eeError::Deserialization(format!("public key base64: {e}")))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            E2eeError::Deserialization(format!("public key must be 32 bytes, got {}", b.len()))
        })?;
        Ok(Self(bytes))
    }

    /// Short hex fingerprint, safe to log and to store next to envelopes.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        hex::encode(&digest[..FINGERPRINT_LEN])
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint())
    }
}

// ── PrivateKey ───────────────────────────────────────────────────────────

/// X25519 private identity key. Local only: not `Serialize`, zeroized on drop.
pub struct PrivateKey(X25519Secret);

impl PrivateKey {
    /// Generate a new random private key.
    pub fn generate() -> Self {
        Self(X25519Secret::random_from_rng(OsRng))
    }

    /// Like [`generate`](Self::generate), reporting RNG failure instead of panicking.
    pub fn try_generate() -> Result<Self, E2eeError> {
        let mut bytes = Zeroizing::new([0u8; 32]);
        OsRng
            .try_fill_bytes(&mut bytes[..])
            .map_err(|e| E2eeError::KeyGeneration(e.to_string()))?;
        Ok(Self::from_bytes(*bytes))
    }

    pub(crate) fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(X25519Secret::from(bytes))
    }

    /// Raw bytes for the secure-storage blob.
    pub(crate) fn to_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.0.to_bytes())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(X25519PublicKey::from(&self.0).to_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

// ── Wrapping ─────────────────────────────────────────────────────────────

/// A group key encrypted for one recipient, with the ephemeral key needed to
/// recover the wrapping key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    /// XChaCha20-Poly1305 ciphertext of the group key (includes 16-byte tag).
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    /// Wrapper's ephemeral X25519 public key.
    pub ephemeral_pk: [u8; 32],
}

/// Context bound into every wrap: a blob for (G, E, R) never unwraps as
/// another group, epoch or recipient.
pub fn wrap_associated_data(group_id: &GroupId, epoch: Epoch, recipient_id: &UserId) -> Vec<u8> {
    let mut ad = Vec::with_capacity(32 + group_id.0.len() + recipient_id.0.len());
    ad.extend_from_slice(b"groop-key-wrap");
    ad.extend_from_slice(&(group_id.0.len() as u32).to_be_bytes());
    ad.extend_from_slice(group_id.0.as_bytes());
    ad.extend_from_slice(&epoch.to_be_bytes());
    ad.extend_from_slice(&(recipient_id.0.len() as u32).to_be_bytes());
    ad.extend_from_slice(recipient_id.0.as_bytes());
    ad
}

/// Derive the wrapping key from a DH shared secret using HKDF-SHA256.
fn derive_wrapping_key(
    shared_secret: &[u8; 32],
    ephemeral_pk: &[u8; 32],
    recipient_pk: &[u8; 32],
) -> Result<Zeroizing<[u8; KEY_LEN]>, E2eeError> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral_pk);
    salt[32..].copy_from_slice(recipient_pk);

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared_secret);
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    hkdf.expand(WRAP_INFO, key.as_mut_slice())
        .map_err(|e| E2eeError::KeyWrap(format!("hkdf expand: {e}")))?;
    Ok(key)
}

/// Wrap `key` for `recipient`.
///
/// Generates an ephemeral X25519 keypair, performs DH with the recipient's
/// public key, derives a wrapping key via HKDF and encrypts with
/// XChaCha20-Poly1305 under `context`.
pub fn wrap_group_key(
    key: &GroupKey,
    recipient: &PublicKey,
    context: &[u8],
) -> Result<WrappedKey, E2eeError> {
    let recipient_x25519 = X25519PublicKey::from(recipient.0);

    let ephemeral_secret = X25519Secret::random_from_rng(OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);

    let shared_secret = ephemeral_secret.diffie_hellman(&recipient_x25519);
    if !shared_secret.was_contributory() {
        return Err(E2eeError::KeyWrap(
            "recipient public key is a low-order point".into(),
        ));
    }
    let wrapping_key = derive_wrapping_key(
        shared_secret.as_bytes(),
        ephemeral_public.as_bytes(),
        &recipient.0,
    )?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(wrapping_key.as_slice()));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from(nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: key.as_bytes(),
                aad: context,
            },
        )
        .map_err(|e| E2eeError::KeyWrap(format!("encryption failed: {e}")))?;

    Ok(WrappedKey {
        ciphertext,
        nonce: nonce_bytes,
        ephemeral_pk: ephemeral_public.to_bytes(),
    })
}

/// Recover a group key with the recipient's private key.
///
/// Fails with `Authentication` for a mismatched keypair, a different
/// `context` or any tampering.
pub fn unwrap_group_key(
    wrapped: &WrappedKey,
    recipient_secret: &PrivateKey,
    context: &[u8],
) -> Result<GroupKey, E2eeError> {
    let ephemeral_pk = X25519PublicKey::from(wrapped.ephemeral_pk);
    let recipient_pk = recipient_secret.public_key();

    let shared_secret = recipient_secret.0.diffie_hellman(&ephemeral_pk);
    if !shared_secret.was_contributory() {
        return Err(E2eeError::Authentication);
    }
    let wrapping_key = derive_wrapping_key(
        shared_secret.as_bytes(),
        &wrapped.ephemeral_pk,
        recipient_pk.as_bytes(),
    )?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(wrapping_key.as_slice()));

    let nonce = XNonce::from(wrapped.nonce);
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(
                &nonce,
                Payload {
                    msg: wrapped.ciphertext.as_ref(),
                    aad: context,
                },
            )
            .map_err(|_| E2eeError::Authentication)?,
    );

    let bytes: [u8; KEY_LEN] = plaintext.as_slice().try_into().map_err(|_| {
        E2eeError::KeyWrap(format!("unwrapped key has {} bytes", plaintext.len()))
    })?;
    Ok(GroupKey::from_bytes(bytes))
}
