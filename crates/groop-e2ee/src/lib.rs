//! Groop end-to-end encryption key management.
//!
//! Identity keys, per-group symmetric keys wrapped for each member, and the
//! availability state the chat UI renders. The remote document store and
//! the platform secure storage are reached through traits.
//!
//! Wire format: MessagePack (compact binary).
//! Crypto: X25519 key agreement + HKDF-SHA256 + XChaCha20-Poly1305.

pub mod cipher;
pub mod config;
pub mod crypto;
pub mod error;
pub mod exchange;
pub mod identity;
pub mod keys;
pub mod service;
pub mod state;
pub mod store;
pub mod types;

pub use cipher::{message_associated_data, Sealed};
pub use config::E2eeConfig;
pub use crypto::{GroupKey, PrivateKey, PublicKey};
pub use error::E2eeError;
pub use exchange::{KeyExchangeCoordinator, RetryPolicy};
pub use identity::{Identity, IdentityKeyManager, KeyAlgorithm};
pub use keys::{EncryptedMessage, GroupKeyEpoch, GroupKeyStore, KeyEnvelope, WrappedKeyEnvelope};
pub use service::{DecryptResult, E2eeSession, EncryptionService, KeyExchangeService};
pub use state::{
    EncryptionState, EncryptionStateMachine, InboundMessage, MemberKeyAvailability, StateChange,
    LOCKED_PLACEHOLDER,
};
pub use store::{
    DocumentStore, MemoryDocumentStore, MemorySecureStorage, SecureStorage, StoreError, StoreOp,
    UserKeyRecord,
};
pub use types::{now_ms, Epoch, GroupId, UserId, INITIAL_EPOCH};
