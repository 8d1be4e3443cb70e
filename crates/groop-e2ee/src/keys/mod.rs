/// Group key records and the session key cache.
///
/// - **Types**: epochs, wrapped key envelopes, encrypted messages
/// - **Store**: in-memory `(group, epoch) -> key` cache
pub mod store;
pub mod types;

pub use store::GroupKeyStore;
pub use types::{EncryptedMessage, GroupKeyEpoch, KeyEnvelope, WrappedKeyEnvelope};
