pub mod manager;
pub mod types;

pub use manager::IdentityKeyManager;
pub use types::{Identity, KeyAlgorithm};
