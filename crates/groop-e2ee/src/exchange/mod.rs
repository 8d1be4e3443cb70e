/// Key exchange: group setup, admission of new members, key resolution.
///
/// - **Coordinator**: the only component that writes key material remotely
/// - **Retry**: timeout, backoff and cancellation around store calls
pub mod coordinator;
pub mod retry;

pub use coordinator::KeyExchangeCoordinator;
pub use retry::RetryPolicy;
