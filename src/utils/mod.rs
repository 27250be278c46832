//! Utility modules.

pub mod checksum;
pub mod retry;

pub use checksum::calculate_checksum;
pub use retry::{RetryConfig, RetryResult, Retryable, retry, with_retry};
