//! Umbrella error taxonomy for fetch operations.
//!
//! Each module defines its own error enum; `FetchError` is what reaches the
//! caller of a fetch when a task fails. Failures are always reported to the
//! immediate caller and never unwind past a task boundary - one task failing
//! does not corrupt sibling tasks sharing a cache entry.

use thiserror::Error;

use crate::auth::AuthError;
use crate::cache::CacheError;
use crate::transport::NetworkError;
use crate::uri::UriError;

/// Final error attached to a task that reaches the `Failed` state.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Cache-side failure (allocation, registry misuse).
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Malformed header or challenge text.
    #[error("parse error: {0}")]
    Parse(String),

    /// Transport-reported failure (reset, timeout, refused).
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// Authentication failure, kept distinct from network failures so the
    /// caller can re-prompt instead of retrying blindly.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Malformed resource identifier.
    #[error(transparent)]
    Uri(#[from] UriError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_error_converts() {
        let err: FetchError = CacheError::AllocationFailure.into();
        assert!(matches!(err, FetchError::Cache(_)));
    }

    #[test]
    fn test_auth_error_stays_distinct() {
        let err: FetchError = AuthError::MissingCredentials.into();
        assert!(matches!(err, FetchError::Auth(AuthError::MissingCredentials)));
    }
}
