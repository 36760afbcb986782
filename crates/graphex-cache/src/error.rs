use std::time::Duration;

use thiserror::Error;

/// An error that happens while loading entities through the cache engine.
///
/// Errors are broadcast to every waiter that depends on the failed work, so
/// the enum is cheap to clone and carries owned detail strings rather than
/// source errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The backend answered the batch but did not return an entity for a
    /// requested identifier.
    #[error("not found")]
    NotFound,
    /// The fetch collaborator failed for a batch.
    ///
    /// The attached string contains the collaborator's error message.
    #[error("fetch failed: {0}")]
    Fetch(String),
    /// A batch fetch did not complete within the configured time budget.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    /// The caller's cancellation token fired while its result was pending.
    #[error("canceled")]
    Canceled,
    /// The cache was dropped while the result was pending.
    #[error("cache closed")]
    Closed,
}

/// The result of a cache or loader operation.
pub type CacheResult<T = ()> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            CacheError::Fetch("connection reset".into()).to_string(),
            "fetch failed: connection reset"
        );
        assert_eq!(CacheError::NotFound.to_string(), "not found");
    }
}
