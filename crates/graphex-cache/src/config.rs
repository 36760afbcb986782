use std::time::Duration;

use serde::Deserialize;

/// Tuning for a [`BatchLoader`](crate::BatchLoader).
///
/// All fields have production defaults, so partial configuration files only
/// need to name the knobs they change.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct LoaderConfig {
    /// Upper bound on identifiers per published batch.
    pub max_batch_size: usize,

    /// Entry capacity of the keyed LRU cache.
    pub capacity: usize,

    /// Upper bound on batch fetches in flight at once.
    ///
    /// Batches beyond the limit queue in publication order.
    pub max_concurrent_batches: usize,

    /// Time budget for a single batch fetch.
    ///
    /// Exceeding it fails the batch with
    /// [`CacheError::Timeout`](crate::CacheError::Timeout) for its waiters.
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Option<Duration>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 90,
            capacity: 1000,
            max_concurrent_batches: 16,
            fetch_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LoaderConfig::default();
        assert_eq!(config.max_batch_size, 90);
        assert_eq!(config.capacity, 1000);
        assert_eq!(config.max_concurrent_batches, 16);
        assert_eq!(config.fetch_timeout, None);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() -> anyhow::Result<()> {
        let yaml = r#"
            max_batch_size: 10
            fetch_timeout: 5s
        "#;
        let config: LoaderConfig = serde_yaml::from_str(yaml)?;

        assert_eq!(config.max_batch_size, 10);
        assert_eq!(config.fetch_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.capacity, 1000);
        assert_eq!(config.max_concurrent_batches, 16);

        Ok(())
    }
}
