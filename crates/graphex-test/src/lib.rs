//! Helpers for testing the cache engine and batch loader.
//!
//! In every test, call [`setup`] first. This sets up the logger so that all
//! console output is captured by the test runner and only shown for failing
//! tests.

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the
///    `graphex-cache` crate and mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("graphex_cache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A graph entity as served by the backend, reduced to what the loader needs:
/// a stable identifier and some payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestEntity {
    pub id: u64,
    pub label: String,
}

/// Creates the canonical test entity for `id`.
pub fn entity(id: u64) -> TestEntity {
    TestEntity {
        id,
        label: format!("entity {id}"),
    }
}
