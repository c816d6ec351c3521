use thiserror::Error;

/// Errors reported when building a map from a [`MapConfig`](crate::MapConfig).
///
/// Once a map exists none of its operations can fail.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MapError {
    #[error("load factor must be positive and finite, got {0}")]
    InvalidLoadFactor(f32),
    #[error("concurrency level must be at least 1")]
    InvalidConcurrencyLevel,
}
