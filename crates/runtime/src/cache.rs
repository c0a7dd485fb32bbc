use std::{fmt, sync::Arc, time::Duration};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport level failure: refused connection, timeout, server error reply...
    /// Callers are expected to treat it as a miss.
    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serialization(error.to_string())
    }
}

/// A key-value store where every entry expires after the store's time-to-live.
///
/// Expired entries are treated as absent. Whether they are reclaimed eagerly or lazily is up
/// to the implementation.
#[async_trait::async_trait]
pub trait ExpiringCache: Send + Sync {
    type Value: Send + Sync + 'static;

    async fn get(&self, key: &str) -> Result<Option<Self::Value>>;
    async fn set(&self, key: &str, value: Self::Value) -> Result<()>;
    async fn clear(&self) -> Result<()>;

    /// Releases whatever the cache opened itself. Connections handed over by the caller are
    /// left untouched. Never fails, errors are only logged.
    async fn teardown(&self) {}

    /// Time-to-live applied to every `set`.
    fn ttl(&self) -> Duration;
}

/// Shared handle over the store memoizing computed query depths.
#[derive(Clone)]
pub struct DepthCache(Arc<dyn ExpiringCache<Value = usize>>);

impl DepthCache {
    pub fn new(inner: impl ExpiringCache<Value = usize> + 'static) -> Self {
        Self(Arc::new(inner))
    }
}

impl std::ops::Deref for DepthCache {
    type Target = dyn ExpiringCache<Value = usize>;
    fn deref(&self) -> &Self::Target {
        self.0.deref()
    }
}

impl fmt::Debug for DepthCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DepthCache").field("ttl", &self.ttl()).finish_non_exhaustive()
    }
}
