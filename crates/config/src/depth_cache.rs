use std::time::Duration;

#[derive(Debug, serde::Deserialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DepthCacheConfig {
    /// Without a cache the depth is computed for every request.
    pub enabled: bool,
    pub storage: DepthCacheStorage,
    /// The ttl to store computed depths with. Defaults to 60s
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub ttl: Duration,
    /// Prepended to every key sent to a remote store.
    pub key_prefix: String,
    /// Whether variable values take part in the cache key. Depth only depends on the shape of
    /// the operation, disabling this reduces the number of distinct keys.
    pub hash_variable_values: bool,
    pub redis: DepthCacheRedisConfig,
}

impl Default for DepthCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            storage: DepthCacheStorage::default(),
            ttl: Duration::from_secs(60),
            key_prefix: String::from("depth-guard::"),
            hash_variable_values: true,
            redis: DepthCacheRedisConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepthCacheStorage {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DepthCacheRedisConfig {
    /// Connection string, `redis://[:password@]host[:port][/db]`. Takes precedence over
    /// `host` and `port`.
    pub url: Option<url::Url>,
    pub host: String,
    pub port: u16,
    pub clear_scope: ClearScope,
    /// Upper bound for a single round-trip to the store.
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub timeout: Duration,
    /// Maximum number of connections opened to the store.
    pub pool_size: usize,
}

impl Default for DepthCacheRedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: String::from("localhost"),
            port: 6379,
            clear_scope: ClearScope::default(),
            timeout: Duration::from_secs(1),
            pool_size: 16,
        }
    }
}

/// What a clear removes from a remote store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearScope {
    /// Only the keys carrying our prefix.
    #[default]
    Namespace,
    /// Every key of the store, including data we did not write.
    FlushAll,
}
