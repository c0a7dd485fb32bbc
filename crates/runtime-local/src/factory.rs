use depth_guard_config::{DepthCacheConfig, DepthCacheStorage};
use runtime::cache::DepthCache;

use crate::{InMemoryCache, RedisCache, RedisCacheOptions, RedisDescriptor};

/// Builds the configured depth cache, `None` when caching is disabled.
///
/// Remote connections are opened lazily, an unreachable store shows up on first use.
pub fn depth_cache(config: &DepthCacheConfig) -> anyhow::Result<Option<DepthCache>> {
    if !config.enabled {
        return Ok(None);
    }

    let cache = match config.storage {
        DepthCacheStorage::Memory => DepthCache::new(InMemoryCache::<usize>::new(config.ttl)),
        DepthCacheStorage::Redis => {
            let redis = &config.redis;

            let descriptor = match &redis.url {
                Some(url) => RedisDescriptor::Url(url.clone()),
                None => RedisDescriptor::Address {
                    host: redis.host.clone(),
                    port: redis.port,
                },
            };

            let options = RedisCacheOptions {
                ttl: config.ttl,
                key_prefix: config.key_prefix.clone(),
                clear_scope: redis.clear_scope,
                timeout: redis.timeout,
                pool_size: redis.pool_size,
            };

            DepthCache::new(RedisCache::<usize>::new(descriptor, options)?)
        }
    };

    Ok(Some(cache))
}
