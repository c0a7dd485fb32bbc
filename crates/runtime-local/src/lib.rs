mod cache;
mod factory;
pub mod redis;

pub use crate::cache::InMemoryCache;
pub use crate::factory::depth_cache;
pub use crate::redis::{RedisCache, RedisCacheOptions, RedisDescriptor};
