use std::time::{Duration, Instant};

use dashmap::DashMap;
use runtime::cache::{ExpiringCache, Result};

/// A process-local store. Every entry lives for the store's ttl, expired entries are evicted
/// lazily when read.
pub struct InMemoryCache<V> {
    ttl: Duration,
    entries: DashMap<String, CacheEntry<V>>,
    // for testing
    now: Box<dyn Fn() -> Instant + Send + Sync>,
}

struct CacheEntry<V> {
    value: V,
    /// `None` when the ttl is too large to be represented, the entry never expires.
    expires_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    fn is_alive(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(at) => now <= at,
            None => true,
        }
    }
}

impl<V> InMemoryCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
            now: Box::new(Instant::now),
        }
    }

    #[cfg(test)]
    pub fn new_with_time(ttl: Duration, now: impl Fn() -> Instant + Sync + Send + 'static) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
            now: Box::new(now),
        }
    }

    /// Number of entries held, including expired ones not read since they expired.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait::async_trait]
impl<V> ExpiringCache for InMemoryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    type Value = V;

    async fn get(&self, key: &str) -> Result<Option<V>> {
        let now = (self.now)();

        // The shard guard must be released before removing, otherwise we deadlock.
        let expired = match self.entries.get(key) {
            Some(entry) if entry.is_alive(now) => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };

        if expired {
            // Another task might have refreshed the entry in between.
            self.entries.remove_if(key, |_, entry| !entry.is_alive(now));
        }

        Ok(None)
    }

    async fn set(&self, key: &str, value: V) -> Result<()> {
        let expires_at = (self.now)().checked_add(self.ttl);

        self.entries.insert(key.to_string(), CacheEntry { value, expires_at });

        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.clear();

        Ok(())
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use runtime::cache::DepthCache;

    use super::*;

    fn manual_clock() -> (Arc<Mutex<Instant>>, impl Fn() -> Instant + Send + Sync + 'static) {
        let time = Arc::new(Mutex::new(Instant::now()));
        let clock = {
            let time = Arc::clone(&time);
            move || *time.lock().unwrap()
        };

        (time, clock)
    }

    #[tokio::test]
    async fn set_then_get() {
        let cache = InMemoryCache::new(Duration::from_secs(60));

        cache.set("a", 3_usize).await.unwrap();
        cache.set("b", 0_usize).await.unwrap();

        assert_eq!(Some(3), cache.get("a").await.unwrap());
        assert_eq!(Some(0), cache.get("b").await.unwrap());
    }

    #[tokio::test]
    async fn missing_key() {
        let cache = InMemoryCache::<usize>::new(Duration::from_secs(60));

        assert_eq!(None, cache.get("nope").await.unwrap());
    }

    #[tokio::test]
    async fn overwrite_refreshes_the_ttl() {
        let (time, clock) = manual_clock();
        let cache = InMemoryCache::new_with_time(Duration::from_secs(10), clock);

        cache.set("k", 1_usize).await.unwrap();
        *time.lock().unwrap() += Duration::from_secs(8);
        cache.set("k", 2_usize).await.unwrap();
        *time.lock().unwrap() += Duration::from_secs(8);

        assert_eq!(Some(2), cache.get("k").await.unwrap());
    }

    #[tokio::test]
    async fn entries_expire() {
        let (time, clock) = manual_clock();
        let cache = InMemoryCache::new_with_time(Duration::from_secs(10), clock);

        cache.set("k", 7_usize).await.unwrap();

        *time.lock().unwrap() += Duration::from_secs(10);
        assert_eq!(Some(7), cache.get("k").await.unwrap());

        *time.lock().unwrap() += Duration::from_millis(1);
        assert_eq!(None, cache.get("k").await.unwrap());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn expired_entries_stay_until_read() {
        let (time, clock) = manual_clock();
        let cache = InMemoryCache::new_with_time(Duration::from_secs(1), clock);

        cache.set("a", 1_usize).await.unwrap();
        cache.set("b", 2_usize).await.unwrap();
        *time.lock().unwrap() += Duration::from_secs(2);

        assert_eq!(2, cache.len());
        assert_eq!(None, cache.get("a").await.unwrap());
        assert_eq!(1, cache.len());
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let cache = InMemoryCache::new(Duration::from_secs(60));

        for (i, key) in ["a", "b", "c"].into_iter().enumerate() {
            cache.set(key, i).await.unwrap();
        }

        cache.clear().await.unwrap();

        for key in ["a", "b", "c"] {
            assert_eq!(None, cache.get(key).await.unwrap());
        }
    }

    #[tokio::test]
    async fn expires_in_real_time() {
        let cache = InMemoryCache::new(Duration::from_millis(100));

        cache.set("k", 7_usize).await.unwrap();
        assert_eq!(Some(7), cache.get("k").await.unwrap());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(None, cache.get("k").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_and_readers() {
        let cache = DepthCache::new(InMemoryCache::new(Duration::from_secs(60)));

        let tasks = (0..64)
            .map(|i| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    let key = format!("key-{}", i % 8);
                    cache.set(&key, i % 8).await.unwrap();
                    cache.get(&key).await.unwrap()
                })
            })
            .collect::<Vec<_>>();

        for (i, task) in tasks.into_iter().enumerate() {
            assert_eq!(Some(i % 8), task.await.unwrap());
        }

        assert_eq!(Duration::from_secs(60), cache.ttl());
    }
}
