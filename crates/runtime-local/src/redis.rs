mod pool;
#[cfg(test)]
mod test_server;
pub mod wire;

use std::{fmt, future::Future, marker::PhantomData, time::Duration};

use ::redis::{aio::MultiplexedConnection, cluster_async::ClusterConnection, Script};
use deadpool::managed::Pool;
use depth_guard_config::ClearScope;
use runtime::{
    cache::{Error, ExpiringCache, Result},
    DEPTH_GUARD_TARGET,
};
use serde::{de::DeserializeOwned, Serialize};

pub use pool::{Manager, WireEndpoint};
use wire::Reply;

pub type WirePool = Pool<Manager>;

/// Deletes every key matching `ARGV[1]`, one SCAN page at a time. `KEYS[1]` only routes the
/// script to the node owning the namespace. Only used with cluster clients, the script blocks
/// its node until the scan is over.
const CLEAR_NAMESPACE_SCRIPT: &str = r"
local cursor = '0'
local deleted = 0
repeat
  local page = redis.call('SCAN', cursor, 'MATCH', ARGV[1], 'COUNT', 500)
  cursor = page[1]
  for _, key in ipairs(page[2]) do
    deleted = deleted + redis.call('DEL', key)
  end
until cursor == '0'
return deleted
";

const SCAN_PAGE_SIZE: &[u8] = b"500";

/// How the cache reaches its store. The cache owns the connections it opens from a url or an
/// address, and never closes the clients it is handed.
pub enum RedisDescriptor {
    Url(url::Url),
    Address { host: String, port: u16 },
    Client(MultiplexedConnection),
    ClusterClient(ClusterConnection),
}

impl fmt::Debug for RedisDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => f.debug_tuple("Url").field(&url.as_str()).finish(),
            Self::Address { host, port } => f.debug_struct("Address").field("host", host).field("port", port).finish(),
            Self::Client(_) => f.write_str("Client"),
            Self::ClusterClient(_) => f.write_str("ClusterClient"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedisCacheOptions {
    pub ttl: Duration,
    pub key_prefix: String,
    pub clear_scope: ClearScope,
    /// Bound of a single cache operation, connection checkout included.
    pub timeout: Duration,
    /// Maximum number of owned connections.
    pub pool_size: usize,
}

impl Default for RedisCacheOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            key_prefix: String::from("depth-guard::"),
            clear_scope: ClearScope::default(),
            timeout: Duration::from_secs(1),
            pool_size: 16,
        }
    }
}

enum Connection {
    /// Pooled wire connections we opened ourselves.
    Owned(WirePool),
    Shared(MultiplexedConnection),
    Cluster(ClusterConnection),
}

/// An expiring cache stored in Redis.
///
/// Values are stored as JSON, expiring through `PX`. A single wire connection only carries
/// one command at a time, so owned connections are pooled; driver clients multiplex on their
/// own and are cloned per operation.
pub struct RedisCache<V> {
    connection: Connection,
    key_prefix: String,
    ttl: Duration,
    clear_scope: ClearScope,
    timeout: Duration,
    _value: PhantomData<fn() -> V>,
}

impl<V> RedisCache<V> {
    /// Owned connections are opened lazily, on first use.
    pub fn new(descriptor: RedisDescriptor, options: RedisCacheOptions) -> anyhow::Result<Self> {
        let RedisCacheOptions {
            ttl,
            mut key_prefix,
            clear_scope,
            timeout,
            pool_size,
        } = options;

        let connection = match descriptor {
            RedisDescriptor::Url(url) => Connection::Owned(new_pool(WireEndpoint::from_url(&url)?, pool_size, timeout)?),
            RedisDescriptor::Address { host, port } => {
                Connection::Owned(new_pool(WireEndpoint::new(host, port), pool_size, timeout)?)
            }
            RedisDescriptor::Client(client) => Connection::Shared(client),
            RedisDescriptor::ClusterClient(client) => {
                key_prefix = hash_tagged(key_prefix);
                Connection::Cluster(client)
            }
        };

        Ok(Self {
            connection,
            key_prefix,
            ttl,
            clear_scope,
            timeout,
            _value: PhantomData,
        })
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }

    fn pattern(&self) -> String {
        let mut pattern = String::with_capacity(self.key_prefix.len() + 1);

        for c in self.key_prefix.chars() {
            if matches!(c, '*' | '?' | '[' | ']' | '\\') {
                pattern.push('\\');
            }

            pattern.push(c);
        }

        pattern.push('*');
        pattern
    }

    async fn bounded<T>(&self, operation: &str, future: impl Future<Output = Result<T>> + Send) -> Result<T> {
        match tokio::time::timeout(self.timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(Error::CacheUnavailable(format!(
                "{operation} timed out after {}ms",
                self.timeout.as_millis()
            ))),
        }
    }

    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match &self.connection {
            Connection::Owned(pool) => {
                let mut conn = pool.get().await.map_err(unavailable)?;

                match conn.command(&[b"GET", key.as_bytes()]).await.map_err(unavailable)? {
                    Reply::Bulk(value) => Ok(value),
                    reply => Err(unexpected("GET", &reply)),
                }
            }
            Connection::Shared(client) => ::redis::cmd("GET")
                .arg(key)
                .query_async::<_, Option<Vec<u8>>>(&mut client.clone())
                .await
                .map_err(unavailable),
            Connection::Cluster(client) => ::redis::cmd("GET")
                .arg(key)
                .query_async::<_, Option<Vec<u8>>>(&mut client.clone())
                .await
                .map_err(unavailable),
        }
    }

    async fn store(&self, key: &str, value: &[u8]) -> Result<()> {
        let ttl = self.ttl.as_millis().max(1).to_string();

        match &self.connection {
            Connection::Owned(pool) => {
                let mut conn = pool.get().await.map_err(unavailable)?;

                conn.command(&[b"SET", key.as_bytes(), value, b"PX", ttl.as_bytes()])
                    .await
                    .map_err(unavailable)?;

                Ok(())
            }
            Connection::Shared(client) => ::redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(&ttl)
                .query_async::<_, ()>(&mut client.clone())
                .await
                .map_err(unavailable),
            Connection::Cluster(client) => ::redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(&ttl)
                .query_async::<_, ()>(&mut client.clone())
                .await
                .map_err(unavailable),
        }
    }

    async fn flush_all(&self) -> Result<()> {
        match &self.connection {
            Connection::Owned(pool) => {
                let mut conn = pool.get().await.map_err(unavailable)?;
                conn.command(&[b"FLUSHALL"]).await.map_err(unavailable)?;

                Ok(())
            }
            Connection::Shared(client) => ::redis::cmd("FLUSHALL")
                .query_async::<_, ()>(&mut client.clone())
                .await
                .map_err(unavailable),
            Connection::Cluster(client) => ::redis::cmd("FLUSHALL")
                .query_async::<_, ()>(&mut client.clone())
                .await
                .map_err(unavailable),
        }
    }

    async fn clear_namespace(&self) -> Result<()> {
        let pattern = self.pattern();

        let deleted = match &self.connection {
            Connection::Owned(pool) => {
                let mut conn = pool.get().await.map_err(unavailable)?;
                let mut cursor = String::from("0");
                let mut deleted = 0;

                loop {
                    let reply = conn
                        .command(&[
                            b"SCAN",
                            cursor.as_bytes(),
                            b"MATCH",
                            pattern.as_bytes(),
                            b"COUNT",
                            SCAN_PAGE_SIZE,
                        ])
                        .await
                        .map_err(unavailable)?;

                    let (next, keys) = scan_page(reply)?;

                    if !keys.is_empty() {
                        let mut command: Vec<&[u8]> = Vec::with_capacity(keys.len() + 1);
                        command.push(b"DEL");
                        command.extend(keys.iter().map(Vec::as_slice));

                        if let Reply::Integer(count) = conn.command(&command).await.map_err(unavailable)? {
                            deleted += count;
                        }
                    }

                    if next == "0" {
                        break deleted;
                    }

                    cursor = next;
                }
            }
            Connection::Shared(client) => {
                let mut client = client.clone();
                let mut cursor = 0_u64;
                let mut deleted = 0;

                loop {
                    let (next, keys) = ::redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_PAGE_SIZE)
                        .query_async::<_, (u64, Vec<Vec<u8>>)>(&mut client)
                        .await
                        .map_err(unavailable)?;

                    if !keys.is_empty() {
                        deleted += ::redis::cmd("DEL")
                            .arg(&keys)
                            .query_async::<_, i64>(&mut client)
                            .await
                            .map_err(unavailable)?;
                    }

                    if next == 0 {
                        break deleted;
                    }

                    cursor = next;
                }
            }
            // The hash-tagged prefix keeps the whole namespace on the slot owning `KEYS[1]`.
            Connection::Cluster(client) => Script::new(CLEAR_NAMESPACE_SCRIPT)
                .key(&self.key_prefix)
                .arg(&pattern)
                .invoke_async::<_, i64>(&mut client.clone())
                .await
                .map_err(unavailable)?,
        };

        tracing::debug!(target: DEPTH_GUARD_TARGET, "cleared {deleted} cached depths under '{}'", self.key_prefix);

        Ok(())
    }
}

#[async_trait::async_trait]
impl<V> ExpiringCache for RedisCache<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Value = V;

    async fn get(&self, key: &str) -> Result<Option<V>> {
        let key = self.key(key);

        match self.bounded("GET", self.fetch(&key)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: V) -> Result<()> {
        let key = self.key(key);
        let value = serde_json::to_vec(&value)?;

        self.bounded("SET", self.store(&key, &value)).await
    }

    async fn clear(&self) -> Result<()> {
        match self.clear_scope {
            ClearScope::Namespace => self.bounded("clear", self.clear_namespace()).await,
            ClearScope::FlushAll => self.bounded("FLUSHALL", self.flush_all()).await,
        }
    }

    async fn teardown(&self) {
        if let Connection::Owned(pool) = &self.connection {
            pool.close();
            tracing::info!(target: DEPTH_GUARD_TARGET, "closed the depth cache Redis connections");
        }
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}

fn new_pool(endpoint: WireEndpoint, pool_size: usize, timeout: Duration) -> anyhow::Result<WirePool> {
    let address = format!("{}:{}", endpoint.host, endpoint.port);

    let pool = match Pool::builder(Manager::new(endpoint))
        .max_size(pool_size.max(1))
        .wait_timeout(Some(timeout))
        .create_timeout(Some(timeout))
        .runtime(deadpool::Runtime::Tokio1)
        .build()
    {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!(target: DEPTH_GUARD_TARGET, "error creating a Redis pool: {e}");
            return Err(e.into());
        }
    };

    tracing::info!(target: DEPTH_GUARD_TARGET, "depth cache stored in Redis at {address}");

    Ok(pool)
}

/// Wraps the prefix in a hash tag unless it has one, so that every namespaced key lands in the
/// same cluster slot.
fn hash_tagged(prefix: String) -> String {
    let tagged = prefix
        .find('{')
        .and_then(|start| prefix[start + 1..].find('}'))
        .is_some_and(|len| len > 0);

    if tagged {
        prefix
    } else {
        format!("{{{prefix}}}")
    }
}

fn scan_page(reply: Reply) -> Result<(String, Vec<Vec<u8>>)> {
    let mut page = match reply {
        Reply::Array(Some(page)) => page,
        reply => return Err(unexpected("SCAN", &reply)),
    };

    if page.len() != 2 {
        return Err(Error::CacheUnavailable(String::from("unexpected SCAN reply length")));
    }

    let keys = match page.pop() {
        Some(Reply::Array(Some(keys))) => keys
            .into_iter()
            .filter_map(|key| match key {
                Reply::Bulk(Some(key)) => Some(key),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    let cursor = match page.pop() {
        Some(Reply::Bulk(Some(cursor))) => String::from_utf8(cursor).map_err(unavailable)?,
        _ => return Err(Error::CacheUnavailable(String::from("missing SCAN cursor"))),
    };

    Ok((cursor, keys))
}

fn unavailable(error: impl fmt::Display) -> Error {
    Error::CacheUnavailable(error.to_string())
}

fn unexpected(command: &str, reply: &Reply) -> Error {
    Error::CacheUnavailable(format!("unexpected {command} reply: {reply:?}"))
}
