use deadpool::managed::{self, Metrics};
use percent_encoding::percent_decode_str;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::wire::{Reply, WireConnection, WireError};

/// Where and how to open a wire connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireEndpoint {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: Option<u16>,
}

impl WireEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            database: None,
        }
    }

    /// Reads `redis://[[user]:password@]host[:port][/db]`.
    pub fn from_url(url: &url::Url) -> anyhow::Result<Self> {
        if url.scheme() != "redis" {
            anyhow::bail!("unsupported scheme '{}', expected 'redis'", url.scheme());
        }

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| anyhow::anyhow!("missing host in '{url}'"))?;

        let database = match url.path().trim_start_matches('/') {
            "" => None,
            db => Some(
                db.parse()
                    .map_err(|_| anyhow::anyhow!("invalid database index '{db}' in '{url}'"))?,
            ),
        };

        Ok(Self {
            host: host.to_string(),
            port: url.port().unwrap_or(6379),
            username: Some(url.username())
                .filter(|name| !name.is_empty())
                .map(decode_credential)
                .transpose()?,
            password: url.password().map(decode_credential).transpose()?,
            database,
        })
    }
}

/// Credentials are percent-encoded in the url, the server expects them as typed.
fn decode_credential(component: &str) -> anyhow::Result<String> {
    Ok(percent_decode_str(component).decode_utf8()?.into_owned())
}

#[derive(Debug)]
pub struct Manager {
    endpoint: WireEndpoint,
    ping_number: AtomicUsize,
}

impl Manager {
    pub fn new(endpoint: WireEndpoint) -> Self {
        Self {
            endpoint,
            ping_number: AtomicUsize::new(0),
        }
    }
}

impl managed::Manager for Manager {
    type Type = WireConnection;
    type Error = WireError;

    async fn create(&self) -> Result<WireConnection, Self::Error> {
        let WireEndpoint {
            host,
            port,
            username,
            password,
            database,
        } = &self.endpoint;

        let mut conn = WireConnection::connect(host, *port).await?;

        if let Some(password) = password {
            let setup = match username {
                Some(username) => conn.command(&[b"AUTH", username.as_bytes(), password.as_bytes()]).await,
                None => conn.command(&[b"AUTH", password.as_bytes()]).await,
            };

            if let Err(error) = setup {
                conn.close().await;
                return Err(error);
            }
        }

        if let Some(database) = database {
            let database = database.to_string();

            if let Err(error) = conn.command(&[b"SELECT", database.as_bytes()]).await {
                conn.close().await;
                return Err(error);
            }
        }

        Ok(conn)
    }

    async fn recycle(&self, conn: &mut WireConnection, _: &Metrics) -> managed::RecycleResult<Self::Error> {
        let ping_number = self.ping_number.fetch_add(1, Ordering::Relaxed).to_string();

        // Fails right away for poisoned or closed connections, dropping them from the pool.
        match conn.command(&[b"PING", ping_number.as_bytes()]).await? {
            Reply::Bulk(Some(echo)) if echo == ping_number.as_bytes() => Ok(()),
            _ => Err(managed::RecycleError::message("Invalid PING response")),
        }
    }
}
