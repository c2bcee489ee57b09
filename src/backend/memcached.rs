//! Memcached back-end: a thin adapter over a pooled memcached client.
//!
//! The adapter carries the (possibly sealed, possibly base64) value bytes
//! unchanged, treats a missing key as a plain miss and any client error as
//! a hard failure. Callers may retry or proceed without the cache, but a
//! network problem must never masquerade as "not found".

use std::time::Duration;

use parking_lot::RwLock;
use tracing::debug;

use super::{BackendDescriptor, CacheBackend};
use crate::error::{CacheError, CacheResult};
use crate::options::CacheOptions;

/// Default server list.
pub const DEFAULT_SERVERS: &str = "localhost:11211";
/// Default per-operation timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 3000;
/// Default connection-pool size.
pub const DEFAULT_POOL_SIZE: u64 = 4;
/// Default key cap; the memcached protocol bounds keys at 250 bytes.
pub const DEFAULT_MAX_KEY_SIZE: usize = 250;

/// Type descriptor registered for `type=memcache`.
pub static DESCRIPTOR: BackendDescriptor = BackendDescriptor {
    name: "memcache",
    encrypt_by_default: true,
    create: MemcachedBackend::create,
};

/// Memcached cache back-end.
pub struct MemcachedBackend {
    urls: Vec<String>,
    timeout: Duration,
    pool_size: u32,
    max_key_size: usize,
    client: RwLock<Option<memcache::Client>>,
}

impl MemcachedBackend {
    /// `create` hook for the type descriptor. Connections are only
    /// established in `post_config`.
    pub fn create(opts: &CacheOptions) -> CacheResult<Box<dyn CacheBackend>> {
        let urls = opts
            .get("servers")
            .unwrap_or(DEFAULT_SERVERS)
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|server| {
                if server.contains("://") {
                    server.to_string()
                } else {
                    format!("memcache://{server}")
                }
            })
            .collect::<Vec<_>>();
        if urls.is_empty() {
            return Err(CacheError::InvalidConfig(
                "servers option contains no addresses".to_string(),
            ));
        }
        let timeout = Duration::from_millis(opts.get_u64("timeout_ms", DEFAULT_TIMEOUT_MS)?);
        let pool_size = opts.get_u64("pool_size", DEFAULT_POOL_SIZE)?.max(1) as u32;
        let max_key_size = opts.get_usize("max_key_size", DEFAULT_MAX_KEY_SIZE)?;
        Ok(Box::new(Self {
            urls,
            timeout,
            pool_size,
            max_key_size,
            client: RwLock::new(None),
        }))
    }

    fn connect(&self) -> CacheResult<memcache::Client> {
        let client = memcache::Client::with_pool_size(self.urls.clone(), self.pool_size)
            .map_err(|e| CacheError::Network(format!("memcached connect: {e}")))?;
        client
            .set_read_timeout(Some(self.timeout))
            .map_err(|e| CacheError::Network(format!("memcached read timeout: {e}")))?;
        client
            .set_write_timeout(Some(self.timeout))
            .map_err(|e| CacheError::Network(format!("memcached write timeout: {e}")))?;
        Ok(client)
    }

    fn check_key(&self, key: &str) -> CacheResult<()> {
        if self.max_key_size > 0 && key.len() > self.max_key_size {
            return Err(CacheError::SizeLimitExceeded {
                what: "key",
                len: key.len(),
                max: self.max_key_size,
            });
        }
        Ok(())
    }

    fn with_client<T>(
        &self,
        f: impl FnOnce(&memcache::Client) -> Result<T, memcache::MemcacheError>,
    ) -> CacheResult<T> {
        let guard = self.client.read();
        let client = guard.as_ref().ok_or_else(|| {
            CacheError::InvalidConfig("memcached cache used before post_config".to_string())
        })?;
        f(client).map_err(|e| CacheError::Network(e.to_string()))
    }
}

impl CacheBackend for MemcachedBackend {
    fn post_config(&self) -> CacheResult<()> {
        let client = self.connect()?;
        *self.client.write() = Some(client);
        Ok(())
    }

    fn child_init(&self) -> CacheResult<()> {
        // Sockets must not be shared across a fork; rebuild the pool.
        debug!("rebuilding memcached client after fork");
        let client = self.connect()?;
        *self.client.write() = Some(client);
        Ok(())
    }

    fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.check_key(key)?;
        self.with_client(|client| client.get::<String>(key))
    }

    fn set(&self, key: &str, value: Option<&str>, ttl_s: u64) -> CacheResult<()> {
        self.check_key(key)?;
        match (value, ttl_s) {
            (None, _) | (Some(_), 0) => self.with_client(|client| {
                client.delete(key)?;
                Ok(())
            }),
            (Some(v), _) => {
                let expire = u32::try_from(ttl_s).unwrap_or(u32::MAX);
                self.with_client(|client| client.set(key, v, expire))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(options: &str) -> Box<dyn CacheBackend> {
        MemcachedBackend::create(&CacheOptions::parse(options).unwrap()).unwrap()
    }

    #[test]
    fn server_list_becomes_urls() {
        let opts = CacheOptions::parse("servers=10.0.0.1:11211, 10.0.0.2:11212").unwrap();
        let b = MemcachedBackend::create(&opts).unwrap();
        // create performs no I/O, so the backend exists even with
        // unreachable servers; operations before post_config fail cleanly.
        assert!(b.get("k").is_err());
    }

    #[test]
    fn empty_server_list_is_rejected() {
        let opts = CacheOptions::parse("servers=%2C").unwrap();
        assert!(MemcachedBackend::create(&opts).is_err());
    }

    #[test]
    fn oversize_key_fails_before_any_network_use() {
        let b = create("max_key_size=8");
        assert!(matches!(
            b.set("key_too_long", Some("v"), 10),
            Err(CacheError::SizeLimitExceeded { .. })
        ));
    }
}
