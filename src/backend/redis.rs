//! Redis back-end: `SETEX`/`GET`/`DEL` over blocking connections.
//!
//! A fixed pool of lazily-established connections is guarded by per-slot
//! mutexes; a connection that errors is dropped and re-established on the
//! next use. Socket read/write timeouts bound every operation, so a dead
//! server surfaces as [`CacheError::Timeout`] instead of a hang. Misses
//! are not errors; network errors are never misses.

use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use super::{BackendDescriptor, CacheBackend};
use crate::error::{CacheError, CacheResult};
use crate::options::CacheOptions;

/// Default server list; only the first entry is addressed.
pub const DEFAULT_SERVERS: &str = "localhost:6379";
/// Default per-operation timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 3000;
/// Default connection-pool size.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Type descriptor registered for `type=redis`.
pub static DESCRIPTOR: BackendDescriptor = BackendDescriptor {
    name: "redis",
    encrypt_by_default: true,
    create: RedisBackend::create,
};

/// Redis cache back-end.
pub struct RedisBackend {
    url: String,
    timeout: Duration,
    max_key_size: usize,
    client: OnceCell<redis::Client>,
    pool: Vec<Mutex<Option<redis::Connection>>>,
}

impl RedisBackend {
    /// `create` hook for the type descriptor. The client is only built in
    /// `post_config`; connections are established lazily per pool slot.
    pub fn create(opts: &CacheOptions) -> CacheResult<Box<dyn CacheBackend>> {
        let servers = opts.get("servers").unwrap_or(DEFAULT_SERVERS);
        let first = servers
            .split(',')
            .map(str::trim)
            .find(|s| !s.is_empty())
            .ok_or_else(|| {
                CacheError::InvalidConfig("servers option contains no addresses".to_string())
            })?;
        let url = if first.contains("://") {
            first.to_string()
        } else {
            match opts.get("password") {
                Some(password) if !password.is_empty() => {
                    format!("redis://:{password}@{first}")
                }
                _ => format!("redis://{first}"),
            }
        };
        let timeout = Duration::from_millis(opts.get_u64("timeout_ms", DEFAULT_TIMEOUT_MS)?);
        let pool_size = opts.get_usize("pool_size", DEFAULT_POOL_SIZE)?.max(1);
        // 0 disables the cap; redis itself has no practical key bound.
        let max_key_size = opts.get_usize("max_key_size", 0)?;
        Ok(Box::new(Self {
            url,
            timeout,
            max_key_size,
            client: OnceCell::new(),
            pool: (0..pool_size).map(|_| Mutex::new(None)).collect(),
        }))
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

    fn slot(&self) -> MutexGuard<'_, Option<redis::Connection>> {
        for slot in &self.pool {
            if let Some(guard) = slot.try_lock() {
                return guard;
            }
        }
        // All slots busy; queue on the first one.
        self.pool[0].lock()
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> CacheResult<T> {
        let client = self.client.get().ok_or_else(|| {
            CacheError::InvalidConfig("redis cache used before post_config".to_string())
        })?;

        let mut guard = self.slot();
        let mut conn = match guard.take() {
            Some(conn) => conn,
            None => {
                let conn = client
                    .get_connection_with_timeout(self.timeout)
                    .map_err(map_redis_error)?;
                conn.set_read_timeout(Some(self.timeout))
                    .map_err(map_redis_error)?;
                conn.set_write_timeout(Some(self.timeout))
                    .map_err(map_redis_error)?;
                conn
            }
        };

        match f(&mut conn) {
            Ok(value) => {
                *guard = Some(conn);
                Ok(value)
            }
            Err(e) => {
                // The connection may be poisoned mid-protocol; discard it.
                debug!(error = %e, "redis operation failed, dropping pooled connection");
                Err(map_redis_error(e))
            }
        }
    }
}

fn map_redis_error(e: redis::RedisError) -> CacheError {
    if e.is_timeout() {
        CacheError::Timeout
    } else {
        CacheError::Network(e.to_string())
    }
}

impl CacheBackend for RedisBackend {
    fn post_config(&self) -> CacheResult<()> {
        let client = redis::Client::open(self.url.as_str())
            .map_err(|e| CacheError::InvalidConfig(format!("redis url: {e}")))?;
        let _ = self.client.set(client);
        Ok(())
    }

    fn child_init(&self) -> CacheResult<()> {
        // Connections must not survive a fork; they re-establish lazily.
        debug!("dropping pooled redis connections after fork");
        for slot in &self.pool {
            *slot.lock() = None;
        }
        Ok(())
    }

    fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.check_key(key)?;
        self.with_conn(|conn| redis::cmd("GET").arg(key).query::<Option<String>>(conn))
    }

    fn set(&self, key: &str, value: Option<&str>, ttl_s: u64) -> CacheResult<()> {
        self.check_key(key)?;
        match (value, ttl_s) {
            (None, _) | (Some(_), 0) => {
                self.with_conn(|conn| redis::cmd("DEL").arg(key).query::<()>(conn))
            }
            (Some(v), _) => self.with_conn(|conn| {
                redis::cmd("SETEX")
                    .arg(key)
                    .arg(ttl_s)
                    .arg(v)
                    .query::<()>(conn)
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_server_wins_and_password_is_applied() {
        let opts =
            CacheOptions::parse("servers=redis1:6379,redis2:6379&password=s3cret").unwrap();
        let b = RedisBackend::create(&opts).unwrap();
        assert!(b.get("k").is_err()); // before post_config
        let opts = CacheOptions::parse("servers=redis://custom:7000/1").unwrap();
        assert!(RedisBackend::create(&opts).is_ok());
    }

    #[test]
    fn empty_server_list_is_rejected() {
        let opts = CacheOptions::parse("servers=%20").unwrap();
        assert!(RedisBackend::create(&opts).is_err());
    }

    #[test]
    fn oversize_key_fails_before_any_network_use() {
        let opts = CacheOptions::parse("max_key_size=8").unwrap();
        let b = RedisBackend::create(&opts).unwrap();
        assert!(matches!(
            b.set("key_too_long", Some("v"), 10),
            Err(CacheError::SizeLimitExceeded { .. })
        ));
    }
}
