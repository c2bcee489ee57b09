//! Prefix-scoped cache bindings for host configuration contexts.
//!
//! Host features that cache things (the provider resolver, the session
//! store, a token verifier) each carry their own option list and their
//! own default TTL. A [`CacheBinding`] pulls the cache-related options out
//! of such a list under a feature prefix: `resolver.cache=metadata`
//! obtains the named cache `metadata` for the resolver, and
//! `resolver.cache.expiry=3600` overrides the resolver's default TTL.
//! Every binding shares the underlying physical cache through the
//! named-cache pool.

use crate::cache::Cache;
use crate::error::CacheResult;
use crate::options::CacheOptions;
use crate::registry;

/// A cache handle paired with the TTL a host feature writes with.
#[derive(Debug, Clone)]
pub struct CacheBinding {
    cache: Cache,
    expiry_s: u64,
}

impl CacheBinding {
    /// Bind a cache for the feature named by `prefix`.
    ///
    /// Reads `<prefix>.cache` (logical cache name; absent means the
    /// default cache) and `<prefix>.cache.expiry` (seconds; absent means
    /// `default_expiry_s`) from `opts`. The cache is obtained from the
    /// pool and ready for use.
    pub fn from_options(
        prefix: &str,
        opts: &CacheOptions,
        default_expiry_s: u64,
    ) -> CacheResult<Self> {
        let cache = registry::obtain(opts.get(&format!("{prefix}.cache")))?;
        let expiry_s = opts.get_u64(&format!("{prefix}.cache.expiry"), default_expiry_s)?;
        Ok(Self { cache, expiry_s })
    }

    /// The underlying cache handle.
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// The TTL in seconds applied by [`CacheBinding::set`].
    pub fn expiry_s(&self) -> u64 {
        self.expiry_s
    }

    /// Look up `key`.
    pub fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.cache.get(key)
    }

    /// Store `value` under `key` with the bound TTL.
    pub fn set(&self, key: &str, value: &str) -> CacheResult<()> {
        self.cache.set(key, Some(value), self.expiry_s)
    }

    /// Store `value` under `key` with an explicit TTL.
    pub fn set_with_ttl(&self, key: &str, value: &str, ttl_s: u64) -> CacheResult<()> {
        self.cache.set(key, Some(value), ttl_s)
    }

    /// Delete `key`; idempotent.
    pub fn delete(&self, key: &str) -> CacheResult<()> {
        self.cache.delete(key)
    }
}
