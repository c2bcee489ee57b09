//! Back-end type registry and the named-cache pool.
//!
//! Both are process-wide, lazily-initialised stores behind a single mutex
//! each. The registry maps back-end names to their descriptors and comes
//! pre-seeded with the four built-ins; hosts embedding their own back-end
//! add it with [`register_backend`] during start-up, before the first
//! cache is obtained. The pool keeps at most one entry per logical cache
//! name, in insertion order, and is where refcount transitions and pool
//! membership are decided.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error};

use crate::backend::{file, memcached, redis, shm, BackendDescriptor};
use crate::cache::{Cache, CacheShared};
use crate::error::{CacheError, CacheResult};
use crate::options::CacheOptions;

/// The name used when a cache is configured without one.
pub const DEFAULT_CACHE_NAME: &str = "default";

static REGISTRY: Lazy<RwLock<Vec<&'static BackendDescriptor>>> = Lazy::new(|| {
    RwLock::new(vec![
        &shm::DESCRIPTOR,
        &file::DESCRIPTOR,
        &memcached::DESCRIPTOR,
        &redis::DESCRIPTOR,
    ])
});

struct PoolEntry {
    name: String,
    shared: Arc<CacheShared>,
}

static POOL: Lazy<Mutex<Vec<PoolEntry>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Register an additional back-end type.
///
/// The most recent registration of a name wins, so a host can shadow a
/// built-in. Registration must happen before the first `init`/`obtain`
/// that uses the name.
pub fn register_backend(descriptor: &'static BackendDescriptor) {
    debug!(backend = descriptor.name, "registering cache back-end type");
    REGISTRY.write().push(descriptor);
}

fn lookup(kind: &str) -> Option<&'static BackendDescriptor> {
    REGISTRY.read().iter().rev().find(|d| d.name == kind).copied()
}

fn normalize_name(name: Option<&str>) -> String {
    match name {
        Some(n) if !n.is_empty() => n.to_string(),
        _ => DEFAULT_CACHE_NAME.to_string(),
    }
}

pub(crate) fn init_cache(kind: Option<&str>, opts: &CacheOptions) -> CacheResult<Cache> {
    let kind = match kind {
        Some(k) if !k.is_empty() => k,
        _ => shm::DESCRIPTOR.name,
    };
    let descriptor = lookup(kind).ok_or_else(|| {
        error!(kind, "unknown cache back-end type");
        CacheError::UnknownBackend(kind.to_string())
    })?;

    let name = normalize_name(opts.get("name"));
    let mut pool = POOL.lock();
    if let Some(entry) = pool.iter().find(|e| e.name == name) {
        debug!(name = %name, "cache name already registered, sharing the existing cache");
        return Ok(Cache::from_shared(&entry.shared));
    }

    let shared = CacheShared::build(descriptor, name.clone(), opts)?;
    pool.push(PoolEntry {
        name,
        shared: shared.clone(),
    });
    Ok(Cache::adopt(shared))
}

/// Obtain a shared handle to the cache registered under `name`.
///
/// An existing cache is shared (refcount incremented). When no cache is
/// registered under the name, a default shared-memory cache is created
/// under it and post-configured, so the returned handle is ready for use
/// either way. `None` and the empty name mean `"default"`.
pub fn obtain(name: Option<&str>) -> CacheResult<Cache> {
    let name = normalize_name(name);
    let existing = {
        let pool = POOL.lock();
        pool.iter()
            .find(|e| e.name == name)
            .map(|e| Cache::from_shared(&e.shared))
    };
    if let Some(cache) = existing {
        return Ok(cache);
    }

    debug!(name = %name, "no cache under this name, creating a default shm cache");
    let mut opts = CacheOptions::new();
    opts.push("name", name);
    let cache = init_cache(Some(shm::DESCRIPTOR.name), &opts)?;
    cache.post_config()?;
    Ok(cache)
}

/// Drop one reference; at zero, remove the pool entry so the physical
/// cache is torn down. Called from the handle's `Drop`.
pub(crate) fn release_shared(shared: &Arc<CacheShared>) {
    use std::sync::atomic::Ordering;

    let mut pool = POOL.lock();
    if shared.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
        if let Some(idx) = pool.iter().position(|e| Arc::ptr_eq(&e.shared, shared)) {
            let entry = pool.remove(idx);
            debug!(name = %entry.name, "last reference released, destroying cache");
        }
    }
}

#[cfg(test)]
pub(crate) fn pool_has(name: &str) -> bool {
    POOL.lock().iter().any(|e| e.name == name)
}
