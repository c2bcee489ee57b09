//! The cache façade: a type-erased, reference-counted cache handle.
//!
//! A [`Cache`] owns one back-end implementation plus the envelope settings
//! that wrap it. Callers hand it string keys and string values with a TTL
//! in whole seconds; the façade hashes the key, seals the value when
//! encryption is on, and delegates the raw read/write.
//!
//! Handles are reference counted so several configuration contexts (the
//! provider resolver, the session store, a token verifier) can share one
//! physical cache: `Clone` increments the count, dropping a handle
//! decrements it, and the physical cache is torn down exactly when the
//! count reaches zero, at which point the named-cache pool entry is
//! removed and the encryption key is zeroized.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::{BackendDescriptor, CacheBackend};
use crate::envelope::Envelope;
use crate::error::CacheResult;
use crate::options::CacheOptions;
use crate::registry;

pub(crate) struct CacheShared {
    name: String,
    descriptor: &'static BackendDescriptor,
    backend: Box<dyn CacheBackend>,
    envelope: Envelope,
    configured: AtomicBool,
    pub(crate) refs: AtomicUsize,
}

impl CacheShared {
    pub(crate) fn build(
        descriptor: &'static BackendDescriptor,
        name: String,
        opts: &CacheOptions,
    ) -> CacheResult<Arc<Self>> {
        let envelope = Envelope::from_options(opts, descriptor.encrypt_by_default)?;
        let backend = (descriptor.create)(opts)?;
        debug!(
            name = %name,
            backend = descriptor.name,
            encrypting = envelope.encrypting(),
            key_hash = ?envelope.key_hash_algo(),
            "cache initialised"
        );
        Ok(Arc::new(Self {
            name,
            descriptor,
            backend,
            envelope,
            configured: AtomicBool::new(false),
            refs: AtomicUsize::new(1),
        }))
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

/// A handle to a named, possibly shared, cache.
pub struct Cache {
    shared: Arc<CacheShared>,
}

impl Cache {
    /// Initialise a cache of the given type.
    ///
    /// `kind == None` selects the shared-memory back-end. The handle is
    /// entered into the named-cache pool under the `name` option (absent
    /// or empty means `"default"`); if that name is already registered the
    /// existing handle is returned instead and `opts` is ignored. An
    /// unknown `kind` is an error: the cache cannot be built and the host
    /// should treat the configuration as broken.
    pub fn init(kind: Option<&str>, opts: &CacheOptions) -> CacheResult<Self> {
        registry::init_cache(kind, opts)
    }

    /// Wrap an owning reference without touching the refcount.
    pub(crate) fn adopt(shared: Arc<CacheShared>) -> Self {
        Self { shared }
    }

    /// Take an additional reference on an existing cache.
    pub(crate) fn from_shared(shared: &Arc<CacheShared>) -> Self {
        shared.refs.fetch_add(1, Ordering::SeqCst);
        Self {
            shared: shared.clone(),
        }
    }

    /// Finalise back-end resources. Must complete once before first use;
    /// repeated calls are no-ops.
    pub fn post_config(&self) -> CacheResult<()> {
        if self.shared.configured.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(name = %self.shared.name, backend = self.shared.descriptor.name, "post-config");
        let result = self.shared.backend.post_config();
        if result.is_err() {
            // Allow the host to retry after fixing its deployment.
            self.shared.configured.store(false, Ordering::SeqCst);
        }
        result
    }

    /// Re-establish per-process resources after a worker fork. Must be
    /// called in the child for every inherited cache handle.
    pub fn child_init(&self) -> CacheResult<()> {
        self.shared.backend.child_init()
    }

    /// Look up `key`.
    ///
    /// Returns `Ok(None)` on a miss, an expired entry, or a value that
    /// fails authenticated decryption (logged and evicted); hard back-end
    /// failures are errors.
    pub fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let hashed = self.shared.envelope.hash_key(key);
        let raw = match self.shared.backend.get(&hashed)? {
            None => {
                debug!(name = %self.shared.name, key, "cache miss");
                return Ok(None);
            }
            Some(raw) => raw,
        };
        if !self.shared.envelope.encrypting() {
            return Ok(Some(raw));
        }
        match self.shared.envelope.open(&raw) {
            Ok(plaintext) => Ok(Some(plaintext)),
            Err(e) => {
                warn!(
                    name = %self.shared.name,
                    key,
                    error = %e,
                    "cached value failed authenticated decryption, evicting"
                );
                if let Err(evict) = self.shared.backend.set(&hashed, None, 0) {
                    debug!(error = %evict, "eviction of undecryptable entry failed");
                }
                Ok(None)
            }
        }
    }

    /// Store `value` under `key` for `ttl_s` seconds.
    ///
    /// `value == None` or `ttl_s == 0` deletes the entry; deletion skips
    /// encryption and succeeds even when the entry is absent.
    pub fn set(&self, key: &str, value: Option<&str>, ttl_s: u64) -> CacheResult<()> {
        let hashed = self.shared.envelope.hash_key(key);
        match (value, ttl_s) {
            (None, _) | (Some(_), 0) => self.shared.backend.set(&hashed, None, 0),
            (Some(plaintext), _) => {
                if self.shared.envelope.encrypting() {
                    let sealed = self.shared.envelope.seal(plaintext)?;
                    self.shared.backend.set(&hashed, Some(&sealed), ttl_s)
                } else {
                    self.shared.backend.set(&hashed, Some(plaintext), ttl_s)
                }
            }
        }
    }

    /// Delete `key`; idempotent.
    pub fn delete(&self, key: &str) -> CacheResult<()> {
        self.set(key, None, 0)
    }

    /// Explicitly release this handle.
    ///
    /// Dropping the handle is equivalent; this form exists for call sites
    /// that want the release to be visible in the code.
    pub fn release(self) {}

    /// The logical cache name this handle is registered under.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The back-end kind behind this handle.
    pub fn backend_kind(&self) -> &'static str {
        self.shared.descriptor.name
    }

    /// Whether values are encrypted before they reach the back-end.
    pub fn encrypting(&self) -> bool {
        self.shared.envelope.encrypting()
    }
}

impl Clone for Cache {
    /// Cloning shares the physical cache and increments its refcount.
    fn clone(&self) -> Self {
        Self::from_shared(&self.shared)
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        registry::release_shared(&self.shared);
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.shared.name)
            .field("backend", &self.shared.descriptor.name)
            .field("refs", &self.shared.refs.load(Ordering::SeqCst))
            .finish()
    }
}
