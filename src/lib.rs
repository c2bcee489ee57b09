//! # oidc-cache
//!
//! A pluggable, expiring, optionally-encrypted key/value cache for
//! OAuth 2.0 / OpenID Connect deployments: bearer-token validation
//! results, provider metadata and session state all need a fast store
//! with a uniform contract for naming, expiry, encryption and concurrent
//! access, across interchangeable back-ends.
//!
//! ## Architecture
//!
//! - `options`: the shared `k1=v1&k2=v2` configuration surface
//! - `envelope`: key hashing + authenticated value encryption applied
//!   above every back-end
//! - `backend`: the back-end contract and the four built-ins
//!   (`shm`, `file`, `memcache`, `redis`)
//! - `cache`: the type-erased, reference-counted cache handle
//! - `registry`: back-end type registry and the named-cache pool
//! - `cfg`: prefix-scoped cache bindings for host configuration contexts
//!
//! ## Example
//!
//! ```rust
//! use oidc_cache::{Cache, CacheOptions};
//!
//! # fn main() -> oidc_cache::CacheResult<()> {
//! let opts = CacheOptions::parse("name=doc-example&max_entries=100")?;
//! let cache = Cache::init(Some("shm"), &opts)?;
//! cache.post_config()?;
//!
//! cache.set("token", Some("active"), 60)?;
//! assert_eq!(cache.get("token")?.as_deref(), Some("active"));
//!
//! cache.set("token", None, 0)?; // delete
//! assert_eq!(cache.get("token")?, None);
//! # Ok(())
//! # }
//! ```
//!
//! Handles are thread-safe once `post_config` has returned and are
//! reference counted: `Clone` shares the physical cache, dropping the
//! last handle tears it down. [`obtain`] returns the cache registered
//! under a logical name so independent host features share one store.

#![warn(missing_docs)]
#![warn(clippy::all)]

// Configuration surface
pub mod options;

// Error taxonomy
pub mod error;

// Key hashing and value encryption
pub mod envelope;

// Back-end contract and built-ins
pub mod backend;

// The cache façade
pub mod cache;

// Type registry and named-cache pool
pub mod registry;

// Host-configuration cache bindings
pub mod cfg;

// Re-export the types most call sites need
pub use backend::{BackendDescriptor, CacheBackend};
pub use cache::Cache;
pub use cfg::CacheBinding;
pub use envelope::KeyHashAlgo;
pub use error::{CacheError, CacheResult};
pub use options::CacheOptions;
pub use registry::{obtain, register_backend, DEFAULT_CACHE_NAME};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
