//! Error taxonomy shared by the cache façade and every back-end.
//!
//! Back-ends never panic across the façade boundary; everything an
//! operation can go wrong with is one of the kinds below. The façade's
//! `get` path additionally downgrades [`CacheError::Crypto`] and
//! [`CacheError::Corruption`] to a miss, because a cache is an
//! optimisation layer and the host must be able to continue without it.

use thiserror::Error;

/// Errors produced by cache configuration, back-ends and the envelope.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A configuration option is missing, malformed or inconsistent.
    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),

    /// The requested back-end type is not in the registry.
    #[error("unknown cache back-end type: {0}")]
    UnknownBackend(String),

    /// A key or value exceeds the back-end's configured byte cap.
    #[error("{what} exceeds maximum size ({len} > {max})")]
    SizeLimitExceeded {
        /// What was too large (`"key"` or `"value"`).
        what: &'static str,
        /// Observed length in bytes.
        len: usize,
        /// Configured cap in bytes.
        max: usize,
    },

    /// Filesystem error from the file back-end.
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network or protocol error from a remote back-end.
    #[error("cache network error: {0}")]
    Network(String),

    /// A remote operation exceeded its wall-clock timeout.
    #[error("cache operation timed out")]
    Timeout,

    /// A lock could not be acquired.
    #[error("cache lock failure: {0}")]
    LockFailure(String),

    /// Sealing or unsealing a value failed (bad key, bad tag, bad encoding).
    #[error("cache crypto failure: {0}")]
    Crypto(String),

    /// A stored entry is structurally invalid.
    #[error("corrupt cache entry: {0}")]
    Corruption(String),
}

/// Convenience alias used throughout the crate.
pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_sizes() {
        let e = CacheError::SizeLimitExceeded {
            what: "value",
            len: 20,
            max: 16,
        };
        assert_eq!(e.to_string(), "value exceeds maximum size (20 > 16)");
    }

    #[test]
    fn io_errors_convert() {
        let ioe = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let e: CacheError = ioe.into();
        assert!(matches!(e, CacheError::Io(_)));
    }
}
