//! File back-end: one file per key with a TTL header and a lazy sweep.
//!
//! Entry layout on disk is an 8-byte big-endian absolute expiry (Unix
//! seconds) followed by the opaque value bytes. Writes go to a sibling
//! temp file and are renamed into place under an advisory exclusive lock
//! on the target, so readers always see a complete entry. Expired entries
//! are unlinked lazily: by the `get` that finds them, and by a sweep that
//! runs at most once per `clean_interval` across all processes sharing the
//! directory (a sentinel file carries the last-sweep stamp and its lock
//! elects the sweeper).

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use super::{now_secs, BackendDescriptor, CacheBackend};
use crate::error::{CacheError, CacheResult};
use crate::options::CacheOptions;

/// Filename prefix for every entry this back-end owns.
pub const FILE_PREFIX: &str = "oidc-cache";
/// Default sweep period in seconds.
pub const DEFAULT_CLEAN_INTERVAL_S: u64 = 60;
/// Default byte cap on back-end keys.
pub const DEFAULT_MAX_KEY_SIZE: usize = 64;

const EXPIRY_HEADER_LEN: usize = 8;

/// Type descriptor registered for `type=file`.
pub static DESCRIPTOR: BackendDescriptor = BackendDescriptor {
    name: "file",
    encrypt_by_default: true,
    create: FileBackend::create,
};

/// On-disk cache back-end.
pub struct FileBackend {
    dir: PathBuf,
    clean_interval_s: u64,
    max_key_size: usize,
}

impl FileBackend {
    /// `create` hook for the type descriptor.
    pub fn create(opts: &CacheOptions) -> CacheResult<Box<dyn CacheBackend>> {
        let dir = match opts.get("dir") {
            Some(d) if !d.is_empty() => PathBuf::from(d),
            _ => std::env::temp_dir(),
        };
        let clean_interval_s = opts.get_u64("clean_interval", DEFAULT_CLEAN_INTERVAL_S)?;
        let max_key_size = opts.get_usize("max_key_size", DEFAULT_MAX_KEY_SIZE)?;
        Ok(Box::new(Self {
            dir,
            clean_interval_s,
            max_key_size,
        }))
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{FILE_PREFIX}-{key}"))
    }

    fn sentinel_path(&self) -> PathBuf {
        self.dir.join(format!("{FILE_PREFIX}-sweep"))
    }

    /// Keys containing path separators never reach the filesystem; they
    /// can only occur with key hashing disabled.
    fn key_is_unsafe(key: &str) -> bool {
        key.contains('/') || key.contains('\\')
    }

    fn delete(&self, key: &str) -> CacheResult<()> {
        match fs::remove_file(self.entry_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_entry(&self, key: &str, value: &str, expires_at: u64) -> CacheResult<()> {
        let path = self.entry_path(key);

        // Advisory exclusive lock on the target across temp-write + rename.
        let lock = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)?;
        lock.lock_exclusive()
            .map_err(|e| CacheError::LockFailure(format!("{}: {e}", path.display())))?;

        let tmp = self
            .dir
            .join(format!("{FILE_PREFIX}-{key}.{}.tmp", std::process::id()));
        let result = (|| -> CacheResult<()> {
            let mut f = File::create(&tmp)?;
            f.write_all(&expires_at.to_be_bytes())?;
            f.write_all(value.as_bytes())?;
            fs::rename(&tmp, &path)?;
            Ok(())
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }

    fn read_expiry(path: &Path) -> Option<u64> {
        let mut f = File::open(path).ok()?;
        let mut header = [0u8; EXPIRY_HEADER_LEN];
        f.read_exact(&mut header).ok()?;
        Some(u64::from_be_bytes(header))
    }

    /// Run the expiry sweep if `clean_interval` has elapsed since the last
    /// one. Sweep problems are logged, never surfaced: the entry write
    /// that triggered the sweep must not fail because housekeeping did.
    fn maybe_sweep(&self) {
        let now = now_secs();
        let sentinel = self.sentinel_path();

        if let Some(last) = Self::read_expiry(&sentinel) {
            if now < last + self.clean_interval_s {
                return;
            }
        }

        let mut f = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&sentinel)
        {
            Ok(f) => f,
            Err(e) => {
                debug!(error = %e, "cannot open sweep sentinel, skipping sweep");
                return;
            }
        };
        if f.try_lock_exclusive().is_err() {
            // Another process is sweeping; not an error.
            debug!("sweep sentinel is locked, leaving the sweep to its holder");
            return;
        }

        // Re-check under the lock: a competing sweeper may have just run.
        let mut header = [0u8; EXPIRY_HEADER_LEN];
        if f.read_exact(&mut header).is_ok() {
            let last = u64::from_be_bytes(header);
            if now < last + self.clean_interval_s {
                return;
            }
        }

        if f.seek(SeekFrom::Start(0))
            .and_then(|_| f.write_all(&now.to_be_bytes()))
            .and_then(|_| f.set_len(EXPIRY_HEADER_LEN as u64))
            .is_err()
        {
            debug!("cannot update sweep sentinel, skipping sweep");
            return;
        }

        self.sweep(now);
    }

    fn sweep(&self, now: u64) {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(error = %e, dir = %self.dir.display(), "cannot enumerate cache dir");
                return;
            }
        };
        let sentinel = self.sentinel_path();
        let mut removed = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with(FILE_PREFIX) || path == sentinel || name.ends_with(".tmp") {
                continue;
            }
            let expired = match Self::read_expiry(&path) {
                Some(expiry) => expiry <= now,
                // Unreadable entries cannot be served; drop them too.
                None => true,
            };
            if expired && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, dir = %self.dir.display(), "swept expired cache files");
        }
    }
}

impl CacheBackend for FileBackend {
    fn post_config(&self) -> CacheResult<()> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    fn child_init(&self) -> CacheResult<()> {
        // No descriptors are held open between operations.
        Ok(())
    }

    fn get(&self, key: &str) -> CacheResult<Option<String>> {
        if key.len() > self.max_key_size || Self::key_is_unsafe(key) {
            return Ok(None);
        }
        let path = self.entry_path(key);
        let mut f = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut header = [0u8; EXPIRY_HEADER_LEN];
        if f.read_exact(&mut header).is_err() {
            warn!(path = %path.display(), "cache file shorter than its expiry header, removing");
            drop(f);
            let _ = fs::remove_file(&path);
            return Ok(None);
        }
        let expires_at = u64::from_be_bytes(header);
        if expires_at <= now_secs() {
            drop(f);
            let _ = fs::remove_file(&path);
            return Ok(None);
        }

        let mut value = String::new();
        if f.read_to_string(&mut value).is_err() {
            warn!(path = %path.display(), "cache file payload is not UTF-8, removing");
            drop(f);
            let _ = fs::remove_file(&path);
            return Ok(None);
        }
        Ok(Some(value))
    }

    fn set(&self, key: &str, value: Option<&str>, ttl_s: u64) -> CacheResult<()> {
        self.maybe_sweep();

        if Self::key_is_unsafe(key) {
            return Err(CacheError::InvalidConfig(format!(
                "cache key {key:?} contains a path separator"
            )));
        }

        let value = match (value, ttl_s) {
            (None, _) | (Some(_), 0) => return self.delete(key),
            (Some(v), _) => v,
        };

        if key.len() > self.max_key_size {
            return Err(CacheError::SizeLimitExceeded {
                what: "key",
                len: key.len(),
                max: self.max_key_size,
            });
        }

        self.write_entry(key, value, now_secs() + ttl_s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn backend(dir: &TempDir, extra: &str) -> FileBackend {
        let opts = CacheOptions::parse(extra).unwrap();
        let b = FileBackend {
            dir: dir.path().to_path_buf(),
            clean_interval_s: opts
                .get_u64("clean_interval", DEFAULT_CLEAN_INTERVAL_S)
                .unwrap(),
            max_key_size: opts.get_usize("max_key_size", DEFAULT_MAX_KEY_SIZE).unwrap(),
        };
        b.post_config().unwrap();
        b
    }

    #[test]
    fn round_trip_creates_prefixed_file() {
        let dir = TempDir::new().unwrap();
        let b = backend(&dir, "");
        b.set("piet", Some("klaas"), 10).unwrap();
        assert!(dir.path().join("oidc-cache-piet").exists());
        assert_eq!(b.get("piet").unwrap().as_deref(), Some("klaas"));
    }

    #[test]
    fn header_is_big_endian_expiry() {
        let dir = TempDir::new().unwrap();
        let b = backend(&dir, "");
        b.set("k", Some("v"), 100).unwrap();
        let raw = fs::read(dir.path().join("oidc-cache-k")).unwrap();
        let expiry = u64::from_be_bytes(raw[..8].try_into().unwrap());
        assert!(expiry >= now_secs() + 99 && expiry <= now_secs() + 101);
        assert_eq!(&raw[8..], b"v");
    }

    #[test]
    fn expired_entry_is_unlinked_on_get() {
        let dir = TempDir::new().unwrap();
        let b = backend(&dir, "");
        let path = dir.path().join("oidc-cache-old");
        let mut body = 1u64.to_be_bytes().to_vec();
        body.extend_from_slice(b"stale");
        fs::write(&path, body).unwrap();
        assert_eq!(b.get("old").unwrap(), None);
        assert!(!path.exists());
    }

    #[test]
    fn truncated_entry_is_removed() {
        let dir = TempDir::new().unwrap();
        let b = backend(&dir, "");
        let path = dir.path().join("oidc-cache-bad");
        fs::write(&path, b"1234").unwrap();
        assert_eq!(b.get("bad").unwrap(), None);
        assert!(!path.exists());
    }

    #[test]
    fn delete_is_idempotent_and_missing_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let b = backend(&dir, "");
        assert_eq!(b.get("nothing").unwrap(), None);
        b.set("k", Some("v"), 10).unwrap();
        b.set("k", None, 0).unwrap();
        b.set("k", None, 0).unwrap();
        assert_eq!(b.get("k").unwrap(), None);
    }

    #[test]
    fn key_cap_is_enforced_on_set() {
        let dir = TempDir::new().unwrap();
        let b = backend(&dir, "max_key_size=8");
        b.set("hans", Some("zandbelt"), 10).unwrap();
        assert!(matches!(
            b.set("key_too_long", Some("v"), 10),
            Err(CacheError::SizeLimitExceeded { what: "key", .. })
        ));
    }

    #[test]
    fn separator_keys_never_touch_disk() {
        let dir = TempDir::new().unwrap();
        let b = backend(&dir, "");
        assert!(b.set("../escape", Some("v"), 10).is_err());
        assert_eq!(b.get("../escape").unwrap(), None);
    }

    #[test]
    fn sweep_removes_expired_entries_and_respects_interval() {
        let dir = TempDir::new().unwrap();
        let b = backend(&dir, "clean_interval=1");
        let stale = dir.path().join("oidc-cache-stale");
        let mut body = 1u64.to_be_bytes().to_vec();
        body.extend_from_slice(b"old");
        fs::write(&stale, body).unwrap();

        // First set seeds the sentinel and sweeps the stale entry.
        b.set("fresh", Some("v"), 60).unwrap();
        assert!(!stale.exists());
        assert!(dir.path().join("oidc-cache-sweep").exists());
        assert_eq!(b.get("fresh").unwrap().as_deref(), Some("v"));

        // Within the interval nothing is swept again.
        let stale2 = dir.path().join("oidc-cache-stale2");
        let mut body = 1u64.to_be_bytes().to_vec();
        body.extend_from_slice(b"old");
        fs::write(&stale2, body).unwrap();
        b.set("fresh", Some("v"), 60).unwrap();
        assert!(stale2.exists());
    }
}
