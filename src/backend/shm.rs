//! Shared-memory back-end: a fixed-capacity slot arena with LRU eviction.
//!
//! The segment is a contiguous run of `max_entries` self-contained slots,
//! each holding one key/value pair plus expiry and last-access stamps
//! behind its own mutex. Slots are addressed by index only, so the layout
//! carries no internal pointers. A single segment-level mutex serialises
//! slot allocation and eviction; readers touch per-slot mutexes only, and
//! the segment mutex is never held across I/O.

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::debug;

use super::{now_secs, BackendDescriptor, CacheBackend};
use crate::error::{CacheError, CacheResult};
use crate::options::CacheOptions;

/// Default byte cap on back-end keys.
pub const DEFAULT_MAX_KEY_SIZE: usize = 64;
/// Default byte cap on back-end values.
pub const DEFAULT_MAX_VAL_SIZE: usize = 1024;
/// Default slot count.
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

/// Type descriptor registered for `type=shm`.
pub static DESCRIPTOR: BackendDescriptor = BackendDescriptor {
    name: "shm",
    encrypt_by_default: true,
    create: ShmBackend::create,
};

#[derive(Default)]
struct SlotCell {
    occupied: bool,
    key: String,
    value: String,
    /// Absolute expiry, Unix seconds.
    expires_at: u64,
    /// Last read or write, Unix seconds; drives LRU eviction.
    last_access: u64,
}

impl SlotCell {
    fn clear(&mut self) {
        self.occupied = false;
        self.key.clear();
        self.value.clear();
        self.expires_at = 0;
        self.last_access = 0;
    }

    fn expired(&self, now: u64) -> bool {
        self.expires_at <= now
    }
}

struct Slot {
    cell: Mutex<SlotCell>,
}

struct Segment {
    slots: Vec<Slot>,
    /// Serialises slot allocation and eviction; payload access stays on
    /// the per-slot mutexes.
    alloc: Mutex<()>,
}

impl Segment {
    fn new(max_entries: usize) -> Self {
        let slots = (0..max_entries)
            .map(|_| Slot {
                cell: Mutex::new(SlotCell::default()),
            })
            .collect();
        Self {
            slots,
            alloc: Mutex::new(()),
        }
    }
}

/// In-process shared-memory cache back-end.
pub struct ShmBackend {
    max_key_size: usize,
    max_val_size: usize,
    max_entries: usize,
    segment: OnceCell<Segment>,
}

impl ShmBackend {
    /// `create` hook for the type descriptor.
    pub fn create(opts: &CacheOptions) -> CacheResult<Box<dyn CacheBackend>> {
        let max_key_size = opts.get_usize("max_key_size", DEFAULT_MAX_KEY_SIZE)?;
        let max_val_size = opts.get_usize("max_val_size", DEFAULT_MAX_VAL_SIZE)?;
        let max_entries = opts.get_usize("max_entries", DEFAULT_MAX_ENTRIES)?;
        if max_entries == 0 {
            return Err(CacheError::InvalidConfig(
                "max_entries must be at least 1".to_string(),
            ));
        }
        Ok(Box::new(Self {
            max_key_size,
            max_val_size,
            max_entries,
            segment: OnceCell::new(),
        }))
    }

    fn segment(&self) -> CacheResult<&Segment> {
        self.segment.get().ok_or_else(|| {
            CacheError::InvalidConfig("shm cache used before post_config".to_string())
        })
    }

    fn delete(&self, key: &str) -> CacheResult<()> {
        let segment = self.segment()?;
        for slot in &segment.slots {
            let mut cell = slot.cell.lock();
            if cell.occupied && cell.key == key {
                cell.clear();
                break;
            }
        }
        Ok(())
    }
}

impl CacheBackend for ShmBackend {
    fn post_config(&self) -> CacheResult<()> {
        self.segment.get_or_init(|| Segment::new(self.max_entries));
        Ok(())
    }

    fn child_init(&self) -> CacheResult<()> {
        // The arena is inherited by the child as-is; nothing to re-attach.
        Ok(())
    }

    fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let segment = self.segment()?;
        let now = now_secs();
        for slot in &segment.slots {
            let mut cell = slot.cell.lock();
            if !cell.occupied || cell.key != key {
                continue;
            }
            if cell.expired(now) {
                cell.clear();
                return Ok(None);
            }
            cell.last_access = now;
            return Ok(Some(cell.value.clone()));
        }
        Ok(None)
    }

    fn set(&self, key: &str, value: Option<&str>, ttl_s: u64) -> CacheResult<()> {
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
        if value.len() > self.max_val_size {
            return Err(CacheError::SizeLimitExceeded {
                what: "value",
                len: value.len(),
                max: self.max_val_size,
            });
        }

        let segment = self.segment()?;
        let _alloc = segment.alloc.lock();
        let now = now_secs();

        // One pass under the segment lock: an existing slot for this key
        // wins, then the first empty slot, then the LRU victim. Ties on
        // last_access prefer an already-expired slot, then the lowest
        // index, so eviction is deterministic.
        let mut existing = None;
        let mut empty = None;
        let mut victim: Option<(usize, u64, bool)> = None;
        for (idx, slot) in segment.slots.iter().enumerate() {
            let cell = slot.cell.lock();
            if !cell.occupied {
                if empty.is_none() {
                    empty = Some(idx);
                }
                continue;
            }
            if cell.key == key {
                existing = Some(idx);
                break;
            }
            let expired = cell.expired(now);
            let better = match victim {
                None => true,
                Some((_, best_access, best_expired)) => {
                    cell.last_access < best_access
                        || (cell.last_access == best_access && expired && !best_expired)
                }
            };
            if better {
                victim = Some((idx, cell.last_access, expired));
            }
        }

        let idx = match (existing, empty, victim) {
            (Some(idx), _, _) => idx,
            (None, Some(idx), _) => idx,
            (None, None, Some((idx, _, _))) => {
                debug!(slot = idx, "shm cache full, evicting least-recently-used slot");
                idx
            }
            // max_entries >= 1, so one of the arms above always matches.
            (None, None, None) => {
                return Err(CacheError::InvalidConfig(
                    "shm segment has no slots".to_string(),
                ))
            }
        };

        let mut cell = segment.slots[idx].cell.lock();
        cell.occupied = true;
        cell.key = key.to_string();
        cell.value = value.to_string();
        cell.expires_at = now + ttl_s;
        cell.last_access = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(options: &str) -> ShmBackend {
        let opts = CacheOptions::parse(options).unwrap();
        let max_key_size = opts.get_usize("max_key_size", DEFAULT_MAX_KEY_SIZE).unwrap();
        let max_val_size = opts.get_usize("max_val_size", DEFAULT_MAX_VAL_SIZE).unwrap();
        let max_entries = opts.get_usize("max_entries", DEFAULT_MAX_ENTRIES).unwrap();
        let b = ShmBackend {
            max_key_size,
            max_val_size,
            max_entries,
            segment: OnceCell::new(),
        };
        b.post_config().unwrap();
        b
    }

    fn stamp(b: &ShmBackend, idx: usize, last_access: u64, expires_at: u64) {
        let segment = b.segment.get().unwrap();
        let mut cell = segment.slots[idx].cell.lock();
        cell.last_access = last_access;
        cell.expires_at = expires_at;
    }

    fn key_at(b: &ShmBackend, idx: usize) -> Option<String> {
        let segment = b.segment.get().unwrap();
        let cell = segment.slots[idx].cell.lock();
        cell.occupied.then(|| cell.key.clone())
    }

    #[test]
    fn round_trip_and_overwrite() {
        let b = backend("max_entries=4");
        b.set("k", Some("v1"), 60).unwrap();
        assert_eq!(b.get("k").unwrap().as_deref(), Some("v1"));
        b.set("k", Some("v2"), 60).unwrap();
        assert_eq!(b.get("k").unwrap().as_deref(), Some("v2"));
        // overwrite reuses the slot
        assert_eq!(key_at(&b, 0).as_deref(), Some("k"));
        assert_eq!(key_at(&b, 1), None);
    }

    #[test]
    fn use_before_post_config_fails() {
        let b = ShmBackend {
            max_key_size: DEFAULT_MAX_KEY_SIZE,
            max_val_size: DEFAULT_MAX_VAL_SIZE,
            max_entries: 2,
            segment: OnceCell::new(),
        };
        assert!(b.get("k").is_err());
    }

    #[test]
    fn expired_entry_is_cleared_on_get() {
        let b = backend("max_entries=2");
        b.set("k", Some("v"), 60).unwrap();
        let far_past = 1;
        stamp(&b, 0, far_past, far_past);
        assert_eq!(b.get("k").unwrap(), None);
        assert_eq!(key_at(&b, 0), None);
    }

    #[test]
    fn size_limits_are_hard_failures() {
        let b = backend("max_key_size=8&max_val_size=8&max_entries=2");
        b.set("ok", Some("fine"), 60).unwrap();
        assert!(matches!(
            b.set("key_too_long", Some("v"), 60),
            Err(CacheError::SizeLimitExceeded { what: "key", .. })
        ));
        assert!(matches!(
            b.set("k", Some("value_too_long"), 60),
            Err(CacheError::SizeLimitExceeded { what: "value", .. })
        ));
        // prior entries untouched
        assert_eq!(b.get("ok").unwrap().as_deref(), Some("fine"));
    }

    #[test]
    fn delete_is_idempotent() {
        let b = backend("max_entries=2");
        b.set("k", Some("v"), 60).unwrap();
        b.set("k", None, 0).unwrap();
        b.set("k", None, 0).unwrap();
        b.set("absent", None, 0).unwrap();
        assert_eq!(b.get("k").unwrap(), None);
    }

    #[test]
    fn ttl_zero_deletes() {
        let b = backend("max_entries=2");
        b.set("k", Some("v"), 60).unwrap();
        b.set("k", Some("v"), 0).unwrap();
        assert_eq!(b.get("k").unwrap(), None);
    }

    #[test]
    fn eviction_picks_smallest_last_access() {
        let b = backend("max_entries=3");
        b.set("a", Some("1"), 600).unwrap();
        b.set("b", Some("2"), 600).unwrap();
        b.set("c", Some("3"), 600).unwrap();
        let far = now_secs() + 600;
        stamp(&b, 0, 30, far);
        stamp(&b, 1, 10, far);
        stamp(&b, 2, 20, far);
        b.set("d", Some("4"), 600).unwrap();
        assert_eq!(b.get("b").unwrap(), None);
        assert_eq!(b.get("a").unwrap().as_deref(), Some("1"));
        assert_eq!(b.get("c").unwrap().as_deref(), Some("3"));
    }

    #[test]
    fn eviction_tie_prefers_expired_slot() {
        let b = backend("max_entries=3");
        b.set("a", Some("1"), 600).unwrap();
        b.set("b", Some("2"), 600).unwrap();
        b.set("c", Some("3"), 600).unwrap();
        let far = now_secs() + 600;
        stamp(&b, 0, 100, far);
        stamp(&b, 1, 100, 1); // expired
        stamp(&b, 2, 100, far);
        b.set("d", Some("4"), 600).unwrap();
        assert_eq!(key_at(&b, 1).as_deref(), Some("d"));
    }

    #[test]
    fn eviction_tie_falls_back_to_lowest_index() {
        let b = backend("max_entries=3");
        b.set("a", Some("1"), 600).unwrap();
        b.set("b", Some("2"), 600).unwrap();
        b.set("c", Some("3"), 600).unwrap();
        let far = now_secs() + 600;
        for idx in 0..3 {
            stamp(&b, idx, 100, far);
        }
        b.set("d", Some("4"), 600).unwrap();
        assert_eq!(key_at(&b, 0).as_deref(), Some("d"));
    }

    #[test]
    fn empty_slot_wins_over_eviction() {
        let b = backend("max_entries=3");
        b.set("a", Some("1"), 600).unwrap();
        b.set("b", Some("2"), 600).unwrap();
        b.set("b", None, 0).unwrap();
        b.set("c", Some("3"), 600).unwrap();
        assert_eq!(b.get("a").unwrap().as_deref(), Some("1"));
        assert_eq!(key_at(&b, 1).as_deref(), Some("c"));
    }
}
