use crate::error::{Error, Result};
use deltastore_catalog::TableId;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

/// Value word of a never-used slot.
const PTR_EMPTY: u64 = 0;
/// Value word while a writer is publishing table and key words.
const PTR_INSERTING: u64 = 1;
/// Value word of a removed slot. Tombstones keep probe chains intact
/// and are never reused for new keys.
const PTR_TOMBSTONE: u64 = 2;

const RESERVED_VALUES: u64 = 3;

/// Concurrent open-addressing hash map from (table id, key) to a
/// tagged record word.
///
/// All slot state lives in the value word: empty, inserting,
/// tombstone, or a published record word (an 8-byte-aligned tagged
/// pointer, never colliding with the reserved values). Writers move
/// slots between states with CAS; readers tolerate an in-flight
/// insert by retrying the same slot. A lookup is linearized by the
/// release store/CAS that publishes the value word.
pub struct OpenAddressingTable {
    buckets: Box<[Bucket]>,
    mask: usize,
}

struct Bucket {
    tbl: AtomicU64,
    key: AtomicU64,
    value: AtomicU64,
}

#[inline]
fn hash_of(tbl: TableId, key: u64) -> usize {
    let mut hasher = DefaultHasher::new();
    (tbl, key).hash(&mut hasher);
    hasher.finish() as usize
}

impl OpenAddressingTable {
    /// Create a table with at least `capacity` slots, rounded up to a
    /// power of two. The capacity is fixed for the table's lifetime.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(8).next_power_of_two();
        let buckets = (0..capacity)
            .map(|_| Bucket {
                tbl: AtomicU64::new(0),
                key: AtomicU64::new(0),
                value: AtomicU64::new(PTR_EMPTY),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        OpenAddressingTable {
            buckets,
            mask: capacity - 1,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    /// Lock-free lookup. Returns the published record word.
    pub fn get(&self, tbl: TableId, key: u64) -> Option<u64> {
        let h = hash_of(tbl, key);
        for i in 0..=self.mask {
            let bucket = &self.buckets[(h + i) & self.mask];
            loop {
                match bucket.value.load(Ordering::Acquire) {
                    PTR_EMPTY => return None,
                    PTR_INSERTING => {
                        std::hint::spin_loop();
                        continue;
                    }
                    PTR_TOMBSTONE => break,
                    value => {
                        if bucket.tbl.load(Ordering::Relaxed) == tbl
                            && bucket.key.load(Ordering::Relaxed) == key
                        {
                            return Some(value);
                        }
                        break;
                    }
                }
            }
        }
        None
    }

    /// Insert a record word for a key.
    ///
    /// Returns Ok(true) if the value was placed, Ok(false) if the key
    /// is already occupied and `replace` is false. With `replace` the
    /// existing value is overwritten unconditionally.
    pub fn insert(&self, tbl: TableId, key: u64, value: u64, replace: bool) -> Result<bool> {
        debug_assert!(value >= RESERVED_VALUES);
        let h = hash_of(tbl, key);
        for i in 0..=self.mask {
            let bucket = &self.buckets[(h + i) & self.mask];
            loop {
                match bucket.value.load(Ordering::Acquire) {
                    PTR_EMPTY => {
                        if bucket
                            .value
                            .compare_exchange(
                                PTR_EMPTY,
                                PTR_INSERTING,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_err()
                        {
                            continue;
                        }
                        bucket.tbl.store(tbl, Ordering::Relaxed);
                        bucket.key.store(key, Ordering::Relaxed);
                        bucket.value.store(value, Ordering::Release);
                        return Ok(true);
                    }
                    PTR_INSERTING => {
                        std::hint::spin_loop();
                        continue;
                    }
                    PTR_TOMBSTONE => break,
                    occupied => {
                        if bucket.tbl.load(Ordering::Relaxed) == tbl
                            && bucket.key.load(Ordering::Relaxed) == key
                        {
                            if !replace {
                                return Ok(false);
                            }
                            if bucket
                                .value
                                .compare_exchange(
                                    occupied,
                                    value,
                                    Ordering::AcqRel,
                                    Ordering::Acquire,
                                )
                                .is_ok()
                            {
                                return Ok(true);
                            }
                            continue;
                        }
                        break;
                    }
                }
            }
        }
        Err(Error::HashTableFull)
    }

    /// Atomically swing the value of an existing key from `expected`
    /// to `new`. Returns false if the key is absent or the value no
    /// longer matches.
    pub fn update(&self, tbl: TableId, key: u64, expected: u64, new: u64) -> bool {
        debug_assert!(new >= RESERVED_VALUES);
        self.transition(tbl, key, expected, new)
    }

    /// Tombstone the slot of a key if it still holds `expected`.
    pub fn remove(&self, tbl: TableId, key: u64, expected: u64) -> bool {
        self.transition(tbl, key, expected, PTR_TOMBSTONE)
    }

    fn transition(&self, tbl: TableId, key: u64, expected: u64, new: u64) -> bool {
        let h = hash_of(tbl, key);
        for i in 0..=self.mask {
            let bucket = &self.buckets[(h + i) & self.mask];
            loop {
                match bucket.value.load(Ordering::Acquire) {
                    PTR_EMPTY => return false,
                    PTR_INSERTING => {
                        std::hint::spin_loop();
                        continue;
                    }
                    PTR_TOMBSTONE => break,
                    _ => {
                        if bucket.tbl.load(Ordering::Relaxed) == tbl
                            && bucket.key.load(Ordering::Relaxed) == key
                        {
                            return bucket
                                .value
                                .compare_exchange(
                                    expected,
                                    new,
                                    Ordering::AcqRel,
                                    Ordering::Acquire,
                                )
                                .is_ok();
                        }
                        break;
                    }
                }
            }
        }
        false
    }
}
