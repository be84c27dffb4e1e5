use crate::error::{Error, Result};
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

pub type Version = u64;

pub const MAX_VERSION: Version = u64::MAX;

/// The MVCC visibility set handed to every operation.
///
/// A version v is visible iff v <= version and v is not in the
/// in-flight set. The in-flight bitset covers (base_version, version];
/// versions at or below base_version are always committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDescriptor {
    lowest_active_version: Version,
    base_version: Version,
    version: Version,
    in_flight: Vec<u8>,
}

impl SnapshotDescriptor {
    #[inline]
    pub fn new(
        lowest_active_version: Version,
        base_version: Version,
        version: Version,
        in_flight: Vec<u8>,
    ) -> Result<Self> {
        if base_version > version {
            return Err(Error::InvalidSnapshot);
        }
        let bits = version - base_version;
        if (in_flight.len() as u64) < bits.div_ceil(8) {
            return Err(Error::InvalidSnapshot);
        }
        Ok(SnapshotDescriptor {
            lowest_active_version,
            base_version,
            version,
            in_flight,
        })
    }

    /// A snapshot that sees every version up to and including
    /// `version`, with nothing in flight.
    #[inline]
    pub fn latest_committed(version: Version) -> Self {
        SnapshotDescriptor {
            lowest_active_version: version,
            base_version: version,
            version,
            in_flight: vec![],
        }
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    #[inline]
    pub fn base_version(&self) -> Version {
        self.base_version
    }

    #[inline]
    pub fn lowest_active_version(&self) -> Version {
        self.lowest_active_version
    }

    /// Whether `v` was in flight when this snapshot was taken.
    #[inline]
    pub fn in_flight(&self, v: Version) -> bool {
        if v <= self.base_version || v > self.version {
            return false;
        }
        let bit = v - self.base_version - 1;
        (self.in_flight[(bit / 8) as usize] >> (bit % 8)) & 1 != 0
    }

    #[inline]
    pub fn is_visible(&self, v: Version) -> bool {
        v <= self.version && !self.in_flight(v)
    }

    /// Wire format: 8B lowest active, 8B base, 8B version, 4B
    /// in-flight length in bits, 4B padding, bitset bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let bits = self.version - self.base_version;
        let byte_len = bits.div_ceil(8) as usize;
        let mut out = Vec::with_capacity(32 + byte_len);
        out.extend_from_slice(&self.lowest_active_version.to_le_bytes());
        out.extend_from_slice(&self.base_version.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&(bits as u32).to_le_bytes());
        out.extend_from_slice(&[0u8; 4]);
        out.extend_from_slice(&self.in_flight[..byte_len]);
        out
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < 32 {
            return Err(Error::InvalidFormat);
        }
        let lowest = u64::from_le_bytes(data[0..8].try_into().unwrap());
        let base = u64::from_le_bytes(data[8..16].try_into().unwrap());
        let version = u64::from_le_bytes(data[16..24].try_into().unwrap());
        let bits = u32::from_le_bytes(data[24..28].try_into().unwrap()) as u64;
        if base > version || bits != version - base {
            return Err(Error::InvalidFormat);
        }
        let byte_len = bits.div_ceil(8) as usize;
        if data.len() < 32 + byte_len {
            return Err(Error::InvalidFormat);
        }
        SnapshotDescriptor::new(lowest, base, version, data[32..32 + byte_len].to_vec())
    }
}

/// Ordered (version, base version) pairs of active transactions.
///
/// Removals of a non-minimal version are cached in a deleted set so
/// retrieving the minimum stays cheap. Bases are non-decreasing in
/// start order, so the front entry also carries the minimal base.
#[derive(Default)]
struct ActiveVersionList {
    active: VecDeque<(Version, Version)>,
    deleted: HashSet<Version>,
}

impl ActiveVersionList {
    /// Insert a new version. The value must be larger than any stored
    /// one.
    #[inline]
    fn insert(&mut self, version: Version, base: Version) {
        debug_assert!(self.active.is_empty() || self.active.back().unwrap().0 < version);
        debug_assert!(self.active.is_empty() || self.active.back().unwrap().1 <= base);
        self.active.push_back((version, base));
    }

    #[inline]
    fn min(&self) -> Option<(Version, Version)> {
        self.active.front().copied()
    }

    /// Remove a version from the list, draining any cached deletions
    /// that become minimal.
    #[inline]
    fn remove(&mut self, version: Version) {
        debug_assert!(!self.active.is_empty());
        let first = self.active.front().unwrap().0;
        if first == version {
            self.active.pop_front();
            while let Some(first) = self.active.front() {
                if !self.deleted.remove(&first.0) {
                    return;
                }
                self.active.pop_front();
            }
            debug_assert!(self.deleted.is_empty());
            return;
        }
        let res = self.deleted.insert(version);
        debug_assert!(res);
    }

    #[inline]
    fn for_each_active<F: FnMut(Version)>(&self, mut f: F) {
        for &(v, _) in &self.active {
            if !self.deleted.contains(&v) {
                f(v);
            }
        }
    }
}

/// Issues monotonically increasing versions, tracks active snapshots
/// and publishes the garbage collection low-water mark.
pub struct CommitManager {
    /// Last issued version.
    version: CachePadded<AtomicU64>,
    /// The garbage collection low-water mark: every version strictly
    /// below it is stably visible to (or stably hidden from) all
    /// current and future snapshots, so compaction may fold versions
    /// below it. Maintained as the minimal base version over active
    /// transactions: a snapshot's own base is the point below which
    /// its view can never change. Never decreases; equals the last
    /// issued version when no transaction is active.
    lowest_active: CachePadded<AtomicU64>,
    active: Mutex<ActiveVersionList>,
}

impl Default for CommitManager {
    #[inline]
    fn default() -> Self {
        CommitManager::new()
    }
}

impl CommitManager {
    #[inline]
    pub fn new() -> Self {
        CommitManager {
            version: CachePadded::new(AtomicU64::new(0)),
            lowest_active: CachePadded::new(AtomicU64::new(0)),
            active: Mutex::new(ActiveVersionList::default()),
        }
    }

    /// Start a transaction: draw the next version and snapshot the
    /// set of versions still in flight.
    pub fn start_tx(&self) -> SnapshotDescriptor {
        let mut g = self.active.lock();
        // the counter only moves under the lock, so list order
        // matches version order.
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let base_version = match g.min() {
            Some((min_version, _)) => min_version - 1,
            None => version - 1,
        };
        let bits = version - base_version;
        let mut in_flight = vec![0u8; bits.div_ceil(8) as usize];
        g.for_each_active(|v| {
            debug_assert!(v > base_version && v < version);
            let bit = v - base_version - 1;
            in_flight[(bit / 8) as usize] |= 1 << (bit % 8);
        });
        g.insert(version, base_version);
        let lowest = g.min().unwrap().1;
        self.lowest_active.store(lowest, Ordering::SeqCst);
        SnapshotDescriptor {
            lowest_active_version: lowest,
            base_version,
            version,
            in_flight,
        }
    }

    /// Commit a transaction: its version becomes visible to all
    /// snapshots taken afterwards.
    pub fn commit(&self, version: Version) {
        let mut g = self.active.lock();
        g.remove(version);
        let lowest = match g.min() {
            Some((_, min_base)) => min_base,
            None => self.version.load(Ordering::SeqCst),
        };
        self.lowest_active.store(lowest, Ordering::SeqCst);
    }

    /// Abort a transaction. The caller must have reverted all log
    /// entries written under this version first; afterwards the
    /// version is indistinguishable from a committed one that wrote
    /// nothing.
    #[inline]
    pub fn abort(&self, version: Version) {
        self.commit(version);
    }

    /// The garbage collection low-water mark.
    #[inline]
    pub fn lowest_active_version(&self) -> Version {
        self.lowest_active.load(Ordering::SeqCst)
    }

    /// Last issued version.
    #[inline]
    pub fn current_version(&self) -> Version {
        self.version.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_visibility_basic() {
        let snap = SnapshotDescriptor::latest_committed(10);
        assert!(snap.is_visible(1));
        assert!(snap.is_visible(10));
        assert!(!snap.is_visible(11));
    }

    #[test]
    fn test_commit_manager_in_flight_isolation() {
        let cm = CommitManager::new();
        let s1 = cm.start_tx();
        let s2 = cm.start_tx();
        assert_eq!(s1.version(), 1);
        assert_eq!(s2.version(), 2);
        // s2 must not see s1's still-uncommitted version.
        assert!(s2.in_flight(1));
        assert!(!s2.is_visible(1));
        // s2 sees its own writes.
        assert!(s2.is_visible(2));
        cm.commit(1);
        // the old snapshot keeps its view.
        assert!(!s2.is_visible(1));
        // a fresh snapshot sees the committed version.
        let s3 = cm.start_tx();
        assert!(s3.is_visible(1));
        assert!(!s3.is_visible(2));
        cm.commit(2);
        cm.commit(3);
    }

    #[test]
    fn test_lowest_active_monotone() {
        let cm = CommitManager::new();
        let mut last = 0;
        let s1 = cm.start_tx();
        let s2 = cm.start_tx();
        let s3 = cm.start_tx();
        for v in [s2.version(), s1.version(), s3.version()] {
            cm.commit(v);
            let lowest = cm.lowest_active_version();
            assert!(lowest >= last);
            last = lowest;
        }
        // no active transactions: lowest equals the highest issued.
        assert_eq!(cm.lowest_active_version(), 3);
    }

    #[test]
    fn test_lowest_active_held_by_oldest_base() {
        let cm = CommitManager::new();
        let s1 = cm.start_tx();
        let s2 = cm.start_tx();
        let s3 = cm.start_tx();
        assert_eq!(s1.base_version(), 0);
        assert_eq!(s2.base_version(), 0);
        assert_eq!(s3.base_version(), 0);
        cm.commit(s2.version());
        // s1 and s3 are still active; nothing above their common base
        // may be folded yet.
        assert_eq!(cm.lowest_active_version(), 0);
        cm.commit(s1.version());
        assert_eq!(cm.lowest_active_version(), 0);
        cm.commit(s3.version());
        assert_eq!(cm.lowest_active_version(), 3);
        // a transaction started now observes a clean base.
        let s4 = cm.start_tx();
        assert_eq!(s4.base_version(), 3);
        assert_eq!(cm.lowest_active_version(), 3);
        cm.commit(s4.version());
        assert_eq!(cm.lowest_active_version(), 4);
    }

    #[test]
    fn test_descriptor_serde_round_trip() {
        let cm = CommitManager::new();
        let mut snaps = vec![];
        for _ in 0..20 {
            snaps.push(cm.start_tx());
        }
        // commit a few in the middle so bitsets are non-trivial.
        for v in [3u64, 7, 11] {
            cm.commit(v);
        }
        let snap = cm.start_tx();
        assert!(snap.in_flight(1));
        assert!(!snap.in_flight(3));
        let bytes = snap.serialize();
        let back = SnapshotDescriptor::deserialize(&bytes).unwrap();
        assert_eq!(back, snap);
        for v in 1..=snap.version() {
            assert_eq!(back.is_visible(v), snap.is_visible(v));
        }
    }

    #[test]
    fn test_descriptor_deserialize_invalid() {
        assert!(SnapshotDescriptor::deserialize(&[0u8; 8]).is_err());
        let snap = SnapshotDescriptor::latest_committed(5);
        let mut bytes = snap.serialize();
        // corrupt the bit length.
        bytes[24] = 0xFF;
        assert!(SnapshotDescriptor::deserialize(&bytes).is_err());
    }

    #[test]
    fn test_descriptor_new_validation() {
        assert!(SnapshotDescriptor::new(1, 5, 4, vec![]).is_err());
        assert!(SnapshotDescriptor::new(1, 0, 9, vec![0]).is_err());
        assert!(SnapshotDescriptor::new(1, 0, 9, vec![0, 0]).is_ok());
    }
}
