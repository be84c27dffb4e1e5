use crate::deltamain::PageLayout;
use byte_unit::Byte;
use serde::{Deserialize, Serialize};

pub const DEFAULT_TOTAL_MEMORY: Byte = Byte::from_u64(256 * 1024 * 1024);
pub const DEFAULT_HASH_CAPACITY: usize = 1 << 20;
pub const DEFAULT_GC_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_MAX_SCANS: usize = 8;
pub const DEFAULT_PAGE_LAYOUT: PageLayout = PageLayout::ColumnMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    // Total bytes reserved for the page pool.
    pub total_memory: Byte,
    // Slots of each table's hash index. The index does not grow
    // online; size it for the expected key count.
    pub hash_capacity: usize,
    // Interval of the background garbage collection thread.
    pub gc_interval_ms: u64,
    // Concurrent scan slots. Scans beyond the limit fail with
    // server-overload.
    pub max_scans: usize,
    // Main page layout used for newly created tables.
    pub page_layout: PageLayout,
}

impl StorageConfig {
    #[inline]
    pub fn total_memory<T>(mut self, total_memory: T) -> Self
    where
        Byte: From<T>,
    {
        self.total_memory = Byte::from(total_memory);
        self
    }

    #[inline]
    pub fn hash_capacity(mut self, hash_capacity: usize) -> Self {
        self.hash_capacity = hash_capacity;
        self
    }

    #[inline]
    pub fn gc_interval_ms(mut self, gc_interval_ms: u64) -> Self {
        self.gc_interval_ms = gc_interval_ms;
        self
    }

    #[inline]
    pub fn max_scans(mut self, max_scans: usize) -> Self {
        self.max_scans = max_scans;
        self
    }

    #[inline]
    pub fn page_layout(mut self, page_layout: PageLayout) -> Self {
        self.page_layout = page_layout;
        self
    }
}

impl Default for StorageConfig {
    #[inline]
    fn default() -> Self {
        StorageConfig {
            total_memory: DEFAULT_TOTAL_MEMORY,
            hash_capacity: DEFAULT_HASH_CAPACITY,
            gc_interval_ms: DEFAULT_GC_INTERVAL_MS,
            max_scans: DEFAULT_MAX_SCANS,
            page_layout: DEFAULT_PAGE_LAYOUT,
        }
    }
}
