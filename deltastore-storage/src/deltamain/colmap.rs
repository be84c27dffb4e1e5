use crate::buffer::PAGE_SIZE;
use crate::deltamain::{MainPage, MAIN_ENTRY_SIZE, MAIN_PAGE_HEADER_SIZE};
use deltastore_catalog::tuple::align4;
use deltastore_catalog::Schema;

#[inline]
pub(crate) fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Per-row, per-var-field pointer into the page heap. `offset` is the
/// distance from the page end down to the field's 4-byte size prefix;
/// `prefix` duplicates the first data bytes so scans can short-cut
/// comparisons without touching the heap.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ColumnMapHeapEntry {
    pub offset: u32,
    pub prefix: [u8; 4],
}

impl ColumnMapHeapEntry {
    #[inline]
    pub fn new(offset: u32, data: &[u8]) -> Self {
        let mut prefix = [0u8; 4];
        let n = data.len().min(4);
        prefix[..n].copy_from_slice(&data[..n]);
        ColumnMapHeapEntry { offset, prefix }
    }
}

/// Precomputed layout facts of column-map pages for one schema.
///
/// Column-map page regions after the shared header, entries and
/// sizes:
///
/// |--------------|------------------------------------------------|
/// | region       | content                                        |
/// |--------------|------------------------------------------------|
/// | record data  | per fixed field: count contiguous values       |
/// | heap entries | per var field: count ColumnMapHeapEntry        |
/// | free         |                                                |
/// | heap data    | var blocks, filled from the page end downward  |
/// |--------------|------------------------------------------------|
///
/// The record data and the heap grow toward each other and must never
/// overlap; `max_data_size` bounds the accounted bytes so they cannot.
pub struct ColumnMapContext {
    /// Fixed field lengths in layout order.
    pub fixed_lens: Vec<usize>,
    pub fixed_size: usize,
    pub var_count: usize,
    /// Bytes a row costs besides its data: main entry, size word and
    /// one heap entry per var field.
    pub entry_overhead: usize,
    /// Maximum rows of any page under this schema, reached when no
    /// row carries var data.
    pub capacity: usize,
    pub max_data_size: usize,
}

impl ColumnMapContext {
    pub fn new(schema: &Schema) -> Self {
        let fixed_lens: Vec<usize> = schema.fixed_fields().iter().map(|f| f.len).collect();
        let fixed_size = schema.fixed_len();
        let var_count = schema.var_field_count();
        let entry_overhead = MAIN_ENTRY_SIZE + 4 + 8 * var_count;
        let max_data_size = PAGE_SIZE - 64;
        let capacity = max_data_size / (entry_overhead + fixed_size);
        ColumnMapContext {
            fixed_lens,
            fixed_size,
            var_count,
            entry_overhead,
            capacity,
            max_data_size,
        }
    }

    /// Offset of the columnar fixed-field region for a page holding
    /// `count` rows.
    #[inline]
    pub fn record_data_offset(count: usize) -> usize {
        align8(MAIN_PAGE_HEADER_SIZE + count * (MAIN_ENTRY_SIZE + 4))
    }

    /// Offset of the heap entry arrays for a page holding `count`
    /// rows.
    #[inline]
    pub fn heap_entries_offset(&self, count: usize) -> usize {
        align8(Self::record_data_offset(count) + self.fixed_size * count)
    }

    /// Byte offset of the var region inside a tuple.
    #[inline]
    pub fn var_block_offset(&self) -> usize {
        align4(self.fixed_size)
    }

    /// Heap entries of one var field, indexed by row.
    #[inline]
    pub fn heap_entries(&self, page: MainPage, field: usize) -> &'static [ColumnMapHeapEntry] {
        debug_assert!(field < self.var_count);
        let count = page.count();
        let base = page.0 + self.heap_entries_offset(count) + field * count * 8;
        unsafe { std::slice::from_raw_parts(base as *const ColumnMapHeapEntry, count) }
    }

    /// Reassemble row `idx` into tuple wire bytes: gather the fixed
    /// columns, then copy the row's contiguous var block out of the
    /// heap.
    pub fn materialize(&self, page: MainPage, idx: usize) -> Vec<u8> {
        let count = page.count();
        let size = page.sizes()[idx] as usize;
        debug_assert!(size > 0, "cannot materialize a tombstone");
        let mut out = vec![0u8; size];
        let rd = page.0 + Self::record_data_offset(count);
        let mut col_off = 0;
        for &len in &self.fixed_lens {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    (rd + count * col_off + idx * len) as *const u8,
                    out.as_mut_ptr().add(col_off),
                    len,
                );
            }
            col_off += len;
        }
        if self.var_count > 0 {
            let var_off = self.var_block_offset();
            let span = size - var_off;
            let he = self.heap_entries(page, 0)[idx];
            let src = page.end() - he.offset as usize;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src as *const u8,
                    out.as_mut_ptr().add(var_off),
                    span,
                );
            }
        }
        out
    }
}
