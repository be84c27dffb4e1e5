use crate::buffer::{PageManager, PagePtr, PAGE_SIZE};
use crate::commit::Version;
use crate::deltamain::{
    skip_key, InsertEntry, MainEntry, MainPage, MainPageHeader, NewestPtr, NewestRef,
    PageLayout, PageModifier, PointerAction, RecordRef, UpdateChainIter, UpdateEntry,
    INVALID_WORD, MAIN_ENTRY_SIZE, MAIN_PAGE_HEADER_SIZE,
};
use crate::error::{Error, Result};
use crate::index::OpenAddressingTable;
use deltastore_catalog::TableId;

/// Space one row costs besides its payload: main entry, size word and
/// offset word.
const ROW_OVERHEAD: usize = MAIN_ENTRY_SIZE + 4 + 4;

/// Row-store page regions after the shared header, entries and sizes:
///
/// |-----------|----------------------------------------|
/// | region    | content                                |
/// |-----------|----------------------------------------|
/// | offsets   | count x u32, page-relative payload pos |
/// | free      |                                        |
/// | payloads  | tuple bytes, filled from the page end  |
/// |-----------|----------------------------------------|
pub struct RowStoreContext {
    pub max_data_size: usize,
}

impl Default for RowStoreContext {
    #[inline]
    fn default() -> Self {
        RowStoreContext::new()
    }
}

impl RowStoreContext {
    #[inline]
    pub fn new() -> Self {
        RowStoreContext {
            max_data_size: PAGE_SIZE - 64,
        }
    }

    #[inline]
    fn offsets_offset(count: usize) -> usize {
        MainPage::sizes_offset(count) + count * 4
    }

    #[inline]
    pub fn offsets(page: MainPage) -> &'static [u32] {
        unsafe {
            std::slice::from_raw_parts(
                (page.0 + Self::offsets_offset(page.count())) as *const u32,
                page.count(),
            )
        }
    }

    /// Copy row `idx` out of the page. Payloads are stored
    /// contiguously in wire layout, so this is a plain slice copy.
    #[inline]
    pub fn materialize(&self, page: MainPage, idx: usize) -> Vec<u8> {
        let size = page.sizes()[idx] as usize;
        let off = Self::offsets(page)[idx] as usize;
        debug_assert!(off + size <= PAGE_SIZE);
        unsafe { std::slice::from_raw_parts((page.0 + off) as *const u8, size).to_vec() }
    }
}

/// Rewrites row-store main pages: folds pending deltas in, drops
/// versions below the low-water mark and appends records still living
/// in the insert log.
pub struct RowStorePageModifier<'a> {
    ctx: &'a RowStoreContext,
    page_manager: &'static PageManager,
    index: &'a OpenAddressingTable,
    table_id: TableId,
    min_version: Version,
    fill_page: PagePtr,
    /// Rows written, including the record currently in progress.
    fill_idx: usize,
    /// Rows committed through the last completed record.
    fill_end_idx: usize,
    /// Page-relative payload cursor, growing downward.
    heap_top: usize,
    fill_size: usize,
    sizes_buf: Vec<u32>,
    offsets_buf: Vec<u32>,
    pointer_actions: Vec<PointerAction>,
    page_list: Vec<PagePtr>,
    retired: Vec<PagePtr>,
}

impl<'a> RowStorePageModifier<'a> {
    pub fn new(
        ctx: &'a RowStoreContext,
        page_manager: &'static PageManager,
        index: &'a OpenAddressingTable,
        table_id: TableId,
        min_version: Version,
    ) -> Result<Self> {
        let fill_page = page_manager.alloc()?;
        Ok(RowStorePageModifier {
            ctx,
            page_manager,
            index,
            table_id,
            min_version,
            fill_page,
            fill_idx: 0,
            fill_end_idx: 0,
            heap_top: PAGE_SIZE,
            fill_size: 0,
            sizes_buf: vec![],
            offsets_buf: vec![],
            pointer_actions: vec![],
            page_list: vec![],
            retired: vec![],
        })
    }

}

impl<'a> PageModifier for RowStorePageModifier<'a> {
    fn clean(&mut self, page: PagePtr) -> Result<bool> {
        let main = MainPage::from_page(page);
        if !main.needs_cleaning(self.min_version) {
            self.page_list.push(page);
            return Ok(false);
        }
        let entries = main.entries();
        let sizes = main.sizes();
        let offsets = RowStoreContext::offsets(main);
        let count = entries.len();
        let mut i = 0;
        while i < count {
            let base_idx = i;
            'record: loop {
                debug_assert_eq!(self.fill_idx, self.fill_end_idx);
                i = base_idx;
                let key = entries[base_idx].key;
                let newest = entries[base_idx].newest.load();
                let mut was_delete = false;
                if newest != 0 {
                    let head = match NewestPtr::decode(newest) {
                        NewestRef::Delta(head) => head,
                        NewestRef::None => unreachable!(),
                        // already rebuilt or dropped by an earlier
                        // interrupted pass; the record no longer
                        // lives in this page.
                        NewestRef::Main(_) | NewestRef::Invalid => {
                            i = skip_key(entries, base_idx, key);
                            break 'record;
                        }
                    };
                    let lowest = match self.process_updates(head, &mut was_delete)? {
                        None => {
                            self.flush()?;
                            continue 'record;
                        }
                        Some(lowest) => lowest,
                    };
                    // All observable versions came from the update
                    // chain; the main rows are fully shadowed.
                    if lowest <= self.min_version {
                        if self.fill_idx == self.fill_end_idx {
                            if entries[base_idx]
                                .newest
                                .compare_exchange(newest, INVALID_WORD)
                                .is_err()
                            {
                                continue 'record;
                            }
                            self.index.remove(
                                self.table_id,
                                key,
                                NewestPtr::encode_main(&entries[base_idx]),
                            );
                        } else {
                            self.push_pointer_action(&entries[base_idx], newest);
                            self.fill_end_idx = self.fill_idx;
                        }
                        i = skip_key(entries, base_idx, key);
                        break 'record;
                    }
                    // skip main rows already superseded by the chain.
                    while i < count && entries[i].key == key && entries[i].version >= lowest {
                        i += 1;
                    }
                }
                // copy surviving main rows down to the floor version.
                while i < count && entries[i].key == key {
                    let v = entries[i].version;
                    if was_delete {
                        debug_assert!(sizes[i] != 0, "only a data row can follow a delete");
                        if v < self.min_version {
                            // the delete and the row it shadows are
                            // both unobservable; drop the pair.
                            self.pop_row();
                            was_delete = false;
                            break;
                        }
                    }
                    if sizes[i] == 0 {
                        if v <= self.min_version {
                            break;
                        }
                        if !self.try_account(ROW_OVERHEAD) {
                            self.flush()?;
                            continue 'record;
                        }
                        self.emit_row(key, v, None);
                        was_delete = true;
                    } else {
                        let size = sizes[i] as usize;
                        if !self.try_account(ROW_OVERHEAD + size) {
                            self.flush()?;
                            continue 'record;
                        }
                        let src = unsafe {
                            std::slice::from_raw_parts(
                                (main.0 + offsets[i] as usize) as *const u8,
                                size,
                            )
                        };
                        self.emit_row(key, v, Some(src));
                        was_delete = false;
                    }
                    if v <= self.min_version {
                        break;
                    }
                    i += 1;
                }
                debug_assert!(!was_delete, "last row of a record must not be a delete");
                if self.fill_idx == self.fill_end_idx {
                    if entries[base_idx]
                        .newest
                        .compare_exchange(newest, INVALID_WORD)
                        .is_err()
                    {
                        continue 'record;
                    }
                    self.index.remove(
                        self.table_id,
                        key,
                        NewestPtr::encode_main(&entries[base_idx]),
                    );
                } else {
                    self.push_pointer_action(&entries[base_idx], newest);
                    self.fill_end_idx = self.fill_idx;
                }
                i = skip_key(entries, i.max(base_idx), key);
                break 'record;
            }
        }
        self.retired.push(page);
        Ok(true)
    }

    fn keep_page(&mut self, page: PagePtr) {
        self.page_list.push(page);
    }

    fn append(&mut self, ie: &'static InsertEntry) -> Result<bool> {
        'record: loop {
            debug_assert_eq!(self.fill_idx, self.fill_end_idx);
            let newest = ie.newest.load();
            let mut was_delete = false;
            match NewestPtr::decode(newest) {
                NewestRef::Main(_) | NewestRef::Invalid => return Ok(false),
                NewestRef::Delta(head) => {
                    let lowest = match self.process_updates(head, &mut was_delete)? {
                        None => {
                            self.flush()?;
                            continue 'record;
                        }
                        Some(lowest) => lowest,
                    };
                    if was_delete && ie.version < self.min_version {
                        // delete above, insert data below the water:
                        // the pair cancels out.
                        self.pop_row();
                    } else if lowest > self.min_version.max(ie.version) && !ie.is_reverted() {
                        let data = ie.data();
                        if !self.try_account(ROW_OVERHEAD + data.len()) {
                            self.flush()?;
                            continue 'record;
                        }
                        self.emit_row(ie.key, ie.version, Some(data));
                    }
                    if self.fill_idx == self.fill_end_idx {
                        if ie.newest.compare_exchange(newest, INVALID_WORD).is_err() {
                            continue 'record;
                        }
                        self.index
                            .remove(self.table_id, ie.key, RecordRef::encode_log(ie));
                        return Ok(false);
                    }
                }
                NewestRef::None => {
                    if ie.is_reverted() {
                        if ie.newest.compare_exchange(0, INVALID_WORD).is_err() {
                            continue 'record;
                        }
                        self.index
                            .remove(self.table_id, ie.key, RecordRef::encode_log(ie));
                        return Ok(false);
                    }
                    let data = ie.data();
                    if !self.try_account(ROW_OVERHEAD + data.len()) {
                        self.flush()?;
                        continue 'record;
                    }
                    self.emit_row(ie.key, ie.version, Some(data));
                }
            }
            let desired =
                unsafe { &*(self.fill_entry_ptr(self.fill_end_idx) as *const MainEntry) };
            self.pointer_actions.push(PointerAction {
                target: &ie.newest,
                expected: newest,
                desired,
                key: ie.key,
                index_expected: RecordRef::encode_log(ie),
            });
            self.fill_end_idx = self.fill_idx;
            return Ok(true);
        }
    }

    fn finish(mut self) -> (Vec<PagePtr>, Vec<PagePtr>) {
        if self.fill_end_idx > 0 {
            self.flush_fill_page();
        } else {
            self.page_manager.free_local(self.fill_page);
        }
        (std::mem::take(&mut self.page_list), std::mem::take(&mut self.retired))
    }
}

impl<'a> RowStorePageModifier<'a> {
    fn process_updates(
        &mut self,
        head: &'static UpdateEntry,
        was_delete: &mut bool,
    ) -> Result<Option<Version>> {
        let mut iter = UpdateChainIter::new(head);
        while let Some(e) = iter.next() {
            if *was_delete {
                debug_assert!(!e.is_delete(), "only a data entry can follow a delete");
                if e.version < self.min_version {
                    self.pop_row();
                    *was_delete = false;
                    break;
                }
            }
            if e.is_delete() {
                // the version this delete shadows cannot be read;
                // neither the delete nor anything below survives.
                if e.version <= self.min_version {
                    break;
                }
                if !self.try_account(ROW_OVERHEAD) {
                    return Ok(None);
                }
                self.emit_row(e.key, e.version, None);
                *was_delete = true;
            } else {
                let data = e.data();
                if !self.try_account(ROW_OVERHEAD + data.len()) {
                    return Ok(None);
                }
                self.emit_row(e.key, e.version, Some(data));
                *was_delete = false;
            }
            if e.version <= self.min_version {
                break;
            }
        }
        Ok(Some(iter.lowest_version()))
    }

    #[inline]
    fn fill_entry_ptr(&self, idx: usize) -> *mut MainEntry {
        (self.fill_page.addr() + MAIN_PAGE_HEADER_SIZE + idx * MAIN_ENTRY_SIZE)
            as *mut MainEntry
    }

    #[inline]
    fn try_account(&mut self, size: usize) -> bool {
        if self.fill_size + size > self.ctx.max_data_size {
            return false;
        }
        self.fill_size += size;
        true
    }

    fn emit_row(&mut self, key: u64, version: Version, data: Option<&[u8]>) {
        unsafe {
            let e = self.fill_entry_ptr(self.fill_idx);
            (*e).key = key;
            (*e).version = version;
            // the newest slot stays zero until a later compaction.
        }
        match data {
            Some(d) => {
                self.heap_top -= d.len();
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        d.as_ptr(),
                        (self.fill_page.addr() + self.heap_top) as *mut u8,
                        d.len(),
                    );
                }
                self.sizes_buf.push(d.len() as u32);
                self.offsets_buf.push(self.heap_top as u32);
            }
            None => {
                self.sizes_buf.push(0);
                self.offsets_buf.push(self.heap_top as u32);
            }
        }
        self.fill_idx += 1;
    }

    /// Drop the last emitted row of the record in progress. Only ever
    /// called on a delete row, which carries no payload.
    fn pop_row(&mut self) {
        debug_assert!(self.fill_idx > self.fill_end_idx);
        debug_assert_eq!(*self.sizes_buf.last().unwrap(), 0);
        self.sizes_buf.pop();
        self.offsets_buf.pop();
        self.fill_idx -= 1;
        self.fill_size -= ROW_OVERHEAD;
    }

    fn push_pointer_action(&mut self, entry: &'static MainEntry, expected: u64) {
        let desired =
            unsafe { &*(self.fill_entry_ptr(self.fill_end_idx) as *const MainEntry) };
        self.pointer_actions.push(PointerAction {
            target: &entry.newest,
            expected,
            desired,
            key: entry.key,
            index_expected: NewestPtr::encode_main(entry),
        });
    }

    /// Seal the current fill page and install a fresh one. Fails if a
    /// single record exceeds the page data budget.
    fn flush(&mut self) -> Result<()> {
        if self.fill_end_idx == 0 {
            return Err(Error::InvalidArgument);
        }
        let new_page = self.page_manager.alloc()?;
        self.flush_fill_page();
        self.fill_page = new_page;
        self.fill_idx = 0;
        self.fill_end_idx = 0;
        self.heap_top = PAGE_SIZE;
        self.fill_size = 0;
        self.sizes_buf.clear();
        self.offsets_buf.clear();
        Ok(())
    }

    /// Finalize the fill page layout and execute the deferred pointer
    /// and index rewrites for the records it contains.
    fn flush_fill_page(&mut self) {
        debug_assert!(self.fill_end_idx > 0);
        let count = self.fill_end_idx;
        let base = self.fill_page.addr();
        unsafe {
            let header = base as *mut MainPageHeader;
            (*header).layout = PageLayout::RowStore as u32;
            (*header).count = count as u32;
            let sizes = (base + MainPage::sizes_offset(count)) as *mut u32;
            std::ptr::copy_nonoverlapping(self.sizes_buf.as_ptr(), sizes, count);
            let offsets = (base + RowStoreContext::offsets_offset(count)) as *mut u32;
            std::ptr::copy_nonoverlapping(self.offsets_buf.as_ptr(), offsets, count);
        }
        self.page_list.push(self.fill_page);
        for action in self.pointer_actions.drain(..) {
            action.execute(self.index, self.table_id);
        }
    }
}
