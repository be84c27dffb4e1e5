use crate::buffer::{PageManager, PagePtr, PAGE_SIZE};
use crate::commit::Version;
use crate::deltamain::colmap::{ColumnMapContext, ColumnMapHeapEntry};
use crate::deltamain::{
    skip_key, InsertEntry, MainEntry, MainPage, MainPageHeader, NewestPtr, NewestRef,
    PageLayout, PageModifier, PointerAction, RecordRef, UpdateChainIter, UpdateEntry,
    INVALID_WORD, MAIN_ENTRY_SIZE, MAIN_PAGE_HEADER_SIZE,
};
use crate::error::{Error, Result};
use crate::index::OpenAddressingTable;
use deltastore_catalog::TableId;

/// A deferred directive to copy a contiguous row range from a source
/// page into the fill page. `offset_correction` rebases heap offsets
/// when the fill heap has grown relative to the source; zero means
/// the heap entry array can be copied with a single memcpy.
struct CleanAction {
    page: usize,
    start_idx: usize,
    end_idx: usize,
    offset_correction: i64,
}

/// Rebuilds column-map pages.
///
/// For every record the modifier folds the pending update chain into
/// a columnar scratch page (the update page), batches untouched spans
/// of the source page into clean actions, and materializes the fill
/// page in one pass at flush time: one memcpy per (field x action)
/// pair. Var-size heap data is copied lazily when an action is
/// enqueued so its offset correction is known at creation time.
pub struct ColumnMapPageModifier<'a> {
    ctx: &'a ColumnMapContext,
    page_manager: &'static PageManager,
    index: &'a OpenAddressingTable,
    table_id: TableId,
    min_version: Version,
    update_page: PagePtr,
    update_start_idx: usize,
    update_end_idx: usize,
    update_idx: usize,
    fill_page: PagePtr,
    /// Absolute heap cursor of the fill page, growing downward.
    fill_heap: usize,
    fill_end_idx: usize,
    fill_idx: usize,
    fill_size: usize,
    clean_actions: Vec<CleanAction>,
    pointer_actions: Vec<PointerAction>,
    page_list: Vec<PagePtr>,
    retired: Vec<PagePtr>,
}

impl<'a> ColumnMapPageModifier<'a> {
    pub fn new(
        ctx: &'a ColumnMapContext,
        page_manager: &'static PageManager,
        index: &'a OpenAddressingTable,
        table_id: TableId,
        min_version: Version,
    ) -> Result<Self> {
        let update_page = page_manager.alloc()?;
        let fill_page = match page_manager.alloc() {
            Ok(page) => page,
            Err(e) => {
                page_manager.free_local(update_page);
                return Err(e);
            }
        };
        let modifier = ColumnMapPageModifier {
            ctx,
            page_manager,
            index,
            table_id,
            min_version,
            update_page,
            update_start_idx: 0,
            update_end_idx: 0,
            update_idx: 0,
            fill_page,
            fill_heap: fill_page.addr() + PAGE_SIZE,
            fill_end_idx: 0,
            fill_idx: 0,
            fill_size: 0,
            clean_actions: vec![],
            pointer_actions: vec![],
            page_list: vec![],
            retired: vec![],
        };
        modifier.init_update_page();
        Ok(modifier)
    }

}

impl<'a> PageModifier for ColumnMapPageModifier<'a> {
    fn clean(&mut self, page: PagePtr) -> Result<bool> {
        let main = MainPage::from_page(page);
        if !main.needs_cleaning(self.min_version) {
            self.page_list.push(page);
            return Ok(false);
        }
        let entries = main.entries();
        let sizes = main.sizes();
        let count = entries.len();
        let mut main_start = 0usize;
        let mut main_end = 0usize;
        let mut i = 0;
        while i < count {
            let base_idx = i;
            'record: loop {
                debug_assert_eq!(self.fill_idx, self.fill_end_idx);
                debug_assert_eq!(self.update_idx, self.update_end_idx);
                i = base_idx;
                let key = entries[base_idx].key;
                let newest = entries[base_idx].newest.load();
                let mut was_delete = false;
                if newest != 0 {
                    let head = match NewestPtr::decode(newest) {
                        NewestRef::Delta(head) => head,
                        NewestRef::None => unreachable!(),
                        // already rebuilt or dropped by an earlier
                        // interrupted pass.
                        NewestRef::Main(_) | NewestRef::Invalid => {
                            i = skip_key(entries, base_idx, key);
                            break 'record;
                        }
                    };
                    if main_start != main_end {
                        debug_assert_eq!(self.update_start_idx, self.update_end_idx);
                        self.add_clean_action(main, main_start, main_end);
                        main_start = 0;
                        main_end = 0;
                    }
                    let lowest = match self.process_updates(head, &mut was_delete)? {
                        None => {
                            self.flush()?;
                            continue 'record;
                        }
                        Some(lowest) => lowest,
                    };
                    // the chain reaches down to the water: the main
                    // rows are fully shadowed by the update page.
                    if lowest <= self.min_version {
                        if self.update_idx == self.update_end_idx {
                            debug_assert_eq!(self.fill_idx, self.fill_end_idx);
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
                            self.update_end_idx = self.update_idx;
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
                let copy_start = i;
                let mut copy_end = i;
                while i < count && entries[i].key == key {
                    let mut size = self.ctx.entry_overhead;
                    if was_delete {
                        debug_assert!(sizes[i] != 0, "only a data row can follow a delete");
                        if entries[i].version < self.min_version {
                            self.fill_idx -= 1;
                            self.fill_size -= size + self.ctx.fixed_size;
                            if copy_start == copy_end {
                                // the delete came from the update page.
                                debug_assert!(self.update_idx > self.update_end_idx);
                                self.update_idx -= 1;
                            } else {
                                // the delete was the previous main row.
                                copy_end -= 1;
                            }
                            was_delete = false;
                            break;
                        }
                    }
                    if sizes[i] == 0 {
                        if entries[i].version <= self.min_version {
                            break;
                        }
                        size += self.ctx.fixed_size;
                        was_delete = true;
                    } else {
                        size += sizes[i] as usize;
                        was_delete = false;
                    }
                    self.fill_size += size;
                    if self.fill_size > self.ctx.max_data_size {
                        if main_start != main_end {
                            debug_assert_eq!(self.update_start_idx, self.update_end_idx);
                            self.add_clean_action(main, main_start, main_end);
                            main_start = 0;
                            main_end = 0;
                        }
                        self.flush()?;
                        continue 'record;
                    }
                    self.write_fill_entry(key, entries[i].version);
                    self.fill_idx += 1;
                    copy_end += 1;
                    if entries[i].version <= self.min_version {
                        break;
                    }
                    i += 1;
                }
                debug_assert!(!was_delete, "last row of a record must not be a delete");
                debug_assert_eq!(
                    self.fill_idx - self.fill_end_idx,
                    (copy_end - copy_start) + (self.update_idx - self.update_end_idx)
                );
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
                    // batch contiguous copy-only spans into one
                    // action.
                    if main_end == copy_start && self.update_idx == self.update_start_idx {
                        main_end = copy_end;
                    } else {
                        if main_start != main_end {
                            debug_assert_eq!(self.update_start_idx, self.update_end_idx);
                            self.add_clean_action(main, main_start, main_end);
                            main_start = 0;
                            main_end = 0;
                        }
                        self.update_end_idx = self.update_idx;
                        if copy_start != copy_end {
                            if self.update_start_idx != self.update_end_idx {
                                self.clean_actions.push(CleanAction {
                                    page: self.update_page.addr(),
                                    start_idx: self.update_start_idx,
                                    end_idx: self.update_end_idx,
                                    offset_correction: 0,
                                });
                                self.update_start_idx = self.update_end_idx;
                            }
                            main_start = copy_start;
                            main_end = copy_end;
                        }
                    }
                    self.fill_end_idx = self.fill_idx;
                }
                i = skip_key(entries, i.max(base_idx), key);
                break 'record;
            }
        }
        if main_start != main_end {
            debug_assert_eq!(self.update_start_idx, self.update_idx);
            self.add_clean_action(main, main_start, main_end);
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
            debug_assert_eq!(self.update_idx, self.update_end_idx);
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
                    let size = self.ctx.entry_overhead;
                    if was_delete && ie.version < self.min_version {
                        // delete above, insert data below the water:
                        // the pair cancels out.
                        self.fill_size -= size + self.ctx.fixed_size;
                        debug_assert!(self.fill_idx > self.fill_end_idx);
                        self.fill_idx -= 1;
                        debug_assert!(self.update_idx > self.update_end_idx);
                        self.update_idx -= 1;
                    } else if lowest > self.min_version.max(ie.version) && !ie.is_reverted() {
                        let data = ie.data();
                        self.fill_size += size + data.len();
                        if self.fill_size > self.ctx.max_data_size {
                            self.flush()?;
                            continue 'record;
                        }
                        self.write_insert(ie);
                    }
                    if self.update_idx == self.update_end_idx {
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
                    self.fill_size += self.ctx.entry_overhead + data.len();
                    if self.fill_size > self.ctx.max_data_size {
                        self.flush()?;
                        continue 'record;
                    }
                    self.write_insert(ie);
                }
            }
            debug_assert_eq!(
                self.fill_idx - self.fill_end_idx,
                self.update_idx - self.update_end_idx
            );
            let desired =
                unsafe { &*(self.fill_entry_ptr(self.fill_end_idx) as *const MainEntry) };
            self.pointer_actions.push(PointerAction {
                target: &ie.newest,
                expected: newest,
                desired,
                key: ie.key,
                index_expected: RecordRef::encode_log(ie),
            });
            self.update_end_idx = self.update_idx;
            self.fill_end_idx = self.fill_idx;
            return Ok(true);
        }
    }

    fn finish(mut self) -> (Vec<PagePtr>, Vec<PagePtr>) {
        if self.fill_end_idx != 0 {
            self.flush_fill_page();
        } else {
            self.page_manager.free_local(self.fill_page);
        }
        self.page_manager.free_local(self.update_page);
        (std::mem::take(&mut self.page_list), std::mem::take(&mut self.retired))
    }
}

impl<'a> ColumnMapPageModifier<'a> {
    /// Fold the update chain into the update page, newest first.
    /// Returns None when the fill page budget overflows; the caller
    /// flushes and restarts the record.
    fn process_updates(
        &mut self,
        head: &'static UpdateEntry,
        was_delete: &mut bool,
    ) -> Result<Option<Version>> {
        let mut iter = UpdateChainIter::new(head);
        while let Some(e) = iter.next() {
            let mut size = self.ctx.entry_overhead;
            if *was_delete {
                debug_assert!(!e.is_delete(), "only a data entry can follow a delete");
                debug_assert!(self.update_idx > self.update_end_idx);
                if e.version < self.min_version {
                    // drop the delete/data pair.
                    self.update_idx -= 1;
                    self.fill_idx -= 1;
                    self.fill_size -= size + self.ctx.fixed_size;
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
                size += self.ctx.fixed_size;
                *was_delete = true;
            } else {
                size += e.data().len();
                *was_delete = false;
            }
            self.fill_size += size;
            if self.fill_size > self.ctx.max_data_size {
                return Ok(None);
            }
            self.write_update(e);
            if e.version <= self.min_version {
                break;
            }
        }
        Ok(Some(iter.lowest_version()))
    }

    #[inline]
    fn fill_page_end(&self) -> usize {
        self.fill_page.addr() + PAGE_SIZE
    }

    #[inline]
    fn fill_entry_ptr(&self, idx: usize) -> *mut MainEntry {
        (self.fill_page.addr() + MAIN_PAGE_HEADER_SIZE + idx * MAIN_ENTRY_SIZE)
            as *mut MainEntry
    }

    #[inline]
    fn write_fill_entry(&mut self, key: u64, version: Version) {
        unsafe {
            let e = self.fill_entry_ptr(self.fill_idx);
            (*e).key = key;
            (*e).version = version;
        }
    }

    #[inline]
    fn update_sizes_ptr(&self) -> *mut u32 {
        (self.update_page.addr() + MainPage::sizes_offset(self.ctx.capacity)) as *mut u32
    }

    #[inline]
    fn update_heap_entry_ptr(&self, field: usize, idx: usize) -> *mut ColumnMapHeapEntry {
        (self.update_page.addr()
            + self.ctx.heap_entries_offset(self.ctx.capacity)
            + (field * self.ctx.capacity + idx) * 8) as *mut ColumnMapHeapEntry
    }

    fn write_update(&mut self, e: &'static UpdateEntry) {
        self.write_fill_entry(e.key, e.version);
        if e.is_delete() {
            unsafe {
                *self.update_sizes_ptr().add(self.update_idx) = 0;
            }
            if self.ctx.var_count != 0 {
                // deletes carry no heap data but their offsets must
                // stay monotone for span arithmetic.
                let heap_offset = (self.fill_page_end() - self.fill_heap) as u32;
                for field in 0..self.ctx.var_count {
                    unsafe {
                        *self.update_heap_entry_ptr(field, self.update_idx) =
                            ColumnMapHeapEntry::new(heap_offset, &[]);
                    }
                }
            }
        } else {
            self.write_data(e.data());
        }
        self.fill_idx += 1;
        self.update_idx += 1;
    }

    fn write_insert(&mut self, ie: &'static InsertEntry) {
        self.write_fill_entry(ie.key, ie.version);
        self.write_data(ie.data());
        self.fill_idx += 1;
        self.update_idx += 1;
    }

    /// Scatter one tuple into the update page columns and copy its
    /// var block into the fill heap.
    fn write_data(&mut self, data: &[u8]) {
        debug_assert!(!data.is_empty());
        let cap = self.ctx.capacity;
        unsafe {
            *self.update_sizes_ptr().add(self.update_idx) = data.len() as u32;
        }
        let rd = self.update_page.addr() + ColumnMapContext::record_data_offset(cap);
        let mut col_base = rd;
        let mut src_off = 0;
        for &len in &self.ctx.fixed_lens {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr().add(src_off),
                    (col_base + self.update_idx * len) as *mut u8,
                    len,
                );
            }
            col_base += cap * len;
            src_off += len;
        }
        if self.ctx.var_count != 0 {
            let block = &data[self.ctx.var_block_offset()..];
            self.fill_heap -= block.len();
            unsafe {
                std::ptr::copy_nonoverlapping(
                    block.as_ptr(),
                    self.fill_heap as *mut u8,
                    block.len(),
                );
            }
            let mut heap_offset = (self.fill_page_end() - self.fill_heap) as u32;
            let mut cursor = 0usize;
            for field in 0..self.ctx.var_count {
                let var_size =
                    u32::from_le_bytes(block[cursor..cursor + 4].try_into().unwrap()) as usize;
                let value = &block[cursor + 4..cursor + 4 + var_size];
                unsafe {
                    *self.update_heap_entry_ptr(field, self.update_idx) =
                        ColumnMapHeapEntry::new(heap_offset, value);
                }
                let advance = 4 + deltastore_catalog::tuple::align4(var_size);
                cursor += advance;
                heap_offset -= advance as u32;
            }
            debug_assert_eq!(cursor, block.len());
        }
    }

    /// Enqueue a copy directive for rows [start, end) of a source
    /// page and copy their heap span now, while the offset correction
    /// is known.
    fn add_clean_action(&mut self, main: MainPage, start: usize, end: usize) {
        debug_assert!(end > start);
        if self.ctx.var_count == 0 {
            self.clean_actions.push(CleanAction {
                page: main.0,
                start_idx: start,
                end_idx: end,
                offset_correction: 0,
            });
            return;
        }
        let he = self.ctx.heap_entries(main, 0);
        let begin_offset = he[end - 1].offset as usize;
        let end_offset = if start == 0 {
            0
        } else {
            he[start - 1].offset as usize
        };
        debug_assert!(begin_offset >= end_offset);
        let len = begin_offset - end_offset;
        self.fill_heap -= len;
        unsafe {
            std::ptr::copy_nonoverlapping(
                (main.end() - begin_offset) as *const u8,
                self.fill_heap as *mut u8,
                len,
            );
        }
        let offset_correction =
            (self.fill_page_end() - self.fill_heap) as i64 - begin_offset as i64;
        self.clean_actions.push(CleanAction {
            page: main.0,
            start_idx: start,
            end_idx: end,
            offset_correction,
        });
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

    fn init_update_page(&self) {
        unsafe {
            let header = self.update_page.addr() as *mut MainPageHeader;
            (*header).layout = PageLayout::ColumnMap as u32;
            (*header).count = self.ctx.capacity as u32;
        }
    }

    /// Seal the current fill page and install a fresh one. Fails if a
    /// single record exceeds the page data budget.
    fn flush(&mut self) -> Result<()> {
        if self.fill_end_idx == 0 {
            return Err(Error::InvalidArgument);
        }
        let new_fill = self.page_manager.alloc()?;
        self.flush_fill_page();
        if self.update_idx != 0 {
            unsafe {
                self.update_page.as_ptr().write_bytes(0, PAGE_SIZE);
            }
            self.init_update_page();
            self.update_start_idx = 0;
            self.update_end_idx = 0;
            self.update_idx = 0;
        }
        self.fill_page = new_fill;
        self.fill_heap = self.fill_page_end();
        self.fill_end_idx = 0;
        self.fill_idx = 0;
        self.fill_size = 0;
        Ok(())
    }

    /// Materialize the fill page from the queued clean actions in one
    /// pass, then execute the deferred pointer and index rewrites.
    fn flush_fill_page(&mut self) {
        debug_assert!(self.fill_end_idx > 0);
        if self.update_start_idx != self.update_end_idx {
            self.clean_actions.push(CleanAction {
                page: self.update_page.addr(),
                start_idx: self.update_start_idx,
                end_idx: self.update_end_idx,
                offset_correction: 0,
            });
            self.update_start_idx = self.update_end_idx;
        }
        let count = self.fill_end_idx;
        let base = self.fill_page.addr();
        unsafe {
            let header = base as *mut MainPageHeader;
            (*header).layout = PageLayout::ColumnMap as u32;
            (*header).count = count as u32;
        }
        debug_assert_eq!(
            self.clean_actions
                .iter()
                .map(|a| a.end_idx - a.start_idx)
                .sum::<usize>(),
            count
        );
        // sizes
        let mut dst = base + MainPage::sizes_offset(count);
        for action in &self.clean_actions {
            let src_page = MainPage(action.page);
            let src = action.page
                + MainPage::sizes_offset(src_page.count())
                + action.start_idx * 4;
            let len = (action.end_idx - action.start_idx) * 4;
            unsafe {
                std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len);
            }
            dst += len;
        }
        // fixed-size columns: one copy per (field x action) pair.
        let mut dst = base + ColumnMapContext::record_data_offset(count);
        let mut col_off = 0;
        for &field_len in &self.ctx.fixed_lens {
            for action in &self.clean_actions {
                let src_page = MainPage(action.page);
                let src_count = src_page.count();
                let src = action.page
                    + ColumnMapContext::record_data_offset(src_count)
                    + src_count * col_off
                    + action.start_idx * field_len;
                let len = (action.end_idx - action.start_idx) * field_len;
                unsafe {
                    std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len);
                }
                dst += len;
            }
            col_off += field_len;
        }
        debug_assert_eq!(col_off, self.ctx.fixed_size);
        // heap entry arrays, rebasing offsets where the heap moved.
        let mut dst = base + self.ctx.heap_entries_offset(count);
        for field in 0..self.ctx.var_count {
            for action in &self.clean_actions {
                let src_page = MainPage(action.page);
                let src_count = src_page.count();
                let src = (action.page
                    + self.ctx.heap_entries_offset(src_count)
                    + (field * src_count + action.start_idx) * 8)
                    as *const ColumnMapHeapEntry;
                let n = action.end_idx - action.start_idx;
                if action.offset_correction == 0 {
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            src,
                            dst as *mut ColumnMapHeapEntry,
                            n,
                        );
                    }
                } else {
                    for k in 0..n {
                        let entry = unsafe { *src.add(k) };
                        let new_offset =
                            entry.offset as i64 + action.offset_correction;
                        debug_assert!(new_offset > 0);
                        unsafe {
                            *(dst as *mut ColumnMapHeapEntry).add(k) = ColumnMapHeapEntry {
                                offset: new_offset as u32,
                                prefix: entry.prefix,
                            };
                        }
                    }
                }
                dst += n * 8;
            }
        }
        self.clean_actions.clear();
        self.page_list.push(self.fill_page);
        for action in self.pointer_actions.drain(..) {
            action.execute(self.index, self.table_id);
        }
    }
}
