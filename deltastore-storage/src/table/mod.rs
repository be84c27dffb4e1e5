pub mod scan;

use crate::buffer::{pin, PageManager, PagePtr};
use crate::commit::{SnapshotDescriptor, Version};
use crate::deltamain::{
    insert_base_version, main_base_version, newest_version_of, read_record, ColumnMapContext,
    ColumnMapPageModifier, InsertEntry, LayoutContext, NewestPtr, NewestRef, NewestVersion,
    PageLayout, PageModifier, ReadOutcome, RecordRef, RowStoreContext, RowStorePageModifier,
    UpdateEntry, INSERT_ENTRY_HEADER, INVALID_WORD, UPDATE_ENTRY_HEADER,
};
use crate::error::{Error, Result};
use crate::index::OpenAddressingTable;
use crate::lifetime::StaticLifetime;
use crate::log::{OrderedLog, UnorderedLog, LOG_DELETE, LOG_INSERT, LOG_UPDATE};
use deltastore_catalog::{Schema, TableId};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::AtomicUsize;

/// A tuple returned by a point read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    pub version: Version,
    /// Whether this is the newest version written for the key.
    pub is_newest: bool,
    pub data: Vec<u8>,
}

/// One user table: a hash index shard, the two delta logs and the
/// list of compacted main pages.
pub struct Table {
    table_id: TableId,
    name: String,
    schema: Schema,
    layout_ctx: LayoutContext,
    page_manager: &'static PageManager,
    index: OpenAddressingTable,
    /// Insert deltas; iterated oldest to newest by GC and scans.
    insert_log: OrderedLog,
    /// Update and delete deltas; reached only through record chains.
    update_log: UnorderedLog,
    /// Current main pages. Replaced wholesale by GC.
    pages: Mutex<Vec<PagePtr>>,
    /// Scans hold this shared; a GC pass needs it exclusively so a
    /// scan never observes a half-swapped page list.
    gc_latch: RwLock<()>,
    active_scans: AtomicUsize,
    max_scans: usize,
}

unsafe impl StaticLifetime for Table {}

impl Table {
    pub fn new(
        table_id: TableId,
        name: &str,
        schema: Schema,
        layout: PageLayout,
        page_manager: &'static PageManager,
        hash_capacity: usize,
        max_scans: usize,
    ) -> Self {
        let layout_ctx = match layout {
            PageLayout::RowStore => LayoutContext::Row(RowStoreContext::new()),
            PageLayout::ColumnMap => LayoutContext::Col(ColumnMapContext::new(&schema)),
        };
        Table {
            table_id,
            name: String::from(name),
            schema,
            layout_ctx,
            page_manager,
            index: OpenAddressingTable::with_capacity(hash_capacity),
            insert_log: OrderedLog::new(page_manager),
            update_log: UnorderedLog::new(page_manager),
            pages: Mutex::new(vec![]),
            gc_latch: RwLock::new(()),
            active_scans: AtomicUsize::new(0),
            max_scans,
        }
    }

    #[inline]
    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    #[inline]
    pub fn layout(&self) -> PageLayout {
        self.layout_ctx.layout()
    }

    #[inline]
    pub fn main_page_count(&self) -> usize {
        self.pages.lock().len()
    }

    /// Read the newest version of `key` visible under the snapshot.
    pub fn get(&self, key: u64, snapshot: &SnapshotDescriptor) -> Option<Tuple> {
        let _epoch = pin();
        let word = self.index.get(self.table_id, key)?;
        match read_record(&self.layout_ctx, word, snapshot) {
            ReadOutcome::Found {
                version,
                is_newest,
                data: Some(data),
            } => Some(Tuple {
                version,
                is_newest,
                data,
            }),
            _ => None,
        }
    }

    /// Insert a tuple. Fails with Ok(false) when the key already
    /// holds a version the snapshot cannot overwrite.
    pub fn insert(&self, key: u64, data: &[u8], snapshot: &SnapshotDescriptor) -> Result<bool> {
        if data.len() < self.schema.min_tuple_len() {
            return Err(Error::InvalidArgument);
        }
        let version = snapshot.version();
        let _epoch = pin();
        loop {
            match self.index.get(self.table_id, key) {
                None => {
                    let entry = self.write_insert_entry(key, version, data)?;
                    match self
                        .index
                        .insert(self.table_id, key, RecordRef::encode_log(entry), false)
                    {
                        Ok(true) => return Ok(true),
                        Ok(false) => {
                            // lost the race for the slot; release the
                            // entry so its log page can be retired. A
                            // concurrent writer owns the key now.
                            entry.newest.store(INVALID_WORD);
                            return Ok(false);
                        }
                        Err(e) => {
                            entry.newest.store(INVALID_WORD);
                            return Err(e);
                        }
                    }
                }
                Some(index_word) => match resolve(index_word) {
                    Resolved::Dead => {
                        let entry = self.write_insert_entry(key, version, data)?;
                        if self.index.update(
                            self.table_id,
                            key,
                            index_word,
                            RecordRef::encode_log(entry),
                        ) {
                            return Ok(true);
                        }
                        entry.newest.store(INVALID_WORD);
                        continue;
                    }
                    Resolved::Live {
                        target,
                        observed,
                        newest,
                    } => {
                        let over_tombstone = match &newest {
                            // every version reverted: the record is
                            // reachable but empty.
                            None => true,
                            Some(nv) => {
                                nv.is_delete
                                    && snapshot.is_visible(nv.version)
                                    && nv.version < version
                            }
                        };
                        if !over_tombstone {
                            return Ok(false);
                        }
                        let entry =
                            self.write_update_entry(LOG_UPDATE, key, version, observed, data)?;
                        if target
                            .compare_exchange(observed, NewestPtr::encode_delta(entry))
                            .is_ok()
                        {
                            return Ok(true);
                        }
                        continue;
                    }
                },
            }
        }
    }

    /// Update an existing tuple. Ok(false) when there is no visible
    /// predecessor or a conflicting writer got there first.
    pub fn update(&self, key: u64, data: &[u8], snapshot: &SnapshotDescriptor) -> Result<bool> {
        if data.len() < self.schema.min_tuple_len() {
            return Err(Error::InvalidArgument);
        }
        self.write_delta(LOG_UPDATE, key, data, snapshot)
    }

    /// Remove an existing tuple by writing a delete tombstone.
    pub fn remove(&self, key: u64, snapshot: &SnapshotDescriptor) -> Result<bool> {
        self.write_delta(LOG_DELETE, key, &[], snapshot)
    }

    fn write_delta(
        &self,
        kind: u8,
        key: u64,
        data: &[u8],
        snapshot: &SnapshotDescriptor,
    ) -> Result<bool> {
        let version = snapshot.version();
        let _epoch = pin();
        loop {
            let Some(index_word) = self.index.get(self.table_id, key) else {
                return Ok(false);
            };
            match resolve(index_word) {
                Resolved::Dead => return Ok(false),
                Resolved::Live {
                    target,
                    observed,
                    newest,
                } => {
                    let Some(nv) = newest else {
                        return Ok(false);
                    };
                    // the predecessor must be visible data strictly
                    // below our own version.
                    if nv.is_delete || !snapshot.is_visible(nv.version) || nv.version >= version
                    {
                        return Ok(false);
                    }
                    let entry = self.write_update_entry(kind, key, version, observed, data)?;
                    if target
                        .compare_exchange(observed, NewestPtr::encode_delta(entry))
                        .is_ok()
                    {
                        return Ok(true);
                    }
                }
            }
        }
    }

    /// Mark the log entry written at the snapshot's version as
    /// reverted so reads skip it. Versions already folded into a main
    /// page cannot be reverted.
    pub fn revert(&self, key: u64, snapshot: &SnapshotDescriptor) -> Result<bool> {
        let version = snapshot.version();
        let _epoch = pin();
        let Some(index_word) = self.index.get(self.table_id, key) else {
            return Ok(false);
        };
        let mut word = index_word;
        loop {
            match RecordRef::decode(word) {
                RecordRef::Log(ie) => match NewestPtr::decode(ie.newest.load()) {
                    NewestRef::Invalid => return Ok(false),
                    NewestRef::Main(me) => {
                        word = NewestPtr::encode_main(me);
                    }
                    NewestRef::Delta(head) => {
                        if let Some(done) = revert_in_chain(head, version) {
                            return Ok(done);
                        }
                        return Ok(revert_insert(ie, version));
                    }
                    NewestRef::None => {
                        return Ok(revert_insert(ie, version));
                    }
                },
                RecordRef::Main(me) => match NewestPtr::decode(me.newest.load()) {
                    NewestRef::Invalid => return Ok(false),
                    NewestRef::Main(next) => {
                        word = NewestPtr::encode_main(next);
                    }
                    NewestRef::Delta(head) => {
                        if let Some(done) = revert_in_chain(head, version) {
                            return Ok(done);
                        }
                        return Ok(false);
                    }
                    NewestRef::None => return Ok(false),
                },
            }
        }
    }

    /// Run one garbage collection pass: rebuild main pages whose
    /// records accumulated deltas or obsolete versions, fold pending
    /// insert-log records into main pages, then retire log pages that
    /// nothing references anymore.
    ///
    /// Skipped without effect while scans are active on this table.
    pub fn run_gc(&self, min_version: Version) -> Result<()> {
        let Some(_latch) = self.gc_latch.try_write() else {
            return Ok(());
        };
        let _epoch = pin();
        let old_pages: Vec<PagePtr> = self.pages.lock().clone();
        let outcome = match &self.layout_ctx {
            LayoutContext::Row(ctx) => {
                let modifier = RowStorePageModifier::new(
                    ctx,
                    self.page_manager,
                    &self.index,
                    self.table_id,
                    min_version,
                )?;
                self.run_modifier(modifier, &old_pages)
            }
            LayoutContext::Col(ctx) => {
                let modifier = ColumnMapPageModifier::new(
                    ctx,
                    self.page_manager,
                    &self.index,
                    self.table_id,
                    min_version,
                )?;
                self.run_modifier(modifier, &old_pages)
            }
        };
        let (new_pages, retired, err) = outcome;
        *self.pages.lock() = new_pages;
        for page in retired {
            self.page_manager.free(page);
        }
        self.retire_log_pages();
        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn run_modifier<M: PageModifier>(
        &self,
        mut modifier: M,
        old_pages: &[PagePtr],
    ) -> (Vec<PagePtr>, Vec<PagePtr>, Option<Error>) {
        let mut err = None;
        for (n, page) in old_pages.iter().enumerate() {
            if let Err(e) = modifier.clean(*page) {
                // keep this and all remaining source pages.
                for p in &old_pages[n..] {
                    modifier.keep_page(*p);
                }
                err = Some(e);
                break;
            }
        }
        if err.is_none() {
            let res = self.insert_log.try_for_each(|le| {
                if le.kind() != LOG_INSERT {
                    return Ok(());
                }
                let ie = unsafe { InsertEntry::from_addr(le.data_ptr() as usize) };
                // only records the index still roots in the log are
                // folded; anything else was already migrated,
                // invalidated or never published.
                if self.index.get(self.table_id, ie.key) != Some(RecordRef::encode_log(ie)) {
                    return Ok(());
                }
                modifier.append(ie).map(|_| ())
            });
            if let Err(e) = res {
                err = Some(e);
            }
        }
        let (pages, retired) = modifier.finish();
        (pages, retired, err)
    }

    /// Retire insert-log pages whose every record has been migrated
    /// to a main page or invalidated, and update-log pages none of
    /// whose entries are still reachable from any record chain.
    fn retire_log_pages(&self) {
        self.insert_log.retire_where(|le| {
            if le.kind() != LOG_INSERT {
                return false;
            }
            let ie = unsafe { InsertEntry::from_addr(le.data_ptr() as usize) };
            !matches!(
                NewestPtr::decode(ie.newest.load()),
                NewestRef::Main(_) | NewestRef::Invalid
            )
        });
        self.update_log.retire_where(|le| {
            if le.kind() != LOG_UPDATE && le.kind() != LOG_DELETE {
                return false;
            }
            let ue = unsafe { &*(le.data_ptr() as *const UpdateEntry) };
            self.update_entry_reachable(ue)
        });
    }

    /// Conservative reachability: an update entry is alive iff the
    /// current chain of its key still links to it. A pointer-action
    /// carry can keep pre-compaction entries chained, so membership
    /// must be checked against the live chain, reverted entries
    /// included.
    fn update_entry_reachable(&self, target: &UpdateEntry) -> bool {
        let Some(index_word) = self.index.get(self.table_id, target.key) else {
            return false;
        };
        let mut word = index_word;
        let head = loop {
            let newest = match RecordRef::decode(word) {
                RecordRef::Log(ie) => ie.newest.load(),
                RecordRef::Main(me) => me.newest.load(),
            };
            match NewestPtr::decode(newest) {
                NewestRef::Main(me) => word = NewestPtr::encode_main(me),
                NewestRef::Delta(head) => break head,
                NewestRef::None | NewestRef::Invalid => return false,
            }
        };
        let mut cur = Some(head);
        while let Some(e) = cur {
            if std::ptr::eq(e, target) {
                return true;
            }
            cur = e.previous();
        }
        false
    }

    fn write_insert_entry(
        &self,
        key: u64,
        version: Version,
        data: &[u8],
    ) -> Result<&'static InsertEntry> {
        let mut w = self
            .insert_log
            .append(LOG_INSERT, INSERT_ENTRY_HEADER + data.len())?;
        unsafe {
            let p = w.payload_ptr();
            (p as *mut u64).write(key);
            (p.add(8) as *mut u64).write(version);
            (p.add(16) as *mut u64).write(0);
            std::ptr::copy_nonoverlapping(data.as_ptr(), p.add(INSERT_ENTRY_HEADER), data.len());
        }
        let le = w.publish();
        Ok(unsafe { InsertEntry::from_addr(le.data_ptr() as usize) })
    }

    fn write_update_entry(
        &self,
        kind: u8,
        key: u64,
        version: Version,
        previous: u64,
        data: &[u8],
    ) -> Result<&'static UpdateEntry> {
        let mut w = self
            .update_log
            .append(kind, UPDATE_ENTRY_HEADER + data.len())?;
        unsafe {
            let p = w.payload_ptr();
            UpdateEntry::init(p, key, version, previous);
            std::ptr::copy_nonoverlapping(data.as_ptr(), p.add(UPDATE_ENTRY_HEADER), data.len());
        }
        let le = w.publish();
        Ok(unsafe { &*(le.data_ptr() as *const UpdateEntry) })
    }

    #[inline]
    pub(crate) fn main_pages(&self) -> Vec<PagePtr> {
        self.pages.lock().clone()
    }
}

enum Resolved {
    /// The record was decommissioned; the index word may be replaced.
    Dead,
    Live {
        /// The newest slot all writes CAS against.
        target: &'static NewestPtr,
        /// The word observed in the slot; becomes the new entry's
        /// `previous`.
        observed: u64,
        /// Absolute newest non-reverted version, if any.
        newest: Option<NewestVersion>,
    },
}

/// Follow Main redirects to the record's current incarnation and
/// capture its chain head.
fn resolve(index_word: u64) -> Resolved {
    let mut word = index_word;
    loop {
        match RecordRef::decode(word) {
            RecordRef::Log(ie) => {
                let observed = ie.newest.load();
                match NewestPtr::decode(observed) {
                    NewestRef::Invalid => return Resolved::Dead,
                    NewestRef::Main(me) => word = NewestPtr::encode_main(me),
                    NewestRef::Delta(head) => {
                        return Resolved::Live {
                            target: &ie.newest,
                            observed,
                            newest: newest_version_of(Some(head), insert_base_version(ie)),
                        }
                    }
                    NewestRef::None => {
                        return Resolved::Live {
                            target: &ie.newest,
                            observed,
                            newest: newest_version_of(None, insert_base_version(ie)),
                        }
                    }
                }
            }
            RecordRef::Main(me) => {
                let observed = me.newest.load();
                match NewestPtr::decode(observed) {
                    NewestRef::Invalid => return Resolved::Dead,
                    NewestRef::Main(next) => word = NewestPtr::encode_main(next),
                    NewestRef::Delta(head) => {
                        return Resolved::Live {
                            target: &me.newest,
                            observed,
                            newest: newest_version_of(Some(head), Some(main_base_version(me))),
                        }
                    }
                    NewestRef::None => {
                        return Resolved::Live {
                            target: &me.newest,
                            observed,
                            newest: Some(main_base_version(me)),
                        }
                    }
                }
            }
        }
    }
}

/// Walk the raw chain looking for an entry at exactly `version`.
/// Some(true): reverted now. Some(false): found but already reverted.
/// None: the version is not in the chain.
fn revert_in_chain(head: &'static UpdateEntry, version: Version) -> Option<bool> {
    let mut cur = Some(head);
    while let Some(e) = cur {
        if e.version == version {
            if e.is_reverted() {
                return Some(false);
            }
            e.log_entry().set_reverted();
            return Some(true);
        }
        if e.version < version {
            return None;
        }
        cur = e.previous();
    }
    None
}

fn revert_insert(ie: &'static InsertEntry, version: Version) -> bool {
    if ie.version != version || ie.is_reverted() {
        return false;
    }
    ie.log_entry().set_reverted();
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PAGE_SIZE;
    use deltastore_catalog::{Field, FieldType, TupleBuilder, Value};

    fn test_table(layout: PageLayout) -> &'static Table {
        let pool = PageManager::with_capacity_static(64 * PAGE_SIZE).unwrap();
        let schema = Schema::new(vec![
            Field::new("id", FieldType::BigInt),
            Field::new("name", FieldType::Text),
        ])
        .unwrap();
        StaticLifetime::new_static(Table::new(1, "t", schema, layout, pool, 1 << 12, 4))
    }

    fn tuple(table: &Table, id: i64, name: &str) -> Vec<u8> {
        TupleBuilder::from_values(table.schema(), &[Value::BigInt(id), Value::from(name)])
            .unwrap()
    }

    fn snap(version: Version) -> SnapshotDescriptor {
        SnapshotDescriptor::latest_committed(version)
    }

    #[test]
    fn test_write_conflict_rules() {
        let table = test_table(PageLayout::ColumnMap);
        let data = tuple(table, 1, "one");
        // update and remove need an existing visible predecessor.
        assert!(!table.update(1, &data, &snap(5)).unwrap());
        assert!(!table.remove(1, &snap(5)).unwrap());
        assert!(table.insert(1, &data, &snap(10)).unwrap());
        // duplicate insert over live data conflicts.
        assert!(!table.insert(1, &data, &snap(20)).unwrap());
        // a snapshot that cannot see the predecessor cannot update it.
        assert!(!table.update(1, &data, &snap(9)).unwrap());
        assert!(table.update(1, &tuple(table, 1, "two"), &snap(20)).unwrap());
        // writes at or below the newest version conflict.
        assert!(!table.update(1, &data, &snap(20)).unwrap());
        assert!(!table.remove(1, &snap(15)).unwrap());
        assert!(table.remove(1, &snap(30)).unwrap());
        // the tombstone is not a valid update predecessor, but insert
        // may chain over it.
        assert!(!table.update(1, &data, &snap(40)).unwrap());
        assert!(table.insert(1, &tuple(table, 1, "three"), &snap(40)).unwrap());
        let got = table.get(1, &snap(40)).unwrap();
        assert_eq!(got.data, tuple(table, 1, "three"));
        assert_eq!(got.version, 40);
    }

    #[test]
    fn test_tuple_validation() {
        let table = test_table(PageLayout::ColumnMap);
        assert!(matches!(
            table.insert(1, &[0u8; 4], &snap(1)),
            Err(Error::InvalidArgument)
        ));
    }

    #[test]
    fn test_revert_semantics() {
        let table = test_table(PageLayout::RowStore);
        let a = tuple(table, 1, "a");
        let b = tuple(table, 1, "b");
        // nothing to revert on an unknown key.
        assert!(!table.revert(9, &snap(10)).unwrap());
        assert!(table.insert(9, &a, &snap(10)).unwrap());
        assert!(table.update(9, &b, &snap(20)).unwrap());
        // version not present in the chain.
        assert!(!table.revert(9, &snap(15)).unwrap());
        assert!(table.revert(9, &snap(20)).unwrap());
        assert_eq!(table.get(9, &snap(30)).unwrap().data, a);
        // reverting the insert itself empties the record.
        assert!(table.revert(9, &snap(10)).unwrap());
        assert!(table.get(9, &snap(30)).is_none());
        // a version folded into the main cannot be reverted.
        assert!(table.insert(8, &a, &snap(40)).unwrap());
        table.run_gc(0).unwrap();
        assert!(!table.revert(8, &snap(40)).unwrap());
        assert_eq!(table.get(8, &snap(50)).unwrap().data, a);
    }

    #[test]
    fn test_in_flight_version_not_visible() {
        let table = test_table(PageLayout::ColumnMap);
        let data = tuple(table, 1, "x");
        assert!(table.insert(1, &data, &snap(10)).unwrap());
        // a snapshot holding version 10 in its in-flight set must not
        // see it.
        let in_flight =
            SnapshotDescriptor::new(5, 5, 12, vec![0b0001_0000]).unwrap();
        assert!(in_flight.in_flight(10));
        assert!(table.get(1, &in_flight).is_none());
    }

    #[test]
    fn test_gc_pass_on_both_layouts_preserves_reads() {
        for layout in [PageLayout::RowStore, PageLayout::ColumnMap] {
            let table = test_table(layout);
            for key in 0..64u64 {
                let data = tuple(table, key as i64, "payload");
                assert!(table.insert(key, &data, &snap(key + 1)).unwrap());
            }
            for key in 0..32u64 {
                let data = tuple(table, key as i64, "updated");
                assert!(table.update(key, &data, &snap(100 + key)).unwrap());
            }
            table.run_gc(64).unwrap();
            for key in 0..64u64 {
                let got = table.get(key, &snap(500)).unwrap();
                let expect = if key < 32 {
                    tuple(table, key as i64, "updated")
                } else {
                    tuple(table, key as i64, "payload")
                };
                assert_eq!(got.data, expect, "layout {layout:?} key {key}");
            }
        }
    }
}
