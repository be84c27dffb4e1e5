pub mod colmap;
pub mod colmap_modifier;
pub mod rowstore;

use crate::buffer::{PagePtr, PAGE_SIZE};
use crate::commit::{SnapshotDescriptor, Version};
use crate::error::Result;
use crate::log::LogEntry;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

pub use colmap::{ColumnMapContext, ColumnMapHeapEntry};
pub use colmap_modifier::ColumnMapPageModifier;
pub use rowstore::{RowStoreContext, RowStorePageModifier};

/// Main page layout variants. The value is stored in every main page
/// header so a bare main entry pointer is interpretable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum PageLayout {
    RowStore = 1,
    ColumnMap = 2,
}

pub const MAIN_PAGE_HEADER_SIZE: usize = 8;

/// Header of every main page: layout tag and row count.
#[repr(C)]
pub struct MainPageHeader {
    pub layout: u32,
    pub count: u32,
}

/// Low two bits of the `newest` word and of index record words.
pub const TAG_MASK: u64 = 0b11;
/// Pointer into the delta log (or an insert entry, for index words).
pub const TAG_DELTA: u64 = 0b00;
/// Pointer to a rebuilt main entry.
pub const TAG_MAIN: u64 = 0b01;
/// The record is decommissioned; no reader may dereference it.
pub const TAG_INVALID: u64 = 0b10;

pub const INVALID_WORD: u64 = TAG_INVALID;

/// The tagged atomic head of a record's delta chain.
///
/// Zero means the chain is empty and readers fall through to the main
/// representation. The word is a monotonic state machine
/// `Delta -> Main(new) -> Invalid`, every transition a CAS. It is the
/// linearization point for all single-key operations.
#[repr(transparent)]
pub struct NewestPtr(AtomicU64);

/// Decoded view of a `newest` word.
pub enum NewestRef {
    None,
    Delta(&'static UpdateEntry),
    Main(&'static MainEntry),
    Invalid,
}

impl NewestPtr {
    #[inline]
    pub fn load(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub fn store(&self, word: u64) {
        self.0.store(word, Ordering::Release)
    }

    #[inline]
    pub fn compare_exchange(&self, expected: u64, new: u64) -> std::result::Result<u64, u64> {
        self.0
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
    }

    /// Decode a loaded word.
    ///
    /// # Safety of the returned references
    ///
    /// The pointees live in pool pages; the caller must hold an epoch
    /// pin taken before the word was loaded.
    #[inline]
    pub fn decode(word: u64) -> NewestRef {
        if word == 0 {
            return NewestRef::None;
        }
        let addr = word & !TAG_MASK;
        match word & TAG_MASK {
            TAG_DELTA => NewestRef::Delta(unsafe { &*(addr as *const UpdateEntry) }),
            TAG_MAIN => NewestRef::Main(unsafe { &*(addr as *const MainEntry) }),
            _ => NewestRef::Invalid,
        }
    }

    #[inline]
    pub fn encode_delta(entry: &UpdateEntry) -> u64 {
        let addr = entry as *const UpdateEntry as u64;
        debug_assert!(addr & TAG_MASK == 0);
        addr | TAG_DELTA
    }

    #[inline]
    pub fn encode_main(entry: &MainEntry) -> u64 {
        let addr = entry as *const MainEntry as u64;
        debug_assert!(addr & TAG_MASK == 0);
        addr | TAG_MAIN
    }
}

/// Decoded view of an index record word: either an insert entry in
/// the log or an entry in a main page.
pub enum RecordRef {
    Log(&'static InsertEntry),
    Main(&'static MainEntry),
}

impl RecordRef {
    /// Decode an index record word. Index words are never zero or
    /// invalid-tagged.
    #[inline]
    pub fn decode(word: u64) -> RecordRef {
        debug_assert!(word > TAG_MASK);
        let addr = word & !TAG_MASK;
        match word & TAG_MASK {
            TAG_MAIN => RecordRef::Main(unsafe { &*(addr as *const MainEntry) }),
            _ => RecordRef::Log(unsafe { &*(addr as *const InsertEntry) }),
        }
    }

    #[inline]
    pub fn encode_log(entry: &InsertEntry) -> u64 {
        let addr = entry as *const InsertEntry as u64;
        debug_assert!(addr & TAG_MASK == 0);
        addr | TAG_DELTA
    }
}

/// Fixed-size prefix of an insert log entry. Tuple bytes follow.
///
/// The `newest` slot anchors the record's delta chain while the
/// record lives in the log; once a compactor rebuilds the record the
/// slot is re-tagged to point at the new main entry.
#[repr(C)]
pub struct InsertEntry {
    pub key: u64,
    pub version: Version,
    pub newest: NewestPtr,
}

pub const INSERT_ENTRY_HEADER: usize = 24;

impl InsertEntry {
    #[inline]
    pub unsafe fn from_addr(addr: usize) -> &'static InsertEntry {
        unsafe { &*(addr as *const InsertEntry) }
    }

    #[inline]
    pub fn log_entry(&self) -> &'static LogEntry {
        unsafe { LogEntry::from_data(self as *const InsertEntry) }
    }

    #[inline]
    pub fn is_reverted(&self) -> bool {
        self.log_entry().is_reverted()
    }

    /// Tuple bytes of the inserted version.
    #[inline]
    pub fn data(&self) -> &'static [u8] {
        let len = self.log_entry().size() - INSERT_ENTRY_HEADER;
        unsafe {
            std::slice::from_raw_parts(
                (self as *const InsertEntry as *const u8).add(INSERT_ENTRY_HEADER),
                len,
            )
        }
    }
}

/// Fixed-size prefix of an update or delete log entry. Tuple bytes
/// follow for updates; deletes carry no data.
///
/// `previous` points to the next older update entry or is zero at the
/// chain end. It never points at an insert entry or a main entry, so
/// no cycle can form even while a compactor re-chains records.
#[repr(C)]
pub struct UpdateEntry {
    pub key: u64,
    pub version: Version,
    previous: u64,
}

pub const UPDATE_ENTRY_HEADER: usize = 24;

impl UpdateEntry {
    #[inline]
    pub fn log_entry(&self) -> &'static LogEntry {
        unsafe { LogEntry::from_data(self as *const UpdateEntry) }
    }

    #[inline]
    pub fn is_delete(&self) -> bool {
        self.log_entry().kind() == crate::log::LOG_DELETE
    }

    #[inline]
    pub fn is_reverted(&self) -> bool {
        self.log_entry().is_reverted()
    }

    #[inline]
    pub fn previous(&self) -> Option<&'static UpdateEntry> {
        if self.previous == 0 {
            None
        } else {
            debug_assert!(self.previous & TAG_MASK == TAG_DELTA);
            Some(unsafe { &*((self.previous & !TAG_MASK) as *const UpdateEntry) })
        }
    }

    #[inline]
    pub fn data(&self) -> &'static [u8] {
        let len = self.log_entry().size() - UPDATE_ENTRY_HEADER;
        unsafe {
            std::slice::from_raw_parts(
                (self as *const UpdateEntry as *const u8).add(UPDATE_ENTRY_HEADER),
                len,
            )
        }
    }

    /// Initialize the fixed prefix inside a freshly reserved log
    /// entry. Must happen before the entry is published.
    #[inline]
    pub unsafe fn init(ptr: *mut u8, key: u64, version: Version, previous: u64) {
        unsafe {
            let e = ptr as *mut UpdateEntry;
            (*e).key = key;
            (*e).version = version;
            (*e).previous = previous;
        }
    }
}

/// Per-row entry of a main page. Rows of one key are contiguous,
/// newest first; only the first entry of a key's run carries a live
/// `newest` slot.
#[repr(C)]
pub struct MainEntry {
    pub key: u64,
    pub version: Version,
    pub newest: NewestPtr,
}

pub const MAIN_ENTRY_SIZE: usize = 24;

/// View over a published main page, recovered from any interior
/// pointer thanks to page alignment.
#[derive(Clone, Copy)]
pub struct MainPage(pub usize);

impl MainPage {
    #[inline]
    pub fn from_entry(entry: &MainEntry) -> MainPage {
        MainPage(PagePtr::base_of(entry as *const MainEntry as usize))
    }

    #[inline]
    pub fn from_page(page: PagePtr) -> MainPage {
        MainPage(page.addr())
    }

    #[inline]
    pub fn header(&self) -> &'static MainPageHeader {
        unsafe { &*(self.0 as *const MainPageHeader) }
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.header().count as usize
    }

    #[inline]
    pub fn layout(&self) -> PageLayout {
        match self.header().layout {
            1 => PageLayout::RowStore,
            2 => PageLayout::ColumnMap,
            other => unreachable!("corrupt main page layout tag {other}"),
        }
    }

    #[inline]
    pub fn entries(&self) -> &'static [MainEntry] {
        unsafe {
            std::slice::from_raw_parts(
                (self.0 + MAIN_PAGE_HEADER_SIZE) as *const MainEntry,
                self.count(),
            )
        }
    }

    #[inline]
    pub fn entry_ptr(&self, idx: usize) -> *mut MainEntry {
        (self.0 + MAIN_PAGE_HEADER_SIZE + idx * MAIN_ENTRY_SIZE) as *mut MainEntry
    }

    #[inline]
    pub fn sizes_offset(count: usize) -> usize {
        MAIN_PAGE_HEADER_SIZE + count * MAIN_ENTRY_SIZE
    }

    /// Per-row total tuple sizes; zero denotes a delete tombstone.
    #[inline]
    pub fn sizes(&self) -> &'static [u32] {
        unsafe {
            std::slice::from_raw_parts(
                (self.0 + Self::sizes_offset(self.count())) as *const u32,
                self.count(),
            )
        }
    }

    #[inline]
    pub fn entry_idx(&self, entry: &MainEntry) -> usize {
        let addr = entry as *const MainEntry as usize;
        debug_assert!(addr >= self.0 + MAIN_PAGE_HEADER_SIZE && addr < self.0 + PAGE_SIZE);
        (addr - self.0 - MAIN_PAGE_HEADER_SIZE) / MAIN_ENTRY_SIZE
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.0 + PAGE_SIZE
    }

    /// Whether a compactor pass over this page would change anything:
    /// pending deltas, or a second version of some key below the
    /// low-water mark.
    pub fn needs_cleaning(&self, min_version: Version) -> bool {
        let entries = self.entries();
        let count = entries.len();
        let mut i = 0;
        while i < count {
            if entries[i].newest.load() != 0 {
                return true;
            }
            if i + 1 == count || entries[i].key != entries[i + 1].key {
                i += 1;
                continue;
            }
            let key = entries[i].key;
            i += 1;
            while i < count && entries[i].key == key {
                if entries[i].version < min_version {
                    return true;
                }
                i += 1;
            }
        }
        false
    }
}

/// First index past the run of `key` starting at `from`.
#[inline]
pub fn skip_key(entries: &[MainEntry], from: usize, key: u64) -> usize {
    let mut i = from;
    while i < entries.len() && entries[i].key == key {
        i += 1;
    }
    i
}

/// Iterates a record's update chain newest to oldest, skipping
/// reverted entries, and tracks the lowest version seen. The lowest
/// version determines how far back the main representation must still
/// be retained by a compactor.
pub struct UpdateChainIter {
    current: Option<&'static UpdateEntry>,
    lowest_version: Version,
}

impl UpdateChainIter {
    #[inline]
    pub fn new(head: &'static UpdateEntry) -> Self {
        let mut iter = UpdateChainIter {
            current: Some(head),
            lowest_version: Version::MAX,
        };
        iter.skip_reverted();
        iter
    }

    #[inline]
    fn skip_reverted(&mut self) {
        while let Some(e) = self.current {
            if !e.is_reverted() {
                return;
            }
            self.current = e.previous();
        }
    }

    /// Lowest version iterated so far, Version::MAX if none.
    #[inline]
    pub fn lowest_version(&self) -> Version {
        self.lowest_version
    }
}

impl Iterator for UpdateChainIter {
    type Item = &'static UpdateEntry;

    #[inline]
    fn next(&mut self) -> Option<&'static UpdateEntry> {
        let e = self.current?;
        debug_assert!(e.version <= self.lowest_version);
        self.lowest_version = e.version;
        self.current = e.previous();
        self.skip_reverted();
        Some(e)
    }
}

/// Layout-specific state shared by the read path, the scan executor
/// and the page modifiers.
pub enum LayoutContext {
    Row(RowStoreContext),
    Col(ColumnMapContext),
}

impl LayoutContext {
    #[inline]
    pub fn layout(&self) -> PageLayout {
        match self {
            LayoutContext::Row(_) => PageLayout::RowStore,
            LayoutContext::Col(_) => PageLayout::ColumnMap,
        }
    }

    /// Materialize row `idx` of a main page into tuple wire bytes.
    #[inline]
    pub fn materialize(&self, page: MainPage, idx: usize) -> Vec<u8> {
        match self {
            LayoutContext::Row(ctx) => ctx.materialize(page, idx),
            LayoutContext::Col(ctx) => ctx.materialize(page, idx),
        }
    }
}

/// Result of a visible-version lookup under a snapshot.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    NotFound,
    Found {
        version: Version,
        /// True iff the returned version is the absolute newest
        /// non-reverted version of the record.
        is_newest: bool,
        /// None if the visible version is a delete.
        data: Option<Vec<u8>>,
    },
}

/// Visible-version lookup: walk the delta chain newest first, stop at
/// the first version visible under the snapshot, fall through to the
/// main representation.
///
/// The caller must hold an epoch pin from before `word` was obtained.
pub fn read_record(
    ctx: &LayoutContext,
    word: u64,
    snapshot: &SnapshotDescriptor,
) -> ReadOutcome {
    let mut word = word;
    loop {
        match RecordRef::decode(word) {
            RecordRef::Log(ie) => {
                let newest = ie.newest.load();
                match NewestPtr::decode(newest) {
                    NewestRef::Invalid => return ReadOutcome::NotFound,
                    NewestRef::Main(me) => {
                        // the record was rebuilt by a compactor; the
                        // new main entry owns the chain now.
                        word = NewestPtr::encode_main(me);
                        continue;
                    }
                    NewestRef::Delta(head) => {
                        let mut newest_version = None;
                        if let Some(out) = read_chain(head, snapshot, &mut newest_version) {
                            return out;
                        }
                        return read_insert_base(ie, snapshot, newest_version);
                    }
                    NewestRef::None => {
                        return read_insert_base(ie, snapshot, None);
                    }
                }
            }
            RecordRef::Main(me) => {
                let newest = me.newest.load();
                match NewestPtr::decode(newest) {
                    NewestRef::Invalid => return ReadOutcome::NotFound,
                    NewestRef::Main(next) => {
                        word = NewestPtr::encode_main(next);
                        continue;
                    }
                    NewestRef::Delta(head) => {
                        let mut newest_version = None;
                        if let Some(out) = read_chain(head, snapshot, &mut newest_version) {
                            return out;
                        }
                        return read_main_run(ctx, me, snapshot, newest_version);
                    }
                    NewestRef::None => {
                        return read_main_run(ctx, me, snapshot, None);
                    }
                }
            }
        }
    }
}

fn read_chain(
    head: &'static UpdateEntry,
    snapshot: &SnapshotDescriptor,
    newest_version: &mut Option<Version>,
) -> Option<ReadOutcome> {
    let iter = UpdateChainIter::new(head);
    for e in iter {
        if newest_version.is_none() {
            *newest_version = Some(e.version);
        }
        if snapshot.is_visible(e.version) {
            let is_newest = *newest_version == Some(e.version);
            let data = if e.is_delete() {
                None
            } else {
                Some(e.data().to_vec())
            };
            return Some(ReadOutcome::Found {
                version: e.version,
                is_newest,
                data,
            });
        }
    }
    None
}

fn read_insert_base(
    ie: &'static InsertEntry,
    snapshot: &SnapshotDescriptor,
    newest_version: Option<Version>,
) -> ReadOutcome {
    if ie.is_reverted() {
        return ReadOutcome::NotFound;
    }
    let newest_version = newest_version.unwrap_or(ie.version);
    if snapshot.is_visible(ie.version) {
        return ReadOutcome::Found {
            version: ie.version,
            is_newest: newest_version == ie.version,
            data: Some(ie.data().to_vec()),
        };
    }
    ReadOutcome::NotFound
}

fn read_main_run(
    ctx: &LayoutContext,
    me: &'static MainEntry,
    snapshot: &SnapshotDescriptor,
    mut newest_version: Option<Version>,
) -> ReadOutcome {
    let page = MainPage::from_entry(me);
    let entries = page.entries();
    let sizes = page.sizes();
    let key = me.key;
    let mut i = page.entry_idx(me);
    while i < entries.len() && entries[i].key == key {
        let v = entries[i].version;
        if newest_version.is_none() {
            newest_version = Some(v);
        }
        if snapshot.is_visible(v) {
            let is_newest = newest_version == Some(v);
            if sizes[i] == 0 {
                return ReadOutcome::Found {
                    version: v,
                    is_newest,
                    data: None,
                };
            }
            return ReadOutcome::Found {
                version: v,
                is_newest,
                data: Some(ctx.materialize(page, i)),
            };
        }
        i += 1;
    }
    ReadOutcome::NotFound
}

/// State of the absolute newest non-reverted version of a record,
/// used by write paths to decide between success and conflict.
pub struct NewestVersion {
    pub version: Version,
    pub is_delete: bool,
}

/// Inspect the absolute newest version reachable from a record whose
/// `newest` word decoded to `chain` (None for an empty chain).
/// `base` supplies the record's own newest version when the chain is
/// empty or fully reverted.
pub fn newest_version_of(
    chain: Option<&'static UpdateEntry>,
    base: Option<NewestVersion>,
) -> Option<NewestVersion> {
    if let Some(head) = chain {
        let mut iter = UpdateChainIter::new(head);
        if let Some(e) = iter.next() {
            return Some(NewestVersion {
                version: e.version,
                is_delete: e.is_delete(),
            });
        }
    }
    base
}

/// Newest version of a main record's own run (the run's first row).
#[inline]
pub fn main_base_version(me: &'static MainEntry) -> NewestVersion {
    let page = MainPage::from_entry(me);
    let idx = page.entry_idx(me);
    NewestVersion {
        version: me.version,
        is_delete: page.sizes()[idx] == 0,
    }
}

/// Newest version of a log record's own insert entry.
#[inline]
pub fn insert_base_version(ie: &'static InsertEntry) -> Option<NewestVersion> {
    if ie.is_reverted() {
        return None;
    }
    Some(NewestVersion {
        version: ie.version,
        is_delete: false,
    })
}

/// The per-layout compactor interface. Layout dispatch happens once
/// per GC pass, not per record.
pub trait PageModifier {
    /// Rebuild one source page plus the delta chains hanging off its
    /// records. Returns false if the page needed no cleaning and was
    /// kept as-is.
    fn clean(&mut self, page: PagePtr) -> Result<bool>;

    /// Retain a source page untouched; used when a pass aborts
    /// halfway.
    fn keep_page(&mut self, page: PagePtr);

    /// Fold a record still living in the insert log into the fill
    /// page. Returns false if the record had no surviving version and
    /// was invalidated instead.
    fn append(&mut self, ie: &'static InsertEntry) -> Result<bool>;

    /// Publish pending output and return (new page list, retired
    /// source pages).
    fn finish(self) -> (Vec<PagePtr>, Vec<PagePtr>);
}

/// A deferred CAS installing a rebuilt main entry as a source
/// record's `newest`, executed when the fill page is published.
pub struct PointerAction {
    /// The source record's newest slot.
    pub target: &'static NewestPtr,
    /// The chain head observed while the record was processed.
    pub expected: u64,
    /// First row of the rebuilt record in the fill page.
    pub desired: &'static MainEntry,
    /// Key for the index rewrite.
    pub key: u64,
    /// Index record word expected to still name the source record.
    pub index_expected: u64,
}

impl PointerAction {
    /// Install the new main entry, carrying any delta chain that
    /// arrived during compaction forward onto the new record. Without
    /// the carry, writes concurrent with compaction would be lost.
    #[inline]
    pub fn execute(mut self, index: &crate::index::OpenAddressingTable, table_id: u64) {
        let desired_word = NewestPtr::encode_main(self.desired);
        while let Err(observed) = self.target.compare_exchange(self.expected, desired_word) {
            self.desired.newest.store(observed);
            self.expected = observed;
        }
        // shortcut future lookups; a failure means a concurrent
        // writer already repointed the key, which keeps the record
        // reachable through the old entry's Main tag.
        let _ = index.update(
            table_id,
            self.key,
            self.index_expected,
            NewestPtr::encode_main(self.desired),
        );
    }
}
