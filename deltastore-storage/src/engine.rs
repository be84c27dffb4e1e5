use crate::buffer::PageManager;
use crate::commit::{CommitManager, SnapshotDescriptor};
use crate::config::StorageConfig;
use crate::deltamain::PageLayout;
use crate::error::{Error, Result};
use crate::lifetime::StaticLifetime;
use crate::table::scan::{ScanQuery, ScanSink};
use crate::table::{Table, Tuple};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use deltastore_catalog::{Schema, TableId};
use flume::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

enum Gc {
    Trigger,
    Stop,
}

/// The storage façade: owns the page manager, the commit manager and
/// all tables, and drives the background garbage collection thread.
pub struct Storage {
    config: StorageConfig,
    page_manager: &'static PageManager,
    commit: CommitManager,
    tables_by_name: DashMap<String, TableId>,
    tables: DashMap<TableId, &'static Table>,
    next_table_id: AtomicU64,
    gc_chan: Sender<Gc>,
    gc_thread: Mutex<Option<JoinHandle<()>>>,
}

unsafe impl StaticLifetime for Storage {}

impl Storage {
    /// Reserve the page pool and start the GC thread.
    pub fn open(config: StorageConfig) -> Result<&'static Storage> {
        let page_manager =
            PageManager::with_capacity_static(config.total_memory.as_u64() as usize)?;
        let (gc_chan, gc_rx) = flume::unbounded();
        let storage: &'static Storage = StaticLifetime::new_static(Storage {
            config,
            page_manager,
            commit: CommitManager::new(),
            tables_by_name: DashMap::new(),
            tables: DashMap::new(),
            next_table_id: AtomicU64::new(1),
            gc_chan,
            gc_thread: Mutex::new(None),
        });
        let handle = std::thread::Builder::new()
            .name(String::from("GC-Thread"))
            .spawn(move || storage.gc_loop(gc_rx))
            .unwrap();
        *storage.gc_thread.lock() = Some(handle);
        Ok(storage)
    }

    fn gc_loop(&'static self, gc_rx: Receiver<Gc>) {
        let interval = Duration::from_millis(self.config.gc_interval_ms);
        tracing::debug!("gc thread started, interval {interval:?}");
        loop {
            match gc_rx.recv_timeout(interval) {
                Ok(Gc::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(Gc::Trigger) | Err(RecvTimeoutError::Timeout) => self.run_gc(),
            }
        }
        tracing::debug!("gc thread stopped");
    }

    /// Run one GC pass over every table at the current low-water
    /// mark.
    pub fn run_gc(&self) {
        let min_version = self.commit.lowest_active_version();
        for entry in self.tables.iter() {
            let table = *entry.value();
            if let Err(e) = table.run_gc(min_version) {
                tracing::warn!("gc pass on table {} failed: {e}", table.name());
            }
        }
    }

    /// Wake the GC thread ahead of its interval.
    #[inline]
    pub fn trigger_gc(&self) {
        let _ = self.gc_chan.send(Gc::Trigger);
    }

    /// Stop the GC thread. Tables and pages stay leaked; the process
    /// owns them for its remaining lifetime.
    pub fn shutdown(&'static self) {
        let _ = self.gc_chan.send(Gc::Stop);
        if let Some(handle) = self.gc_thread.lock().take() {
            let _ = handle.join();
        }
    }

    #[inline]
    pub fn commit_manager(&self) -> &CommitManager {
        &self.commit
    }

    #[inline]
    pub fn start_tx(&self) -> SnapshotDescriptor {
        self.commit.start_tx()
    }

    #[inline]
    pub fn commit(&self, snapshot: &SnapshotDescriptor) {
        self.commit.commit(snapshot.version());
    }

    /// Abort a transaction. The caller must revert every write made
    /// under this snapshot first.
    #[inline]
    pub fn abort(&self, snapshot: &SnapshotDescriptor) {
        self.commit.abort(snapshot.version());
    }

    pub fn create_table(&self, name: &str, schema: Schema) -> Result<TableId> {
        self.create_table_with_layout(name, schema, self.config.page_layout)
    }

    pub fn create_table_with_layout(
        &self,
        name: &str,
        schema: Schema,
        layout: PageLayout,
    ) -> Result<TableId> {
        match self.tables_by_name.entry(String::from(name)) {
            Entry::Occupied(_) => Err(Error::TableAlreadyExists),
            Entry::Vacant(v) => {
                let table_id = self.next_table_id.fetch_add(1, Ordering::SeqCst);
                let table = Table::new(
                    table_id,
                    name,
                    schema,
                    layout,
                    self.page_manager,
                    self.config.hash_capacity,
                    self.config.max_scans,
                );
                self.tables.insert(table_id, StaticLifetime::new_static(table));
                v.insert(table_id);
                tracing::debug!("created table {name} ({table_id}, {layout:?})");
                Ok(table_id)
            }
        }
    }

    pub fn get_table(&self, name: &str) -> Result<&'static Table> {
        let id = *self.tables_by_name.get(name).ok_or(Error::TableNotFound)?;
        self.table(id)
    }

    #[inline]
    pub fn table(&self, table_id: TableId) -> Result<&'static Table> {
        self.tables
            .get(&table_id)
            .map(|t| *t)
            .ok_or(Error::InvalidTable)
    }

    #[inline]
    pub fn get(
        &self,
        table_id: TableId,
        key: u64,
        snapshot: &SnapshotDescriptor,
    ) -> Result<Option<Tuple>> {
        Ok(self.table(table_id)?.get(key, snapshot))
    }

    #[inline]
    pub fn insert(
        &self,
        table_id: TableId,
        key: u64,
        data: &[u8],
        snapshot: &SnapshotDescriptor,
    ) -> Result<bool> {
        self.table(table_id)?.insert(key, data, snapshot)
    }

    #[inline]
    pub fn update(
        &self,
        table_id: TableId,
        key: u64,
        data: &[u8],
        snapshot: &SnapshotDescriptor,
    ) -> Result<bool> {
        self.table(table_id)?.update(key, data, snapshot)
    }

    #[inline]
    pub fn remove(
        &self,
        table_id: TableId,
        key: u64,
        snapshot: &SnapshotDescriptor,
    ) -> Result<bool> {
        self.table(table_id)?.remove(key, snapshot)
    }

    #[inline]
    pub fn revert(
        &self,
        table_id: TableId,
        key: u64,
        snapshot: &SnapshotDescriptor,
    ) -> Result<bool> {
        self.table(table_id)?.revert(key, snapshot)
    }

    #[inline]
    pub fn scan(
        &self,
        table_id: TableId,
        query: &ScanQuery,
        snapshot: &SnapshotDescriptor,
        sink: &mut dyn ScanSink,
    ) -> Result<()> {
        self.table(table_id)?.scan(query, snapshot, sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::scan::{AggOp, CmpOp, Predicate, ScanQuery, Selection};
    use deltastore_catalog::{Field, FieldType, TupleBuilder, TupleReader, Value};
    use easy_parallel::Parallel;
    use rand::{Rng, SeedableRng};

    fn test_storage() -> &'static Storage {
        let config = StorageConfig::default()
            .total_memory(256u64 * 1024 * 1024)
            .hash_capacity(1 << 18)
            // background GC stays quiet; tests trigger passes
            // explicitly.
            .gc_interval_ms(3_600_000);
        Storage::open(config).unwrap()
    }

    fn wide_schema() -> Schema {
        Schema::new(vec![
            Field::new("number", FieldType::Int),
            Field::new("text1", FieldType::Text),
            Field::new("largenumber", FieldType::BigInt),
            Field::new("text2", FieldType::Text),
        ])
        .unwrap()
    }

    fn wide_tuple(number: i32, text1: &str, largenumber: i64, text2: &str) -> Vec<u8> {
        TupleBuilder::from_values(
            &wide_schema(),
            &[
                Value::Int(number),
                Value::from(text1),
                Value::BigInt(largenumber),
                Value::from(text2),
            ],
        )
        .unwrap()
    }

    fn snap(version: u64) -> SnapshotDescriptor {
        SnapshotDescriptor::latest_committed(version)
    }

    #[test]
    fn test_insert_visible_only_from_its_version() {
        let storage = test_storage();
        let table_id = storage.create_table("e1", wide_schema()).unwrap();
        let data = wide_tuple(12, "hello", 0x7FFF_FFFF_0000_0001, "world");
        assert!(storage.insert(table_id, 1, &data, &snap(10)).unwrap());
        let tuple = storage.get(table_id, 1, &snap(10)).unwrap().unwrap();
        assert_eq!(tuple.data, data);
        assert_eq!(tuple.version, 10);
        assert!(tuple.is_newest);
        assert!(storage.get(table_id, 1, &snap(9)).unwrap().is_none());
        storage.shutdown();
    }

    #[test]
    fn test_compaction_keeps_all_keys() {
        let storage = test_storage();
        let table_id = storage.create_table("e2", wide_schema()).unwrap();
        let table = storage.table(table_id).unwrap();
        for key in 1..=100u64 {
            let data = wide_tuple(key as i32, "k", key as i64, "v");
            assert!(storage
                .insert(table_id, key, &data, &snap(9 + key))
                .unwrap());
        }
        table.run_gc(200).unwrap();
        let pages_after_first = table.main_page_count();
        assert!(pages_after_first >= 1);
        for key in 1..=100u64 {
            let tuple = storage.get(table_id, key, &snap(300)).unwrap().unwrap();
            assert_eq!(tuple.data, wide_tuple(key as i32, "k", key as i64, "v"));
            assert_eq!(tuple.version, 9 + key);
        }
        // a second pass over already-compacted pages must not grow
        // the main.
        table.run_gc(200).unwrap();
        assert!(table.main_page_count() <= pages_after_first);
        storage.shutdown();
    }

    #[test]
    fn test_version_chain_visibility() {
        let storage = test_storage();
        let table_id = storage.create_table("e3", wide_schema()).unwrap();
        let v10 = wide_tuple(1, "a", 1, "x");
        let v20 = wide_tuple(2, "b", 2, "y");
        let v30 = wide_tuple(3, "c", 3, "z");
        assert!(storage.insert(table_id, 1, &v10, &snap(10)).unwrap());
        assert!(storage.update(table_id, 1, &v20, &snap(20)).unwrap());
        assert!(storage.update(table_id, 1, &v30, &snap(30)).unwrap());
        assert!(storage.remove(table_id, 1, &snap(40)).unwrap());
        let check = |storage: &Storage| {
            let t25 = storage.get(table_id, 1, &snap(25)).unwrap().unwrap();
            assert_eq!(t25.data, v20);
            assert_eq!(t25.version, 20);
            assert!(!t25.is_newest);
            let t35 = storage.get(table_id, 1, &snap(35)).unwrap().unwrap();
            assert_eq!(t35.data, v30);
            assert!(storage.get(table_id, 1, &snap(45)).unwrap().is_none());
        };
        check(storage);
        // compaction is a semantic no-op for live snapshots.
        storage.table(table_id).unwrap().run_gc(0).unwrap();
        check(storage);
        storage.table(table_id).unwrap().run_gc(0).unwrap();
        check(storage);
        storage.shutdown();
    }

    #[test]
    fn test_concurrent_insert_single_winner() {
        let storage = test_storage();
        let table_id = storage.create_table("e4", wide_schema()).unwrap();
        let data = wide_tuple(7, "seven", 7, "seven");
        for round in 0..16u64 {
            let key = 100 + round;
            let wins: Vec<bool> = Parallel::new()
                .each(0..4, |_| {
                    let snapshot = storage.start_tx();
                    let won = storage.insert(table_id, key, &data, &snapshot).unwrap();
                    storage.commit(&snapshot);
                    won
                })
                .run();
            assert_eq!(wins.iter().filter(|w| **w).count(), 1);
            let tuple = storage
                .get(table_id, key, &storage.start_tx())
                .unwrap()
                .unwrap();
            assert_eq!(tuple.data, data);
        }
        storage.shutdown();
    }

    #[test]
    fn test_revert_exposes_predecessor() {
        let storage = test_storage();
        let table_id = storage.create_table("e5", wide_schema()).unwrap();
        let old = wide_tuple(1, "old", 1, "old");
        let new = wide_tuple(2, "new", 2, "new");
        assert!(storage.insert(table_id, 5, &old, &snap(10)).unwrap());
        assert!(storage.update(table_id, 5, &new, &snap(50)).unwrap());
        assert!(storage.revert(table_id, 5, &snap(50)).unwrap());
        let tuple = storage.get(table_id, 5, &snap(60)).unwrap().unwrap();
        assert_eq!(tuple.data, old);
        assert_eq!(tuple.version, 10);
        assert!(tuple.is_newest);
        // nothing left to revert at that version.
        assert!(!storage.revert(table_id, 5, &snap(50)).unwrap());
        storage.shutdown();
    }

    #[test]
    fn test_colmap_var_payload_round_trip_through_compaction() {
        let storage = test_storage();
        let schema = Schema::new(vec![
            Field::new("id", FieldType::Int),
            Field::new("payload", FieldType::Blob),
        ])
        .unwrap();
        let table_id = storage
            .create_table_with_layout("e6", schema.clone(), PageLayout::ColumnMap)
            .unwrap();
        let table = storage.table(table_id).unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5EED);
        let mut originals = vec![];
        for key in 0..500u64 {
            let len = rng.gen_range(0..=1024);
            let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let data = TupleBuilder::from_values(
                &schema,
                &[Value::Int(key as i32), Value::Blob(payload)],
            )
            .unwrap();
            assert!(storage.insert(table_id, key, &data, &snap(key + 1)).unwrap());
            originals.push(data);
        }
        table.run_gc(0).unwrap();
        for key in 0..500u64 {
            let tuple = storage.get(table_id, key, &snap(1000)).unwrap().unwrap();
            assert_eq!(tuple.data, originals[key as usize], "key {key}");
        }
        // compacting twice yields identical user-visible content.
        table.run_gc(0).unwrap();
        for key in 0..500u64 {
            let tuple = storage.get(table_id, key, &snap(1000)).unwrap().unwrap();
            assert_eq!(tuple.data, originals[key as usize]);
        }
        storage.shutdown();
    }

    #[test]
    fn test_rowstore_round_trip_through_compaction() {
        let storage = test_storage();
        let table_id = storage
            .create_table_with_layout("rows", wide_schema(), PageLayout::RowStore)
            .unwrap();
        let table = storage.table(table_id).unwrap();
        for key in 1..=50u64 {
            let data = wide_tuple(key as i32, "text", key as i64 * 3, "more");
            assert!(storage.insert(table_id, key, &data, &snap(key)).unwrap());
        }
        // delete half, below and above the water.
        for key in 1..=25u64 {
            assert!(storage.remove(table_id, key, &snap(100 + key)).unwrap());
        }
        table.run_gc(60).unwrap();
        for key in 1..=50u64 {
            let got = storage.get(table_id, key, &snap(200)).unwrap();
            if key <= 25 {
                assert!(got.is_none(), "key {key} should be deleted");
            } else {
                assert_eq!(
                    got.unwrap().data,
                    wide_tuple(key as i32, "text", key as i64 * 3, "more")
                );
            }
        }
        // second pass folds the tombstones below the new water line
        // and drops the records entirely.
        table.run_gc(200).unwrap();
        for key in 1..=25u64 {
            assert!(storage.get(table_id, key, &snap(300)).unwrap().is_none());
        }
        storage.shutdown();
    }

    #[test]
    fn test_delete_then_reinsert_equals_insert() {
        let storage = test_storage();
        let table_id = storage.create_table("reins", wide_schema()).unwrap();
        let data = wide_tuple(9, "nine", 9, "nine");
        assert!(storage.insert(table_id, 9, &data, &snap(10)).unwrap());
        assert!(storage.remove(table_id, 9, &snap(20)).unwrap());
        assert!(storage.insert(table_id, 9, &data, &snap(30)).unwrap());
        let tuple = storage.get(table_id, 9, &snap(40)).unwrap().unwrap();
        assert_eq!(tuple.data, data);
        assert_eq!(tuple.version, 30);
        assert!(tuple.is_newest);
        // still true after folding the chain into the main.
        storage.table(table_id).unwrap().run_gc(35).unwrap();
        let tuple = storage.get(table_id, 9, &snap(40)).unwrap().unwrap();
        assert_eq!(tuple.data, data);
        assert_eq!(tuple.version, 30);
        storage.shutdown();
    }

    #[test]
    fn test_scan_full_projection_aggregation() {
        let storage = test_storage();
        let table_id = storage.create_table("scan", wide_schema()).unwrap();
        for key in 1..=10u64 {
            let data = wide_tuple(key as i32, "name", key as i64 * 10, "tail");
            assert!(storage.insert(table_id, key, &data, &snap(key)).unwrap());
        }
        // compact half the data into a main page so the scan covers
        // both main pages and the insert log.
        storage.table(table_id).unwrap().run_gc(0).unwrap();
        for key in 11..=20u64 {
            let data = wide_tuple(key as i32, "name", key as i64 * 10, "tail");
            assert!(storage.insert(table_id, key, &data, &snap(key)).unwrap());
        }
        let snapshot = snap(100);
        // full scan with a pushdown predicate.
        let query = ScanQuery::full(Selection::new(vec![Predicate {
            field: 0,
            op: CmpOp::Greater,
            value: Value::Int(15),
        }]));
        let mut rows: Vec<(u64, Vec<u8>)> = vec![];
        storage.scan(table_id, &query, &snapshot, &mut rows).unwrap();
        assert_eq!(rows.len(), 5);
        // projection keeps the requested fields only.
        let query = ScanQuery::projection(Selection::all(), vec![2, 1]);
        let mut rows: Vec<(u64, Vec<u8>)> = vec![];
        storage.scan(table_id, &query, &snapshot, &mut rows).unwrap();
        assert_eq!(rows.len(), 20);
        let proj_schema = wide_schema().project(&[2, 1]).unwrap();
        let mut sum = 0i64;
        for (_, data) in &rows {
            let reader = TupleReader::new(&proj_schema, data).unwrap();
            match reader.value(0).unwrap() {
                Value::BigInt(v) => sum += v,
                other => panic!("unexpected {other:?}"),
            }
            assert_eq!(reader.value(1).unwrap(), Value::from("name"));
        }
        assert_eq!(sum, (1..=20).map(|k| k * 10).sum::<i64>());
        // aggregation folds to a single row.
        let query = ScanQuery::aggregation(
            Selection::all(),
            vec![(AggOp::Count, 0), (AggOp::Sum, 2), (AggOp::Max, 0)],
        );
        let mut rows: Vec<(u64, Vec<u8>)> = vec![];
        storage.scan(table_id, &query, &snapshot, &mut rows).unwrap();
        assert_eq!(rows.len(), 1);
        let agg_schema = query
            .aggregation_schema(storage.table(table_id).unwrap().schema())
            .unwrap();
        let reader = TupleReader::new(&agg_schema, &rows[0].1).unwrap();
        assert_eq!(reader.value(0).unwrap(), Value::BigInt(20));
        assert_eq!(reader.value(1).unwrap(), Value::BigInt(2100));
        assert_eq!(reader.value(2).unwrap(), Value::Int(20));
        storage.shutdown();
    }

    #[test]
    fn test_scan_snapshot_isolation_under_concurrent_writers() {
        let storage = test_storage();
        let schema = Schema::new(vec![Field::new("val", FieldType::BigInt)]).unwrap();
        let table_id = storage.create_table("writers", schema.clone()).unwrap();
        let threads = 16u64;
        let keys_per_thread = 100_000 / threads;
        let before = storage.start_tx();
        let results: Vec<()> = Parallel::new()
            .each(0..threads, |t| {
                for i in 0..keys_per_thread {
                    let key = i * threads + t;
                    let data = TupleBuilder::from_values(
                        &schema,
                        &[Value::BigInt(key as i64)],
                    )
                    .unwrap();
                    let snapshot = storage.start_tx();
                    assert!(storage.insert(table_id, key, &data, &snapshot).unwrap());
                    storage.commit(&snapshot);
                }
            })
            .run();
        assert_eq!(results.len(), threads as usize);
        // the pre-write snapshot still observes nothing.
        let query = ScanQuery::full(Selection::all());
        let mut rows: Vec<(u64, Vec<u8>)> = vec![];
        storage.scan(table_id, &query, &before, &mut rows).unwrap();
        assert_eq!(rows.len(), 0);
        storage.commit(&before);
        // a post-commit snapshot observes every insert exactly once.
        let after = storage.start_tx();
        let mut rows: Vec<(u64, Vec<u8>)> = vec![];
        storage.scan(table_id, &query, &after, &mut rows).unwrap();
        assert_eq!(rows.len(), 100_000);
        storage.commit(&after);
        storage.shutdown();
    }

    #[test]
    fn test_update_races_compaction() {
        let storage = test_storage();
        let table_id = storage.create_table("race2", wide_schema()).unwrap();
        let table = storage.table(table_id).unwrap();
        let v0 = wide_tuple(0, "v0", 0, "v0");
        let v1 = wide_tuple(1, "v1", 1, "v1");
        for round in 0..50u64 {
            let key = round;
            let base = round * 10;
            assert!(storage.insert(table_id, key, &v0, &snap(base + 1)).unwrap());
            Parallel::new()
                .add(|| {
                    assert!(storage
                        .update(table_id, key, &v1, &snap(base + 2))
                        .unwrap());
                })
                .add(|| {
                    table.run_gc(base + 1).unwrap();
                })
                .run();
            let tuple = storage.get(table_id, key, &snap(base + 5)).unwrap().unwrap();
            assert_eq!(tuple.data, v1, "round {round}");
            assert_eq!(tuple.version, base + 2);
        }
        storage.shutdown();
    }

    #[test]
    fn test_pointer_actions_carry_concurrent_updates() {
        let storage = test_storage();
        let schema = Schema::new(vec![Field::new("val", FieldType::BigInt)]).unwrap();
        let table_id = storage.create_table("carry", schema.clone()).unwrap();
        let table = storage.table(table_id).unwrap();
        let keys = 1000u64;
        for key in 0..keys {
            let data =
                TupleBuilder::from_values(&schema, &[Value::BigInt(-1)]).unwrap();
            assert!(storage.insert(table_id, key, &data, &snap(key + 1)).unwrap());
        }
        // compactors rebuild the pages while a writer updates every
        // record; the pointer-action carry must keep all updates
        // reachable.
        Parallel::new()
            .add(|| {
                for _ in 0..20 {
                    table.run_gc(keys).unwrap();
                }
            })
            .add(|| {
                for key in 0..keys {
                    let data = TupleBuilder::from_values(
                        &schema,
                        &[Value::BigInt(key as i64)],
                    )
                    .unwrap();
                    assert!(storage
                        .update(table_id, key, &data, &snap(keys + key + 1))
                        .unwrap());
                }
            })
            .run();
        let snapshot = snap(10_000);
        for key in 0..keys {
            let tuple = storage.get(table_id, key, &snapshot).unwrap().unwrap();
            let reader = TupleReader::new(&schema, &tuple.data).unwrap();
            assert_eq!(reader.value(0).unwrap(), Value::BigInt(key as i64));
            assert_eq!(tuple.version, keys + key + 1);
            assert!(tuple.is_newest);
        }
        // and they survive the next compaction.
        table.run_gc(2 * keys + 1).unwrap();
        for key in 0..keys {
            let tuple = storage.get(table_id, key, &snapshot).unwrap().unwrap();
            let reader = TupleReader::new(&schema, &tuple.data).unwrap();
            assert_eq!(reader.value(0).unwrap(), Value::BigInt(key as i64));
        }
        storage.shutdown();
    }

    #[test]
    fn test_multi_page_compaction_with_large_payloads() {
        let storage = test_storage();
        let schema = Schema::new(vec![
            Field::new("id", FieldType::Int),
            Field::new("payload", FieldType::Blob),
        ])
        .unwrap();
        let table_id = storage.create_table("large", schema.clone()).unwrap();
        let table = storage.table(table_id).unwrap();
        // ten records of ~600 KiB force several fill pages.
        let mut originals = vec![];
        for key in 0..10u64 {
            let payload = vec![key as u8; 600 * 1024];
            let data = TupleBuilder::from_values(
                &schema,
                &[Value::Int(key as i32), Value::Blob(payload)],
            )
            .unwrap();
            assert!(storage.insert(table_id, key, &data, &snap(key + 1)).unwrap());
            originals.push(data);
        }
        table.run_gc(0).unwrap();
        assert!(table.main_page_count() >= 3);
        for key in 0..10u64 {
            let tuple = storage.get(table_id, key, &snap(100)).unwrap().unwrap();
            assert_eq!(tuple.data, originals[key as usize]);
        }
        storage.shutdown();
    }

    #[test]
    fn test_scan_cancel() {
        let storage = test_storage();
        let table_id = storage.create_table("cancel", wide_schema()).unwrap();
        let table = storage.table(table_id).unwrap();
        let data = wide_tuple(1, "a", 1, "b");
        assert!(storage.insert(table_id, 1, &data, &snap(1)).unwrap());
        // a cancelled query stops without emitting.
        let query = ScanQuery::full(Selection::all());
        query.cancel();
        let mut rows: Vec<(u64, Vec<u8>)> = vec![];
        table.scan(&query, &snap(10), &mut rows).unwrap();
        assert!(rows.is_empty());
        storage.shutdown();
    }

    #[test]
    fn test_scan_overload() {
        let config = StorageConfig::default()
            .total_memory(16u64 * 1024 * 1024)
            .hash_capacity(1 << 10)
            .gc_interval_ms(3_600_000)
            .max_scans(0);
        let storage = Storage::open(config).unwrap();
        let table_id = storage.create_table("slots", wide_schema()).unwrap();
        let query = ScanQuery::full(Selection::all());
        let mut rows: Vec<(u64, Vec<u8>)> = vec![];
        assert!(matches!(
            storage.scan(table_id, &query, &snap(10), &mut rows),
            Err(Error::ServerOverload)
        ));
        storage.shutdown();
    }

    /// Randomized ops checked against a reference model, with
    /// compaction runs interleaved: get must return the newest
    /// visible version before and after every pass, and versions
    /// below the floor must never resurface.
    #[test]
    fn test_random_ops_match_reference_model() {
        use std::collections::HashMap;

        let storage = test_storage();
        let schema = Schema::new(vec![
            Field::new("id", FieldType::BigInt),
            Field::new("name", FieldType::Text),
        ])
        .unwrap();
        let table_id = storage.create_table("model", schema.clone()).unwrap();
        let table = storage.table(table_id).unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(0xDE17A);
        let key_space = 40u64;
        // committed history per key: (version, payload or tombstone).
        let mut history: HashMap<u64, Vec<(u64, Option<Vec<u8>>)>> = HashMap::new();
        let newest = |history: &HashMap<u64, Vec<(u64, Option<Vec<u8>>)>>, key: u64| {
            history.get(&key).and_then(|h| h.last()).cloned()
        };
        let visible = |history: &HashMap<u64, Vec<(u64, Option<Vec<u8>>)>>,
                       key: u64,
                       at: u64| {
            history
                .get(&key)
                .and_then(|h| h.iter().rev().find(|(v, _)| *v <= at))
                .and_then(|(v, data)| data.clone().map(|d| (*v, d)))
        };
        let mut version = 0u64;
        let mut floor = 0u64;
        for _ in 0..6 {
            for _ in 0..200 {
                version += 1;
                let key = rng.gen_range(0..key_space);
                let snapshot = snap(version);
                let alive = matches!(newest(&history, key), Some((_, Some(_))));
                match rng.gen_range(0..3) {
                    0 => {
                        let data = TupleBuilder::from_values(
                            &schema,
                            &[Value::BigInt(version as i64), Value::from("ins")],
                        )
                        .unwrap();
                        let ok = storage.insert(table_id, key, &data, &snapshot).unwrap();
                        assert_eq!(ok, !alive, "insert key {key} at {version}");
                        if ok {
                            history.entry(key).or_default().push((version, Some(data)));
                        }
                    }
                    1 => {
                        let data = TupleBuilder::from_values(
                            &schema,
                            &[Value::BigInt(version as i64), Value::from("upd")],
                        )
                        .unwrap();
                        let ok = storage.update(table_id, key, &data, &snapshot).unwrap();
                        assert_eq!(ok, alive, "update key {key} at {version}");
                        if ok {
                            history.entry(key).or_default().push((version, Some(data)));
                        }
                    }
                    _ => {
                        let ok = storage.remove(table_id, key, &snapshot).unwrap();
                        assert_eq!(ok, alive, "remove key {key} at {version}");
                        if ok {
                            history.entry(key).or_default().push((version, None));
                        }
                    }
                }
            }
            let verify = |rng: &mut rand::rngs::StdRng,
                          history: &HashMap<u64, Vec<(u64, Option<Vec<u8>>)>>,
                          floor: u64| {
                for _ in 0..50 {
                    let at = rng.gen_range(floor..=version);
                    let key = rng.gen_range(0..key_space);
                    let got = storage.get(table_id, key, &snap(at)).unwrap();
                    match visible(history, key, at) {
                        None => assert!(got.is_none(), "key {key} at {at}"),
                        Some((v, data)) => {
                            let tuple = got.unwrap_or_else(|| {
                                panic!("key {key} at {at} lost version {v}")
                            });
                            assert_eq!(tuple.version, v, "key {key} at {at}");
                            assert_eq!(tuple.data, data, "key {key} at {at}");
                        }
                    }
                }
            };
            verify(&mut rng, &history, floor);
            // fold everything below a new floor and re-verify above
            // it: compaction must be a semantic no-op there.
            floor = version.saturating_sub(rng.gen_range(0..100)).max(floor);
            table.run_gc(floor).unwrap();
            // apply the same folding rules to the model: drop
            // versions below the floor entry, stop at a delete at or
            // below the floor, and cancel delete/data pairs
            // straddling it.
            for h in history.values_mut() {
                let mut out: Vec<(u64, Option<Vec<u8>>)> = vec![];
                let mut was_delete = false;
                for (v, data) in h.iter().rev() {
                    if was_delete && *v < floor {
                        out.pop();
                        break;
                    }
                    match data {
                        None => {
                            if *v <= floor {
                                break;
                            }
                            out.push((*v, None));
                            was_delete = true;
                        }
                        Some(d) => {
                            out.push((*v, Some(d.clone())));
                            was_delete = false;
                        }
                    }
                    if *v <= floor {
                        break;
                    }
                }
                out.reverse();
                *h = out;
            }
            verify(&mut rng, &history, floor);
        }
        storage.shutdown();
    }

    #[test]
    fn test_create_table_name_exists() {
        let storage = test_storage();
        storage.create_table("dup", wide_schema()).unwrap();
        assert!(matches!(
            storage.create_table("dup", wide_schema()),
            Err(Error::TableAlreadyExists)
        ));
        assert!(matches!(
            storage.get_table("missing"),
            Err(Error::TableNotFound)
        ));
        assert!(matches!(storage.table(999), Err(Error::InvalidTable)));
        storage.shutdown();
    }

    #[test]
    fn test_log_pages_retired_after_compaction() {
        let storage = test_storage();
        let schema = Schema::new(vec![
            Field::new("id", FieldType::Int),
            Field::new("payload", FieldType::Blob),
        ])
        .unwrap();
        let table_id = storage.create_table("retire", schema.clone()).unwrap();
        let table = storage.table(table_id).unwrap();
        // fill several insert-log pages, then delete most records so
        // compaction can drop them below the water line.
        for key in 0..40u64 {
            let payload = vec![0xAB; 200 * 1024];
            let data = TupleBuilder::from_values(
                &schema,
                &[Value::Int(key as i32), Value::Blob(payload)],
            )
            .unwrap();
            assert!(storage.insert(table_id, key, &data, &snap(key + 1)).unwrap());
        }
        for key in 0..30u64 {
            assert!(storage.remove(table_id, key, &snap(100 + key)).unwrap());
        }
        let before = storage.page_manager.allocated();
        table.run_gc(200).unwrap();
        table.run_gc(200).unwrap();
        // force epoch reclamation so deferred frees land.
        for _ in 0..4096 {
            let g = crate::buffer::pin();
            g.flush();
        }
        let after = storage.page_manager.allocated();
        assert!(after < before, "before={before} after={after}");
        // surviving records read from the compacted main.
        for key in 0..40u64 {
            let got = storage.get(table_id, key, &snap(1000)).unwrap();
            assert_eq!(got.is_some(), key >= 30, "key {key}");
        }
        storage.shutdown();
    }
}
