use crate::buffer::pin;
use crate::commit::SnapshotDescriptor;
use crate::deltamain::{
    read_record, skip_key, InsertEntry, MainPage, NewestPtr, NewestRef, ReadOutcome, RecordRef,
};
use crate::error::{Error, Result};
use crate::log::LOG_INSERT;
use crate::table::Table;
use deltastore_catalog::{Field, FieldType, Schema, TupleBuilder, TupleReader, Value};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanQueryKind {
    FullScan,
    Projection,
    Aggregation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

/// One pushdown comparison against a declared field.
#[derive(Debug, Clone)]
pub struct Predicate {
    pub field: usize,
    pub op: CmpOp,
    pub value: Value,
}

/// Conjunction of predicates; empty matches everything.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub predicates: Vec<Predicate>,
}

impl Selection {
    #[inline]
    pub fn all() -> Self {
        Selection { predicates: vec![] }
    }

    #[inline]
    pub fn new(predicates: Vec<Predicate>) -> Self {
        Selection { predicates }
    }

    fn matches(&self, reader: &TupleReader) -> Result<bool> {
        for p in &self.predicates {
            let value = reader.value(p.field)?;
            let ord = value.compare(&p.value).ok_or(Error::InvalidArgument)?;
            let ok = match p.op {
                CmpOp::Equal => ord == Ordering::Equal,
                CmpOp::NotEqual => ord != Ordering::Equal,
                CmpOp::Less => ord == Ordering::Less,
                CmpOp::LessEqual => ord != Ordering::Greater,
                CmpOp::Greater => ord == Ordering::Greater,
                CmpOp::GreaterEqual => ord != Ordering::Less,
            };
            if !ok {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggOp {
    Min,
    Max,
    Sum,
    Count,
}

/// A compiled scan request: query type, pushdown selection and the
/// cancellation flag checked at tuple emission.
pub struct ScanQuery {
    kind: ScanQueryKind,
    selection: Selection,
    projection: Vec<usize>,
    aggregations: Vec<(AggOp, usize)>,
    cancelled: AtomicBool,
}

impl ScanQuery {
    #[inline]
    pub fn full(selection: Selection) -> Self {
        ScanQuery {
            kind: ScanQueryKind::FullScan,
            selection,
            projection: vec![],
            aggregations: vec![],
            cancelled: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn projection(selection: Selection, fields: Vec<usize>) -> Self {
        ScanQuery {
            kind: ScanQueryKind::Projection,
            selection,
            projection: fields,
            aggregations: vec![],
            cancelled: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn aggregation(selection: Selection, aggregations: Vec<(AggOp, usize)>) -> Self {
        ScanQuery {
            kind: ScanQueryKind::Aggregation,
            selection,
            projection: vec![],
            aggregations,
            cancelled: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn kind(&self) -> ScanQueryKind {
        self.kind
    }

    /// Abort the scan; the next tuple emission detects the flag and
    /// releases resources.
    #[inline]
    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::Acquire)
    }

    /// Schema of the single result tuple of an aggregation scan.
    pub fn aggregation_schema(&self, schema: &Schema) -> Result<Schema> {
        let mut fields = Vec::with_capacity(self.aggregations.len());
        for (op, field_idx) in &self.aggregations {
            let src = schema
                .fields()
                .get(*field_idx)
                .ok_or(Error::InvalidArgument)?;
            let field_type = match op {
                AggOp::Count => FieldType::BigInt,
                AggOp::Sum => match src.field_type {
                    FieldType::Float | FieldType::Double => FieldType::Double,
                    FieldType::SmallInt | FieldType::Int | FieldType::BigInt => {
                        FieldType::BigInt
                    }
                    _ => return Err(Error::InvalidArgument),
                },
                AggOp::Min | AggOp::Max => src.field_type,
            };
            fields.push(Field::new(&src.name, field_type));
        }
        Schema::new(fields).map_err(Error::from)
    }
}

/// Receives matching tuples as the scan streams over main pages and
/// the insert log.
pub trait ScanSink {
    fn tuple(&mut self, key: u64, data: &[u8]);
}

impl ScanSink for Vec<(u64, Vec<u8>)> {
    #[inline]
    fn tuple(&mut self, key: u64, data: &[u8]) {
        self.push((key, data.to_vec()));
    }
}

struct Aggregator<'a> {
    query: &'a ScanQuery,
    result_schema: Schema,
    values: Vec<Option<Value>>,
    count: u64,
}

impl<'a> Aggregator<'a> {
    fn new(schema: &Schema, query: &'a ScanQuery) -> Result<Self> {
        let result_schema = query.aggregation_schema(schema)?;
        Ok(Aggregator {
            query,
            result_schema,
            values: vec![None; query.aggregations.len()],
            count: 0,
        })
    }

    fn fold(&mut self, reader: &TupleReader) -> Result<()> {
        for (i, (op, field_idx)) in self.query.aggregations.iter().enumerate() {
            if *op == AggOp::Count {
                continue;
            }
            let value = reader.value(*field_idx)?;
            let acc = &mut self.values[i];
            match (op, acc.take()) {
                (AggOp::Sum, None) => {
                    // widen to the result type right away.
                    let zero = zero_of(self.result_schema.field(i).field_type);
                    *acc = Some(value.checked_add(&zero).ok_or(Error::InvalidArgument)?);
                }
                (_, None) => *acc = Some(value),
                (AggOp::Min, Some(prev)) => {
                    let ord = value.compare(&prev).ok_or(Error::InvalidArgument)?;
                    *acc = Some(if ord == Ordering::Less { value } else { prev });
                }
                (AggOp::Max, Some(prev)) => {
                    let ord = value.compare(&prev).ok_or(Error::InvalidArgument)?;
                    *acc = Some(if ord == Ordering::Greater { value } else { prev });
                }
                (AggOp::Sum, Some(prev)) => {
                    *acc = Some(prev.checked_add(&value).ok_or(Error::InvalidArgument)?);
                }
                (AggOp::Count, Some(_)) => unreachable!(),
            }
        }
        self.count += 1;
        Ok(())
    }

    fn finalize(self, sink: &mut dyn ScanSink) -> Result<()> {
        let mut values = Vec::with_capacity(self.query.aggregations.len());
        for (i, (op, _)) in self.query.aggregations.iter().enumerate() {
            let value = match op {
                AggOp::Count => Value::BigInt(self.count as i64),
                _ => match &self.values[i] {
                    Some(v) => v.clone(),
                    None => zero_of(self.result_schema.field(i).field_type),
                },
            };
            values.push(value);
        }
        let tuple = TupleBuilder::from_values(&self.result_schema, &values)?;
        sink.tuple(0, &tuple);
        Ok(())
    }
}

#[inline]
fn zero_of(field_type: FieldType) -> Value {
    match field_type {
        FieldType::SmallInt => Value::SmallInt(0),
        FieldType::Int => Value::Int(0),
        FieldType::BigInt => Value::BigInt(0),
        FieldType::Float => Value::Float(0.0),
        FieldType::Double => Value::Double(0.0),
        FieldType::Text => Value::Text(String::new()),
        FieldType::Blob => Value::Blob(vec![]),
    }
}

impl Table {
    /// Stream every tuple visible under the snapshot through the
    /// query into the sink. Iterates all current main pages plus the
    /// insert log; the snapshot is held for the whole scan.
    pub fn scan(
        &self,
        query: &ScanQuery,
        snapshot: &SnapshotDescriptor,
        sink: &mut dyn ScanSink,
    ) -> Result<()> {
        let prev = self.active_scans.fetch_add(1, AtomicOrdering::AcqRel);
        let _slot = scopeguard::guard((), |_| {
            self.active_scans.fetch_sub(1, AtomicOrdering::AcqRel);
        });
        if prev >= self.max_scans {
            return Err(Error::ServerOverload);
        }
        let _latch = self.gc_latch.read();
        let _epoch = pin();
        let proj_schema = match query.kind {
            ScanQueryKind::Projection => Some(self.schema.project(&query.projection)?),
            _ => None,
        };
        let mut agg = match query.kind {
            ScanQueryKind::Aggregation => Some(Aggregator::new(&self.schema, query)?),
            _ => None,
        };
        for page in self.main_pages() {
            let main = MainPage::from_page(page);
            let entries = main.entries();
            let mut i = 0;
            while i < entries.len() {
                if query.is_cancelled() {
                    return Ok(());
                }
                let entry = &entries[i];
                let key = entry.key;
                // runs already rebuilt into a newer page or dropped
                // are read where they live now.
                let moved = matches!(
                    NewestPtr::decode(entry.newest.load()),
                    NewestRef::Main(_) | NewestRef::Invalid
                );
                if !moved {
                    if let ReadOutcome::Found {
                        data: Some(data), ..
                    } = read_record(&self.layout_ctx, NewestPtr::encode_main(entry), snapshot)
                    {
                        self.emit(query, proj_schema.as_ref(), agg.as_mut(), key, &data, sink)?;
                    }
                }
                i = skip_key(entries, i, key);
            }
        }
        let mut cancelled = false;
        self.insert_log.try_for_each(|le| {
            if cancelled || le.kind() != LOG_INSERT {
                return Ok(());
            }
            if query.is_cancelled() {
                cancelled = true;
                return Ok(());
            }
            let ie = unsafe { InsertEntry::from_addr(le.data_ptr() as usize) };
            // records rooted elsewhere (migrated, invalidated, or
            // never published) are not scanned from the log.
            if self.index.get(self.table_id, ie.key) != Some(RecordRef::encode_log(ie)) {
                return Ok(());
            }
            if let ReadOutcome::Found {
                data: Some(data), ..
            } = read_record(&self.layout_ctx, RecordRef::encode_log(ie), snapshot)
            {
                self.emit(query, proj_schema.as_ref(), agg.as_mut(), ie.key, &data, sink)?;
            }
            Ok(())
        })?;
        if cancelled || query.is_cancelled() {
            return Ok(());
        }
        if let Some(agg) = agg {
            agg.finalize(sink)?;
        }
        Ok(())
    }

    fn emit(
        &self,
        query: &ScanQuery,
        proj_schema: Option<&Schema>,
        agg: Option<&mut Aggregator>,
        key: u64,
        data: &[u8],
        sink: &mut dyn ScanSink,
    ) -> Result<()> {
        let reader = TupleReader::new(&self.schema, data)?;
        if !query.selection.matches(&reader)? {
            return Ok(());
        }
        match query.kind {
            ScanQueryKind::FullScan => sink.tuple(key, data),
            ScanQueryKind::Projection => {
                let proj_schema = proj_schema.expect("projection schema");
                let mut values = Vec::with_capacity(query.projection.len());
                for &field_idx in &query.projection {
                    values.push(reader.value(field_idx)?);
                }
                let tuple = TupleBuilder::from_values(proj_schema, &values)?;
                sink.tuple(key, &tuple);
            }
            ScanQueryKind::Aggregation => {
                agg.expect("aggregator").fold(&reader)?;
            }
        }
        Ok(())
    }
}
