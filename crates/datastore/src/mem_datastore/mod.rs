//! An in-memory store, the reference implementation of the storage interfaces.
//!
//! Heaps are maps from slot to row and btrees are ordered sets of index rows.
//! All state lives behind one lock shared by every handle,
//! so scans and controllers opened from clones of a [`MemStore`] see each other's writes.

mod scan;
mod state;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use quarry_lib::{FixedBitSet, Row, Value};
use quarry_primitives::{ConglomId, RowLocation, SortId};

use crate::error::StoreError;
use crate::traits::{
    ConglomerateController, ConglomerateInfo, ConglomerateKind, InsertOutcome, IsolationLevel, LockMode, OpenMode,
    ScanController, ScanSpec, SortController, SortSpec, TransactionController,
};
use crate::Result;
use scan::{MemScan, MemSortScan};
use state::{Conglomerate, SortState, State, Storage};
pub use state::{InjectedFailure, StoreCounters};

#[derive(Clone, Default)]
pub struct MemStore {
    state: Arc<RwLock<State>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot of the operation counters.
    pub fn counters(&self) -> StoreCounters {
        self.state.read().counters
    }

    pub fn reset_counters(&self) {
        self.state.write().counters = StoreCounters::default();
    }

    /// Makes the next scan or controller opened on `conglom` fail with `failure`.
    pub fn inject_failure(&self, conglom: ConglomId, failure: InjectedFailure) {
        self.state.write().failures.insert(conglom, failure);
    }

    /// All rows of a conglomerate in storage order, for assertions.
    pub fn rows(&self, conglom: ConglomId) -> Result<Vec<Row>> {
        let state = self.state.read();
        Ok(match &state.conglomerate(conglom)?.storage {
            Storage::Heap { rows, .. } => rows.values().cloned().collect(),
            Storage::BTree { rows, .. } => rows.iter().cloned().collect(),
        })
    }

    /// The number of conglomerates currently existing, temporary ones included.
    pub fn conglomerate_count(&self) -> usize {
        self.state.read().conglomerates.len()
    }
}

impl TransactionController for MemStore {
    fn open_scan(&mut self, conglom: ConglomId, spec: ScanSpec) -> Result<Box<dyn ScanController>> {
        let keyed = {
            let mut state = self.state.write();
            state.check_lock(conglom)?;
            let keyed = state.conglomerate(conglom)?.info.is_keyed();
            state.counters.scans_opened += 1;
            keyed
        };
        if !keyed && !spec.range.is_full() {
            return Err(StoreError::invalid("a heap scan cannot have a key range"));
        }
        log::trace!("SCAN OPENED: conglomerate = {conglom}, range = {:?}", spec.range);
        Ok(Box::new(MemScan::new(
            Arc::clone(&self.state),
            conglom,
            keyed,
            spec.range,
            spec.qualifiers,
        )))
    }

    fn open_conglomerate(
        &mut self,
        conglom: ConglomId,
        _mode: OpenMode,
        _lock: LockMode,
        _isolation: IsolationLevel,
    ) -> Result<Box<dyn ConglomerateController>> {
        let info = {
            let mut state = self.state.write();
            state.check_lock(conglom)?;
            state.counters.conglomerates_opened += 1;
            state.conglomerate(conglom)?.info
        };
        Ok(Box::new(MemConglomerate {
            state: Arc::clone(&self.state),
            info,
            closed: false,
        }))
    }

    fn conglomerate_info(&self, conglom: ConglomId) -> Result<ConglomerateInfo> {
        Ok(self.state.read().conglomerate(conglom)?.info)
    }

    fn create_conglomerate(&mut self, kind: ConglomerateKind, temporary: bool) -> Result<ConglomId> {
        let mut state = self.state.write();
        let id = ConglomId(state.next_conglom);
        state.next_conglom += 1;
        let storage = match kind {
            ConglomerateKind::Heap => Storage::Heap {
                rows: BTreeMap::new(),
                next_slot: 0,
            },
            ConglomerateKind::BTree { key_cols, unique } => Storage::BTree {
                rows: BTreeSet::new(),
                key_cols,
                unique,
            },
        };
        let info = ConglomerateInfo { id, kind, temporary };
        state.conglomerates.insert(id, Conglomerate { info, storage });
        state.counters.conglomerates_created += 1;
        if temporary {
            state.counters.temp_conglomerates_created += 1;
        }
        log::trace!("CONGLOMERATE CREATED: id = {id}, kind = {kind:?}, temporary = {temporary}");
        Ok(id)
    }

    fn drop_conglomerate(&mut self, conglom: ConglomId) -> Result<()> {
        let mut state = self.state.write();
        state
            .conglomerates
            .remove(&conglom)
            .ok_or(StoreError::NoSuchConglomerate(conglom))?;
        state.counters.conglomerates_dropped += 1;
        log::trace!("CONGLOMERATE DROPPED: id = {conglom}");
        Ok(())
    }

    fn create_sort(&mut self, spec: SortSpec) -> Result<SortId> {
        let mut state = self.state.write();
        let id = SortId(state.next_sort);
        state.next_sort += 1;
        state.sorts.insert(id, SortState::new(spec));
        state.counters.sorts_created += 1;
        Ok(id)
    }

    fn open_sort(&mut self, sort: SortId) -> Result<Box<dyn SortController>> {
        let state = self.state.read();
        if !state.sorts.contains_key(&sort) {
            return Err(StoreError::NoSuchSort(sort));
        }
        Ok(Box::new(MemSortLoader {
            state: Arc::clone(&self.state),
            sort,
        }))
    }

    fn open_sort_scan(&mut self, sort: SortId) -> Result<Box<dyn ScanController>> {
        let mut state = self.state.write();
        let sort_state = state.sort_mut(sort)?;
        if !sort_state.completed {
            return Err(StoreError::invalid("cannot scan a sort that is still loading"));
        }
        let rows = std::mem::take(&mut sort_state.rows);
        state.counters.scans_opened += 1;
        Ok(Box::new(MemSortScan {
            rows,
            pos: 0,
            closed: false,
        }))
    }

    fn drop_sort(&mut self, sort: SortId) -> Result<()> {
        self.state.write().sorts.remove(&sort).ok_or(StoreError::NoSuchSort(sort))?;
        Ok(())
    }
}

struct MemSortLoader {
    state: Arc<RwLock<State>>,
    sort: SortId,
}

impl SortController for MemSortLoader {
    fn insert(&mut self, row: Row) -> Result<()> {
        let mut state = self.state.write();
        let sort = state.sort_mut(self.sort)?;
        if sort.completed {
            return Err(StoreError::invalid("cannot insert into a completed sort"));
        }
        sort.rows.push(row);
        Ok(())
    }

    fn complete(&mut self) -> Result<()> {
        let mut state = self.state.write();
        let sort = state.sort_mut(self.sort)?;
        log::debug!("SORT COMPLETING: id = {}, rows = {}", self.sort, sort.rows.len());
        sort.complete()
    }
}

struct MemConglomerate {
    state: Arc<RwLock<State>>,
    info: ConglomerateInfo,
    closed: bool,
}

impl MemConglomerate {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(StoreError::ScanClosed(self.info.id));
        }
        Ok(())
    }

    fn heap_rows<'a>(&self, state: &'a mut State) -> Result<&'a mut BTreeMap<u64, Row>> {
        match &mut state.conglomerate_mut(self.info.id)?.storage {
            Storage::Heap { rows, .. } => Ok(rows),
            Storage::BTree { .. } => Err(StoreError::invalid("btree rows are not addressed by location")),
        }
    }
}

impl ConglomerateController for MemConglomerate {
    fn info(&self) -> ConglomerateInfo {
        self.info
    }

    fn insert(&mut self, row: &Row) -> Result<InsertOutcome> {
        self.check_open()?;
        let mut state = self.state.write();
        let conglomerate = state.conglomerate_mut(self.info.id)?;
        if conglomerate.find_duplicate(row) {
            return Ok(InsertOutcome::Duplicate);
        }
        conglomerate.insert(row).map(InsertOutcome::Inserted)
    }

    fn insert_unchecked(&mut self, row: &Row) -> Result<RowLocation> {
        self.check_open()?;
        self.state.write().conglomerate_mut(self.info.id)?.insert(row)
    }

    fn delete(&mut self, loc: RowLocation) -> Result<bool> {
        self.check_open()?;
        let mut state = self.state.write();
        Ok(self.heap_rows(&mut state)?.remove(&loc.slot).is_some())
    }

    fn replace(&mut self, loc: RowLocation, row: &Row, valid: Option<&FixedBitSet>) -> Result<bool> {
        self.check_open()?;
        let mut state = self.state.write();
        let Some(existing) = self.heap_rows(&mut state)?.get_mut(&loc.slot) else {
            return Ok(false);
        };
        match valid {
            None => *existing = row.clone(),
            Some(valid) => {
                for col in valid.iter_set() {
                    existing.set(col.into(), row.elements.get(col).cloned().unwrap_or(Value::Null));
                }
            }
        }
        Ok(true)
    }

    fn fetch(&mut self, loc: RowLocation, valid: Option<&FixedBitSet>, _lock: bool) -> Result<Option<Row>> {
        self.check_open()?;
        let mut state = self.state.write();
        state.counters.rows_fetched += 1;
        let Some(row) = self.heap_rows(&mut state)?.get(&loc.slot) else {
            return Ok(None);
        };
        Ok(Some(match valid {
            None => row.clone(),
            Some(valid) => row
                .iter()
                .enumerate()
                .map(|(i, v)| if valid.get(i) { v.clone() } else { Value::Null })
                .collect(),
        }))
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qualifier::{Qualifier, Qualifiers, ScanRange};
    use crate::traits::Fetched;
    use core::ops::Bound;
    use pretty_assertions::assert_eq;
    use quarry_lib::{row, ColumnOrdering, OpCmp};

    fn heap_with(store: &mut MemStore, rows: &[Row]) -> (ConglomId, Vec<RowLocation>) {
        let heap = store.create_conglomerate(ConglomerateKind::Heap, false).unwrap();
        let mut cc = store
            .open_conglomerate(heap, OpenMode::ForUpdate, LockMode::Record, IsolationLevel::ReadCommitted)
            .unwrap();
        let locs = rows
            .iter()
            .map(|r| match cc.insert(r).unwrap() {
                InsertOutcome::Inserted(loc) => loc,
                InsertOutcome::Duplicate => unreachable!(),
            })
            .collect();
        (heap, locs)
    }

    fn drain(scan: &mut dyn ScanController) -> Vec<Row> {
        std::iter::from_fn(|| scan.next().unwrap()).collect()
    }

    #[test]
    fn heap_scan_with_qualifiers() {
        let mut store = MemStore::new();
        let (heap, _) = heap_with(&mut store, &[row![1, "a"], row![2, "b"], row![3, "c"]]);
        let spec = ScanSpec::full().with_qualifiers(Qualifiers::all(vec![Qualifier::new(0, OpCmp::GtEq, 2)]));
        let mut scan = store.open_scan(heap, spec).unwrap();
        assert_eq!(drain(&mut *scan), vec![row![2, "b"], row![3, "c"]]);
        assert_eq!(scan.rows_visited(), 3);
        assert_eq!(scan.next().unwrap(), None);
        assert_eq!(store.counters().scans_opened, 1);
    }

    #[test]
    fn btree_unique_rejects_duplicates_but_admits_nulls() {
        let mut store = MemStore::new();
        let ix = store
            .create_conglomerate(ConglomerateKind::BTree { key_cols: 1, unique: true }, false)
            .unwrap();
        let mut cc = store
            .open_conglomerate(ix, OpenMode::ForUpdate, LockMode::Record, IsolationLevel::ReadCommitted)
            .unwrap();
        let loc = |s| RowLocation::new(ConglomId(99), s);
        assert!(matches!(cc.insert(&row![1].with_location(loc(0))).unwrap(), InsertOutcome::Inserted(_)));
        assert_eq!(cc.insert(&row![1].with_location(loc(1))).unwrap(), InsertOutcome::Duplicate);
        assert!(matches!(cc.insert(&row![Value::Null].with_location(loc(2))).unwrap(), InsertOutcome::Inserted(_)));
        assert!(matches!(cc.insert(&row![Value::Null].with_location(loc(3))).unwrap(), InsertOutcome::Inserted(_)));
        cc.insert_unchecked(&row![1].with_location(loc(4))).unwrap();
        assert_eq!(store.rows(ix).unwrap().len(), 4);
    }

    #[test]
    fn btree_range_scan_and_delete_current() {
        let mut store = MemStore::new();
        let ix = store
            .create_conglomerate(ConglomerateKind::BTree { key_cols: 1, unique: false }, false)
            .unwrap();
        let mut cc = store
            .open_conglomerate(ix, OpenMode::ForUpdate, LockMode::Record, IsolationLevel::ReadCommitted)
            .unwrap();
        for k in 0..6 {
            cc.insert(&row![k].with_location(RowLocation::new(ConglomId(9), k as u64)))
                .unwrap();
        }
        let range = ScanRange {
            start: Bound::Excluded(row![1]),
            stop: Bound::Included(row![4]),
        };
        let mut scan = store.open_scan(ix, ScanSpec::range(range)).unwrap();
        let first = scan.next().unwrap().unwrap();
        assert_eq!(first.prefix(1), &[Value::from(2)]);
        assert_eq!(scan.row_location().unwrap(), RowLocation::new(ConglomId(9), 2));
        assert!(scan.delete_current().unwrap());
        let rest: Vec<_> = drain(&mut *scan).iter().map(|r| r[0].clone()).collect();
        assert_eq!(rest, vec![Value::from(3), Value::from(4)]);

        scan.reopen(ScanRange::exact(row![2]), Qualifiers::none()).unwrap();
        assert_eq!(scan.next().unwrap(), None);
        scan.close();
        assert!(matches!(scan.next(), Err(StoreError::ScanClosed(_))));
    }

    #[test]
    fn group_fetch_reports_locations() {
        let mut store = MemStore::new();
        let (heap, locs) = heap_with(&mut store, &[row![1], row![2], row![3]]);
        let mut scan = store.open_scan(heap, ScanSpec::full()).unwrap();
        let mut buf = Vec::new();
        assert_eq!(scan.fetch_next_group(&mut buf, 2).unwrap(), 2);
        assert_eq!(scan.fetch_next_group(&mut buf, 2).unwrap(), 1);
        assert_eq!(
            buf,
            vec![
                Fetched { row: row![1], loc: Some(locs[0]) },
                Fetched { row: row![2], loc: Some(locs[1]) },
                Fetched { row: row![3], loc: Some(locs[2]) },
            ]
        );
    }

    #[test]
    fn partial_replace_and_fetch() {
        let mut store = MemStore::new();
        let (heap, locs) = heap_with(&mut store, &[row![1, "a", true]]);
        let mut cc = store
            .open_conglomerate(heap, OpenMode::ForUpdate, LockMode::Record, IsolationLevel::ReadCommitted)
            .unwrap();
        let sparse = row![Value::Null, "z"];
        assert!(cc.replace(locs[0], &sparse, Some(&FixedBitSet::from_bits(3, [1]))).unwrap());
        assert_eq!(cc.fetch(locs[0], None, false).unwrap(), Some(row![1, "z", true]));
        assert_eq!(
            cc.fetch(locs[0], Some(&FixedBitSet::from_bits(3, [2])), true).unwrap(),
            Some(row![Value::Null, Value::Null, true])
        );
        assert!(cc.delete(locs[0]).unwrap());
        assert_eq!(cc.fetch(locs[0], None, false).unwrap(), None);
        assert!(!cc.delete(locs[0]).unwrap());
    }

    struct Summing;

    impl crate::traits::SortObserver for Summing {
        fn insert_duplicate_key(&mut self, new: Row, existing: &mut Row) -> anyhow::Result<Option<Row>> {
            existing[1] = existing[1].add(&new[1])?;
            Ok(None)
        }
    }

    #[test]
    fn sort_with_observer_merges_duplicates() {
        let mut store = MemStore::new();
        let spec = SortSpec::new(vec![ColumnOrdering::asc(0)]).with_observer(Box::new(Summing));
        let sort = store.create_sort(spec).unwrap();
        let mut loader = store.open_sort(sort).unwrap();
        for r in [row!["b", 1], row!["a", 2], row!["b", 3], row!["a", 4], row!["c", 5]] {
            loader.insert(r).unwrap();
        }
        loader.complete().unwrap();
        let mut scan = store.open_sort_scan(sort).unwrap();
        assert_eq!(drain(&mut *scan), vec![row!["a", 6], row!["b", 4], row!["c", 5]]);
        store.drop_sort(sort).unwrap();
        assert!(matches!(store.open_sort(sort), Err(StoreError::NoSuchSort(_))));
    }

    #[test]
    fn injected_failures_fire_once() {
        let mut store = MemStore::new();
        let (heap, _) = heap_with(&mut store, &[]);
        store.inject_failure(heap, InjectedFailure::LockTimeout);
        assert!(matches!(store.open_scan(heap, ScanSpec::full()), Err(StoreError::LockTimeout(_))));
        assert!(store.open_scan(heap, ScanSpec::full()).is_ok());
    }
}
