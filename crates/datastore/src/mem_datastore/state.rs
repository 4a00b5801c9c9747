use std::collections::{BTreeMap, BTreeSet, HashMap};

use quarry_lib::ordering::{compare_prefix, compare_rows};
use quarry_lib::{ColumnOrdering, Row};
use quarry_primitives::{ConglomId, RowLocation, SortId};

use crate::error::StoreError;
use crate::traits::{ConglomerateInfo, SortObserver, SortSpec};
use crate::Result;

/// Operation counters, for asserting on how the engine used the store.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StoreCounters {
    pub scans_opened: u64,
    pub scans_reopened: u64,
    pub conglomerates_opened: u64,
    pub conglomerates_created: u64,
    pub temp_conglomerates_created: u64,
    pub conglomerates_dropped: u64,
    pub sorts_created: u64,
    pub rows_fetched: u64,
}

/// A failure to report on the next open of a conglomerate.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InjectedFailure {
    LockTimeout,
    Deadlock,
}

pub(super) enum Storage {
    Heap { rows: BTreeMap<u64, Row>, next_slot: u64 },
    BTree { rows: BTreeSet<Row>, key_cols: usize, unique: bool },
}

pub(super) struct Conglomerate {
    pub info: ConglomerateInfo,
    pub storage: Storage,
}

impl Conglomerate {
    /// Finds a row whose non-null key equals that of `row`.
    pub fn find_duplicate(&self, row: &Row) -> bool {
        let Storage::BTree { rows, key_cols, unique } = &self.storage else {
            return false;
        };
        let key = row.prefix(*key_cols);
        // Unique indexes admit any number of keys containing a null.
        if !unique || key.iter().any(|v| v.is_null()) {
            return false;
        }
        let probe = Row::new(key.to_vec());
        rows.range(probe..)
            .next()
            .is_some_and(|r| compare_prefix(r, key).is_eq())
    }

    pub fn insert(&mut self, row: &Row) -> Result<RowLocation> {
        let id = self.info.id;
        match &mut self.storage {
            Storage::Heap { rows, next_slot } => {
                let slot = *next_slot;
                *next_slot += 1;
                rows.insert(slot, row.clone());
                Ok(RowLocation::new(id, slot))
            }
            Storage::BTree { rows, .. } => {
                let loc = row
                    .row_location()
                    .ok_or_else(|| StoreError::invalid("btree rows must end with a row location"))?;
                rows.insert(row.clone());
                Ok(loc)
            }
        }
    }
}

pub(super) struct SortState {
    pub ordering: Vec<ColumnOrdering>,
    pub eliminate_duplicates: bool,
    pub observer: Option<Box<dyn SortObserver>>,
    pub rows: Vec<Row>,
    pub completed: bool,
}

impl SortState {
    pub fn new(spec: SortSpec) -> Self {
        Self {
            ordering: spec.ordering,
            eliminate_duplicates: spec.eliminate_duplicates,
            observer: spec.observer,
            rows: Vec::new(),
            completed: false,
        }
    }

    /// Sorts the loaded rows, stable with respect to insertion order,
    /// then folds adjacent duplicates.
    pub fn complete(&mut self) -> Result<()> {
        let ordering = &self.ordering;
        self.rows.sort_by(|a, b| compare_rows(a, b, ordering));
        if self.eliminate_duplicates {
            let mut kept: Vec<Row> = Vec::with_capacity(self.rows.len());
            for row in self.rows.drain(..) {
                match kept.last_mut() {
                    Some(last) if compare_rows(last, &row, ordering).is_eq() => {
                        if let Some(observer) = &mut self.observer {
                            if let Some(row) = observer.insert_duplicate_key(row, last)? {
                                kept.push(row);
                            }
                        }
                    }
                    _ => kept.push(row),
                }
            }
            self.rows = kept;
        }
        self.completed = true;
        Ok(())
    }
}

#[derive(Default)]
pub(super) struct State {
    pub next_conglom: u64,
    pub next_sort: u64,
    pub conglomerates: HashMap<ConglomId, Conglomerate>,
    pub sorts: HashMap<SortId, SortState>,
    pub counters: StoreCounters,
    pub failures: HashMap<ConglomId, InjectedFailure>,
}

impl State {
    pub fn conglomerate(&self, id: ConglomId) -> Result<&Conglomerate> {
        self.conglomerates.get(&id).ok_or(StoreError::NoSuchConglomerate(id))
    }

    pub fn conglomerate_mut(&mut self, id: ConglomId) -> Result<&mut Conglomerate> {
        self.conglomerates.get_mut(&id).ok_or(StoreError::NoSuchConglomerate(id))
    }

    pub fn sort_mut(&mut self, id: SortId) -> Result<&mut SortState> {
        self.sorts.get_mut(&id).ok_or(StoreError::NoSuchSort(id))
    }

    /// Reports, once, a failure injected for `id`.
    pub fn check_lock(&mut self, id: ConglomId) -> Result<()> {
        match self.failures.remove(&id) {
            None => Ok(()),
            Some(InjectedFailure::LockTimeout) => Err(StoreError::LockTimeout(id)),
            Some(InjectedFailure::Deadlock) => Err(StoreError::Deadlock(id)),
        }
    }
}
