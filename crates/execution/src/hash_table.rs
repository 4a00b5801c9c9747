//! An in-memory hash table of rows, keyed on some of their columns.
//!
//! Rows with equal keys are chained in insertion order.
//! Nulls in key columns are equal to each other here; callers that need
//! SQL equality re-check the rows they get back.

use indexmap::IndexMap;
use smallvec::SmallVec;

use quarry_lib::{ColId, Row};

/// The rows sharing one key.
pub type Chain = SmallVec<[Row; 1]>;

#[derive(Debug, Clone)]
pub struct HashTable {
    key_cols: Vec<ColId>,
    /// Drop a row identical to one already chained under its key.
    remove_duplicates: bool,
    /// Drop rows with a null in a key column.
    skip_null_keys: bool,
    buckets: IndexMap<Row, Chain>,
    rows: usize,
}

impl HashTable {
    pub fn new(key_cols: Vec<ColId>, capacity: usize) -> Self {
        Self {
            key_cols,
            remove_duplicates: false,
            skip_null_keys: false,
            buckets: IndexMap::with_capacity(capacity),
            rows: 0,
        }
    }

    /// A table keyed on every one of the `width` columns of its rows.
    pub fn keyed_on_all(width: usize, capacity: usize) -> Self {
        Self::new((0..width as u32).map(ColId).collect(), capacity).with_remove_duplicates()
    }

    pub fn with_remove_duplicates(mut self) -> Self {
        self.remove_duplicates = true;
        self
    }

    pub fn with_skip_null_keys(mut self) -> Self {
        self.skip_null_keys = true;
        self
    }

    pub fn key_cols(&self) -> &[ColId] {
        &self.key_cols
    }

    pub fn key_of(&self, row: &Row) -> Row {
        row.project(&self.key_cols)
    }

    /// Adds `row`. Returns false if it was dropped as a duplicate or for a null key.
    pub fn put_row(&mut self, row: Row) -> bool {
        if self.skip_null_keys && row.has_null_in(&self.key_cols) {
            return false;
        }
        let key = self.key_of(&row);
        let chain = self.buckets.entry(key).or_default();
        if self.remove_duplicates && chain.contains(&row) {
            return false;
        }
        chain.push(row);
        self.rows += 1;
        true
    }

    /// The rows chained under `key`.
    pub fn get(&self, key: &Row) -> &[Row] {
        self.buckets.get(key).map_or(&[], |chain| chain.as_slice())
    }

    pub fn remove(&mut self, key: &Row) -> Option<Chain> {
        let chain = self.buckets.shift_remove(key)?;
        self.rows -= chain.len();
        Some(chain)
    }

    /// Every row, keys in insertion order.
    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.buckets.values().flatten()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Row> {
        self.buckets.keys()
    }

    pub fn row_count(&self) -> usize {
        self.rows
    }

    pub fn key_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.rows = 0;
    }
}
