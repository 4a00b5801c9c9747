//! Scan ranges and per-row qualifiers pushed down into the store.

use core::cmp::Ordering;
use core::ops::Bound;

use quarry_lib::ordering::compare_prefix;
use quarry_lib::{OpCmp, Row, Value};
use quarry_primitives::ColId;

/// A single column comparison `row[col] <op> value` evaluated by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Qualifier {
    pub col: ColId,
    pub op: OpCmp,
    pub value: Value,
    /// Invert the result of a comparison that was made.
    pub negate: bool,
    /// Compare nulls like any other value, so that `NULL = NULL` holds.
    /// When unset, a comparison involving a null yields `unknown_rv`.
    pub ordered_nulls: bool,
    /// The result of a comparison involving a null under unordered nulls.
    pub unknown_rv: bool,
}

impl Qualifier {
    /// A qualifier with the usual SQL null semantics.
    pub fn new(col: u32, op: OpCmp, value: impl Into<Value>) -> Self {
        Self {
            col: ColId(col),
            op,
            value: value.into(),
            negate: false,
            ordered_nulls: false,
            unknown_rv: false,
        }
    }

    pub fn negated(mut self) -> Self {
        self.negate = !self.negate;
        self
    }

    pub fn with_ordered_nulls(mut self) -> Self {
        self.ordered_nulls = true;
        self
    }

    pub fn matches(&self, row: &Row) -> bool {
        let column = row.get(self.col);
        if !self.ordered_nulls && (column.is_null() || self.value.is_null()) {
            return self.unknown_rv;
        }
        let ord = if column.is_null() || self.value.is_null() {
            column.cmp(&self.value)
        } else {
            // Both sides are non-null.
            column.sql_cmp(&self.value).unwrap_or(Ordering::Equal)
        };
        self.op.holds(ord) != self.negate
    }
}

/// A conjunction of disjunctions of qualifiers.
///
/// A row qualifies when every qualifier of `and` holds
/// and, for each group in `or_groups`, at least one qualifier holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Qualifiers {
    pub and: Vec<Qualifier>,
    pub or_groups: Vec<Vec<Qualifier>>,
}

impl Qualifiers {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all(and: Vec<Qualifier>) -> Self {
        Self { and, or_groups: Vec::new() }
    }

    pub fn with_or_group(mut self, group: Vec<Qualifier>) -> Self {
        self.or_groups.push(group);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.and.is_empty() && self.or_groups.is_empty()
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.and.iter().all(|q| q.matches(row)) && self.or_groups.iter().all(|g| g.iter().any(|q| q.matches(row)))
    }

    /// Every qualifier, in and-then-or order.
    pub fn iter(&self) -> impl Iterator<Item = &Qualifier> {
        self.and.iter().chain(self.or_groups.iter().flatten())
    }
}

/// The key range of a btree scan.
///
/// Each bound is a key prefix: `Included` is the `>=` start or `<=` stop
/// operator, `Excluded` the `>` start or `<` stop operator.
/// Rows are compared on the first `key.len()` columns only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRange {
    pub start: Bound<Row>,
    pub stop: Bound<Row>,
}

impl Default for ScanRange {
    fn default() -> Self {
        Self::full()
    }
}

impl ScanRange {
    /// The whole conglomerate.
    pub fn full() -> Self {
        Self {
            start: Bound::Unbounded,
            stop: Bound::Unbounded,
        }
    }

    /// Exactly the rows whose key starts with `key`.
    pub fn exact(key: Row) -> Self {
        Self {
            start: Bound::Included(key.clone()),
            stop: Bound::Included(key),
        }
    }

    pub fn is_full(&self) -> bool {
        matches!((&self.start, &self.stop), (Bound::Unbounded, Bound::Unbounded))
    }

    /// Is `row` at or past the start of the range?
    pub fn after_start(&self, row: &[Value]) -> bool {
        match &self.start {
            Bound::Unbounded => true,
            Bound::Included(key) => compare_prefix(row, key).is_ge(),
            Bound::Excluded(key) => compare_prefix(row, key).is_gt(),
        }
    }

    /// Is `row` past the stop of the range, ending the scan?
    pub fn past_stop(&self, row: &[Value]) -> bool {
        match &self.stop {
            Bound::Unbounded => false,
            Bound::Included(key) => compare_prefix(row, key).is_gt(),
            Bound::Excluded(key) => compare_prefix(row, key).is_ge(),
        }
    }

    pub fn contains(&self, row: &[Value]) -> bool {
        self.after_start(row) && !self.past_stop(row)
    }
}
