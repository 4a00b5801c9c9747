//! Aggregation.
//!
//! An aggregation row holds the values of the grouping columns followed by
//! the running state of every aggregate. States merge pairwise, so the
//! same rows work for merging adjacent input rows and for merging the
//! duplicates a sort finds.

mod grouped;
mod scalar;

use std::collections::HashSet;

use quarry_datastore::SortObserver;
use quarry_lib::{ColId, Row, Value};

use crate::error::{ExecError, Result};

pub use grouped::GroupedAggregateResultSet;
pub use scalar::ScalarAggregateResultSet;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AggregateKind {
    /// `COUNT(*)`, counting rows whatever their values.
    CountStar,
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

impl AggregateKind {
    /// The number of columns of the running state.
    fn state_width(self) -> usize {
        match self {
            Self::Avg => 2,
            _ => 1,
        }
    }
}

/// One aggregate of a select list, over one column of its input rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateSpec {
    pub kind: AggregateKind,
    pub input: ColId,
    pub distinct: bool,
}

impl AggregateSpec {
    pub fn new(kind: AggregateKind, input: u32) -> Self {
        Self {
            kind,
            input: ColId(input),
            distinct: false,
        }
    }

    pub fn count_star() -> Self {
        Self::new(AggregateKind::CountStar, 0)
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// The state of an aggregate that saw no value.
    fn empty_state(&self, out: &mut Vec<Value>) {
        match self.kind {
            AggregateKind::CountStar | AggregateKind::Count => out.push(Value::I64(0)),
            AggregateKind::Sum | AggregateKind::Min | AggregateKind::Max => out.push(Value::Null),
            AggregateKind::Avg => out.extend([Value::Null, Value::I64(0)]),
        }
    }

    /// The state of an aggregate that saw only `value`.
    fn value_state(&self, value: &Value, out: &mut Vec<Value>) {
        match self.kind {
            AggregateKind::CountStar => out.push(Value::I64(1)),
            AggregateKind::Count => out.push(Value::I64(i64::from(!value.is_null()))),
            AggregateKind::Sum | AggregateKind::Min | AggregateKind::Max => out.push(value.clone()),
            AggregateKind::Avg => out.extend([value.clone(), Value::I64(i64::from(!value.is_null()))]),
        }
    }

    /// Merges the state `from` into the state `into`. Nulls are ignored.
    fn merge(&self, into: &mut [Value], from: &[Value]) -> Result<()> {
        match self.kind {
            AggregateKind::CountStar | AggregateKind::Count => into[0] = into[0].add(&from[0])?,
            AggregateKind::Sum => into[0] = add_ignoring_nulls(&into[0], &from[0])?,
            AggregateKind::Min => {
                if !from[0].is_null() && (into[0].is_null() || from[0] < into[0]) {
                    into[0] = from[0].clone();
                }
            }
            AggregateKind::Max => {
                if !from[0].is_null() && (into[0].is_null() || from[0] > into[0]) {
                    into[0] = from[0].clone();
                }
            }
            AggregateKind::Avg => {
                into[0] = add_ignoring_nulls(&into[0], &from[0])?;
                into[1] = into[1].add(&from[1])?;
            }
        }
        Ok(())
    }

    fn result(&self, state: &[Value]) -> Result<Value> {
        match self.kind {
            AggregateKind::Avg => match state[1] {
                Value::I64(0) => Ok(Value::Null),
                Value::I64(count) => Ok(state[0].div_count(count)?),
                _ => Err(ExecError::internal("corrupt average state")),
            },
            _ => Ok(state[0].clone()),
        }
    }
}

fn add_ignoring_nulls(a: &Value, b: &Value) -> Result<Value> {
    Ok(match (a.is_null(), b.is_null()) {
        (_, true) => a.clone(),
        (true, false) => b.clone(),
        (false, false) => a.add(b)?,
    })
}

/// The layout of aggregation rows.
#[derive(Debug, Clone)]
pub(crate) struct Aggregator {
    /// Grouping columns of the input rows, in grouping order.
    group_cols: Vec<ColId>,
    aggregates: Vec<AggregateSpec>,
}

impl Aggregator {
    pub fn new(group_cols: Vec<ColId>, aggregates: Vec<AggregateSpec>) -> Self {
        Self { group_cols, aggregates }
    }

    pub fn group_width(&self) -> usize {
        self.group_cols.len()
    }

    pub fn aggregates(&self) -> &[AggregateSpec] {
        &self.aggregates
    }

    pub fn distinct_count(&self) -> usize {
        self.aggregates.iter().filter(|a| a.distinct).count()
    }

    /// The grouping columns of `input`, in grouping order.
    pub fn group_key(&self, input: &Row) -> Row {
        input.project(&self.group_cols)
    }

    /// How many leading grouping columns `a` and `b`, both input rows, share.
    pub fn common_prefix(&self, a: &Row, b: &Row) -> usize {
        self.group_cols.iter().take_while(|c| a.get(**c) == b.get(**c)).count()
    }

    /// An aggregation row for `key` that saw no input.
    pub fn empty_row(&self, key: Row) -> Row {
        let mut values = key.elements;
        for agg in &self.aggregates {
            agg.empty_state(&mut values);
        }
        Row::new(values)
    }

    /// The aggregation row of a single input row.
    pub fn input_row(&self, input: &Row) -> Row {
        let mut values = self.group_key(input).elements;
        for agg in &self.aggregates {
            agg.value_state(input.get(agg.input), &mut values);
        }
        Row::new(values)
    }

    /// Adds `input` to the aggregation row `into`.
    ///
    /// `seen` holds the values already aggregated by each distinct
    /// aggregate of the group; values found there are skipped.
    pub fn accumulate(&self, into: &mut Row, input: &Row, seen: &mut DistinctSets) -> Result<()> {
        let mut offset = self.group_width();
        let mut state = Vec::with_capacity(2);
        for (i, agg) in self.aggregates.iter().enumerate() {
            let width = agg.kind.state_width();
            let value = input.get(agg.input);
            if !agg.distinct || seen.insert(i, value) {
                state.clear();
                agg.value_state(value, &mut state);
                agg.merge(state_mut(into, offset, width)?, &state)?;
            }
            offset += width;
        }
        Ok(())
    }

    /// Merges the aggregation row `from` into `into`, which have equal keys.
    pub fn merge_rows(&self, into: &mut Row, from: &Row) -> Result<()> {
        let mut offset = self.group_width();
        for agg in &self.aggregates {
            let width = agg.kind.state_width();
            agg.merge(state_mut(into, offset, width)?, state(from, offset, width)?)?;
            offset += width;
        }
        Ok(())
    }

    /// The output row of an aggregation row: grouping columns, then results.
    pub fn finish(&self, row: &Row) -> Result<Row> {
        let mut values: Vec<Value> = row.prefix(self.group_width()).to_vec();
        let mut offset = self.group_width();
        for agg in &self.aggregates {
            let width = agg.kind.state_width();
            values.push(agg.result(state(row, offset, width)?)?);
            offset += width;
        }
        Ok(Row::new(values))
    }
}

/// The `width` state columns of an aggregation row starting at `offset`.
fn state(row: &Row, offset: usize, width: usize) -> Result<&[Value]> {
    let len = row.len();
    row.elements
        .get(offset..offset + width)
        .ok_or_else(|| short_row(len, offset + width))
}

fn state_mut(row: &mut Row, offset: usize, width: usize) -> Result<&mut [Value]> {
    let len = row.len();
    row.elements
        .get_mut(offset..offset + width)
        .ok_or_else(|| short_row(len, offset + width))
}

fn short_row(len: usize, needed: usize) -> ExecError {
    ExecError::internal(format!("aggregation row has {len} columns, needs {needed}"))
}

/// Per distinct aggregate, the non-null values one group has aggregated.
#[derive(Debug, Default, Clone)]
pub(crate) struct DistinctSets {
    sets: Vec<HashSet<Value>>,
}

impl DistinctSets {
    /// Records `value` for aggregate `agg`. False if it was seen already or is null.
    fn insert(&mut self, agg: usize, value: &Value) -> bool {
        if value.is_null() {
            return false;
        }
        if self.sets.len() <= agg {
            self.sets.resize_with(agg + 1, HashSet::new);
        }
        self.sets[agg].insert(value.clone())
    }

    pub fn clear(&mut self) {
        self.sets.iter_mut().for_each(HashSet::clear);
    }
}

/// Merges the aggregation rows a sort finds equal on the grouping columns.
pub(crate) struct AggregateObserver {
    aggregator: Aggregator,
}

impl AggregateObserver {
    pub fn new(aggregator: Aggregator) -> Self {
        Self { aggregator }
    }
}

impl SortObserver for AggregateObserver {
    fn insert_duplicate_key(&mut self, new: Row, existing: &mut Row) -> anyhow::Result<Option<Row>> {
        self.aggregator.merge_rows(existing, &new)?;
        Ok(None)
    }
}
