use std::collections::VecDeque;

use quarry_datastore::{ScanController, SortSpec};
use quarry_lib::{ColId, ColumnOrdering, ResultSetNumber, Row, SortId, Value};

use super::{AggregateObserver, AggregateSpec, Aggregator, DistinctSets};
use crate::activation::Activation;
use crate::error::{ExecError, Result};
use crate::result_set::{Phase, ResultSet, ResultSetBase};

/// How the groups are formed, chosen at open.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Strategy {
    /// The sort merges equal groups through an observer.
    InSort,
    /// Adjacent rows of the ordered source are merged.
    InOrder,
    /// The source is sorted first, then adjacent rows are merged.
    SortThenMerge,
}

/// The running aggregate of one grouping level.
struct Level {
    /// Leading grouping columns this level groups on.
    prefix: usize,
    acc: Option<Row>,
    seen: DistinctSets,
}

/// `GROUP BY`, optionally `WITH ROLLUP`.
///
/// Output rows hold the grouping columns in grouping order followed by the
/// aggregate results. With a rollup over `n` grouping columns every input
/// row also counts towards the `n` coarser groups, whose rows carry nulls
/// in the columns rolled up. Groups are returned most specific first.
pub struct GroupedAggregateResultSet {
    base: ResultSetBase,
    source: Box<dyn ResultSet>,
    aggregator: Aggregator,
    ordering: Vec<ColumnOrdering>,
    rollup: bool,
    in_sorted_order: bool,

    strategy: Strategy,
    sort: Option<SortId>,
    scan: Option<Box<dyn ScanController>>,
    levels: Vec<Level>,
    /// Completed groups not returned yet.
    pending: VecDeque<Row>,
    previous: Option<Row>,
    exhausted: bool,
    rows_input: u64,
}

impl GroupedAggregateResultSet {
    /// Groups on the columns of `ordering`, in order, with their directions.
    pub fn new(
        rsn: ResultSetNumber,
        source: Box<dyn ResultSet>,
        ordering: Vec<ColumnOrdering>,
        aggregates: Vec<AggregateSpec>,
    ) -> Self {
        let group_cols = ordering.iter().map(|o| o.col).collect();
        Self {
            base: ResultSetBase::new(rsn),
            source,
            aggregator: Aggregator::new(group_cols, aggregates),
            ordering,
            rollup: false,
            in_sorted_order: false,
            strategy: Strategy::InOrder,
            sort: None,
            scan: None,
            levels: Vec::new(),
            pending: VecDeque::new(),
            previous: None,
            exhausted: false,
            rows_input: 0,
        }
    }

    pub fn rollup(mut self) -> Self {
        self.rollup = true;
        self
    }

    /// The source returns rows ordered on the grouping columns.
    pub fn in_sorted_order(mut self) -> Self {
        self.in_sorted_order = true;
        self
    }

    pub fn rows_input(&self) -> u64 {
        self.rows_input
    }

    fn choose_strategy(&self) -> Result<Strategy> {
        let distinct = self.aggregator.distinct_count();
        if self.rollup && distinct > 1 {
            return Err(ExecError::NotImplemented("more than one distinct aggregate with ROLLUP"));
        }
        Ok(if self.in_sorted_order {
            Strategy::InOrder
        } else if !self.rollup && distinct == 0 {
            Strategy::InSort
        } else {
            Strategy::SortThenMerge
        })
    }

    /// Loads the source into a sort and closes it.
    fn load_sorter(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let spec = match self.strategy {
            Strategy::InSort => {
                // Aggregation rows start with the grouping columns.
                let key = self
                    .ordering
                    .iter()
                    .enumerate()
                    .map(|(pos, o)| ColumnOrdering {
                        col: ColId(pos as u32),
                        ascending: o.ascending,
                    })
                    .collect();
                SortSpec::new(key).with_observer(Box::new(AggregateObserver::new(self.aggregator.clone())))
            }
            _ => SortSpec::new(self.ordering.clone()),
        };
        let sort = cx.tc().create_sort(spec)?;
        self.sort = Some(sort);
        let mut sorter = cx.tc().open_sort(sort)?;
        while let Some(row) = self.source.next_row_core(cx)? {
            cx.check_cancel()?;
            self.rows_input += 1;
            let row = match self.strategy {
                Strategy::InSort => self.aggregator.input_row(&row),
                _ => row,
            };
            sorter.insert(row)?;
        }
        sorter.complete()?;
        self.source.close(cx)?;
        log::debug!(
            "GROUPING SORT LOADED: rsn = {}, rows = {}, strategy = {:?}",
            self.base.rsn,
            self.rows_input,
            self.strategy
        );
        self.scan = Some(cx.tc().open_sort_scan(sort)?);
        Ok(())
    }

    fn next_input(&mut self, cx: &mut Activation<'_>) -> Result<Option<Row>> {
        match self.strategy {
            Strategy::InOrder => {
                let row = self.source.next_row_core(cx)?;
                if row.is_some() {
                    self.rows_input += 1;
                }
                Ok(row)
            }
            _ => match &mut self.scan {
                Some(scan) => Ok(scan.next()?),
                None => Ok(None),
            },
        }
    }

    /// Starts the group of `input` at `level`.
    fn start_group(aggregator: &Aggregator, level: &mut Level, input: &Row) -> Result<()> {
        let mut key = aggregator.group_key(input);
        for pos in level.prefix..aggregator.group_width() {
            key.set(ColId(pos as u32), Value::Null);
        }
        let mut acc = aggregator.empty_row(key);
        level.seen.clear();
        aggregator.accumulate(&mut acc, input, &mut level.seen)?;
        level.acc = Some(acc);
        Ok(())
    }

    /// Feeds one input row to every level, queueing the groups it ends.
    fn merge_input(&mut self, input: Row) -> Result<()> {
        let common = match &self.previous {
            Some(prev) => Some(self.aggregator.common_prefix(prev, &input)),
            None => None,
        };
        for level in &mut self.levels {
            let same_group = common.is_some_and(|common| common >= level.prefix);
            match &mut level.acc {
                Some(acc) if same_group => {
                    self.aggregator.accumulate(acc, &input, &mut level.seen)?;
                }
                _ => {
                    if let Some(done) = level.acc.take() {
                        self.pending.push_back(self.aggregator.finish(&done)?);
                    }
                    Self::start_group(&self.aggregator, level, &input)?;
                }
            }
        }
        self.previous = Some(input);
        Ok(())
    }

    /// Queues every open group, most specific first.
    fn flush(&mut self) -> Result<()> {
        for level in &mut self.levels {
            if let Some(done) = level.acc.take() {
                self.pending.push_back(self.aggregator.finish(&done)?);
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        let width = self.aggregator.group_width();
        let levels = if self.rollup { width + 1 } else { 1 };
        self.levels = (0..levels)
            .map(|i| Level {
                prefix: width - i,
                acc: None,
                seen: DistinctSets::default(),
            })
            .collect();
        self.pending.clear();
        self.previous = None;
        self.exhausted = false;
        self.rows_input = 0;
    }

    fn drop_sort(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        if let Some(mut scan) = self.scan.take() {
            scan.close();
        }
        if let Some(sort) = self.sort.take() {
            cx.tc().drop_sort(sort)?;
        }
        Ok(())
    }
}

impl ResultSet for GroupedAggregateResultSet {
    fn kind(&self) -> &'static str {
        "grouped aggregate"
    }

    fn base(&self) -> &ResultSetBase {
        &self.base
    }

    fn open_core(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let start = self.base.start_timer(cx);
        self.strategy = self.choose_strategy()?;
        self.reset();
        self.source.open_core(cx)?;
        if self.strategy != Strategy::InOrder {
            self.load_sorter(cx)?;
        }
        self.base.mark_open();
        self.base.stop_timer(start, Phase::Open);
        Ok(())
    }

    fn next_row_core(&mut self, cx: &mut Activation<'_>) -> Result<Option<Row>> {
        self.base.check_open("next_row")?;
        let start = self.base.start_timer(cx);
        let row = if self.strategy == Strategy::InSort {
            match self.next_input(cx)? {
                Some(row) => Some(self.aggregator.finish(&row)?),
                None => None,
            }
        } else {
            loop {
                if let Some(row) = self.pending.pop_front() {
                    break Some(row);
                }
                if self.exhausted {
                    break None;
                }
                match self.next_input(cx)? {
                    Some(input) => self.merge_input(input)?,
                    None => {
                        self.exhausted = true;
                        self.flush()?;
                    }
                }
            }
        };
        let row = self.base.produced(cx, row);
        self.base.stop_timer(start, Phase::Next);
        Ok(row)
    }

    fn close(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let start = self.base.start_timer(cx);
        self.drop_sort(cx)?;
        self.pending.clear();
        self.levels.clear();
        self.previous = None;
        self.source.close(cx)?;
        self.base.mark_closed(cx);
        self.base.stop_timer(start, Phase::Close);
        Ok(())
    }

    fn finish(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        self.source.finish(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregateKind;
    use crate::result_set::TopResultSet;
    use crate::testing::TestDb;
    use crate::values::RowResultSet;
    use pretty_assertions::assert_eq;
    use quarry_lib::row;

    fn source(rows: Vec<Row>) -> Box<dyn ResultSet> {
        Box::new(RowResultSet::constant(ResultSetNumber(0), rows))
    }

    fn run(rs: GroupedAggregateResultSet) -> Vec<Row> {
        let mut db = TestDb::new();
        let mut top = TopResultSet::new(Box::new(rs));
        let mut cx = db.activation();
        top.collect(&mut cx).unwrap()
    }

    #[test]
    fn groups_merge_inside_the_sort() {
        let rows = vec![row!["b", 2], row!["a", 1], row!["b", 5], row!["a", Value::Null]];
        let rs = GroupedAggregateResultSet::new(
            ResultSetNumber(1),
            source(rows),
            vec![ColumnOrdering::asc(0)],
            vec![AggregateSpec::count_star(), AggregateSpec::new(AggregateKind::Sum, 1)],
        );
        assert_eq!(run(rs), vec![row!["a", 2, 1], row!["b", 2, 7]]);
    }

    #[test]
    fn sorted_input_is_merged_in_order() {
        let rows = vec![row![3, 1], row![3, 1], row![2, 4], row![1, 0]];
        let rs = GroupedAggregateResultSet::new(
            ResultSetNumber(1),
            source(rows),
            vec![ColumnOrdering::desc(0)],
            vec![AggregateSpec::new(AggregateKind::Count, 1).distinct()],
        )
        .in_sorted_order();
        assert_eq!(run(rs), vec![row![3, 1], row![2, 1], row![1, 1]]);
    }

    #[test]
    fn rollup_nulls_the_rolled_up_columns() {
        let rows = vec![row![2, 1], row![1, 2], row![1, 1]];
        let rs = GroupedAggregateResultSet::new(
            ResultSetNumber(1),
            source(rows),
            vec![ColumnOrdering::asc(0), ColumnOrdering::asc(1)],
            vec![AggregateSpec::count_star()],
        )
        .rollup();
        assert_eq!(
            run(rs),
            vec![
                row![1, 1, 1],
                row![1, 2, 1],
                row![1, Value::Null, 2],
                row![2, 1, 1],
                row![2, Value::Null, 1],
                row![Value::Null, Value::Null, 3],
            ]
        );
    }

    #[test]
    fn empty_input_has_no_groups() {
        let rs = GroupedAggregateResultSet::new(
            ResultSetNumber(1),
            source(vec![]),
            vec![ColumnOrdering::asc(0)],
            vec![AggregateSpec::count_star()],
        )
        .rollup();
        assert_eq!(run(rs), vec![]);
    }

    #[test]
    fn several_distinct_aggregates_cannot_roll_up() {
        let mut db = TestDb::new();
        let rs = GroupedAggregateResultSet::new(
            ResultSetNumber(1),
            source(vec![row![1, 2, 3]]),
            vec![ColumnOrdering::asc(0)],
            vec![
                AggregateSpec::new(AggregateKind::Count, 1).distinct(),
                AggregateSpec::new(AggregateKind::Sum, 2).distinct(),
            ],
        )
        .rollup();
        let mut top = TopResultSet::new(Box::new(rs));
        let mut cx = db.activation();
        assert!(matches!(top.open(&mut cx), Err(ExecError::NotImplemented(_))));
        assert!(!top.is_open());
    }
}
