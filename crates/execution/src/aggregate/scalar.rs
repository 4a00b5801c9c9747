use quarry_lib::{ResultSetNumber, Row};

use super::{AggregateKind, AggregateSpec, Aggregator, DistinctSets};
use crate::activation::Activation;
use crate::error::Result;
use crate::result_set::{Phase, ResultSet, ResultSetBase};

/// Aggregates its whole input into exactly one row.
pub struct ScalarAggregateResultSet {
    base: ResultSetBase,
    source: Box<dyn ResultSet>,
    aggregator: Aggregator,
    /// The input is ordered so that its first row decides a lone MIN or MAX.
    single_input_row: bool,
    done: bool,
    rows_input: u64,
}

impl ScalarAggregateResultSet {
    pub fn new(rsn: ResultSetNumber, source: Box<dyn ResultSet>, aggregates: Vec<AggregateSpec>) -> Self {
        Self {
            base: ResultSetBase::new(rsn),
            source,
            aggregator: Aggregator::new(Vec::new(), aggregates),
            single_input_row: false,
            done: false,
            rows_input: 0,
        }
    }

    /// Stops reading at the first row for MIN, and at the first non-null
    /// row for MAX. Ignored unless there is a single MIN or MAX aggregate.
    pub fn single_input_row(mut self) -> Self {
        self.single_input_row = matches!(
            self.aggregator.aggregates(),
            [AggregateSpec {
                kind: AggregateKind::Min | AggregateKind::Max,
                ..
            }]
        );
        self
    }

    pub fn rows_input(&self) -> u64 {
        self.rows_input
    }

    /// Is `row` the one a single input row aggregate stops at?
    fn decides(&self, row: &Row) -> bool {
        match self.aggregator.aggregates() {
            [agg] if agg.kind == AggregateKind::Max => !row.get(agg.input).is_null(),
            _ => true,
        }
    }

    fn aggregate(&mut self, cx: &mut Activation<'_>) -> Result<Row> {
        let mut acc = self.aggregator.empty_row(Row::default());
        let mut seen = DistinctSets::default();
        while let Some(row) = self.source.next_row_core(cx)? {
            self.rows_input += 1;
            self.aggregator.accumulate(&mut acc, &row, &mut seen)?;
            if self.single_input_row && self.decides(&row) {
                break;
            }
        }
        self.aggregator.finish(&acc)
    }
}

impl ResultSet for ScalarAggregateResultSet {
    fn kind(&self) -> &'static str {
        "scalar aggregate"
    }

    fn base(&self) -> &ResultSetBase {
        &self.base
    }

    fn open_core(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let start = self.base.start_timer(cx);
        self.source.open_core(cx)?;
        self.done = false;
        self.rows_input = 0;
        self.base.mark_open();
        self.base.stop_timer(start, Phase::Open);
        Ok(())
    }

    fn next_row_core(&mut self, cx: &mut Activation<'_>) -> Result<Option<Row>> {
        self.base.check_open("next_row")?;
        if self.done {
            self.base.set_current_row(cx, None);
            return Ok(None);
        }
        let start = self.base.start_timer(cx);
        let row = self.aggregate(cx)?;
        self.done = true;
        let row = self.base.produced(cx, Some(row));
        self.base.stop_timer(start, Phase::Next);
        Ok(row)
    }

    fn close(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let start = self.base.start_timer(cx);
        let res = self.source.close(cx);
        self.base.mark_closed(cx);
        self.base.stop_timer(start, Phase::Close);
        res
    }

    fn finish(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        self.source.finish(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result_set::TopResultSet;
    use crate::testing::TestDb;
    use crate::values::RowResultSet;
    use pretty_assertions::assert_eq;
    use quarry_lib::{row, Value};

    fn source(rows: Vec<Row>) -> Box<dyn ResultSet> {
        Box::new(RowResultSet::constant(ResultSetNumber(0), rows))
    }

    #[test]
    fn empty_input_still_yields_one_row() {
        let mut db = TestDb::new();
        let aggs = vec![
            AggregateSpec::count_star(),
            AggregateSpec::new(AggregateKind::Sum, 0),
            AggregateSpec::new(AggregateKind::Max, 0),
        ];
        let rs = ScalarAggregateResultSet::new(ResultSetNumber(1), source(vec![]), aggs);
        let mut top = TopResultSet::new(Box::new(rs));
        let mut cx = db.activation();
        assert_eq!(top.collect(&mut cx).unwrap(), vec![row![0, Value::Null, Value::Null]]);
        assert_eq!(top.next_row(&mut cx).unwrap(), None);
    }

    #[test]
    fn aggregates_every_row() {
        let mut db = TestDb::new();
        let rows = vec![row![3], row![1], row![Value::Null], row![3]];
        let aggs = vec![
            AggregateSpec::count_star(),
            AggregateSpec::new(AggregateKind::Count, 0),
            AggregateSpec::new(AggregateKind::Count, 0).distinct(),
            AggregateSpec::new(AggregateKind::Avg, 0),
        ];
        let rs = ScalarAggregateResultSet::new(ResultSetNumber(1), source(rows), aggs);
        let mut top = TopResultSet::new(Box::new(rs));
        let mut cx = db.activation();
        assert_eq!(top.collect(&mut cx).unwrap(), vec![row![4, 3, 2, 2]]);
    }

    #[test]
    fn min_stops_at_the_first_row() {
        let mut db = TestDb::new();
        let rows = vec![row![1], row![2], row![3]];
        let mut rs = ScalarAggregateResultSet::new(
            ResultSetNumber(1),
            source(rows),
            vec![AggregateSpec::new(AggregateKind::Min, 0)],
        )
        .single_input_row();
        let mut cx = db.activation();
        rs.open_core(&mut cx).unwrap();
        assert_eq!(rs.next_row_core(&mut cx).unwrap(), Some(row![1]));
        assert_eq!(rs.rows_input(), 1);
    }

    #[test]
    fn max_stops_at_the_first_non_null_row() {
        let mut db = TestDb::new();
        // A descending scan returns nulls first.
        let rows = vec![row![Value::Null], row![Value::Null], row![9], row![4]];
        let mut rs = ScalarAggregateResultSet::new(
            ResultSetNumber(1),
            source(rows),
            vec![AggregateSpec::new(AggregateKind::Max, 0)],
        )
        .single_input_row();
        let mut cx = db.activation();
        rs.open_core(&mut cx).unwrap();
        assert_eq!(rs.next_row_core(&mut cx).unwrap(), Some(row![9]));
        assert_eq!(rs.rows_input(), 3);
    }
}
