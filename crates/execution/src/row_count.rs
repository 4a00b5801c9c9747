//! `OFFSET` and `FETCH FIRST`.

use quarry_expr::Expr;
use quarry_lib::{ResultSetNumber, Row, RowLocation, Value};

use crate::activation::Activation;
use crate::error::{ExecError, Result};
use crate::result_set::{Phase, ResultSet, ResultSetBase};

/// Skips `offset` rows of its source, then returns at most `fetch_first`.
///
/// Both are expressions evaluated on the first `next` call of every
/// execution, so they may depend on parameters.
pub struct RowCountResultSet {
    base: ResultSetBase,
    source: Box<dyn ResultSet>,
    offset: Option<Expr>,
    fetch_first: Option<Expr>,
    /// A `LIMIT 0` from a driver means no limit.
    jdbc_limit: bool,
    /// Rows still to return, `None` before the first `next` call.
    remaining: Option<u64>,
    /// Rows still to skip.
    to_skip: u64,
}

impl RowCountResultSet {
    pub fn new(
        rsn: ResultSetNumber,
        source: Box<dyn ResultSet>,
        offset: Option<Expr>,
        fetch_first: Option<Expr>,
        jdbc_limit: bool,
    ) -> Self {
        Self {
            base: ResultSetBase::new(rsn),
            source,
            offset,
            fetch_first,
            jdbc_limit,
            remaining: None,
            to_skip: 0,
        }
    }

    fn eval_count(expr: &Expr, cx: &Activation<'_>, invalid: fn(i64) -> ExecError) -> Result<i64> {
        match expr.eval(&Row::default(), cx)?.into_owned() {
            Value::I64(n) => Ok(n),
            Value::Null => Err(ExecError::InvalidState("OFFSET and FETCH FIRST values must not be null")),
            _ => Err(invalid(-1)),
        }
    }

    fn evaluate(&mut self, cx: &Activation<'_>) -> Result<()> {
        self.to_skip = match &self.offset {
            None => 0,
            Some(expr) => {
                let n = Self::eval_count(expr, cx, ExecError::InvalidOffset)?;
                u64::try_from(n).map_err(|_| ExecError::InvalidOffset(n))?
            }
        };
        let limit = match &self.fetch_first {
            None => u64::MAX,
            Some(expr) => match Self::eval_count(expr, cx, ExecError::InvalidFetchFirst)? {
                0 if self.jdbc_limit => u64::MAX,
                n if n < 1 => return Err(ExecError::InvalidFetchFirst(n)),
                n => n as u64,
            },
        };
        self.remaining = Some(limit);
        Ok(())
    }

    fn reset(&mut self) {
        self.remaining = None;
        self.to_skip = 0;
    }
}

impl ResultSet for RowCountResultSet {
    fn kind(&self) -> &'static str {
        "row count"
    }

    fn base(&self) -> &ResultSetBase {
        &self.base
    }

    fn open_core(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let start = self.base.start_timer(cx);
        self.source.open_core(cx)?;
        self.reset();
        self.base.mark_open();
        self.base.stop_timer(start, Phase::Open);
        Ok(())
    }

    fn reopen_core(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let start = self.base.start_timer(cx);
        self.source.reopen_core(cx)?;
        self.reset();
        self.base.mark_open();
        self.base.stop_timer(start, Phase::Open);
        Ok(())
    }

    fn next_row_core(&mut self, cx: &mut Activation<'_>) -> Result<Option<Row>> {
        self.base.check_open("next_row")?;
        let start = self.base.start_timer(cx);
        if self.remaining.is_none() {
            self.evaluate(cx)?;
        }
        while self.to_skip > 0 {
            if self.source.next_row_core(cx)?.is_none() {
                self.to_skip = 0;
                self.remaining = Some(0);
                break;
            }
            self.to_skip -= 1;
            self.base.stats.rows_seen += 1;
            self.base.stats.rows_filtered += 1;
        }
        let row = match self.remaining {
            Some(0) | None => None,
            Some(n) => {
                let row = self.source.next_row_core(cx)?;
                self.remaining = Some(if row.is_some() { n - 1 } else { 0 });
                row
            }
        };
        let row = self.base.produced(cx, row);
        self.base.stop_timer(start, Phase::Next);
        Ok(row)
    }

    fn close(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let start = self.base.start_timer(cx);
        self.reset();
        let res = self.source.close(cx);
        self.base.mark_closed(cx);
        self.base.stop_timer(start, Phase::Close);
        res
    }

    fn finish(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        self.source.finish(cx)
    }

    fn requires_relocking(&self) -> Result<bool> {
        self.source.requires_relocking()
    }

    fn row_location(&self) -> Result<RowLocation> {
        self.source.row_location()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result_set::TopResultSet;
    use crate::testing::TestDb;
    use crate::values::RowResultSet;
    use pretty_assertions::assert_eq;
    use quarry_lib::row;

    fn ten_rows() -> Box<dyn ResultSet> {
        Box::new(RowResultSet::constant(ResultSetNumber(1), (1..=10).map(|i| row![i]).collect()))
    }

    fn run(offset: Option<i64>, fetch_first: Option<i64>, jdbc_limit: bool) -> Result<Vec<Row>> {
        let mut db = TestDb::new();
        let rs = RowCountResultSet::new(
            ResultSetNumber(0),
            ten_rows(),
            offset.map(Expr::val),
            fetch_first.map(Expr::val),
            jdbc_limit,
        );
        let mut top = TopResultSet::new(Box::new(rs));
        let mut cx = db.activation();
        top.collect(&mut cx)
    }

    #[test]
    fn offset_then_fetch_first() {
        assert_eq!(run(Some(3), Some(4), false).unwrap(), vec![row![4], row![5], row![6], row![7]]);
        assert_eq!(run(Some(0), None, false).unwrap().len(), 10);
        assert_eq!(run(Some(10), None, false).unwrap(), vec![]);
        assert_eq!(run(Some(12), Some(1), false).unwrap(), vec![]);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(run(Some(-1), None, false), Err(ExecError::InvalidOffset(-1))));
        assert!(matches!(run(None, Some(0), false), Err(ExecError::InvalidFetchFirst(0))));
        assert!(matches!(run(None, Some(-2), true), Err(ExecError::InvalidFetchFirst(-2))));
    }

    #[test]
    fn driver_limit_zero_is_unlimited() {
        assert_eq!(run(Some(8), Some(0), true).unwrap(), vec![row![9], row![10]]);
    }

    #[test]
    fn invalid_offset_leaves_the_source_untouched() {
        let mut db = TestDb::new();
        let rs = RowCountResultSet::new(ResultSetNumber(0), ten_rows(), Some(Expr::val(-1)), None, false);
        let mut cx = db.activation();
        let mut rs: Box<dyn ResultSet> = Box::new(rs);
        rs.open_core(&mut cx).unwrap();
        assert!(rs.next_row_core(&mut cx).is_err());
        assert!(cx.current_row(ResultSetNumber(1)).is_none());
    }

    #[test]
    fn skipped_rows_are_filtered_and_state_resets() {
        let mut db = TestDb::new();
        let rs = RowCountResultSet::new(
            ResultSetNumber(0),
            ten_rows(),
            Some(Expr::Param(0)),
            Some(Expr::Param(1)),
            false,
        );
        let mut top = TopResultSet::new(Box::new(rs));
        let mut cx = db.activation().with_params(vec![Value::from(2), Value::from(1)]);
        assert_eq!(top.collect(&mut cx).unwrap(), vec![row![3]]);
        assert_eq!(top.stats().rows_filtered, 2);

        cx.set_params(vec![Value::from(5), Value::from(2)]);
        assert_eq!(top.collect(&mut cx).unwrap(), vec![row![6], row![7]]);
    }
}
