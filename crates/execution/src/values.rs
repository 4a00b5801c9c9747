//! Leaves producing rows computed by the plan itself, and `UNION ALL`.

use quarry_expr::Expr;
use quarry_lib::{ResultSetNumber, Row};

use crate::activation::Activation;
use crate::error::Result;
use crate::result_set::{Phase, ResultSet, ResultSetBase};

/// One row of a `VALUES` list.
#[derive(Debug, Clone)]
pub enum RowSource {
    Constant(Row),
    /// Evaluated at every execution, against parameters and outer rows.
    Exprs(Vec<Expr>),
}

/// Produces a fixed list of rows, as `VALUES (...), (...)` does.
pub struct RowResultSet {
    base: ResultSetBase,
    rows: Vec<RowSource>,
    next: usize,
}

impl RowResultSet {
    pub fn new(rsn: ResultSetNumber, rows: Vec<RowSource>) -> Self {
        Self {
            base: ResultSetBase::new(rsn),
            rows,
            next: 0,
        }
    }

    pub fn constant(rsn: ResultSetNumber, rows: Vec<Row>) -> Self {
        Self::new(rsn, rows.into_iter().map(RowSource::Constant).collect())
    }
}

impl ResultSet for RowResultSet {
    fn kind(&self) -> &'static str {
        "row"
    }

    fn base(&self) -> &ResultSetBase {
        &self.base
    }

    fn open_core(&mut self, _cx: &mut Activation<'_>) -> Result<()> {
        self.next = 0;
        self.base.mark_open();
        Ok(())
    }

    fn next_row_core(&mut self, cx: &mut Activation<'_>) -> Result<Option<Row>> {
        self.base.check_open("next_row")?;
        let start = self.base.start_timer(cx);
        let row = match self.rows.get(self.next) {
            None => None,
            Some(RowSource::Constant(row)) => Some(row.clone()),
            Some(RowSource::Exprs(exprs)) => {
                let empty = Row::default();
                let values = exprs
                    .iter()
                    .map(|e| e.eval(&empty, &*cx).map(|v| v.into_owned()))
                    .collect::<Result<Vec<_>, _>>()?;
                Some(Row::new(values))
            }
        };
        if row.is_some() {
            self.next += 1;
        }
        let row = self.base.produced(cx, row);
        self.base.stop_timer(start, Phase::Next);
        Ok(row)
    }

    fn close(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        self.base.mark_closed(cx);
        Ok(())
    }
}

/// `UNION ALL`: every row of the left input, then every row of the right.
pub struct UnionResultSet {
    base: ResultSetBase,
    left: Box<dyn ResultSet>,
    right: Box<dyn ResultSet>,
    on_right: bool,
}

impl UnionResultSet {
    pub fn new(rsn: ResultSetNumber, left: Box<dyn ResultSet>, right: Box<dyn ResultSet>) -> Self {
        Self {
            base: ResultSetBase::new(rsn),
            left,
            right,
            on_right: false,
        }
    }
}

impl ResultSet for UnionResultSet {
    fn kind(&self) -> &'static str {
        "union"
    }

    fn base(&self) -> &ResultSetBase {
        &self.base
    }

    fn open_core(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let start = self.base.start_timer(cx);
        self.left.open_core(cx)?;
        self.on_right = false;
        self.base.mark_open();
        self.base.stop_timer(start, Phase::Open);
        Ok(())
    }

    fn reopen_core(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        self.right.close(cx)?;
        self.left.reopen_core(cx)?;
        self.on_right = false;
        self.base.mark_open();
        Ok(())
    }

    fn next_row_core(&mut self, cx: &mut Activation<'_>) -> Result<Option<Row>> {
        self.base.check_open("next_row")?;
        let start = self.base.start_timer(cx);
        let mut row = None;
        if !self.on_right {
            row = self.left.next_row_core(cx)?;
            if row.is_none() {
                // The right input is opened lazily, once the left is drained.
                self.left.close(cx)?;
                self.right.open_core(cx)?;
                self.on_right = true;
            }
        }
        if self.on_right {
            row = self.right.next_row_core(cx)?;
        }
        let row = self.base.produced(cx, row);
        self.base.stop_timer(start, Phase::Next);
        Ok(row)
    }

    fn close(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let start = self.base.start_timer(cx);
        self.left.close(cx)?;
        self.right.close(cx)?;
        self.base.mark_closed(cx);
        self.base.stop_timer(start, Phase::Close);
        Ok(())
    }

    fn finish(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        self.left.finish(cx)?;
        self.right.finish(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result_set::TopResultSet;
    use crate::testing::TestDb;
    use quarry_lib::{row, OpMath, Value};

    #[test]
    fn values_are_evaluated_per_execution() {
        let mut db = TestDb::new();
        let rows = vec![
            RowSource::Constant(row![1, "a"]),
            RowSource::Exprs(vec![Expr::math(OpMath::Add, Expr::Param(0), Expr::val(1)), Expr::val("b")]),
        ];
        let mut top = TopResultSet::new(Box::new(RowResultSet::new(ResultSetNumber(0), rows)));

        let mut cx = db.activation().with_params(vec![Value::from(41)]);
        assert_eq!(top.collect(&mut cx).unwrap(), vec![row![1, "a"], row![42, "b"]]);
        cx.set_params(vec![Value::from(9)]);
        assert_eq!(top.collect(&mut cx).unwrap(), vec![row![1, "a"], row![10, "b"]]);
    }

    #[test]
    fn union_concatenates() {
        let mut db = TestDb::new();
        let mut cx = db.activation();
        let left = RowResultSet::constant(ResultSetNumber(1), vec![row![1], row![2]]);
        let right = RowResultSet::constant(ResultSetNumber(2), vec![row![2]]);
        let union = UnionResultSet::new(ResultSetNumber(0), Box::new(left), Box::new(right));
        let mut top = TopResultSet::new(Box::new(union));
        assert_eq!(top.collect(&mut cx).unwrap(), vec![row![1], row![2], row![2]]);
        assert_eq!(top.collect(&mut cx).unwrap().len(), 3);
        assert_eq!(top.stats().rows_seen, 6);
    }
}
