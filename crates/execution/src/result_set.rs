//! The protocol every operator of a plan implements, and the driver
//! that runs a plan from its top.

use std::time::{Duration, Instant};

use quarry_lib::{ResultSetNumber, ResultSetStats, Row, RowLocation};

use crate::activation::Activation;
use crate::error::{ExecError, Result};

/// The phases timed when statistics are collected.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    Open,
    Next,
    Close,
}

/// State shared by every operator, held by value.
#[derive(Debug, Clone)]
pub struct ResultSetBase {
    pub rsn: ResultSetNumber,
    pub is_open: bool,
    pub current_row: Option<Row>,
    pub stats: ResultSetStats,
}

impl ResultSetBase {
    pub fn new(rsn: ResultSetNumber) -> Self {
        Self {
            rsn,
            is_open: false,
            current_row: None,
            stats: ResultSetStats::default(),
        }
    }

    /// Reads the clock only when statistics are collected.
    pub fn start_timer(&self, cx: &Activation<'_>) -> Option<Instant> {
        cx.config().collect_statistics.then(Instant::now)
    }

    pub fn stop_timer(&mut self, start: Option<Instant>, phase: Phase) {
        let Some(start) = start else { return };
        let elapsed: Duration = start.elapsed();
        let stats = &mut self.stats;
        match phase {
            Phase::Open => stats.open_time += elapsed,
            Phase::Next => stats.next_time += elapsed,
            Phase::Close => stats.close_time += elapsed,
        }
    }

    pub fn mark_open(&mut self) {
        self.is_open = true;
        self.current_row = None;
        self.stats.num_opens += 1;
    }

    pub fn check_open(&self, op: &'static str) -> Result<()> {
        if !self.is_open {
            return Err(ExecError::NotOpen { op });
        }
        Ok(())
    }

    /// Records the row just produced, or its absence, in this operator
    /// and in the activation's slot for it.
    pub fn set_current_row(&mut self, cx: &mut Activation<'_>, row: Option<&Row>) {
        match row {
            Some(row) => {
                cx.set_current_row(self.rsn, row);
                match &mut self.current_row {
                    Some(current) => current.clone_from(row),
                    None => self.current_row = Some(row.clone()),
                }
            }
            None => {
                cx.clear_current_row(self.rsn);
                self.current_row = None;
            }
        }
    }

    /// Counts and records a produced row.
    pub fn produced(&mut self, cx: &mut Activation<'_>, row: Option<Row>) -> Option<Row> {
        if row.is_some() {
            self.stats.rows_seen += 1;
        }
        self.set_current_row(cx, row.as_ref());
        row
    }

    pub fn mark_closed(&mut self, cx: &mut Activation<'_>) {
        if self.is_open {
            log::trace!("RESULT SET CLOSED: rsn = {}, stats = {:?}", self.rsn, self.stats);
        }
        self.is_open = false;
        self.set_current_row(cx, None);
    }
}

/// A node of a plan.
///
/// Only [`TopResultSet`] drives a tree from outside, so that an error
/// anywhere below can be cleaned up by closing the top.
pub trait ResultSet {
    /// A short name of the operator, for errors.
    fn kind(&self) -> &'static str;

    fn base(&self) -> &ResultSetBase;

    /// Acquires the resources of the operator and positions it before its first row.
    fn open_core(&mut self, cx: &mut Activation<'_>) -> Result<()>;

    /// The next row, or `None` once exhausted.
    /// Calls after exhaustion keep returning `None` until the next reopen.
    fn next_row_core(&mut self, cx: &mut Activation<'_>) -> Result<Option<Row>>;

    fn reopen_core(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        self.close(cx)?;
        self.open_core(cx)
    }

    /// Releases everything acquired by the last open, cascading to the children.
    /// A no-op on a closed operator, and safe after a failed open.
    fn close(&mut self, cx: &mut Activation<'_>) -> Result<()>;

    /// Releases what is kept across executions of the statement.
    fn finish(&mut self, _cx: &mut Activation<'_>) -> Result<()> {
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.base().is_open
    }

    fn result_set_number(&self) -> ResultSetNumber {
        self.base().rsn
    }

    fn stats(&self) -> ResultSetStats {
        self.base().stats
    }

    fn current_row(&self) -> Option<&Row> {
        self.base().current_row.as_ref()
    }

    /// Must whoever fetches by the locations this operator returns lock again?
    fn requires_relocking(&self) -> Result<bool> {
        Err(ExecError::unsupported("requires_relocking", self.kind()))
    }

    /// The base row location of the current row.
    fn row_location(&self) -> Result<RowLocation> {
        Err(ExecError::unsupported("row_location", self.kind()))
    }

    fn as_scroll(&mut self) -> Option<&mut dyn ScrollCursor> {
        None
    }
}

/// Positioning of a scrollable cursor.
///
/// Positions are 1-based. A `None` row is a position before the first or
/// after the last row.
pub trait ScrollCursor {
    fn absolute(&mut self, cx: &mut Activation<'_>, row: i64) -> Result<Option<Row>>;
    fn relative(&mut self, cx: &mut Activation<'_>, rows: i64) -> Result<Option<Row>>;
    fn first(&mut self, cx: &mut Activation<'_>) -> Result<Option<Row>>;
    fn last(&mut self, cx: &mut Activation<'_>) -> Result<Option<Row>>;
    fn previous(&mut self, cx: &mut Activation<'_>) -> Result<Option<Row>>;
    fn before_first(&mut self, cx: &mut Activation<'_>) -> Result<()>;
    fn after_last(&mut self, cx: &mut Activation<'_>) -> Result<()>;
    fn is_before_first(&self) -> bool;
    fn is_after_last(&self) -> bool;
    fn is_first(&self) -> bool;
    fn is_last(&mut self, cx: &mut Activation<'_>) -> Result<bool>;
    /// The current position, 0 when not on a row.
    fn row_number(&self) -> i64;
}

/// The root of a plan, the only node driven from outside.
///
/// An error raised anywhere in the tree closes the whole tree before it
/// is returned.
pub struct TopResultSet {
    root: Box<dyn ResultSet>,
    rows_returned: u64,
}

impl TopResultSet {
    pub fn new(root: Box<dyn ResultSet>) -> Self {
        Self { root, rows_returned: 0 }
    }

    pub fn root(&self) -> &dyn ResultSet {
        &*self.root
    }

    pub fn is_open(&self) -> bool {
        self.root.is_open()
    }

    pub fn stats(&self) -> ResultSetStats {
        self.root.stats()
    }

    /// Opens, or reopens, the plan.
    pub fn open(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        cx.check_statement_valid()?;
        self.rows_returned = 0;
        let res = if self.root.is_open() {
            self.root.reopen_core(cx)
        } else {
            self.root.open_core(cx)
        };
        self.cleanup_on_error(cx, res)
    }

    pub fn next_row(&mut self, cx: &mut Activation<'_>) -> Result<Option<Row>> {
        if !self.root.is_open() {
            return Err(ExecError::NotOpen { op: "next_row" });
        }
        if cx.max_rows() > 0 && self.rows_returned >= cx.max_rows() {
            return Ok(None);
        }
        let res = cx.check_statement_valid().and_then(|()| self.root.next_row_core(cx));
        let row = self.cleanup_on_error(cx, res)?;
        if row.is_some() {
            self.rows_returned += 1;
        }
        Ok(row)
    }

    pub fn close(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        self.root.close(cx)
    }

    /// Closes the plan and releases what it kept across executions.
    pub fn finish(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        self.root.close(cx)?;
        self.root.finish(cx)
    }

    /// Opens the plan and drains it.
    pub fn collect(&mut self, cx: &mut Activation<'_>) -> Result<Vec<Row>> {
        self.open(cx)?;
        let mut rows = Vec::new();
        while let Some(row) = self.next_row(cx)? {
            rows.push(row);
        }
        Ok(rows)
    }

    pub fn row_location(&self) -> Result<RowLocation> {
        self.root.row_location()
    }

    pub fn scroll(&mut self) -> Result<&mut dyn ScrollCursor> {
        let kind = self.root.kind();
        self.root
            .as_scroll()
            .ok_or_else(|| ExecError::unsupported("scroll", kind))
    }

    fn cleanup_on_error<T>(&mut self, cx: &mut Activation<'_>, res: Result<T>) -> Result<T> {
        if res.is_err() {
            if let Err(err) = self.root.close(cx) {
                log::warn!("error while closing a failed plan: {err}");
            }
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestDb;
    use crate::values::RowResultSet;
    use quarry_lib::row;

    #[test]
    fn only_an_open_top_produces_rows() {
        let mut db = TestDb::new();
        let mut cx = db.activation();
        let mut top = TopResultSet::new(Box::new(RowResultSet::constant(ResultSetNumber(0), vec![row![1], row![2]])));
        assert!(matches!(top.next_row(&mut cx), Err(ExecError::NotOpen { .. })));

        top.open(&mut cx).unwrap();
        assert_eq!(top.next_row(&mut cx).unwrap(), Some(row![1]));
        assert_eq!(top.next_row(&mut cx).unwrap(), Some(row![2]));
        assert_eq!(top.next_row(&mut cx).unwrap(), None);
        assert_eq!(top.next_row(&mut cx).unwrap(), None);

        top.close(&mut cx).unwrap();
        top.close(&mut cx).unwrap();
        assert!(!top.is_open());
    }

    #[test]
    fn max_rows_bounds_the_top() {
        let mut db = TestDb::new();
        let mut cx = db.activation().with_max_rows(1);
        let rows = vec![row![1], row![2], row![3]];
        let mut top = TopResultSet::new(Box::new(RowResultSet::constant(ResultSetNumber(0), rows)));
        assert_eq!(top.collect(&mut cx).unwrap(), vec![row![1]]);
    }

    #[test]
    fn reopening_restarts_the_plan() {
        let mut db = TestDb::new();
        let mut cx = db.activation();
        let mut top = TopResultSet::new(Box::new(RowResultSet::constant(ResultSetNumber(0), vec![row![1]])));
        assert_eq!(top.collect(&mut cx).unwrap(), vec![row![1]]);
        assert_eq!(top.collect(&mut cx).unwrap(), vec![row![1]]);
        assert_eq!(top.stats().num_opens, 2);
    }

    #[test]
    fn non_scrolling_plans_refuse_positioning() {
        let mut db = TestDb::new();
        let mut cx = db.activation();
        let mut top = TopResultSet::new(Box::new(RowResultSet::constant(ResultSetNumber(0), vec![])));
        top.open(&mut cx).unwrap();
        assert!(matches!(top.scroll(), Err(ExecError::Unsupported { op: "scroll", .. })));
        assert!(matches!(top.row_location(), Err(ExecError::Unsupported { .. })));
    }
}
