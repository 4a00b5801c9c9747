//! Scroll insensitive cursors.

use indexmap::IndexMap;
use quarry_lib::{ResultSetNumber, Row};

use crate::activation::Activation;
use crate::error::Result;
use crate::result_set::{Phase, ResultSet, ResultSetBase, ScrollCursor};

/// Materializes its source as it is read forward, so that any position
/// already visited can be returned again without reading the source from
/// the start.
///
/// Positions are 1-based. Position 0 is before the first row and
/// `after_last` is set past the last one.
pub struct ScrollInsensitiveResultSet {
    base: ResultSetBase,
    source: Box<dyn ResultSet>,
    rows: IndexMap<u64, Row>,
    position: u64,
    after_last: bool,
    source_done: bool,
    /// Zero is no limit.
    max_rows: u64,
}

impl ScrollInsensitiveResultSet {
    pub fn new(rsn: ResultSetNumber, source: Box<dyn ResultSet>) -> Self {
        Self {
            base: ResultSetBase::new(rsn),
            source,
            rows: IndexMap::new(),
            position: 0,
            after_last: false,
            source_done: false,
            max_rows: 0,
        }
    }

    /// Rows read from the source so far.
    pub fn rows_materialized(&self) -> u64 {
        self.rows.len() as u64
    }

    /// Reads the source forward until `pos` rows are materialized or it is drained.
    fn fill_to(&mut self, cx: &mut Activation<'_>, pos: u64) -> Result<()> {
        while !self.source_done && self.rows_materialized() < pos {
            if self.max_rows > 0 && self.rows_materialized() >= self.max_rows {
                self.source_done = true;
                break;
            }
            match self.source.next_row_core(cx)? {
                Some(row) => {
                    let next = self.rows_materialized() + 1;
                    self.rows.insert(next, row);
                }
                None => self.source_done = true,
            }
        }
        Ok(())
    }

    fn fill_all(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        self.fill_to(cx, u64::MAX)
    }

    /// Moves to `pos` and returns its row, or positions before the first
    /// or after the last row when there is none.
    fn move_to(&mut self, cx: &mut Activation<'_>, pos: i64) -> Result<Option<Row>> {
        if pos <= 0 {
            self.set_before_first(cx);
            return Ok(None);
        }
        let pos = pos as u64;
        self.fill_to(cx, pos)?;
        let row = self.rows.get(&pos).cloned();
        match &row {
            Some(_) => {
                self.position = pos;
                self.after_last = false;
            }
            None => {
                self.position = self.rows_materialized() + 1;
                self.after_last = true;
            }
        }
        self.base.set_current_row(cx, row.as_ref());
        Ok(row)
    }

    fn set_before_first(&mut self, cx: &mut Activation<'_>) {
        self.position = 0;
        self.after_last = false;
        self.base.set_current_row(cx, None);
    }

    fn on_row(&self) -> bool {
        self.position > 0 && !self.after_last
    }
}

impl ResultSet for ScrollInsensitiveResultSet {
    fn kind(&self) -> &'static str {
        "scroll insensitive"
    }

    fn base(&self) -> &ResultSetBase {
        &self.base
    }

    fn open_core(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let start = self.base.start_timer(cx);
        self.source.open_core(cx)?;
        self.rows.clear();
        self.position = 0;
        self.after_last = false;
        self.source_done = false;
        self.max_rows = cx.max_rows();
        self.base.mark_open();
        self.base.stop_timer(start, Phase::Open);
        Ok(())
    }

    fn next_row_core(&mut self, cx: &mut Activation<'_>) -> Result<Option<Row>> {
        self.base.check_open("next_row")?;
        if self.after_last {
            return Ok(None);
        }
        let start = self.base.start_timer(cx);
        let row = self.move_to(cx, self.position as i64 + 1)?;
        if row.is_some() {
            self.base.stats.rows_seen += 1;
        }
        self.base.stop_timer(start, Phase::Next);
        Ok(row)
    }

    fn close(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let start = self.base.start_timer(cx);
        self.rows.clear();
        self.position = 0;
        self.after_last = false;
        let res = self.source.close(cx);
        self.base.mark_closed(cx);
        self.base.stop_timer(start, Phase::Close);
        res
    }

    fn finish(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        self.source.finish(cx)
    }

    fn as_scroll(&mut self) -> Option<&mut dyn ScrollCursor> {
        Some(self)
    }
}

impl ScrollCursor for ScrollInsensitiveResultSet {
    /// A negative `row` counts back from the last row, -1 being the last.
    fn absolute(&mut self, cx: &mut Activation<'_>, row: i64) -> Result<Option<Row>> {
        self.base.check_open("absolute")?;
        if row >= 0 {
            return self.move_to(cx, row);
        }
        self.fill_all(cx)?;
        let pos = self.rows_materialized() as i64 + row + 1;
        self.move_to(cx, pos)
    }

    fn relative(&mut self, cx: &mut Activation<'_>, rows: i64) -> Result<Option<Row>> {
        self.base.check_open("relative")?;
        if self.after_last {
            self.fill_all(cx)?;
            self.position = self.rows_materialized() + 1;
        }
        let pos = (self.position as i64).saturating_add(rows);
        self.move_to(cx, pos)
    }

    fn first(&mut self, cx: &mut Activation<'_>) -> Result<Option<Row>> {
        self.absolute(cx, 1)
    }

    fn last(&mut self, cx: &mut Activation<'_>) -> Result<Option<Row>> {
        self.absolute(cx, -1)
    }

    fn previous(&mut self, cx: &mut Activation<'_>) -> Result<Option<Row>> {
        self.relative(cx, -1)
    }

    fn before_first(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        self.base.check_open("before_first")?;
        self.set_before_first(cx);
        Ok(())
    }

    fn after_last(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        self.base.check_open("after_last")?;
        self.fill_all(cx)?;
        self.position = self.rows_materialized() + 1;
        self.after_last = true;
        self.base.set_current_row(cx, None);
        Ok(())
    }

    fn is_before_first(&self) -> bool {
        self.position == 0 && !self.after_last
    }

    fn is_after_last(&self) -> bool {
        self.after_last
    }

    fn is_first(&self) -> bool {
        self.on_row() && self.position == 1
    }

    fn is_last(&mut self, cx: &mut Activation<'_>) -> Result<bool> {
        if !self.on_row() {
            return Ok(false);
        }
        self.fill_to(cx, self.position + 1)?;
        Ok(!self.rows.contains_key(&(self.position + 1)))
    }

    fn row_number(&self) -> i64 {
        if self.on_row() { self.position as i64 } else { 0 }
    }
}
