use quarry_datastore::{ConglomerateController, IsolationLevel, LockMode, OpenMode};
use quarry_expr::Expr;
use quarry_lib::{ColId, ConglomId, FixedBitSet, ResultSetNumber, Row, RowLocation};

use crate::activation::Activation;
use crate::error::{ExecError, Result};
use crate::result_set::{Phase, ResultSet, ResultSetBase};

/// Joins the rows of an index scan to the rows of its base table.
///
/// The source returns whole index rows, key columns then row location.
/// Columns the index holds are taken from it and the others are fetched
/// from the heap by location. The result holds the accessed base columns
/// in base column order.
pub struct IndexRowToBaseRowResultSet {
    base: ResultSetBase,
    source: Box<dyn ResultSet>,
    heap: ConglomId,
    /// For each key column of the index, the base column it holds.
    index_cols: Vec<ColId>,
    /// The base columns returned, ascending.
    accessed: Vec<ColId>,
    /// Accessed columns found only in the heap.
    heap_cols: FixedBitSet,
    restriction: Option<Expr>,
    for_update: bool,
    cc: Option<Box<dyn ConglomerateController>>,
    /// Lock each base row again before reading it.
    relock: bool,
    current_loc: Option<RowLocation>,
}

impl IndexRowToBaseRowResultSet {
    pub fn new(
        rsn: ResultSetNumber,
        source: Box<dyn ResultSet>,
        heap: ConglomId,
        index_cols: &[u32],
        accessed: &[u32],
    ) -> Self {
        let index_cols: Vec<ColId> = index_cols.iter().copied().map(ColId).collect();
        let mut accessed: Vec<ColId> = accessed.iter().copied().map(ColId).collect();
        accessed.sort_unstable();
        accessed.dedup();
        let width = accessed.last().map_or(0, |c| c.idx() + 1);
        let heap_cols = FixedBitSet::from_bits(
            width,
            accessed.iter().filter(|c| !index_cols.contains(c)).map(|c| c.idx()),
        );
        Self {
            base: ResultSetBase::new(rsn),
            source,
            heap,
            index_cols,
            accessed,
            heap_cols,
            restriction: None,
            for_update: false,
            cc: None,
            relock: false,
            current_loc: None,
        }
    }

    /// A predicate over the returned row, checked after the fetch.
    pub fn with_restriction(mut self, restriction: Expr) -> Self {
        self.restriction = Some(restriction);
        self
    }

    pub fn for_update(mut self) -> Self {
        self.for_update = true;
        self
    }

    /// The base row of `index_row`, or `None` if it is gone.
    fn fetch_base_row(&mut self, index_row: &Row, loc: RowLocation) -> Result<Option<Row>> {
        let cc = self
            .cc
            .as_mut()
            .ok_or(ExecError::InvalidState("base table is not open"))?;
        let Some(mut base_row) = cc.fetch(loc, Some(&self.heap_cols), self.relock)? else {
            return Ok(None);
        };
        for (pos, col) in self.index_cols.iter().enumerate() {
            base_row.set(*col, index_row.get(ColId(pos as u32)).clone());
        }
        Ok(Some(base_row.project(&self.accessed)))
    }
}

impl ResultSet for IndexRowToBaseRowResultSet {
    fn kind(&self) -> &'static str {
        "index row to base row"
    }

    fn base(&self) -> &ResultSetBase {
        &self.base
    }

    fn open_core(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let start = self.base.start_timer(cx);
        self.source.open_core(cx)?;
        // A source that cannot tell holds its locks.
        self.relock = self.source.requires_relocking().unwrap_or(false);
        if self.cc.is_none() {
            let mode = if self.for_update {
                OpenMode::ForUpdate
            } else {
                OpenMode::ReadOnly
            };
            let isolation = if self.for_update {
                IsolationLevel::RepeatableRead
            } else {
                cx.isolation()
            };
            self.cc = Some(cx.tc().open_conglomerate(self.heap, mode, LockMode::Record, isolation)?);
        }
        self.current_loc = None;
        self.base.mark_open();
        self.base.stop_timer(start, Phase::Open);
        Ok(())
    }

    fn reopen_core(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        if !self.base.is_open {
            return self.open_core(cx);
        }
        let start = self.base.start_timer(cx);
        self.source.reopen_core(cx)?;
        self.current_loc = None;
        self.base.mark_open();
        self.base.stop_timer(start, Phase::Open);
        Ok(())
    }

    fn next_row_core(&mut self, cx: &mut Activation<'_>) -> Result<Option<Row>> {
        self.base.check_open("next_row")?;
        let start = self.base.start_timer(cx);
        let mut found = None;
        while let Some(index_row) = self.source.next_row_core(cx)? {
            let loc = match index_row.row_location() {
                Some(loc) => loc,
                None => self.source.row_location()?,
            };
            self.base.stats.rows_seen += 1;
            let Some(row) = self.fetch_base_row(&index_row, loc)? else {
                log::warn!("BASE ROW VANISHED: location = {loc}, index row = {index_row}");
                self.base.stats.rows_filtered += 1;
                continue;
            };
            let qualifies = match &self.restriction {
                Some(restriction) => restriction.qualifies(&row, &*cx)?,
                None => true,
            };
            if qualifies {
                self.current_loc = Some(loc);
                found = Some(row);
                break;
            }
            self.base.stats.rows_filtered += 1;
        }
        if found.is_none() {
            self.current_loc = None;
        }
        self.base.set_current_row(cx, found.as_ref());
        self.base.stop_timer(start, Phase::Next);
        Ok(found)
    }

    fn close(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let start = self.base.start_timer(cx);
        if let Some(mut cc) = self.cc.take() {
            cc.close();
        }
        self.current_loc = None;
        let res = self.source.close(cx);
        self.base.mark_closed(cx);
        self.base.stop_timer(start, Phase::Close);
        res
    }

    fn requires_relocking(&self) -> Result<bool> {
        Ok(false)
    }

    fn row_location(&self) -> Result<RowLocation> {
        self.current_loc.ok_or(ExecError::InvalidState("no current row"))
    }
}
