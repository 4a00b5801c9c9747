use std::collections::VecDeque;

use quarry_lib::{ResultSetNumber, Row, RowLocation};

use super::{ScanCore, ScanParams};
use crate::activation::Activation;
use crate::error::{ExecError, Result};
use crate::result_set::{Phase, ResultSet, ResultSetBase};

/// A table scan fetching rows from the store in groups.
///
/// Locks on the rows of a group may be released before the rows are
/// returned, so at read committed and below whoever fetches the base row
/// by location must lock it again.
pub struct BulkTableScanResultSet {
    base: ResultSetBase,
    core: ScanCore,
    /// Rows of the current group not yet returned.
    batch: VecDeque<(Row, Option<RowLocation>)>,
    /// The store returned a short group, so there are no more rows.
    exhausted: bool,
    candidate: Option<(Row, Option<RowLocation>)>,
    /// Rows per group, zero for the configured size.
    fetch_size: usize,
}

impl BulkTableScanResultSet {
    pub fn new(rsn: ResultSetNumber, params: ScanParams) -> Self {
        Self {
            base: ResultSetBase::new(rsn),
            core: ScanCore::new(params),
            batch: VecDeque::new(),
            exhausted: false,
            candidate: None,
            fetch_size: 0,
        }
    }

    pub fn with_fetch_size(mut self, fetch_size: usize) -> Self {
        self.fetch_size = fetch_size;
        self
    }

    fn group_size(&self, cx: &Activation<'_>) -> usize {
        if self.core.params.one_row {
            return 1;
        }
        match self.fetch_size {
            0 => cx.config().bulk_fetch_size,
            n => n,
        }
    }

    fn reset(&mut self) {
        self.batch.clear();
        self.exhausted = false;
        self.candidate = None;
    }
}

impl ResultSet for BulkTableScanResultSet {
    fn kind(&self) -> &'static str {
        "bulk table scan"
    }

    fn base(&self) -> &ResultSetBase {
        &self.base
    }

    fn open_core(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let start = self.base.start_timer(cx);
        self.core.position(cx)?;
        self.reset();
        self.base.mark_open();
        self.base.stop_timer(start, Phase::Open);
        Ok(())
    }

    fn reopen_core(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        if !self.base.is_open {
            return self.open_core(cx);
        }
        let start = self.base.start_timer(cx);
        self.core.position(cx)?;
        self.reset();
        self.base.mark_open();
        self.base.stop_timer(start, Phase::Open);
        Ok(())
    }

    fn next_row_core(&mut self, cx: &mut Activation<'_>) -> Result<Option<Row>> {
        self.base.check_open("next_row")?;
        let start = self.base.start_timer(cx);
        while self.batch.is_empty() && !self.exhausted {
            let max = self.group_size(cx);
            let mut group = Vec::with_capacity(max);
            let fetched = self.core.next_group(cx, &mut self.base.stats, &mut group, max)?;
            self.exhausted = fetched < max || self.core.params.one_row;
            self.batch.extend(group);
        }
        let row = match self.batch.pop_front() {
            Some((candidate, loc)) => {
                let row = self.core.output(&candidate, loc)?;
                self.candidate = Some((candidate, loc));
                Some(row)
            }
            None => {
                self.candidate = None;
                None
            }
        };
        self.base.set_current_row(cx, row.as_ref());
        self.base.stop_timer(start, Phase::Next);
        Ok(row)
    }

    fn close(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let start = self.base.start_timer(cx);
        self.core.close();
        self.reset();
        self.base.mark_closed(cx);
        self.base.stop_timer(start, Phase::Close);
        Ok(())
    }

    fn requires_relocking(&self) -> Result<bool> {
        Ok(self.core.requires_relocking())
    }

    fn row_location(&self) -> Result<RowLocation> {
        let (candidate, loc) = self
            .candidate
            .as_ref()
            .ok_or(ExecError::InvalidState("no current row"))?;
        self.core.base_location(candidate, *loc)
    }
}
