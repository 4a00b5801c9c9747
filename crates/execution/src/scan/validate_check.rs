use quarry_datastore::{ConglomerateController, LockMode, OpenMode};
use quarry_lib::{ConglomId, ResultSetNumber, Row, RowLocation};

use crate::activation::Activation;
use crate::error::{ExecError, Result};
use crate::result_set::{Phase, ResultSet, ResultSetBase};

/// Reads the heap rows at a list of remembered locations.
///
/// Used to check a deferred check constraint against only the rows that
/// violated it when they were written. Rows deleted since are skipped.
pub struct ValidateCheckResultSet {
    base: ResultSetBase,
    heap: ConglomId,
    locations: Vec<RowLocation>,
    next: usize,
    cc: Option<Box<dyn ConglomerateController>>,
    current_loc: Option<RowLocation>,
}

impl ValidateCheckResultSet {
    pub fn new(rsn: ResultSetNumber, heap: ConglomId, locations: Vec<RowLocation>) -> Self {
        Self {
            base: ResultSetBase::new(rsn),
            heap,
            locations,
            next: 0,
            cc: None,
            current_loc: None,
        }
    }
}

impl ResultSet for ValidateCheckResultSet {
    fn kind(&self) -> &'static str {
        "validate check"
    }

    fn base(&self) -> &ResultSetBase {
        &self.base
    }

    fn open_core(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let start = self.base.start_timer(cx);
        if self.cc.is_none() {
            let isolation = cx.isolation();
            self.cc = Some(
                cx.tc()
                    .open_conglomerate(self.heap, OpenMode::ReadOnly, LockMode::Record, isolation)?,
            );
        }
        self.next = 0;
        self.current_loc = None;
        self.base.mark_open();
        self.base.stop_timer(start, Phase::Open);
        Ok(())
    }

    fn next_row_core(&mut self, cx: &mut Activation<'_>) -> Result<Option<Row>> {
        self.base.check_open("next_row")?;
        let start = self.base.start_timer(cx);
        let cc = self
            .cc
            .as_mut()
            .ok_or(ExecError::InvalidState("base table is not open"))?;
        let mut found = None;
        while let Some(loc) = self.locations.get(self.next).copied() {
            self.next += 1;
            cx.check_cancel()?;
            if let Some(row) = cc.fetch(loc, None, false)? {
                self.current_loc = Some(loc);
                found = Some(row);
                break;
            }
            log::trace!("REMEMBERED ROW GONE: location = {loc}");
        }
        if found.is_none() {
            self.current_loc = None;
        }
        let row = self.base.produced(cx, found);
        self.base.stop_timer(start, Phase::Next);
        Ok(row)
    }

    fn close(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        if let Some(mut cc) = self.cc.take() {
            cc.close();
        }
        self.current_loc = None;
        self.base.mark_closed(cx);
        Ok(())
    }

    fn row_location(&self) -> Result<RowLocation> {
        self.current_loc.ok_or(ExecError::InvalidState("no current row"))
    }
}
