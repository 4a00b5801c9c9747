use quarry_lib::{ResultSetNumber, Row, RowLocation};

use super::{ScanCore, ScanParams};
use crate::activation::Activation;
use crate::error::{ExecError, Result};
use crate::result_set::{Phase, ResultSet, ResultSetBase};

/// Reads a heap or an index through one store scan, a row at a time.
pub struct TableScanResultSet {
    base: ResultSetBase,
    core: ScanCore,
    /// Only one row is returned per open of a one row scan.
    next_done: bool,
    /// The full row last fetched, and its heap location.
    candidate: Option<(Row, Option<RowLocation>)>,
}

impl TableScanResultSet {
    pub fn new(rsn: ResultSetNumber, params: ScanParams) -> Self {
        Self {
            base: ResultSetBase::new(rsn),
            core: ScanCore::new(params),
            next_done: false,
            candidate: None,
        }
    }

    /// Was a store scan positioned at the last open?
    /// False when the start or stop position could match no row.
    pub fn is_scan_opened(&self) -> bool {
        self.core.is_scan_opened()
    }
}

impl ResultSet for TableScanResultSet {
    fn kind(&self) -> &'static str {
        "table scan"
    }

    fn base(&self) -> &ResultSetBase {
        &self.base
    }

    fn open_core(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let start = self.base.start_timer(cx);
        self.core.position(cx)?;
        log::trace!(
            "TABLE SCAN OPENED: rsn = {}, conglomerate = {}",
            self.base.rsn,
            self.core.params.conglom
        );
        self.next_done = false;
        self.candidate = None;
        self.base.mark_open();
        self.base.stop_timer(start, Phase::Open);
        Ok(())
    }

    /// Repositions the existing store scan rather than opening another.
    fn reopen_core(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        if !self.base.is_open {
            return self.open_core(cx);
        }
        let start = self.base.start_timer(cx);
        self.core.position(cx)?;
        self.next_done = false;
        self.candidate = None;
        self.base.mark_open();
        self.base.stop_timer(start, Phase::Open);
        Ok(())
    }

    fn next_row_core(&mut self, cx: &mut Activation<'_>) -> Result<Option<Row>> {
        self.base.check_open("next_row")?;
        if self.next_done {
            self.base.set_current_row(cx, None);
            return Ok(None);
        }
        let start = self.base.start_timer(cx);
        self.next_done = self.core.params.one_row;
        let row = match self.core.next_candidate(cx, &mut self.base.stats)? {
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
        self.candidate = None;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result_set::TopResultSet;
    use crate::scan::{IndexRowToBaseRowResultSet, KeyBound};
    use crate::testing::TestDb;
    use pretty_assertions::assert_eq;
    use quarry_datastore::{IsolationLevel, Qualifier, Qualifiers};
    use quarry_expr::Expr;
    use quarry_lib::{row, OpCmp, Value};

    fn people(db: &mut TestDb) -> (quarry_lib::ConglomId, quarry_lib::ConglomId) {
        let heap = db.table(
            "PEOPLE",
            2,
            &[row![3, "c"], row![1, "a"], row![Value::Null, "n"], row![2, "b"]],
        );
        let index = db.index(heap, "PEOPLE_ID", &[0], false);
        (heap, index)
    }

    #[test]
    fn heap_scan_applies_qualifiers() {
        let mut db = TestDb::new();
        let (heap, _) = people(&mut db);
        let params =
            ScanParams::new(heap).qualifiers(Qualifiers::all(vec![Qualifier::new(0, OpCmp::Gt, 1)]));
        let mut top = TopResultSet::new(Box::new(TableScanResultSet::new(ResultSetNumber(0), params)));
        let mut cx = db.activation();
        assert_eq!(top.collect(&mut cx).unwrap(), vec![row![3, "c"], row![2, "b"]]);
    }

    #[test]
    fn index_range_scan_and_row_locations() {
        let mut db = TestDb::new();
        let (heap, index) = people(&mut db);
        let params = ScanParams::new(index)
            .start(KeyBound::values([Value::from(1)], false))
            .stop(KeyBound::values([Value::from(3)], true));
        let mut scan = TableScanResultSet::new(ResultSetNumber(0), params);
        let mut cx = db.activation();
        scan.open_core(&mut cx).unwrap();
        let row = scan.next_row_core(&mut cx).unwrap().unwrap();
        assert_eq!(row.get(quarry_lib::ColId(0)), &Value::from(2));
        let loc = scan.row_location().unwrap();
        assert_eq!(loc.conglom, heap);
        assert_eq!(scan.next_row_core(&mut cx).unwrap().unwrap()[0], Value::from(3));
        assert_eq!(scan.next_row_core(&mut cx).unwrap(), None);
        assert_eq!(scan.next_row_core(&mut cx).unwrap(), None);
        scan.close(&mut cx).unwrap();
        scan.close(&mut cx).unwrap();
        assert!(matches!(scan.next_row_core(&mut cx), Err(ExecError::NotOpen { .. })));
    }

    #[test]
    fn null_start_key_skips_the_scan() {
        let mut db = TestDb::new();
        let (_, index) = people(&mut db);
        db.store.reset_counters();
        let params = ScanParams::new(index).start(KeyBound::values([Value::Null], true));
        let mut scan = TableScanResultSet::new(ResultSetNumber(0), params);
        let mut cx = db.activation();
        scan.open_core(&mut cx).unwrap();
        assert_eq!(scan.next_row_core(&mut cx).unwrap(), None);
        assert!(!scan.is_scan_opened());
        drop(cx);
        assert_eq!(db.store.counters().scans_opened, 0);
    }

    #[test]
    fn ordered_nulls_position_on_null() {
        let mut db = TestDb::new();
        let (_, index) = people(&mut db);
        let key = KeyBound::values([Value::Null], true).with_ordered_nulls(vec![true]);
        let params = ScanParams::new(index).exact(key).columns(&[0]);
        let mut top = TopResultSet::new(Box::new(TableScanResultSet::new(ResultSetNumber(0), params)));
        let mut cx = db.activation();
        assert_eq!(top.collect(&mut cx).unwrap(), vec![row![Value::Null]]);
    }

    #[test]
    fn open_ranges_filter_null_keys() {
        let mut db = TestDb::new();
        let (_, index) = people(&mut db);
        // Nulls sort last, so only the null check keeps them out.
        let params = ScanParams::new(index)
            .start(KeyBound::values([Value::from(2)], true))
            .columns(&[0]);
        let mut scan = TableScanResultSet::new(ResultSetNumber(0), params);
        let mut top_rows = Vec::new();
        let mut cx = db.activation();
        scan.open_core(&mut cx).unwrap();
        while let Some(row) = scan.next_row_core(&mut cx).unwrap() {
            top_rows.push(row);
        }
        assert_eq!(top_rows, vec![row![2], row![3]]);
        assert_eq!(scan.stats().rows_seen, 3);
        assert_eq!(scan.stats().rows_filtered, 1);
    }

    #[test]
    fn reopen_reuses_the_store_scan_with_new_parameters() {
        let mut db = TestDb::new();
        let (heap, index) = people(&mut db);
        let params = ScanParams::new(index).exact(KeyBound::new(vec![Expr::Param(0)], true));
        let scan = TableScanResultSet::new(ResultSetNumber(1), params);
        // Names come from the heap; the index only holds the id.
        let fetch = IndexRowToBaseRowResultSet::new(ResultSetNumber(0), Box::new(scan), heap, &[0], &[1]);
        let mut top = TopResultSet::new(Box::new(fetch));
        db.store.reset_counters();
        let mut cx = db.activation().with_params(vec![Value::from(1)]);
        assert_eq!(top.collect(&mut cx).unwrap(), vec![row!["a"]]);
        cx.set_params(vec![Value::from(3)]);
        assert_eq!(top.collect(&mut cx).unwrap(), vec![row!["c"]]);
        drop(cx);
        let counters = db.store.counters();
        assert_eq!((counters.scans_opened, counters.scans_reopened), (1, 1));
    }

    #[test]
    fn one_row_scans_stop_after_a_row() {
        let mut db = TestDb::new();
        let (heap, _) = people(&mut db);
        let params = ScanParams::new(heap).one_row();
        let mut top = TopResultSet::new(Box::new(TableScanResultSet::new(ResultSetNumber(0), params)));
        let mut cx = db.activation();
        assert_eq!(top.collect(&mut cx).unwrap().len(), 1);
    }

    #[test]
    fn relocking_follows_isolation() {
        let mut db = TestDb::new();
        let (heap, _) = people(&mut db);
        let mut cx = db.activation();
        let mut scan = TableScanResultSet::new(ResultSetNumber(0), ScanParams::new(heap));
        scan.open_core(&mut cx).unwrap();
        assert!(scan.requires_relocking().unwrap());
        scan.close(&mut cx).unwrap();

        let params = ScanParams::new(heap).isolation(IsolationLevel::Serializable);
        let mut scan = TableScanResultSet::new(ResultSetNumber(0), params);
        scan.open_core(&mut cx).unwrap();
        assert!(!scan.requires_relocking().unwrap());

        let mut scan = TableScanResultSet::new(ResultSetNumber(0), ScanParams::new(heap).for_update());
        scan.open_core(&mut cx).unwrap();
        assert!(!scan.requires_relocking().unwrap());
    }
}
