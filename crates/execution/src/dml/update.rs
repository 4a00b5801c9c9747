use std::rc::Rc;

use quarry_datastore::LockMode;
use quarry_lib::{ConglomId, ResultSetNumber, Row};

use crate::activation::{Activation, RowHolderRef};
use crate::dml::constraints::CheckConstraints;
use crate::dml::row_changer::RowChanger;
use crate::dml::{for_each_held, split_location};
use crate::error::{ExecError, Result};
use crate::result_set::{Phase, ResultSet, ResultSetBase};
use crate::temp_holder::TemporaryRowHolder;

/// Updates base rows in place.
///
/// Each source row holds the old column values, then the new ones, then
/// the location of the base row. Both halves have the columns of the read
/// map when one is given, else every column of the table. Check
/// constraints see unread columns as null.
pub struct UpdateResultSet {
    base: ResultSetBase,
    source: Box<dyn ResultSet>,
    changer: RowChanger,
    /// The source reads an index the update changes, so the rows to update
    /// are collected before the first one is changed.
    deferred: bool,
    holder: Option<RowHolderRef>,
    rows_updated: u64,
}

impl UpdateResultSet {
    /// `changed_cols` are the base columns the statement assigns.
    pub fn new(rsn: ResultSetNumber, source: Box<dyn ResultSet>, heap: ConglomId, changed_cols: &[u32]) -> Self {
        Self {
            base: ResultSetBase::new(rsn),
            source,
            changer: RowChanger::new(heap).with_changed_columns(changed_cols),
            deferred: false,
            holder: None,
            rows_updated: 0,
        }
    }

    pub fn with_read_map(mut self, cols: &[u32]) -> Self {
        self.changer = self.changer.with_read_map(cols);
        self
    }

    pub fn deferred(mut self) -> Self {
        self.deferred = true;
        self
    }

    pub fn with_lock_mode(mut self, lock: LockMode) -> Self {
        self.changer = self.changer.with_lock_mode(lock);
        self
    }

    /// Buffers the moved unique index entries in a holder the caller keeps.
    pub fn with_row_holder(mut self, holder: RowHolderRef) -> Self {
        self.changer = self.changer.with_row_holder(holder);
        self
    }

    pub fn rows_updated(&self) -> u64 {
        self.rows_updated
    }

    fn update_rows(&mut self, cx: &mut Activation<'_>, checks: &CheckConstraints) -> Result<()> {
        if !self.deferred {
            while let Some(row) = self.source.next_row_core(cx)? {
                cx.check_cancel()?;
                update_one(cx, &mut self.changer, checks, row)?;
                self.rows_updated += 1;
            }
            return Ok(());
        }
        let holder = TemporaryRowHolder::for_activation(cx).into_ref();
        self.holder = Some(Rc::clone(&holder));
        while let Some(row) = self.source.next_row_core(cx)? {
            cx.check_cancel()?;
            holder.borrow_mut().insert(cx, row)?;
        }
        let changer = &mut self.changer;
        let mut updated = 0;
        for_each_held(cx, &holder, self.base.rsn, |cx, row| {
            update_one(cx, changer, checks, row)?;
            updated += 1;
            Ok(())
        })?;
        self.rows_updated += updated;
        Ok(())
    }
}

fn update_one(cx: &mut Activation<'_>, changer: &mut RowChanger, checks: &CheckConstraints, row: Row) -> Result<()> {
    let (mut old, loc) = split_location(row)?;
    let width = changer.row_width();
    if old.len() != 2 * width {
        return Err(ExecError::internal(format!(
            "update source row has {} columns, expected {}",
            old.len(),
            2 * width
        )));
    }
    let new = Row::new(old.elements.split_off(width));
    let culprits = checks.evaluate(cx, &changer.base_row(&new))?;
    changer.update_row(cx, &old, &new, loc)?;
    checks.remember(cx, &culprits, loc);
    Ok(())
}

impl ResultSet for UpdateResultSet {
    fn kind(&self) -> &'static str {
        "update"
    }

    fn base(&self) -> &ResultSetBase {
        &self.base
    }

    fn open_core(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let start = self.base.start_timer(cx);
        cx.check_statement_valid()?;
        self.rows_updated = 0;
        self.source.open_core(cx)?;
        self.changer.open(cx)?;
        let checks = CheckConstraints::load(cx, self.changer.heap());
        self.update_rows(cx, &checks)?;
        // Unique index entries moved by the update go in last.
        self.changer.finish(cx)?;
        log::debug!(
            "UPDATE: table = {}, rows = {}",
            cx.catalog().table_name(self.changer.heap()),
            self.rows_updated
        );
        self.base.mark_open();
        self.base.stop_timer(start, Phase::Open);
        Ok(())
    }

    fn next_row_core(&mut self, cx: &mut Activation<'_>) -> Result<Option<Row>> {
        self.base.check_open("next_row")?;
        Ok(self.base.produced(cx, None))
    }

    fn close(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let start = self.base.start_timer(cx);
        let changer = self.changer.close(cx);
        let holder = match self.holder.take() {
            Some(holder) => holder.borrow_mut().close(cx),
            None => Ok(()),
        };
        let source = self.source.close(cx);
        self.base.mark_closed(cx);
        self.base.stop_timer(start, Phase::Close);
        changer.and(holder).and(source)
    }

    fn finish(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        self.source.finish(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConstraintViolation;
    use crate::result_set::TopResultSet;
    use crate::scan::{ScanParams, TableScanResultSet};
    use crate::testing::TestDb;
    use crate::values::RowResultSet;
    use pretty_assertions::assert_eq;
    use quarry_lib::{row, Value};

    /// The rows of `heap`, each followed by its location.
    fn located(db: &mut TestDb, heap: ConglomId) -> Vec<Row> {
        let scan = TableScanResultSet::new(ResultSetNumber(9), ScanParams::new(heap).with_location());
        let mut cx = db.activation();
        TopResultSet::new(Box::new(scan)).collect(&mut cx).unwrap()
    }

    fn update(db: &mut TestDb, rs: UpdateResultSet) -> Result<u64> {
        let mut rs = rs;
        let mut cx = db.activation();
        let res = rs.open_core(&mut cx);
        let n = rs.rows_updated();
        rs.close(&mut cx)?;
        res.map(|()| n)
    }

    /// Source rows setting column 1 of each located row with `f`.
    fn assign(rows: Vec<Row>, f: impl Fn(&Value) -> Value) -> Box<dyn ResultSet> {
        let rows = rows
            .into_iter()
            .map(|r| Row::new(vec![r[0].clone(), r[1].clone(), r[0].clone(), f(&r[1]), r[2].clone()]))
            .collect();
        Box::new(RowResultSet::constant(ResultSetNumber(1), rows))
    }

    #[test]
    fn swapping_unique_values_succeeds() {
        let mut db = TestDb::new();
        let heap = db.table("T", 2, &[row![1, "a"], row![2, "b"]]);
        let (_, index) = db
            .catalog
            .add_unique(&mut db.store, heap, "T_UQ", &[1], false, false, false)
            .unwrap();
        let rows = located(&mut db, heap);
        let swap = |v: &Value| if *v == Value::from("a") { Value::from("b") } else { Value::from("a") };
        let n = update(&mut db, UpdateResultSet::new(ResultSetNumber(0), assign(rows, swap), heap, &[1])).unwrap();
        assert_eq!(n, 2);
        assert_eq!(db.sorted_rows(heap), vec![row![1, "b"], row![2, "a"]]);
        assert_eq!(db.rows(index).len(), 2);

        // A real collision is still caught when the entries go in.
        let rows = located(&mut db, heap);
        let err = update(
            &mut db,
            UpdateResultSet::new(ResultSetNumber(0), assign(rows, |_| Value::from("z")), heap, &[1]),
        )
        .unwrap_err();
        assert!(matches!(err, ExecError::Constraint(ConstraintViolation::DuplicateKey { .. })));
    }

    #[test]
    fn partial_rows_write_only_assigned_columns() {
        let mut db = TestDb::new();
        let heap = db.table("T", 3, &[row![1, "keep", 10], row![2, "keep", 20]]);
        let on_b = db.index(heap, "T_B", &[1], false);
        let on_c = db.index(heap, "T_C", &[2], false);
        let rows: Vec<Row> = located(&mut db, heap)
            .into_iter()
            .filter(|r| r[0] == Value::from(1))
            .map(|r| Row::new(vec![r[0].clone(), r[2].clone(), r[0].clone(), Value::from(11), r[3].clone()]))
            .collect();
        let source = Box::new(RowResultSet::constant(ResultSetNumber(1), rows));
        let rs = UpdateResultSet::new(ResultSetNumber(0), source, heap, &[2]).with_read_map(&[0, 2]);
        db.store.reset_counters();
        assert_eq!(update(&mut db, rs).unwrap(), 1);
        assert_eq!(db.sorted_rows(heap), vec![row![1, "keep", 11], row![2, "keep", 20]]);
        let keys: Vec<Value> = db.rows(on_c).into_iter().map(|r| r[0].clone()).collect();
        assert_eq!(keys, vec![Value::from(11), Value::from(20)]);
        assert_eq!(db.rows(on_b).len(), 2);
        // Only the index on the assigned column was scanned.
        assert_eq!(db.store.counters().scans_opened, 1);
    }

    #[test]
    fn deferred_unique_duplicates_are_remembered() {
        let mut db = TestDb::new();
        let heap = db.table("T", 2, &[row![1, "a"], row![2, "b"]]);
        let (_, index) = db
            .catalog
            .add_unique(&mut db.store, heap, "T_UQ", &[1], false, true, true)
            .unwrap();
        let rows = located(&mut db, heap);
        let rs = UpdateResultSet::new(ResultSetNumber(0), assign(rows, |_| Value::from("z")), heap, &[1]).deferred();
        assert_eq!(update(&mut db, rs).unwrap(), 2);
        assert_eq!(db.rows(index).len(), 2);
        assert!(db.session.deferred_memory().get(index).is_some());
    }

    #[test]
    fn moved_unique_entries_spill_into_the_row_holder() {
        let mut db = TestDb::new();
        let heap = db.table("T", 2, &[row![1, 10], row![2, 20], row![3, 30]]);
        let (_, index) = db
            .catalog
            .add_unique(&mut db.store, heap, "T_UQ", &[1], false, false, false)
            .unwrap();
        let rows = located(&mut db, heap);
        // Every row takes the key of the next one.
        let rotate = |v: &Value| match v.as_i64().copied() {
            Some(30) => Value::from(10),
            Some(k) => Value::from(k + 10),
            None => Value::Null,
        };
        let holder = TemporaryRowHolder::new(1).into_ref();
        db.store.reset_counters();
        let rs = UpdateResultSet::new(ResultSetNumber(0), assign(rows, rotate), heap, &[1])
            .with_row_holder(Rc::clone(&holder));
        assert_eq!(update(&mut db, rs).unwrap(), 3);
        assert_eq!(db.sorted_rows(heap), vec![row![1, 20], row![2, 30], row![3, 10]]);
        assert_eq!(db.rows(index).len(), 3);

        // Two of the three entries spilled, into one temporary heap dropped by finish.
        let counters = db.store.counters();
        assert_eq!(counters.temp_conglomerates_created, 1);
        assert_eq!(counters.conglomerates_dropped, 1);
        assert!(holder.borrow().is_empty());
    }
}
