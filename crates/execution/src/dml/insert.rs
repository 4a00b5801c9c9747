use std::rc::Rc;

use quarry_datastore::LockMode;
use quarry_lib::{ConglomId, ResultSetNumber, Row};

use crate::activation::{Activation, RowHolderRef};
use crate::dml::constraints::CheckConstraints;
use crate::dml::for_each_held;
use crate::dml::row_changer::RowChanger;
use crate::error::Result;
use crate::result_set::{Phase, ResultSet, ResultSetBase};
use crate::temp_holder::TemporaryRowHolder;

/// Inserts every source row into a table and its indexes.
///
/// When the source reads the target table, its rows are collected first so
/// that the rows inserted are not read back.
pub struct InsertResultSet {
    base: ResultSetBase,
    source: Box<dyn ResultSet>,
    changer: RowChanger,
    deferred: bool,
    holder: Option<RowHolderRef>,
    rows_inserted: u64,
}

impl InsertResultSet {
    pub fn new(rsn: ResultSetNumber, source: Box<dyn ResultSet>, heap: ConglomId) -> Self {
        Self {
            base: ResultSetBase::new(rsn),
            source,
            changer: RowChanger::new(heap),
            deferred: false,
            holder: None,
            rows_inserted: 0,
        }
    }

    pub fn deferred(mut self) -> Self {
        self.deferred = true;
        self
    }

    pub fn with_lock_mode(mut self, lock: LockMode) -> Self {
        self.changer = self.changer.with_lock_mode(lock);
        self
    }

    pub fn rows_inserted(&self) -> u64 {
        self.rows_inserted
    }

    fn insert_rows(&mut self, cx: &mut Activation<'_>, checks: &CheckConstraints) -> Result<()> {
        if !self.deferred {
            while let Some(row) = self.source.next_row_core(cx)? {
                cx.check_cancel()?;
                insert_one(cx, &mut self.changer, checks, &row)?;
                self.rows_inserted += 1;
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
        let mut inserted = 0;
        for_each_held(cx, &holder, self.base.rsn, |cx, row| {
            insert_one(cx, changer, checks, &row)?;
            inserted += 1;
            Ok(())
        })?;
        self.rows_inserted += inserted;
        Ok(())
    }
}

fn insert_one(cx: &mut Activation<'_>, changer: &mut RowChanger, checks: &CheckConstraints, row: &Row) -> Result<()> {
    let culprits = checks.evaluate(cx, row)?;
    let loc = changer.insert_row(cx, row)?;
    checks.remember(cx, &culprits, loc);
    Ok(())
}

impl ResultSet for InsertResultSet {
    fn kind(&self) -> &'static str {
        "insert"
    }

    fn base(&self) -> &ResultSetBase {
        &self.base
    }

    fn open_core(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let start = self.base.start_timer(cx);
        cx.check_statement_valid()?;
        self.rows_inserted = 0;
        self.source.open_core(cx)?;
        self.changer.open(cx)?;
        let checks = CheckConstraints::load(cx, self.changer.heap());
        self.insert_rows(cx, &checks)?;
        self.changer.finish(cx)?;
        log::debug!(
            "INSERT: table = {}, rows = {}",
            cx.catalog().table_name(self.changer.heap()),
            self.rows_inserted
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
    use crate::error::{ConstraintViolation, ExecError};
    use crate::scan::{ScanParams, TableScanResultSet};
    use crate::testing::TestDb;
    use crate::values::RowResultSet;
    use pretty_assertions::assert_eq;
    use quarry_expr::Expr;
    use quarry_lib::{row, OpCmp, Value};

    fn insert(db: &mut TestDb, heap: ConglomId, source: Box<dyn ResultSet>, deferred: bool) -> Result<u64> {
        let mut rs = InsertResultSet::new(ResultSetNumber(0), source, heap);
        if deferred {
            rs = rs.deferred();
        }
        let mut cx = db.activation();
        let res = rs.open_core(&mut cx);
        let n = rs.rows_inserted();
        rs.close(&mut cx)?;
        res.map(|()| n)
    }

    fn values(rows: Vec<Row>) -> Box<dyn ResultSet> {
        Box::new(RowResultSet::constant(ResultSetNumber(1), rows))
    }

    #[test]
    fn inserts_into_heap_and_indexes() {
        let mut db = TestDb::new();
        let heap = db.table("T", 2, &[]);
        let index = db.index(heap, "T_B", &[1], false);
        assert_eq!(insert(&mut db, heap, values(vec![row![1, "x"], row![2, "y"]]), false).unwrap(), 2);
        assert_eq!(db.sorted_rows(heap), vec![row![1, "x"], row![2, "y"]]);
        let entries = db.rows(index);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0][0], Value::from("x"));
    }

    #[test]
    fn duplicate_keys_name_the_constraint() {
        let mut db = TestDb::new();
        let heap = db.table("T", 1, &[row![1]]);
        db.catalog
            .add_unique(&mut db.store, heap, "T_UQ", &[0], false, false, false)
            .unwrap();
        let err = insert(&mut db, heap, values(vec![row![2], row![1]]), false).unwrap_err();
        assert!(matches!(
            err,
            ExecError::Constraint(ConstraintViolation::DuplicateKey { ref constraint, ref table })
                if constraint == "T_UQ" && table == "T"
        ));
        // Nulls never collide.
        let heap = db.table("N", 1, &[]);
        db.index(heap, "N_UQ", &[0], true);
        assert_eq!(insert(&mut db, heap, values(vec![row![Value::Null], row![Value::Null]]), false).unwrap(), 2);
    }

    #[test]
    fn check_constraints_are_enforced_or_remembered() {
        let mut db = TestDb::new();
        let heap = db.table("T", 1, &[]);
        let positive = Expr::cmp(OpCmp::Gt, Expr::col(0), Expr::val(0));
        let id = db.catalog.add_check(heap, "T_POS", positive, true, false);
        let err = insert(&mut db, heap, values(vec![row![1], row![-1]]), false).unwrap_err();
        assert!(matches!(err, ExecError::Constraint(ConstraintViolation::CheckViolation { .. })));

        // Unknown satisfies the check.
        assert_eq!(insert(&mut db, heap, values(vec![row![Value::Null]]), false).unwrap(), 1);

        db.session.set_constraints_deferred(&[id], true).unwrap();
        assert_eq!(insert(&mut db, heap, values(vec![row![-5]]), false).unwrap(), 1);
        assert!(db.session.deferred_memory().get(heap).is_some());
    }

    #[test]
    fn deferred_insert_does_not_read_its_own_rows() {
        let mut db = TestDb::new();
        let heap = db.table("T", 1, &[row![1], row![2]]);
        let source = Box::new(TableScanResultSet::new(ResultSetNumber(1), ScanParams::new(heap)));
        assert_eq!(insert(&mut db, heap, source, true).unwrap(), 2);
        assert_eq!(db.sorted_rows(heap), vec![row![1], row![1], row![2], row![2]]);
    }
}
