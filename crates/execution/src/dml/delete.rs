use std::rc::Rc;

use quarry_datastore::LockMode;
use quarry_lib::{ConglomId, ResultSetNumber, Row};

use crate::activation::{Activation, RowHolderRef};
use crate::dml::constraints::ReferencedKeyChecker;
use crate::dml::row_changer::RowChanger;
use crate::dml::{fire_triggers, for_each_held, split_location, TriggerActivator, TriggerTiming};
use crate::error::Result;
use crate::result_set::{Phase, ResultSet, ResultSetBase};
use crate::temp_holder::TemporaryRowHolder;

/// Deletes the base rows located by the last column of its source rows.
///
/// Rows are deleted as they are read unless the statement is deferred, the
/// table is referenced by a foreign key or it has triggers. Then all source
/// rows are first collected in a temporary row holder, just their
/// locations when nothing else needs the rows, and deleted in a second pass:
///
/// 1. `ON DELETE RESTRICT` foreign keys are checked for every row,
/// 2. the before triggers fire,
/// 3. each row is fetched again by location and deleted,
/// 4. all foreign keys are checked for every row,
/// 5. deferred index inserts are flushed,
/// 6. the after triggers fire.
pub struct DeleteResultSet {
    base: ResultSetBase,
    source: Box<dyn ResultSet>,
    changer: RowChanger,
    /// The source reads the table being deleted from.
    deferred: bool,
    triggers: Option<Box<dyn TriggerActivator>>,
    /// Publishes the collected rows to dependent statements under this id.
    dependent_id: Option<String>,
    holder: Option<RowHolderRef>,
    rows_deleted: u64,
}

impl DeleteResultSet {
    pub fn new(rsn: ResultSetNumber, source: Box<dyn ResultSet>, heap: ConglomId) -> Self {
        Self {
            base: ResultSetBase::new(rsn),
            source,
            changer: RowChanger::new(heap),
            deferred: false,
            triggers: None,
            dependent_id: None,
            holder: None,
            rows_deleted: 0,
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

    pub fn with_triggers(mut self, triggers: Box<dyn TriggerActivator>) -> Self {
        self.triggers = Some(triggers);
        self
    }

    pub fn with_dependent_id(mut self, id: impl Into<String>) -> Self {
        self.dependent_id = Some(id.into());
        self
    }

    pub fn rows_deleted(&self) -> u64 {
        self.rows_deleted
    }

    fn delete_as_read(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        while let Some(row) = self.source.next_row_core(cx)? {
            cx.check_cancel()?;
            let (base, loc) = split_location(row)?;
            self.changer.delete_row(cx, &base, loc)?;
            self.rows_deleted += 1;
        }
        self.changer.finish(cx)
    }

    fn delete_deferred(&mut self, cx: &mut Activation<'_>, fks: &ReferencedKeyChecker) -> Result<()> {
        let holder = TemporaryRowHolder::for_activation(cx).unique_stream().into_ref();
        self.holder = Some(Rc::clone(&holder));
        // Triggers and foreign keys look at the deleted rows; otherwise the
        // location is enough to fetch each row again.
        let keep_rows = self.triggers.is_some() || !fks.is_empty();
        while let Some(row) = self.source.next_row_core(cx)? {
            cx.check_cancel()?;
            let row = if keep_rows {
                row
            } else {
                let (_, loc) = split_location(row)?;
                Row::default().with_location(loc)
            };
            holder.borrow_mut().insert(cx, row)?;
        }
        if let Some(id) = &self.dependent_id {
            cx.set_parent_result_set(id.clone(), Rc::clone(&holder));
        }
        let rsn = self.base.rsn;

        if !fks.is_empty() {
            for_each_held(cx, &holder, rsn, |cx, row| {
                let (base, _) = split_location(row)?;
                fks.check(cx, &base, true)
            })?;
        }
        fire_triggers(cx, &mut self.triggers, TriggerTiming::Before, &holder, rsn)?;

        let changer = &mut self.changer;
        let mut deleted = 0;
        for_each_held(cx, &holder, rsn, |cx, row| {
            let (_, loc) = split_location(row)?;
            // Gone already when two source rows led to the same base row.
            let Some(current) = changer.fetch(loc)? else {
                return Ok(());
            };
            changer.delete_row(cx, &current, loc)?;
            deleted += 1;
            Ok(())
        })?;
        self.rows_deleted += deleted;

        if !fks.is_empty() {
            for_each_held(cx, &holder, rsn, |cx, row| {
                let (base, _) = split_location(row)?;
                fks.check(cx, &base, false)
            })?;
        }
        self.changer.finish(cx)?;
        fire_triggers(cx, &mut self.triggers, TriggerTiming::After, &holder, rsn)
    }
}

impl ResultSet for DeleteResultSet {
    fn kind(&self) -> &'static str {
        "delete"
    }

    fn base(&self) -> &ResultSetBase {
        &self.base
    }

    fn open_core(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let start = self.base.start_timer(cx);
        cx.check_statement_valid()?;
        self.rows_deleted = 0;
        self.source.open_core(cx)?;
        self.changer.open(cx)?;
        let fks = ReferencedKeyChecker::load(cx, self.changer.heap())?;
        if self.deferred || self.triggers.is_some() || !fks.is_empty() {
            self.delete_deferred(cx, &fks)?;
        } else {
            self.delete_as_read(cx)?;
        }
        log::debug!(
            "DELETE: table = {}, rows = {}",
            cx.catalog().table_name(self.changer.heap()),
            self.rows_deleted
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
    use crate::catalog::ReferentialAction;
    use crate::error::{ConstraintViolation, ExecError};
    use crate::scan::{ScanParams, TableScanResultSet};
    use crate::testing::TestDb;
    use pretty_assertions::assert_eq;
    use quarry_lib::row;
    use std::cell::RefCell;

    /// Scans `heap` with the row location appended, as a delete source wants it.
    fn target(heap: ConglomId) -> Box<dyn ResultSet> {
        Box::new(TableScanResultSet::new(ResultSetNumber(1), ScanParams::new(heap).with_location()))
    }

    fn run(db: &mut TestDb, rs: DeleteResultSet) -> Result<u64> {
        let mut rs = rs;
        let mut cx = db.activation();
        let res = rs.open_core(&mut cx);
        let deleted = rs.rows_deleted();
        rs.close(&mut cx)?;
        res.map(|()| deleted)
    }

    #[test]
    fn deletes_rows_and_index_entries() {
        let mut db = TestDb::new();
        let heap = db.table("T", 2, &[row![1, "a"], row![2, "b"], row![3, "c"]]);
        let index = db.index(heap, "T_A", &[0], true);
        let source = crate::project_restrict::ProjectRestrictResultSet::new(ResultSetNumber(2), target(heap))
            .with_restriction(quarry_expr::Expr::cmp(
                quarry_lib::OpCmp::NotEq,
                quarry_expr::Expr::col(0),
                quarry_expr::Expr::val(2),
            ));
        let deleted = run(&mut db, DeleteResultSet::new(ResultSetNumber(0), Box::new(source), heap)).unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(db.rows(heap), vec![row![2, "b"]]);
        assert_eq!(db.rows(index).len(), 1);
    }

    #[derive(Clone, Default)]
    struct Recorder(Rc<RefCell<Vec<String>>>);

    impl TriggerActivator for Recorder {
        fn fire(&mut self, cx: &mut Activation<'_>, timing: TriggerTiming, rows: &mut dyn ResultSet) -> Result<()> {
            let mut n = 0;
            while rows.next_row_core(cx)?.is_some() {
                n += 1;
            }
            self.0.borrow_mut().push(format!("{timing:?} {n}"));
            Ok(())
        }
    }

    #[test]
    fn triggers_fire_around_the_deletes() {
        let mut db = TestDb::new();
        let heap = db.table("T", 1, &[row![1], row![2]]);
        let recorder = Recorder::default();
        let rs = DeleteResultSet::new(ResultSetNumber(0), target(heap), heap)
            .with_triggers(Box::new(recorder.clone()))
            .with_dependent_id("T_DEL");
        assert_eq!(run(&mut db, rs).unwrap(), 2);
        assert_eq!(*recorder.0.borrow(), vec!["Before 2", "After 2"]);
        assert!(db.rows(heap).is_empty());
    }

    fn parent_child(db: &mut TestDb, on_delete: ReferentialAction, deferrable: bool) -> (ConglomId, ConglomId) {
        let parent = db.table("P", 1, &[row![1], row![2]]);
        let child = db.table("C", 2, &[row![10, 1]]);
        let (_, pk) = db
            .catalog
            .add_unique(&mut db.store, parent, "P_PK", &[0], true, false, false)
            .unwrap();
        db.catalog
            .add_foreign_key(&mut db.store, child, "C_FK", &[1], pk, on_delete, deferrable, deferrable)
            .unwrap();
        (parent, child)
    }

    #[test]
    fn referenced_rows_are_not_deleted() {
        for on_delete in [ReferentialAction::Restrict, ReferentialAction::NoAction] {
            let mut db = TestDb::new();
            let (parent, _) = parent_child(&mut db, on_delete, false);
            let err = run(&mut db, DeleteResultSet::new(ResultSetNumber(0), target(parent), parent)).unwrap_err();
            let ExecError::Constraint(ConstraintViolation::ForeignKeyRestrict { constraint, table }) = err else {
                panic!("unexpected error {err}");
            };
            assert_eq!((constraint.as_str(), table.as_str()), ("C_FK", "P"));
            if on_delete == ReferentialAction::Restrict {
                // Nothing was deleted before the check.
                assert_eq!(db.rows(parent).len(), 2);
            }
        }
    }

    #[test]
    fn deferred_foreign_keys_are_remembered() {
        let mut db = TestDb::new();
        let (parent, _) = parent_child(&mut db, ReferentialAction::NoAction, true);
        let deleted = run(&mut db, DeleteResultSet::new(ResultSetNumber(0), target(parent), parent)).unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(db.session.deferred_memory().len(), 1);
    }

    #[test]
    fn self_referencing_deletes_hold_only_locations() {
        let mut db = TestDb::new();
        let heap = db.table("T", 2, &[row![1, "a"], row![2, "b"]]);
        let mut rs = DeleteResultSet::new(ResultSetNumber(0), target(heap), heap).deferred();
        let mut cx = db.activation();
        rs.open_core(&mut cx).unwrap();
        let holder = rs.holder.clone().unwrap();
        let mut held = Vec::new();
        holder
            .borrow_mut()
            .for_each_row(&mut cx, |_, row| {
                held.push(row);
                Ok(())
            })
            .unwrap();
        assert_eq!(held.len(), 2);
        assert!(held.iter().all(|r| r.len() == 1 && r.row_location().is_some()));
        rs.close(&mut cx).unwrap();
        drop(cx);
        assert!(db.rows(heap).is_empty());
    }
}
