use std::cell::RefCell;
use std::rc::Rc;

use pretty_assertions::assert_eq;
use quarry_execution::dml::{DeleteResultSet, TriggerActivator, TriggerTiming, UpdateResultSet};
use quarry_execution::project_restrict::{ProjectRestrictResultSet, Projection};
use quarry_execution::row_count::RowCountResultSet;
use quarry_execution::scan::{
    IndexRowToBaseRowResultSet, MultiProbeTableScanResultSet, ProbeOrder, ScanParams, TableScanResultSet,
};
use quarry_execution::scroll::ScrollInsensitiveResultSet;
use quarry_execution::sort::SortResultSet;
use quarry_execution::testing::TestDb;
use quarry_execution::{Activation, ExecConfig, ResultSet, TopResultSet};
use quarry_expr::Expr;
use quarry_lib::{row, ColumnOrdering, ConglomId, OpMath, ResultSetNumber, Row, Value};

/// `(id, dept, salary)`, with an index on `dept` and one on `salary`.
fn emp(db: &mut TestDb) -> (ConglomId, ConglomId, ConglomId) {
    let heap = db.table(
        "EMP",
        3,
        &[
            row![1, 10, 100],
            row![2, 20, 200],
            row![3, 30, 300],
            row![4, 10, 400],
            row![5, 30, 500],
            row![6, 20, 600],
            row![7, 10, 700],
            row![8, Value::Null, 800],
        ],
    );
    let by_dept = db.index(heap, "EMP_DEPT", &[1], false);
    let by_salary = db.index(heap, "EMP_SALARY", &[2], false);
    (heap, by_dept, by_salary)
}

#[test]
fn probe_fetch_sort_and_page() {
    let mut db = TestDb::new();
    let (heap, by_dept, _) = emp(&mut db);

    // WHERE dept IN (30, 10, 10) ORDER BY salary DESC OFFSET 1 ROWS FETCH FIRST 2 ROWS ONLY
    let probe = MultiProbeTableScanResultSet::new(
        ResultSetNumber(5),
        ScanParams::new(by_dept),
        vec![Value::from(30), Value::from(10), Value::from(10)],
        ProbeOrder::Ascending,
    );
    let fetch = IndexRowToBaseRowResultSet::new(ResultSetNumber(4), Box::new(probe), heap, &[1], &[0, 1, 2]);
    let sort = SortResultSet::new(ResultSetNumber(3), Box::new(fetch), vec![ColumnOrdering::desc(2)]);
    let page = RowCountResultSet::new(
        ResultSetNumber(2),
        Box::new(sort),
        Some(Expr::val(1)),
        Some(Expr::val(2)),
        false,
    );
    let scroll = ScrollInsensitiveResultSet::new(ResultSetNumber(1), Box::new(page));
    let mut top = TopResultSet::new(Box::new(scroll));

    let mut cx = db.activation();
    assert_eq!(top.collect(&mut cx).unwrap(), vec![row![5, 30, 500], row![4, 10, 400]]);
    let cursor = top.scroll().unwrap();
    assert_eq!(cursor.first(&mut cx).unwrap(), Some(row![5, 30, 500]));
    assert!(!cursor.is_last(&mut cx).unwrap());
    assert_eq!(cursor.last(&mut cx).unwrap(), Some(row![4, 10, 400]));
    top.close(&mut cx).unwrap();
}

#[derive(Clone, Default)]
struct CountRows(Rc<RefCell<Vec<(TriggerTiming, usize)>>>);

impl TriggerActivator for CountRows {
    fn fire(
        &mut self,
        cx: &mut Activation<'_>,
        timing: TriggerTiming,
        rows: &mut dyn ResultSet,
    ) -> quarry_execution::Result<()> {
        let mut n = 0;
        while rows.next_row_core(cx)?.is_some() {
            n += 1;
        }
        self.0.borrow_mut().push((timing, n));
        Ok(())
    }
}

#[test]
fn deferred_delete_spills_to_one_temporary_heap() {
    let mut db = TestDb::with_config(ExecConfig {
        temp_row_holder_threshold: 2,
        ..ExecConfig::default()
    });
    let (heap, by_dept, by_salary) = emp(&mut db);
    db.store.reset_counters();

    let triggers = CountRows::default();
    let source = TableScanResultSet::new(ResultSetNumber(1), ScanParams::new(heap).with_location());
    let delete = DeleteResultSet::new(ResultSetNumber(0), Box::new(source), heap)
        .deferred()
        .with_triggers(Box::new(triggers.clone()));
    let mut top = TopResultSet::new(Box::new(delete));
    let mut cx = db.activation();
    top.collect(&mut cx).unwrap();
    top.close(&mut cx).unwrap();
    drop(cx);

    assert_eq!(
        *triggers.0.borrow(),
        vec![(TriggerTiming::Before, 8), (TriggerTiming::After, 8)]
    );
    assert!(db.rows(heap).is_empty());
    assert!(db.rows(by_dept).is_empty());
    assert!(db.rows(by_salary).is_empty());
    let counters = db.store.counters();
    assert_eq!(counters.temp_conglomerates_created, 1);
    assert_eq!(counters.conglomerates_dropped, 1);
}

#[test]
fn deferred_update_through_the_changed_index_updates_each_row_once() {
    let mut db = TestDb::new();
    let (heap, _, by_salary) = emp(&mut db);

    // UPDATE emp SET salary = salary + 1000, reading the salary index: old, new, location.
    let scan = TableScanResultSet::new(ResultSetNumber(2), ScanParams::new(by_salary).for_update());
    let raise = Projection::Exprs(vec![
        Expr::col(0),
        Expr::math(OpMath::Add, Expr::col(0), Expr::val(1000)),
        Expr::col(1),
    ]);
    let source = ProjectRestrictResultSet::new(ResultSetNumber(1), Box::new(scan)).with_projection(raise);
    let update = UpdateResultSet::new(ResultSetNumber(0), Box::new(source), heap, &[2])
        .with_read_map(&[2])
        .deferred();
    let mut top = TopResultSet::new(Box::new(update));
    let mut cx = db.activation();
    top.collect(&mut cx).unwrap();
    top.close(&mut cx).unwrap();
    drop(cx);

    let salaries: Vec<Value> = db.sorted_rows(heap).into_iter().map(|r| r[2].clone()).collect();
    let expected: Vec<Value> = (1..=8).map(|i| Value::from(i * 100 + 1000)).collect();
    assert_eq!(salaries, expected);
    let keys: Vec<Row> = db.rows(by_salary).into_iter().map(|r| Row::new(vec![r[0].clone()])).collect();
    assert_eq!(keys, (1..=8).map(|i| row![i * 100 + 1000]).collect::<Vec<_>>());
}
