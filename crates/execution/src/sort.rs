//! `ORDER BY` and `DISTINCT`.

use quarry_datastore::{ScanController, SortSpec};
use quarry_lib::ordering::rows_identical;
use quarry_lib::{ColId, ColumnOrdering, ResultSetNumber, Row, SortId};

use crate::activation::Activation;
use crate::error::Result;
use crate::result_set::{Phase, ResultSet, ResultSetBase};

/// Sorts its source, optionally removing duplicate rows.
///
/// When the source is known to return rows in the required order and only
/// duplicates need removing, no sort is created and equal rows are
/// dropped as they stream by.
pub struct SortResultSet {
    base: ResultSetBase,
    source: Box<dyn ResultSet>,
    /// The sort key of the plan. Every sort gets its own copy.
    ordering: Vec<ColumnOrdering>,
    distinct: bool,
    in_order: bool,
    sort: Option<SortId>,
    scan: Option<Box<dyn ScanController>>,
    /// The last row returned by an in-order distinct.
    previous: Option<Row>,
    rows_input: u64,
}

impl SortResultSet {
    pub fn new(rsn: ResultSetNumber, source: Box<dyn ResultSet>, ordering: Vec<ColumnOrdering>) -> Self {
        Self {
            base: ResultSetBase::new(rsn),
            source,
            ordering,
            distinct: false,
            in_order: false,
            sort: None,
            scan: None,
            previous: None,
            rows_input: 0,
        }
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// The source already returns rows in order, so a distinct needs no sort.
    pub fn in_order(mut self) -> Self {
        self.in_order = true;
        self
    }

    /// Rows read from the source since the last open.
    pub fn rows_input(&self) -> u64 {
        self.rows_input
    }

    /// The key of the sort for rows `width` columns wide.
    ///
    /// A distinct sort compares whole rows, so the remaining columns follow
    /// the plan's key.
    fn sort_key(&self, width: usize) -> Vec<ColumnOrdering> {
        let mut key = self.ordering.clone();
        if self.distinct {
            let rest = (0..width as u32)
                .map(ColId)
                .filter(|col| !self.ordering.iter().any(|o| o.col == *col))
                .map(|col| ColumnOrdering { col, ascending: true });
            key.extend(rest);
        }
        key
    }

    fn load_sorter(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let mut loader = None;
        while let Some(row) = self.source.next_row_core(cx)? {
            cx.check_cancel()?;
            self.rows_input += 1;
            // The width of the rows is known once the first one is read.
            if loader.is_none() {
                let mut spec = SortSpec::new(self.sort_key(row.len()));
                if self.distinct {
                    spec = spec.distinct();
                }
                let sort = cx.tc().create_sort(spec)?;
                self.sort = Some(sort);
                loader = Some(cx.tc().open_sort(sort)?);
            }
            if let Some(sorter) = &mut loader {
                sorter.insert(row)?;
            }
        }
        self.source.close(cx)?;
        if let (Some(mut sorter), Some(sort)) = (loader, self.sort) {
            sorter.complete()?;
            log::debug!("SORT LOADED: rsn = {}, rows = {}", self.base.rsn, self.rows_input);
            self.scan = Some(cx.tc().open_sort_scan(sort)?);
        }
        Ok(())
    }

    fn drop_sort(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        if let Some(mut scan) = self.scan.take() {
            scan.close();
        }
        if let Some(sort) = self.sort.take() {
            cx.tc().drop_sort(sort)?;
        }
        Ok(())
    }
}

impl ResultSet for SortResultSet {
    fn kind(&self) -> &'static str {
        "sort"
    }

    fn base(&self) -> &ResultSetBase {
        &self.base
    }

    fn open_core(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let start = self.base.start_timer(cx);
        self.rows_input = 0;
        self.previous = None;
        self.source.open_core(cx)?;
        if !(self.in_order && self.distinct) {
            self.load_sorter(cx)?;
        }
        self.base.mark_open();
        self.base.stop_timer(start, Phase::Open);
        Ok(())
    }

    fn next_row_core(&mut self, cx: &mut Activation<'_>) -> Result<Option<Row>> {
        self.base.check_open("next_row")?;
        let start = self.base.start_timer(cx);
        let row = if self.in_order && self.distinct {
            let mut found = None;
            while let Some(row) = self.source.next_row_core(cx)? {
                self.rows_input += 1;
                if self.previous.as_ref().is_some_and(|p| rows_identical(p, &row)) {
                    continue;
                }
                self.previous = Some(row.clone());
                found = Some(row);
                break;
            }
            found
        } else {
            match &mut self.scan {
                Some(scan) => scan.next()?,
                None => None,
            }
        };
        let row = self.base.produced(cx, row);
        self.base.stop_timer(start, Phase::Next);
        Ok(row)
    }

    fn close(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let start = self.base.start_timer(cx);
        self.drop_sort(cx)?;
        self.previous = None;
        self.source.close(cx)?;
        self.base.mark_closed(cx);
        self.base.stop_timer(start, Phase::Close);
        Ok(())
    }

    fn finish(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        self.source.finish(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result_set::TopResultSet;
    use crate::testing::TestDb;
    use crate::values::RowResultSet;
    use pretty_assertions::assert_eq;
    use quarry_lib::{row, Value};

    fn source(rows: Vec<Row>) -> Box<dyn ResultSet> {
        Box::new(RowResultSet::constant(ResultSetNumber(0), rows))
    }

    #[test]
    fn sorts_on_mixed_directions() {
        let mut db = TestDb::new();
        let rows = vec![row![2, "b"], row![1, "z"], row![2, "a"], row![Value::Null, "n"]];
        let sort = SortResultSet::new(
            ResultSetNumber(1),
            source(rows),
            vec![ColumnOrdering::asc(0), ColumnOrdering::desc(1)],
        );
        let mut top = TopResultSet::new(Box::new(sort));
        let mut cx = db.activation();
        assert_eq!(
            top.collect(&mut cx).unwrap(),
            vec![row![1, "z"], row![2, "b"], row![2, "a"], row![Value::Null, "n"]]
        );
        // A second execution sorts with the same key.
        assert_eq!(top.collect(&mut cx).unwrap()[0], row![1, "z"]);
    }

    #[test]
    fn distinct_compares_whole_rows() {
        let mut db = TestDb::new();
        let rows = vec![row![1, "a"], row![1, "b"], row![1, "a"], row![0, "a"]];
        let sort = SortResultSet::new(ResultSetNumber(1), source(rows), vec![ColumnOrdering::asc(0)]).distinct();
        let mut top = TopResultSet::new(Box::new(sort));
        let mut cx = db.activation();
        assert_eq!(top.collect(&mut cx).unwrap(), vec![row![0, "a"], row![1, "a"], row![1, "b"]]);
    }

    #[test]
    fn in_order_distinct_needs_no_sort() {
        let mut db = TestDb::new();
        let rows = vec![row![1], row![1], row![2], row![3], row![3]];
        let sort = SortResultSet::new(ResultSetNumber(1), source(rows), vec![ColumnOrdering::asc(0)])
            .distinct()
            .in_order();
        let mut top = TopResultSet::new(Box::new(sort));
        db.store.reset_counters();
        let mut cx = db.activation();
        assert_eq!(top.collect(&mut cx).unwrap(), vec![row![1], row![2], row![3]]);
        drop(cx);
        assert_eq!(db.store.counters().sorts_created, 0);
    }

    #[test]
    fn empty_input_creates_no_sort() {
        let mut db = TestDb::new();
        let sort = SortResultSet::new(ResultSetNumber(1), source(vec![]), vec![ColumnOrdering::asc(0)]);
        let mut top = TopResultSet::new(Box::new(sort));
        let mut cx = db.activation();
        assert_eq!(top.collect(&mut cx).unwrap(), vec![]);
        top.close(&mut cx).unwrap();
        top.close(&mut cx).unwrap();
    }
}
