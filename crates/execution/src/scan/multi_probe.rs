use either::Either;
use itertools::Itertools;
use quarry_lib::{ResultSetNumber, Row, RowLocation, Value};

use super::{Positions, ScanCore, ScanParams};
use crate::activation::Activation;
use crate::error::{ExecError, Result};
use crate::result_set::{Phase, ResultSet, ResultSetBase};

/// How the probe values must be ordered before probing.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProbeOrder {
    /// The plan supplies them sorted already.
    Sorted,
    Ascending,
    Descending,
}

/// A keyed scan repeated once per distinct value of an `IN` list.
///
/// It is one logical scan: the row counters run on across the
/// repositionings of the store scan.
pub struct MultiProbeTableScanResultSet {
    base: ResultSetBase,
    core: ScanCore,
    orig_probe_values: Vec<Value>,
    order: ProbeOrder,
    /// The sorted, distinct probe values of the current open.
    probe_values: Vec<Value>,
    next_probe: usize,
    /// Set once the last probe value was scanned.
    skip_next_scan: bool,
    candidate: Option<Row>,
}

impl MultiProbeTableScanResultSet {
    /// Probes the first key column of the index scanned by `params`
    /// for each of `probe_values`. Start and stop positions of `params`
    /// are replaced by each probe value in turn.
    pub fn new(rsn: ResultSetNumber, params: ScanParams, probe_values: Vec<Value>, order: ProbeOrder) -> Self {
        Self {
            base: ResultSetBase::new(rsn),
            core: ScanCore::new(ScanParams {
                same_start_stop: true,
                ..params
            }),
            orig_probe_values: probe_values,
            order,
            probe_values: Vec::new(),
            next_probe: 0,
            skip_next_scan: false,
            candidate: None,
        }
    }

    /// The probe values in the order they are scanned.
    pub fn probe_values(&self) -> &[Value] {
        &self.probe_values
    }

    fn prepare_probe_values(&mut self) {
        let values = self.orig_probe_values.iter().cloned();
        let ordered = match self.order {
            ProbeOrder::Sorted => Either::Left(values),
            ProbeOrder::Ascending => Either::Right(values.sorted()),
            ProbeOrder::Descending => Either::Right(values.sorted_by(|a, b| b.cmp(a))),
        };
        self.probe_values = ordered.dedup().collect();
    }

    /// Positions the store scan on the next probe value, if any.
    fn next_probe_value(&mut self, cx: &mut Activation<'_>) -> Result<bool> {
        let Some(value) = self.probe_values.get(self.next_probe).cloned() else {
            self.skip_next_scan = true;
            return Ok(false);
        };
        self.next_probe += 1;
        log::trace!(
            "PROBING: conglomerate = {}, value = {value}, rows of last probe = {}",
            self.core.params.conglom,
            self.core.rows_this_scan
        );
        self.core.position_at(cx, Positions::with_probe(Row::new(vec![value])))?;
        Ok(true)
    }

    fn start(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        self.prepare_probe_values();
        self.next_probe = 0;
        self.skip_next_scan = false;
        self.candidate = None;
        self.next_probe_value(cx)?;
        Ok(())
    }
}

impl ResultSet for MultiProbeTableScanResultSet {
    fn kind(&self) -> &'static str {
        "multi-probe table scan"
    }

    fn base(&self) -> &ResultSetBase {
        &self.base
    }

    fn open_core(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let timer = self.base.start_timer(cx);
        self.start(cx)?;
        self.base.mark_open();
        self.base.stop_timer(timer, Phase::Open);
        Ok(())
    }

    fn reopen_core(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        if !self.base.is_open {
            return self.open_core(cx);
        }
        let timer = self.base.start_timer(cx);
        self.start(cx)?;
        self.base.mark_open();
        self.base.stop_timer(timer, Phase::Open);
        Ok(())
    }

    fn next_row_core(&mut self, cx: &mut Activation<'_>) -> Result<Option<Row>> {
        self.base.check_open("next_row")?;
        let timer = self.base.start_timer(cx);
        let mut row = None;
        while !self.skip_next_scan {
            if let Some((candidate, loc)) = self.core.next_candidate(cx, &mut self.base.stats)? {
                row = Some(self.core.output(&candidate, loc)?);
                self.candidate = Some(candidate);
                break;
            }
            if !self.next_probe_value(cx)? {
                break;
            }
        }
        if row.is_none() {
            self.candidate = None;
        }
        self.base.set_current_row(cx, row.as_ref());
        self.base.stop_timer(timer, Phase::Next);
        Ok(row)
    }

    fn close(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        self.core.close();
        self.candidate = None;
        self.base.mark_closed(cx);
        Ok(())
    }

    fn requires_relocking(&self) -> Result<bool> {
        Ok(self.core.requires_relocking())
    }

    fn row_location(&self) -> Result<RowLocation> {
        let candidate = self.candidate.as_ref().ok_or(ExecError::InvalidState("no current row"))?;
        self.core.base_location(candidate, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dml::DeleteResultSet;
    use crate::result_set::TopResultSet;
    use crate::testing::TestDb;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use quarry_lib::row;

    fn probe(db: &mut TestDb, values: Vec<Value>, order: ProbeOrder) -> (Vec<Row>, Vec<Value>) {
        let heap = db.table(
            "T",
            2,
            &[row![1, "a"], row![2, "b"], row![3, "c"], row![3, "cc"], row![5, "e"], row![Value::Null, "n"]],
        );
        let index = db.index(heap, "T_A", &[0], false);
        let params = ScanParams::new(index).columns(&[0]);
        let mut scan = MultiProbeTableScanResultSet::new(ResultSetNumber(0), params, values, order);
        let mut cx = db.activation();
        scan.open_core(&mut cx).unwrap();
        let mut rows = Vec::new();
        while let Some(row) = scan.next_row_core(&mut cx).unwrap() {
            rows.push(row);
        }
        assert_eq!(scan.next_row_core(&mut cx).unwrap(), None);
        (rows, scan.probe_values().to_vec())
    }

    #[test]
    fn duplicate_probe_values_are_collapsed() {
        let mut db = TestDb::new();
        let values = [5, 3, 3, 1].map(Value::from).to_vec();
        let (rows, probes) = probe(&mut db, values, ProbeOrder::Ascending);
        assert_eq!(probes, [1, 3, 5].map(Value::from).to_vec());
        assert_eq!(rows, vec![row![1], row![3], row![3], row![5]]);
    }

    #[test]
    fn descending_probes_and_null_probes() {
        let mut db = TestDb::new();
        let values = vec![Value::from(1), Value::Null, Value::from(5)];
        let (rows, probes) = probe(&mut db, values, ProbeOrder::Descending);
        assert_eq!(probes, vec![Value::Null, Value::from(5), Value::from(1)]);
        assert_eq!(rows, vec![row![5], row![1]]);
    }

    #[test]
    fn rows_seen_run_across_probes() {
        let mut db = TestDb::new();
        let heap = db.table("T", 1, &[row![1], row![2], row![3]]);
        let index = db.index(heap, "T_A", &[0], false);
        let scan = MultiProbeTableScanResultSet::new(
            ResultSetNumber(0),
            ScanParams::new(index),
            vec![Value::from(3), Value::from(1), Value::from(4)],
            ProbeOrder::Ascending,
        );
        let mut top = TopResultSet::new(Box::new(scan));
        let mut cx = db.activation();
        assert_eq!(top.collect(&mut cx).unwrap().len(), 2);
        assert_eq!(top.stats().rows_seen, 2);
        assert_eq!(top.collect(&mut cx).unwrap().len(), 2);
        assert_eq!(top.stats().rows_seen, 4);
    }

    #[test]
    fn located_probe_rows_feed_a_delete() {
        let mut db = TestDb::new();
        let heap = db.table("T", 2, &[row![1, "a"], row![2, "b"], row![3, "c"], row![3, "cc"]]);
        let index = db.index(heap, "T_A", &[0], false);
        // DELETE FROM t WHERE a IN (3, 1)
        let scan = MultiProbeTableScanResultSet::new(
            ResultSetNumber(1),
            ScanParams::new(index).columns(&[0]).with_location().for_update(),
            vec![Value::from(3), Value::from(1)],
            ProbeOrder::Ascending,
        );
        // The scan reads the index the delete changes.
        let delete = DeleteResultSet::new(ResultSetNumber(0), Box::new(scan), heap).deferred();
        let mut top = TopResultSet::new(Box::new(delete));
        let mut cx = db.activation();
        top.collect(&mut cx).unwrap();
        top.close(&mut cx).unwrap();
        drop(cx);
        assert_eq!(db.sorted_rows(heap), vec![row![2, "b"]]);
        assert_eq!(db.rows(index).len(), 1);
    }

    proptest! {
        #[test]
        fn matches_are_the_union_of_the_probes(values in prop::collection::vec(0i64..8, 0..12)) {
            let mut db = TestDb::new();
            let heap = db.table("T", 1, &(0..8).map(|i| row![i as i64]).collect::<Vec<_>>());
            let index = db.index(heap, "T_A", &[0], false);
            let probes: Vec<Value> = values.iter().copied().map(Value::from).collect();
            let scan = MultiProbeTableScanResultSet::new(
                ResultSetNumber(0),
                ScanParams::new(index).columns(&[0]),
                probes,
                ProbeOrder::Ascending,
            );
            let mut top = TopResultSet::new(Box::new(scan));
            let mut cx = db.activation();
            let rows = top.collect(&mut cx).unwrap();
            let mut expected = values.clone();
            expected.sort_unstable();
            expected.dedup();
            prop_assert_eq!(rows, expected.into_iter().map(|v| row![v]).collect::<Vec<_>>());
        }
    }
}
