//! Operators reading conglomerates through store scans.

mod bulk;
mod hash_scan;
mod index_to_base_row;
mod multi_probe;
mod table_scan;
mod validate_check;

use core::ops::Bound;

pub use bulk::BulkTableScanResultSet;
pub use hash_scan::HashScanResultSet;
pub use index_to_base_row::IndexRowToBaseRowResultSet;
pub use multi_probe::{MultiProbeTableScanResultSet, ProbeOrder};
pub use table_scan::TableScanResultSet;
pub use validate_check::ValidateCheckResultSet;

use quarry_datastore::{IsolationLevel, LockMode, Qualifiers, ScanController, ScanRange, ScanSpec};
use quarry_expr::Expr;
use quarry_lib::{ColId, ConglomId, ResultSetStats, Row, RowLocation, Value};

use crate::activation::Activation;
use crate::error::{ExecError, Result};

/// A start or stop position of a keyed scan, evaluated at every open.
#[derive(Debug, Clone)]
pub struct KeyBound {
    pub key: Vec<Expr>,
    /// `>=` for a start position, `<=` for a stop position.
    pub inclusive: bool,
    /// Key columns whose nulls compare like any other value.
    /// A null in any other column makes the position match nothing.
    pub ordered_nulls: Vec<bool>,
}

impl KeyBound {
    pub fn new(key: Vec<Expr>, inclusive: bool) -> Self {
        let ordered_nulls = vec![false; key.len()];
        Self {
            key,
            inclusive,
            ordered_nulls,
        }
    }

    /// A position made of constants.
    pub fn values(key: impl IntoIterator<Item = Value>, inclusive: bool) -> Self {
        Self::new(key.into_iter().map(Expr::Value).collect(), inclusive)
    }

    pub fn with_ordered_nulls(mut self, ordered_nulls: Vec<bool>) -> Self {
        self.ordered_nulls = ordered_nulls;
        self
    }

    fn eval(&self, cx: &Activation<'_>) -> Result<EvaluatedBound> {
        let empty = Row::default();
        let key = self
            .key
            .iter()
            .map(|e| e.eval(&empty, cx).map(|v| v.into_owned()))
            .collect::<Result<Row, _>>()?;
        Ok(EvaluatedBound {
            key,
            inclusive: self.inclusive,
            ordered_nulls: self.ordered_nulls.clone(),
        })
    }
}

/// Everything a plan says about how to scan one conglomerate.
#[derive(Debug, Clone)]
pub struct ScanParams {
    pub conglom: ConglomId,
    pub start: Option<KeyBound>,
    pub stop: Option<KeyBound>,
    /// The stop position is the start position, so only `=` predicates position the scan.
    pub same_start_stop: bool,
    pub qualifiers: Qualifiers,
    /// The columns of each row to return, in order. `None` returns all of them.
    pub columns: Option<Vec<ColId>>,
    pub for_update: bool,
    pub lock: LockMode,
    /// Overrides the isolation level of the session.
    pub isolation: Option<IsolationLevel>,
    /// Return at most one row per open.
    pub one_row: bool,
    /// Append the base row location to every row, as DML sources want it.
    pub with_location: bool,
}

impl ScanParams {
    pub fn new(conglom: ConglomId) -> Self {
        Self {
            conglom,
            start: None,
            stop: None,
            same_start_stop: false,
            qualifiers: Qualifiers::none(),
            columns: None,
            for_update: false,
            lock: LockMode::Record,
            isolation: None,
            one_row: false,
            with_location: false,
        }
    }

    pub fn start(mut self, start: KeyBound) -> Self {
        self.start = Some(start);
        self
    }

    pub fn stop(mut self, stop: KeyBound) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Positions the scan on exactly the rows whose key starts with `key`.
    pub fn exact(mut self, key: KeyBound) -> Self {
        self.start = Some(KeyBound { inclusive: true, ..key });
        self.stop = None;
        self.same_start_stop = true;
        self
    }

    pub fn qualifiers(mut self, qualifiers: Qualifiers) -> Self {
        self.qualifiers = qualifiers;
        self
    }

    pub fn columns(mut self, cols: &[u32]) -> Self {
        self.columns = Some(cols.iter().copied().map(ColId).collect());
        self
    }

    pub fn for_update(mut self) -> Self {
        self.for_update = true;
        self
    }

    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = Some(isolation);
        self
    }

    pub fn one_row(mut self) -> Self {
        self.one_row = true;
        self
    }

    pub fn with_location(mut self) -> Self {
        self.with_location = true;
        self
    }

    /// Evaluates the start and stop positions for the coming scan.
    fn positions(&self, cx: &Activation<'_>) -> Result<Positions> {
        let start = self.start.as_ref().map(|b| b.eval(cx)).transpose()?;
        let stop = if self.same_start_stop {
            start.clone()
        } else {
            self.stop.as_ref().map(|b| b.eval(cx)).transpose()?
        };
        Ok(Positions { start, stop })
    }
}

#[derive(Debug, Clone)]
struct EvaluatedBound {
    key: Row,
    inclusive: bool,
    ordered_nulls: Vec<bool>,
}

impl EvaluatedBound {
    fn unordered_null_at(&self, pos: usize) -> bool {
        pos < self.key.len() && !self.ordered_nulls.get(pos).copied().unwrap_or(false)
    }
}

/// The evaluated start and stop positions of one scan.
#[derive(Debug, Clone, Default)]
pub(crate) struct Positions {
    start: Option<EvaluatedBound>,
    stop: Option<EvaluatedBound>,
}

impl Positions {
    fn with_probe(key: Row) -> Self {
        let bound = EvaluatedBound {
            ordered_nulls: vec![false; key.len()],
            key,
            inclusive: true,
        };
        Self {
            start: Some(bound.clone()),
            stop: Some(bound),
        }
    }

    fn range(&self) -> ScanRange {
        let bound = |b: &Option<EvaluatedBound>| match b {
            None => Bound::Unbounded,
            Some(b) if b.inclusive => Bound::Included(b.key.clone()),
            Some(b) => Bound::Excluded(b.key.clone()),
        };
        ScanRange {
            start: bound(&self.start),
            stop: bound(&self.stop),
        }
    }

    /// Does a position compare a null under unordered null semantics?
    /// No row can qualify then, so the scan need not be opened.
    fn skip_scan(&self) -> bool {
        [&self.start, &self.stop].into_iter().flatten().any(|b| {
            b.key
                .iter()
                .enumerate()
                .any(|(pos, v)| v.is_null() && b.unordered_null_at(pos))
        })
    }

    /// Does `row` have a null in a key column positioned under unordered null semantics?
    fn skip_row(&self, row: &Row) -> bool {
        let width = [&self.start, &self.stop]
            .into_iter()
            .flatten()
            .map(|b| b.key.len())
            .max()
            .unwrap_or(0);
        (0..width).any(|pos| {
            let unordered = [&self.start, &self.stop]
                .into_iter()
                .flatten()
                .any(|b| b.unordered_null_at(pos));
            unordered && row.get(ColId(pos as u32)).is_null()
        })
    }
}

/// The store scan behind a scanning operator, with its positioning.
///
/// The scan is opened at the first positioning and repositioned in place
/// afterwards, until [`ScanCore::close`].
pub(crate) struct ScanCore {
    pub params: ScanParams,
    scan: Option<Box<dyn ScanController>>,
    keyed: Option<bool>,
    positions: Positions,
    /// False when the current positions can match no row.
    scan_opened: bool,
    isolation: IsolationLevel,
    /// Rows fetched since the last positioning.
    pub rows_this_scan: u64,
}

impl ScanCore {
    pub fn new(params: ScanParams) -> Self {
        let isolation = params.isolation.unwrap_or_default();
        Self {
            params,
            scan: None,
            keyed: None,
            positions: Positions::default(),
            scan_opened: false,
            isolation,
            rows_this_scan: 0,
        }
    }

    pub fn is_keyed(&self) -> bool {
        self.keyed.unwrap_or(false)
    }

    pub fn is_scan_opened(&self) -> bool {
        self.scan_opened
    }

    /// Positions the scan on the bounds of the plan.
    pub fn position(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let positions = self.params.positions(cx)?;
        self.position_at(cx, positions)
    }

    pub fn position_at(&mut self, cx: &mut Activation<'_>, positions: Positions) -> Result<()> {
        if self.keyed.is_none() {
            self.keyed = Some(cx.tc().conglomerate_info(self.params.conglom)?.is_keyed());
        }
        self.isolation = self.params.isolation.unwrap_or_else(|| cx.isolation());
        self.positions = positions;
        self.rows_this_scan = 0;
        if self.positions.skip_scan() {
            log::trace!("SCAN SKIPPED: conglomerate = {}, null in key", self.params.conglom);
            self.scan_opened = false;
            return Ok(());
        }
        let range = self.positions.range();
        match &mut self.scan {
            Some(scan) => scan.reopen(range, self.params.qualifiers.clone())?,
            None => {
                let mut spec = ScanSpec::range(range)
                    .with_qualifiers(self.params.qualifiers.clone())
                    .with_isolation(self.isolation);
                spec.lock = self.params.lock;
                if self.params.for_update {
                    spec = spec.for_update();
                }
                self.scan = Some(cx.tc().open_scan(self.params.conglom, spec)?);
            }
        }
        self.scan_opened = true;
        Ok(())
    }

    /// The next row of the scan that survives the null key check, with its
    /// heap location for a heap scan.
    pub fn next_candidate(
        &mut self,
        cx: &mut Activation<'_>,
        stats: &mut ResultSetStats,
    ) -> Result<Option<(Row, Option<RowLocation>)>> {
        if !self.scan_opened {
            return Ok(None);
        }
        let scan = self
            .scan
            .as_mut()
            .ok_or(ExecError::InvalidState("scan positioned without a store scan"))?;
        while let Some(row) = scan.next()? {
            cx.check_cancel()?;
            stats.rows_seen += 1;
            self.rows_this_scan += 1;
            // With equal start and stop positions every key predicate is an `=`
            // and was applied by the store.
            if !self.params.same_start_stop && self.positions.skip_row(&row) {
                stats.rows_filtered += 1;
                continue;
            }
            let loc = if self.keyed == Some(true) {
                None
            } else {
                Some(scan.row_location()?)
            };
            return Ok(Some((row, loc)));
        }
        Ok(None)
    }

    /// Fetches up to `max` rows at once.
    pub fn next_group(
        &mut self,
        cx: &mut Activation<'_>,
        stats: &mut ResultSetStats,
        buf: &mut Vec<(Row, Option<RowLocation>)>,
        max: usize,
    ) -> Result<usize> {
        if !self.scan_opened {
            return Ok(0);
        }
        let scan = self
            .scan
            .as_mut()
            .ok_or(ExecError::InvalidState("scan positioned without a store scan"))?;
        let mut fetched = Vec::with_capacity(max);
        let n = scan.fetch_next_group(&mut fetched, max)?;
        for f in fetched {
            cx.check_cancel()?;
            stats.rows_seen += 1;
            self.rows_this_scan += 1;
            if !self.params.same_start_stop && self.positions.skip_row(&f.row) {
                stats.rows_filtered += 1;
                continue;
            }
            let loc = if self.keyed == Some(true) { None } else { f.loc };
            buf.push((f.row, loc));
        }
        Ok(n)
    }

    /// The columns of `row` the plan asked for.
    pub fn project(&self, row: &Row) -> Row {
        match &self.params.columns {
            Some(cols) => row.project(cols),
            None => row.clone(),
        }
    }

    /// The row returned for a fetched candidate.
    pub fn output(&self, candidate: &Row, heap_loc: Option<RowLocation>) -> Result<Row> {
        let row = self.project(candidate);
        if !self.params.with_location {
            return Ok(row);
        }
        Ok(row.with_location(self.base_location(candidate, heap_loc)?))
    }

    /// The base row location of a fetched row: the trailing column of an
    /// index row, or the heap location.
    pub fn base_location(&self, candidate: &Row, heap_loc: Option<RowLocation>) -> Result<RowLocation> {
        if self.is_keyed() {
            candidate
                .row_location()
                .ok_or(ExecError::InvalidState("index row without a row location"))
        } else {
            heap_loc.ok_or(ExecError::InvalidState("no current row"))
        }
    }

    /// Read locks are released before a row is returned when the scan is
    /// read only and runs at read committed or below.
    pub fn requires_relocking(&self) -> bool {
        !self.params.for_update && self.isolation.releases_read_locks_early()
    }

    pub fn close(&mut self) {
        if let Some(mut scan) = self.scan.take() {
            scan.close();
        }
        self.scan_opened = false;
    }
}
