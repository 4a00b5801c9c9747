//! Rows buffered by a statement for deferred processing.
//!
//! A holder keeps its first rows in memory and spills the rest into a
//! temporary heap created on the first overflow. The holder is shared
//! through a [`RowHolderRef`] between the operator filling it and the
//! result sets draining it.

use core::ops::Bound;
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use quarry_datastore::{
    ConglomerateController, ConglomerateKind, IsolationLevel, LockMode, OpenMode, ScanController, ScanRange,
    ScanSpec, TransactionController,
};
use quarry_lib::{ConglomId, ResultSetNumber, Row, RowLocation, Value};

use crate::activation::{Activation, RowHolderRef};
use crate::error::{ExecError, Result};
use crate::result_set::{Phase, ResultSet, ResultSetBase};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum HolderState {
    Uninit,
    Insert,
    Drain,
}

/// The spilled part of a holder.
struct Overflow {
    heap: ConglomId,
    cc: Box<dyn ConglomerateController>,
    /// Maps insertion positions to heap locations.
    position_index: Option<(ConglomId, Box<dyn ConglomerateController>)>,
}

pub struct TemporaryRowHolder {
    state: HolderState,
    threshold: usize,
    /// In memory rows, `None` once deleted through a result set.
    rows: Vec<Option<Row>>,
    overflow: Option<Overflow>,
    /// Rows inserted since the last truncate, the position of the last one.
    inserted: u64,
    keep_position_index: bool,
    /// Inserts stay allowed while the holder is drained.
    virtual_memory_heap: bool,
    /// Locations of the rows already held, when rows are deduplicated by
    /// their trailing row location.
    unique: Option<HashSet<RowLocation>>,
}

impl TemporaryRowHolder {
    /// A holder keeping up to `threshold` rows in memory.
    pub fn new(threshold: usize) -> Self {
        Self {
            state: HolderState::Uninit,
            threshold,
            rows: Vec::new(),
            overflow: None,
            inserted: 0,
            keep_position_index: false,
            virtual_memory_heap: false,
            unique: None,
        }
    }

    /// A holder using the threshold of the session's configuration.
    pub fn for_activation(cx: &Activation<'_>) -> Self {
        Self::new(cx.config().temp_row_holder_threshold)
    }

    pub fn into_ref(self) -> RowHolderRef {
        Rc::new(RefCell::new(self))
    }

    /// Maintains an index from insertion position to the location of every spilled row.
    pub fn with_position_index(mut self) -> Self {
        self.keep_position_index = true;
        self
    }

    /// Allows inserts interleaved with reads, as an update cursor does.
    /// Spilled rows are read through the position index.
    pub fn virtual_memory_heap(mut self) -> Self {
        self.virtual_memory_heap = true;
        self.keep_position_index = true;
        self
    }

    /// Silently drops a row whose trailing row location is already held.
    pub fn unique_stream(mut self) -> Self {
        self.unique = Some(HashSet::new());
        self
    }

    pub fn row_count(&self) -> u64 {
        self.inserted
    }

    pub fn is_empty(&self) -> bool {
        self.inserted == 0
    }

    /// The temporary heap holding the spilled rows, if any row spilled.
    pub fn temporary_conglomerate(&self) -> Option<ConglomId> {
        self.overflow.as_ref().map(|o| o.heap)
    }

    pub fn insert(&mut self, cx: &mut Activation<'_>, row: Row) -> Result<()> {
        if self.state == HolderState::Drain && !self.virtual_memory_heap {
            return Err(ExecError::InvalidState("insert into a temporary row holder being drained"));
        }
        if self.state == HolderState::Uninit {
            self.state = HolderState::Insert;
        }
        if let Some(seen) = &mut self.unique {
            let loc = row
                .row_location()
                .ok_or(ExecError::InvalidState("unique stream row without a row location"))?;
            if !seen.insert(loc) {
                return Ok(());
            }
        }
        self.inserted += 1;
        if self.rows.len() < self.threshold {
            self.rows.push(Some(row));
            return Ok(());
        }
        let position = self.inserted;
        let overflow = match &mut self.overflow {
            Some(overflow) => overflow,
            None => self.overflow.insert(Self::create_overflow(cx.tc(), self.keep_position_index)?),
        };
        let loc = overflow.cc.insert_unchecked(&row)?;
        if let Some((_, index)) = &mut overflow.position_index {
            index.insert_unchecked(&Row::new(vec![Value::I64(position as i64), Value::Loc(loc)]))?;
        }
        Ok(())
    }

    fn create_overflow(tc: &mut dyn TransactionController, position_index: bool) -> Result<Overflow> {
        let heap = tc.create_conglomerate(ConglomerateKind::Heap, true)?;
        let cc = open_for_update(tc, heap)?;
        let position_index = if position_index {
            let kind = ConglomerateKind::BTree {
                key_cols: 1,
                unique: true,
            };
            let index = tc.create_conglomerate(kind, true)?;
            Some((index, open_for_update(tc, index)?))
        } else {
            None
        };
        log::debug!("TEMPORARY ROW HOLDER OVERFLOW: heap = {heap}");
        Ok(Overflow { heap, cc, position_index })
    }

    /// A result set over the held rows, in insertion order.
    /// Ends the insert phase unless the holder is a virtual memory heap.
    pub fn result_set(this: &RowHolderRef, rsn: ResultSetNumber) -> TemporaryRowHolderResultSet {
        this.borrow_mut().state = HolderState::Drain;
        TemporaryRowHolderResultSet::new(rsn, Rc::clone(this))
    }

    /// Calls `f` with every held row in insertion order, ending the insert phase.
    pub fn for_each_row(
        &mut self,
        cx: &mut Activation<'_>,
        mut f: impl FnMut(&mut Activation<'_>, Row) -> Result<()>,
    ) -> Result<()> {
        self.state = HolderState::Drain;
        for row in self.rows.iter().flatten() {
            f(cx, row.clone())?;
        }
        let Some(overflow) = &self.overflow else {
            return Ok(());
        };
        let mut scan = cx.tc().open_scan(overflow.heap, ScanSpec::full())?;
        let res = drain_scan(&mut *scan, cx, &mut f);
        scan.close();
        res
    }

    /// Drops every row and the temporary conglomerates, making the holder reusable.
    pub fn truncate(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        self.rows.clear();
        self.inserted = 0;
        if let Some(seen) = &mut self.unique {
            seen.clear();
        }
        self.state = HolderState::Uninit;
        if let Some(mut overflow) = self.overflow.take() {
            overflow.cc.close();
            cx.tc().drop_conglomerate(overflow.heap)?;
            if let Some((index, mut cc)) = overflow.position_index.take() {
                cc.close();
                cx.tc().drop_conglomerate(index)?;
            }
        }
        Ok(())
    }

    pub fn close(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        self.truncate(cx)
    }

    fn memory_row(&self, idx: usize) -> Option<Option<&Row>> {
        self.rows.get(idx).map(Option::as_ref)
    }

    fn fetch_spilled(&mut self, loc: RowLocation) -> Result<Option<Row>> {
        match &mut self.overflow {
            Some(overflow) => Ok(overflow.cc.fetch(loc, None, false)?),
            None => Ok(None),
        }
    }

    fn delete_memory_row(&mut self, idx: usize) {
        if let Some(slot) = self.rows.get_mut(idx) {
            *slot = None;
        }
    }

    fn delete_spilled(&mut self, loc: RowLocation) -> Result<bool> {
        match &mut self.overflow {
            Some(overflow) => Ok(overflow.cc.delete(loc)?),
            None => Ok(false),
        }
    }

    /// The conglomerate spilled rows are read from in insertion order,
    /// and whether it is the position index.
    fn spill_source(&self) -> Option<(ConglomId, bool)> {
        let overflow = self.overflow.as_ref()?;
        Some(match &overflow.position_index {
            Some((index, _)) => (*index, true),
            None => (overflow.heap, false),
        })
    }
}

fn drain_scan(
    scan: &mut dyn ScanController,
    cx: &mut Activation<'_>,
    f: &mut impl FnMut(&mut Activation<'_>, Row) -> Result<()>,
) -> Result<()> {
    while let Some(row) = scan.next()? {
        f(cx, row)?;
    }
    Ok(())
}

fn open_for_update(tc: &mut dyn TransactionController, conglom: ConglomId) -> Result<Box<dyn ConglomerateController>> {
    Ok(tc.open_conglomerate(conglom, OpenMode::ForUpdate, LockMode::Table, IsolationLevel::ReadCommitted)?)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Current {
    Memory(usize),
    Spilled(RowLocation),
}

/// Reads the rows of a [`TemporaryRowHolder`]: the in-memory rows first,
/// then the spilled ones.
pub struct TemporaryRowHolderResultSet {
    base: ResultSetBase,
    holder: RowHolderRef,
    next_memory: usize,
    scan: Option<Box<dyn ScanController>>,
    /// The position of the last spilled row read through the position index.
    last_position: Option<i64>,
    spill_done: bool,
    current: Option<Current>,
}

impl TemporaryRowHolderResultSet {
    fn new(rsn: ResultSetNumber, holder: RowHolderRef) -> Self {
        Self {
            base: ResultSetBase::new(rsn),
            holder,
            next_memory: 0,
            scan: None,
            last_position: None,
            spill_done: false,
            current: None,
        }
    }

    pub fn holder(&self) -> &RowHolderRef {
        &self.holder
    }

    fn reset(&mut self) {
        self.next_memory = 0;
        self.last_position = None;
        self.spill_done = false;
        self.current = None;
        if let Some(mut scan) = self.scan.take() {
            scan.close();
        }
    }

    fn next_memory_row(&mut self) -> Option<Row> {
        let holder = self.holder.borrow();
        while let Some(slot) = holder.memory_row(self.next_memory) {
            let idx = self.next_memory;
            self.next_memory += 1;
            if let Some(row) = slot {
                self.current = Some(Current::Memory(idx));
                return Some(row.clone());
            }
        }
        None
    }

    fn next_spilled_row(&mut self, cx: &mut Activation<'_>) -> Result<Option<Row>> {
        let virtual_memory_heap = self.holder.borrow().virtual_memory_heap;
        if self.spill_done && !virtual_memory_heap {
            return Ok(None);
        }
        let Some((source, by_position)) = self.holder.borrow().spill_source() else {
            return Ok(None);
        };
        loop {
            let scan = match &mut self.scan {
                Some(scan) => scan,
                None => {
                    let range = match self.last_position {
                        Some(pos) => ScanRange {
                            start: Bound::Excluded(Row::new(vec![Value::I64(pos)])),
                            stop: Bound::Unbounded,
                        },
                        None => ScanRange::full(),
                    };
                    self.scan.insert(cx.tc().open_scan(source, ScanSpec::range(range))?)
                }
            };
            let Some(row) = scan.next()? else {
                self.spill_done = true;
                // Rows inserted later into a virtual memory heap are picked up by a new scan.
                if virtual_memory_heap {
                    if let Some(mut scan) = self.scan.take() {
                        scan.close();
                    }
                }
                return Ok(None);
            };
            if !by_position {
                self.current = Some(Current::Spilled(scan.row_location()?));
                return Ok(Some(row));
            }
            let (Some(Value::I64(pos)), Some(loc)) = (row.first(), row.row_location()) else {
                return Err(ExecError::internal("corrupt position index row"));
            };
            self.last_position = Some(*pos);
            // Deleted through a result set.
            if let Some(row) = self.holder.borrow_mut().fetch_spilled(loc)? {
                self.current = Some(Current::Spilled(loc));
                return Ok(Some(row));
            }
        }
    }

    /// Deletes the current row from the holder.
    pub fn delete_current_row(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        self.base.check_open("delete_current_row")?;
        match self.current.take() {
            Some(Current::Memory(idx)) => self.holder.borrow_mut().delete_memory_row(idx),
            Some(Current::Spilled(loc)) => {
                self.holder.borrow_mut().delete_spilled(loc)?;
            }
            None => return Err(ExecError::InvalidState("no current row")),
        }
        self.base.set_current_row(cx, None);
        Ok(())
    }
}

impl ResultSet for TemporaryRowHolderResultSet {
    fn kind(&self) -> &'static str {
        "temporary row holder"
    }

    fn base(&self) -> &ResultSetBase {
        &self.base
    }

    fn open_core(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let start = self.base.start_timer(cx);
        self.reset();
        self.base.mark_open();
        self.base.stop_timer(start, Phase::Open);
        Ok(())
    }

    fn next_row_core(&mut self, cx: &mut Activation<'_>) -> Result<Option<Row>> {
        self.base.check_open("next_row")?;
        let start = self.base.start_timer(cx);
        self.current = None;
        let row = match self.next_memory_row() {
            Some(row) => Some(row),
            None => self.next_spilled_row(cx)?,
        };
        let row = self.base.produced(cx, row);
        self.base.stop_timer(start, Phase::Next);
        Ok(row)
    }

    fn close(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        self.reset();
        self.base.mark_closed(cx);
        Ok(())
    }

    /// The location of the current row in the temporary heap.
    fn row_location(&self) -> Result<RowLocation> {
        match self.current {
            Some(Current::Spilled(loc)) => Ok(loc),
            _ => Err(ExecError::unsupported("row_location", "in memory temporary row")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result_set::TopResultSet;
    use crate::testing::TestDb;
    use pretty_assertions::assert_eq;
    use quarry_lib::row;

    fn drain(holder: &RowHolderRef, cx: &mut Activation<'_>) -> Vec<Row> {
        let rs = TemporaryRowHolder::result_set(holder, ResultSetNumber(0));
        TopResultSet::new(Box::new(rs)).collect(cx).unwrap()
    }

    #[test]
    fn overflow_creates_exactly_one_temporary_heap() {
        let mut db = TestDb::new();
        db.store.reset_counters();
        let mut cx = db.activation();
        let holder = TemporaryRowHolder::for_activation(&cx).into_ref();
        for i in 0..5 {
            holder.borrow_mut().insert(&mut cx, row![i]).unwrap();
        }
        assert_eq!(holder.borrow().temporary_conglomerate(), None);
        holder.borrow_mut().insert(&mut cx, row![5]).unwrap();
        holder.borrow_mut().insert(&mut cx, row![6]).unwrap();
        drop(cx);
        assert_eq!(db.store.counters().temp_conglomerates_created, 1);

        let mut cx = db.activation();
        assert_eq!(drain(&holder, &mut cx), (0..7).map(|i| row![i]).collect::<Vec<_>>());
        assert!(holder.borrow_mut().insert(&mut cx, row![7]).is_err());

        holder.borrow_mut().close(&mut cx).unwrap();
        drop(cx);
        assert_eq!(db.store.counters().conglomerates_dropped, 1);
        assert!(holder.borrow().is_empty());
    }

    #[test]
    fn unique_stream_drops_repeated_locations() {
        let mut db = TestDb::new();
        let mut cx = db.activation();
        let holder = TemporaryRowHolder::new(1).unique_stream().into_ref();
        let loc = |slot| RowLocation::new(ConglomId(9), slot);
        for slot in [1u64, 2, 1, 3, 2] {
            let key = i64::try_from(slot).unwrap();
            holder.borrow_mut().insert(&mut cx, row![key].with_location(loc(slot))).unwrap();
        }
        assert_eq!(holder.borrow().row_count(), 3);
        let rows = drain(&holder, &mut cx);
        assert_eq!(rows.iter().filter_map(Row::row_location).collect::<Vec<_>>(), vec![loc(1), loc(2), loc(3)]);
    }

    #[test]
    fn virtual_memory_heap_reads_interleaved_inserts() {
        let mut db = TestDb::new();
        let mut cx = db.activation();
        let holder = TemporaryRowHolder::new(1).virtual_memory_heap().into_ref();
        holder.borrow_mut().insert(&mut cx, row![1]).unwrap();
        holder.borrow_mut().insert(&mut cx, row![2]).unwrap();

        let mut rs = TemporaryRowHolder::result_set(&holder, ResultSetNumber(0));
        rs.open_core(&mut cx).unwrap();
        assert_eq!(rs.next_row_core(&mut cx).unwrap(), Some(row![1]));
        rs.delete_current_row(&mut cx).unwrap();
        assert_eq!(rs.next_row_core(&mut cx).unwrap(), Some(row![2]));
        assert!(rs.row_location().is_ok());
        rs.delete_current_row(&mut cx).unwrap();
        assert_eq!(rs.next_row_core(&mut cx).unwrap(), None);

        holder.borrow_mut().insert(&mut cx, row![3]).unwrap();
        assert_eq!(rs.next_row_core(&mut cx).unwrap(), Some(row![3]));

        // Deleted rows stay deleted when read again.
        rs.reopen_core(&mut cx).unwrap();
        assert_eq!(rs.next_row_core(&mut cx).unwrap(), Some(row![3]));
        assert_eq!(rs.next_row_core(&mut cx).unwrap(), None);
        rs.close(&mut cx).unwrap();
    }

    #[test]
    fn truncated_holders_are_reused() {
        let mut db = TestDb::new();
        let mut cx = db.activation();
        let holder = TemporaryRowHolder::new(1).with_position_index().into_ref();
        for i in 0..3 {
            holder.borrow_mut().insert(&mut cx, row![i]).unwrap();
        }
        assert_eq!(drain(&holder, &mut cx).len(), 3);
        holder.borrow_mut().truncate(&mut cx).unwrap();
        holder.borrow_mut().insert(&mut cx, row!["again"]).unwrap();
        assert_eq!(drain(&holder, &mut cx), vec![row!["again"]]);
    }

    #[test]
    fn for_each_row_visits_memory_then_spilled_rows() {
        let mut db = TestDb::new();
        let mut cx = db.activation();
        let holder = TemporaryRowHolder::new(2).into_ref();
        for i in 0..5 {
            holder.borrow_mut().insert(&mut cx, row![i]).unwrap();
        }
        let mut seen = Vec::new();
        holder
            .borrow_mut()
            .for_each_row(&mut cx, |_, row| {
                seen.push(row);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, (0..5).map(|i| row![i]).collect::<Vec<_>>());
        // Draining ends the insert phase.
        assert!(holder.borrow_mut().insert(&mut cx, row![5]).is_err());
        holder.borrow_mut().close(&mut cx).unwrap();
    }
}
