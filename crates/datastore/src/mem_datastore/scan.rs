use core::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;
use quarry_lib::Row;
use quarry_primitives::{ConglomId, RowLocation};

use super::state::{State, Storage};
use crate::error::StoreError;
use crate::qualifier::{Qualifiers, ScanRange};
use crate::traits::ScanController;
use crate::Result;

/// Where a conglomerate scan stands.
///
/// The scan remembers the last row it visited rather than an iterator,
/// so it survives rows being inserted or deleted behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Position {
    Start,
    /// The last slot of a heap visited.
    Slot(u64),
    /// The last index row of a btree visited.
    Key(Row),
    Done,
}

pub(super) struct MemScan {
    pub state: Arc<RwLock<State>>,
    pub conglom: ConglomId,
    pub keyed: bool,
    pub range: ScanRange,
    pub qualifiers: Qualifiers,
    position: Position,
    /// The last qualifying row handed out.
    current: Option<(Row, RowLocation)>,
    visited: u64,
    closed: bool,
}

impl MemScan {
    pub fn new(state: Arc<RwLock<State>>, conglom: ConglomId, keyed: bool, range: ScanRange, qualifiers: Qualifiers) -> Self {
        Self {
            state,
            conglom,
            keyed,
            range,
            qualifiers,
            position: Position::Start,
            current: None,
            visited: 0,
            closed: false,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(StoreError::ScanClosed(self.conglom));
        }
        Ok(())
    }

    fn next_heap(&mut self, rows: &std::collections::BTreeMap<u64, Row>) -> Option<(Row, RowLocation)> {
        let lower = match self.position {
            Position::Slot(slot) => Bound::Excluded(slot),
            _ => Bound::Unbounded,
        };
        for (slot, row) in rows.range((lower, Bound::Unbounded)) {
            self.visited += 1;
            self.position = Position::Slot(*slot);
            if self.qualifiers.matches(row) {
                return Some((row.clone(), RowLocation::new(self.conglom, *slot)));
            }
        }
        None
    }

    fn next_btree(&mut self, rows: &std::collections::BTreeSet<Row>) -> Result<Option<(Row, RowLocation)>> {
        let lower = match &self.position {
            Position::Key(last) => Bound::Excluded(last.clone()),
            _ => match &self.range.start {
                Bound::Included(key) | Bound::Excluded(key) => Bound::Included(key.clone()),
                Bound::Unbounded => Bound::Unbounded,
            },
        };
        for row in rows.range((lower, Bound::Unbounded)) {
            if self.range.past_stop(row) {
                break;
            }
            self.position = Position::Key(row.clone());
            if !self.range.after_start(row) {
                continue;
            }
            self.visited += 1;
            if self.qualifiers.matches(row) {
                let loc = row
                    .row_location()
                    .ok_or_else(|| StoreError::invalid("btree row without a row location"))?;
                return Ok(Some((row.clone(), loc)));
            }
        }
        Ok(None)
    }
}

impl ScanController for MemScan {
    fn next(&mut self) -> Result<Option<Row>> {
        self.check_open()?;
        if self.position == Position::Done {
            return Ok(None);
        }
        let state = Arc::clone(&self.state);
        let state = state.read();
        let found = match &state.conglomerate(self.conglom)?.storage {
            Storage::Heap { rows, .. } => self.next_heap(rows),
            Storage::BTree { rows, .. } => self.next_btree(rows)?,
        };
        match found {
            Some((row, loc)) => {
                self.current = Some((row.clone(), loc));
                Ok(Some(row))
            }
            None => {
                self.position = Position::Done;
                self.current = None;
                Ok(None)
            }
        }
    }

    fn row_location(&self) -> Result<RowLocation> {
        self.check_open()?;
        self.current
            .as_ref()
            .map(|(_, loc)| *loc)
            .ok_or(StoreError::ScanNotPositioned(self.conglom))
    }

    fn delete_current(&mut self) -> Result<bool> {
        self.check_open()?;
        let (row, loc) = self.current.take().ok_or(StoreError::ScanNotPositioned(self.conglom))?;
        let mut state = self.state.write();
        Ok(match &mut state.conglomerate_mut(self.conglom)?.storage {
            Storage::Heap { rows, .. } => rows.remove(&loc.slot).is_some(),
            Storage::BTree { rows, .. } => rows.remove(&row),
        })
    }

    fn reopen(&mut self, range: ScanRange, qualifiers: Qualifiers) -> Result<()> {
        self.check_open()?;
        self.range = range;
        self.qualifiers = qualifiers;
        self.position = Position::Start;
        self.current = None;
        self.state.write().counters.scans_reopened += 1;
        Ok(())
    }

    fn rows_visited(&self) -> u64 {
        self.visited
    }

    fn is_keyed(&self) -> bool {
        self.keyed
    }

    fn close(&mut self) {
        self.closed = true;
        self.current = None;
    }
}

/// A scan over the rows of a completed sort.
pub(super) struct MemSortScan {
    pub rows: Vec<Row>,
    pub pos: usize,
    pub closed: bool,
}

impl ScanController for MemSortScan {
    fn next(&mut self) -> Result<Option<Row>> {
        if self.closed {
            return Err(StoreError::ScanClosed(ConglomId::UNDEFINED));
        }
        let row = self.rows.get(self.pos).cloned();
        if row.is_some() {
            self.pos += 1;
        }
        Ok(row)
    }

    fn row_location(&self) -> Result<RowLocation> {
        Err(StoreError::invalid("rows of a sort have no location"))
    }

    fn delete_current(&mut self) -> Result<bool> {
        Err(StoreError::invalid("cannot delete from a sort"))
    }

    fn reopen(&mut self, _: ScanRange, _: Qualifiers) -> Result<()> {
        self.pos = 0;
        Ok(())
    }

    fn rows_visited(&self) -> u64 {
        self.pos as u64
    }

    fn is_keyed(&self) -> bool {
        true
    }

    fn close(&mut self) {
        self.closed = true;
        self.rows = Vec::new();
    }
}
