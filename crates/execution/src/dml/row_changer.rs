use std::borrow::Cow;
use std::rc::Rc;

use quarry_datastore::{ConglomerateController, LockMode, OpenMode};
use quarry_lib::{ColId, ConglomId, FixedBitSet, Row, RowLocation};

use crate::activation::{Activation, RowHolderRef};
use crate::dml::index_changer::IndexSetChanger;
use crate::error::{ExecError, Result};

/// Applies row changes to a heap and all of its indexes.
///
/// Rows handed to the changer may hold only some of the base columns: with
/// a read map, column `i` of such a row is base column `read_map[i]`.
pub struct RowChanger {
    heap: ConglomId,
    lock: LockMode,
    /// The base columns an update assigns, all when `None`.
    changed_cols: Option<Vec<ColId>>,
    read_map: Option<Vec<ColId>>,
    width: usize,
    heap_cc: Option<Box<dyn ConglomerateController>>,
    indexes: Option<IndexSetChanger>,
    /// Buffers unique index entries held back by updates.
    row_holder: Option<RowHolderRef>,
}

impl RowChanger {
    pub fn new(heap: ConglomId) -> Self {
        Self {
            heap,
            lock: LockMode::Record,
            changed_cols: None,
            read_map: None,
            width: 0,
            heap_cc: None,
            indexes: None,
            row_holder: None,
        }
    }

    pub fn with_lock_mode(mut self, lock: LockMode) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_changed_columns(mut self, cols: &[u32]) -> Self {
        self.changed_cols = Some(cols.iter().copied().map(ColId).collect());
        self
    }

    pub fn with_read_map(mut self, cols: &[u32]) -> Self {
        self.read_map = Some(cols.iter().copied().map(ColId).collect());
        self
    }

    /// Buffers the unique index entries moved by updates in a holder owned
    /// by the caller, which may reuse it across executions.
    pub fn with_row_holder(mut self, holder: RowHolderRef) -> Self {
        self.row_holder = Some(holder);
        self
    }

    pub fn heap(&self) -> ConglomId {
        self.heap
    }

    /// The number of columns of the rows handed to the changer.
    pub fn row_width(&self) -> usize {
        self.read_map.as_ref().map_or(self.width, Vec::len)
    }

    pub fn is_open(&self) -> bool {
        self.heap_cc.is_some()
    }

    pub fn open(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        let table = cx
            .catalog()
            .table(self.heap)
            .ok_or_else(|| ExecError::internal(format!("unknown table {}", self.heap)))?;
        self.width = table.columns;
        let mut indexes = IndexSetChanger::open(cx, &table.indexes, self.lock)?;
        if let Some(changed) = &self.changed_cols {
            // Only indexes on an assigned column can change.
            let fix = table
                .indexes
                .iter()
                .map(|ix| {
                    cx.catalog()
                        .index(*ix)
                        .is_some_and(|ix| changed.iter().any(|c| ix.generator.covers(*c)))
                })
                .collect();
            indexes = indexes.with_fix_on_update(fix);
        }
        if let Some(holder) = &self.row_holder {
            indexes = indexes.with_row_holder(Rc::clone(holder));
        }
        let isolation = cx.isolation();
        self.heap_cc = Some(
            cx.tc()
                .open_conglomerate(self.heap, OpenMode::ForUpdate, self.lock, isolation)?,
        );
        self.indexes = Some(indexes);
        Ok(())
    }

    fn parts(&mut self) -> Result<(&mut dyn ConglomerateController, &mut IndexSetChanger)> {
        match (&mut self.heap_cc, &mut self.indexes) {
            (Some(cc), Some(indexes)) => Ok((&mut **cc, indexes)),
            _ => Err(ExecError::InvalidState("the row changer is not open")),
        }
    }

    /// Spreads a row read through the read map over the full base width.
    pub fn base_row<'r>(&self, row: &'r Row) -> Cow<'r, Row> {
        match &self.read_map {
            None => Cow::Borrowed(row),
            Some(map) => {
                let mut base = Row::nulls(self.width);
                for (value, col) in row.iter().zip(map) {
                    base.set(*col, value.clone());
                }
                Cow::Owned(base)
            }
        }
    }

    /// Inserts `row` into the heap and every index. Returns its location.
    pub fn insert_row(&mut self, cx: &mut Activation<'_>, row: &Row) -> Result<RowLocation> {
        let (cc, indexes) = self.parts()?;
        let loc = cc.insert_unchecked(row)?;
        indexes.insert(cx, row, loc)?;
        Ok(loc)
    }

    /// Deletes the index entries of `row` first, then the heap row at `loc`.
    pub fn delete_row(&mut self, cx: &mut Activation<'_>, row: &Row, loc: RowLocation) -> Result<()> {
        let base = self.base_row(row).into_owned();
        let (cc, indexes) = self.parts()?;
        indexes.delete(cx, &base, loc)?;
        if !cc.delete(loc)? {
            log::warn!("HEAP ROW MISSING ON DELETE: location = {loc}");
        }
        Ok(())
    }

    pub fn update_row(&mut self, cx: &mut Activation<'_>, old: &Row, new: &Row, loc: RowLocation) -> Result<()> {
        let old_base = self.base_row(old).into_owned();
        let new_base = self.base_row(new).into_owned();
        let valid = self.changed_cols.as_ref().map(|cols| {
            FixedBitSet::from_bits(self.width, cols.iter().map(|c| c.idx()))
        });
        let (cc, indexes) = self.parts()?;
        indexes.update(cx, &old_base, &new_base, loc)?;
        // With a bitmap only the assigned columns are written, at their base positions.
        if !cc.replace(loc, &new_base, valid.as_ref())? {
            log::warn!("HEAP ROW MISSING ON UPDATE: location = {loc}");
        }
        Ok(())
    }

    /// The current heap row at `loc`, locked for update.
    pub fn fetch(&mut self, loc: RowLocation) -> Result<Option<Row>> {
        let (cc, _) = self.parts()?;
        Ok(cc.fetch(loc, None, true)?)
    }

    pub fn finish(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        match &mut self.indexes {
            Some(indexes) => indexes.finish(cx),
            None => Ok(()),
        }
    }

    pub fn close(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        if let Some(mut cc) = self.heap_cc.take() {
            cc.close();
        }
        match self.indexes.take() {
            Some(mut indexes) => indexes.close(cx),
            None => Ok(()),
        }
    }
}
