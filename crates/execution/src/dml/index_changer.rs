//! Index maintenance for the rows a statement changes.

use std::rc::Rc;
use std::sync::Arc;

use quarry_datastore::{
    ConglomerateController, InsertOutcome, LockMode, OpenMode, Qualifiers, ScanController, ScanRange, ScanSpec,
};
use quarry_lib::{ConglomId, Row, RowLocation, Value};

use crate::activation::{Activation, RowHolderRef};
use crate::catalog::IndexDescriptor;
use crate::error::{ConstraintViolation, ExecError, Result};
use crate::temp_holder::TemporaryRowHolder;

/// Keeps one index in step with its base table.
///
/// On update, the new entry of a unique index is not inserted right away:
/// another row changed later by the same statement may still hold the key.
/// [`IndexChanger::update`] hands such entries back to the caller, which
/// inserts them with [`IndexChanger::insert_entry`] once every delete of
/// the statement is done.
pub struct IndexChanger {
    index: Arc<IndexDescriptor>,
    lock: LockMode,
    cc: Option<Box<dyn ConglomerateController>>,
    /// Positions on the entry to delete, reopened for every delete.
    scan: Option<Box<dyn ScanController>>,
}

impl IndexChanger {
    pub fn new(index: Arc<IndexDescriptor>, lock: LockMode) -> Self {
        Self {
            index,
            lock,
            cc: None,
            scan: None,
        }
    }

    pub fn index(&self) -> &IndexDescriptor {
        &self.index
    }

    fn is_unique(&self) -> bool {
        self.index.generator.unique
    }

    /// Is the constraint backed by this index currently deferred?
    fn deferred(&self, cx: &Activation<'_>) -> bool {
        self.index.constraint.is_some_and(|c| cx.is_deferred(c))
    }

    fn cc(&mut self, cx: &mut Activation<'_>) -> Result<&mut dyn ConglomerateController> {
        if self.cc.is_none() {
            let isolation = cx.isolation();
            let cc = cx
                .tc()
                .open_conglomerate(self.index.conglom, OpenMode::ForUpdate, self.lock, isolation)?;
            self.cc = Some(cc);
        }
        match self.cc.as_deref_mut() {
            Some(cc) => Ok(cc),
            None => Err(ExecError::InvalidState("index conglomerate not open")),
        }
    }

    pub fn insert(&mut self, cx: &mut Activation<'_>, base: &Row, loc: RowLocation) -> Result<()> {
        let entry = self.index.generator.index_row(base, loc);
        self.insert_entry(cx, entry)
    }

    /// Inserts an index row, remembering a duplicate key when the
    /// constraint of the index is deferred.
    pub fn insert_entry(&mut self, cx: &mut Activation<'_>, entry: Row) -> Result<()> {
        let deferred = self.deferred(cx);
        let index = Arc::clone(&self.index);
        let cc = self.cc(cx)?;
        if cc.insert(&entry)? == InsertOutcome::Duplicate {
            if !deferred {
                let (constraint, table) = cx.catalog().duplicate_key_names(index.conglom);
                return Err(ConstraintViolation::DuplicateKey { constraint, table }.into());
            }
            // Checked again when the constraint is validated.
            cc.insert_unchecked(&entry)?;
            let key = Row::from(entry.prefix(index.generator.key_cols()).to_vec());
            log::debug!("DEFERRED DUPLICATE: index = {}, key = {key}", index.conglom);
            cx.deferred_memory().remember_duplicate(index.conglom, key);
        }
        Ok(())
    }

    /// Deletes the entry of `base` at `loc`. A missing entry is logged and ignored.
    pub fn delete(&mut self, cx: &mut Activation<'_>, base: &Row, loc: RowLocation) -> Result<()> {
        let entry = self.index.generator.index_row(base, loc);
        let range = ScanRange::exact(entry.clone());
        let scan = match &mut self.scan {
            Some(scan) => {
                scan.reopen(range, Qualifiers::none())?;
                scan
            }
            None => {
                let spec = ScanSpec::range(range).for_update().with_isolation(cx.isolation());
                self.scan.insert(cx.tc().open_scan(self.index.conglom, spec)?)
            }
        };
        if scan.next()?.is_some() && scan.delete_current()? {
            return Ok(());
        }
        log::warn!(
            "INDEX ENTRY MISSING ON DELETE: index = {}, entry = {entry}",
            self.index.name
        );
        Ok(())
    }

    /// Moves the entry of a row whose key changed from `old` to `new`.
    ///
    /// For a unique index only the old entry is deleted here; the new one
    /// is returned for the caller to insert after all deletes.
    pub fn update(&mut self, cx: &mut Activation<'_>, old: &Row, new: &Row, loc: RowLocation) -> Result<Option<Row>> {
        if !self.index.generator.key_changed(old, new) {
            return Ok(None);
        }
        self.delete(cx, old, loc)?;
        if self.is_unique() {
            return Ok(Some(self.index.generator.index_row(new, loc)));
        }
        self.insert(cx, new, loc)?;
        Ok(None)
    }

    pub fn close(&mut self) {
        if let Some(mut scan) = self.scan.take() {
            scan.close();
        }
        if let Some(mut cc) = self.cc.take() {
            cc.close();
        }
    }
}

/// The index changers of every index of one table.
///
/// Unique index entries held back by updates are buffered in one
/// temporary row holder, each prefixed by the position of its changer,
/// and inserted by [`IndexSetChanger::finish`].
pub struct IndexSetChanger {
    changers: Vec<IndexChanger>,
    /// Which changers an update maintains, all when `None`.
    fix_on_update: Option<Vec<bool>>,
    deferred_inserts: Option<RowHolderRef>,
}

impl IndexSetChanger {
    pub fn open(cx: &Activation<'_>, indexes: &[ConglomId], lock: LockMode) -> Result<Self> {
        let changers = indexes
            .iter()
            .map(|conglom| {
                cx.catalog()
                    .index(*conglom)
                    .map(|ix| IndexChanger::new(ix, lock))
                    .ok_or_else(|| ExecError::internal(format!("unknown index {conglom}")))
            })
            .collect::<Result<_>>()?;
        Ok(Self {
            changers,
            fix_on_update: None,
            deferred_inserts: None,
        })
    }

    pub fn with_fix_on_update(mut self, fix: Vec<bool>) -> Self {
        self.fix_on_update = Some(fix);
        self
    }

    /// Buffers deferred unique inserts in `holder` instead of a holder of its own.
    pub fn with_row_holder(mut self, holder: RowHolderRef) -> Self {
        self.deferred_inserts = Some(holder);
        self
    }

    pub fn len(&self) -> usize {
        self.changers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changers.is_empty()
    }

    pub fn insert(&mut self, cx: &mut Activation<'_>, base: &Row, loc: RowLocation) -> Result<()> {
        self.changers.iter_mut().try_for_each(|c| c.insert(cx, base, loc))
    }

    pub fn delete(&mut self, cx: &mut Activation<'_>, base: &Row, loc: RowLocation) -> Result<()> {
        self.changers.iter_mut().try_for_each(|c| c.delete(cx, base, loc))
    }

    pub fn update(&mut self, cx: &mut Activation<'_>, old: &Row, new: &Row, loc: RowLocation) -> Result<()> {
        for (i, changer) in self.changers.iter_mut().enumerate() {
            let fix = self.fix_on_update.as_ref().is_none_or(|fix| fix.get(i).copied().unwrap_or(false));
            if !fix {
                continue;
            }
            let Some(entry) = changer.update(cx, old, new, loc)? else {
                continue;
            };
            let holder = match &self.deferred_inserts {
                Some(holder) => Rc::clone(holder),
                None => {
                    let holder = TemporaryRowHolder::for_activation(cx).into_ref();
                    self.deferred_inserts = Some(Rc::clone(&holder));
                    holder
                }
            };
            let mut tagged = Vec::with_capacity(entry.len() + 1);
            tagged.push(Value::I64(i as i64));
            tagged.extend(entry.elements);
            holder.borrow_mut().insert(cx, Row::new(tagged))?;
        }
        Ok(())
    }

    /// Inserts the unique index entries held back by [`IndexSetChanger::update`].
    pub fn finish(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let Some(holder) = self.deferred_inserts.clone() else {
            return Ok(());
        };
        let mut holder = holder.borrow_mut();
        if holder.is_empty() {
            return Ok(());
        }
        log::trace!("FLUSHING DEFERRED INDEX INSERTS: rows = {}", holder.row_count());
        let changers = &mut self.changers;
        holder.for_each_row(cx, |cx, mut tagged| {
            let changer = match tagged.elements.first() {
                Some(Value::I64(i)) => usize::try_from(*i).ok().and_then(|i| changers.get_mut(i)),
                _ => None,
            };
            let Some(changer) = changer else {
                return Err(ExecError::internal("corrupt deferred index insert"));
            };
            tagged.elements.remove(0);
            changer.insert_entry(cx, tagged)
        })?;
        holder.truncate(cx)
    }

    /// Closes every changer and drops the rows still buffered.
    pub fn close(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        self.changers.iter_mut().for_each(IndexChanger::close);
        match self.deferred_inserts.take() {
            Some(holder) => holder.borrow_mut().truncate(cx),
            None => Ok(()),
        }
    }
}
