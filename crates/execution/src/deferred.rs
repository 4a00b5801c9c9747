//! Violations of deferred constraints, remembered until validation.
//!
//! Entries are keyed by conglomerate: the supporting index of a unique,
//! primary key or foreign key constraint, or the heap of a table with
//! check constraints. They live for one transaction.

use indexmap::{IndexMap, IndexSet};
use quarry_datastore::{ScanRange, ScanSpec};
use quarry_expr::Expr;
use quarry_lib::{ConglomId, ConstraintId, ResultSetNumber, Row, RowLocation};

use crate::activation::Activation;
use crate::catalog::ConstraintKind;
use crate::error::{ConstraintViolation, ExecError, Result};
use crate::hash_table::HashTable;
use crate::project_restrict::ProjectRestrictResultSet;
use crate::result_set::{ResultSet, TopResultSet};
use crate::scan::{ScanParams, TableScanResultSet, ValidateCheckResultSet};

/// Keys of a deferrable unique or primary key constraint that were
/// inserted while another row held them.
#[derive(Debug, Clone)]
pub struct UniquePkInfo {
    keys: HashTable,
}

/// Rows of one table that may violate some of its deferred check constraints.
#[derive(Debug, Clone)]
pub struct CheckInfo {
    culprits: Vec<ConstraintId>,
    locations: IndexSet<RowLocation>,
    /// The table was compressed or truncated since the locations were
    /// remembered, so the whole table must be checked.
    locations_invalid: bool,
}

/// Keys of a deferrable foreign key that may be left without a referenced key.
#[derive(Debug, Clone)]
pub struct ForeignKeyInfo {
    pub constraint: ConstraintId,
    pub referenced_index: ConglomId,
    keys: HashTable,
}

#[derive(Debug, Clone)]
pub enum ValidationInfo {
    UniquePk(UniquePkInfo),
    Check(CheckInfo),
    ForeignKey(ForeignKeyInfo),
}

fn key_table(width: usize) -> HashTable {
    HashTable::keyed_on_all(width, 16)
}

impl UniquePkInfo {
    pub fn keys(&self) -> impl Iterator<Item = &Row> {
        self.keys.rows()
    }
}

impl CheckInfo {
    pub fn culprits(&self) -> &[ConstraintId] {
        &self.culprits
    }

    pub fn forget_culprit(&mut self, id: ConstraintId) {
        self.culprits.retain(|c| *c != id);
    }

    pub fn locations(&self) -> impl Iterator<Item = &RowLocation> {
        self.locations.iter()
    }

    pub fn locations_invalid(&self) -> bool {
        self.locations_invalid
    }
}

impl ForeignKeyInfo {
    pub fn keys(&self) -> impl Iterator<Item = &Row> {
        self.keys.rows()
    }
}

impl ValidationInfo {
    /// Adds the remembered state of `other`, of the same kind, to `self`.
    fn absorb(&mut self, other: ValidationInfo) {
        match (self, other) {
            (Self::UniquePk(into), Self::UniquePk(from)) => {
                for key in from.keys.rows() {
                    into.keys.put_row(key.clone());
                }
            }
            (Self::ForeignKey(into), Self::ForeignKey(from)) => {
                for key in from.keys.rows() {
                    into.keys.put_row(key.clone());
                }
            }
            (Self::Check(into), Self::Check(from)) => {
                for culprit in from.culprits {
                    if !into.culprits.contains(&culprit) {
                        into.culprits.push(culprit);
                    }
                }
                into.locations.extend(from.locations);
                into.locations_invalid |= from.locations_invalid;
            }
            (into, from) => {
                debug_assert!(false, "cannot merge {from:?} into {into:?}");
                log::error!("DEFERRED CONSTRAINT MEMORY CONFLICT: kept {into:?}, dropped {from:?}");
            }
        }
    }

    /// Checks the remembered rows of the conglomerate `key`.
    ///
    /// `only` restricts a check validation to one constraint. `rollback`
    /// selects the transaction aborting error variant.
    pub fn validate(
        &self,
        key: ConglomId,
        only: Option<ConstraintId>,
        cx: &mut Activation<'_>,
        rollback: bool,
    ) -> Result<()> {
        match self {
            Self::UniquePk(info) => validate_unique_pk(key, info, cx, rollback),
            Self::Check(info) => validate_check(key, info, only, cx, rollback),
            Self::ForeignKey(info) => validate_foreign_key(key, info, cx, rollback),
        }
    }
}

/// Counts the rows of `index` whose key is `key`, stopping at `limit`.
fn count_key(cx: &mut Activation<'_>, index: ConglomId, key: &Row, limit: usize) -> Result<usize> {
    let spec = ScanSpec::range(ScanRange::exact(key.clone())).with_isolation(cx.isolation());
    let mut scan = cx.tc().open_scan(index, spec)?;
    let mut found = 0;
    while found < limit && scan.next()?.is_some() {
        found += 1;
    }
    scan.close();
    Ok(found)
}

fn validate_unique_pk(index: ConglomId, info: &UniquePkInfo, cx: &mut Activation<'_>, rollback: bool) -> Result<()> {
    for key in info.keys() {
        if key.has_null() {
            continue;
        }
        // None left means the row was deleted later in the transaction.
        if count_key(cx, index, key, 2)? > 1 {
            let (constraint, table) = cx.catalog().duplicate_key_names(index);
            return Err(ConstraintViolation::DeferredDuplicateKey {
                constraint,
                table,
                rollback,
            }
            .into());
        }
    }
    Ok(())
}

fn validate_check(
    heap: ConglomId,
    info: &CheckInfo,
    only: Option<ConstraintId>,
    cx: &mut Activation<'_>,
    rollback: bool,
) -> Result<()> {
    for culprit in info.culprits.iter().filter(|c| only.is_none_or(|only| only == **c)) {
        let Some(cd) = cx.catalog().constraint(*culprit) else {
            continue;
        };
        let ConstraintKind::Check { expr, text } = &cd.kind else {
            continue;
        };
        let source: Box<dyn ResultSet> = if info.locations_invalid {
            Box::new(TableScanResultSet::new(ResultSetNumber(1), ScanParams::new(heap)))
        } else {
            let locations = info.locations.iter().copied().collect();
            Box::new(ValidateCheckResultSet::new(ResultSetNumber(1), heap, locations))
        };
        let violations =
            ProjectRestrictResultSet::new(ResultSetNumber(0), source).with_restriction(Expr::not(expr.clone()));
        let mut top = TopResultSet::new(Box::new(violations));
        top.open(cx)?;
        let violated = top.next_row(cx)?.is_some();
        top.close(cx)?;
        if violated {
            return Err(ConstraintViolation::DeferredCheckViolation {
                constraint: cd.name.clone(),
                table: cx.catalog().table_name(heap),
                text: text.clone(),
                rollback,
            }
            .into());
        }
    }
    Ok(())
}

fn validate_foreign_key(
    fk_index: ConglomId,
    info: &ForeignKeyInfo,
    cx: &mut Activation<'_>,
    rollback: bool,
) -> Result<()> {
    for key in info.keys() {
        if key.has_null() {
            continue;
        }
        // The referencing row is gone, or no longer has this key.
        if count_key(cx, fk_index, key, 1)? == 0 {
            continue;
        }
        if count_key(cx, info.referenced_index, key, 1)? == 0 {
            let catalog = cx.catalog();
            let cd = catalog
                .constraint(info.constraint)
                .ok_or_else(|| ExecError::internal(format!("unknown constraint {}", info.constraint)))?;
            return Err(ConstraintViolation::DeferredForeignKey {
                constraint: cd.name.clone(),
                table: catalog.table_name(cd.table),
                rollback,
            }
            .into());
        }
    }
    Ok(())
}

/// The deferred constraint violations of one transaction.
#[derive(Debug, Default)]
pub struct DeferredConstraintsMemory {
    entries: IndexMap<ConglomId, ValidationInfo>,
}

impl DeferredConstraintsMemory {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, conglom: ConglomId) -> Option<&ValidationInfo> {
        self.entries.get(&conglom)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Remembers that `key` was inserted into the unique index `index`
    /// while another row held it.
    ///
    /// `index` may be [`ConglomId::UNDEFINED`] while the index is being
    /// built, see [`Self::associate_duplicates_with_conglomerate`].
    pub fn remember_duplicate(&mut self, index: ConglomId, key: Row) {
        let info = self.entries.entry(index).or_insert_with(|| {
            log::debug!("DEFERRED DUPLICATE REMEMBERED: index = {index}");
            ValidationInfo::UniquePk(UniquePkInfo {
                keys: key_table(key.len()),
            })
        });
        match info {
            ValidationInfo::UniquePk(info) => {
                info.keys.put_row(key);
            }
            other => log::error!("DEFERRED CONSTRAINT MEMORY CONFLICT: index = {index}, found {other:?}"),
        }
    }

    /// Remembers that the row at `loc` of the table of `heap` may violate
    /// the check constraints `culprits`.
    pub fn remember_check_violations(&mut self, heap: ConglomId, culprits: &[ConstraintId], loc: RowLocation) {
        let info = self.entries.entry(heap).or_insert_with(|| {
            ValidationInfo::Check(CheckInfo {
                culprits: Vec::new(),
                locations: IndexSet::new(),
                locations_invalid: false,
            })
        });
        match info {
            ValidationInfo::Check(info) => {
                for culprit in culprits {
                    if !info.culprits.contains(culprit) {
                        info.culprits.push(*culprit);
                    }
                }
                info.locations.insert(loc);
            }
            other => log::error!("DEFERRED CONSTRAINT MEMORY CONFLICT: heap = {heap}, found {other:?}"),
        }
    }

    /// Remembers that `key` of the foreign key supported by `fk_index` may
    /// have lost its referenced key.
    pub fn remember_foreign_key(
        &mut self,
        fk_index: ConglomId,
        constraint: ConstraintId,
        referenced_index: ConglomId,
        key: Row,
    ) {
        let info = self.entries.entry(fk_index).or_insert_with(|| {
            ValidationInfo::ForeignKey(ForeignKeyInfo {
                constraint,
                referenced_index,
                keys: key_table(key.len()),
            })
        });
        match info {
            ValidationInfo::ForeignKey(info) => {
                info.keys.put_row(key);
            }
            other => log::error!("DEFERRED CONSTRAINT MEMORY CONFLICT: index = {fk_index}, found {other:?}"),
        }
    }

    /// Gives the duplicates remembered before the supporting index had an
    /// id to the index `index`.
    pub fn associate_duplicates_with_conglomerate(&mut self, index: ConglomId) {
        if let Some(info) = self.entries.shift_remove(&ConglomId::UNDEFINED) {
            self.restore(index, info);
        }
    }

    /// Retargets the memory of indexes re-created under new ids.
    ///
    /// When the table was truncated the remembered keys are gone with its
    /// rows and are dropped instead.
    pub fn update_index_cids(&mut self, truncate: bool, old: &[ConglomId], new: &[ConglomId]) {
        debug_assert_eq!(old.len(), new.len());
        for (old, new) in old.iter().zip(new) {
            if let Some(info) = self.entries.shift_remove(old) {
                if truncate {
                    log::debug!("DEFERRED MEMORY DROPPED: index = {old}");
                } else {
                    self.restore(*new, info);
                }
            }
            for info in self.entries.values_mut() {
                if let ValidationInfo::ForeignKey(fk) = info {
                    if fk.referenced_index == *old {
                        fk.referenced_index = *new;
                    }
                }
            }
        }
    }

    /// The rows of the table of `heap` moved, so remembered check
    /// violations must be validated against the whole table.
    pub fn compress_or_truncate(&mut self, heap: ConglomId) {
        if let Some(ValidationInfo::Check(info)) = self.entries.get_mut(&heap) {
            info.locations.clear();
            info.locations_invalid = true;
        }
    }

    /// Removes and returns the entries selected by `select`.
    pub fn take_matching(&mut self, select: impl Fn(ConglomId, &ValidationInfo) -> bool) -> Vec<(ConglomId, ValidationInfo)> {
        let keys: Vec<ConglomId> = self
            .entries
            .iter()
            .filter(|(key, info)| select(**key, info))
            .map(|(key, _)| *key)
            .collect();
        keys.into_iter()
            .filter_map(|key| self.entries.shift_remove(&key).map(|info| (key, info)))
            .collect()
    }

    /// Puts back an entry taken by [`Self::take_matching`], merging it with
    /// what was remembered since.
    pub fn restore(&mut self, key: ConglomId, info: ValidationInfo) {
        match self.entries.get_mut(&key) {
            Some(existing) => existing.absorb(info),
            None => {
                self.entries.insert(key, info);
            }
        }
    }
}
