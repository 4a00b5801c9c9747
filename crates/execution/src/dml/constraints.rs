//! Per row constraint checks of DML statements.

use std::sync::Arc;

use quarry_datastore::{ScanRange, ScanSpec};
use quarry_lib::{ConglomId, ConstraintId, Row, RowLocation};

use crate::activation::Activation;
use crate::catalog::{ConstraintDescriptor, ConstraintKind, IndexRowGenerator, ReferentialAction};
use crate::error::{ConstraintViolation, ExecError, Result};

/// The check constraints of one table.
pub struct CheckConstraints {
    heap: ConglomId,
    checks: Vec<Arc<ConstraintDescriptor>>,
}

impl CheckConstraints {
    pub fn load(cx: &Activation<'_>, heap: ConglomId) -> Self {
        Self {
            heap,
            checks: cx.catalog().check_constraints(heap),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Evaluates every check against `row`.
    ///
    /// A violated immediate check fails. A violated deferred check is
    /// returned, to be remembered with the row location once it is known.
    /// Unknown satisfies a check.
    pub fn evaluate(&self, cx: &Activation<'_>, row: &Row) -> Result<Vec<ConstraintId>> {
        let mut culprits = Vec::new();
        for cd in &self.checks {
            let ConstraintKind::Check { expr, text } = &cd.kind else {
                continue;
            };
            if expr.eval_bool(row, cx)? != Some(false) {
                continue;
            }
            if cx.is_deferred(cd.id) {
                culprits.push(cd.id);
                continue;
            }
            return Err(ConstraintViolation::CheckViolation {
                constraint: cd.name.clone(),
                table: cx.catalog().table_name(self.heap),
                text: text.clone(),
            }
            .into());
        }
        Ok(culprits)
    }

    pub fn remember(&self, cx: &mut Activation<'_>, culprits: &[ConstraintId], loc: RowLocation) {
        if culprits.is_empty() {
            return;
        }
        log::debug!("DEFERRED CHECK VIOLATION: table = {}, location = {loc}", self.heap);
        cx.deferred_memory().remember_check_violations(self.heap, culprits, loc);
    }
}

struct ReferencingKey {
    constraint: Arc<ConstraintDescriptor>,
    /// The index on the referencing columns.
    fk_index: ConglomId,
    referenced_index: ConglomId,
    /// Extracts the referenced key from a row of the referenced table.
    generator: IndexRowGenerator,
    on_delete: ReferentialAction,
}

/// Checks that rows deleted from a referenced table leave no referencing row behind.
pub struct ReferencedKeyChecker {
    keys: Vec<ReferencingKey>,
}

impl ReferencedKeyChecker {
    pub fn load(cx: &Activation<'_>, heap: ConglomId) -> Result<Self> {
        let catalog = cx.catalog();
        let keys = catalog
            .referencing_foreign_keys(heap)
            .into_iter()
            .filter_map(|cd| match cd.kind {
                ConstraintKind::ForeignKey {
                    index,
                    referenced_index,
                    on_delete,
                } => Some((cd, index, referenced_index, on_delete)),
                _ => None,
            })
            .map(|(constraint, fk_index, referenced_index, on_delete)| {
                let generator = catalog
                    .index(referenced_index)
                    .map(|ix| ix.generator.clone())
                    .ok_or_else(|| ExecError::internal(format!("unknown index {referenced_index}")))?;
                Ok(ReferencingKey {
                    constraint,
                    fk_index,
                    referenced_index,
                    generator,
                    on_delete,
                })
            })
            .collect::<Result<_>>()?;
        Ok(Self { keys })
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Fails if a referencing row still holds the key of the deleted `row`.
    ///
    /// With `restrict_only` only `ON DELETE RESTRICT` keys are checked; this
    /// runs before any row is deleted. A deferred key that is still
    /// referenced is remembered instead of failing.
    pub fn check(&self, cx: &mut Activation<'_>, row: &Row, restrict_only: bool) -> Result<()> {
        for key in &self.keys {
            if restrict_only && key.on_delete != ReferentialAction::Restrict {
                continue;
            }
            let value = key.generator.key(row);
            if value.has_null() || !Self::referenced(cx, key.fk_index, &value)? {
                continue;
            }
            if key.on_delete == ReferentialAction::NoAction && cx.is_deferred(key.constraint.id) {
                cx.deferred_memory()
                    .remember_foreign_key(key.fk_index, key.constraint.id, key.referenced_index, value);
                continue;
            }
            return Err(ConstraintViolation::ForeignKeyRestrict {
                constraint: key.constraint.name.clone(),
                table: cx.catalog().table_name(row_table(cx, key.referenced_index)),
            }
            .into());
        }
        Ok(())
    }

    fn referenced(cx: &mut Activation<'_>, fk_index: ConglomId, key: &Row) -> Result<bool> {
        let spec = ScanSpec::range(ScanRange::exact(key.clone())).with_isolation(cx.isolation());
        let mut scan = cx.tc().open_scan(fk_index, spec)?;
        let found = scan.next()?.is_some();
        scan.close();
        Ok(found)
    }
}

fn row_table(cx: &Activation<'_>, index: ConglomId) -> ConglomId {
    cx.catalog().index(index).map_or(index, |ix| ix.table)
}
