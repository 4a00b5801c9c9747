//! The slice of the data dictionary the engine consumes.
//!
//! Descriptors are only used to name things in errors, to find the indexes
//! a mutation must maintain and to find the constraints it must check.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use quarry_datastore::{ConglomerateKind, IsolationLevel, LockMode, OpenMode, ScanSpec, TransactionController};
use quarry_expr::Expr;
use quarry_lib::{ColId, ConglomId, ConstraintId, Row, RowLocation};

use crate::Result;

/// Maps a base row and its location to the row of one index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRowGenerator {
    /// The base columns making up the key, in key order.
    pub base_cols: Vec<ColId>,
    pub unique: bool,
}

impl IndexRowGenerator {
    pub fn new(base_cols: &[u32], unique: bool) -> Self {
        Self {
            base_cols: base_cols.iter().copied().map(ColId).collect(),
            unique,
        }
    }

    pub fn key_cols(&self) -> usize {
        self.base_cols.len()
    }

    /// The key of `base`, without the row location.
    pub fn key(&self, base: &Row) -> Row {
        base.project(&self.base_cols)
    }

    pub fn index_row(&self, base: &Row, loc: RowLocation) -> Row {
        self.key(base).with_location(loc)
    }

    /// Did an update from `old` to `new` change any key column?
    /// Columns are compared exactly, so a null replacing a null is no change.
    pub fn key_changed(&self, old: &Row, new: &Row) -> bool {
        self.base_cols.iter().any(|c| old.get(*c) != new.get(*c))
    }

    /// Is column `col` of the base row part of the key?
    pub fn covers(&self, col: ColId) -> bool {
        self.base_cols.contains(&col)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    pub name: String,
    pub schema: String,
    pub heap: ConglomId,
    pub columns: usize,
    pub indexes: Vec<ConglomId>,
    pub constraints: Vec<ConstraintId>,
}

impl TableDescriptor {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDescriptor {
    pub name: String,
    pub conglom: ConglomId,
    /// The heap of the indexed table.
    pub table: ConglomId,
    pub generator: IndexRowGenerator,
    /// The constraint this index backs, if any.
    pub constraint: Option<ConstraintId>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ReferentialAction {
    NoAction,
    Restrict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintKind {
    PrimaryKey { index: ConglomId },
    Unique { index: ConglomId },
    Check { expr: Expr, text: String },
    ForeignKey {
        /// The index on the referencing columns.
        index: ConglomId,
        /// The unique index of the referenced key.
        referenced_index: ConglomId,
        on_delete: ReferentialAction,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintDescriptor {
    pub id: ConstraintId,
    pub name: String,
    /// The heap of the constrained table.
    pub table: ConglomId,
    pub kind: ConstraintKind,
    pub deferrable: bool,
    pub initially_deferred: bool,
}

impl ConstraintDescriptor {
    /// The index backing a unique, primary key or foreign key constraint.
    pub fn index(&self) -> Option<ConglomId> {
        match &self.kind {
            ConstraintKind::PrimaryKey { index }
            | ConstraintKind::Unique { index }
            | ConstraintKind::ForeignKey { index, .. } => Some(*index),
            ConstraintKind::Check { .. } => None,
        }
    }
}

pub trait Catalog {
    fn table(&self, heap: ConglomId) -> Option<Arc<TableDescriptor>>;

    fn index(&self, conglom: ConglomId) -> Option<Arc<IndexDescriptor>>;

    fn constraint(&self, id: ConstraintId) -> Option<Arc<ConstraintDescriptor>>;

    /// Foreign keys whose referenced index belongs to the table of `heap`.
    fn referencing_foreign_keys(&self, heap: ConglomId) -> Vec<Arc<ConstraintDescriptor>>;

    /// Names the constraint or index and the table, for a duplicate key error.
    fn duplicate_key_names(&self, index: ConglomId) -> (String, String) {
        let Some(ix) = self.index(index) else {
            return (index.to_string(), String::from("?"));
        };
        let name = ix
            .constraint
            .and_then(|c| self.constraint(c))
            .map_or_else(|| ix.name.clone(), |c| c.name.clone());
        (name, self.table_name(ix.table))
    }

    fn table_name(&self, heap: ConglomId) -> String {
        self.table(heap).map_or_else(|| heap.to_string(), |t| t.name.clone())
    }

    /// The check constraints of the table of `heap`.
    fn check_constraints(&self, heap: ConglomId) -> Vec<Arc<ConstraintDescriptor>> {
        self.table(heap)
            .map(|t| {
                t.constraints
                    .iter()
                    .filter_map(|c| self.constraint(*c))
                    .filter(|c| matches!(c.kind, ConstraintKind::Check { .. }))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Default)]
struct Inner {
    tables: HashMap<ConglomId, Arc<TableDescriptor>>,
    indexes: HashMap<ConglomId, Arc<IndexDescriptor>>,
    constraints: HashMap<ConstraintId, Arc<ConstraintDescriptor>>,
    next_constraint: u32,
}

/// A catalog held in memory, which also creates the conglomerates it describes.
#[derive(Default)]
pub struct MemCatalog {
    inner: RwLock<Inner>,
}

impl Catalog for MemCatalog {
    fn table(&self, heap: ConglomId) -> Option<Arc<TableDescriptor>> {
        self.inner.read().tables.get(&heap).cloned()
    }

    fn index(&self, conglom: ConglomId) -> Option<Arc<IndexDescriptor>> {
        self.inner.read().indexes.get(&conglom).cloned()
    }

    fn constraint(&self, id: ConstraintId) -> Option<Arc<ConstraintDescriptor>> {
        self.inner.read().constraints.get(&id).cloned()
    }

    fn referencing_foreign_keys(&self, heap: ConglomId) -> Vec<Arc<ConstraintDescriptor>> {
        let inner = self.inner.read();
        let mut fks: Vec<_> = inner
            .constraints
            .values()
            .filter(|c| match &c.kind {
                ConstraintKind::ForeignKey { referenced_index, .. } => {
                    inner.indexes.get(referenced_index).is_some_and(|ix| ix.table == heap)
                }
                _ => false,
            })
            .cloned()
            .collect();
        fks.sort_by_key(|c| c.id);
        fks
    }
}

impl MemCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the heap of a new table of `columns` columns.
    pub fn create_table(&self, tc: &mut dyn TransactionController, name: &str, columns: usize) -> Result<ConglomId> {
        let heap = tc.create_conglomerate(ConglomerateKind::Heap, false)?;
        let table = TableDescriptor {
            name: name.to_owned(),
            schema: String::from("APP"),
            heap,
            columns,
            indexes: Vec::new(),
            constraints: Vec::new(),
        };
        self.inner.write().tables.insert(heap, Arc::new(table));
        Ok(heap)
    }

    /// Creates an index on `cols` of the table of `heap`, loading the rows it already has.
    pub fn create_index(
        &self,
        tc: &mut dyn TransactionController,
        heap: ConglomId,
        name: &str,
        cols: &[u32],
        unique: bool,
    ) -> Result<ConglomId> {
        self.create_index_for(tc, heap, name, IndexRowGenerator::new(cols, unique), None)
    }

    fn create_index_for(
        &self,
        tc: &mut dyn TransactionController,
        heap: ConglomId,
        name: &str,
        generator: IndexRowGenerator,
        constraint: Option<ConstraintId>,
    ) -> Result<ConglomId> {
        let kind = ConglomerateKind::BTree {
            key_cols: generator.key_cols(),
            unique: generator.unique,
        };
        let conglom = tc.create_conglomerate(kind, false)?;
        let mut scan = tc.open_scan(heap, ScanSpec::full())?;
        let mut cc = tc.open_conglomerate(conglom, OpenMode::ForUpdate, LockMode::Table, IsolationLevel::Serializable)?;
        while let Some(row) = scan.next()? {
            cc.insert_unchecked(&generator.index_row(&row, scan.row_location()?))?;
        }
        scan.close();
        cc.close();

        let index = IndexDescriptor {
            name: name.to_owned(),
            conglom,
            table: heap,
            generator,
            constraint,
        };
        let mut inner = self.inner.write();
        inner.indexes.insert(conglom, Arc::new(index));
        if let Some(table) = inner.tables.get_mut(&heap) {
            Arc::make_mut(table).indexes.push(conglom);
        }
        Ok(conglom)
    }

    fn add_constraint(&self, make: impl FnOnce(ConstraintId) -> ConstraintDescriptor) -> ConstraintId {
        let mut inner = self.inner.write();
        let id = ConstraintId(inner.next_constraint);
        inner.next_constraint += 1;
        let constraint = make(id);
        if let Some(table) = inner.tables.get_mut(&constraint.table) {
            Arc::make_mut(table).constraints.push(id);
        }
        inner.constraints.insert(id, Arc::new(constraint));
        id
    }

    fn link_index(&self, index: ConglomId, constraint: ConstraintId) {
        let mut inner = self.inner.write();
        if let Some(ix) = inner.indexes.get_mut(&index) {
            Arc::make_mut(ix).constraint = Some(constraint);
        }
    }

    /// Adds a unique or primary key constraint on `cols`, with its backing unique index.
    #[allow(clippy::too_many_arguments)]
    pub fn add_unique(
        &self,
        tc: &mut dyn TransactionController,
        heap: ConglomId,
        name: &str,
        cols: &[u32],
        primary_key: bool,
        deferrable: bool,
        initially_deferred: bool,
    ) -> Result<(ConstraintId, ConglomId)> {
        let index = self.create_index_for(tc, heap, &format!("SQL_{name}"), IndexRowGenerator::new(cols, true), None)?;
        let kind = if primary_key {
            ConstraintKind::PrimaryKey { index }
        } else {
            ConstraintKind::Unique { index }
        };
        let id = self.add_constraint(|id| ConstraintDescriptor {
            id,
            name: name.to_owned(),
            table: heap,
            kind,
            deferrable,
            initially_deferred,
        });
        self.link_index(index, id);
        Ok((id, index))
    }

    pub fn add_check(
        &self,
        heap: ConglomId,
        name: &str,
        expr: Expr,
        deferrable: bool,
        initially_deferred: bool,
    ) -> ConstraintId {
        let text = expr.to_string();
        self.add_constraint(|id| ConstraintDescriptor {
            id,
            name: name.to_owned(),
            table: heap,
            kind: ConstraintKind::Check { expr, text },
            deferrable,
            initially_deferred,
        })
    }

    /// Adds a foreign key on `cols` of the table of `heap` referencing the
    /// unique index `referenced_index`, with its backing non-unique index.
    #[allow(clippy::too_many_arguments)]
    pub fn add_foreign_key(
        &self,
        tc: &mut dyn TransactionController,
        heap: ConglomId,
        name: &str,
        cols: &[u32],
        referenced_index: ConglomId,
        on_delete: ReferentialAction,
        deferrable: bool,
        initially_deferred: bool,
    ) -> Result<(ConstraintId, ConglomId)> {
        let index = self.create_index_for(tc, heap, &format!("SQL_{name}"), IndexRowGenerator::new(cols, false), None)?;
        let id = self.add_constraint(|id| ConstraintDescriptor {
            id,
            name: name.to_owned(),
            table: heap,
            kind: ConstraintKind::ForeignKey {
                index,
                referenced_index,
                on_delete,
            },
            deferrable,
            initially_deferred,
        });
        self.link_index(index, id);
        Ok((id, index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_datastore::MemStore;
    use quarry_lib::row;

    #[test]
    fn indexes_are_loaded_and_named_by_constraint() {
        let mut store = MemStore::new();
        let catalog = MemCatalog::new();
        let heap = catalog.create_table(&mut store, "T", 2).unwrap();
        let mut cc = store
            .open_conglomerate(heap, OpenMode::ForUpdate, LockMode::Record, IsolationLevel::ReadCommitted)
            .unwrap();
        cc.insert(&row![1, "a"]).unwrap();
        cc.insert(&row![2, "b"]).unwrap();

        let (pk, index) = catalog.add_unique(&mut store, heap, "T_PK", &[0], true, false, false).unwrap();
        assert_eq!(store.rows(index).unwrap().len(), 2);
        assert_eq!(catalog.duplicate_key_names(index), (String::from("T_PK"), String::from("T")));
        assert_eq!(catalog.table(heap).unwrap().indexes, vec![index]);
        assert_eq!(catalog.constraint(pk).unwrap().index(), Some(index));

        let plain = catalog.create_index(&mut store, heap, "T_B", &[1], false).unwrap();
        assert_eq!(catalog.duplicate_key_names(plain).0, "T_B");
    }

    #[test]
    fn finds_referencing_foreign_keys() {
        let mut store = MemStore::new();
        let catalog = MemCatalog::new();
        let parent = catalog.create_table(&mut store, "P", 1).unwrap();
        let child = catalog.create_table(&mut store, "C", 2).unwrap();
        let (_, pk) = catalog.add_unique(&mut store, parent, "P_PK", &[0], true, false, false).unwrap();
        let (fk, _) = catalog
            .add_foreign_key(&mut store, child, "C_FK", &[1], pk, ReferentialAction::Restrict, false, false)
            .unwrap();
        let fks = catalog.referencing_foreign_keys(parent);
        assert_eq!(fks.iter().map(|c| c.id).collect::<Vec<_>>(), vec![fk]);
        assert!(catalog.referencing_foreign_keys(child).is_empty());
        assert!(catalog.check_constraints(child).is_empty());
    }
}
