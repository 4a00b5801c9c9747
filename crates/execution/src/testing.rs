//! Fixtures for driving plans against the in-memory store.

use std::sync::Arc;

use quarry_datastore::{IsolationLevel, LockMode, MemStore, OpenMode, TransactionController};
use quarry_lib::{ConglomId, Row};

use crate::activation::Activation;
use crate::catalog::MemCatalog;
use crate::config::ExecConfig;
use crate::session::Session;

/// A session over a fresh [`MemStore`] and [`MemCatalog`].
///
/// `store` shares its state with the session's transaction controller,
/// so it can be used to set up data and to inspect counters.
pub struct TestDb {
    pub store: MemStore,
    pub catalog: Arc<MemCatalog>,
    pub session: Session,
}

impl Default for TestDb {
    fn default() -> Self {
        Self::new()
    }
}

impl TestDb {
    pub fn new() -> Self {
        Self::with_config(ExecConfig::default())
    }

    pub fn with_config(config: ExecConfig) -> Self {
        let store = MemStore::new();
        let catalog = Arc::new(MemCatalog::new());
        let session = Session::new(Box::new(store.clone()), catalog.clone(), config);
        Self { store, catalog, session }
    }

    pub fn activation(&mut self) -> Activation<'_> {
        self.session.activation()
    }

    /// Creates a table and fills it with `rows`.
    pub fn table(&mut self, name: &str, columns: usize, rows: &[Row]) -> ConglomId {
        let heap = self
            .catalog
            .create_table(&mut self.store, name, columns)
            .expect("create table");
        self.insert(heap, rows);
        heap
    }

    /// Inserts into the heap only, bypassing index maintenance.
    pub fn insert(&mut self, heap: ConglomId, rows: &[Row]) {
        let mut cc = self
            .store
            .open_conglomerate(heap, OpenMode::ForUpdate, LockMode::Record, IsolationLevel::ReadCommitted)
            .expect("open heap");
        for row in rows {
            cc.insert_unchecked(row).expect("insert");
        }
        cc.close();
    }

    pub fn index(&mut self, heap: ConglomId, name: &str, cols: &[u32], unique: bool) -> ConglomId {
        self.catalog
            .create_index(&mut self.store, heap, name, cols, unique)
            .expect("create index")
    }

    pub fn rows(&self, conglom: ConglomId) -> Vec<Row> {
        self.store.rows(conglom).expect("rows")
    }

    /// The rows of a heap without their storage order, sorted.
    pub fn sorted_rows(&self, conglom: ConglomId) -> Vec<Row> {
        let mut rows = self.rows(conglom);
        rows.sort();
        rows
    }
}
