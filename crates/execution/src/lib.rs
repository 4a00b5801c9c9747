//! An iterator based query execution engine.
//!
//! A plan is a tree of [`ResultSet`]s. The root is driven through a
//! [`TopResultSet`], which opens the tree, pulls rows from it one at a time
//! and closes it. Every execution runs in an [`Activation`] borrowed from a
//! [`Session`], which owns the transaction controller of the store, the
//! catalog and the deferred constraint memory of the current transaction.

pub mod activation;
pub mod aggregate;
pub mod catalog;
pub mod config;
pub mod deferred;
pub mod dml;
pub mod error;
pub mod hash_table;
pub mod project_restrict;
pub mod result_set;
pub mod row_count;
pub mod scan;
pub mod scroll;
pub mod session;
pub mod set_op;
pub mod sort;
pub mod temp_holder;
pub mod values;

#[cfg(any(test, feature = "test"))]
pub mod testing;

pub use activation::{Activation, RowHolderRef};
pub use catalog::{Catalog, MemCatalog};
pub use config::ExecConfig;
pub use deferred::DeferredConstraintsMemory;
pub use error::{ConstraintViolation, ExecError, Result};
pub use result_set::{ResultSet, ScrollCursor, TopResultSet};
pub use session::Session;
pub use temp_holder::TemporaryRowHolder;
