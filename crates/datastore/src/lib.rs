pub mod error;
pub mod mem_datastore;
pub mod qualifier;
pub mod traits;

pub use error::StoreError;
pub use mem_datastore::{InjectedFailure, MemStore, StoreCounters};
pub use qualifier::{Qualifier, Qualifiers, ScanRange};
pub use traits::{
    ConglomerateController, ConglomerateInfo, ConglomerateKind, Fetched, InsertOutcome, IsolationLevel, LockMode,
    OpenMode, ScanController, ScanSpec, SortController, SortObserver, SortSpec, TransactionController,
};

pub type Result<T> = core::result::Result<T, StoreError>;
