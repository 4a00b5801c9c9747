//! Values, rows and orderings shared by the storage and execution layers.

pub mod metrics;
pub mod operator;
pub mod ordering;
mod row;
mod value;

pub use metrics::ResultSetStats;
pub use operator::{Op, OpCmp, OpLogic, OpMath, OpUnary};
pub use ordering::ColumnOrdering;
pub use quarry_primitives as primitives;
pub use quarry_primitives::{ColId, ConglomId, ConstraintId, FixedBitSet, ResultSetNumber, RowLocation, SortId};
pub use row::Row;
pub use value::{Value, ValueError, F64};
