mod fixed_bit_set;
mod ids;

pub use fixed_bit_set::FixedBitSet;
pub use ids::{ColId, ConglomId, ConstraintId, ResultSetNumber, RowLocation, SortId};
