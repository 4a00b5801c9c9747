use quarry_lib::ValueError;
use quarry_primitives::{ColId, ResultSetNumber};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    #[error("No value supplied for parameter ?{0}")]
    NoSuchParam(usize),
    #[error("Result set {0} has no current row")]
    NoCurrentRow(ResultSetNumber),
    #[error("Column {0} is out of range for a row of {1} columns")]
    ColumnOutOfRange(ColId, usize),
    #[error("Expected a boolean, found a value of type `{0}`")]
    NotBoolean(&'static str),
    #[error(transparent)]
    Value(#[from] ValueError),
}
