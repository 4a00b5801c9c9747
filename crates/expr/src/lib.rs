//! Scalar expressions for restrictions, projections and check constraints.

pub mod errors;
pub mod expr;

pub use errors::EvalError;
pub use expr::{EvalContext, Expr, NoContext};
