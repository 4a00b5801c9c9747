//! Operators shared by qualifiers and expressions.

use core::cmp::Ordering;
use derive_more::From;
use std::fmt;

use crate::Value;

#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub enum OpCmp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl OpCmp {
    /// Reverse the order of the `cmp`, so that `a < b` can be evaluated as `b > a`.
    pub fn reverse(self) -> Self {
        match self {
            OpCmp::Eq => self,
            OpCmp::NotEq => self,
            OpCmp::Lt => OpCmp::Gt,
            OpCmp::LtEq => OpCmp::GtEq,
            OpCmp::Gt => OpCmp::Lt,
            OpCmp::GtEq => OpCmp::LtEq,
        }
    }

    /// The logical negation, `NOT (a < b)` being `a >= b`.
    pub fn negate(self) -> Self {
        match self {
            OpCmp::Eq => OpCmp::NotEq,
            OpCmp::NotEq => OpCmp::Eq,
            OpCmp::Lt => OpCmp::GtEq,
            OpCmp::LtEq => OpCmp::Gt,
            OpCmp::Gt => OpCmp::LtEq,
            OpCmp::GtEq => OpCmp::Lt,
        }
    }

    /// Does `ord` satisfy this comparison?
    pub fn holds(self, ord: Ordering) -> bool {
        match self {
            OpCmp::Eq => ord.is_eq(),
            OpCmp::NotEq => ord.is_ne(),
            OpCmp::Lt => ord.is_lt(),
            OpCmp::LtEq => ord.is_le(),
            OpCmp::Gt => ord.is_gt(),
            OpCmp::GtEq => ord.is_ge(),
        }
    }

    /// Compares `lhs` and `rhs` under SQL semantics.
    /// `None` is the unknown truth value.
    pub fn eval(self, lhs: &Value, rhs: &Value) -> Option<bool> {
        lhs.sql_cmp(rhs).map(|ord| self.holds(ord))
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum OpUnary {
    Not,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum OpMath {
    Add,
    Minus,
    Mul,
    Div,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub enum OpLogic {
    And,
    Or,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, From)]
pub enum Op {
    Cmp(OpCmp),
    Logic(OpLogic),
    Unary(OpUnary),
    Math(OpMath),
}

impl Op {
    pub fn is_logical(&self) -> bool {
        matches!(self, Op::Cmp(_) | Op::Logic(_))
    }
}

impl fmt::Display for OpCmp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let x = match self {
            OpCmp::Eq => "=",
            OpCmp::NotEq => "<>",
            OpCmp::Lt => "<",
            OpCmp::LtEq => "<=",
            OpCmp::Gt => ">",
            OpCmp::GtEq => ">=",
        };
        write!(f, "{x}")
    }
}

impl fmt::Display for OpLogic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let x = match self {
            OpLogic::And => "AND",
            OpLogic::Or => "OR",
        };
        write!(f, "{x}")
    }
}

impl fmt::Display for OpUnary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let x = match self {
            OpUnary::Not => "NOT",
        };
        write!(f, "{x}")
    }
}

impl fmt::Display for OpMath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let x = match self {
            OpMath::Add => "+",
            OpMath::Minus => "-",
            OpMath::Mul => "*",
            OpMath::Div => "/",
        };
        write!(f, "{x}")
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Cmp(x) => write!(f, "{x}"),
            Op::Logic(x) => write!(f, "{x}"),
            Op::Unary(x) => write!(f, "{x}"),
            Op::Math(x) => write!(f, "{x}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negate_is_the_complement() {
        for op in [OpCmp::Eq, OpCmp::NotEq, OpCmp::Lt, OpCmp::LtEq, OpCmp::Gt, OpCmp::GtEq] {
            for ord in [Ordering::Less, Ordering::Equal, Ordering::Greater] {
                assert_ne!(op.holds(ord), op.negate().holds(ord), "{op} {ord:?}");
                assert_eq!(op.holds(ord), op.reverse().holds(ord.reverse()), "{op} {ord:?}");
            }
        }
    }

    #[test]
    fn comparisons_with_null_are_unknown() {
        assert_eq!(OpCmp::Eq.eval(&Value::Null, &Value::Null), None);
        assert_eq!(OpCmp::Lt.eval(&Value::from(1), &Value::from(2)), Some(true));
        assert_eq!(Op::from(OpLogic::And).to_string(), "AND");
    }
}
