use std::borrow::Cow;
use std::fmt;

use quarry_lib::{OpCmp, OpLogic, OpMath, Row, Value};
use quarry_primitives::{ColId, ResultSetNumber};

use crate::errors::EvalError;

pub type Result<T, E = EvalError> = core::result::Result<T, E>;

/// What an expression can see besides the row it is evaluated over.
///
/// The activation of a statement implements this, exposing the values
/// bound to `?` parameters and the current rows of enclosing result sets
/// for correlated predicates.
pub trait EvalContext {
    /// The value of the 0-based parameter `idx`.
    fn param(&self, idx: usize) -> Option<Value>;

    /// The value of column `col` in the current row of result set `rsn`.
    /// `None` if that result set is not positioned on a row.
    fn outer(&self, rsn: ResultSetNumber, col: ColId) -> Option<Value>;
}

/// A context with no parameters and no outer rows.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoContext;

impl EvalContext for NoContext {
    fn param(&self, _: usize) -> Option<Value> {
        None
    }

    fn outer(&self, _: ResultSetNumber, _: ColId) -> Option<Value> {
        None
    }
}

impl EvalContext for Vec<Value> {
    fn param(&self, idx: usize) -> Option<Value> {
        self.get(idx).cloned()
    }

    fn outer(&self, _: ResultSetNumber, _: ColId) -> Option<Value> {
        None
    }
}

/// A compiled scalar expression.
///
/// Boolean expressions follow SQL's three-valued logic,
/// with `NULL` standing for the unknown truth value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// A constant value
    Value(Value),
    /// A column of the row being evaluated
    Field(ColId),
    /// A `?` parameter of the statement
    Param(usize),
    /// A column of the current row of an enclosing result set
    Outer(ResultSetNumber, ColId),
    /// A binary comparison
    Cmp(OpCmp, Box<Expr>, Box<Expr>),
    /// An n-ary logic expression
    LogOp(OpLogic, Vec<Expr>),
    Not(Box<Expr>),
    IsNull(Box<Expr>),
    /// Binary arithmetic
    Math(OpMath, Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn col(col: u32) -> Self {
        Self::Field(ColId(col))
    }

    pub fn val(v: impl Into<Value>) -> Self {
        Self::Value(v.into())
    }

    pub fn cmp(op: OpCmp, lhs: Expr, rhs: Expr) -> Self {
        Self::Cmp(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn math(op: OpMath, lhs: Expr, rhs: Expr) -> Self {
        Self::Math(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn and(exprs: Vec<Expr>) -> Self {
        Self::LogOp(OpLogic::And, exprs)
    }

    pub fn or(exprs: Vec<Expr>) -> Self {
        Self::LogOp(OpLogic::Or, exprs)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(expr: Expr) -> Self {
        Self::Not(Box::new(expr))
    }

    pub fn is_null(expr: Expr) -> Self {
        Self::IsNull(Box::new(expr))
    }

    /// Walks the expression tree and calls `f` on every subexpression
    pub fn visit(&self, f: &mut impl FnMut(&Self)) {
        f(self);
        match self {
            Self::Cmp(_, a, b) | Self::Math(_, a, b) => {
                a.visit(f);
                b.visit(f);
            }
            Self::LogOp(_, exprs) => {
                for expr in exprs {
                    expr.visit(f);
                }
            }
            Self::Not(a) | Self::IsNull(a) => a.visit(f),
            Self::Value(_) | Self::Field(_) | Self::Param(_) | Self::Outer(..) => {}
        }
    }

    /// Does this expression read the row it is evaluated over?
    ///
    /// Expressions that do not can be evaluated once per execution,
    /// e.g. as a constant restriction.
    pub fn reads_row(&self) -> bool {
        let mut reads = false;
        self.visit(&mut |e| reads |= matches!(e, Self::Field(_)));
        reads
    }

    /// The columns of the row this expression reads, deduplicated and sorted.
    pub fn fields(&self) -> Vec<ColId> {
        let mut cols = Vec::new();
        self.visit(&mut |e| {
            if let Self::Field(c) = e {
                cols.push(*c);
            }
        });
        cols.sort_unstable();
        cols.dedup();
        cols
    }

    /// Evaluate this expression over `row`
    pub fn eval<'a>(&'a self, row: &'a Row, cx: &dyn EvalContext) -> Result<Cow<'a, Value>> {
        let bool_or_null = |b: Option<bool>| Cow::Owned(b.map_or(Value::Null, Value::Bool));
        Ok(match self {
            Self::Value(v) => Cow::Borrowed(v),
            Self::Field(col) => Cow::Borrowed(
                row.elements
                    .get(col.idx())
                    .ok_or(EvalError::ColumnOutOfRange(*col, row.len()))?,
            ),
            Self::Param(idx) => Cow::Owned(cx.param(*idx).ok_or(EvalError::NoSuchParam(*idx))?),
            Self::Outer(rsn, col) => Cow::Owned(cx.outer(*rsn, *col).ok_or(EvalError::NoCurrentRow(*rsn))?),
            Self::Cmp(op, a, b) => bool_or_null(op.eval(&*a.eval(row, cx)?, &*b.eval(row, cx)?)),
            Self::LogOp(op, exprs) => bool_or_null(eval_log_op(*op, exprs, row, cx)?),
            Self::Not(a) => bool_or_null(a.eval_bool(row, cx)?.map(|b| !b)),
            Self::IsNull(a) => Cow::Owned(Value::Bool(a.eval(row, cx)?.is_null())),
            Self::Math(op, a, b) => {
                let (a, b) = (a.eval(row, cx)?, b.eval(row, cx)?);
                let (a, b) = (&*a, &*b);
                Cow::Owned(match op {
                    OpMath::Add => a.add(b)?,
                    OpMath::Minus => a.sub(b)?,
                    OpMath::Mul => a.mul(b)?,
                    OpMath::Div => a.div(b)?,
                })
            }
        })
    }

    /// Evaluate this boolean expression over `row`.
    /// `None` is the unknown truth value.
    pub fn eval_bool(&self, row: &Row, cx: &dyn EvalContext) -> Result<Option<bool>> {
        match &*self.eval(row, cx)? {
            Value::Bool(b) => Ok(Some(*b)),
            Value::Null => Ok(None),
            v => Err(EvalError::NotBoolean(v.type_name())),
        }
    }

    /// Does `row` qualify under this predicate?
    /// Only a true result qualifies; unknown does not.
    pub fn qualifies(&self, row: &Row, cx: &dyn EvalContext) -> Result<bool> {
        Ok(self.eval_bool(row, cx)? == Some(true))
    }
}

/// Kleene logic: `false AND unknown` is false, `true OR unknown` is true.
fn eval_log_op(op: OpLogic, exprs: &[Expr], row: &Row, cx: &dyn EvalContext) -> Result<Option<bool>> {
    let (short, identity) = match op {
        OpLogic::And => (false, true),
        OpLogic::Or => (true, false),
    };
    let mut unknown = false;
    for expr in exprs {
        match expr.eval_bool(row, cx)? {
            Some(b) if b == short => return Ok(Some(short)),
            Some(_) => {}
            None => unknown = true,
        }
    }
    Ok(if unknown { None } else { Some(identity) })
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => write!(f, "{v}"),
            Self::Field(col) => write!(f, "#{col}"),
            Self::Param(idx) => write!(f, "?{idx}"),
            Self::Outer(rsn, col) => write!(f, "rs{rsn}.#{col}"),
            Self::Cmp(op, a, b) => write!(f, "{a} {op} {b}"),
            Self::Math(op, a, b) => write!(f, "({a} {op} {b})"),
            Self::LogOp(op, exprs) => {
                f.write_str("(")?;
                for (i, e) in exprs.iter().enumerate() {
                    if i > 0 {
                        write!(f, " {op} ")?;
                    }
                    write!(f, "{e}")?;
                }
                f.write_str(")")
            }
            Self::Not(a) => write!(f, "NOT {a}"),
            Self::IsNull(a) => write!(f, "{a} IS NULL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use quarry_lib::row;

    fn tri(v: Option<bool>) -> Expr {
        Expr::Value(v.map_or(Value::Null, Value::Bool))
    }

    #[test]
    fn comparison_with_null_does_not_qualify() {
        let pred = Expr::cmp(OpCmp::Eq, Expr::col(0), Expr::val(1));
        assert!(pred.qualifies(&row![1], &NoContext).unwrap());
        assert!(!pred.qualifies(&row![Value::Null], &NoContext).unwrap());
        assert_eq!(pred.eval_bool(&row![Value::Null], &NoContext).unwrap(), None);
        // NOT unknown is still unknown.
        assert!(!Expr::not(pred).qualifies(&row![Value::Null], &NoContext).unwrap());
    }

    #[test]
    fn params_and_math() {
        let params = vec![Value::from(10)];
        let e = Expr::math(OpMath::Add, Expr::col(0), Expr::Param(0));
        assert_eq!(e.eval(&row![5], &params).unwrap().into_owned(), Value::from(15));
        assert_eq!(
            Expr::Param(1).eval(&row![5], &params).unwrap_err(),
            EvalError::NoSuchParam(1)
        );
        assert_eq!(
            Expr::col(3).eval(&row![5], &NoContext).unwrap_err(),
            EvalError::ColumnOutOfRange(ColId(3), 1)
        );
    }

    #[test]
    fn constant_detection() {
        assert!(!Expr::cmp(OpCmp::Eq, Expr::Param(0), Expr::val(1)).reads_row());
        let e = Expr::and(vec![
            Expr::is_null(Expr::col(2)),
            Expr::cmp(OpCmp::Lt, Expr::col(0), Expr::col(2)),
        ]);
        assert!(e.reads_row());
        assert_eq!(e.fields(), vec![ColId(0), ColId(2)]);
        assert_eq!(e.to_string(), "(#2 IS NULL AND #0 < #2)");
    }

    fn arb_tri() -> impl Strategy<Value = Option<bool>> {
        prop_oneof![Just(None), Just(Some(true)), Just(Some(false))]
    }

    proptest! {
        #[test]
        fn kleene_logic(a in arb_tri(), b in arb_tri()) {
            let and = Expr::and(vec![tri(a), tri(b)]).eval_bool(&Row::default(), &NoContext).unwrap();
            let or = Expr::or(vec![tri(a), tri(b)]).eval_bool(&Row::default(), &NoContext).unwrap();
            let expected_and = match (a, b) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            };
            let expected_or = match (a, b) {
                (Some(true), _) | (_, Some(true)) => Some(true),
                (Some(false), Some(false)) => Some(false),
                _ => None,
            };
            prop_assert_eq!(and, expected_and);
            prop_assert_eq!(or, expected_or);
        }
    }
}
