use core::cmp::Ordering;
use core::fmt;

use enum_as_inner::EnumAsInner;
use quarry_primitives::RowLocation;
use thiserror::Error;

/// A totally ordered `f64`.
///
/// [total order]: https://docs.rs/decorum/0.3.1/decorum/#total-ordering
pub type F64 = decorum::Total<f64>;

/// A single, nullable column value.
///
/// Values are type erased; the column type lives in the catalog.
/// Equality is structural, so `I64(1)` and `F64(1.0)` are different values,
/// while the SQL comparison [`Value::sql_cmp`] compares them numerically.
///
/// The total order used for sorting and btree keys places `NULL` above every
/// non-null value, which is the ordering index scans rely on when picking
/// the first row of an ascending scan as the minimum.
#[derive(EnumAsInner, Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    /// The SQL `NULL`.
    Null,
    Bool(bool),
    I64(i64),
    F64(F64),
    String(Box<str>),
    Bytes(Box<[u8]>),
    /// A row location, carried as the trailing column of index rows.
    Loc(RowLocation),
}

/// Errors raised by value arithmetic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    #[error("arithmetic overflow")]
    Overflow,
    #[error("division by zero")]
    DivisionByZero,
    #[error("operator `{op}` is not defined for `{lhs}` and `{rhs}`")]
    TypeMismatch {
        op: &'static str,
        lhs: &'static str,
        rhs: &'static str,
    },
}

impl Value {
    /// The name of the variant, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::I64(_) => "i64",
            Self::F64(_) => "f64",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Loc(_) => "row location",
        }
    }

    /// The rank of a variant in the total order.
    /// Numerics share a rank so that they compare by value.
    fn rank(&self) -> u8 {
        match self {
            Self::Bool(_) => 0,
            Self::I64(_) | Self::F64(_) => 1,
            Self::String(_) => 2,
            Self::Bytes(_) => 3,
            Self::Loc(_) => 4,
            Self::Null => 5,
        }
    }

    fn as_f64_lossy(&self) -> Option<f64> {
        match self {
            Self::I64(v) => Some(*v as f64),
            Self::F64(v) => Some(v.into_inner()),
            _ => None,
        }
    }

    /// Compares two values under SQL semantics.
    ///
    /// Returns `None` when either side is `NULL`,
    /// as no comparison with `NULL` is ever true.
    pub fn sql_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.is_null() || other.is_null() {
            return None;
        }
        match (self, other) {
            (Self::I64(_), Self::F64(_)) | (Self::F64(_), Self::I64(_)) => {
                let a = F64::from(self.as_f64_lossy()?);
                let b = F64::from(other.as_f64_lossy()?);
                Some(a.cmp(&b))
            }
            _ => Some(self.cmp(other)),
        }
    }

    /// SQL equality; `None` means unknown.
    pub fn sql_eq(&self, other: &Self) -> Option<bool> {
        self.sql_cmp(other).map(Ordering::is_eq)
    }

    pub fn add(&self, other: &Self) -> Result<Self, ValueError> {
        self.arith(other, "+", i64::checked_add, |a, b| a + b)
    }

    pub fn sub(&self, other: &Self) -> Result<Self, ValueError> {
        self.arith(other, "-", i64::checked_sub, |a, b| a - b)
    }

    pub fn mul(&self, other: &Self) -> Result<Self, ValueError> {
        self.arith(other, "*", i64::checked_mul, |a, b| a * b)
    }

    pub fn div(&self, other: &Self) -> Result<Self, ValueError> {
        match other {
            Self::I64(0) => return Err(ValueError::DivisionByZero),
            Self::F64(v) if v.into_inner() == 0.0 => return Err(ValueError::DivisionByZero),
            _ => {}
        }
        self.arith(other, "/", i64::checked_div, |a, b| a / b)
    }

    /// Divides an accumulated sum by a row count, as `AVG` does.
    /// Integer sums produce an integer average.
    pub fn div_count(&self, count: i64) -> Result<Self, ValueError> {
        self.div(&Self::I64(count))
    }

    fn arith(
        &self,
        other: &Self,
        op: &'static str,
        int: impl FnOnce(i64, i64) -> Option<i64>,
        float: impl FnOnce(f64, f64) -> f64,
    ) -> Result<Self, ValueError> {
        match (self, other) {
            (Self::Null, _) | (_, Self::Null) => Ok(Self::Null),
            (Self::I64(a), Self::I64(b)) => int(*a, *b).map(Self::I64).ok_or(ValueError::Overflow),
            (Self::I64(_) | Self::F64(_), Self::I64(_) | Self::F64(_)) => {
                // Both sides are numeric, so the conversions cannot fail.
                let a = self.as_f64_lossy().unwrap_or_default();
                let b = other.as_f64_lossy().unwrap_or_default();
                Ok(Self::F64(F64::from(float(a, b))))
            }
            _ => Err(ValueError::TypeMismatch {
                op,
                lhs: self.type_name(),
                rhs: other.type_name(),
            }),
        }
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::I64(a), Self::I64(b)) => a.cmp(b),
            (Self::F64(a), Self::F64(b)) => a.cmp(b),
            // Mixed numerics compare by value; ties order the integer first
            // so that the order stays consistent with structural equality.
            (Self::I64(a), Self::F64(b)) => F64::from(*a as f64).cmp(b).then(Ordering::Less),
            (Self::F64(a), Self::I64(b)) => a.cmp(&F64::from(*b as f64)).then(Ordering::Greater),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::Bytes(a), Self::Bytes(b)) => a.cmp(b),
            (Self::Loc(a), Self::Loc(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::I64(v) => write!(f, "{v}"),
            Self::F64(v) => write!(f, "{}", v.into_inner()),
            Self::String(v) => write!(f, "'{v}'"),
            Self::Bytes(v) => {
                f.write_str("X'")?;
                for b in v.iter() {
                    write!(f, "{b:02x}")?;
                }
                f.write_str("'")
            }
            Self::Loc(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::I64(v.into())
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::I64(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::F64(F64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.into())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v.into_boxed_str())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v.into_boxed_slice())
    }
}

impl From<RowLocation> for Value {
    fn from(v: RowLocation) -> Self {
        Self::Loc(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}
