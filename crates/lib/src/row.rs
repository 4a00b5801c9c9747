use core::ops::{Deref, DerefMut};
use std::fmt;

use quarry_primitives::{ColId, RowLocation};

use crate::Value;

/// A row of column values.
///
/// Rows compare lexicographically under the total order of [`Value`],
/// which is also the key order of btree conglomerates.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Row {
    pub elements: Vec<Value>,
}

/// Constructs a row from a list of values.
///
/// ```
/// use quarry_lib::{row, Value};
/// let r = row![1, "a", Value::Null];
/// assert_eq!(r.len(), 3);
/// ```
#[macro_export]
macro_rules! row {
    [$($elems:expr),*$(,)?] => {
        $crate::Row::new(vec![$($crate::Value::from($elems)),*])
    }
}

impl Row {
    pub fn new(elements: Vec<Value>) -> Self {
        Self { elements }
    }

    /// A row of `n` nulls.
    pub fn nulls(n: usize) -> Self {
        Self::new(vec![Value::Null; n])
    }

    /// The value at `col`, or `NULL` if the row is shorter.
    pub fn get(&self, col: ColId) -> &Value {
        self.elements.get(col.idx()).unwrap_or(&Value::Null)
    }

    /// Overwrites the value at `col`, growing the row with nulls if needed.
    pub fn set(&mut self, col: ColId, value: Value) {
        let idx = col.idx();
        if idx >= self.elements.len() {
            self.elements.resize(idx + 1, Value::Null);
        }
        self.elements[idx] = value;
    }

    /// Returns a new row made of `cols`, in that order.
    pub fn project(&self, cols: &[ColId]) -> Self {
        Self::new(cols.iter().map(|c| self.get(*c).clone()).collect())
    }

    /// The first `n` columns.
    pub fn prefix(&self, n: usize) -> &[Value] {
        &self.elements[..n.min(self.elements.len())]
    }

    /// Does any of `cols` hold a null?
    pub fn has_null_in(&self, cols: &[ColId]) -> bool {
        cols.iter().any(|c| self.get(*c).is_null())
    }

    pub fn has_null(&self) -> bool {
        self.elements.iter().any(Value::is_null)
    }

    /// The row location carried in the trailing column, as index rows do.
    pub fn row_location(&self) -> Option<RowLocation> {
        self.elements.last().and_then(|v| v.as_loc()).copied()
    }

    /// Appends `loc` as the trailing column, turning a key into an index row.
    pub fn with_location(mut self, loc: RowLocation) -> Self {
        self.elements.push(Value::Loc(loc));
        self
    }

    /// Concatenates two rows.
    pub fn concat(mut self, other: &Row) -> Self {
        self.elements.extend_from_slice(&other.elements);
        self
    }
}

impl Deref for Row {
    type Target = [Value];

    fn deref(&self) -> &Self::Target {
        &self.elements
    }
}

impl DerefMut for Row {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.elements
    }
}

impl From<Vec<Value>> for Row {
    fn from(elements: Vec<Value>) -> Self {
        Self::new(elements)
    }
}

impl FromIterator<Value> for Row {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl IntoIterator for Row {
    type Item = Value;
    type IntoIter = std::vec::IntoIter<Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.elements.into_iter()
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, v) in self.elements.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{v}")?;
        }
        f.write_str(")")
    }
}
