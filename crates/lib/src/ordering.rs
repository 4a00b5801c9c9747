use std::cmp::Ordering;
use std::fmt::Debug;

use quarry_primitives::ColId;

use crate::{Row, Value};

/// One key column of a sort or a merge, with its direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColumnOrdering {
    pub col: ColId,
    pub ascending: bool,
}

impl ColumnOrdering {
    pub const fn asc(col: u32) -> Self {
        Self {
            col: ColId(col),
            ascending: true,
        }
    }

    pub const fn desc(col: u32) -> Self {
        Self {
            col: ColId(col),
            ascending: false,
        }
    }
}

/// Compares two values in the direction of `asc`.
pub fn compare_values(a: &Value, b: &Value, asc: bool) -> Ordering {
    let ord = a.cmp(b);
    if asc { ord } else { ord.reverse() }
}

/// Compares two rows on the key columns of `ordering`, in order.
pub fn compare_rows(a: &Row, b: &Row, ordering: &[ColumnOrdering]) -> Ordering {
    ordering
        .iter()
        .map(|o| compare_values(a.get(o.col), b.get(o.col), o.ascending))
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// Compares all columns of two rows for exact equality.
/// Unlike SQL equality, two nulls are equal here.
pub fn rows_identical(a: &Row, b: &Row) -> bool {
    a.elements == b.elements
}

/// Compares `row` against the key prefix `key` column by column.
/// Only the first `key.len()` columns of `row` take part,
/// so a row is equal to every prefix of itself.
pub fn compare_prefix(row: &[Value], key: &[Value]) -> Ordering {
    row.iter()
        .zip(key)
        .map(|(r, k)| r.cmp(k))
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// Check that a slice is sorted by an ordering.
pub fn is_sorted_by<T: Debug>(v: &[T], cmp: impl Fn(&T, &T) -> Ordering) -> bool {
    v.windows(2).all(|w| cmp(&w[0], &w[1]).is_le())
}
