//! `INTERSECT` and `EXCEPT` over two inputs ordered the same way.

use core::cmp::Ordering;

use quarry_lib::ordering::compare_rows;
use quarry_lib::{ColumnOrdering, ResultSetNumber, Row};

use crate::activation::Activation;
use crate::error::Result;
use crate::result_set::{Phase, ResultSet, ResultSetBase};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SetOpKind {
    Intersect,
    Except,
}

/// Merges two inputs sorted on `ordering`.
///
/// With `all`, every left row matches at most one right row, so
/// duplicates are kept as often as the counts dictate. Without it, left
/// rows equal on `ordering` to the previous left row are skipped.
pub struct SetOpResultSet {
    base: ResultSetBase,
    left: Box<dyn ResultSet>,
    right: Box<dyn ResultSet>,
    op: SetOpKind,
    all: bool,
    ordering: Vec<ColumnOrdering>,
    right_row: Option<Row>,
    previous_left: Option<Row>,
    rows_seen_left: u64,
    rows_seen_right: u64,
}

impl SetOpResultSet {
    pub fn new(
        rsn: ResultSetNumber,
        left: Box<dyn ResultSet>,
        right: Box<dyn ResultSet>,
        op: SetOpKind,
        all: bool,
        ordering: Vec<ColumnOrdering>,
    ) -> Self {
        Self {
            base: ResultSetBase::new(rsn),
            left,
            right,
            op,
            all,
            ordering,
            right_row: None,
            previous_left: None,
            rows_seen_left: 0,
            rows_seen_right: 0,
        }
    }

    pub fn rows_seen_left(&self) -> u64 {
        self.rows_seen_left
    }

    pub fn rows_seen_right(&self) -> u64 {
        self.rows_seen_right
    }

    fn advance_right(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        self.right_row = self.right.next_row_core(cx)?;
        if self.right_row.is_some() {
            self.rows_seen_right += 1;
        }
        Ok(())
    }

    fn compare(&self, left: &Row, right: &Row) -> Ordering {
        compare_rows(left, right, &self.ordering)
    }
}

impl ResultSet for SetOpResultSet {
    fn kind(&self) -> &'static str {
        "set operation"
    }

    fn base(&self) -> &ResultSetBase {
        &self.base
    }

    fn open_core(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let start = self.base.start_timer(cx);
        self.left.open_core(cx)?;
        self.right.open_core(cx)?;
        self.previous_left = None;
        self.rows_seen_left = 0;
        self.rows_seen_right = 0;
        self.advance_right(cx)?;
        self.base.mark_open();
        self.base.stop_timer(start, Phase::Open);
        Ok(())
    }

    fn next_row_core(&mut self, cx: &mut Activation<'_>) -> Result<Option<Row>> {
        self.base.check_open("next_row")?;
        let start = self.base.start_timer(cx);
        let mut result = None;
        while let Some(left) = self.left.next_row_core(cx)? {
            self.rows_seen_left += 1;
            if !self.all {
                let duplicate = self
                    .previous_left
                    .as_ref()
                    .is_some_and(|prev| self.compare(prev, &left).is_eq());
                if duplicate {
                    continue;
                }
                self.previous_left = Some(left.clone());
            }
            let mut ord = Ordering::Less;
            while let Some(right) = &self.right_row {
                ord = self.compare(&left, right);
                if ord != Ordering::Greater {
                    break;
                }
                self.advance_right(cx)?;
            }
            if self.right_row.is_none() || ord == Ordering::Less {
                if self.op == SetOpKind::Except {
                    result = Some(left);
                    break;
                }
                continue;
            }
            // Equal keys.
            if self.all {
                self.advance_right(cx)?;
            }
            if self.op == SetOpKind::Intersect {
                result = Some(left);
                break;
            }
        }
        let row = self.base.produced(cx, result);
        self.base.stop_timer(start, Phase::Next);
        Ok(row)
    }

    fn close(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let start = self.base.start_timer(cx);
        self.right_row = None;
        self.previous_left = None;
        let left = self.left.close(cx);
        let right = self.right.close(cx);
        self.base.mark_closed(cx);
        self.base.stop_timer(start, Phase::Close);
        left.and(right)
    }

    fn finish(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        self.left.finish(cx)?;
        self.right.finish(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result_set::TopResultSet;
    use crate::testing::TestDb;
    use crate::values::RowResultSet;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use quarry_lib::row;

    fn run(left: &[i64], right: &[i64], op: SetOpKind, all: bool) -> Vec<i64> {
        let mut db = TestDb::new();
        let input = |rsn: u32, values: &[i64]| -> Box<dyn ResultSet> {
            Box::new(RowResultSet::constant(
                ResultSetNumber(rsn),
                values.iter().map(|v| row![*v]).collect(),
            ))
        };
        let rs = SetOpResultSet::new(
            ResultSetNumber(0),
            input(1, left),
            input(2, right),
            op,
            all,
            vec![ColumnOrdering::asc(0)],
        );
        let mut top = TopResultSet::new(Box::new(rs));
        let mut cx = db.activation();
        top.collect(&mut cx)
            .unwrap()
            .into_iter()
            .map(|r| *r[0].as_i64().unwrap())
            .collect()
    }

    #[test]
    fn intersect_and_except_handle_duplicates() {
        let (left, right) = ([1, 2, 2, 3], [2, 2, 4]);
        assert_eq!(run(&left, &right, SetOpKind::Intersect, false), vec![2]);
        assert_eq!(run(&left, &right, SetOpKind::Except, false), vec![1, 3]);
        assert_eq!(run(&left, &right, SetOpKind::Intersect, true), vec![2, 2]);
        assert_eq!(run(&left, &right, SetOpKind::Except, true), vec![1, 3]);
    }

    #[test]
    fn empty_right_input() {
        assert_eq!(run(&[1, 1, 2], &[], SetOpKind::Except, true), vec![1, 1, 2]);
        assert_eq!(run(&[1, 1, 2], &[], SetOpKind::Except, false), vec![1, 2]);
        assert_eq!(run(&[1, 1, 2], &[], SetOpKind::Intersect, true), Vec::<i64>::new());
    }

    fn multiset(values: &[i64]) -> std::collections::BTreeMap<i64, usize> {
        let mut counts = std::collections::BTreeMap::new();
        for v in values {
            *counts.entry(*v).or_default() += 1;
        }
        counts
    }

    proptest! {
        #[test]
        fn all_variants_follow_multiset_counts(
            mut left in prop::collection::vec(0i64..6, 0..16),
            mut right in prop::collection::vec(0i64..6, 0..16),
        ) {
            left.sort_unstable();
            right.sort_unstable();
            let (l, r) = (multiset(&left), multiset(&right));

            let intersect: Vec<i64> = l
                .iter()
                .flat_map(|(v, n)| std::iter::repeat_n(*v, (*n).min(r.get(v).copied().unwrap_or(0))))
                .collect();
            let except: Vec<i64> = l
                .iter()
                .flat_map(|(v, n)| std::iter::repeat_n(*v, n.saturating_sub(r.get(v).copied().unwrap_or(0))))
                .collect();
            prop_assert_eq!(run(&left, &right, SetOpKind::Intersect, true), intersect);
            prop_assert_eq!(run(&left, &right, SetOpKind::Except, true), except);
        }
    }
}
