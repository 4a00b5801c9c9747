//! `INSERT`, `UPDATE` and `DELETE`.
//!
//! A DML result set does all of its work when opened and returns no rows.
//! Its source produces the rows to write; for updates and deletes each
//! source row ends with the location of the base row it changes.

mod constraints;
mod delete;
mod index_changer;
mod insert;
mod row_changer;
mod update;

pub use constraints::{CheckConstraints, ReferencedKeyChecker};
pub use delete::DeleteResultSet;
pub use index_changer::{IndexChanger, IndexSetChanger};
pub use insert::InsertResultSet;
pub use row_changer::RowChanger;
pub use update::UpdateResultSet;

use quarry_lib::{ResultSetNumber, Row, RowLocation};

use crate::activation::{Activation, RowHolderRef};
use crate::error::{ExecError, Result};
use crate::result_set::ResultSet;
use crate::temp_holder::TemporaryRowHolder;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TriggerTiming {
    Before,
    After,
}

/// Statement triggers fired over the rows a statement changed.
pub trait TriggerActivator {
    /// `rows` is open and positioned before the first changed row.
    fn fire(&mut self, cx: &mut Activation<'_>, timing: TriggerTiming, rows: &mut dyn ResultSet) -> Result<()>;
}

/// Splits a source row into the base row and its trailing location.
fn split_location(mut row: Row) -> Result<(Row, RowLocation)> {
    let loc = row
        .row_location()
        .ok_or(ExecError::InvalidState("source row without a row location"))?;
    row.elements.pop();
    Ok((row, loc))
}

/// Calls `f` with every row of `holder`, in insertion order.
fn for_each_held(
    cx: &mut Activation<'_>,
    holder: &RowHolderRef,
    rsn: ResultSetNumber,
    mut f: impl FnMut(&mut Activation<'_>, Row) -> Result<()>,
) -> Result<()> {
    let mut rs = TemporaryRowHolder::result_set(holder, rsn);
    rs.open_core(cx)?;
    let res = drive(&mut rs, cx, &mut f);
    rs.close(cx)?;
    res
}

fn drive(
    rs: &mut dyn ResultSet,
    cx: &mut Activation<'_>,
    f: &mut impl FnMut(&mut Activation<'_>, Row) -> Result<()>,
) -> Result<()> {
    while let Some(row) = rs.next_row_core(cx)? {
        cx.check_cancel()?;
        f(cx, row)?;
    }
    Ok(())
}

fn fire_triggers(
    cx: &mut Activation<'_>,
    triggers: &mut Option<Box<dyn TriggerActivator>>,
    timing: TriggerTiming,
    holder: &RowHolderRef,
    rsn: ResultSetNumber,
) -> Result<()> {
    let Some(triggers) = triggers else {
        return Ok(());
    };
    let mut rs = TemporaryRowHolder::result_set(holder, rsn);
    rs.open_core(cx)?;
    let res = triggers.fire(cx, timing, &mut rs);
    rs.close(cx)?;
    res
}
