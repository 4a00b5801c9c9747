//! The per-execution context of a statement.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::Ordering;

use quarry_datastore::{IsolationLevel, TransactionController};
use quarry_expr::EvalContext;
use quarry_lib::{ColId, ConstraintId, ResultSetNumber, Row, Value};

use crate::catalog::Catalog;
use crate::config::ExecConfig;
use crate::deferred::DeferredConstraintsMemory;
use crate::error::{ExecError, Result};
use crate::session::Session;
use crate::temp_holder::TemporaryRowHolder;

/// A temporary row holder shared between the operator filling it
/// and the dependents reading it.
pub type RowHolderRef = Rc<RefCell<TemporaryRowHolder>>;

/// Everything one execution of a plan needs besides the plan itself.
///
/// Borrows the session for the duration of the execution, so the
/// transaction controller, the catalog and the deferred constraint memory
/// are reached through it rather than through ambient state.
pub struct Activation<'s> {
    session: &'s mut Session,
    params: Vec<Value>,
    current_rows: HashMap<ResultSetNumber, Row>,
    cursor_name: Option<String>,
    holdable: bool,
    /// Zero is no limit.
    max_rows: u64,
    valid: bool,
    subqueries: Vec<ResultSetNumber>,
    parent_result_sets: HashMap<String, Vec<RowHolderRef>>,
    rows_since_cancel_check: u64,
}

impl<'s> Activation<'s> {
    pub fn new(session: &'s mut Session) -> Self {
        Self {
            session,
            params: Vec::new(),
            current_rows: HashMap::new(),
            cursor_name: None,
            holdable: false,
            max_rows: 0,
            valid: true,
            subqueries: Vec::new(),
            parent_result_sets: HashMap::new(),
            rows_since_cancel_check: 0,
        }
    }

    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_cursor_name(mut self, name: impl Into<String>) -> Self {
        self.cursor_name = Some(name.into());
        self
    }

    pub fn with_holdable(mut self, holdable: bool) -> Self {
        self.holdable = holdable;
        self
    }

    pub fn with_max_rows(mut self, max_rows: u64) -> Self {
        self.max_rows = max_rows;
        self
    }

    pub fn session(&self) -> &Session {
        self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        self.session
    }

    pub fn tc(&mut self) -> &mut dyn TransactionController {
        self.session.tc()
    }

    pub fn catalog(&self) -> &dyn Catalog {
        self.session.catalog()
    }

    pub fn config(&self) -> &ExecConfig {
        self.session.config()
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.session.isolation()
    }

    pub fn deferred_memory(&mut self) -> &mut DeferredConstraintsMemory {
        self.session.deferred_memory()
    }

    /// Is `constraint` currently checked at validation time rather than per row?
    pub fn is_deferred(&self, constraint: ConstraintId) -> bool {
        self.session.is_deferred(constraint)
    }

    pub fn set_params(&mut self, params: Vec<Value>) {
        self.params = params;
    }

    pub fn cursor_name(&self) -> Option<&str> {
        self.cursor_name.as_deref()
    }

    pub fn is_holdable(&self) -> bool {
        self.holdable
    }

    pub fn max_rows(&self) -> u64 {
        self.max_rows
    }

    pub fn set_current_row(&mut self, rsn: ResultSetNumber, row: &Row) {
        match self.current_rows.get_mut(&rsn) {
            Some(slot) => slot.clone_from(row),
            None => {
                self.current_rows.insert(rsn, row.clone());
            }
        }
    }

    pub fn clear_current_row(&mut self, rsn: ResultSetNumber) {
        self.current_rows.remove(&rsn);
    }

    pub fn current_row(&self, rsn: ResultSetNumber) -> Option<&Row> {
        self.current_rows.get(&rsn)
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Marks the statement as no longer executable, e.g. after a dependency was dropped.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn check_statement_valid(&self) -> Result<()> {
        if !self.valid {
            return Err(ExecError::InvalidState("the statement is no longer valid"));
        }
        Ok(())
    }

    /// Counts one unit of work and, every `cancel_check_interval` units,
    /// fails with `Cancelled` if the session was asked to stop.
    /// Observing the cancel clears it.
    pub fn check_cancel(&mut self) -> Result<()> {
        self.rows_since_cancel_check += 1;
        if self.rows_since_cancel_check < self.config().cancel_check_interval {
            return Ok(());
        }
        self.rows_since_cancel_check = 0;
        if self.session.cancel_flag().swap(false, Ordering::Relaxed) {
            return Err(ExecError::Cancelled);
        }
        Ok(())
    }

    pub fn register_subquery(&mut self, rsn: ResultSetNumber) {
        if !self.subqueries.contains(&rsn) {
            self.subqueries.push(rsn);
        }
    }

    pub fn subqueries(&self) -> &[ResultSetNumber] {
        &self.subqueries
    }

    /// Publishes the row holder of a parent result set to its dependents.
    pub fn set_parent_result_set(&mut self, id: impl Into<String>, holder: RowHolderRef) {
        self.parent_result_sets.entry(id.into()).or_default().push(holder);
    }

    pub fn parent_result_set(&self, id: &str) -> &[RowHolderRef] {
        self.parent_result_sets.get(id).map_or(&[], Vec::as_slice)
    }

    pub fn clear_parent_result_sets(&mut self) {
        self.parent_result_sets.clear();
    }
}

impl EvalContext for Activation<'_> {
    fn param(&self, idx: usize) -> Option<Value> {
        self.params.get(idx).cloned()
    }

    fn outer(&self, rsn: ResultSetNumber, col: ColId) -> Option<Value> {
        self.current_rows.get(&rsn).map(|row| row.get(col).clone())
    }
}
