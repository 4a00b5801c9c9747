//! A connection's view of the engine: its transaction, its constraint
//! modes and the violations it still has to validate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use quarry_datastore::{IsolationLevel, TransactionController};
use quarry_lib::{ConglomId, ConstraintId};

use crate::activation::Activation;
use crate::catalog::{Catalog, ConstraintKind};
use crate::config::ExecConfig;
use crate::deferred::{DeferredConstraintsMemory, ValidationInfo};
use crate::error::Result;

pub struct Session {
    tc: Box<dyn TransactionController>,
    catalog: Arc<dyn Catalog>,
    deferred: DeferredConstraintsMemory,
    /// Modes set by `SET CONSTRAINTS`, true for deferred.
    deferred_modes: HashMap<ConstraintId, bool>,
    /// The mode set by `SET CONSTRAINTS ALL`.
    all_deferred: Option<bool>,
    isolation: IsolationLevel,
    config: ExecConfig,
    cancel: Arc<AtomicBool>,
}

impl Session {
    pub fn new(tc: Box<dyn TransactionController>, catalog: Arc<dyn Catalog>, config: ExecConfig) -> Self {
        Self {
            tc,
            catalog,
            deferred: DeferredConstraintsMemory::default(),
            deferred_modes: HashMap::new(),
            all_deferred: None,
            isolation: IsolationLevel::default(),
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Starts the execution of a statement.
    /// A pending cancel stays set until a statement observes it.
    pub fn activation(&mut self) -> Activation<'_> {
        Activation::new(self)
    }

    pub fn tc(&mut self) -> &mut dyn TransactionController {
        &mut *self.tc
    }

    pub fn catalog(&self) -> &dyn Catalog {
        &*self.catalog
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn deferred_memory(&mut self) -> &mut DeferredConstraintsMemory {
        &mut self.deferred
    }

    /// A handle another thread can use to cancel the running statement.
    pub fn cancel_flag(&self) -> &Arc<AtomicBool> {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_cancel_pending(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Is `constraint` currently deferred?
    /// Only deferrable constraints are ever deferred.
    pub fn is_deferred(&self, constraint: ConstraintId) -> bool {
        let Some(cd) = self.catalog.constraint(constraint) else {
            return false;
        };
        cd.deferrable
            && self
                .deferred_modes
                .get(&constraint)
                .copied()
                .or(self.all_deferred)
                .unwrap_or(cd.initially_deferred)
    }

    /// `SET CONSTRAINTS <ids> DEFERRED | IMMEDIATE`.
    ///
    /// Switching to immediate validates what was remembered for those
    /// constraints. On a violation the modes are left unchanged.
    pub fn set_constraints_deferred(&mut self, ids: &[ConstraintId], deferred: bool) -> Result<()> {
        if !deferred {
            self.validate_constraints(ids, false)?;
        }
        for id in ids {
            self.deferred_modes.insert(*id, deferred);
        }
        Ok(())
    }

    /// `SET CONSTRAINTS ALL DEFERRED | IMMEDIATE`.
    pub fn set_all_constraints_deferred(&mut self, deferred: bool) -> Result<()> {
        if !deferred {
            self.validate_deferred(|_, _| true, None, false)?;
        }
        self.deferred_modes.clear();
        self.all_deferred = Some(deferred);
        Ok(())
    }

    /// Changing the isolation level commits the running transaction first.
    pub fn set_isolation(&mut self, level: IsolationLevel) -> Result<()> {
        if level != self.isolation {
            self.commit()?;
        }
        self.isolation = level;
        Ok(())
    }

    /// Validates every remembered violation with the transaction aborting
    /// error variant, then ends the transaction.
    ///
    /// A violation rolls the transaction back.
    pub fn commit(&mut self) -> Result<()> {
        let res = self.validate_deferred(|_, _| true, None, true);
        self.end_transaction();
        res
    }

    pub fn rollback(&mut self) {
        self.end_transaction();
    }

    fn end_transaction(&mut self) {
        self.deferred.clear();
        self.deferred_modes.clear();
        self.all_deferred = None;
    }

    fn validate_constraints(&mut self, ids: &[ConstraintId], rollback: bool) -> Result<()> {
        for id in ids {
            let Some(cd) = self.catalog.constraint(*id) else {
                continue;
            };
            match cd.kind {
                ConstraintKind::Check { .. } => {
                    let table = cd.table;
                    self.validate_deferred(move |key, _| key == table, Some(*id), rollback)?;
                }
                _ => {
                    let Some(index) = cd.index() else { continue };
                    self.validate_deferred(move |key, _| key == index, None, rollback)?;
                }
            }
        }
        Ok(())
    }

    /// Validates the remembered violations selected by `select`.
    ///
    /// Validated entries are forgotten. When a violation is found the
    /// selected entries are kept, unless `rollback` discards them with the
    /// rest of the transaction.
    fn validate_deferred(
        &mut self,
        select: impl Fn(ConglomId, &ValidationInfo) -> bool,
        only: Option<ConstraintId>,
        rollback: bool,
    ) -> Result<()> {
        let selected = self.deferred.take_matching(select);
        if selected.is_empty() {
            return Ok(());
        }
        log::debug!("VALIDATING DEFERRED CONSTRAINTS: entries = {}", selected.len());
        let res = {
            let mut cx = self.activation();
            selected
                .iter()
                .try_for_each(|(key, info)| info.validate(*key, only, &mut cx, rollback))
        };
        match res {
            Ok(()) => {
                // A single check constraint leaves the other culprits of its table pending.
                if let Some(only) = only {
                    for (key, mut info) in selected {
                        if let ValidationInfo::Check(check) = &mut info {
                            check.forget_culprit(only);
                            if !check.culprits().is_empty() {
                                self.deferred.restore(key, info);
                            }
                        }
                    }
                }
                Ok(())
            }
            Err(err) => {
                log::debug!("DEFERRED CONSTRAINT VIOLATED: {err}");
                if !rollback {
                    for (key, info) in selected {
                        self.deferred.restore(key, info);
                    }
                }
                Err(err)
            }
        }
    }
}
