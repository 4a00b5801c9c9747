use enum_as_inner::EnumAsInner;
use quarry_datastore::StoreError;
use quarry_expr::EvalError;
use thiserror::Error;

/// A violated constraint, named through the catalog.
///
/// `rollback` distinguishes the transaction aborting variant, raised when a
/// deferred constraint is found violated at commit, from the statement level
/// variant raised by an explicit switch to immediate checking.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConstraintViolation {
    #[error("The statement was aborted because it would have caused a duplicate key value in a unique or primary key constraint or unique index identified by '{constraint}' defined on '{table}'.")]
    DuplicateKey { constraint: String, table: String },
    #[error("Deferred constraint violation: duplicate key value in a unique or primary key constraint identified by '{constraint}' defined on '{table}'.")]
    DeferredDuplicateKey {
        constraint: String,
        table: String,
        rollback: bool,
    },
    #[error("The check constraint '{constraint}' was violated while performing an INSERT or UPDATE on table '{table}': {text}")]
    CheckViolation {
        constraint: String,
        table: String,
        text: String,
    },
    #[error("The deferred check constraint '{constraint}' on table '{table}' is violated: {text}")]
    DeferredCheckViolation {
        constraint: String,
        table: String,
        text: String,
        rollback: bool,
    },
    #[error("DELETE on table '{table}' caused a violation of foreign key constraint '{constraint}'.")]
    ForeignKeyRestrict { constraint: String, table: String },
    #[error("The deferred foreign key constraint '{constraint}' on table '{table}' is violated.")]
    DeferredForeignKey {
        constraint: String,
        table: String,
        rollback: bool,
    },
}

impl ConstraintViolation {
    /// Is this the transaction aborting variant?
    pub fn is_rollback(&self) -> bool {
        match self {
            Self::DeferredDuplicateKey { rollback, .. }
            | Self::DeferredCheckViolation { rollback, .. }
            | Self::DeferredForeignKey { rollback, .. } => *rollback,
            _ => false,
        }
    }

    /// The name of the violated constraint or index.
    pub fn constraint(&self) -> &str {
        match self {
            Self::DuplicateKey { constraint, .. }
            | Self::DeferredDuplicateKey { constraint, .. }
            | Self::CheckViolation { constraint, .. }
            | Self::DeferredCheckViolation { constraint, .. }
            | Self::ForeignKeyRestrict { constraint, .. }
            | Self::DeferredForeignKey { constraint, .. } => constraint,
        }
    }
}

#[derive(Error, Debug, EnumAsInner)]
pub enum ExecError {
    #[error("The result set `{op}` is not open")]
    NotOpen { op: &'static str },
    #[error("`{op}` is not supported by a {kind} result set")]
    Unsupported { op: &'static str, kind: &'static str },
    #[error(transparent)]
    Constraint(#[from] ConstraintViolation),
    #[error("The offset must be a non-negative number, found {0}")]
    InvalidOffset(i64),
    #[error("The fetch first value must be a positive number, found {0}")]
    InvalidFetchFirst(i64),
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),
    #[error("The statement has been cancelled")]
    Cancelled,
    #[error("A lock could not be obtained within the time requested: {0}")]
    LockTimeout(StoreError),
    #[error("A lock could not be obtained due to a deadlock: {0}")]
    Deadlock(StoreError),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Expr(#[from] EvalError),
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),
}

impl ExecError {
    pub fn unsupported(op: &'static str, kind: &'static str) -> Self {
        Self::Unsupported { op, kind }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<StoreError> for ExecError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::LockTimeout(_) => Self::LockTimeout(err),
            StoreError::Deadlock(_) => Self::Deadlock(err),
            // Errors raised by our own sort observers travel through the store.
            StoreError::Other(err) => match err.downcast::<ExecError>() {
                Ok(err) => err,
                Err(err) => Self::Store(StoreError::Other(err)),
            },
            err => Self::Store(err),
        }
    }
}

impl From<quarry_lib::ValueError> for ExecError {
    fn from(err: quarry_lib::ValueError) -> Self {
        Self::Expr(EvalError::Value(err))
    }
}

pub type Result<T, E = ExecError> = core::result::Result<T, E>;
