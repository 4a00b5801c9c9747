use enum_as_inner::EnumAsInner;
use quarry_primitives::{ConglomId, RowLocation, SortId};
use thiserror::Error;

#[derive(Error, Debug, EnumAsInner)]
pub enum StoreError {
    #[error("Conglomerate `{0}` does not exist")]
    NoSuchConglomerate(ConglomId),
    #[error("Sort `{0}` does not exist")]
    NoSuchSort(SortId),
    #[error("Scan on conglomerate `{0}` is not positioned on a row")]
    ScanNotPositioned(ConglomId),
    #[error("Scan on conglomerate `{0}` is closed")]
    ScanClosed(ConglomId),
    #[error("Row {0} not found")]
    RowNotFound(RowLocation),
    #[error("A lock on conglomerate `{0}` could not be obtained within the time requested")]
    LockTimeout(ConglomId),
    #[error("A lock on conglomerate `{0}` could not be obtained due to a deadlock")]
    Deadlock(ConglomId),
    #[error("Invalid request: {0}")]
    Invalid(Box<str>),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    pub fn invalid(msg: impl Into<Box<str>>) -> Self {
        Self::Invalid(msg.into())
    }
}
