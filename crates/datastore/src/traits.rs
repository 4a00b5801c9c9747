use quarry_lib::{ColumnOrdering, FixedBitSet, Row};
use quarry_primitives::{ConglomId, RowLocation, SortId};

use crate::qualifier::{Qualifiers, ScanRange};
use crate::Result;

/// Transaction isolation levels, weakest first.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// At these levels a read lock may be released before the row
    /// reaches the caller, so whoever later fetches by location must lock again.
    pub fn releases_read_locks_early(self) -> bool {
        matches!(self, Self::ReadUncommitted | Self::ReadCommitted)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum LockMode {
    #[default]
    Record,
    Table,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum OpenMode {
    #[default]
    ReadOnly,
    ForUpdate,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConglomerateKind {
    /// Unordered rows addressed by location.
    Heap,
    /// Rows ordered on all columns, the last of which is a row location.
    BTree {
        /// The number of leading key columns.
        key_cols: usize,
        /// Reject a second row with equal non-null key columns.
        unique: bool,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ConglomerateInfo {
    pub id: ConglomId,
    pub kind: ConglomerateKind,
    /// Session scoped and not logged.
    pub temporary: bool,
}

impl ConglomerateInfo {
    /// Does a scan of this conglomerate return rows in key order?
    pub fn is_keyed(&self) -> bool {
        matches!(self.kind, ConglomerateKind::BTree { .. })
    }
}

/// Everything needed to position a scan.
#[derive(Debug, Clone, Default)]
pub struct ScanSpec {
    pub range: ScanRange,
    pub qualifiers: Qualifiers,
    pub mode: OpenMode,
    pub lock: LockMode,
    pub isolation: IsolationLevel,
}

impl ScanSpec {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn range(range: ScanRange) -> Self {
        Self {
            range,
            ..Self::default()
        }
    }

    pub fn with_qualifiers(mut self, qualifiers: Qualifiers) -> Self {
        self.qualifiers = qualifiers;
        self
    }

    pub fn for_update(mut self) -> Self {
        self.mode = OpenMode::ForUpdate;
        self
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }
}

/// A row handed out by a group fetch, with its location when it has one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub row: Row,
    pub loc: Option<RowLocation>,
}

/// A positioned, forward only cursor over a conglomerate or a completed sort.
pub trait ScanController {
    /// Advances to the next qualifying row and returns a copy of it.
    fn next(&mut self) -> Result<Option<Row>>;

    /// Fetches up to `max` qualifying rows into `buf`, returning how many.
    /// Fewer than `max` means the scan is exhausted.
    fn fetch_next_group(&mut self, buf: &mut Vec<Fetched>, max: usize) -> Result<usize> {
        let mut n = 0;
        while n < max {
            let Some(row) = self.next()? else { break };
            let loc = self.row_location().ok();
            buf.push(Fetched { row, loc });
            n += 1;
        }
        Ok(n)
    }

    /// The location of the current row.
    /// For a btree scan, the location carried by the index row.
    fn row_location(&self) -> Result<RowLocation>;

    /// Deletes the current row. Returns false if it was already gone.
    fn delete_current(&mut self) -> Result<bool>;

    /// Repositions the scan at the start of a new range,
    /// keeping the underlying resources.
    fn reopen(&mut self, range: ScanRange, qualifiers: Qualifiers) -> Result<()>;

    /// Rows examined since the scan was opened, qualifying or not.
    fn rows_visited(&self) -> u64;

    fn is_keyed(&self) -> bool;

    /// Releases the scan. Further calls fail with `ScanClosed`.
    fn close(&mut self);
}

/// The outcome of inserting into a conglomerate.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(RowLocation),
    /// A unique btree already holds a row with the same key; nothing was inserted.
    Duplicate,
}

/// Point access to a heap or a btree.
pub trait ConglomerateController {
    fn info(&self) -> ConglomerateInfo;

    fn insert(&mut self, row: &Row) -> Result<InsertOutcome>;

    /// Inserts even if a unique btree holds the key already.
    fn insert_unchecked(&mut self, row: &Row) -> Result<RowLocation>;

    /// Deletes the row at `loc`. Returns false if no row was there.
    fn delete(&mut self, loc: RowLocation) -> Result<bool>;

    /// Overwrites the columns of the row at `loc` selected by `valid`,
    /// taking their values from the same positions of `row`.
    /// With no `valid`, the whole row is replaced.
    fn replace(&mut self, loc: RowLocation, row: &Row, valid: Option<&FixedBitSet>) -> Result<bool>;

    /// Fetches the row at `loc`, with only the `valid` columns filled in.
    /// `lock` asks for the row to be locked again before it is read.
    fn fetch(&mut self, loc: RowLocation, valid: Option<&FixedBitSet>, lock: bool) -> Result<Option<Row>>;

    fn close(&mut self);
}

/// Receives rows as a sort eliminates duplicates.
///
/// Aggregating sorts merge the aggregate state of `new` into `existing`.
pub trait SortObserver: Send + Sync {
    /// Called when a row compares equal, on the sort columns, to a kept row.
    /// Return `Some` to keep the row as well, `None` once it has been merged away.
    fn insert_duplicate_key(&mut self, new: Row, existing: &mut Row) -> anyhow::Result<Option<Row>>;
}

/// Loads rows into a sort.
pub trait SortController {
    fn insert(&mut self, row: Row) -> Result<()>;

    /// Ends the load phase. The sort can then be scanned.
    fn complete(&mut self) -> Result<()>;
}

/// The parameters of a sort.
pub struct SortSpec {
    pub ordering: Vec<ColumnOrdering>,
    /// Eliminate rows equal on the sort columns, through `observer` if any.
    pub eliminate_duplicates: bool,
    pub observer: Option<Box<dyn SortObserver>>,
}

impl SortSpec {
    pub fn new(ordering: Vec<ColumnOrdering>) -> Self {
        Self {
            ordering,
            eliminate_duplicates: false,
            observer: None,
        }
    }

    pub fn distinct(mut self) -> Self {
        self.eliminate_duplicates = true;
        self
    }

    pub fn with_observer(mut self, observer: Box<dyn SortObserver>) -> Self {
        self.eliminate_duplicates = true;
        self.observer = Some(observer);
        self
    }
}

/// The store as seen from a transaction.
pub trait TransactionController {
    fn open_scan(&mut self, conglom: ConglomId, spec: ScanSpec) -> Result<Box<dyn ScanController>>;

    fn open_conglomerate(
        &mut self,
        conglom: ConglomId,
        mode: OpenMode,
        lock: LockMode,
        isolation: IsolationLevel,
    ) -> Result<Box<dyn ConglomerateController>>;

    fn conglomerate_info(&self, conglom: ConglomId) -> Result<ConglomerateInfo>;

    fn create_conglomerate(&mut self, kind: ConglomerateKind, temporary: bool) -> Result<ConglomId>;

    fn drop_conglomerate(&mut self, conglom: ConglomId) -> Result<()>;

    fn create_sort(&mut self, spec: SortSpec) -> Result<SortId>;

    fn open_sort(&mut self, sort: SortId) -> Result<Box<dyn SortController>>;

    /// Scans a completed sort in order.
    fn open_sort_scan(&mut self, sort: SortId) -> Result<Box<dyn ScanController>>;

    fn drop_sort(&mut self, sort: SortId) -> Result<()>;
}
