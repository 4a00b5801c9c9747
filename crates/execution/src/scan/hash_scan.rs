use quarry_datastore::Qualifier;
use quarry_expr::Expr;
use quarry_lib::{ColId, OpCmp, ResultSetNumber, Row};

use super::{ScanCore, ScanParams};
use crate::activation::Activation;
use crate::error::Result;
use crate::hash_table::HashTable;
use crate::result_set::{Phase, ResultSet, ResultSetBase};

/// Loads a scan into a hash table once per open and returns the rows
/// matching a probe key evaluated at every (re)open.
///
/// The table buckets null keys together, so every returned row is
/// re-checked with SQL equality on the key columns.
pub struct HashScanResultSet {
    base: ResultSetBase,
    core: ScanCore,
    /// Positions of the hashed columns in the returned rows.
    key_cols: Vec<ColId>,
    probe: Vec<Expr>,
    /// Further per-row qualifiers checked on the rows of a bucket.
    next_qualifiers: Vec<Qualifier>,
    table: Option<HashTable>,
    bucket: Vec<Row>,
    pos: usize,
    refine: Vec<Qualifier>,
}

impl HashScanResultSet {
    pub fn new(rsn: ResultSetNumber, params: ScanParams, key_cols: &[u32], probe: Vec<Expr>) -> Self {
        Self {
            base: ResultSetBase::new(rsn),
            core: ScanCore::new(params),
            key_cols: key_cols.iter().copied().map(ColId).collect(),
            probe,
            next_qualifiers: Vec::new(),
            table: None,
            bucket: Vec::new(),
            pos: 0,
            refine: Vec::new(),
        }
    }

    pub fn with_next_qualifiers(mut self, qualifiers: Vec<Qualifier>) -> Self {
        self.next_qualifiers = qualifiers;
        self
    }

    /// The number of rows loaded into the hash table.
    pub fn hash_table_rows(&self) -> usize {
        self.table.as_ref().map_or(0, HashTable::row_count)
    }

    fn build(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let mut table = HashTable::new(self.key_cols.clone(), cx.config().hash_table_initial_capacity);
        self.core.position(cx)?;
        while let Some((candidate, loc)) = self.core.next_candidate(cx, &mut self.base.stats)? {
            table.put_row(self.core.output(&candidate, loc)?);
        }
        self.core.close();
        log::debug!(
            "HASH TABLE BUILT: rsn = {}, rows = {}, keys = {}",
            self.base.rsn,
            table.row_count(),
            table.key_count()
        );
        self.table = Some(table);
        Ok(())
    }

    /// Evaluates the probe key and looks up its bucket.
    fn probe(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let empty = Row::default();
        let key = self
            .probe
            .iter()
            .map(|e| e.eval(&empty, &*cx).map(|v| v.into_owned()))
            .collect::<Result<Row, _>>()?;
        self.refine = self
            .key_cols
            .iter()
            .zip(key.iter())
            .map(|(col, value)| Qualifier::new(col.0, OpCmp::Eq, value.clone()))
            .chain(self.next_qualifiers.iter().cloned())
            .collect();
        self.bucket = self
            .table
            .as_ref()
            .map(|t| t.get(&key).to_vec())
            .unwrap_or_default();
        self.pos = 0;
        Ok(())
    }
}

impl ResultSet for HashScanResultSet {
    fn kind(&self) -> &'static str {
        "hash scan"
    }

    fn base(&self) -> &ResultSetBase {
        &self.base
    }

    fn open_core(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let start = self.base.start_timer(cx);
        if self.table.is_none() {
            self.build(cx)?;
        }
        self.probe(cx)?;
        self.base.mark_open();
        self.base.stop_timer(start, Phase::Open);
        Ok(())
    }

    /// Probes again without rebuilding the table.
    fn reopen_core(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        if self.table.is_none() {
            return self.open_core(cx);
        }
        let start = self.base.start_timer(cx);
        self.probe(cx)?;
        self.base.mark_open();
        self.base.stop_timer(start, Phase::Open);
        Ok(())
    }

    fn next_row_core(&mut self, cx: &mut Activation<'_>) -> Result<Option<Row>> {
        self.base.check_open("next_row")?;
        let start = self.base.start_timer(cx);
        let mut found = None;
        while let Some(row) = self.bucket.get(self.pos) {
            self.pos += 1;
            self.base.stats.rows_seen += 1;
            if self.refine.iter().all(|q| q.matches(row)) {
                found = Some(row.clone());
                break;
            }
            self.base.stats.rows_filtered += 1;
        }
        self.base.set_current_row(cx, found.as_ref());
        self.base.stop_timer(start, Phase::Next);
        Ok(found)
    }

    fn close(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        self.core.close();
        self.table = None;
        self.bucket.clear();
        self.base.mark_closed(cx);
        Ok(())
    }

    fn requires_relocking(&self) -> Result<bool> {
        Ok(self.core.requires_relocking())
    }
}
