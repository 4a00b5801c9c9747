use std::time::Duration;

/// Run-time statistics of a single result set.
///
/// Row counters are always maintained.
/// Timings are only accumulated when statistics collection is enabled for
/// the statement, so that no clock is read otherwise.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResultSetStats {
    /// How many rows were read from the source or the store?
    ///
    /// It is independent of the number of rows returned.
    /// A restriction may read many rows and return only one.
    pub rows_seen: u64,
    /// How many of the rows seen were rejected by a restriction?
    pub rows_filtered: u64,
    /// How many times the result set was opened or reopened.
    pub num_opens: u64,
    pub open_time: Duration,
    pub next_time: Duration,
    pub close_time: Duration,
}

impl ResultSetStats {
    /// The number of rows returned, i.e. seen but not filtered.
    pub fn rows_returned(&self) -> u64 {
        self.rows_seen.saturating_sub(self.rows_filtered)
    }

    pub fn merge(
        &mut self,
        ResultSetStats {
            rows_seen,
            rows_filtered,
            num_opens,
            open_time,
            next_time,
            close_time,
        }: ResultSetStats,
    ) {
        self.rows_seen += rows_seen;
        self.rows_filtered += rows_filtered;
        self.num_opens += num_opens;
        self.open_time += open_time;
        self.next_time += next_time;
        self.close_time += close_time;
    }
}
