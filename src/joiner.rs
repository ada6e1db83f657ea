use anyhow::Result;
use tracing::{debug, info, warn};

use crate::dispatcher::{parse_integral, parse_rounded};
use crate::errors::UsageError;
use crate::models::{CashRounding, Counter};
use crate::row::Row;
use crate::table::UsageTable;
use crate::traits::RowConsumer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JoinStats {
    pub rows: u64,
    pub dropped: u64,
    pub matched: u64,
    pub created: u64,
}

/// Left-joins a secondary source onto an aggregated table, adding each
/// row's value into one counter of the record sharing its key.
pub struct Joiner {
    table: UsageTable,
    key_column: usize,
    value_column: usize,
    counter: Counter,
    rounding: Option<CashRounding>,
    stats: JoinStats,
}

impl Joiner {
    /// Takes ownership of `table` for the duration of the join.
    ///
    /// # Returns
    /// `PreconditionNotMet` if the table is empty.
    pub fn new(
        table: UsageTable,
        key_column: usize,
        value_column: usize,
        counter: Counter,
    ) -> Result<Self> {
        if table.is_empty() {
            warn!("join requested before aggregation produced any records");
            return Err(UsageError::PreconditionNotMet(
                "join requires a populated usage table",
            ))?;
        }
        Ok(Self {
            table,
            key_column,
            value_column,
            counter,
            rounding: None,
            stats: JoinStats::default(),
        })
    }

    /// Parse the value column as a decimal and round it to whole units.
    pub fn with_rounding(mut self, rounding: CashRounding) -> Self {
        self.rounding = Some(rounding);
        self
    }

    pub fn finish(self) -> (UsageTable, JoinStats) {
        info!(
            rows = self.stats.rows,
            dropped = self.stats.dropped,
            matched = self.stats.matched,
            created = self.stats.created,
            counter = self.counter.name(),
            "join finished"
        );
        (self.table, self.stats)
    }
}

impl RowConsumer for Joiner {
    fn consume(&mut self, row: &Row) -> Result<()> {
        self.stats.rows += 1;
        let Some(key) = row.key(self.key_column) else {
            debug!(line = row.line(), column = self.key_column, "dropping join row without key");
            self.stats.dropped += 1;
            return Ok(());
        };
        let field = row.field_or(self.value_column, "");
        let amount = match self.rounding {
            Some(rounding) => parse_rounded(field, row.line(), rounding)?,
            None => parse_integral(field, row.line())?,
        };
        if self.table.merge(key, self.counter, amount)? {
            self.stats.created += 1;
        } else {
            self.stats.matched += 1;
        }
        Ok(())
    }
}
