use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dispatcher::{FieldDispatcher, parse_integral};
use crate::errors::UsageError;
use crate::models::RecordType;
use crate::row::Row;
use crate::table::UsageTable;
use crate::traits::{CSVExport, CSVWrite, RowConsumer};

/// What to do with a row whose discriminant is not a known record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownTypes {
    /// Create an all-zero record for the key if it is new.
    #[default]
    CreateRecord,
    /// Skip the row without touching the table.
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AggregationStats {
    pub rows: u64,
    pub dropped: u64,
    pub unknown_types: u64,
    pub keys: usize,
}

/// Single-pass grouping reducer: one usage record per key, every row's
/// contribution added to the counter its record type selects.
pub struct Aggregator {
    key_column: usize,
    type_column: usize,
    dispatcher: FieldDispatcher,
    unknown_types: UnknownTypes,
    table: UsageTable,
    stats: AggregationStats,
}

impl Aggregator {
    pub fn new(
        key_column: usize,
        type_column: usize,
        dispatcher: FieldDispatcher,
        unknown_types: UnknownTypes,
    ) -> Self {
        Self {
            key_column,
            type_column,
            dispatcher,
            unknown_types,
            table: UsageTable::new(),
            stats: AggregationStats::default(),
        }
    }

    pub fn stats(&self) -> AggregationStats {
        AggregationStats {
            keys: self.table.len(),
            ..self.stats
        }
    }

    /// Hands the finished table over to the next stage.
    pub fn finish(self) -> (UsageTable, AggregationStats) {
        let stats = self.stats();
        info!(
            rows = stats.rows,
            dropped = stats.dropped,
            unknown_types = stats.unknown_types,
            keys = stats.keys,
            "aggregation finished"
        );
        (self.table, stats)
    }
}

impl RowConsumer for Aggregator {
    fn consume(&mut self, row: &Row) -> Result<()> {
        self.stats.rows += 1;

        let Some(key) = row.key(self.key_column) else {
            debug!(line = row.line(), column = self.key_column, "dropping row without key");
            self.stats.dropped += 1;
            return Ok(());
        };

        let record_type = row.field(self.type_column).and_then(RecordType::parse);
        match record_type {
            Some(record_type) => {
                let amount = self.dispatcher.contribution(record_type, row)?;
                self.table.merge(key, record_type.counter(), amount)?;
            }
            None => {
                self.stats.unknown_types += 1;
                if self.unknown_types == UnknownTypes::CreateRecord {
                    self.table.touch(key);
                }
            }
        }
        Ok(())
    }
}

/// Sums one value column per key. Missing and empty values count as 0.
pub struct ColumnSum {
    key_column: usize,
    value_column: usize,
    sums: HashMap<String, i64>,
    rows: u64,
    dropped: u64,
}

impl ColumnSum {
    pub fn new(key_column: usize, value_column: usize) -> Self {
        Self {
            key_column,
            value_column,
            sums: HashMap::new(),
            rows: 0,
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.sums.len()
    }
}

#[cfg(test)]
impl ColumnSum {
    pub fn get(&self, key: &str) -> Option<i64> {
        self.sums.get(key).copied()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl RowConsumer for ColumnSum {
    fn consume(&mut self, row: &Row) -> Result<()> {
        self.rows += 1;
        let Some(key) = row.key(self.key_column) else {
            debug!(line = row.line(), "dropping row without key");
            self.dropped += 1;
            return Ok(());
        };
        let amount = parse_integral(row.field_or(self.value_column, ""), row.line())?;
        let sum = self.sums.entry(key.to_string()).or_insert(0);
        *sum = sum
            .checked_add(amount)
            .ok_or_else(|| UsageError::NumericOverflow {
                key: key.to_string(),
                counter: "sum",
            })?;
        Ok(())
    }
}

impl CSVExport for ColumnSum {
    fn export(&self, writer: &mut impl CSVWrite) -> Result<usize> {
        let mut keys: Vec<&String> = self.sums.keys().collect();
        keys.sort();
        for key in &keys {
            writer.write_record([key.to_string(), self.sums[key.as_str()].to_string()])?;
        }
        Ok(keys.len())
    }
}

/// Convenience wrapper: aggregates `rows` into a fresh table.
pub fn sum_by_key<I>(rows: I, key_column: usize, value_column: usize) -> Result<ColumnSum>
where
    I: IntoIterator<Item = Result<Row>>,
{
    let mut sum = ColumnSum::new(key_column, value_column);
    sum.consume_all(rows)?;
    info!(rows = sum.rows, dropped = sum.dropped, keys = sum.len(), "column sum finished");
    Ok(sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CashRounding, Counter};
    use crate::row::{Delimiter, RowReader};

    fn aggregator(unknown_types: UnknownTypes) -> Aggregator {
        let dispatcher = FieldDispatcher::default()
            .with_column(RecordType::Data, 2)
            .with_column(RecordType::Voice, 2)
            .with_column(RecordType::Sms, 2)
            .with_column(RecordType::Cash, 2);
        Aggregator::new(0, 1, dispatcher, unknown_types)
    }

    fn rows(lines: &[&str]) -> Vec<Result<Row>> {
        lines
            .iter()
            .enumerate()
            .map(|(i, line)| Ok(Row::tokenize(line, Delimiter::COMMA, i as u64 + 1)))
            .collect()
    }

    fn aggregate(lines: &[&str]) -> Result<UsageTable> {
        let mut aggregator = aggregator(UnknownTypes::CreateRecord);
        aggregator.consume_all(rows(lines))?;
        Ok(aggregator.finish().0)
    }

    #[test]
    fn test_voice_and_sms_scenario() -> Result<()> {
        let table = aggregate(&["1000,2,50", "1000,3,10", "2000,2,5"])?;
        assert_eq!(table.len(), 2);

        let first = table.get("1000").unwrap();
        assert_eq!(*first.voice(), 50);
        assert_eq!(*first.sms(), 10);

        let second = table.get("2000").unwrap();
        assert_eq!(*second.voice(), 5);
        assert_eq!(*second.sms(), 0);
        Ok(())
    }

    #[test]
    fn test_cash_rounded_on_aggregation() -> Result<()> {
        let table = aggregate(&["3000,5,12.6"])?;
        assert_eq!(*table.get("3000").unwrap().cash(), 13);
        Ok(())
    }

    #[test]
    fn test_order_does_not_change_counters() -> Result<()> {
        let lines = ["A,2,5", "B,3,1", "A,3,7", "A,2,11", "B,1,400", "C,5,2.5", "A,5,1.4"];
        let forward = aggregate(&lines)?;

        let mut reversed = lines.to_vec();
        reversed.reverse();
        assert_eq!(aggregate(&reversed)?, forward);

        let mut rotated = lines.to_vec();
        rotated.rotate_left(3);
        assert_eq!(aggregate(&rotated)?, forward);
        Ok(())
    }

    #[test]
    fn test_short_and_empty_values_count_zero() -> Result<()> {
        let table = aggregate(&["1000,2", "1000,3,", "1000,2,4"])?;
        let record = table.get("1000").unwrap();
        assert_eq!(*record.voice(), 4);
        assert_eq!(*record.sms(), 0);
        Ok(())
    }

    #[test]
    fn test_row_without_key_column_is_dropped() -> Result<()> {
        let mut aggregator = Aggregator::new(3, 1, FieldDispatcher::default(), UnknownTypes::CreateRecord);
        aggregator.consume_all(rows(&["a,2,5", "b,2,5,KEY"]))?;
        let (table, stats) = aggregator.finish();
        assert_eq!(stats.rows, 2);
        assert_eq!(stats.dropped, 1);
        assert_eq!(table.len(), 1);
        assert!(table.contains("KEY"));
        Ok(())
    }

    #[test]
    fn test_row_with_empty_key_is_dropped() -> Result<()> {
        let mut aggregator = aggregator(UnknownTypes::CreateRecord);
        aggregator.consume_all(rows(&[",2,5", ",4,1", "1000,2,1"]))?;
        let (table, stats) = aggregator.finish();
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.unknown_types, 0);
        assert_eq!(table.len(), 1);
        assert!(!table.contains(""));
        Ok(())
    }

    #[test]
    fn test_unknown_type_creates_zero_record() -> Result<()> {
        let table = aggregate(&["4000,4,99", "5000,9,1"])?;
        assert_eq!(table.len(), 2);
        assert!(table.get("4000").unwrap().is_zero_usage());
        Ok(())
    }

    #[test]
    fn test_unknown_type_ignored_when_configured() -> Result<()> {
        let mut aggregator = aggregator(UnknownTypes::Ignore);
        aggregator.consume_all(rows(&["4000,4,99", "1000,2,1"]))?;
        let (table, stats) = aggregator.finish();
        assert_eq!(stats.unknown_types, 1);
        assert_eq!(table.len(), 1);
        assert!(!table.contains("4000"));
        Ok(())
    }

    #[test]
    fn test_unmapped_known_type_still_creates_record() -> Result<()> {
        let dispatcher = FieldDispatcher::default().with_column(RecordType::Voice, 2);
        let mut aggregator = Aggregator::new(0, 1, dispatcher, UnknownTypes::Ignore);
        aggregator.consume_all(rows(&["1000,1,900"]))?;
        let (table, _) = aggregator.finish();
        assert!(table.get("1000").unwrap().is_zero_usage());
        Ok(())
    }

    #[test]
    fn test_overflow_is_fatal() {
        let mut aggregator = aggregator(UnknownTypes::CreateRecord);
        let result = aggregator.consume_all(rows(&["A,2,9223372036854775807", "A,2,1"]));
        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UsageError>(),
            Some(UsageError::NumericOverflow { counter: "voice", .. })
        ));
    }

    #[test]
    fn test_pipe_delimited_stream() -> Result<()> {
        let input = "2001|2|1000|60\n2001|3|1000|1\n2001|5|2000|0.5\n";
        let dispatcher = FieldDispatcher::default()
            .with_column(RecordType::Voice, 3)
            .with_column(RecordType::Sms, 3)
            .with_column(RecordType::Cash, 3);
        let mut aggregator = Aggregator::new(2, 1, dispatcher, UnknownTypes::CreateRecord);
        aggregator.consume_all(RowReader::new(input.as_bytes(), Delimiter::PIPE, false))?;
        let (table, stats) = aggregator.finish();
        assert_eq!(stats.rows, 3);
        assert_eq!(table.get("1000").unwrap().get(Counter::Voice), 60);
        assert_eq!(table.get("1000").unwrap().get(Counter::Sms), 1);
        assert_eq!(table.get("2000").unwrap().get(Counter::Cash), 1);
        Ok(())
    }

    #[test]
    fn test_half_even_cash_through_aggregator() -> Result<()> {
        let dispatcher = FieldDispatcher::new(
            [(RecordType::Cash, 2)].into_iter().collect(),
            CashRounding::HalfEven,
        );
        let mut aggregator = Aggregator::new(0, 1, dispatcher, UnknownTypes::CreateRecord);
        aggregator.consume_all(rows(&["A,5,0.5", "A,5,1.5", "A,5,2.5"]))?;
        let (table, _) = aggregator.finish();
        assert_eq!(*table.get("A").unwrap().cash(), 4);
        Ok(())
    }

    #[test]
    fn test_sum_by_key() -> Result<()> {
        let sum = sum_by_key(rows(&["a,3", "b,", "a,4", "c", ",9"]), 0, 1)?;
        assert_eq!(sum.get("a"), Some(7));
        assert_eq!(sum.get("b"), Some(0));
        assert_eq!(sum.get("c"), Some(0));
        assert_eq!(sum.get(""), None);
        assert_eq!(sum.len(), 3);
        assert_eq!(sum.dropped(), 1);
        Ok(())
    }
}
