use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::UsageError;
use crate::row::Row;
use crate::traits::CSVWrite;

/// Policy for rows too short for a requested column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMalformed {
    /// Drop the row and count it.
    #[default]
    Skip,
    /// Abort the pass with `MalformedRow`.
    Fail,
}

/// Row counts of one streaming pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PassStats {
    pub rows_in: u64,
    pub rows_out: u64,
    pub dropped: u64,
}

impl PassStats {
    fn log(&self, stage: &str) {
        info!(
            stage,
            rows_in = self.rows_in,
            rows_out = self.rows_out,
            dropped = self.dropped,
            "pass finished"
        );
    }
}

/// Keeps a fixed list of columns, in the given order. Indices may repeat.
#[derive(Debug, Clone)]
pub struct ColumnProjector {
    columns: Vec<usize>,
    on_malformed: OnMalformed,
}

impl ColumnProjector {
    pub fn new(columns: Vec<usize>, on_malformed: OnMalformed) -> Self {
        Self {
            columns,
            on_malformed,
        }
    }

    /// Returns the projected fields, or `None` when the row is skipped.
    pub fn project<'a>(&self, row: &'a Row) -> Result<Option<Vec<&'a str>>> {
        if let Some(column) = self.columns.iter().find(|column| !row.has_field(**column)) {
            return match self.on_malformed {
                OnMalformed::Skip => {
                    debug!(line = row.line(), column, "skipping short row");
                    Ok(None)
                }
                OnMalformed::Fail => Err(UsageError::MalformedRow {
                    line: row.line(),
                    required: *column,
                    found: row.len(),
                })?,
            };
        }
        Ok(Some(
            self.columns
                .iter()
                .map(|column| row.field_or(*column, ""))
                .collect(),
        ))
    }

    /// Streams `rows` through the projection into `writer`.
    pub fn run<I>(&self, rows: I, writer: &mut impl CSVWrite) -> Result<PassStats>
    where
        I: IntoIterator<Item = Result<Row>>,
    {
        let mut stats = PassStats::default();
        for row in rows {
            let row = row?;
            stats.rows_in += 1;
            match self.project(&row)? {
                Some(fields) => {
                    writer.write_record(fields)?;
                    stats.rows_out += 1;
                }
                None => stats.dropped += 1,
            }
        }
        writer.flush()?;
        stats.log("project");
        Ok(stats)
    }
}

/// Streaming, order-preserving row predicates. Rows too short for the
/// tested column never match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowFilter {
    /// Field equals a literal, e.g. a success result code.
    Equals { column: usize, value: String },
    /// Field is one of a small set of literals, e.g. voice or SMS types.
    OneOf { column: usize, values: Vec<String> },
}

impl RowFilter {
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            RowFilter::Equals { column, value } => row.field(*column) == Some(value.as_str()),
            RowFilter::OneOf { column, values } => row
                .field(*column)
                .is_some_and(|field| values.iter().any(|value| value == field)),
        }
    }

    /// Copies every matching row of `rows` to `writer` unchanged.
    pub fn run<I>(&self, rows: I, writer: &mut impl CSVWrite) -> Result<PassStats>
    where
        I: IntoIterator<Item = Result<Row>>,
    {
        let mut stats = PassStats::default();
        for row in rows {
            let row = row?;
            stats.rows_in += 1;
            if self.matches(&row) {
                writer.write_record(row.fields())?;
                stats.rows_out += 1;
            } else {
                stats.dropped += 1;
            }
        }
        writer.flush()?;
        stats.log("filter");
        Ok(stats)
    }
}
