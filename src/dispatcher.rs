use std::collections::BTreeMap;

use anyhow::Result;
use rust_decimal::Decimal;

use crate::errors::UsageError;
use crate::models::{CashRounding, RecordType};
use crate::row::Row;

/// Parses a whole-unit usage value. The empty string is zero.
pub fn parse_integral(field: &str, line: u64) -> Result<i64> {
    let field = field.trim();
    if field.is_empty() {
        return Ok(0);
    }
    Ok(field.parse::<i64>().map_err(|_| UsageError::InvalidNumber {
        line,
        value: field.to_string(),
    })?)
}

/// Parses a decimal amount and rounds it to whole units with `rounding`.
/// The empty string is zero.
pub fn parse_rounded(field: &str, line: u64, rounding: CashRounding) -> Result<i64> {
    let field = field.trim();
    if field.is_empty() {
        return Ok(0);
    }
    let amount = field
        .parse::<Decimal>()
        .or_else(|_| Decimal::from_scientific(field))
        .map_err(|_| UsageError::InvalidNumber {
            line,
            value: field.to_string(),
        })?;
    match rounding.round(amount) {
        Some(units) => Ok(units),
        None => Err(UsageError::InvalidNumber {
            line,
            value: field.to_string(),
        })?,
    }
}

/// Maps each record type to the column holding its usage value.
#[derive(Debug, Clone, Default)]
pub struct FieldDispatcher {
    columns: BTreeMap<RecordType, usize>,
    cash_rounding: CashRounding,
}

impl FieldDispatcher {
    pub fn new(columns: BTreeMap<RecordType, usize>, cash_rounding: CashRounding) -> Self {
        Self {
            columns,
            cash_rounding,
        }
    }

    #[cfg(test)]
    pub fn with_column(mut self, record_type: RecordType, column: usize) -> Self {
        self.columns.insert(record_type, column);
        self
    }

    /// Returns the amount `row` contributes for `record_type`.
    ///
    /// Unmapped types, rows too short to hold the mapped column and empty
    /// fields all contribute 0. Cash is rounded to whole units.
    pub fn contribution(&self, record_type: RecordType, row: &Row) -> Result<i64> {
        let Some(column) = self.columns.get(&record_type) else {
            return Ok(0);
        };
        let Some(field) = row.field(*column) else {
            return Ok(0);
        };
        match record_type {
            RecordType::Cash => parse_rounded(field, row.line(), self.cash_rounding),
            _ => parse_integral(field, row.line()),
        }
    }
}
