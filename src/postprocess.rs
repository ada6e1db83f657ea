//! Post-clustering helpers: label rows with their group and summarise
//! numeric columns per group.

use std::collections::BTreeMap;

use anyhow::Result;
use rust_decimal::prelude::*;
use tracing::{info, warn};

use crate::errors::UsageError;
use crate::row::Row;
use crate::traits::{CSVExport, CSVWrite};
use crate::transform::PassStats;

/// Appends to every data row the group label found on the same line of the
/// assignment stream.
pub fn assign_groups<I, A>(rows: I, assignments: A, writer: &mut impl CSVWrite) -> Result<PassStats>
where
    I: IntoIterator<Item = Result<Row>>,
    A: IntoIterator<Item = Result<Row>>,
{
    let mut assignments = assignments.into_iter();
    let mut stats = PassStats::default();
    for row in rows {
        let row = row?;
        stats.rows_in += 1;
        let label = match assignments.next() {
            Some(assignment) => assignment?.field_or(0, "").trim().to_string(),
            None => Err(UsageError::MissingAssignment { line: row.line() })?,
        };
        let mut fields: Vec<&str> = row.fields().collect();
        fields.push(&label);
        writer.write_record(fields)?;
        stats.rows_out += 1;
    }
    let leftover = assignments.count();
    if leftover > 0 {
        warn!(leftover, "assignment file has more lines than the data file");
    }
    writer.flush()?;
    info!(rows = stats.rows_out, "group assignment finished");
    Ok(stats)
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupSummary {
    count: u64,
    sums: Vec<Decimal>,
    mins: Vec<Decimal>,
    maxs: Vec<Decimal>,
}

impl GroupSummary {
    fn new(values: Vec<Decimal>) -> Self {
        Self {
            count: 1,
            sums: values.clone(),
            mins: values.clone(),
            maxs: values,
        }
    }

    fn add(&mut self, label: &str, values: &[Decimal]) -> Result<()> {
        self.count += 1;
        for (i, value) in values.iter().enumerate() {
            self.sums[i] = self.sums[i]
                .checked_add(*value)
                .ok_or_else(|| UsageError::NumericOverflow {
                    key: label.to_string(),
                    counter: "sum",
                })?;
            self.mins[i] = self.mins[i].min(*value);
            self.maxs[i] = self.maxs[i].max(*value);
        }
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self, feature: usize) -> Decimal {
        self.sums[feature]
    }

    pub fn min(&self, feature: usize) -> Decimal {
        self.mins[feature]
    }

    pub fn max(&self, feature: usize) -> Decimal {
        self.maxs[feature]
    }

    /// Mean over this group's own rows.
    pub fn mean(&self, feature: usize) -> Decimal {
        self.sum(feature)
            .checked_div(Decimal::from(self.count))
            .unwrap_or_default()
    }
}

/// Count, sum, min, max and mean of selected columns, per group label.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupStats {
    names: Vec<String>,
    groups: BTreeMap<String, GroupSummary>,
}

impl GroupStats {
    #[cfg(test)]
    pub fn get(&self, label: &str) -> Option<&GroupSummary> {
        self.groups.get(label)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

fn parse_feature(field: &str, line: u64) -> Result<Decimal> {
    let field = field.trim();
    if field.is_empty() {
        return Ok(Decimal::ZERO);
    }
    Ok(field
        .parse::<Decimal>()
        .or_else(|_| Decimal::from_scientific(field))
        .map_err(|_| UsageError::InvalidNumber {
            line,
            value: field.to_string(),
        })?)
}

/// Summarises `columns` of a labelled stream whose last field is the group.
/// Feature names come from `header` when given, otherwise `c<index>`.
pub fn group_stats<I>(rows: I, columns: &[usize], header: Option<&Row>) -> Result<GroupStats>
where
    I: IntoIterator<Item = Result<Row>>,
{
    let names = columns
        .iter()
        .map(|column| match header.and_then(|h| h.field(*column)) {
            Some(name) => name.trim().to_string(),
            None => format!("c{column}"),
        })
        .collect();

    let mut groups: BTreeMap<String, GroupSummary> = BTreeMap::new();
    let mut rows_in = 0u64;
    for row in rows {
        let row = row?;
        rows_in += 1;
        let label = row.require(row.len().saturating_sub(1))?.trim();
        let values = columns
            .iter()
            .map(|column| parse_feature(row.require(*column)?, row.line()))
            .collect::<Result<Vec<_>>>()?;
        match groups.get_mut(label) {
            Some(summary) => summary.add(label, &values)?,
            None => {
                groups.insert(label.to_string(), GroupSummary::new(values));
            }
        }
    }
    let stats = GroupStats { names, groups };
    info!(rows = rows_in, groups = stats.len(), "group statistics finished");
    Ok(stats)
}

impl CSVExport for GroupStats {
    fn export(&self, writer: &mut impl CSVWrite) -> Result<usize> {
        for (label, summary) in &self.groups {
            let mut fields = vec![label.clone(), summary.count().to_string()];
            for feature in 0..self.names.len() {
                fields.push(format!("{:.2}", summary.mean(feature)));
                fields.push(format!("{:.2}", summary.min(feature)));
                fields.push(format!("{:.2}", summary.max(feature)));
            }
            writer.write_record(fields)?;
        }
        Ok(self.groups.len())
    }

    fn header(&self) -> Option<Vec<String>> {
        let mut columns = vec!["group".to_string(), "count".to_string()];
        for name in self.names() {
            columns.push(format!("{name}_mean"));
            columns.push(format!("{name}_min"));
            columns.push(format!("{name}_max"));
        }
        Some(columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csv_writer::{DelimitedWriter, write_table};
    use crate::row::{Delimiter, RowReader};

    fn reader(input: &str) -> RowReader<&[u8]> {
        RowReader::new(input.as_bytes(), Delimiter::COMMA, false)
    }

    #[test]
    fn test_assign_groups_appends_label() -> Result<()> {
        let mut writer = DelimitedWriter::new(Vec::new(), Delimiter::COMMA);
        let stats = assign_groups(reader("1000,50,10\n2000,5,0\n"), reader("3\n0\n"), &mut writer)?;
        assert_eq!(stats.rows_out, 2);
        let out = String::from_utf8(writer.into_inner()?)?;
        assert_eq!(out, "1000,50,10,3\n2000,5,0,0\n");
        Ok(())
    }

    #[test]
    fn test_assign_groups_missing_label_fails() {
        let mut writer = DelimitedWriter::new(Vec::new(), Delimiter::COMMA);
        let err = assign_groups(reader("a,1\nb,2\n"), reader("1\n"), &mut writer).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UsageError>(),
            Some(UsageError::MissingAssignment { line: 2 })
        ));
    }

    #[test]
    fn test_group_stats_per_group() -> Result<()> {
        let input = "A,10,1,0\nB,4,2,1\nC,6,3,0\nD,1,1.5,1\n";
        let stats = group_stats(reader(input), &[1, 2], None)?;

        assert_eq!(stats.len(), 2);
        assert_eq!(stats.names(), &["c1".to_string(), "c2".to_string()]);

        let zero = stats.get("0").unwrap();
        assert_eq!(zero.count(), 2);
        assert_eq!(zero.sum(0), dec!(16));
        assert_eq!(zero.mean(0), dec!(8));
        assert_eq!(zero.min(0), dec!(6));
        assert_eq!(zero.max(1), dec!(3));

        let one = stats.get("1").unwrap();
        assert_eq!(one.mean(1), dec!(1.75));
        assert_eq!(one.min(0), dec!(1));
        Ok(())
    }

    fn export(stats: &GroupStats, delimiter: Delimiter) -> Result<String> {
        let mut writer = DelimitedWriter::new(Vec::new(), delimiter);
        if let Some(header) = stats.header() {
            writer.write_record(header)?;
        }
        write_table(stats, None, &mut writer)?;
        Ok(String::from_utf8(writer.into_inner()?)?)
    }

    #[test]
    fn test_group_stats_export_with_header_names() -> Result<()> {
        let mut rows = reader("MSISDN,Voice,Group\nA,3,1\nB,4,1\n");
        let header = rows.next().transpose()?;
        let stats = group_stats(rows, &[1], header.as_ref())?;
        assert_eq!(
            export(&stats, Delimiter::COMMA)?,
            "group,count,Voice_mean,Voice_min,Voice_max\n1,2,3.50,3.00,4.00\n"
        );
        Ok(())
    }

    #[test]
    fn test_group_stats_header_uses_output_delimiter() -> Result<()> {
        let input = "MSISDN|Voice|Group\nA|3|1\nB|4|1\n";
        let mut rows = RowReader::new(input.as_bytes(), Delimiter::PIPE, false);
        let header = rows.next().transpose()?;
        let stats = group_stats(rows, &[1], header.as_ref())?;
        assert_eq!(
            export(&stats, Delimiter::PIPE)?,
            "group|count|Voice_mean|Voice_min|Voice_max\n1|2|3.50|3.00|4.00\n"
        );
        Ok(())
    }

    #[test]
    fn test_group_stats_short_row_fails() {
        let err = group_stats(reader("A,1\n"), &[3], None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UsageError>(),
            Some(UsageError::MalformedRow { required: 3, .. })
        ));
    }
}
