use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::{
    aggregator::{Aggregator, sum_by_key},
    config::{PipelineConfig, StageConfig},
    csv_writer::{DelimitedWriter, TableView, write_table},
    errors::UsageError,
    joiner::Joiner,
    postprocess::{assign_groups, group_stats},
    row::{Delimiter, Row, RowReader, read_header},
    table::UsageTable,
    traits::{CSVExport, CSVWrite, RowConsumer},
    transform::{ColumnProjector, RowFilter},
};
use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tracing::{info, info_span, warn};

type FileWriter = DelimitedWriter<BufWriter<File>>;

/// Runs the configured stages in order. File stages hand over by path; the
/// usage table moves from aggregate to join to prune to write, owned by one
/// stage at a time.
pub struct Pipeline {
    config: PipelineConfig,
    table: Option<UsageTable>,
    pruned: bool,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            table: None,
            pruned: false,
        }
    }

    pub fn run(&mut self) -> Result<()> {
        let stages = self.config.stages.clone();
        for (index, stage) in stages.iter().enumerate() {
            let _span = info_span!("stage", index, name = stage.name()).entered();
            self.run_stage(stage)
                .with_context(|| format!("stage {} ({}) failed", index, stage.name()))?;
        }
        Ok(())
    }

    pub fn run_stage(&mut self, stage: &StageConfig) -> Result<()> {
        match stage {
            StageConfig::Project {
                input,
                output,
                columns,
                delimiter,
                output_delimiter,
                input_header,
                output_header,
                on_malformed,
            } => {
                let rows = self.rows(input, *delimiter, *input_header)?;
                let projector = ColumnProjector::new(columns.clone(), *on_malformed);
                let out_delimiter = output_delimiter.unwrap_or(*delimiter);
                self.write_atomic(output, out_delimiter, |writer| {
                    if let Some(header) = output_header {
                        writer.write_header(header)?;
                    }
                    projector.run(rows, writer).map(|_| ())
                })
            }
            StageConfig::FilterEquals {
                input,
                output,
                column,
                value,
                delimiter,
                input_header,
            } => {
                let filter = RowFilter::Equals {
                    column: *column,
                    value: value.clone(),
                };
                self.filter(&filter, input, output, *delimiter, *input_header)
            }
            StageConfig::FilterTypes {
                input,
                output,
                column,
                values,
                delimiter,
                input_header,
            } => {
                let filter = RowFilter::OneOf {
                    column: *column,
                    values: values.clone(),
                };
                self.filter(&filter, input, output, *delimiter, *input_header)
            }
            StageConfig::Aggregate {
                input,
                shards,
                delimiter,
                input_header,
            } => {
                if self.table.is_some() {
                    warn!("aggregate replaces the usage table of an earlier stage");
                }
                let mut table = self.aggregate(input, *delimiter, *input_header)?;
                for shard in shards {
                    table.absorb(self.aggregate(shard, *delimiter, *input_header)?)?;
                }
                if !shards.is_empty() {
                    info!(shards = shards.len() + 1, keys = table.len(), "shards merged");
                }
                self.table = Some(table);
                self.pruned = false;
                Ok(())
            }
            StageConfig::SumByKey {
                input,
                output,
                key_column,
                value_column,
                delimiter,
                input_header,
            } => {
                let sums = sum_by_key(
                    self.rows(input, *delimiter, *input_header)?,
                    *key_column,
                    *value_column,
                )?;
                self.write_atomic(output, *delimiter, |writer| {
                    write_table(&sums, None, writer).map(|_| ())
                })
            }
            StageConfig::Join {
                input,
                key_column,
                value_column,
                counter,
                delimiter,
                input_header,
                round_decimals,
            } => {
                let table = self.take_table("join")?;
                let mut joiner = Joiner::new(table, *key_column, *value_column, *counter)?;
                if let Some(rounding) = round_decimals {
                    joiner = joiner.with_rounding(*rounding);
                }
                joiner.consume_all(self.rows(input, *delimiter, *input_header)?)?;
                let (table, _) = joiner.finish();
                self.table = Some(table);
                Ok(())
            }
            StageConfig::Prune => {
                if !self.pruned && self.table.as_ref().is_some_and(UsageTable::is_empty) {
                    warn!("prune requested on an empty usage table");
                    return Err(UsageError::PreconditionNotMet(
                        "prune requires a populated usage table",
                    ))?;
                }
                let mut table = self.take_table("prune")?;
                let before = table.len();
                let removed = table.prune();
                info!(before, removed, kept = table.len(), "prune finished");
                self.table = Some(table);
                self.pruned = true;
                Ok(())
            }
            StageConfig::Write {
                output,
                schema,
                order,
                delimiter,
                output_header,
            } => {
                let Some(table) = self.table.as_ref() else {
                    warn!("write requested before aggregation");
                    return Err(UsageError::PreconditionNotMet(
                        "write requires an aggregated usage table",
                    ))?;
                };
                let view = TableView::new(table, *schema, *order);
                let header = output_header.as_deref();
                self.write_atomic(output, *delimiter, |writer| {
                    write_table(&view, header, writer).map(|_| ())
                })?;
                info!(records = table.len(), "usage table written");
                Ok(())
            }
            StageConfig::AssignGroups {
                input,
                assignments,
                output,
                delimiter,
                input_header,
                output_header,
            } => {
                let rows = self.rows(input, *delimiter, *input_header)?;
                let labels = self.rows(assignments, *delimiter, false)?;
                self.write_atomic(output, *delimiter, |writer| {
                    if let Some(header) = output_header {
                        writer.write_header(header)?;
                    }
                    assign_groups(rows, labels, writer).map(|_| ())
                })
            }
            StageConfig::GroupStats {
                input,
                output,
                columns,
                delimiter,
                input_header,
            } => {
                let header: Option<Row> = if *input_header {
                    read_header(self.open(input)?, *delimiter)?
                } else {
                    None
                };
                let stats = group_stats(
                    self.rows(input, *delimiter, *input_header)?,
                    columns,
                    header.as_ref(),
                )?;
                self.write_atomic(output, *delimiter, |writer| {
                    if let Some(header) = stats.header() {
                        writer.write_record(header)?;
                    }
                    write_table(&stats, None, writer).map(|_| ())
                })
            }
        }
    }

    fn aggregate(
        &self,
        input: &Path,
        delimiter: Delimiter,
        input_header: bool,
    ) -> Result<UsageTable> {
        let aggregation = &self.config.aggregation;
        let mut aggregator = Aggregator::new(
            aggregation.key_column,
            aggregation.type_column,
            aggregation.dispatcher(),
            aggregation.unknown_types,
        );
        aggregator.consume_all(self.rows(input, delimiter, input_header)?)?;
        let (table, _) = aggregator.finish();
        Ok(table)
    }

    fn take_table(&mut self, stage: &'static str) -> Result<UsageTable> {
        match self.table.take() {
            Some(table) => Ok(table),
            None => {
                warn!(stage, "usage table requested before aggregation");
                Err(UsageError::PreconditionNotMet(
                    "stage requires an aggregated usage table",
                ))?
            }
        }
    }

    fn filter(
        &self,
        filter: &RowFilter,
        input: &Path,
        output: &Path,
        delimiter: Delimiter,
        input_header: bool,
    ) -> Result<()> {
        let rows = self.rows(input, delimiter, input_header)?;
        self.write_atomic(output, delimiter, |writer| filter.run(rows, writer).map(|_| ()))
    }

    fn path(&self, path: &Path) -> PathBuf {
        self.config.resolve(path)
    }

    fn open(&self, path: &Path) -> Result<BufReader<File>> {
        let path = self.path(path);
        let file = File::open(&path)
            .map_err(UsageError::from)
            .with_context(|| format!("open {}", path.display()))?;
        Ok(BufReader::new(file))
    }

    fn rows(
        &self,
        path: &Path,
        delimiter: Delimiter,
        skip_header: bool,
    ) -> Result<RowReader<BufReader<File>>> {
        Ok(RowReader::new(self.open(path)?, delimiter, skip_header))
    }

    /// Writes through a temporary file next to `path` and renames it into
    /// place only when `body` succeeds.
    fn write_atomic<F>(&self, path: &Path, delimiter: Delimiter, body: F) -> Result<()>
    where
        F: FnOnce(&mut FileWriter) -> Result<()>,
    {
        let path = self.path(path);
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let temp = NamedTempFile::new_in(&dir)
            .map_err(UsageError::from)
            .with_context(|| format!("create temporary file in {}", dir.display()))?;
        let file = temp.reopen().map_err(UsageError::from)?;
        let mut writer = DelimitedWriter::new(BufWriter::new(file), delimiter);
        body(&mut writer)?;
        writer.into_inner()?.flush().map_err(UsageError::from)?;
        temp.persist(&path)
            .map_err(|err| UsageError::from(err.error))
            .with_context(|| format!("persist {}", path.display()))?;
        info!(path = %path.display(), "output written");
        Ok(())
    }
}

#[cfg(test)]
impl Pipeline {
    pub fn table(&self) -> Option<&UsageTable> {
        self.table.as_ref()
    }

    pub fn into_table(self) -> Option<UsageTable> {
        self.table
    }
}
