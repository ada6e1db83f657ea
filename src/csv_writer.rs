use crate::models::{Counter, UsageRecord};
use crate::row::{Delimiter, Row};
use crate::table::UsageTable;
use crate::traits::{CSVExport, CSVWrite};
use anyhow::Result;
use csv::{QuoteStyle, Writer, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::io::Write;

const TERMINATOR: &[u8] = b"\n";

/// Writes delimited rows with every field taken verbatim.
pub struct DelimitedWriter<W: Write> {
    // Always `Some` outside of `write_record`.
    writer: Option<Writer<W>>,
    delimiter: Delimiter,
}

impl<W: Write> DelimitedWriter<W> {
    pub fn new(inner: W, delimiter: Delimiter) -> Self {
        DelimitedWriter {
            writer: Some(Self::build(inner, delimiter)),
            delimiter,
        }
    }

    fn build(inner: W, delimiter: Delimiter) -> Writer<W> {
        WriterBuilder::new()
            .has_headers(false)
            .flexible(true)
            .quote_style(QuoteStyle::Never)
            .delimiter(delimiter.as_byte())
            .from_writer(inner)
    }

    fn writer(&mut self) -> &mut Writer<W> {
        self.writer.as_mut().expect("csv writer present")
    }

    /// Flushes and returns the underlying sink.
    pub fn into_inner(self) -> Result<W> {
        self.writer
            .expect("csv writer present")
            .into_inner()
            .map_err(|err| anyhow::anyhow!("flush delimited output: {}", err.error()))
    }
}

impl<W: Write> CSVWrite for DelimitedWriter<W> {
    fn write_record<I, T>(&mut self, fields: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let fields: Vec<T> = fields.into_iter().collect();
        // csv quotes a lone empty field even with QuoteStyle::Never.
        if fields.len() == 1 && fields[0].as_ref().is_empty() {
            // csv::Writer has no get_mut; flush it out to the sink, write
            // the terminator there, and rebuild the writer around it.
            let writer = self.writer.take().expect("csv writer present");
            let mut inner = writer
                .into_inner()
                .map_err(|err| anyhow::anyhow!("flush delimited output: {}", err.error()))?;
            inner.write_all(TERMINATOR)?;
            self.writer = Some(Self::build(inner, self.delimiter));
            return Ok(());
        }
        Ok(self
            .writer()
            .write_record(fields.iter().map(|field| -> &str { field.as_ref() }))?)
    }

    fn write_header(&mut self, header: &str) -> Result<()> {
        let header = Row::tokenize(header, self.delimiter, 0);
        self.write_record(header.fields())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(self.writer().flush()?)
    }
}

/// Closed set of column layouts for the final usage table. The key is
/// always the first column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSchema {
    /// key, data, voice, sms, cash, monthly purchases
    Full,
    /// key, voice, sms, cash, monthly purchases
    #[default]
    Usage,
    /// key, voice, sms
    VoiceSms,
}

impl OutputSchema {
    pub fn counters(&self) -> &'static [Counter] {
        match self {
            OutputSchema::Full => &Counter::ALL,
            OutputSchema::Usage => &[
                Counter::Voice,
                Counter::Sms,
                Counter::Cash,
                Counter::MonthlyPurchases,
            ],
            OutputSchema::VoiceSms => &[Counter::Voice, Counter::Sms],
        }
    }

    pub fn row(&self, record: &UsageRecord) -> Vec<String> {
        std::iter::once(record.key().clone())
            .chain(self.counters().iter().map(|c| record.get(*c).to_string()))
            .collect()
    }
}

/// Output order of table rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowOrder {
    /// Map iteration order; unspecified and may differ between runs.
    #[default]
    Natural,
    /// Ascending by key.
    ByKey,
}

/// A usage table projected through a schema.
pub struct TableView<'a> {
    table: &'a UsageTable,
    schema: OutputSchema,
    order: RowOrder,
}

impl<'a> TableView<'a> {
    pub fn new(table: &'a UsageTable, schema: OutputSchema, order: RowOrder) -> Self {
        Self {
            table,
            schema,
            order,
        }
    }
}

impl CSVExport for TableView<'_> {
    fn export(&self, writer: &mut impl CSVWrite) -> Result<usize> {
        let records: Vec<&UsageRecord> = match self.order {
            RowOrder::Natural => self.table.records().collect(),
            RowOrder::ByKey => self.table.sorted(),
        };
        for record in &records {
            writer.write_record(self.schema.row(record))?;
        }
        Ok(records.len())
    }
}

/// Writes an optional header followed by every row of `table`. An empty
/// export body is valid.
pub fn write_table(
    table: &impl CSVExport,
    header: Option<&str>,
    writer: &mut impl CSVWrite,
) -> Result<usize> {
    if let Some(header) = header {
        writer.write_header(header)?;
    }
    let written = table.export(writer)?;
    writer.flush()?;
    Ok(written)
}
