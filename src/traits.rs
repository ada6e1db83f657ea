use anyhow::Result;

use crate::row::Row;

/// CSVWrite trait provides a method to write a record to a delimited file.
pub trait CSVWrite {
    /// Writes a record to a delimited file.
    ///
    /// # Arguments
    /// * `fields` - The fields of the record, written verbatim in order.
    ///
    /// # Returns
    /// A Result indicating success or failure.
    fn write_record<I, T>(&mut self, fields: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>;

    /// Writes a caller-supplied header line verbatim.
    fn write_header(&mut self, header: &str) -> Result<()>;

    /// Flushes buffered rows to the underlying sink.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// CSVExport trait provides a method to export a table as delimited rows.
pub trait CSVExport {
    /// Exports every row of the table.
    ///
    /// # Arguments
    /// * `writer` - The writer to write the rows to.
    ///
    /// # Returns
    /// The number of rows written.
    fn export(&self, writer: &mut impl CSVWrite) -> Result<usize>;

    /// Header columns the table would describe itself with, if any.
    fn header(&self) -> Option<Vec<String>> {
        None
    }
}

/// RowConsumer trait provides a method to fold one input row into state.
pub trait RowConsumer {
    /// Applies a row.
    ///
    /// # Arguments
    /// * `row` - The row to apply.
    ///
    /// # Returns
    /// A Result indicating success or failure. An error aborts the pass.
    fn consume(&mut self, row: &Row) -> Result<()>;

    /// Feeds every row of `rows` into the consumer, stopping at the first error.
    fn consume_all<I>(&mut self, rows: I) -> Result<()>
    where
        I: IntoIterator<Item = Result<Row>>,
        Self: Sized,
    {
        for row in rows {
            self.consume(&row?)?;
        }
        Ok(())
    }
}
