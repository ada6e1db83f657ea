use std::fmt;
use std::io::Read;

use anyhow::Result;
use csv::{Reader, ReaderBuilder, StringRecord, StringRecordsIntoIter};
use serde::{Deserialize, Serialize};

use crate::errors::UsageError;

/// Field separator of a delimited file. Always a single ASCII byte taken
/// literally: quoting is disabled, so `|` or `.` carry no special meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Delimiter(u8);

impl Delimiter {
    pub const COMMA: Delimiter = Delimiter(b',');
    pub const PIPE: Delimiter = Delimiter(b'|');

    pub fn as_byte(&self) -> u8 {
        self.0
    }

    pub fn as_char(&self) -> char {
        self.0 as char
    }
}

impl Default for Delimiter {
    fn default() -> Self {
        Self::COMMA
    }
}

impl TryFrom<&str> for Delimiter {
    type Error = UsageError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.as_bytes() {
            [b] if b.is_ascii() && *b != b'\n' && *b != b'\r' => Ok(Delimiter(*b)),
            _ => Err(UsageError::InvalidDelimiter(value.to_string())),
        }
    }
}

impl TryFrom<String> for Delimiter {
    type Error = UsageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Delimiter::try_from(value.as_str())
    }
}

impl From<Delimiter> for String {
    fn from(value: Delimiter) -> Self {
        value.as_char().to_string()
    }
}

impl fmt::Display for Delimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// One input line split into ordered fields. Rows may be shorter than the
/// column a caller asks for; every accessor makes that a checked condition.
#[derive(Debug, Clone)]
pub struct Row {
    fields: StringRecord,
    line: u64,
}

impl Row {
    pub fn new(fields: StringRecord, line: u64) -> Self {
        Self { fields, line }
    }

    /// Splits `text` on the literal delimiter.
    pub fn tokenize(text: &str, delimiter: Delimiter, line: u64) -> Self {
        let fields: Vec<&str> = text.split(delimiter.as_char()).collect();
        Self::new(StringRecord::from(fields), line)
    }

    pub fn line(&self) -> u64 {
        self.line
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn has_field(&self, index: usize) -> bool {
        index < self.fields.len()
    }

    pub fn field(&self, index: usize) -> Option<&str> {
        self.fields.get(index)
    }

    pub fn field_or<'a>(&'a self, index: usize, default: &'a str) -> &'a str {
        self.fields.get(index).unwrap_or(default)
    }

    /// Key field at `index`; `None` when the row is too short or the field
    /// is empty.
    pub fn key(&self, index: usize) -> Option<&str> {
        self.field(index).filter(|key| !key.is_empty())
    }

    /// Returns the field at `index`, failing with `MalformedRow` when the
    /// row is too short to hold a structurally required column.
    pub fn require(&self, index: usize) -> Result<&str> {
        match self.fields.get(index) {
            Some(field) => Ok(field),
            None => Err(UsageError::MalformedRow {
                line: self.line,
                required: index,
                found: self.fields.len(),
            })?,
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.iter()
    }
}

/// Streams rows out of a delimited source, one line at a time.
pub struct RowReader<R: Read> {
    records: StringRecordsIntoIter<R>,
}

impl<R: Read> RowReader<R> {
    pub fn new(input: R, delimiter: Delimiter, skip_header: bool) -> Self {
        let reader: Reader<R> = ReaderBuilder::new()
            .has_headers(skip_header)
            .delimiter(delimiter.as_byte())
            .quoting(false)
            .flexible(true)
            .from_reader(input);
        Self {
            records: reader.into_records(),
        }
    }
}

impl<R: Read> Iterator for RowReader<R> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.next()?;
        Some(record.map_err(anyhow::Error::from).map(|record| {
            let line = record.position().map(|p| p.line()).unwrap_or_default();
            Row::new(record, line)
        }))
    }
}

/// Reads only the first line of a delimited source, if any.
pub fn read_header<R: Read>(input: R, delimiter: Delimiter) -> Result<Option<Row>> {
    RowReader::new(input, delimiter, false).next().transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(input: &str, delimiter: Delimiter, skip_header: bool) -> Result<Vec<Row>> {
        RowReader::new(input.as_bytes(), delimiter, skip_header).collect()
    }

    #[test]
    fn test_pipe_is_split_literally() -> Result<()> {
        let rows = read_all("a|b|c\nd|e\n", Delimiter::PIPE, false)?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].fields().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(rows[1].len(), 2);
        Ok(())
    }

    #[test]
    fn test_regex_metachar_delimiter() -> Result<()> {
        let delimiter = Delimiter::try_from(".")?;
        let row = Row::tokenize("1.2.3", delimiter, 1);
        assert_eq!(row.len(), 3);
        assert_eq!(row.field(2), Some("3"));

        let rows = read_all("x.y\n", delimiter, false)?;
        assert_eq!(rows[0].field(1), Some("y"));
        Ok(())
    }

    #[test]
    fn test_quotes_are_plain_bytes() -> Result<()> {
        let rows = read_all("\"a,b\",c\n", Delimiter::COMMA, false)?;
        assert_eq!(rows[0].len(), 3);
        assert_eq!(rows[0].field(0), Some("\"a"));
        Ok(())
    }

    #[test]
    fn test_short_row_is_checked() -> Result<()> {
        let row = Row::tokenize("1000,2", Delimiter::COMMA, 7);
        assert!(row.has_field(1));
        assert!(!row.has_field(2));
        assert_eq!(row.field(2), None);
        assert_eq!(row.field_or(2, "0"), "0");

        let err = row.require(5).unwrap_err();
        match err.downcast_ref::<UsageError>() {
            Some(UsageError::MalformedRow {
                line,
                required,
                found,
            }) => {
                assert_eq!(*line, 7);
                assert_eq!(*required, 5);
                assert_eq!(*found, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_empty_key_is_absent() {
        let row = Row::tokenize(",2,5", Delimiter::COMMA, 1);
        assert_eq!(row.key(0), None);
        assert_eq!(row.key(1), Some("2"));
        assert_eq!(row.key(3), None);
        assert_eq!(Row::tokenize(" ,2", Delimiter::COMMA, 1).key(0), Some(" "));
    }

    #[test]
    fn test_header_skipped() -> Result<()> {
        let rows = read_all("msisdn,amount\n1000,5\n", Delimiter::COMMA, true)?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].field(0), Some("1000"));
        assert_eq!(rows[0].line(), 2);
        Ok(())
    }

    #[test]
    fn test_read_header() -> Result<()> {
        let header = read_header("voice|sms\n1|2\n".as_bytes(), Delimiter::PIPE)?;
        assert_eq!(header.and_then(|h| h.field(1).map(str::to_string)), Some("sms".into()));
        assert!(read_header("".as_bytes(), Delimiter::PIPE)?.is_none());
        Ok(())
    }

    #[test]
    fn test_delimiter_rejects_multichar() {
        assert!(Delimiter::try_from("||").is_err());
        assert!(Delimiter::try_from("").is_err());
        assert!(Delimiter::try_from("\n").is_err());
        assert_eq!(Delimiter::try_from("|").ok(), Some(Delimiter::PIPE));
    }
}
