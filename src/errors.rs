use thiserror::Error;

#[derive(Debug, Error)]
pub enum UsageError {
    #[error("malformed row at line {line}: column {required} required, only {found} fields present")]
    MalformedRow {
        line: u64,
        required: usize,
        found: usize,
    },

    #[error("precondition not met: {0}")]
    PreconditionNotMet(&'static str),

    #[error("counter {counter} of {key} would overflow")]
    NumericOverflow { key: String, counter: &'static str },

    #[error("invalid number {value:?} at line {line}")]
    InvalidNumber { line: u64, value: String },

    #[error("no group assignment for data line {line}")]
    MissingAssignment { line: u64 },

    #[error("invalid delimiter {0:?}: expected a single ASCII character")]
    InvalidDelimiter(String),

    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
}
