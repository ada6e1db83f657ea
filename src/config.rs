//! Pipeline configuration
//!
//! Loaded from a TOML file. Relative stage paths resolve against
//! `resource_root`, which can be overridden from the environment.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::aggregator::UnknownTypes;
use crate::csv_writer::{OutputSchema, RowOrder};
use crate::dispatcher::FieldDispatcher;
use crate::models::{CashRounding, Counter, RecordType};
use crate::row::Delimiter;
use crate::transform::OnMalformed;

pub const ENV_RESOURCE_ROOT: &str = "CDR_USAGE_RESOURCE_ROOT";
pub const ENV_LOG_LEVEL: &str = "CDR_USAGE_LOG_LEVEL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub resource_root: PathBuf,
    pub logging: LoggingConfig,
    pub aggregation: AggregationConfig,
    pub stages: Vec<StageConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Column holding the usage value for each record type. Types left out
/// contribute nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TypeColumns {
    pub data: Option<usize>,
    pub voice: Option<usize>,
    pub sms: Option<usize>,
    pub cash: Option<usize>,
}

impl TypeColumns {
    pub fn to_map(&self) -> BTreeMap<RecordType, usize> {
        [
            (RecordType::Data, self.data),
            (RecordType::Voice, self.voice),
            (RecordType::Sms, self.sms),
            (RecordType::Cash, self.cash),
        ]
        .into_iter()
        .filter_map(|(record_type, column)| column.map(|c| (record_type, c)))
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub key_column: usize,
    pub type_column: usize,
    pub type_columns: TypeColumns,
    pub unknown_types: UnknownTypes,
    pub cash_rounding: CashRounding,
}

impl AggregationConfig {
    pub fn dispatcher(&self) -> FieldDispatcher {
        FieldDispatcher::new(self.type_columns.to_map(), self.cash_rounding)
    }
}

/// One step of the pipeline. File-producing stages hand their output to
/// the next stage by path; `aggregate`, `join` and `prune` hand over the
/// in-memory usage table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageConfig {
    Project {
        input: PathBuf,
        output: PathBuf,
        columns: Vec<usize>,
        #[serde(default)]
        delimiter: Delimiter,
        #[serde(default)]
        output_delimiter: Option<Delimiter>,
        #[serde(default)]
        input_header: bool,
        #[serde(default)]
        output_header: Option<String>,
        #[serde(default)]
        on_malformed: OnMalformed,
    },
    FilterEquals {
        input: PathBuf,
        output: PathBuf,
        column: usize,
        value: String,
        #[serde(default)]
        delimiter: Delimiter,
        #[serde(default)]
        input_header: bool,
    },
    FilterTypes {
        input: PathBuf,
        output: PathBuf,
        column: usize,
        values: Vec<String>,
        #[serde(default)]
        delimiter: Delimiter,
        #[serde(default)]
        input_header: bool,
    },
    Aggregate {
        input: PathBuf,
        /// Further inputs aggregated separately and merged into the result.
        #[serde(default)]
        shards: Vec<PathBuf>,
        #[serde(default)]
        delimiter: Delimiter,
        #[serde(default)]
        input_header: bool,
    },
    SumByKey {
        input: PathBuf,
        output: PathBuf,
        key_column: usize,
        value_column: usize,
        #[serde(default)]
        delimiter: Delimiter,
        #[serde(default)]
        input_header: bool,
    },
    Join {
        input: PathBuf,
        key_column: usize,
        value_column: usize,
        #[serde(default = "default_join_counter")]
        counter: Counter,
        #[serde(default)]
        delimiter: Delimiter,
        #[serde(default)]
        input_header: bool,
        #[serde(default)]
        round_decimals: Option<CashRounding>,
    },
    Prune,
    Write {
        output: PathBuf,
        #[serde(default)]
        schema: OutputSchema,
        #[serde(default)]
        order: RowOrder,
        #[serde(default)]
        delimiter: Delimiter,
        #[serde(default)]
        output_header: Option<String>,
    },
    AssignGroups {
        input: PathBuf,
        assignments: PathBuf,
        output: PathBuf,
        #[serde(default)]
        delimiter: Delimiter,
        #[serde(default)]
        input_header: bool,
        #[serde(default)]
        output_header: Option<String>,
    },
    GroupStats {
        input: PathBuf,
        output: PathBuf,
        columns: Vec<usize>,
        #[serde(default)]
        delimiter: Delimiter,
        #[serde(default)]
        input_header: bool,
    },
}

fn default_join_counter() -> Counter {
    Counter::MonthlyPurchases
}

impl StageConfig {
    pub fn name(&self) -> &'static str {
        match self {
            StageConfig::Project { .. } => "project",
            StageConfig::FilterEquals { .. } => "filter_equals",
            StageConfig::FilterTypes { .. } => "filter_types",
            StageConfig::Aggregate { .. } => "aggregate",
            StageConfig::SumByKey { .. } => "sum_by_key",
            StageConfig::Join { .. } => "join",
            StageConfig::Prune => "prune",
            StageConfig::Write { .. } => "write",
            StageConfig::AssignGroups { .. } => "assign_groups",
            StageConfig::GroupStats { .. } => "group_stats",
        }
    }

    fn needs_table(&self) -> bool {
        matches!(
            self,
            StageConfig::Join { .. } | StageConfig::Prune | StageConfig::Write { .. }
        )
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            resource_root: PathBuf::from("."),
            logging: LoggingConfig::default(),
            aggregation: AggregationConfig::default(),
            stages: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            key_column: 0,
            type_column: 1,
            type_columns: TypeColumns {
                data: Some(2),
                voice: Some(2),
                sms: Some(2),
                cash: Some(2),
            },
            unknown_types: UnknownTypes::CreateRecord,
            cash_rounding: CashRounding::HalfAwayFromZero,
        }
    }
}

impl PipelineConfig {
    /// Reads, overrides from the environment and validates a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut config = Self::from_toml(&text)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("parse pipeline configuration")
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(root) = env::var(ENV_RESOURCE_ROOT) {
            self.resource_root = PathBuf::from(root);
        }
        if let Ok(level) = env::var(ENV_LOG_LEVEL) {
            self.logging.level = level;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            bail!("pipeline has no stages");
        }
        let mut aggregated = false;
        for (index, stage) in self.stages.iter().enumerate() {
            if stage.needs_table() && !aggregated {
                bail!(
                    "stage {} ({}) needs a usage table but no aggregate stage precedes it",
                    index,
                    stage.name()
                );
            }
            if let StageConfig::Project { columns, .. } | StageConfig::GroupStats { columns, .. } =
                stage
            {
                if columns.is_empty() {
                    bail!("stage {} ({}) selects no columns", index, stage.name());
                }
            }
            if matches!(stage, StageConfig::Aggregate { .. }) {
                aggregated = true;
            }
        }
        Ok(())
    }

    /// Resolves a stage path against the resource root. Absolute paths are
    /// kept as they are.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.resource_root.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
resource_root = "/data/cdr"

[logging]
level = "debug"
format = "json"

[aggregation]
key_column = 1
type_column = 0
unknown_types = "ignore"
cash_rounding = "half_even"

[aggregation.type_columns]
voice = 2
sms = 3
cash = 4

[[stages]]
kind = "filter_equals"
input = "raw.csv"
output = "success.csv"
column = 0
value = "2001"
delimiter = "|"

[[stages]]
kind = "aggregate"
input = "success.csv"
shards = ["success-2.csv"]
delimiter = "|"

[[stages]]
kind = "join"
input = "mon.csv"
key_column = 0
value_column = 1
input_header = true

[[stages]]
kind = "prune"

[[stages]]
kind = "write"
output = "/tmp/final.csv"
schema = "voice_sms"
order = "by_key"
output_header = "MSISDN,Voice,SMS"
"#;

    #[test]
    fn test_default_config_values() {
        let config = PipelineConfig::default();
        assert_eq!(config.resource_root, PathBuf::from("."));
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(config.aggregation.key_column, 0);
        assert_eq!(config.aggregation.type_column, 1);
        assert_eq!(config.aggregation.unknown_types, UnknownTypes::CreateRecord);
        assert_eq!(config.aggregation.cash_rounding, CashRounding::HalfAwayFromZero);
        assert_eq!(config.aggregation.type_columns.to_map().len(), 4);
        assert!(config.stages.is_empty());
    }

    #[test]
    fn test_parse_full_example() -> Result<()> {
        let config = PipelineConfig::from_toml(EXAMPLE)?;
        config.validate()?;

        assert_eq!(config.resource_root, PathBuf::from("/data/cdr"));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.aggregation.unknown_types, UnknownTypes::Ignore);
        assert_eq!(config.aggregation.cash_rounding, CashRounding::HalfEven);

        let map = config.aggregation.type_columns.to_map();
        assert_eq!(map.get(&RecordType::Data), None);
        assert_eq!(map.get(&RecordType::Cash), Some(&4));

        assert_eq!(config.stages.len(), 5);
        assert_eq!(
            config.stages[0],
            StageConfig::FilterEquals {
                input: PathBuf::from("raw.csv"),
                output: PathBuf::from("success.csv"),
                column: 0,
                value: "2001".to_string(),
                delimiter: Delimiter::PIPE,
                input_header: false,
            }
        );
        match &config.stages[1] {
            StageConfig::Aggregate { shards, .. } => {
                assert_eq!(shards, &vec![PathBuf::from("success-2.csv")]);
            }
            other => panic!("unexpected stage: {other:?}"),
        }
        match &config.stages[2] {
            StageConfig::Join {
                counter,
                delimiter,
                input_header,
                round_decimals,
                ..
            } => {
                assert_eq!(*counter, Counter::MonthlyPurchases);
                assert_eq!(*delimiter, Delimiter::COMMA);
                assert!(*input_header);
                assert_eq!(*round_decimals, None);
            }
            other => panic!("unexpected stage {other:?}"),
        }
        assert_eq!(config.stages[3], StageConfig::Prune);
        Ok(())
    }

    #[test]
    fn test_resolve_against_root() -> Result<()> {
        let config = PipelineConfig::from_toml(EXAMPLE)?;
        assert_eq!(
            config.resolve(Path::new("raw.csv")),
            PathBuf::from("/data/cdr/raw.csv")
        );
        assert_eq!(
            config.resolve(Path::new("/tmp/final.csv")),
            PathBuf::from("/tmp/final.csv")
        );
        Ok(())
    }

    #[test]
    fn test_validate_rejects_join_before_aggregate() -> Result<()> {
        let config = PipelineConfig::from_toml(
            r#"
[[stages]]
kind = "prune"
"#,
        )?;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("prune"));
        Ok(())
    }

    #[test]
    fn test_validate_rejects_empty_pipeline() {
        assert!(PipelineConfig::default().validate().is_err());
    }

    #[test]
    fn test_bad_delimiter_is_rejected() {
        let result = PipelineConfig::from_toml(
            r#"
[[stages]]
kind = "aggregate"
input = "a.csv"
delimiter = "||"
"#,
        );
        assert!(result.is_err());
    }
}
