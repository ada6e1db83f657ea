use anyhow::{Result, anyhow};
use std::env;
use std::path::Path;
use tracing::info;

mod aggregator;
mod config;
mod csv_writer;
mod dispatcher;
mod errors;
mod joiner;
mod logging;
mod models;
mod postprocess;
mod processor;
mod row;
mod table;
mod traits;
mod transform;

const DEFAULT_CONFIG: &str = "pipeline.toml";

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let config_path = match args.len() {
        0 | 1 => Path::new(DEFAULT_CONFIG),
        2 => Path::new(&args[1]),
        _ => Err(anyhow!("usage: cdr-usage [pipeline.toml]"))?,
    };

    let config = config::PipelineConfig::load(config_path)?;
    logging::init_logging(&config.logging)?;
    info!(
        config_file = %config_path.display(),
        stages = config.stages.len(),
        "pipeline configuration loaded"
    );

    let mut pipeline = processor::Pipeline::new(config);

    pipeline.run()?;

    Ok(())
}
