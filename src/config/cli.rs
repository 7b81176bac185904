use crate::utils::error::Result;
use crate::utils::validation::{self, Validate};
use clap::Parser;
use std::path::PathBuf;

/// 示範程式的命令列參數
#[derive(Debug, Clone, Parser)]
#[command(name = "dataflow-pipeline")]
#[command(about = "Runs a sample fork/join dataflow pipeline over generated JSON records")]
pub struct CliConfig {
    #[arg(long, help = "Path to a pipeline TOML config")]
    pub config: Option<PathBuf>,

    #[arg(long, default_value = "100")]
    pub records: usize,

    #[arg(long, default_value = "10")]
    pub batch_size: usize,

    #[arg(long, help = "Log per-stage timings and print a summary")]
    pub timings: bool,

    #[arg(long, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(long, help = "Emit logs as JSON")]
    pub json_logs: bool,
}

impl Validate for CliConfig {
    fn validate(&self) -> Result<()> {
        validation::validate_positive_number("records", self.records, 1)?;
        validation::validate_positive_number("batch_size", self.batch_size, 1)?;
        Ok(())
    }
}
