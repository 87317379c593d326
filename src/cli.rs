//! Command-line interface for eswatch using clap.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_PATH;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format for log aggregation.
    Json,
}

/// Scheduled search-store polling with hysteresis-gated alerting.
#[derive(Parser, Debug)]
#[command(name = "eswatch")]
#[command(version)]
#[command(about = "Scheduled Elasticsearch alerting with hysteresis and pluggable channels")]
pub struct Cli {
    /// Path to configuration file.
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Override the rules directory from the config file.
    #[arg(long = "rules-dir")]
    pub rules_dir: Option<PathBuf>,

    /// Validate configuration and rules, then exit.
    #[arg(long = "validate")]
    pub validate: bool,

    /// Log format: text or json.
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text, env = "LOG_FORMAT")]
    pub log_format: LogFormat,
}
