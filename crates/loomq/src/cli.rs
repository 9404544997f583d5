use std::path::PathBuf;

use clap::Parser;

/// A single entry point with no subcommands: consume, transform, publish, scale.
#[derive(Debug, Clone, Parser)]
#[command(name = "loomq", version, about = "Auto-scaling broker-queue worker pool")]
pub struct Cli {
    /// Path to the JSON configuration file. Defaults to `config.json` next to the binary.
    #[arg(long, env = "LOOMQ_CONFIG")]
    pub config: Option<PathBuf>,

    /// Minimum level emitted by the structured logger.
    #[arg(long = "log-level", env = "LOOMQ_LOG", default_value = "info")]
    pub log_level: String,
}
