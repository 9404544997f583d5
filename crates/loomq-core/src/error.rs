use std::path::PathBuf;

/// Fatal startup error: the configuration file is missing, unreadable, malformed, or invalid.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read from disk.
    #[error("could not read configuration file {path}: {source}")]
    Read {
        /// Path that was opened.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The configuration file does not contain valid JSON matching the expected shape.
    #[error("configuration file {path} is not valid JSON: {source}")]
    Parse {
        /// Path that was parsed.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
    /// The configuration parsed but failed a semantic check (e.g. a zero limit).
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
