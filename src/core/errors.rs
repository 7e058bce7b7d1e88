//! CBH-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, CbhError>;

/// Top-level error type for Container Ballast Helper.
#[derive(Debug, Error)]
pub enum CbhError {
    #[error("[CBH-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[CBH-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[CBH-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[CBH-2001] container runtime connection failure: {details}")]
    Connection { details: String },

    #[error("[CBH-2101] failed to create container {name}: {details}")]
    Create { name: String, details: String },

    #[error("[CBH-2102] failed to start container {name}: {details}")]
    Start { name: String, details: String },

    #[error("[CBH-2103] failed to stop container {name}: {details}")]
    Stop { name: String, details: String },

    #[error("[CBH-2104] failed to remove container {name}: {details}")]
    Remove { name: String, details: String },

    #[error("[CBH-2105] failed to inspect container {name}: {details}")]
    Inspect { name: String, details: String },

    #[error("[CBH-2106] no such container: {name}")]
    NotFound { name: String },

    #[error("[CBH-2201] failed to attach exec in container {container}: {details}")]
    ExecAttach { container: String, details: String },

    #[error("[CBH-2202] command in container {container} exited with code {exit_code}: {output}")]
    Execution {
        container: String,
        exit_code: i32,
        output: String,
    },

    #[error("[CBH-2301] unexpected {context} format: {details}")]
    Format {
        context: &'static str,
        details: String,
    },

    #[error("[CBH-2302] ballast adjustment failed in container {container}: {details}")]
    Adjustment { container: String, details: String },

    #[error("[CBH-3001] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[CBH-3002] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[CBH-3003] operation cancelled: {details}")]
    Cancelled { details: String },
}

impl CbhError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "CBH-1001",
            Self::MissingConfig { .. } => "CBH-1002",
            Self::ConfigParse { .. } => "CBH-1003",
            Self::Connection { .. } => "CBH-2001",
            Self::Create { .. } => "CBH-2101",
            Self::Start { .. } => "CBH-2102",
            Self::Stop { .. } => "CBH-2103",
            Self::Remove { .. } => "CBH-2104",
            Self::Inspect { .. } => "CBH-2105",
            Self::NotFound { .. } => "CBH-2106",
            Self::ExecAttach { .. } => "CBH-2201",
            Self::Execution { .. } => "CBH-2202",
            Self::Format { .. } => "CBH-2301",
            Self::Adjustment { .. } => "CBH-2302",
            Self::Io { .. } => "CBH-3001",
            Self::Serialization { .. } => "CBH-3002",
            Self::Cancelled { .. } => "CBH-3003",
        }
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ExecAttach { .. }
                | Self::Adjustment { .. }
                | Self::Io { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Convenience constructor for parse failures of diagnostic output.
    #[must_use]
    pub fn format(context: &'static str, details: impl Into<String>) -> Self {
        Self::Format {
            context,
            details: details.into(),
        }
    }
}

impl From<serde_json::Error> for CbhError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for CbhError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
