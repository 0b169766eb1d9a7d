use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::jobs::JobError;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source {label} has not been indexed")]
    NotIndexed { label: String },
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{}: {source}", .path.display())]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("indexing cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },
    #[error("invalid options: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Broad failure classes; the command line maps each to an exit code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    Usage,
    Environment,
    Parse,
    Missing,
    Io,
    Cancelled,
    Internal,
}

#[derive(Debug, Error)]
pub enum PackError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Environment(String),
    #[error("parse error in {path}: {message}")]
    Parse { path: String, message: String },
    #[error("{count} asset(s) missing, first: {first}")]
    Missing { count: usize, first: String },
    #[error("required file {name} is missing")]
    MissingRequired { name: String },
    #[error("output {} already exists (use --overwrite)", .0.display())]
    OutputExists(PathBuf),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{}: {source}", .path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
    #[error(transparent)]
    Jobs(#[from] JobError),
    #[error("cancelled")]
    Cancelled,
}

impl PackError {
    pub fn parse(path: impl Into<String>, err: impl std::fmt::Display) -> Self {
        PackError::Parse {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        PackError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            PackError::Config(_) => ErrorCategory::Usage,
            PackError::Environment(_) | PackError::OutputExists(_) => ErrorCategory::Environment,
            PackError::Parse { .. } => ErrorCategory::Parse,
            PackError::Missing { .. } | PackError::MissingRequired { .. } => ErrorCategory::Missing,
            PackError::Source(SourceError::Cancelled) | PackError::Cancelled => {
                ErrorCategory::Cancelled
            }
            PackError::Source(_) | PackError::Io { .. } | PackError::Archive { .. } => {
                ErrorCategory::Io
            }
            PackError::Jobs(_) => ErrorCategory::Internal,
        }
    }
}
