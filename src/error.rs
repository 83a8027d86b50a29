//! Error types for devtool operations.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by devtool commands and the engine underneath them.
#[derive(Debug, Error)]
pub enum DevtoolError {
    #[error("output path {0} already exists and is non-empty")]
    TargetNotEmpty(PathBuf),

    #[error("output path {0} exists and is not a directory")]
    TargetNotDirectory(PathBuf),

    #[error("output path {0} does not exist")]
    TargetMissing(PathBuf),

    #[error("{0}")]
    UnsupportedRecipe(String),

    #[error("The {0} recipe has do_unpack disabled, unable to extract source")]
    UnpackDisabled(String),

    #[error("recipe {0} is already in your workspace")]
    AlreadyInWorkspace(String),

    #[error("no recipe named {0} in your workspace")]
    NotInWorkspace(String),

    #[error("unable to find recipe {0}")]
    RecipeNotFound(String),

    #[error("no prior revision recorded for {0} - please specify it with --initial-rev")]
    NoInitialRevision(String),

    #[error("Invalid hash returned by git: {0}")]
    InvalidRevision(String),

    #[error("Fetcher failure: {0}")]
    Fetch(String),

    #[error("Command '{command}' failed:\n{output}")]
    Command { command: String, output: String },

    #[error("git: {0}")]
    Git(#[from] git2::Error),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {message}")]
    Recipe { path: PathBuf, message: String },

    #[error("dependency cycle between tasks: {0}")]
    TaskCycle(String),

    #[error("no such task {task} for recipe {recipe}")]
    UnknownTask { recipe: String, task: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    InvalidArgument(String),
}

impl DevtoolError {
    /// Wrap an IO error with the path it concerns.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type used across the crate.
pub type Result<T> = std::result::Result<T, DevtoolError>;

/// Attach a path to IO failures, in the manner of `anyhow::Context`.
pub trait IoContext<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| DevtoolError::io(path, e))
    }
}
