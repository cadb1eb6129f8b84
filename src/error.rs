//! Error types for perfex
//!
//! Every error a command handler can return maps onto one of the user-facing
//! categories in [`ErrorKind`]. Invariant violations are not represented here;
//! they panic.

use std::path::PathBuf;

use thiserror::Error;

use crate::experiment::ExperimentId;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Broad error categories surfaced to command issuers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad operand, missing experiment, unusable redirect, backend refusal.
    UserError,
    /// The experiment's persistent store could not be opened or initialized.
    StoreUnavailable,
    /// Cooperative cancellation.
    Aborted,
}

/// perfex error types
#[derive(Error, Debug)]
pub enum Error {
    /// A command operand is missing or malformed
    #[error("Invalid operand: {0}")]
    InvalidOperand(String),

    /// No live experiment has this identifier
    #[error("There is no experiment with identifier {0}")]
    ExperimentNotFound(ExperimentId),

    /// Store could not be created, opened, or have its schema applied
    #[error("Experiment store unavailable: {0}")]
    StoreUnavailable(String),

    /// Redirect target for `-o` could not be created
    #[error("Could not open file {}", path.display())]
    Redirect {
        /// Requested output path
        path: PathBuf,
        /// Underlying open failure
        #[source]
        source: std::io::Error,
    },

    /// Instrumentation backend refused a request
    #[error("Instrumentation backend error: {0}")]
    Backend(String),

    /// Configuration could not be parsed or failed validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// Ingestion delivery queue has no receiver
    #[error("Ingestion queue closed (delivery thread stopped)")]
    QueueClosed,

    /// The dispatcher has drained and accepts no more commands
    #[error("Command processing has shut down")]
    ShutDown,

    /// The command was cancelled while running
    #[error("Command aborted")]
    Aborted,

    /// SQLite error
    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Category used when deciding how a failed command is reported.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::StoreUnavailable(_) | Self::Store(_) => ErrorKind::StoreUnavailable,
            Self::Aborted => ErrorKind::Aborted,
            _ => ErrorKind::UserError,
        }
    }
}
