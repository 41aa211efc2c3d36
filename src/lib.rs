pub mod config;
pub mod ledger;
pub mod migration;
pub mod prompt;
pub mod runner;
pub mod script;
pub mod staging;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MigrunError {
    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Ledger error: {0}")]
    Ledger(#[from] rusqlite::Error),

    #[error("Confirmation prompt failed: {0}")]
    Prompt(std::io::Error),

    #[error("Invalid script name: {0}")]
    InvalidScriptName(String),

    #[error("Staging directory {} would remove the scripts directory {}", staging.display(), scripts.display())]
    StagingOverlapsScripts { staging: PathBuf, scripts: PathBuf },

    #[error("Ledger has no text recorded for rollback {0}")]
    MissingRollbackText(String),

    #[error("Cannot record a baseline while scripts are unreadable: {}", .0.join(", "))]
    UnreadableBaseline(Vec<String>),
}

impl MigrunError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MigrunError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, MigrunError>;

pub use ledger::{LedgerEntry, LedgerStore, ScriptStatus};
pub use migration::{Engine, ExecutionMode, Halt, RunReport, RunState};
pub use script::{ScriptFile, ScriptKind};
