pub mod store;

use crate::script::{ScriptFile, ScriptKind};
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use store::{LedgerStore, LEDGER_TABLE};

/// Outcome recorded for a ledgered script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptStatus {
    Executed,
    NotExecuted,
    ExecutedWithErrors,
    RunnerUnavailable,
}

impl ScriptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptStatus::Executed => "executed",
            ScriptStatus::NotExecuted => "not_executed",
            ScriptStatus::ExecutedWithErrors => "executed_with_errors",
            ScriptStatus::RunnerUnavailable => "runner_unavailable",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "executed" => Some(ScriptStatus::Executed),
            "not_executed" => Some(ScriptStatus::NotExecuted),
            "executed_with_errors" => Some(ScriptStatus::ExecutedWithErrors),
            "runner_unavailable" => Some(ScriptStatus::RunnerUnavailable),
            _ => None,
        }
    }
}

impl fmt::Display for ScriptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for ScriptStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ScriptStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        ScriptStatus::from_str(value.as_str()?).ok_or(FromSqlError::InvalidType)
    }
}

impl ToSql for ScriptKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ScriptKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        ScriptKind::from_str(value.as_str()?).ok_or(FromSqlError::InvalidType)
    }
}

/// A persisted ledger row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub name: String,
    pub fingerprint: String,
    /// Script text, kept for rollbacks so they can be replayed later.
    pub text: Option<String>,
    pub applied_at: DateTime<Utc>,
    pub kind: ScriptKind,
    pub status: ScriptStatus,
}

impl LedgerEntry {
    /// Copy of this row carrying the fingerprint (and rollback text) of the edited file.
    pub fn refreshed_from(&self, script: &ScriptFile) -> LedgerEntry {
        LedgerEntry {
            fingerprint: script.fingerprint.clone(),
            text: script.raw_text.clone().or_else(|| self.text.clone()),
            ..self.clone()
        }
    }
}

/// A row about to be inserted; the store assigns `id` and `applied_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntry {
    pub name: String,
    pub fingerprint: String,
    pub text: Option<String>,
    pub kind: ScriptKind,
    pub status: ScriptStatus,
}

impl NewEntry {
    pub fn from_script(script: &ScriptFile, status: ScriptStatus) -> Self {
        NewEntry {
            name: script.name.clone(),
            fingerprint: script.fingerprint.clone(),
            text: script.raw_text.clone(),
            kind: script.kind,
            status,
        }
    }

    /// Status a script gets when it is recorded without being run by us.
    pub fn recorded(script: &ScriptFile) -> Self {
        let status = match script.kind {
            ScriptKind::Commit => ScriptStatus::Executed,
            ScriptKind::Rollback => ScriptStatus::NotExecuted,
        };
        NewEntry::from_script(script, status)
    }
}
