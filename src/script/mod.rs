pub mod scanner;

use crate::{MigrunError, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;

pub use scanner::scan;

/// Extension every migration script carries (compared case-insensitively).
pub const SCRIPT_EXTENSION: &str = "sql";

/// Stem suffix that marks a rollback script.
pub const ROLLBACK_SUFFIX: &str = "_rollback";

// Numeric ordering prefix terminated by the separator or the extension dot.
static ORDERED_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9]+(?:_|\.)").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptKind {
    Commit,
    Rollback,
}

impl ScriptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptKind::Commit => "commit",
            ScriptKind::Rollback => "rollback",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "commit" => Some(ScriptKind::Commit),
            "rollback" => Some(ScriptKind::Rollback),
            _ => None,
        }
    }

    /// Classify a file name by its stem suffix.
    pub fn of(name: &str) -> Self {
        match split_extension(name) {
            Some((stem, _)) if stem.ends_with(ROLLBACK_SUFFIX) => ScriptKind::Rollback,
            _ => ScriptKind::Commit,
        }
    }
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A migration script as found on disk during one scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScriptFile {
    pub name: String,
    pub path: PathBuf,
    pub kind: ScriptKind,
    pub fingerprint: String,
    /// Retained for rollbacks only, so they can be replayed after the file is gone.
    pub raw_text: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl ScriptFile {
    pub fn from_text(name: &str, path: PathBuf, text: &str) -> Self {
        Self::from_bytes(name, path, text.as_bytes())
    }

    /// Build a script from its name and raw contents. Contents need not be UTF-8;
    /// a rollback's replay text keeps invalid sequences as U+FFFD.
    pub fn from_bytes(name: &str, path: PathBuf, content: &[u8]) -> Self {
        let kind = ScriptKind::of(name);
        ScriptFile {
            name: name.to_string(),
            path,
            kind,
            fingerprint: fingerprint(content),
            raw_text: match kind {
                ScriptKind::Rollback => Some(String::from_utf8_lossy(content).into_owned()),
                ScriptKind::Commit => None,
            },
            last_modified: None,
        }
    }

    pub fn is_dev(&self) -> bool {
        is_dev_script(&self.name)
    }
}

/// One scan of the scripts directory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Listing {
    /// Sorted by name.
    pub scripts: Vec<ScriptFile>,
    /// Script files that exist but could not be read. They count as present.
    pub unreadable: Vec<String>,
}

impl From<Vec<ScriptFile>> for Listing {
    fn from(scripts: Vec<ScriptFile>) -> Self {
        Listing {
            scripts,
            unreadable: Vec::new(),
        }
    }
}

/// Content hash used to detect edits, insensitive to CRLF vs LF line endings.
pub fn fingerprint(content: impl AsRef<[u8]>) -> String {
    let content = content.as_ref();
    let mut hasher = Sha256::new();
    let mut start = 0;
    for (i, pair) in content.windows(2).enumerate() {
        if pair == b"\r\n" {
            hasher.update(&content[start..i]);
            start = i + 1;
        }
    }
    hasher.update(&content[start..]);
    format!("{:x}", hasher.finalize())
}

/// A script without a purely numeric ordering prefix is a dev script and never migrated.
pub fn is_dev_script(name: &str) -> bool {
    !ORDERED_NAME.is_match(name)
}

pub fn has_script_extension(name: &str) -> bool {
    split_extension(name).is_some()
}

fn split_extension(name: &str) -> Option<(&str, &str)> {
    let (stem, ext) = name.rsplit_once('.')?;
    if ext.eq_ignore_ascii_case(SCRIPT_EXTENSION) && !stem.is_empty() {
        Some((stem, ext))
    } else {
        None
    }
}

/// `0001_add_col.sql` -> `0001_add_col_rollback.sql`
pub fn rollback_name(commit: &str) -> Result<String> {
    let (stem, ext) = split_extension(commit)
        .ok_or_else(|| MigrunError::InvalidScriptName(commit.to_string()))?;
    Ok(format!("{stem}{ROLLBACK_SUFFIX}.{ext}"))
}

/// `0001_add_col_rollback.sql` -> `0001_add_col.sql`
pub fn commit_name(rollback: &str) -> Result<String> {
    let (stem, ext) = split_extension(rollback)
        .ok_or_else(|| MigrunError::InvalidScriptName(rollback.to_string()))?;
    let base = stem
        .strip_suffix(ROLLBACK_SUFFIX)
        .ok_or_else(|| MigrunError::InvalidScriptName(rollback.to_string()))?;
    Ok(format!("{base}.{ext}"))
}
