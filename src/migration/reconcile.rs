use crate::ledger::LedgerEntry;
use crate::script::{commit_name, rollback_name, Listing, ScriptFile, ScriptKind};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ReconcileError {
    #[error("Commit scripts were removed while their rollback scripts remain: {}", format_pairs(.pairs))]
    OrphanedRollback { pairs: Vec<OrphanedPair> },
}

/// A removed commit whose rollback file is still in the scripts directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanedPair {
    pub commit: String,
    pub rollback: String,
}

impl fmt::Display for OrphanedPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (rollback {})", self.commit, self.rollback)
    }
}

fn format_pairs(pairs: &[OrphanedPair]) -> String {
    pairs
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A ledgered script whose file content changed under the same name.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatedScript {
    pub script: ScriptFile,
    pub entry: LedgerEntry,
}

impl UpdatedScript {
    pub fn refreshed(&self) -> LedgerEntry {
        self.entry.refreshed_from(&self.script)
    }
}

/// Partition of one scan against one ledger snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    pub updated: Vec<UpdatedScript>,
    /// Ledger rows with no file on disk. Shrinks as the engine resolves them.
    pub deleted: BTreeMap<String, LedgerEntry>,
    /// Deleted rollbacks whose commit is deleted too, latest first.
    pub rollbacks_to_execute: Vec<LedgerEntry>,
    /// Ascending by name.
    pub new_commit: Vec<ScriptFile>,
    pub new_rollback: Vec<ScriptFile>,
    pub dev_scripts: Vec<String>,
    /// Present on disk but unreadable; left alone this run.
    pub unreadable: Vec<String>,
}

impl Reconciliation {
    /// Nothing to update, delete or apply.
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty()
            && self.deleted.is_empty()
            && self.new_commit.is_empty()
            && self.new_rollback.is_empty()
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            first_run: false,
            baseline: Vec::new(),
            updated: self.updated.iter().map(|u| u.script.name.clone()).collect(),
            deleted: self.deleted.keys().cloned().collect(),
            rollbacks_to_execute: self.rollbacks_to_execute.iter().map(|e| e.name.clone()).collect(),
            new_commit: self.new_commit.iter().map(|s| s.name.clone()).collect(),
            new_rollback: self.new_rollback.iter().map(|s| s.name.clone()).collect(),
            dev_scripts: self.dev_scripts.clone(),
            unreadable: self.unreadable.clone(),
            violations: Vec::new(),
        }
    }
}

/// Names-only view of a reconciliation, used for previews.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlanSummary {
    /// The ledger is empty; `baseline` would be recorded without running anything.
    pub first_run: bool,
    pub baseline: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    pub rollbacks_to_execute: Vec<String>,
    pub new_commit: Vec<String>,
    pub new_rollback: Vec<String>,
    pub dev_scripts: Vec<String>,
    pub unreadable: Vec<String>,
    pub violations: Vec<OrphanedPair>,
}

/// Compare the scripts on disk with the ledger.
///
/// Unreadable files count as present, so their ledger rows are never deleted.
/// Fails without producing a partition if any commit was removed while its
/// rollback file is still present.
pub fn reconcile(
    listing: impl Into<Listing>,
    mut ledger: BTreeMap<String, LedgerEntry>,
) -> Result<Reconciliation, ReconcileError> {
    let Listing { scripts, unreadable } = listing.into();
    let on_disk: BTreeSet<String> = scripts
        .iter()
        .map(|s| s.name.clone())
        .chain(unreadable.iter().cloned())
        .collect();

    let mut result = Reconciliation {
        unreadable,
        ..Reconciliation::default()
    };
    for script in scripts {
        match ledger.get(&script.name) {
            Some(entry) => {
                if entry.fingerprint != script.fingerprint {
                    let entry = entry.clone();
                    result.updated.push(UpdatedScript { script, entry });
                }
            }
            None if script.is_dev() => result.dev_scripts.push(script.name),
            None => match script.kind {
                ScriptKind::Commit => result.new_commit.push(script),
                ScriptKind::Rollback => result.new_rollback.push(script),
            },
        }
    }

    ledger.retain(|name, _| !on_disk.contains(name));
    result.deleted = ledger;

    let pairs: Vec<OrphanedPair> = result
        .deleted
        .values()
        .filter(|entry| entry.kind == ScriptKind::Commit)
        .filter_map(|entry| {
            let rollback = rollback_name(&entry.name).ok()?;
            on_disk.contains(&rollback).then(|| OrphanedPair {
                commit: entry.name.clone(),
                rollback,
            })
        })
        .collect();
    if !pairs.is_empty() {
        return Err(ReconcileError::OrphanedRollback { pairs });
    }

    result.rollbacks_to_execute = result
        .deleted
        .values()
        .filter(|entry| entry.kind == ScriptKind::Rollback)
        .filter(|entry| {
            commit_name(&entry.name)
                .map(|commit| result.deleted.contains_key(&commit))
                .unwrap_or(false)
        })
        .cloned()
        .collect();
    result.rollbacks_to_execute.sort_by(|a, b| b.name.cmp(&a.name));

    result.new_commit.sort_by(|a, b| a.name.cmp(&b.name));
    result.new_rollback.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(result)
}
