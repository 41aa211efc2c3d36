use super::reconcile::{reconcile, OrphanedPair, PlanSummary, ReconcileError, Reconciliation};
use super::ExecutionMode;
use crate::ledger::{LedgerStore, NewEntry, ScriptStatus};
use crate::prompt::Confirm;
use crate::runner::{Credentials, RunResult, ScriptRunner, RUNNER_UNAVAILABLE_EXIT_CODE};
use crate::script::{commit_name, scan, Listing};
use crate::staging::StagingArea;
use crate::{MigrunError, Result};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// Why a run stopped before finishing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Halt {
    /// The runner cannot work in this environment. Nothing was recorded for `script`.
    RunnerUnavailable { script: String },
    /// `script` ran and failed. The attempt is recorded as executed with errors.
    ScriptFailed { script: String, exit_code: i32 },
    /// Rollbacks were staged for the operator instead of being run.
    ManualRollbacks { scripts: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Done,
    HaltedOnFailure { halt: Halt },
    /// Nothing was written to the ledger.
    HaltedOnViolation { pairs: Vec<OrphanedPair> },
}

/// What one run did, in the order it happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub state: RunState,
    pub first_run: bool,
    /// Recorded in the ledger without being run by us.
    pub recorded: Vec<String>,
    pub updated: Vec<String>,
    /// Ledger rows removed because their files are gone.
    pub deleted: Vec<String>,
    pub rolled_back: Vec<String>,
    pub applied: Vec<String>,
    pub staged: Vec<PathBuf>,
    pub dev_scripts: Vec<String>,
    /// Present but unreadable, left untouched.
    pub unreadable: Vec<String>,
}

impl Default for RunReport {
    fn default() -> Self {
        Self {
            state: RunState::Done,
            first_run: false,
            recorded: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
            rolled_back: Vec::new(),
            applied: Vec::new(),
            staged: Vec::new(),
            dev_scripts: Vec::new(),
            unreadable: Vec::new(),
        }
    }
}

impl RunReport {
    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        match &self.state {
            RunState::Done => 0,
            RunState::HaltedOnFailure {
                halt: Halt::RunnerUnavailable { .. },
            } => 4,
            RunState::HaltedOnFailure { .. } => 1,
            RunState::HaltedOnViolation { .. } => 3,
        }
    }
}

/// Drives one reconcile-and-apply pass over a scripts directory.
///
/// Every ledger write happens right after the unit of work it describes, so
/// running again after a halt picks up exactly where the last run stopped.
pub struct Engine<R, C> {
    ledger: LedgerStore,
    scripts_dir: PathBuf,
    staging: StagingArea,
    runner: R,
    confirm: C,
    credentials: Credentials,
    mode: ExecutionMode,
    unavailable_code: i32,
}

impl<R: ScriptRunner, C: Confirm> Engine<R, C> {
    pub fn new(
        ledger: LedgerStore,
        scripts_dir: impl Into<PathBuf>,
        staging: StagingArea,
        runner: R,
        confirm: C,
        credentials: Credentials,
    ) -> Self {
        Self {
            ledger,
            scripts_dir: scripts_dir.into(),
            staging,
            runner,
            confirm,
            credentials,
            mode: ExecutionMode::Stage,
            unavailable_code: RUNNER_UNAVAILABLE_EXIT_CODE,
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_unavailable_code(mut self, code: i32) -> Self {
        self.unavailable_code = code;
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn prompt(&self) -> &C {
        &self.confirm
    }

    /// Scan and reconcile without touching the ledger or the staging area.
    pub fn plan(&self) -> Result<PlanSummary> {
        let listing = scan(&self.scripts_dir)?;

        if self.ledger.is_empty()? {
            let (baseline, dev): (Vec<_>, Vec<_>) =
                listing.scripts.into_iter().partition(|s| !s.is_dev());
            return Ok(PlanSummary {
                first_run: true,
                baseline: baseline.into_iter().map(|s| s.name).collect(),
                dev_scripts: dev.into_iter().map(|s| s.name).collect(),
                unreadable: listing.unreadable,
                ..PlanSummary::default()
            });
        }

        match reconcile(listing, self.ledger.read_all()?) {
            Ok(reconciliation) => Ok(reconciliation.summary()),
            Err(ReconcileError::OrphanedRollback { pairs }) => Ok(PlanSummary {
                violations: pairs,
                ..PlanSummary::default()
            }),
        }
    }

    pub fn run(&mut self) -> Result<RunReport> {
        info!("Reconciling {} ({:?} mode)", self.scripts_dir.display(), self.mode);
        self.staging.ensure_outside(&self.scripts_dir)?;
        self.staging.reset()?;

        let listing = scan(&self.scripts_dir)?;
        let mut report = RunReport::default();

        if self.ledger.is_empty()? {
            self.record_baseline(listing, &mut report)?;
            return Ok(report);
        }

        let mut reconciliation = match reconcile(listing, self.ledger.read_all()?) {
            Ok(reconciliation) => reconciliation,
            Err(e @ ReconcileError::OrphanedRollback { .. }) => {
                error!("{}", e);
                error!("Restore the commit scripts or remove their rollbacks, then run again");
                let ReconcileError::OrphanedRollback { pairs } = e;
                report.state = RunState::HaltedOnViolation { pairs };
                return Ok(report);
            }
        };
        report.dev_scripts = reconciliation.dev_scripts.clone();
        report.unreadable = reconciliation.unreadable.clone();

        if reconciliation.is_empty() {
            info!("Ledger is up to date");
            return Ok(report);
        }

        self.refresh_updated(&reconciliation, &mut report)?;

        if let Some(halt) = self.resolve_deleted(&mut reconciliation, &mut report)? {
            report.state = RunState::HaltedOnFailure { halt };
            return Ok(report);
        }

        if let Some(halt) = self.apply_new(&reconciliation, &mut report)? {
            report.state = RunState::HaltedOnFailure { halt };
        }
        Ok(report)
    }

    fn record_baseline(&mut self, listing: Listing, report: &mut RunReport) -> Result<()> {
        // A script left out of the baseline would be applied as new once readable.
        if !listing.unreadable.is_empty() {
            return Err(MigrunError::UnreadableBaseline(listing.unreadable));
        }

        info!("Ledger is empty, recording current scripts as the baseline");
        report.first_run = true;

        let mut entries = Vec::new();
        for script in listing.scripts {
            if script.is_dev() {
                report.dev_scripts.push(script.name);
            } else {
                entries.push(NewEntry::recorded(&script));
                report.recorded.push(script.name);
            }
        }

        let recorded = self.ledger.insert_many(&entries)?;
        info!("Recorded {} scripts without executing them", recorded);
        Ok(())
    }

    fn refresh_updated(&mut self, reconciliation: &Reconciliation, report: &mut RunReport) -> Result<()> {
        if reconciliation.updated.is_empty() {
            return Ok(());
        }

        let refreshed: Vec<_> = reconciliation.updated.iter().map(|u| u.refreshed()).collect();
        self.ledger.update_fingerprints(&refreshed)?;
        for updated in &reconciliation.updated {
            info!("{} changed since it was recorded; fingerprint refreshed", updated.script.name);
            report.updated.push(updated.script.name.clone());
        }
        Ok(())
    }

    fn resolve_deleted(
        &mut self,
        reconciliation: &mut Reconciliation,
        report: &mut RunReport,
    ) -> Result<Option<Halt>> {
        if reconciliation.deleted.is_empty() {
            return Ok(None);
        }

        if reconciliation.rollbacks_to_execute.is_empty() {
            self.forget_deleted(reconciliation, report)?;
            return Ok(None);
        }

        let mut rollbacks = Vec::with_capacity(reconciliation.rollbacks_to_execute.len());
        for entry in &reconciliation.rollbacks_to_execute {
            let text = entry
                .text
                .clone()
                .ok_or_else(|| MigrunError::MissingRollbackText(entry.name.clone()))?;
            rollbacks.push((entry.name.clone(), text));
        }

        let names: Vec<String> = rollbacks.iter().map(|(name, _)| name.clone()).collect();
        let proceed = match self.mode {
            ExecutionMode::Stage => false,
            ExecutionMode::Execute => self.confirm.confirm(&format!(
                "Scripts were removed; run {} rollback script(s) in this order: {}?",
                names.len(),
                names.join(", ")
            ))?,
        };

        if !proceed {
            for (name, text) in &rollbacks {
                report.staged.push(self.staging.stage_text(name, text)?);
            }
            self.forget_deleted(reconciliation, report)?;
            warn!(
                "Run the rollback scripts in {} by hand, latest first, then run again",
                self.staging.dir().display()
            );
            return Ok(Some(Halt::ManualRollbacks { scripts: names }));
        }

        for (name, text) in rollbacks {
            let working = self.staging.working_file(&name, &text)?;
            info!("Rolling back with {}", name);
            let exit_code = self.runner.invoke(working.path(), &self.credentials)?;

            match RunResult::from_exit_code(exit_code, self.unavailable_code) {
                RunResult::Success => {
                    let mut ids = Vec::with_capacity(2);
                    let mut removed = Vec::with_capacity(2);
                    if let Some(rollback) = reconciliation.deleted.remove(&name) {
                        ids.push(rollback.id);
                        removed.push(rollback.name);
                    }
                    if let Some(commit) = reconciliation.deleted.remove(&commit_name(&name)?) {
                        ids.push(commit.id);
                        removed.push(commit.name);
                    }
                    self.ledger.delete_by_ids(&ids)?;
                    report.deleted.extend(removed);
                    report.rolled_back.push(name);
                }
                RunResult::RunnerUnavailable => {
                    error!("Script runner is unavailable; fix the environment and run again");
                    return Ok(Some(Halt::RunnerUnavailable { script: name }));
                }
                RunResult::ScriptFailed { exit_code } => {
                    error!(
                        "Rollback {} failed with exit code {}; fix it and run again",
                        name, exit_code
                    );
                    return Ok(Some(Halt::ScriptFailed {
                        script: name,
                        exit_code,
                    }));
                }
            }
        }

        self.forget_deleted(reconciliation, report)?;
        Ok(None)
    }

    /// Drop every remaining deleted row from the ledger.
    fn forget_deleted(&mut self, reconciliation: &mut Reconciliation, report: &mut RunReport) -> Result<()> {
        let deleted = std::mem::take(&mut reconciliation.deleted);
        let ids: Vec<i64> = deleted.values().map(|e| e.id).collect();
        self.ledger.delete_by_ids(&ids)?;
        for name in deleted.into_keys() {
            debug!("{} no longer exists; removed from ledger", name);
            report.deleted.push(name);
        }
        Ok(())
    }

    fn apply_new(&mut self, reconciliation: &Reconciliation, report: &mut RunReport) -> Result<Option<Halt>> {
        // Rollback text must be in the ledger before its file can disappear.
        if !reconciliation.new_rollback.is_empty() {
            let entries: Vec<_> = reconciliation.new_rollback.iter().map(NewEntry::recorded).collect();
            self.ledger.insert_many(&entries)?;
            report
                .recorded
                .extend(reconciliation.new_rollback.iter().map(|s| s.name.clone()));
        }

        if reconciliation.new_commit.is_empty() {
            return Ok(None);
        }

        match self.mode {
            ExecutionMode::Stage => {
                for script in &reconciliation.new_commit {
                    report.staged.push(self.staging.stage_file(&script.path)?);
                }
                let entries: Vec<_> = reconciliation
                    .new_commit
                    .iter()
                    .map(|s| NewEntry::from_script(s, ScriptStatus::Executed))
                    .collect();
                self.ledger.insert_many(&entries)?;
                report
                    .recorded
                    .extend(reconciliation.new_commit.iter().map(|s| s.name.clone()));
                warn!(
                    "Run the scripts in {} by hand before the next run",
                    self.staging.dir().display()
                );
                Ok(None)
            }
            ExecutionMode::Execute => {
                for script in &reconciliation.new_commit {
                    info!("Applying {}", script.name);
                    let exit_code = self.runner.invoke(&script.path, &self.credentials)?;

                    match RunResult::from_exit_code(exit_code, self.unavailable_code) {
                        RunResult::Success => {
                            self.ledger
                                .insert_one(&NewEntry::from_script(script, ScriptStatus::Executed))?;
                            report.applied.push(script.name.clone());
                        }
                        RunResult::RunnerUnavailable => {
                            error!("Script runner is unavailable; fix the environment and run again");
                            return Ok(Some(Halt::RunnerUnavailable {
                                script: script.name.clone(),
                            }));
                        }
                        RunResult::ScriptFailed { exit_code } => {
                            self.ledger.insert_one(&NewEntry::from_script(
                                script,
                                ScriptStatus::ExecutedWithErrors,
                            ))?;
                            error!(
                                "{} failed with exit code {}; fix the script and run again",
                                script.name, exit_code
                            );
                            return Ok(Some(Halt::ScriptFailed {
                                script: script.name.clone(),
                                exit_code,
                            }));
                        }
                    }
                }
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::ScriptKind;
    use std::collections::VecDeque;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    /// Records each invocation and answers with queued exit codes (0 once empty).
    #[derive(Default)]
    struct FakeRunner {
        calls: Vec<(String, String)>,
        codes: VecDeque<i32>,
    }

    impl ScriptRunner for FakeRunner {
        fn invoke(&mut self, script: &Path, _credentials: &Credentials) -> Result<i32> {
            let name = script.file_name().unwrap().to_string_lossy().to_string();
            let text = fs::read_to_string(script).unwrap();
            self.calls.push((name, text));
            Ok(self.codes.pop_front().unwrap_or(0))
        }
    }

    struct Answer(Option<bool>);

    impl Confirm for Answer {
        fn confirm(&mut self, _question: &str) -> Result<bool> {
            self.0.ok_or_else(|| {
                MigrunError::Prompt(std::io::Error::new(std::io::ErrorKind::Other, "not expected"))
            })
        }
    }

    fn engine(dir: &TempDir, mode: ExecutionMode, answer: Option<bool>) -> Engine<FakeRunner, Answer> {
        Engine::new(
            LedgerStore::in_memory().unwrap(),
            dir.path(),
            StagingArea::new(dir.path().join("run_manually")),
            FakeRunner::default(),
            Answer(answer),
            Credentials::new("app/secret@db"),
        )
        .with_mode(mode)
    }

    fn write(dir: &TempDir, name: &str, text: &str) {
        fs::write(dir.path().join(name), text).unwrap();
    }

    #[test]
    fn test_first_run_records_without_executing() {
        let dir = TempDir::new().unwrap();
        write(&dir, "0001_a.sql", "a");
        write(&dir, "0001_a_rollback.sql", "ra");
        write(&dir, "abc_fix.sql", "dev");
        let mut engine = engine(&dir, ExecutionMode::Execute, None);

        let report = engine.run().unwrap();
        assert!(report.first_run);
        assert_eq!(report.state, RunState::Done);
        assert_eq!(report.recorded, vec!["0001_a.sql", "0001_a_rollback.sql"]);
        assert_eq!(report.dev_scripts, vec!["abc_fix.sql"]);
        assert!(engine.runner().calls.is_empty());
        assert_eq!(engine.ledger.count().unwrap(), 2);
    }

    #[test]
    fn test_plan_does_not_mutate() {
        let dir = TempDir::new().unwrap();
        write(&dir, "0001_a.sql", "a");
        let mut engine = engine(&dir, ExecutionMode::Execute, None);

        let plan = engine.plan().unwrap();
        assert!(plan.first_run);
        assert_eq!(plan.baseline, vec!["0001_a.sql"]);
        assert!(engine.ledger.is_empty().unwrap());

        engine.run().unwrap();
        write(&dir, "0002_b.sql", "b");
        let plan = engine.plan().unwrap();
        assert!(!plan.first_run);
        assert_eq!(plan.new_commit, vec!["0002_b.sql"]);
        assert_eq!(engine.ledger.count().unwrap(), 1);
    }

    #[test]
    fn test_rollback_replays_ledger_text() {
        let dir = TempDir::new().unwrap();
        write(&dir, "0001_a.sql", "a");
        write(&dir, "0001_a_rollback.sql", "drop table a;");
        let mut engine = engine(&dir, ExecutionMode::Execute, Some(true));
        engine.run().unwrap();

        fs::remove_file(dir.path().join("0001_a.sql")).unwrap();
        fs::remove_file(dir.path().join("0001_a_rollback.sql")).unwrap();
        let report = engine.run().unwrap();

        assert_eq!(report.state, RunState::Done);
        assert_eq!(
            engine.runner().calls,
            vec![("0001_a_rollback.sql".to_string(), "drop table a;".to_string())]
        );
        assert_eq!(report.rolled_back, vec!["0001_a_rollback.sql"]);
        assert!(engine.ledger.is_empty().unwrap());
    }

    #[test]
    fn test_declined_rollbacks_are_staged() {
        let dir = TempDir::new().unwrap();
        write(&dir, "0001_a.sql", "a");
        write(&dir, "0001_a_rollback.sql", "drop table a;");
        let mut engine = engine(&dir, ExecutionMode::Execute, Some(false));
        engine.run().unwrap();

        fs::remove_file(dir.path().join("0001_a.sql")).unwrap();
        fs::remove_file(dir.path().join("0001_a_rollback.sql")).unwrap();
        write(&dir, "0002_b.sql", "b");
        let report = engine.run().unwrap();

        assert_eq!(
            report.state,
            RunState::HaltedOnFailure {
                halt: Halt::ManualRollbacks {
                    scripts: vec!["0001_a_rollback.sql".to_string()]
                }
            }
        );
        assert!(engine.runner().calls.is_empty());
        let staged = engine.staging.dir().join("0001_a_rollback.sql");
        assert_eq!(fs::read_to_string(staged).unwrap(), "drop table a;");
        // Deleted rows are gone, the new commit was not touched.
        assert!(engine.ledger.is_empty().unwrap());
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_runner_unavailable_records_nothing() {
        let dir = TempDir::new().unwrap();
        write(&dir, "0001_a.sql", "a");
        let mut engine = engine(&dir, ExecutionMode::Execute, None);
        engine.run().unwrap();

        write(&dir, "0002_b.sql", "b");
        engine.runner.codes.push_back(RUNNER_UNAVAILABLE_EXIT_CODE);
        let report = engine.run().unwrap();

        assert_eq!(
            report.state,
            RunState::HaltedOnFailure {
                halt: Halt::RunnerUnavailable {
                    script: "0002_b.sql".to_string()
                }
            }
        );
        assert_eq!(report.exit_code(), 4);
        assert!(engine.ledger.get("0002_b.sql").unwrap().is_none());
    }

    #[test]
    fn test_stage_mode_copies_and_records_new_commits() {
        let dir = TempDir::new().unwrap();
        write(&dir, "0001_a.sql", "a");
        let mut engine = engine(&dir, ExecutionMode::Stage, None);
        engine.run().unwrap();

        write(&dir, "0002_b.sql", "create table b (x int);");
        write(&dir, "0002_b_rollback.sql", "drop table b;");
        let report = engine.run().unwrap();

        assert_eq!(report.state, RunState::Done);
        assert!(engine.runner().calls.is_empty());
        assert_eq!(report.staged, vec![engine.staging.dir().join("0002_b.sql")]);
        assert_eq!(report.recorded, vec!["0002_b_rollback.sql", "0002_b.sql"]);
        let entry = engine.ledger.get("0002_b.sql").unwrap().unwrap();
        assert_eq!(entry.status, ScriptStatus::Executed);

        // The staging area starts empty on the next run.
        let report = engine.run().unwrap();
        assert!(report.staged.is_empty());
        assert!(!engine.staging.dir().exists());
    }

    #[test]
    fn test_rollback_without_text_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine(&dir, ExecutionMode::Execute, Some(true));
        for (name, kind, status) in [
            ("0001_a.sql", ScriptKind::Commit, ScriptStatus::Executed),
            ("0001_a_rollback.sql", ScriptKind::Rollback, ScriptStatus::NotExecuted),
        ] {
            engine
                .ledger
                .insert_one(&NewEntry {
                    name: name.to_string(),
                    fingerprint: "f".to_string(),
                    text: None,
                    kind,
                    status,
                })
                .unwrap();
        }

        match engine.run() {
            Err(MigrunError::MissingRollbackText(name)) => assert_eq!(name, "0001_a_rollback.sql"),
            other => panic!("expected missing rollback text, got {:?}", other),
        }
        assert!(engine.runner().calls.is_empty());
        assert_eq!(engine.ledger.count().unwrap(), 2);

        engine.mode = ExecutionMode::Stage;
        assert!(matches!(engine.run(), Err(MigrunError::MissingRollbackText(_))));
        assert!(!engine.staging.dir().exists());
        assert_eq!(engine.ledger.count().unwrap(), 2);
    }

    #[test]
    fn test_unreadable_scripts_block_the_baseline() {
        let dir = TempDir::new().unwrap();
        write(&dir, "0001_a.sql", "a");
        let mut engine = engine(&dir, ExecutionMode::Execute, None);

        let listing = Listing {
            scripts: scan(dir.path()).unwrap().scripts,
            unreadable: vec!["0002_b.sql".to_string()],
        };
        let mut report = RunReport::default();
        match engine.record_baseline(listing, &mut report) {
            Err(MigrunError::UnreadableBaseline(names)) => assert_eq!(names, vec!["0002_b.sql"]),
            other => panic!("expected unreadable baseline, got {:?}", other),
        }
        assert!(engine.ledger.is_empty().unwrap());
        assert!(report.recorded.is_empty());
    }
}
