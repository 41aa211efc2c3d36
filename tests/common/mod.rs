use migrun::ledger::LedgerStore;
use migrun::migration::{Engine, ExecutionMode};
use migrun::prompt::Confirm;
use migrun::runner::{Credentials, ScriptRunner};
use migrun::staging::StagingArea;
use migrun::{MigrunError, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// One runner invocation as seen by the fake runner.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub name: String,
    pub text: String,
    pub credentials: String,
}

/// Records invocations and returns a configured exit code per script name (0 by default).
#[derive(Default)]
pub struct RecordingRunner {
    pub invocations: Vec<Invocation>,
    pub exit_codes: HashMap<String, i32>,
}

impl RecordingRunner {
    pub fn names(&self) -> Vec<&str> {
        self.invocations.iter().map(|i| i.name.as_str()).collect()
    }
}

impl ScriptRunner for RecordingRunner {
    fn invoke(&mut self, script: &Path, credentials: &Credentials) -> Result<i32> {
        let name = script
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let text = fs::read_to_string(script).map_err(|e| MigrunError::io(script, e))?;
        let code = self.exit_codes.get(&name).copied().unwrap_or(0);
        self.invocations.push(Invocation {
            name,
            text,
            credentials: credentials.as_str().to_string(),
        });
        Ok(code)
    }
}

/// Answers every confirmation with the same value and counts the questions.
pub struct FixedAnswer {
    pub answer: bool,
    pub asked: usize,
}

impl FixedAnswer {
    pub fn new(answer: bool) -> Self {
        Self { answer, asked: 0 }
    }
}

impl Confirm for FixedAnswer {
    fn confirm(&mut self, _question: &str) -> Result<bool> {
        self.asked += 1;
        Ok(self.answer)
    }
}

/// A scripts directory plus a ledger file that outlive individual engines,
/// so each `engine()` call behaves like a fresh process invocation.
pub struct Workspace {
    pub root: TempDir,
}

#[allow(dead_code)]
impl Workspace {
    pub fn new() -> Self {
        let root = TempDir::new().unwrap();
        fs::create_dir(root.path().join("scripts")).unwrap();
        Self { root }
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.root.path().join("scripts")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.scripts_dir().join("run_manually")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.root.path().join("ledger.db")
    }

    pub fn write(&self, name: &str, text: &str) {
        fs::write(self.scripts_dir().join(name), text).unwrap();
    }

    pub fn remove(&self, name: &str) {
        fs::remove_file(self.scripts_dir().join(name)).unwrap();
    }

    pub fn ledger(&self) -> LedgerStore {
        LedgerStore::open(&self.ledger_path()).unwrap()
    }

    pub fn ledger_names(&self) -> Vec<String> {
        self.ledger().read_all().unwrap().into_keys().collect()
    }

    pub fn write_bytes(&self, name: &str, content: &[u8]) {
        fs::write(self.scripts_dir().join(name), content).unwrap();
    }

    pub fn engine(
        &self,
        mode: ExecutionMode,
        runner: RecordingRunner,
        answer: FixedAnswer,
    ) -> Engine<RecordingRunner, FixedAnswer> {
        self.engine_staging_into(self.staging_dir(), mode, runner, answer)
    }

    pub fn engine_staging_into(
        &self,
        staging_dir: PathBuf,
        mode: ExecutionMode,
        runner: RecordingRunner,
        answer: FixedAnswer,
    ) -> Engine<RecordingRunner, FixedAnswer> {
        Engine::new(
            self.ledger(),
            self.scripts_dir(),
            StagingArea::new(staging_dir),
            runner,
            answer,
            Credentials::new("app/secret@orcl"),
        )
        .with_mode(mode)
    }

    pub fn executing(&self) -> Engine<RecordingRunner, FixedAnswer> {
        self.engine(ExecutionMode::Execute, RecordingRunner::default(), FixedAnswer::new(true))
    }

    pub fn staging(&self) -> Engine<RecordingRunner, FixedAnswer> {
        self.engine(ExecutionMode::Stage, RecordingRunner::default(), FixedAnswer::new(true))
    }
}
