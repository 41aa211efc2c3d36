use crate::{MigrunError, Result};
use std::fmt;
use std::io::ErrorKind;
use std::path::Path;
use std::process::Command;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Exit code a runner uses to say it cannot work in this environment.
pub const RUNNER_UNAVAILABLE_EXIT_CODE: i32 = 2;

/// Connection string for the target schema, passed to the runner untouched.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials(String);

impl Credentials {
    pub fn new(value: impl Into<String>) -> Self {
        Credentials(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credentials(***)")
    }
}

/// How a single invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunResult {
    Success,
    RunnerUnavailable,
    ScriptFailed { exit_code: i32 },
}

impl RunResult {
    pub fn from_exit_code(exit_code: i32, unavailable_code: i32) -> Self {
        match exit_code {
            0 => RunResult::Success,
            code if code == unavailable_code => RunResult::RunnerUnavailable,
            code => RunResult::ScriptFailed { exit_code: code },
        }
    }
}

/// Executes one script file against the target schema and reports its exit code.
///
/// Calls block until the script has finished.
pub trait ScriptRunner {
    fn invoke(&mut self, script: &Path, credentials: &Credentials) -> Result<i32>;
}

/// Runs an external program once per script.
///
/// `{script}` and `{credentials}` in the argument template are replaced on
/// every invocation. A program that cannot be found reports the
/// unavailable exit code.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
    unavailable_code: i32,
}

impl CommandRunner {
    pub fn new(program: impl Into<String>, args_template: &str) -> Self {
        Self {
            program: program.into(),
            args: args_template.split_whitespace().map(str::to_string).collect(),
            unavailable_code: RUNNER_UNAVAILABLE_EXIT_CODE,
        }
    }

    pub fn with_unavailable_code(mut self, code: i32) -> Self {
        self.unavailable_code = code;
        self
    }

    fn render_args(&self, script: &Path, credentials: &Credentials) -> Vec<String> {
        let script = script.display().to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{script}", &script)
                    .replace("{credentials}", credentials.as_str())
            })
            .collect()
    }
}

impl ScriptRunner for CommandRunner {
    fn invoke(&mut self, script: &Path, credentials: &Credentials) -> Result<i32> {
        let args = self.render_args(script, credentials);
        debug!("Launching {} for {}", self.program, script.display());

        let start = Instant::now();
        let status = match Command::new(&self.program).args(&args).status() {
            Ok(status) => status,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("Runner {} not found", self.program);
                return Ok(self.unavailable_code);
            }
            Err(e) => return Err(MigrunError::io(&self.program, e)),
        };
        let elapsed = start.elapsed().as_millis();

        // Killed by a signal: no code, count it as a script failure.
        let code = status.code().unwrap_or(-1);
        info!("{} finished with exit code {} in {}ms", script.display(), code, elapsed);
        Ok(code)
    }
}
