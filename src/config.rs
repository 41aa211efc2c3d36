use crate::migration::ExecutionMode;
use crate::runner::RUNNER_UNAVAILABLE_EXIT_CODE;
use crate::staging::DEFAULT_STAGING_DIR;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "migrun")]
#[command(about = "migrun - apply paired commit/rollback SQL scripts and keep a ledger of what ran", long_about = None)]
pub struct Config {
    // Scripts
    #[arg(short = 'd', long, env = "MIGRUN_SCRIPTS_DIR", help = "Directory holding the migration scripts")]
    pub scripts_dir: PathBuf,

    #[arg(long, env = "MIGRUN_STAGING_DIR", help = "Directory for scripts to run by hand (default: <scripts-dir>/run_manually)")]
    pub staging_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "stage", env = "MIGRUN_MODE", help = "Execute scripts automatically or only stage them")]
    pub mode: ExecutionMode,

    #[arg(long, env = "MIGRUN_PLAN", help = "Print what a run would do as JSON and exit")]
    pub plan: bool,

    // Target schema
    #[arg(short, long, env = "MIGRUN_CONNECTION", hide_env_values = true, help = "Credentials for the target schema, passed to the runner")]
    pub connection: String,

    #[arg(long, default_value = "migrun_ledger.db", env = "MIGRUN_LEDGER", help = "SQLite file holding the ledger")]
    pub ledger: PathBuf,

    // Runner
    #[arg(long, default_value = "sqlplus", env = "MIGRUN_RUNNER", help = "Program that executes one script")]
    pub runner: String,

    #[arg(long, default_value = "-S {credentials} @{script}", env = "MIGRUN_RUNNER_ARGS", allow_hyphen_values = true, help = "Runner arguments; {credentials} and {script} are substituted")]
    pub runner_args: String,

    #[arg(long, default_value_t = RUNNER_UNAVAILABLE_EXIT_CODE, env = "MIGRUN_UNAVAILABLE_EXIT_CODE", help = "Runner exit code meaning the runner is unavailable")]
    pub unavailable_exit_code: i32,

    #[arg(long, default_value = "info", env = "MIGRUN_LOG_LEVEL")]
    pub log_level: String,
}

impl Config {
    /// Get a configuration instance with all values resolved from CLI args and environment variables
    pub fn load() -> Self {
        Config::parse()
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| self.scripts_dir.join(DEFAULT_STAGING_DIR))
    }
}
