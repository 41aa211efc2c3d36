use anyhow::{Context, Result};
use tracing::{error, info};

use migrun::config::Config;
use migrun::ledger::LedgerStore;
use migrun::migration::{Engine, Halt, RunState};
use migrun::prompt::ConsolePrompt;
use migrun::runner::{CommandRunner, Credentials};
use migrun::staging::StagingArea;

fn main() -> Result<()> {
    let config = Config::load();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(config.log_level.clone())
        .init();

    info!("migrun v{}", env!("CARGO_PKG_VERSION"));

    let ledger = LedgerStore::open(&config.ledger)
        .with_context(|| format!("Failed to open ledger {}", config.ledger.display()))?;
    let runner = CommandRunner::new(config.runner.clone(), &config.runner_args)
        .with_unavailable_code(config.unavailable_exit_code);

    let mut engine = Engine::new(
        ledger,
        config.scripts_dir.clone(),
        StagingArea::new(config.staging_dir()),
        runner,
        ConsolePrompt::stdio(),
        Credentials::new(config.connection.clone()),
    )
    .with_mode(config.mode)
    .with_unavailable_code(config.unavailable_exit_code);

    if config.plan {
        let plan = engine.plan()?;
        println!("{}", serde_json::to_string_pretty(&plan)?);
        std::process::exit(if plan.violations.is_empty() { 0 } else { 3 });
    }

    let report = engine.run()?;
    match &report.state {
        RunState::Done => {
            if report.first_run {
                info!("First run: recorded {} scripts as the baseline", report.recorded.len());
            } else {
                info!(
                    "Done: {} applied, {} rolled back, {} updated, {} removed, {} staged",
                    report.applied.len(),
                    report.rolled_back.len(),
                    report.updated.len(),
                    report.deleted.len(),
                    report.staged.len()
                );
            }
        }
        RunState::HaltedOnFailure { halt } => match halt {
            Halt::RunnerUnavailable { script } => {
                error!("Stopped at {}: the script runner is unavailable", script)
            }
            Halt::ScriptFailed { script, exit_code } => {
                error!("Stopped at {}: exit code {}", script, exit_code)
            }
            Halt::ManualRollbacks { scripts } => {
                error!("Stopped: {} rollback script(s) must be run by hand", scripts.len())
            }
        },
        RunState::HaltedOnViolation { pairs } => {
            error!("Stopped: {} commit script(s) removed without their rollbacks", pairs.len())
        }
    }

    std::process::exit(report.exit_code());
}
