//! `taskloop` command-line entry point.
//!
//! Every command resolves paths against the current directory, which must be
//! the project root. This is the only place that calls `process::exit`.

use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;

use taskloop::cleanup::CleanupRegistry;
use taskloop::core::types::{LedgerStats, OrchestrationState, TaskRecord};
use taskloop::exit_codes;
use taskloop::io::agent::ProcessSpawner;
use taskloop::io::config::{DEFAULT_CONFIG_PATH, LoopConfig, load_config};
use taskloop::io::gate::{GateOptions, GateRequest, GateRunner, ShellGateRunner};
use taskloop::io::ledger::{LedgerReader, ReadMode};
use taskloop::io::lock::{self, LockInfo, TIMESTAMP_FORMAT};
use taskloop::logging;
use taskloop::orchestrate::{LoopEvent, RunOptions, RunStop, preflight, run_loop};

#[derive(Parser)]
#[command(
    name = "taskloop",
    version,
    about = "Drive a coding agent through a progress ledger until the work is done"
)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug). `RUST_LOG` overrides.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file path.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the loop until the ledger is done, the cap is hit, or a phase fails.
    Run {
        /// Override `max_iterations` from config.
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Override `max_fix_attempts` from config.
        #[arg(long)]
        max_fix_attempts: Option<u32>,
        /// Remove an existing lock before starting.
        #[arg(long)]
        force: bool,
        /// Classify once and print what would run.
        #[arg(long)]
        dry_run: bool,
    },
    /// Show ledger state, counts, current task and lock owner.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Run the configured gate once.
    Gate,
    /// Remove the lock file.
    Unlock,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            process::exit(exit_codes::FAILURE);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let root = std::env::current_dir().context("resolve current directory")?;
    let config = load_config(&root.join(&cli.config))?;
    match cli.command {
        Command::Run {
            max_iterations,
            max_fix_attempts,
            force,
            dry_run,
        } => {
            let options = RunOptions {
                max_iterations: max_iterations.unwrap_or(config.max_iterations),
                max_fix_attempts: max_fix_attempts.unwrap_or(config.max_fix_attempts),
                force,
                dry_run,
            };
            cmd_run(&root, &config, &options)
        }
        Command::Status { json } => cmd_status(&root, &config, json),
        Command::Gate => cmd_gate(&root, &config),
        Command::Unlock => {
            lock::release(&root.join(&config.lock_path))?;
            println!("unlocked");
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_run(root: &Path, config: &LoopConfig, options: &RunOptions) -> Result<i32> {
    if options.max_iterations == 0 {
        anyhow::bail!("--max-iterations must be > 0");
    }
    if !options.dry_run {
        preflight(root, config)?;
    }
    let registry = CleanupRegistry::global();
    let outcome = run_loop(
        root,
        config,
        options,
        &ProcessSpawner,
        &ShellGateRunner,
        &registry,
        print_event,
    )?;

    match &outcome.stop {
        RunStop::Done => println!("done after {} iteration(s)", outcome.iterations),
        RunStop::NoProgress => println!(
            "no progress ledger at {}",
            root.join(&config.ledger_path).display()
        ),
        RunStop::MaxIterations { limit } => println!("stopped: reached {limit} iteration(s)"),
        RunStop::AgentFailed {
            phase,
            exit_code,
            error,
        } => println!("stopped: {phase} agent failed (exit {exit_code}): {error}"),
        RunStop::Error { message } => println!("stopped: {message}"),
        RunStop::DryRun { state, phase } => match phase {
            Some(phase) => println!("{state}: would run {phase}"),
            None => println!("{state}: nothing to run"),
        },
    }
    if outcome.failed_iterations > 0 {
        println!("{} iteration(s) ended with a failing gate", outcome.failed_iterations);
    }
    Ok(outcome.exit_code())
}

fn print_event(event: &LoopEvent<'_>) {
    match event {
        LoopEvent::IterationStarted {
            iteration,
            state,
            phase,
        } => println!("[{iteration}] {state} -> {phase}"),
        LoopEvent::PhaseFinished {
            iteration,
            phase,
            result,
        } => println!(
            "[{iteration}] {phase} finished (exit {}, {} attempt(s))",
            result.exit_code(),
            result.attempts()
        ),
        LoopEvent::GateFinished {
            iteration,
            result,
            log_path,
            ..
        } => match result.failure_summary() {
            None => println!("[{iteration}] gate passed"),
            Some(summary) => println!("[{iteration}] {summary} (log: {})", log_path.display()),
        },
        LoopEvent::FixAttempt {
            iteration,
            attempt,
            max_attempts,
        } => println!("[{iteration}] fix attempt {attempt}/{max_attempts}"),
        LoopEvent::IterationFailed { iteration, reason } => println!("[{iteration}] {reason}"),
    }
}

#[derive(Serialize)]
struct StatusReport {
    state: OrchestrationState,
    stats: LedgerStats,
    current_task: Option<TaskRecord>,
    lock: Option<LockReport>,
}

#[derive(Serialize)]
struct LockReport {
    pid: Option<u32>,
    started: Option<String>,
    elapsed_secs: Option<u64>,
    command: Option<String>,
    state: Option<String>,
    iteration: Option<u32>,
    stale: Option<bool>,
}

impl From<LockInfo> for LockReport {
    fn from(info: LockInfo) -> Self {
        Self {
            pid: info.pid,
            started: info
                .started
                .map(|started| started.format(TIMESTAMP_FORMAT).to_string()),
            elapsed_secs: info.elapsed.map(|elapsed| elapsed.as_secs()),
            command: info.command,
            state: info.metadata.state,
            iteration: info.metadata.iteration,
            stale: info.stale,
        }
    }
}

fn cmd_status(root: &Path, config: &LoopConfig, json: bool) -> Result<i32> {
    let ledger_path = root.join(&config.ledger_path);
    let reader = LedgerReader::new(std::time::Duration::from_millis(
        config.ledger.cache_ttl_ms,
    ));
    let report = StatusReport {
        state: reader.classify(&ledger_path, ReadMode::ForceRefresh)?,
        stats: reader.statistics(&ledger_path, ReadMode::Cached)?,
        current_task: reader.current_task(&ledger_path, ReadMode::Cached)?,
        lock: lock::info(&root.join(&config.lock_path)).map(LockReport::from),
    };

    if json {
        let out = serde_json::to_string_pretty(&report).context("serialize status")?;
        println!("{out}");
        return Ok(exit_codes::OK);
    }

    println!("state: {}", report.state);
    let stats = report.stats;
    println!(
        "tasks: {} total, {} complete, {} remaining, {} in review, {} blocked",
        stats.total, stats.completed, stats.remaining, stats.in_review, stats.blocked
    );
    if let Some(task) = &report.current_task {
        println!("current: {} {}", task.id, task.title);
    }
    match &report.lock {
        None => println!("lock: free"),
        Some(lock) => {
            let owner = lock
                .pid
                .map_or_else(|| "unknown pid".to_string(), |pid| format!("pid {pid}"));
            let stale = if lock.stale == Some(true) { " (stale)" } else { "" };
            println!("lock: held by {owner}{stale}");
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_gate(root: &Path, config: &LoopConfig) -> Result<i32> {
    let request = GateRequest {
        commands: config.gate.commands.clone(),
        strategy: config.gate.strategy,
        options: GateOptions::from_config(root, &config.gate),
        log_path: Some(root.join(&config.state_dir).join("logs/gate.log")),
    };
    let result = ShellGateRunner.run(&request)?;
    for command in &result.commands {
        let verdict = if command.is_success() { "ok" } else { "FAIL" };
        println!(
            "{verdict:>4}  {} ({}ms)",
            command.command,
            command.duration.as_millis()
        );
    }
    match result.failure_summary() {
        None => {
            println!("gate passed in {}ms", result.duration.as_millis());
            Ok(exit_codes::OK)
        }
        Some(summary) => {
            println!("{summary}");
            Ok(exit_codes::FAILURE)
        }
    }
}
