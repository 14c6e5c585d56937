//! The run loop: classify, dispatch a phase, gate, fix, repeat.
//!
//! The lock is taken before the first iteration and released on every exit
//! path. A cleanup callback covers the signal path. Errors and panics raised
//! inside an iteration end the loop with [`RunStop::Error`] instead of
//! propagating, so the caller always gets an outcome once the lock was
//! acquired.

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::cleanup::{CleanupRegistry, SignalHandlers, panic_message};
use crate::core::phase::{Dispatch, Terminal, dispatch, runs_gate};
use crate::core::retry::can_retry;
use crate::core::types::{OrchestrationState, Phase};
use crate::exit_codes;
use crate::io::agent::{
    AgentInvocation, AgentRunResult, AgentSpawner, build_args, resolve_executable, run_with_retry,
};
use crate::io::config::LoopConfig;
use crate::io::gate::{GateOptions, GateRequest, GateResult, GateRunner};
use crate::io::ledger::{LedgerReader, ReadMode};
use crate::io::lock::{self, LockGuard, LockMetadata};

/// Conditions that stop a run before the lock is taken.
#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("agent executable `{0}` was not found on PATH")]
    MissingExecutable(String),
    #[error("{} has no .git marker; run from the repository root", .0.display())]
    MissingRepoMarker(PathBuf),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Check everything a run needs before touching the lock.
pub fn preflight(root: &Path, config: &LoopConfig) -> Result<()> {
    config
        .validate()
        .map_err(|err| PreflightError::InvalidConfig(format!("{err:#}")))?;
    if config.require_repo && !root.join(".git").exists() {
        return Err(PreflightError::MissingRepoMarker(root.to_path_buf()).into());
    }
    if resolve_executable(&config.agent.executable).is_none() {
        return Err(PreflightError::MissingExecutable(config.agent.executable.clone()).into());
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub max_iterations: u32,
    pub max_fix_attempts: u32,
    /// Remove an existing lock before acquiring.
    pub force: bool,
    /// Classify once and report what would run.
    pub dry_run: bool,
}

impl RunOptions {
    pub fn from_config(config: &LoopConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            max_fix_attempts: config.max_fix_attempts,
            force: false,
            dry_run: false,
        }
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStop {
    Done,
    NoProgress,
    MaxIterations {
        limit: u32,
    },
    /// An agent phase failed after its retries.
    AgentFailed {
        phase: Phase,
        exit_code: i32,
        error: String,
    },
    /// An unexpected error inside an iteration.
    Error {
        message: String,
    },
    DryRun {
        state: OrchestrationState,
        phase: Option<Phase>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// Agent phases dispatched (fix attempts excluded).
    pub iterations: u32,
    /// Iterations whose gate never passed within the fix budget.
    pub failed_iterations: u32,
    pub stop: RunStop,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.exit_code() == exit_codes::OK
    }

    pub fn exit_code(&self) -> i32 {
        match &self.stop {
            RunStop::Done | RunStop::DryRun { .. } => exit_codes::OK,
            RunStop::AgentFailed { exit_code, .. } if *exit_code != exit_codes::OK => *exit_code,
            RunStop::AgentFailed { .. }
            | RunStop::NoProgress
            | RunStop::MaxIterations { .. }
            | RunStop::Error { .. } => exit_codes::FAILURE,
        }
    }
}

/// Progress notifications for the caller.
#[derive(Debug)]
pub enum LoopEvent<'a> {
    IterationStarted {
        iteration: u32,
        state: OrchestrationState,
        phase: Phase,
    },
    PhaseFinished {
        iteration: u32,
        phase: Phase,
        result: &'a AgentRunResult,
    },
    GateFinished {
        iteration: u32,
        attempt: u32,
        result: &'a GateResult,
        log_path: &'a Path,
    },
    FixAttempt {
        iteration: u32,
        attempt: u32,
        max_attempts: u32,
    },
    IterationFailed {
        iteration: u32,
        reason: String,
    },
}

/// Absolute paths derived from the project root and config.
#[derive(Debug, Clone)]
struct LoopPaths {
    root: PathBuf,
    ledger: PathBuf,
    lock: PathBuf,
    logs: PathBuf,
}

impl LoopPaths {
    fn new(root: &Path, config: &LoopConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            ledger: root.join(&config.ledger_path),
            lock: root.join(&config.lock_path),
            logs: root.join(&config.state_dir).join("logs"),
        }
    }

    fn gate_log(&self, iteration: u32, attempt: u32) -> PathBuf {
        self.logs.join(format!("iter-{iteration}-gate-{attempt}.log"))
    }
}

/// Prompt for a phase; configured prompts replace the built-in line.
pub fn phase_prompt(config: &LoopConfig, phase: Phase, gate_log: Option<&Path>) -> String {
    let ledger = config.ledger_path.display();
    let base = config.agent.phase(phase).prompt.unwrap_or_else(|| match phase {
        Phase::Implement => {
            format!("Implement the next open task in {ledger} and update its status.")
        }
        Phase::Review => format!("Review the tasks marked In Review in {ledger}."),
        Phase::Tidy => format!("Resolve or re-plan the blocked tasks in {ledger}."),
        Phase::Fix => {
            format!("The verification gate failed. Fix the failures and keep {ledger} current.")
        }
    });
    match gate_log {
        Some(log) => format!("{base}\nGate log: {}", log.display()),
        None => base,
    }
}

/// Run the loop until a terminal state, the iteration cap, or a failure.
///
/// Returns `Err` only when the run could not start (lock conflict, lock I/O).
#[instrument(skip_all, fields(root = %root.display()))]
pub fn run_loop<S, G, F>(
    root: &Path,
    config: &LoopConfig,
    options: &RunOptions,
    spawner: &S,
    gate_runner: &G,
    registry: &Arc<CleanupRegistry>,
    on_event: F,
) -> Result<RunOutcome>
where
    S: AgentSpawner + ?Sized,
    G: GateRunner + ?Sized,
    F: FnMut(&LoopEvent<'_>),
{
    let paths = LoopPaths::new(root, config);
    let reader = LedgerReader::new(Duration::from_millis(config.ledger.cache_ttl_ms));
    if options.dry_run {
        return dry_run(&paths, config, &reader);
    }

    if options.force && lock::is_locked(&paths.lock) {
        let existing = lock::info(&paths.lock).unwrap_or_default();
        warn!(
            path = %paths.lock.display(),
            owner = ?existing.pid,
            "removing existing lock (--force)"
        );
        lock::release(&paths.lock)?;
    }
    let guard = LockGuard::acquire(&paths.lock, "run", &LockMetadata::default())?;
    registry.set_timeout(config.cleanup.timeout());

    let release_path = paths.lock.clone();
    let release_on_signal = registry.register_scoped(move || lock::release(&release_path));
    let signals = match SignalHandlers::install(registry.clone()) {
        Ok(signals) => Some(signals),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "running without signal cleanup");
            None
        }
    };

    let mut run = Run {
        paths: &paths,
        config,
        options,
        spawner,
        gate_runner,
        reader: &reader,
        on_event,
        iterations: 0,
        failed_iterations: 0,
    };
    // A panicking spawner or gate runner ends the run like any other error.
    let stop = panic::catch_unwind(AssertUnwindSafe(|| run.drive())).unwrap_or_else(|payload| {
        let message = format!("phase panicked: {}", panic_message(&*payload));
        error!(%message, "iteration failed unexpectedly");
        RunStop::Error { message }
    });
    let outcome = RunOutcome {
        iterations: run.iterations,
        failed_iterations: run.failed_iterations,
        stop,
    };

    drop(signals);
    drop(release_on_signal);
    guard.release().context("release loop lock")?;
    info!(stop = ?outcome.stop, iterations = outcome.iterations, "loop finished");
    Ok(outcome)
}

fn dry_run(paths: &LoopPaths, config: &LoopConfig, reader: &LedgerReader) -> Result<RunOutcome> {
    let state = reader.classify(&paths.ledger, ReadMode::ForceRefresh)?;
    let phase = match dispatch(state) {
        Dispatch::Run(phase) => {
            let prompt = phase_prompt(config, phase, None);
            let agent_path = config.agent.agent_path(phase);
            let args = build_args(
                &config.agent,
                &AgentInvocation {
                    phase,
                    agent_path: &agent_path,
                    prompt: &prompt,
                },
            );
            info!(%state, %phase, executable = %config.agent.executable, ?args, "dry run");
            Some(phase)
        }
        Dispatch::Stop(_) => {
            info!(%state, "dry run: terminal state");
            None
        }
    };
    Ok(RunOutcome {
        iterations: 0,
        failed_iterations: 0,
        stop: RunStop::DryRun { state, phase },
    })
}

struct Run<'a, S: ?Sized, G: ?Sized, F> {
    paths: &'a LoopPaths,
    config: &'a LoopConfig,
    options: &'a RunOptions,
    spawner: &'a S,
    gate_runner: &'a G,
    reader: &'a LedgerReader,
    on_event: F,
    iterations: u32,
    failed_iterations: u32,
}

impl<S, G, F> Run<'_, S, G, F>
where
    S: AgentSpawner + ?Sized,
    G: GateRunner + ?Sized,
    F: FnMut(&LoopEvent<'_>),
{
    fn drive(&mut self) -> RunStop {
        loop {
            match self.iterate() {
                Ok(Some(stop)) => return stop,
                Ok(None) => {}
                Err(err) => {
                    error!(err = %format!("{err:#}"), "iteration failed unexpectedly");
                    return RunStop::Error {
                        message: format!("{err:#}"),
                    };
                }
            }
        }
    }

    /// One classification pass. `Some` stops the loop.
    fn iterate(&mut self) -> Result<Option<RunStop>> {
        let state = self
            .reader
            .classify(&self.paths.ledger, ReadMode::ForceRefresh)?;
        let phase = match dispatch(state) {
            Dispatch::Stop(Terminal::Success) => return Ok(Some(RunStop::Done)),
            Dispatch::Stop(Terminal::Failure) => return Ok(Some(RunStop::NoProgress)),
            Dispatch::Run(phase) => phase,
        };
        if self.iterations >= self.options.max_iterations {
            warn!(limit = self.options.max_iterations, %state, "iteration cap reached");
            return Ok(Some(RunStop::MaxIterations {
                limit: self.options.max_iterations,
            }));
        }

        self.iterations += 1;
        let iteration = self.iterations;
        lock::update(
            &self.paths.lock,
            &LockMetadata {
                state: Some(state.label().to_string()),
                iteration: Some(iteration),
            },
        )?;
        info!(iteration, %state, %phase, "iteration started");
        (self.on_event)(&LoopEvent::IterationStarted {
            iteration,
            state,
            phase,
        });

        let result = self.invoke(phase, None)?;
        (self.on_event)(&LoopEvent::PhaseFinished {
            iteration,
            phase,
            result: &result,
        });
        if let Some(stop) = agent_failure(phase, &result) {
            return Ok(Some(stop));
        }

        if runs_gate(phase) {
            return self.gate_cycle(iteration);
        }
        Ok(None)
    }

    /// Gate, then fix and re-gate until it passes or the fix budget runs out.
    fn gate_cycle(&mut self, iteration: u32) -> Result<Option<RunStop>> {
        let max_attempts = self.options.max_fix_attempts;
        let mut fix_attempts = 0u32;
        loop {
            let log_path = self.paths.gate_log(iteration, fix_attempts);
            let request = GateRequest {
                commands: self.config.gate.commands.clone(),
                strategy: self.config.gate.strategy,
                options: GateOptions::from_config(&self.paths.root, &self.config.gate),
                log_path: Some(log_path.clone()),
            };
            let gate = self.gate_runner.run(&request)?;
            (self.on_event)(&LoopEvent::GateFinished {
                iteration,
                attempt: fix_attempts,
                result: &gate,
                log_path: &log_path,
            });
            if gate.is_success() {
                return Ok(None);
            }

            if !can_retry(max_attempts, fix_attempts) {
                let reason = format!(
                    "gate still failing after {fix_attempts} fix attempt(s): {}",
                    gate.failure_summary().unwrap_or("gate failed")
                );
                warn!(iteration, %reason, "iteration failed");
                self.failed_iterations += 1;
                (self.on_event)(&LoopEvent::IterationFailed { iteration, reason });
                return Ok(None);
            }

            fix_attempts += 1;
            (self.on_event)(&LoopEvent::FixAttempt {
                iteration,
                attempt: fix_attempts,
                max_attempts,
            });
            let result = self.invoke(Phase::Fix, Some(&log_path))?;
            (self.on_event)(&LoopEvent::PhaseFinished {
                iteration,
                phase: Phase::Fix,
                result: &result,
            });
            if let Some(stop) = agent_failure(Phase::Fix, &result) {
                return Ok(Some(stop));
            }
        }
    }

    fn invoke(&self, phase: Phase, gate_log: Option<&Path>) -> Result<AgentRunResult> {
        let prompt = phase_prompt(self.config, phase, gate_log);
        let agent_path = self.config.agent.agent_path(phase);
        run_with_retry(
            &self.config.agent,
            self.spawner,
            &AgentInvocation {
                phase,
                agent_path: &agent_path,
                prompt: &prompt,
            },
            &self.paths.root,
        )
        .with_context(|| format!("run {phase} agent"))
    }
}

fn agent_failure(phase: Phase, result: &AgentRunResult) -> Option<RunStop> {
    match result {
        AgentRunResult::Success { .. } => None,
        AgentRunResult::Failure {
            exit_code, error, ..
        } => {
            warn!(%phase, exit_code, %error, "agent phase failed");
            Some(RunStop::AgentFailed {
                phase,
                exit_code: *exit_code,
                error: error.clone(),
            })
        }
    }
}
