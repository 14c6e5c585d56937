//! Gate runner: verification shell commands that must all pass.
//!
//! Every configured command runs even after an earlier one fails, so a failing
//! gate always reports full diagnostics. In parallel mode results are still
//! returned in configuration order with output attributed per command.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

pub use crate::core::retry::can_retry;
use crate::exit_codes;
use crate::io::config::{GateConfig, GateStrategy};
use crate::io::process::{RunLimits, run_command_with_timeout, shell_command};

/// How a single gate command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    Passed,
    Failed { exit_code: i32 },
    TimedOut { timeout: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateCommandResult {
    pub command: String,
    pub status: CommandStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl GateCommandResult {
    pub fn is_success(&self) -> bool {
        self.status == CommandStatus::Passed
    }

    /// `0` on success, the command's own code on failure, `124` on timeout.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            CommandStatus::Passed => exit_codes::OK,
            CommandStatus::Failed { exit_code } => exit_code,
            CommandStatus::TimedOut { .. } => exit_codes::TIMEOUT,
        }
    }

    pub fn error(&self) -> Option<String> {
        match self.status {
            CommandStatus::Passed => None,
            CommandStatus::Failed { exit_code } => Some(format!("exited with code {exit_code}")),
            CommandStatus::TimedOut { timeout } => Some(format!(
                "command timed out after {}ms",
                timeout.as_millis()
            )),
        }
    }
}

/// Overall gate verdict. The summary exists only on failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Passed,
    Failed { summary: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateResult {
    /// One entry per command, in configuration order.
    pub commands: Vec<GateCommandResult>,
    /// Wall-clock time for the whole batch.
    pub duration: Duration,
    pub outcome: GateOutcome,
}

impl GateResult {
    pub fn new(commands: Vec<GateCommandResult>, duration: Duration) -> Self {
        let failed: Vec<String> = commands
            .iter()
            .filter_map(|result| {
                result
                    .error()
                    .map(|error| format!("`{}` ({error})", result.command))
            })
            .collect();
        let outcome = if failed.is_empty() {
            GateOutcome::Passed
        } else {
            GateOutcome::Failed {
                summary: format!(
                    "{} of {} gate commands failed: {}",
                    failed.len(),
                    commands.len(),
                    failed.join("; ")
                ),
            }
        };
        Self {
            commands,
            duration,
            outcome,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == GateOutcome::Passed
    }

    pub fn failure_summary(&self) -> Option<&str> {
        match &self.outcome {
            GateOutcome::Passed => None,
            GateOutcome::Failed { summary } => Some(summary),
        }
    }

    /// First failing command's exit code, `0` when the gate passed.
    pub fn exit_code(&self) -> i32 {
        self.commands
            .iter()
            .map(GateCommandResult::exit_code)
            .find(|code| *code != exit_codes::OK)
            .unwrap_or(exit_codes::OK)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateOptions {
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub kill_grace: Duration,
    pub output_limit_bytes: usize,
}

impl GateOptions {
    pub fn from_config(workdir: &Path, config: &GateConfig) -> Self {
        Self {
            workdir: workdir.to_path_buf(),
            timeout: config.timeout(),
            kill_grace: config.kill_grace(),
            output_limit_bytes: config.output_limit_bytes,
        }
    }

    fn limits(&self) -> RunLimits {
        RunLimits {
            timeout: self.timeout,
            kill_grace: self.kill_grace,
            output_limit_bytes: self.output_limit_bytes,
        }
    }
}

/// Run one shell command with its own timeout.
#[instrument(skip_all, fields(command = %command))]
pub fn run_one(command: &str, options: &GateOptions) -> Result<GateCommandResult> {
    let mut cmd = shell_command(command);
    cmd.current_dir(&options.workdir);
    let output = run_command_with_timeout(cmd, &options.limits())
        .with_context(|| format!("run gate command `{command}`"))?;

    let status = if output.timed_out {
        CommandStatus::TimedOut {
            timeout: options.timeout,
        }
    } else if output.status.success() {
        CommandStatus::Passed
    } else {
        CommandStatus::Failed {
            exit_code: output.exit_code(),
        }
    };
    debug!(?status, elapsed_ms = output.elapsed.as_millis() as u64, "gate command finished");
    Ok(GateCommandResult {
        command: command.to_string(),
        status,
        stdout: output.stdout_lossy(),
        stderr: output.stderr_lossy(),
        duration: output.elapsed,
    })
}

/// Run every command and aggregate. An empty list passes in zero time.
pub fn run_all(
    commands: &[String],
    strategy: GateStrategy,
    options: &GateOptions,
) -> Result<GateResult> {
    if commands.is_empty() {
        return Ok(GateResult::new(Vec::new(), Duration::ZERO));
    }
    info!(count = commands.len(), ?strategy, "running gate");
    let started = Instant::now();
    let results = match strategy {
        GateStrategy::Sequential => commands
            .iter()
            .map(|command| run_one(command, options))
            .collect::<Result<Vec<_>>>()?,
        GateStrategy::Parallel => thread::scope(|scope| {
            let handles: Vec<_> = commands
                .iter()
                .map(|command| scope.spawn(move || run_one(command, options)))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .map_err(|_| anyhow!("gate command thread panicked"))?
                })
                .collect::<Result<Vec<_>>>()
        })?,
    };
    let result = GateResult::new(results, started.elapsed());
    match &result.outcome {
        GateOutcome::Passed => {
            info!(duration_ms = result.duration.as_millis() as u64, "gate passed");
        }
        GateOutcome::Failed { summary } => warn!(%summary, "gate failed"),
    }
    Ok(result)
}

/// Parameters for one gate run.
#[derive(Debug, Clone)]
pub struct GateRequest {
    pub commands: Vec<String>,
    pub strategy: GateStrategy,
    pub options: GateOptions,
    /// Where to write the per-command log, if anywhere.
    pub log_path: Option<PathBuf>,
}

pub trait GateRunner {
    fn run(&self, request: &GateRequest) -> Result<GateResult>;
}

/// Runs gate commands through the host shell.
pub struct ShellGateRunner;

impl GateRunner for ShellGateRunner {
    fn run(&self, request: &GateRequest) -> Result<GateResult> {
        let result = run_all(&request.commands, request.strategy, &request.options)?;
        if let Some(path) = &request.log_path {
            write_gate_log(path, &result, request.options.output_limit_bytes)?;
        }
        Ok(result)
    }
}

/// Write per-command stdout/stderr sections, truncated to `output_limit` bytes.
pub fn write_gate_log(path: &Path, result: &GateResult, output_limit: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create gate log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    for command in &result.commands {
        buf.push_str(&format!(
            "=== {} (exit {}, {}ms) ===\n",
            command.command,
            command.exit_code(),
            command.duration.as_millis()
        ));
        if let Some(error) = command.error() {
            buf.push_str(&format!("error: {error}\n"));
        }
        buf.push_str("--- stdout ---\n");
        buf.push_str(&command.stdout);
        buf.push_str("\n--- stderr ---\n");
        buf.push_str(&command.stderr);
        buf.push('\n');
    }
    if let GateOutcome::Failed { summary } = &result.outcome {
        buf.push_str(&format!("=== summary ===\n{summary}\n"));
    }

    if buf.len() > output_limit {
        let mut cut = output_limit;
        while !buf.is_char_boundary(cut) {
            cut -= 1;
        }
        let truncated = format!("{}\n[truncated {} bytes]\n", &buf[..cut], buf.len() - cut);
        fs::write(path, truncated).with_context(|| format!("write gate log {}", path.display()))?;
        return Ok(());
    }

    fs::write(path, buf).with_context(|| format!("write gate log {}", path.display()))
}
