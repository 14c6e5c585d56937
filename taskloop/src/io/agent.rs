//! Agent invocation: argument building, spawning and transient-failure retry.
//!
//! The [`AgentSpawner`] trait decouples the run loop from the real agent
//! executable. Tests use scripted spawners that return predetermined exit
//! codes without launching processes.

use std::env;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::retry::{backoff_delay, can_retry};
use crate::core::types::Phase;
use crate::exit_codes;
use crate::io::config::{AgentConfig, PermissionPolicy};
use crate::io::process::exit_code;

/// What to ask the agent for one phase.
#[derive(Debug, Clone, Copy)]
pub struct AgentInvocation<'a> {
    pub phase: Phase,
    pub agent_path: &'a str,
    pub prompt: &'a str,
}

/// Ordered argument list:
/// `-p <prompt> --agent=<path> [--allow-all|--yolo] [--model <name>] [extra...]`.
pub fn build_args(config: &AgentConfig, invocation: &AgentInvocation<'_>) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        invocation.prompt.to_string(),
        format!("--agent={}", invocation.agent_path),
    ];
    match config.permission {
        PermissionPolicy::AllowAll => args.push("--allow-all".to_string()),
        PermissionPolicy::Yolo => args.push("--yolo".to_string()),
        PermissionPolicy::Strict => {}
    }
    if let Some(model) = config.model_for(invocation.phase) {
        args.push("--model".to_string());
        args.push(model);
    }
    args.extend(config.extra_flags.iter().cloned());
    args
}

/// Parameters for a single agent process launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
}

/// How a launched agent ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnExit {
    Exited(i32),
    /// The executable could not be found; never retried.
    NotFound,
}

impl SpawnExit {
    pub fn code(self) -> i32 {
        match self {
            SpawnExit::Exited(code) => code,
            SpawnExit::NotFound => exit_codes::NOT_FOUND,
        }
    }
}

/// Abstraction over agent launch backends.
pub trait AgentSpawner {
    /// Run the agent to completion and report how it ended.
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnExit>;
}

/// Spawns the agent with inherited stdio so the operator sees live output.
pub struct ProcessSpawner;

impl AgentSpawner for ProcessSpawner {
    #[instrument(skip_all, fields(program = %request.program))]
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnExit> {
        debug!(args = ?request.args, workdir = %request.workdir.display(), "spawning agent");
        let status = match Command::new(&request.program)
            .args(&request.args)
            .current_dir(&request.workdir)
            .status()
        {
            Ok(status) => status,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!("agent executable not found");
                return Ok(SpawnExit::NotFound);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("spawn agent {}", request.program));
            }
        };
        Ok(SpawnExit::Exited(exit_code(&status)))
    }
}

/// Result of one logical agent invocation, after retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentRunResult {
    Success {
        attempts: u32,
    },
    Failure {
        exit_code: i32,
        attempts: u32,
        error: String,
    },
}

impl AgentRunResult {
    pub fn is_success(&self) -> bool {
        matches!(self, AgentRunResult::Success { .. })
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            AgentRunResult::Success { .. } => exit_codes::OK,
            AgentRunResult::Failure { exit_code, .. } => *exit_code,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            AgentRunResult::Success { attempts } | AgentRunResult::Failure { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Launch the agent, retrying whitelisted exit codes with capped exponential backoff.
///
/// `config.max_retries` bounds the additional attempts after the first. The
/// backoff only depends on the retry number, not on how long an attempt ran.
#[instrument(skip_all, fields(phase = %invocation.phase))]
pub fn run_with_retry<S: AgentSpawner + ?Sized>(
    config: &AgentConfig,
    spawner: &S,
    invocation: &AgentInvocation<'_>,
    workdir: &Path,
) -> Result<AgentRunResult> {
    let request = SpawnRequest {
        program: config.executable.clone(),
        args: build_args(config, invocation),
        workdir: workdir.to_path_buf(),
    };

    let mut retries = 0u32;
    loop {
        let attempts = retries + 1;
        info!(attempt = attempts, "invoking agent");
        let code = match spawner.spawn(&request)? {
            SpawnExit::Exited(exit_codes::OK) => {
                info!(attempts, "agent succeeded");
                return Ok(AgentRunResult::Success { attempts });
            }
            SpawnExit::NotFound => {
                return Ok(AgentRunResult::Failure {
                    exit_code: exit_codes::NOT_FOUND,
                    attempts,
                    error: format!("agent executable `{}` not found", config.executable),
                });
            }
            SpawnExit::Exited(code) => code,
        };

        let transient = config.retry_exit_codes.contains(&code);
        if transient && can_retry(config.max_retries, retries) {
            let delay = backoff_delay(config.backoff_base(), retries, config.backoff_max_factor);
            warn!(
                exit_code = code,
                delay_ms = delay.as_millis() as u64,
                "transient agent failure, retrying"
            );
            thread::sleep(delay);
            retries += 1;
            continue;
        }

        let error = if transient {
            format!("agent exited with transient code {code} after {attempts} attempts")
        } else {
            format!("agent exited with code {code}")
        };
        warn!(exit_code = code, attempts, "agent failed");
        return Ok(AgentRunResult::Failure {
            exit_code: code,
            attempts,
            error,
        });
    }
}

/// Locate `program` the way the shell would: paths are checked directly,
/// bare names are searched on `PATH`.
pub fn resolve_executable(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|full| is_executable(full))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use crate::io::config::PhaseConfig;

    struct FakeSpawner {
        exits: RefCell<VecDeque<SpawnExit>>,
        calls: RefCell<u32>,
    }

    impl FakeSpawner {
        fn new(exits: Vec<SpawnExit>) -> Self {
            Self {
                exits: RefCell::new(exits.into()),
                calls: RefCell::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.borrow()
        }
    }

    impl AgentSpawner for FakeSpawner {
        fn spawn(&self, _request: &SpawnRequest) -> Result<SpawnExit> {
            *self.calls.borrow_mut() += 1;
            Ok(self
                .exits
                .borrow_mut()
                .pop_front()
                .unwrap_or(SpawnExit::Exited(0)))
        }
    }

    fn fast_config() -> AgentConfig {
        AgentConfig {
            backoff_base_ms: 0,
            ..AgentConfig::default()
        }
    }

    fn invocation(prompt: &str) -> AgentInvocation<'_> {
        AgentInvocation {
            phase: Phase::Implement,
            agent_path: ".github/agents/implement.agent.md",
            prompt,
        }
    }

    #[test]
    fn args_follow_documented_order() {
        let mut config = AgentConfig {
            model: Some("global".to_string()),
            extra_flags: vec!["--no-color".to_string()],
            ..AgentConfig::default()
        };
        config.phases.insert(
            "implement".to_string(),
            PhaseConfig {
                model: Some("phase".to_string()),
                ..PhaseConfig::default()
            },
        );
        let args = build_args(&config, &invocation("do it"));
        assert_eq!(
            args,
            vec![
                "-p",
                "do it",
                "--agent=.github/agents/implement.agent.md",
                "--allow-all",
                "--model",
                "phase",
                "--no-color",
            ]
        );
    }

    #[test]
    fn strict_policy_and_no_model_emit_no_flags() {
        let config = AgentConfig {
            permission: PermissionPolicy::Strict,
            ..AgentConfig::default()
        };
        let args = build_args(&config, &invocation(""));
        assert_eq!(
            args,
            vec!["-p", "", "--agent=.github/agents/implement.agent.md"]
        );
    }

    #[test]
    fn yolo_policy_uses_global_model() {
        let config = AgentConfig {
            permission: PermissionPolicy::Yolo,
            model: Some("global".to_string()),
            ..AgentConfig::default()
        };
        let args = build_args(&config, &invocation("x"));
        assert!(args.contains(&"--yolo".to_string()));
        assert_eq!(&args[args.len() - 2..], ["--model", "global"]);
    }

    #[test]
    fn transient_codes_are_retried_until_success() {
        let spawner = FakeSpawner::new(vec![SpawnExit::Exited(75), SpawnExit::Exited(75)]);
        let result = run_with_retry(
            &fast_config(),
            &spawner,
            &invocation("p"),
            &env::temp_dir(),
        )
        .expect("run");
        assert_eq!(result, AgentRunResult::Success { attempts: 3 });
        assert_eq!(spawner.calls(), 3);
    }

    #[test]
    fn retries_are_bounded() {
        let spawner = FakeSpawner::new(vec![SpawnExit::Exited(75); 10]);
        let config = AgentConfig {
            max_retries: 2,
            ..fast_config()
        };
        let result =
            run_with_retry(&config, &spawner, &invocation("p"), &env::temp_dir()).expect("run");
        assert_eq!(result.exit_code(), 75);
        assert_eq!(result.attempts(), 3);
        assert_eq!(spawner.calls(), 3);
    }

    #[test]
    fn non_whitelisted_code_fails_immediately() {
        let spawner = FakeSpawner::new(vec![SpawnExit::Exited(2)]);
        let result = run_with_retry(
            &fast_config(),
            &spawner,
            &invocation("p"),
            &env::temp_dir(),
        )
        .expect("run");
        assert!(!result.is_success());
        assert_eq!(result.exit_code(), 2);
        assert_eq!(spawner.calls(), 1);
    }

    #[test]
    fn not_found_is_not_retried() {
        let spawner = FakeSpawner::new(vec![SpawnExit::NotFound]);
        let result = run_with_retry(
            &fast_config(),
            &spawner,
            &invocation("p"),
            &env::temp_dir(),
        )
        .expect("run");
        assert_eq!(result.exit_code(), exit_codes::NOT_FOUND);
        assert_eq!(spawner.calls(), 1);
    }

    #[test]
    fn process_spawner_reports_missing_executable() {
        let request = SpawnRequest {
            program: "taskloop-definitely-missing-agent".to_string(),
            args: Vec::new(),
            workdir: env::temp_dir(),
        };
        let exit = ProcessSpawner.spawn(&request).expect("spawn");
        assert_eq!(exit, SpawnExit::NotFound);
        assert_eq!(exit.code(), 127);
    }

    #[cfg(unix)]
    #[test]
    fn process_spawner_returns_exit_code() {
        let request = SpawnRequest {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "exit 9".to_string()],
            workdir: env::temp_dir(),
        };
        assert_eq!(
            ProcessSpawner.spawn(&request).expect("spawn"),
            SpawnExit::Exited(9)
        );
    }

    #[cfg(unix)]
    #[test]
    fn resolves_executables_on_path_and_by_path() {
        assert!(resolve_executable("sh").is_some());
        assert!(resolve_executable("taskloop-definitely-missing-agent").is_none());

        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("agent");
        std::fs::write(&script, "#!/bin/sh\n").expect("write");
        let display = script.display().to_string();
        assert!(resolve_executable(&display).is_none());

        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("chmod");
        assert_eq!(resolve_executable(&display), Some(script));
    }
}
