//! Test-only helpers: scripted agent/gate doubles and throwaway projects.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::io::agent::{AgentSpawner, SpawnExit, SpawnRequest};
use crate::io::config::LoopConfig;
use crate::io::gate::{CommandStatus, GateCommandResult, GateRequest, GateResult, GateRunner};

/// One scripted agent launch.
#[derive(Debug, Clone)]
pub struct ScriptedAgent {
    pub exit: SpawnExit,
    /// Ledger contents the "agent" writes before exiting.
    pub ledger: Option<String>,
}

impl ScriptedAgent {
    pub fn exit(code: i32) -> Self {
        Self {
            exit: SpawnExit::Exited(code),
            ledger: None,
        }
    }

    /// Succeed after rewriting the ledger.
    pub fn writes(ledger: impl Into<String>) -> Self {
        Self {
            exit: SpawnExit::Exited(0),
            ledger: Some(ledger.into()),
        }
    }
}

/// Agent spawner that replays a script and records every request.
pub struct ScriptedSpawner {
    ledger_path: PathBuf,
    script: RefCell<VecDeque<ScriptedAgent>>,
    calls: RefCell<Vec<SpawnRequest>>,
}

impl ScriptedSpawner {
    pub fn new(ledger_path: impl Into<PathBuf>, script: Vec<ScriptedAgent>) -> Self {
        Self {
            ledger_path: ledger_path.into(),
            script: RefCell::new(script.into()),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<SpawnRequest> {
        self.calls.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.script.borrow().len()
    }
}

impl AgentSpawner for ScriptedSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnExit> {
        self.calls.borrow_mut().push(request.clone());
        let step = self
            .script
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("unexpected agent invocation: {:?}", request.args))?;
        if let Some(ledger) = &step.ledger {
            fs::write(&self.ledger_path, ledger)
                .with_context(|| format!("write {}", self.ledger_path.display()))?;
        }
        Ok(step.exit)
    }
}

/// Gate runner that replays pass/fail results and records requests.
pub struct ScriptedGateRunner {
    script: RefCell<VecDeque<GateResult>>,
    requests: RefCell<Vec<GateRequest>>,
}

impl ScriptedGateRunner {
    pub fn new(script: Vec<GateResult>) -> Self {
        Self {
            script: RefCell::new(script.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<GateRequest> {
        self.requests.borrow().clone()
    }
}

impl GateRunner for ScriptedGateRunner {
    fn run(&self, request: &GateRequest) -> Result<GateResult> {
        self.requests.borrow_mut().push(request.clone());
        self.script
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("unexpected gate run"))
    }
}

/// A single-command gate result that passed.
pub fn gate_pass() -> GateResult {
    GateResult::new(
        vec![GateCommandResult {
            command: "check".to_string(),
            status: CommandStatus::Passed,
            stdout: "ok".to_string(),
            stderr: String::new(),
            duration: Duration::from_millis(1),
        }],
        Duration::from_millis(1),
    )
}

/// A single-command gate result that failed with `exit_code`.
pub fn gate_fail(exit_code: i32) -> GateResult {
    GateResult::new(
        vec![GateCommandResult {
            command: "check".to_string(),
            status: CommandStatus::Failed { exit_code },
            stdout: String::new(),
            stderr: "check failed".to_string(),
            duration: Duration::from_millis(1),
        }],
        Duration::from_millis(1),
    )
}

/// Markdown ledger with `| ID | Title | File | Status |` rows.
pub fn ledger_table(rows: &[(&str, &str)]) -> String {
    let mut buf = String::from(
        "# Progress\n\n| ID | Title | File | Status |\n|----|-------|------|--------|\n",
    );
    for (id, status) in rows {
        buf.push_str(&format!("| {id} | Task {id} | src/{id}.rs | {status} |\n"));
    }
    buf
}

/// Temporary project root with a `.git` marker and a fast config.
pub struct TestProject {
    dir: TempDir,
    config: LoopConfig,
}

impl TestProject {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp project")?;
        fs::create_dir(dir.path().join(".git")).context("create .git marker")?;
        let mut config = LoopConfig::default();
        config.agent.backoff_base_ms = 0;
        config.agent.executable = "agent".to_string();
        config.gate.commands = vec!["check".to_string()];
        Ok(Self { dir, config })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut LoopConfig {
        &mut self.config
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.root().join(&self.config.ledger_path)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root().join(&self.config.lock_path)
    }

    pub fn write_ledger(&self, contents: &str) -> Result<()> {
        let path = self.ledger_path();
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read_ledger(&self) -> Result<String> {
        let path = self.ledger_path();
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }
}
