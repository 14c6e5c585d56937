//! Loop configuration stored under `.taskloop/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::Phase;
use crate::exit_codes;

pub const DEFAULT_CONFIG_PATH: &str = ".taskloop/config.toml";

/// Loop configuration (TOML).
///
/// This file is edited by humans. Missing fields fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    /// Progress ledger, relative to the project root.
    pub ledger_path: PathBuf,

    /// Single-instance lock file, relative to the project root.
    pub lock_path: PathBuf,

    /// Directory for gate logs and other loop artifacts.
    pub state_dir: PathBuf,

    /// Agent phases to run before giving up.
    pub max_iterations: u32,

    /// Fix attempts per failing gate before the iteration fails.
    pub max_fix_attempts: u32,

    /// Require a `.git` marker at the project root.
    pub require_repo: bool,

    pub agent: AgentConfig,
    pub gate: GateConfig,
    pub cleanup: CleanupConfig,
    pub ledger: LedgerConfig,
}

/// Permission flag policy for the agent executable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionPolicy {
    #[default]
    AllowAll,
    Yolo,
    Strict,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Executable name or path.
    pub executable: String,
    pub permission: PermissionPolicy,
    /// Global model default; per-phase `model` wins.
    pub model: Option<String>,
    /// Appended after all generated flags.
    pub extra_flags: Vec<String>,
    /// Additional attempts after the first for transient exit codes.
    pub max_retries: u32,
    pub retry_exit_codes: Vec<i32>,
    pub backoff_base_ms: u64,
    pub backoff_max_factor: u32,
    /// Per-phase overrides keyed by phase name (`implement`, `review`, `tidy`, `fix`).
    pub phases: BTreeMap<String, PhaseConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct PhaseConfig {
    /// Agent definition path passed as `--agent=<path>`.
    pub agent: Option<String>,
    pub model: Option<String>,
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GateStrategy {
    #[default]
    Sequential,
    Parallel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GateConfig {
    /// Shell commands, run in order (or concurrently) from the project root.
    pub commands: Vec<String>,
    pub strategy: GateStrategy,
    pub timeout_secs: u64,
    /// Time between SIGTERM and SIGKILL for a timed-out command.
    pub kill_grace_ms: u64,
    /// Truncate captured stdout/stderr per command beyond this many bytes.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CleanupConfig {
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LedgerConfig {
    pub cache_ttl_ms: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            ledger_path: PathBuf::from("PROGRESS.md"),
            lock_path: PathBuf::from(".taskloop/loop.lock"),
            state_dir: PathBuf::from(".taskloop"),
            max_iterations: 50,
            max_fix_attempts: 3,
            require_repo: true,
            agent: AgentConfig::default(),
            gate: GateConfig::default(),
            cleanup: CleanupConfig::default(),
            ledger: LedgerConfig::default(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            executable: "copilot".to_string(),
            permission: PermissionPolicy::default(),
            model: None,
            extra_flags: Vec::new(),
            max_retries: 3,
            retry_exit_codes: vec![exit_codes::AGENT_RETRYABLE],
            backoff_base_ms: 1000,
            backoff_max_factor: 8,
            phases: BTreeMap::new(),
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            strategy: GateStrategy::default(),
            timeout_secs: 10 * 60,
            kill_grace_ms: 2000,
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self { timeout_ms: 5000 }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { cache_ttl_ms: 200 }
    }
}

impl AgentConfig {
    pub fn phase(&self, phase: Phase) -> PhaseConfig {
        self.phases.get(phase.name()).cloned().unwrap_or_default()
    }

    /// Agent definition path for `phase`.
    pub fn agent_path(&self, phase: Phase) -> String {
        self.phase(phase)
            .agent
            .unwrap_or_else(|| format!(".github/agents/{}.agent.md", phase.name()))
    }

    /// Per-phase model, else the global default.
    pub fn model_for(&self, phase: Phase) -> Option<String> {
        self.phase(phase).model.or_else(|| self.model.clone())
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

impl GateConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

impl CleanupConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.ledger_path.as_os_str().is_empty() {
            return Err(anyhow!("ledger_path must be set"));
        }
        if self.lock_path.as_os_str().is_empty() {
            return Err(anyhow!("lock_path must be set"));
        }
        if self.agent.executable.trim().is_empty() {
            return Err(anyhow!("agent.executable must be non-empty"));
        }
        if self.agent.backoff_max_factor == 0 {
            return Err(anyhow!("agent.backoff_max_factor must be > 0"));
        }
        if self.gate.timeout_secs == 0 {
            return Err(anyhow!("gate.timeout_secs must be > 0"));
        }
        if self.gate.output_limit_bytes == 0 {
            return Err(anyhow!("gate.output_limit_bytes must be > 0"));
        }
        if self.gate.commands.iter().any(|cmd| cmd.trim().is_empty()) {
            return Err(anyhow!("gate.commands must not contain empty commands"));
        }
        if self.cleanup.timeout_ms == 0 {
            return Err(anyhow!("cleanup.timeout_ms must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LoopConfig::default()`.
pub fn load_config(path: &Path) -> Result<LoopConfig> {
    if !path.exists() {
        let cfg = LoopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LoopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &LoopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, LoopConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested/config.toml");
        let mut cfg = LoopConfig::default();
        cfg.gate.commands = vec!["cargo test".to_string()];
        cfg.agent.phases.insert(
            "fix".to_string(),
            PhaseConfig {
                model: Some("fast-model".to_string()),
                ..PhaseConfig::default()
            },
        );
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "max_fix_attempts = 1\n\n[agent]\npermission = \"strict\"\n\n[agent.phases.review]\nmodel = \"big\"\n\n[gate]\ncommands = [\"exit 0\"]\nstrategy = \"parallel\"\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_fix_attempts, 1);
        assert_eq!(cfg.max_iterations, 50);
        assert_eq!(cfg.agent.permission, PermissionPolicy::Strict);
        assert_eq!(cfg.agent.model_for(Phase::Review).as_deref(), Some("big"));
        assert_eq!(cfg.agent.model_for(Phase::Implement), None);
        assert_eq!(cfg.gate.strategy, GateStrategy::Parallel);
    }

    #[test]
    fn cleanup_timeout_is_read_from_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[cleanup]\ntimeout_ms = 250\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.cleanup.timeout(), Duration::from_millis(250));
    }

    #[test]
    fn validate_rejects_empty_gate_command() {
        let mut cfg = LoopConfig::default();
        cfg.gate.commands = vec!["  ".to_string()];
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("gate.commands"));
    }

    #[test]
    fn agent_path_defaults_per_phase() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.agent_path(Phase::Tidy), ".github/agents/tidy.agent.md");
    }
}
