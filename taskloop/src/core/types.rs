//! Shared deterministic types for ledger classification and phase dispatch.
//!
//! These types define stable contracts between core components. They do not
//! depend on external state or I/O.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Orchestration state derived from the whole progress ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrchestrationState {
    /// Ledger file is missing.
    NoProgress,
    /// At least one task is blocked.
    Blocked,
    /// At least one task awaits review and none are blocked.
    InReview,
    /// At least one task is not started or in progress.
    WorkLeft,
    /// Nothing blocked, in review or pending.
    Done,
}

impl OrchestrationState {
    pub fn label(self) -> &'static str {
        match self {
            OrchestrationState::NoProgress => "NO_PROGRESS",
            OrchestrationState::Blocked => "BLOCKED",
            OrchestrationState::InReview => "IN_REVIEW",
            OrchestrationState::WorkLeft => "WORK_LEFT",
            OrchestrationState::Done => "DONE",
        }
    }
}

impl fmt::Display for OrchestrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Normalized status of a single ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Complete,
    NotStarted,
    InProgress,
    InReview,
    Blocked,
}

impl TaskStatus {
    /// Parse a raw status cell. Returns `None` for unrecognized text.
    ///
    /// Matching is case-insensitive and tolerates markdown emphasis, leading
    /// emoji, `-`/`_` separators and a trailing parenthetical note.
    pub fn parse(raw: &str) -> Option<Self> {
        let head = raw.split('(').next().unwrap_or_default();
        let cleaned: String = head
            .chars()
            .map(|c| match c {
                '_' | '-' => ' ',
                c if c.is_ascii_alphanumeric() || c.is_whitespace() => c.to_ascii_lowercase(),
                _ => ' ',
            })
            .collect();
        let words: Vec<&str> = cleaned.split_whitespace().collect();
        match words.join(" ").as_str() {
            "complete" | "completed" | "done" => Some(TaskStatus::Complete),
            "not started" => Some(TaskStatus::NotStarted),
            "in progress" => Some(TaskStatus::InProgress),
            "in review" => Some(TaskStatus::InReview),
            "blocked" => Some(TaskStatus::Blocked),
            _ => None,
        }
    }

    /// Not started or in progress.
    pub fn is_remaining(self) -> bool {
        matches!(self, TaskStatus::NotStarted | TaskStatus::InProgress)
    }
}

/// Snapshot of one recognized task row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRecord {
    pub id: String,
    pub title: String,
    pub file: Option<String>,
    pub status: TaskStatus,
    pub review: Option<String>,
    pub priority: Option<String>,
    pub complexity: Option<String>,
    pub dependencies: Vec<String>,
    pub assignee: Option<String>,
    pub reviewer: Option<String>,
    pub attempts: Option<u32>,
    /// Zero-based position among recognized task rows.
    pub position: usize,
}

/// Aggregate counts over recognized task rows.
///
/// `total == completed + remaining + in_review + blocked` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub total: usize,
    pub completed: usize,
    pub remaining: usize,
    pub in_review: usize,
    pub blocked: usize,
}

/// Workflow step that invokes the external agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Implement,
    Review,
    Tidy,
    Fix,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Implement, Phase::Review, Phase::Tidy, Phase::Fix];

    pub fn name(self) -> &'static str {
        match self {
            Phase::Implement => "implement",
            Phase::Review => "review",
            Phase::Tidy => "tidy",
            Phase::Fix => "fix",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
