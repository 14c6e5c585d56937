//! Tolerant parsing of the markdown progress ledger.
//!
//! The parser never fails: rows that are too short, carry an identifier that
//! is not a task id (milestone markers, prose tables) or an unknown status are
//! skipped. Column positions come from the table header when one is present,
//! otherwise from the fixed positional order.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{LedgerStats, OrchestrationState, TaskRecord, TaskStatus};

/// Minimum number of populated cells for a row to be considered.
pub const MIN_POPULATED_COLUMNS: usize = 4;

static TASK_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:task-?|t-?)?\d+(?:\.\d+)*[a-z]?$").expect("task id regex")
});

/// Parsed ledger: recognized task rows in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ledger {
    pub tasks: Vec<TaskRecord>,
}

impl Ledger {
    pub fn parse(contents: &str) -> Self {
        Self {
            tasks: parse_tasks(contents),
        }
    }

    /// Reduce the ledger to a single state.
    ///
    /// Priority is fixed: blocked > in review > work left > done. A ledger
    /// with no recognized rows is `Done`.
    pub fn classify(&self) -> OrchestrationState {
        let has = |status: TaskStatus| self.tasks.iter().any(|task| task.status == status);
        if has(TaskStatus::Blocked) {
            OrchestrationState::Blocked
        } else if has(TaskStatus::InReview) {
            OrchestrationState::InReview
        } else if self.tasks.iter().any(|task| task.status.is_remaining()) {
            OrchestrationState::WorkLeft
        } else {
            OrchestrationState::Done
        }
    }

    pub fn statistics(&self) -> LedgerStats {
        let mut stats = LedgerStats {
            total: self.tasks.len(),
            ..LedgerStats::default()
        };
        for task in &self.tasks {
            match task.status {
                TaskStatus::Complete => stats.completed += 1,
                TaskStatus::NotStarted | TaskStatus::InProgress => stats.remaining += 1,
                TaskStatus::InReview => stats.in_review += 1,
                TaskStatus::Blocked => stats.blocked += 1,
            }
        }
        stats
    }

    /// First task (top to bottom) that is in progress.
    pub fn current_task(&self) -> Option<&TaskRecord> {
        self.tasks
            .iter()
            .find(|task| task.status == TaskStatus::InProgress)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ColumnMap {
    id: usize,
    title: Option<usize>,
    file: Option<usize>,
    status: usize,
    review: Option<usize>,
    priority: Option<usize>,
    complexity: Option<usize>,
    dependencies: Option<usize>,
    assignee: Option<usize>,
    reviewer: Option<usize>,
    attempts: Option<usize>,
}

impl ColumnMap {
    const POSITIONAL: ColumnMap = ColumnMap {
        id: 0,
        title: Some(1),
        file: Some(2),
        status: 3,
        review: Some(4),
        priority: Some(5),
        complexity: Some(6),
        dependencies: Some(7),
        assignee: Some(8),
        reviewer: Some(9),
        attempts: Some(10),
    };

    /// Build a map from header cells. Falls back to positional order unless
    /// both an id and a status column are named.
    fn from_header(cells: &[String]) -> Self {
        let mut id = None;
        let mut status = None;
        let mut map = ColumnMap {
            id: 0,
            title: None,
            file: None,
            status: 0,
            review: None,
            priority: None,
            complexity: None,
            dependencies: None,
            assignee: None,
            reviewer: None,
            attempts: None,
        };
        for (idx, cell) in cells.iter().enumerate() {
            if cell.trim() == "#" {
                id.get_or_insert(idx);
                continue;
            }
            let key: String = cell
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .map(|c| c.to_ascii_lowercase())
                .collect();
            let slot = match key.as_str() {
                "id" | "task" | "taskid" => &mut id,
                "title" | "name" | "description" | "summary" => &mut map.title,
                "file" | "files" | "spec" | "ref" | "reference" => &mut map.file,
                "status" | "state" => &mut status,
                "review" | "reviewoutcome" | "reviewresult" => &mut map.review,
                "priority" => &mut map.priority,
                "complexity" => &mut map.complexity,
                "dependencies" | "deps" | "dependson" => &mut map.dependencies,
                "assignee" | "owner" => &mut map.assignee,
                "reviewer" => &mut map.reviewer,
                "attempts" | "attemptcount" | "tries" => &mut map.attempts,
                _ => continue,
            };
            slot.get_or_insert(idx);
        }
        match (id, status) {
            (Some(id), Some(status)) => ColumnMap { id, status, ..map },
            _ => ColumnMap::POSITIONAL,
        }
    }
}

fn parse_tasks(contents: &str) -> Vec<TaskRecord> {
    let lines: Vec<&str> = contents
        .split('\n')
        .map(|line| line.trim_end_matches('\r').trim())
        .collect();

    let mut tasks = Vec::new();
    let mut columns: Option<ColumnMap> = None;
    let mut idx = 0;
    while idx < lines.len() {
        let line = lines[idx];
        if !line.starts_with('|') {
            // Leaving a table; the next one brings its own header.
            columns = None;
            idx += 1;
            continue;
        }
        if is_separator(line) {
            idx += 1;
            continue;
        }
        let cells = split_cells(line);
        if columns.is_none() && lines.get(idx + 1).is_some_and(|next| is_separator(next)) {
            columns = Some(ColumnMap::from_header(&cells));
            idx += 2;
            continue;
        }
        let map = columns.unwrap_or(ColumnMap::POSITIONAL);
        if let Some(task) = parse_row(&cells, &map, tasks.len()) {
            tasks.push(task);
        }
        idx += 1;
    }
    tasks
}

fn parse_row(cells: &[String], map: &ColumnMap, position: usize) -> Option<TaskRecord> {
    let populated = cells.iter().filter(|cell| !cell.is_empty()).count();
    if populated < MIN_POPULATED_COLUMNS {
        return None;
    }
    let id = strip_emphasis(cells.get(map.id)?);
    if !TASK_ID.is_match(&id) {
        return None;
    }
    let status = TaskStatus::parse(cells.get(map.status)?)?;
    let cell = |slot: Option<usize>| {
        slot.and_then(|idx| cells.get(idx))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty() && value != "-")
    };
    let dependencies = cell(map.dependencies)
        .map(|deps| {
            deps.split([',', ' ', ';'])
                .map(strip_emphasis)
                .filter(|dep| !dep.is_empty())
                .collect()
        })
        .unwrap_or_default();
    let attempts = cell(map.attempts).and_then(|raw| raw.parse().ok());

    Some(TaskRecord {
        id,
        title: cell(map.title).unwrap_or_default(),
        file: cell(map.file),
        status,
        review: cell(map.review),
        priority: cell(map.priority),
        complexity: cell(map.complexity),
        dependencies,
        assignee: cell(map.assignee),
        reviewer: cell(map.reviewer),
        attempts,
        position,
    })
}

fn is_separator(line: &str) -> bool {
    line.starts_with('|')
        && line.contains('-')
        && line
            .chars()
            .all(|c| matches!(c, '|' | '-' | ':' | ' ' | '\t'))
}

/// Split a `| a | b |` row into trimmed cells, keeping `\|` inside a cell.
fn split_cells(line: &str) -> Vec<String> {
    let inner = line.strip_prefix('|').unwrap_or(line);
    let inner = if inner.ends_with('|') && !inner.ends_with("\\|") {
        &inner[..inner.len() - 1]
    } else {
        inner
    };

    let mut cells = Vec::new();
    let mut current = String::new();
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'|') => {
                current.push('|');
                chars.next();
            }
            '|' => cells.push(std::mem::take(&mut current).trim().to_string()),
            _ => current.push(c),
        }
    }
    cells.push(current.trim().to_string());
    cells
}

fn strip_emphasis(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c: char| matches!(c, '*' | '`' | '~' | '_'))
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str =
        "| ID | Title | File | Status | Review |\n|----|-------|------|--------|--------|\n";

    fn ledger(rows: &[&str]) -> Ledger {
        let mut contents = HEADER.to_string();
        for row in rows {
            contents.push_str(row);
            contents.push('\n');
        }
        Ledger::parse(&contents)
    }

    #[test]
    fn blocked_row_forces_blocked_state() {
        let ledger = ledger(&[
            "| T001 | Setup | src/a.rs | Complete | approved |",
            "| T002 | Wire | src/b.rs | Blocked | - |",
            "| T003 | Ship | src/c.rs | Not Started | - |",
        ]);
        assert_eq!(ledger.classify(), OrchestrationState::Blocked);
        assert_eq!(
            ledger.statistics(),
            LedgerStats {
                total: 3,
                completed: 1,
                remaining: 1,
                in_review: 0,
                blocked: 1,
            }
        );
    }

    #[test]
    fn review_outranks_work_left() {
        let ledger = ledger(&[
            "| T001 | Setup | a | In Review | - |",
            "| T002 | Wire | b | In Progress | - |",
        ]);
        assert_eq!(ledger.classify(), OrchestrationState::InReview);
    }

    #[test]
    fn all_complete_is_done() {
        let ledger = ledger(&[
            "| T001 | Setup | a | done | ok |",
            "| T002 | Wire | b | Completed | ok |",
        ]);
        assert_eq!(ledger.classify(), OrchestrationState::Done);
    }

    #[test]
    fn zero_recognized_rows_is_done() {
        let ledger = Ledger::parse("# Progress\n\nnothing tabular here\n");
        assert!(ledger.tasks.is_empty());
        assert_eq!(ledger.classify(), OrchestrationState::Done);
        assert_eq!(ledger.statistics().total, 0);
    }

    #[test]
    fn crlf_line_endings_are_accepted() {
        let contents = "| ID | Title | File | Status |\r\n|---|---|---|---|\r\n| T001 | A | a.rs | in progress |\r\n";
        let ledger = Ledger::parse(contents);
        assert_eq!(ledger.tasks.len(), 1);
        assert_eq!(ledger.classify(), OrchestrationState::WorkLeft);
    }

    #[test]
    fn short_and_non_task_rows_are_skipped() {
        let ledger = ledger(&[
            "| T001 | Setup | a | Complete | ok |",
            "| T002 | Short | | |",
            "| V1 | Verification milestone | - | Not Started | - |",
            "| **Checkpoint** | Run the full suite | - | Blocked | - |",
            "| T003 | Unknown status | c | someday | - |",
        ]);
        let ids: Vec<&str> = ledger.tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["T001"]);
        assert_eq!(ledger.classify(), OrchestrationState::Done);
    }

    #[test]
    fn positional_columns_apply_without_header() {
        let contents = "| 1.1 | Alpha | a.rs | Not Started | - | high | S | 1.0, 0.9 | alice |\n";
        let ledger = Ledger::parse(contents);
        let task = &ledger.tasks[0];
        assert_eq!(task.id, "1.1");
        assert_eq!(task.status, TaskStatus::NotStarted);
        assert_eq!(task.priority.as_deref(), Some("high"));
        assert_eq!(task.dependencies, vec!["1.0", "0.9"]);
        assert_eq!(task.assignee.as_deref(), Some("alice"));
        assert_eq!(task.review, None);
    }

    #[test]
    fn header_names_relocate_columns() {
        let contents = "| Status | Task | Title | Priority | Attempts |\n|:--|:--|:--|:--|--:|\n| In Progress | `TASK-7` | Refactor | low | 2 |\n";
        let ledger = Ledger::parse(contents);
        let task = &ledger.tasks[0];
        assert_eq!(task.id, "TASK-7");
        assert_eq!(task.title, "Refactor");
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.attempts, Some(2));
        assert_eq!(task.file, None);
    }

    #[test]
    fn current_task_is_first_in_progress_row() {
        let ledger = ledger(&[
            "| T001 | Setup | a | Complete | - |",
            "| T002 | Wire | b | In Progress | - |",
            "| T003 | Ship | c | In Progress | - |",
        ]);
        let current = ledger.current_task().expect("current task");
        assert_eq!(current.id, "T002");
        assert_eq!(current.position, 1);
    }

    #[test]
    fn escaped_pipes_stay_in_cell() {
        let cells = split_cells(r"| T001 | a \| b | x | Done |");
        assert_eq!(cells, vec!["T001", "a | b", "x", "Done"]);
    }

    #[test]
    fn statistics_partition_total() {
        let ledger = ledger(&[
            "| T001 | A | a | Complete | - |",
            "| T002 | B | b | Not Started | - |",
            "| T003 | C | c | In Progress | - |",
            "| T004 | D | d | In Review | - |",
            "| T005 | E | e | Blocked | - |",
            "| T006 | F | f | Done | - |",
        ]);
        let stats = ledger.statistics();
        assert_eq!(stats.total, 6);
        assert_eq!(
            stats.total,
            stats.completed + stats.remaining + stats.in_review + stats.blocked
        );
        assert_eq!(stats.remaining, 2);
    }

    #[test]
    fn second_table_brings_its_own_header() {
        let contents = format!(
            "{HEADER}| T001 | A | a | Complete | - |\n\n## Notes\n\n| Status | ID | Title | Extra |\n|---|---|---|---|\n| Blocked | T002 | B | x |\n"
        );
        let ledger = Ledger::parse(&contents);
        assert_eq!(ledger.tasks.len(), 2);
        assert_eq!(ledger.tasks[1].status, TaskStatus::Blocked);
        assert_eq!(ledger.classify(), OrchestrationState::Blocked);
    }
}
