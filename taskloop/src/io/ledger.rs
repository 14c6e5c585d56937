//! Ledger reads with a short-lived cache.
//!
//! Every non-cached read parses the file into a fresh immutable [`Ledger`]
//! snapshot. The cache only serves repeated reads of the same path inside the
//! TTL window; a missing file evicts the entry.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::ledger::Ledger;
use crate::core::types::{LedgerStats, OrchestrationState, TaskRecord};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Serve a snapshot younger than the TTL when available.
    Cached,
    /// Always re-read the file.
    ForceRefresh,
}

#[derive(Debug)]
struct CacheEntry {
    read_at: Instant,
    ledger: Arc<Ledger>,
}

#[derive(Debug)]
pub struct LedgerReader {
    ttl: Duration,
    cache: Mutex<HashMap<PathBuf, CacheEntry>>,
}

impl Default for LedgerReader {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

impl LedgerReader {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Read and parse the ledger. `Ok(None)` means the file does not exist.
    pub fn read(&self, path: &Path, mode: ReadMode) -> Result<Option<Arc<Ledger>>> {
        if mode == ReadMode::Cached
            && let Some(ledger) = self.cached(path)
        {
            if path.exists() {
                debug!(path = %path.display(), "ledger served from cache");
                return Ok(Some(ledger));
            }
            self.evict(path);
            return Ok(None);
        }

        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                self.evict(path);
                return Ok(None);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read ledger {}", path.display()));
            }
        };
        let ledger = Arc::new(Ledger::parse(&contents));
        debug!(path = %path.display(), tasks = ledger.tasks.len(), "ledger parsed");
        self.store(path, ledger.clone());
        Ok(Some(ledger))
    }

    /// Classify the ledger; a missing file is `NoProgress`.
    pub fn classify(&self, path: &Path, mode: ReadMode) -> Result<OrchestrationState> {
        Ok(self
            .read(path, mode)?
            .map_or(OrchestrationState::NoProgress, |ledger| ledger.classify()))
    }

    /// Aggregate counts; a missing file yields all zeros.
    pub fn statistics(&self, path: &Path, mode: ReadMode) -> Result<LedgerStats> {
        Ok(self
            .read(path, mode)?
            .map(|ledger| ledger.statistics())
            .unwrap_or_default())
    }

    pub fn current_task(&self, path: &Path, mode: ReadMode) -> Result<Option<TaskRecord>> {
        Ok(self
            .read(path, mode)?
            .and_then(|ledger| ledger.current_task().cloned()))
    }

    fn cached(&self, path: &Path) -> Option<Arc<Ledger>> {
        let cache = self.cache.lock().ok()?;
        let entry = cache.get(path)?;
        (entry.read_at.elapsed() < self.ttl).then(|| entry.ledger.clone())
    }

    fn store(&self, path: &Path, ledger: Arc<Ledger>) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(
                path.to_path_buf(),
                CacheEntry {
                    read_at: Instant::now(),
                    ledger,
                },
            );
        }
    }

    fn evict(&self, path: &Path) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "| ID | Title | File | Status |\n|---|---|---|---|\n";

    fn write_ledger(path: &Path, rows: &[&str]) {
        let mut contents = TABLE.to_string();
        for row in rows {
            contents.push_str(row);
            contents.push('\n');
        }
        fs::write(path, contents).expect("write ledger");
    }

    #[test]
    fn missing_file_is_no_progress() {
        let temp = tempfile::tempdir().expect("tempdir");
        let reader = LedgerReader::default();
        let state = reader
            .classify(&temp.path().join("PROGRESS.md"), ReadMode::ForceRefresh)
            .expect("classify");
        assert_eq!(state, OrchestrationState::NoProgress);
    }

    #[test]
    fn unparsable_file_is_done_not_no_progress() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("PROGRESS.md");
        fs::write(&path, "garbage\n| not | a | task |\n").expect("write");
        let reader = LedgerReader::default();
        let state = reader
            .classify(&path, ReadMode::ForceRefresh)
            .expect("classify");
        assert_eq!(state, OrchestrationState::Done);
    }

    #[test]
    fn cached_read_serves_snapshot_within_ttl() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("PROGRESS.md");
        write_ledger(&path, &["| T001 | A | a | Not Started |"]);
        let reader = LedgerReader::new(Duration::from_secs(60));

        let first = reader.classify(&path, ReadMode::Cached).expect("first");
        write_ledger(&path, &["| T001 | A | a | Complete |"]);
        let cached = reader.classify(&path, ReadMode::Cached).expect("cached");
        let fresh = reader
            .classify(&path, ReadMode::ForceRefresh)
            .expect("fresh");

        assert_eq!(first, OrchestrationState::WorkLeft);
        assert_eq!(cached, OrchestrationState::WorkLeft);
        assert_eq!(fresh, OrchestrationState::Done);
    }

    #[test]
    fn cached_read_expires_after_ttl() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("PROGRESS.md");
        write_ledger(&path, &["| T001 | A | a | Blocked |"]);
        let reader = LedgerReader::new(Duration::from_millis(1));

        reader.classify(&path, ReadMode::Cached).expect("first");
        write_ledger(&path, &["| T001 | A | a | In Review |"]);
        std::thread::sleep(Duration::from_millis(10));
        let state = reader.classify(&path, ReadMode::Cached).expect("second");
        assert_eq!(state, OrchestrationState::InReview);
    }

    #[test]
    fn deleted_file_invalidates_cache() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("PROGRESS.md");
        write_ledger(&path, &["| T001 | A | a | In Progress |"]);
        let reader = LedgerReader::new(Duration::from_secs(60));

        reader.classify(&path, ReadMode::Cached).expect("first");
        fs::remove_file(&path).expect("remove");
        let state = reader.classify(&path, ReadMode::Cached).expect("second");
        assert_eq!(state, OrchestrationState::NoProgress);
    }

    #[test]
    fn statistics_and_current_task_use_same_parse() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("PROGRESS.md");
        write_ledger(
            &path,
            &[
                "| T001 | A | a | Complete |",
                "| T002 | B | b | Blocked |",
                "| T003 | C | c | Not Started |",
            ],
        );
        let reader = LedgerReader::default();
        let stats = reader
            .statistics(&path, ReadMode::ForceRefresh)
            .expect("stats");
        assert_eq!(
            stats,
            LedgerStats {
                total: 3,
                completed: 1,
                remaining: 1,
                in_review: 0,
                blocked: 1,
            }
        );
        assert_eq!(
            reader
                .classify(&path, ReadMode::Cached)
                .expect("classify"),
            OrchestrationState::Blocked
        );
        assert!(
            reader
                .current_task(&path, ReadMode::Cached)
                .expect("current")
                .is_none()
        );
    }

    #[cfg(unix)]
    #[test]
    fn non_not_found_errors_propagate() {
        let temp = tempfile::tempdir().expect("tempdir");
        // Reading a directory fails with an error other than NotFound.
        let reader = LedgerReader::default();
        let err = reader
            .classify(temp.path(), ReadMode::ForceRefresh)
            .unwrap_err();
        assert!(err.to_string().contains("read ledger"));
    }
}
