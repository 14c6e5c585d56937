//! Single-instance lock file.
//!
//! The lock file's existence is the only signal that another loop owns the
//! project. Acquisition writes the full record to a temp sibling and hard-links
//! it onto the lock path, which fails atomically when the path already exists,
//! so readers never observe a partially written lock.
//!
//! Format:
//!
//! ```text
//! Started: 2026-01-31 09:14:02
//! PID: 4242
//! Command: run
//! State: WORK_LEFT
//! Iteration: 3
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{Local, NaiveDateTime};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum LockError {
    #[error("{}", conflict_message(.path, .pid, .elapsed))]
    Conflict {
        path: PathBuf,
        pid: Option<u32>,
        elapsed: Option<Duration>,
    },
}

fn conflict_message(path: &Path, pid: &Option<u32>, elapsed: &Option<Duration>) -> String {
    let owner = pid.map_or_else(|| "unknown pid".to_string(), |pid| format!("pid {pid}"));
    let held = elapsed.map_or_else(
        || "unknown duration".to_string(),
        |elapsed| format!("{}s", elapsed.as_secs()),
    );
    format!(
        "another loop holds {} ({owner}, held for {held}); stop it or re-run with --force",
        path.display()
    )
}

/// Free-form owner metadata published in the lock file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockMetadata {
    pub state: Option<String>,
    pub iteration: Option<u32>,
}

/// Best-effort view of an existing lock file. Unparsable fields are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockInfo {
    pub pid: Option<u32>,
    pub started: Option<NaiveDateTime>,
    pub elapsed: Option<Duration>,
    pub command: Option<String>,
    pub metadata: LockMetadata,
    /// Owner pid is no longer running. Informational only.
    pub stale: Option<bool>,
}

/// Create the lock file or fail with [`LockError::Conflict`].
pub fn acquire(path: &Path, command: &str, metadata: &LockMetadata) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create lock dir {}", parent.display()))?;
    }
    let record = render(
        std::process::id(),
        &Local::now().format(TIMESTAMP_FORMAT).to_string(),
        command,
        metadata,
    );
    let tmp_path = temp_sibling(path);
    fs::write(&tmp_path, record)
        .with_context(|| format!("write temp lock {}", tmp_path.display()))?;

    let linked = fs::hard_link(&tmp_path, path);
    if let Err(err) = fs::remove_file(&tmp_path) {
        warn!(path = %tmp_path.display(), err = %err, "failed to remove temp lock");
    }
    match linked {
        Ok(()) => {
            info!(path = %path.display(), pid = std::process::id(), "lock acquired");
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            let existing = info(path).unwrap_or_default();
            debug!(path = %path.display(), owner = ?existing.pid, "lock conflict");
            Err(LockError::Conflict {
                path: path.to_path_buf(),
                pid: existing.pid,
                elapsed: existing.elapsed,
            }
            .into())
        }
        Err(err) => Err(err).with_context(|| format!("create lock {}", path.display())),
    }
}

// Serializes `update` against `release` so a release from the signal thread
// cannot be undone by an in-flight rewrite.
static REWRITE: Mutex<()> = Mutex::new(());

fn rewrite_lock() -> MutexGuard<'static, ()> {
    REWRITE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Remove the lock file. Succeeds when it is already gone.
pub fn release(path: &Path) -> Result<()> {
    let _rewrite = rewrite_lock();
    match fs::remove_file(path) {
        Ok(()) => {
            info!(path = %path.display(), "lock released");
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove lock {}", path.display())),
    }
}

/// Existence check for status output. Never use it to decide acquisition.
pub fn is_locked(path: &Path) -> bool {
    path.exists()
}

/// Parse the lock file. `None` when it does not exist or cannot be read.
pub fn info(path: &Path) -> Option<LockInfo> {
    let contents = fs::read_to_string(path).ok()?;
    Some(parse(&contents))
}

/// Rewrite the metadata of a lock owned by this process (temp + rename).
///
/// Fails once the lock has been released.
pub fn update(path: &Path, metadata: &LockMetadata) -> Result<()> {
    let _rewrite = rewrite_lock();
    let current = info(path).ok_or_else(|| anyhow!("lock {} is missing", path.display()))?;
    let pid = std::process::id();
    if current.pid != Some(pid) {
        return Err(anyhow!(
            "lock {} is owned by {:?}, not pid {pid}",
            path.display(),
            current.pid
        ));
    }
    let started = current
        .started
        .unwrap_or_else(|| Local::now().naive_local())
        .format(TIMESTAMP_FORMAT)
        .to_string();
    let command = current.command.unwrap_or_default();
    let tmp_path = temp_sibling(path);
    fs::write(&tmp_path, render(pid, &started, &command, metadata))
        .with_context(|| format!("write temp lock {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace lock {}", path.display()))?;
    Ok(())
}

/// Releases the lock when dropped.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    released: bool,
}

impl LockGuard {
    pub fn acquire(path: &Path, command: &str, metadata: &LockMetadata) -> Result<Self> {
        acquire(path, command, metadata)?;
        Ok(Self {
            path: path.to_path_buf(),
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        release(&self.path)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = release(&self.path) {
            warn!(path = %self.path.display(), err = %err, "failed to release lock on drop");
        }
    }
}

fn render(pid: u32, started: &str, command: &str, metadata: &LockMetadata) -> String {
    let mut buf = format!("Started: {started}\nPID: {pid}\n");
    if !command.is_empty() {
        buf.push_str(&format!("Command: {command}\n"));
    }
    if let Some(state) = &metadata.state {
        buf.push_str(&format!("State: {state}\n"));
    }
    if let Some(iteration) = metadata.iteration {
        buf.push_str(&format!("Iteration: {iteration}\n"));
    }
    buf
}

fn parse(contents: &str) -> LockInfo {
    let mut info = LockInfo::default();
    for line in contents.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "started" => {
                info.started = NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT).ok();
            }
            "pid" => info.pid = value.parse().ok(),
            "command" => info.command = Some(value.to_string()).filter(|v| !v.is_empty()),
            "state" => info.metadata.state = Some(value.to_string()).filter(|v| !v.is_empty()),
            "iteration" => info.metadata.iteration = value.parse().ok(),
            _ => {}
        }
    }
    info.elapsed = info
        .started
        .and_then(|started| (Local::now().naive_local() - started).to_std().ok());
    info.stale = info.pid.and_then(pid_alive).map(|alive| !alive);
    info
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "lock".to_string());
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.{nanos}.tmp", std::process::id()))
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> Option<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).ok()?;
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => Some(true),
        Err(_) => Some(false),
    }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> Option<bool> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_path(temp: &tempfile::TempDir) -> PathBuf {
        temp.path().join(".taskloop").join("loop.lock")
    }

    #[test]
    fn acquire_then_release_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = lock_path(&temp);

        acquire(&path, "run", &LockMetadata::default()).expect("acquire");
        assert!(is_locked(&path));
        release(&path).expect("release");
        assert!(!path.exists());

        acquire(&path, "run", &LockMetadata::default()).expect("reacquire");
        release(&path).expect("release again");
    }

    #[test]
    fn second_acquire_reports_owner_pid() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = lock_path(&temp);

        acquire(&path, "run", &LockMetadata::default()).expect("acquire");
        let err = acquire(&path, "run", &LockMetadata::default()).unwrap_err();

        let conflict = err.downcast_ref::<LockError>().expect("lock error");
        let LockError::Conflict { pid, .. } = conflict;
        assert_eq!(*pid, Some(std::process::id()));
        assert!(
            err.to_string()
                .contains(&std::process::id().to_string())
        );
    }

    #[test]
    fn release_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = lock_path(&temp);
        release(&path).expect("release missing");
        acquire(&path, "run", &LockMetadata::default()).expect("acquire");
        release(&path).expect("release");
        release(&path).expect("release twice");
    }

    #[test]
    fn acquire_leaves_no_temp_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = lock_path(&temp);
        acquire(&path, "run", &LockMetadata::default()).expect("acquire");
        let _ = acquire(&path, "run", &LockMetadata::default());

        let names: Vec<String> = fs::read_dir(path.parent().expect("parent"))
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["loop.lock".to_string()]);
    }

    #[test]
    fn info_parses_written_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = lock_path(&temp);
        let metadata = LockMetadata {
            state: Some("WORK_LEFT".to_string()),
            iteration: Some(2),
        };
        acquire(&path, "run", &metadata).expect("acquire");

        let info = info(&path).expect("info");
        assert_eq!(info.pid, Some(std::process::id()));
        assert_eq!(info.command.as_deref(), Some("run"));
        assert_eq!(info.metadata, metadata);
        assert!(info.started.is_some());
        assert!(info.elapsed.is_some());
        #[cfg(unix)]
        assert_eq!(info.stale, Some(false));
    }

    #[test]
    fn malformed_lock_degrades_to_empty_fields() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = lock_path(&temp);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, "Started: yesterday-ish\nPID: not-a-number\nnoise\n").expect("write");

        let info = info(&path).expect("info");
        assert_eq!(info.pid, None);
        assert_eq!(info.started, None);
        assert_eq!(info.elapsed, None);

        let err = acquire(&path, "run", &LockMetadata::default()).unwrap_err();
        assert!(err.to_string().contains("unknown pid"));
    }

    #[test]
    fn info_is_none_without_lock() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(info(&lock_path(&temp)).is_none());
        assert!(!is_locked(&lock_path(&temp)));
    }

    #[test]
    fn update_rewrites_metadata_for_owner() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = lock_path(&temp);
        acquire(&path, "run", &LockMetadata::default()).expect("acquire");
        let before = info(&path).expect("info before");

        let metadata = LockMetadata {
            state: Some("IN_REVIEW".to_string()),
            iteration: Some(5),
        };
        update(&path, &metadata).expect("update");

        let after = info(&path).expect("info after");
        assert_eq!(after.metadata, metadata);
        assert_eq!(after.started, before.started);
        assert_eq!(after.command.as_deref(), Some("run"));
    }

    #[test]
    fn concurrent_release_is_never_undone_by_update() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::thread;

        let temp = tempfile::tempdir().expect("tempdir");
        let path = lock_path(&temp);
        acquire(&path, "run", &LockMetadata::default()).expect("acquire");

        let released = Arc::new(AtomicBool::new(false));
        let writer = {
            let path = path.clone();
            let released = released.clone();
            thread::spawn(move || {
                let mut iteration = 0;
                while !released.load(Ordering::SeqCst) {
                    iteration += 1;
                    let metadata = LockMetadata {
                        state: Some("WORK_LEFT".to_string()),
                        iteration: Some(iteration),
                    };
                    let _ = update(&path, &metadata);
                }
                update(&path, &LockMetadata::default())
            })
        };

        thread::sleep(Duration::from_millis(20));
        release(&path).expect("release");
        released.store(true, Ordering::SeqCst);

        let last = writer.join().expect("join");
        assert!(last.unwrap_err().to_string().contains("missing"));
        assert!(!path.exists());
    }

    #[test]
    fn update_refuses_foreign_lock() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = lock_path(&temp);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, "Started: 2020-01-01 00:00:00\nPID: 1\n").expect("write");

        let err = update(&path, &LockMetadata::default()).unwrap_err();
        assert!(err.to_string().contains("owned by"));
    }

    #[test]
    fn guard_releases_on_drop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = lock_path(&temp);
        {
            let guard = LockGuard::acquire(&path, "run", &LockMetadata::default()).expect("guard");
            assert_eq!(guard.path(), path.as_path());
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn exited_owner_is_reported_stale() {
        let mut child = std::process::Command::new("true").spawn().expect("spawn");
        let pid = child.id();
        child.wait().expect("wait");

        let temp = tempfile::tempdir().expect("tempdir");
        let path = lock_path(&temp);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, format!("Started: 2020-01-01 00:00:00\nPID: {pid}\n")).expect("write");

        let info = info(&path).expect("info");
        assert_eq!(info.stale, Some(true));
        assert!(info.elapsed.expect("elapsed") > Duration::from_secs(60));
    }
}
