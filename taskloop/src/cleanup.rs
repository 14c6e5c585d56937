//! Process-wide cleanup registry and termination-signal wiring.
//!
//! Callbacks run in reverse registration order, at most once per drain.
//! A drain works on a snapshot taken when it starts: callbacks registered
//! while it runs wait for the next drain, and unregistering a pending callback
//! from inside another one does not stop it from running.
//!
//! [`SignalHandlers`] routes SIGINT/SIGTERM/SIGHUP to a registry for as long
//! as the guard lives. The OS-level handler is installed once per process and
//! exits with `128 + signal` after the drain.

use std::any::Any;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::exit_codes;

pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

pub type CleanupFn = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Identifies a registered callback for [`CleanupRegistry::unregister`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CleanupHandle(u64);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CleanupError {
    #[error("{} cleanup callback(s) failed: {}", .errors.len(), .errors.join("; "))]
    Failed { errors: Vec<String> },
    #[error("cleanup timed out after {}ms", .timeout.as_millis())]
    TimedOut { timeout: Duration },
}

enum DrainState {
    Idle,
    Running,
    Finished(Result<(), CleanupError>),
}

struct Inner {
    next_id: u64,
    entries: Vec<(CleanupHandle, CleanupFn)>,
    drain: DrainState,
    timeout: Duration,
}

pub struct CleanupRegistry {
    inner: Mutex<Inner>,
    done: Condvar,
}

impl Default for CleanupRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CLEANUP_TIMEOUT)
    }
}

impl CleanupRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 0,
                entries: Vec::new(),
                drain: DrainState::Idle,
                timeout,
            }),
            done: Condvar::new(),
        }
    }

    /// The shared registry used by the CLI.
    pub fn global() -> Arc<CleanupRegistry> {
        static GLOBAL: OnceLock<Arc<CleanupRegistry>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(CleanupRegistry::default()))
            .clone()
    }

    /// Applies to drains started after the call.
    pub fn set_timeout(&self, timeout: Duration) {
        self.lock().timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.lock().timeout
    }

    pub fn register<F>(&self, callback: F) -> CleanupHandle
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let mut inner = self.lock();
        let handle = CleanupHandle(inner.next_id);
        inner.next_id += 1;
        inner.entries.push((handle, Box::new(callback)));
        debug!(id = handle.0, pending = inner.entries.len(), "cleanup registered");
        handle
    }

    /// Register a callback that is unregistered again when the guard drops.
    pub fn register_scoped<F>(&self, callback: F) -> ScopedCleanup<'_>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        ScopedCleanup {
            registry: self,
            handle: self.register(callback),
        }
    }

    /// Remove a callback that has not run yet. Returns whether it was pending.
    pub fn unregister(&self, handle: CleanupHandle) -> bool {
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|(candidate, _)| *candidate != handle);
        before != inner.entries.len()
    }

    pub fn pending(&self) -> usize {
        self.lock().entries.len()
    }

    /// Run every registered callback once, newest first.
    ///
    /// Later and concurrent calls wait for the first drain and return its
    /// outcome. Failing or panicking callbacks do not stop the rest; their
    /// errors are reported together. Gives up after the registry timeout.
    pub fn drain(&self) -> Result<(), CleanupError> {
        let mut inner = self.lock();
        while matches!(inner.drain, DrainState::Running) {
            inner = self
                .done
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if let DrainState::Finished(outcome) = &inner.drain {
            return outcome.clone();
        }
        inner.drain = DrainState::Running;
        let entries = mem::take(&mut inner.entries);
        let timeout = inner.timeout;
        drop(inner);

        info!(count = entries.len(), "draining cleanup callbacks");
        let outcome = run_callbacks(entries, timeout);
        if let Err(err) = &outcome {
            warn!(err = %err, "cleanup finished with errors");
        }

        let mut inner = self.lock();
        inner.drain = DrainState::Finished(outcome.clone());
        self.done.notify_all();
        outcome
    }

    /// Re-arm after a drain so the next run can drain again.
    ///
    /// Callbacks registered after the previous drain started stay pending.
    pub fn reset(&self) {
        let mut inner = self.lock();
        if !matches!(inner.drain, DrainState::Running) {
            inner.drain = DrainState::Idle;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keeps a callback registered for the guard's lifetime.
#[must_use = "the callback is unregistered when the guard is dropped"]
pub struct ScopedCleanup<'a> {
    registry: &'a CleanupRegistry,
    handle: CleanupHandle,
}

impl Drop for ScopedCleanup<'_> {
    fn drop(&mut self) {
        if self.registry.unregister(self.handle) {
            debug!(id = self.handle.0, "cleanup unregistered");
        }
    }
}

fn run_callbacks(
    entries: Vec<(CleanupHandle, CleanupFn)>,
    timeout: Duration,
) -> Result<(), CleanupError> {
    if entries.is_empty() {
        return Ok(());
    }
    let (tx, rx) = mpsc::channel();
    // Detached: a callback that hangs past the timeout keeps the worker alive.
    thread::spawn(move || {
        let mut errors = Vec::new();
        for (handle, callback) in entries.into_iter().rev() {
            match panic::catch_unwind(AssertUnwindSafe(callback)) {
                Ok(Ok(())) => debug!(id = handle.0, "cleanup callback ran"),
                Ok(Err(err)) => errors.push(format!("{err:#}")),
                Err(payload) => {
                    errors.push(format!("callback panicked: {}", panic_message(&*payload)));
                }
            }
        }
        let _ = tx.send(errors);
    });

    match rx.recv_timeout(timeout) {
        Ok(errors) if errors.is_empty() => Ok(()),
        Ok(errors) => Err(CleanupError::Failed { errors }),
        Err(_) => Err(CleanupError::TimedOut { timeout }),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

static ACTIVE: Mutex<Option<(u64, Arc<CleanupRegistry>)>> = Mutex::new(None);
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(0);
static OS_HANDLER: OnceLock<Result<(), String>> = OnceLock::new();

/// Routes termination signals to a registry while alive.
///
/// On a signal the registry is drained, errors are logged, and the process
/// exits with `128 + signal`. Dropping the guard detaches the registry; a
/// signal arriving with no guard alive exits without cleanup.
#[must_use = "signal handlers detach when the guard is dropped"]
pub struct SignalHandlers {
    token: u64,
}

impl SignalHandlers {
    pub fn install(registry: Arc<CleanupRegistry>) -> Result<Self> {
        OS_HANDLER
            .get_or_init(install_os_handler)
            .clone()
            .map_err(|err| anyhow!("install signal handlers: {err}"))?;

        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        *active() = Some((token, registry));
        debug!(token, "signal handlers attached");
        Ok(Self { token })
    }
}

impl Drop for SignalHandlers {
    fn drop(&mut self) {
        let mut active = active();
        if active.as_ref().is_some_and(|(token, _)| *token == self.token) {
            *active = None;
            debug!(token = self.token, "signal handlers detached");
        }
    }
}

fn active() -> MutexGuard<'static, Option<(u64, Arc<CleanupRegistry>)>> {
    ACTIVE.lock().unwrap_or_else(PoisonError::into_inner)
}

fn active_registry() -> Option<Arc<CleanupRegistry>> {
    active().as_ref().map(|(_, registry)| registry.clone())
}

#[cfg(unix)]
fn install_os_handler() -> Result<(), String> {
    use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP]).map_err(|err| err.to_string())?;
    thread::Builder::new()
        .name("taskloop-signals".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                on_signal(signal);
            }
        })
        .map_err(|err| err.to_string())?;
    Ok(())
}

// Every console event reports as SIGINT here.
#[cfg(not(unix))]
fn install_os_handler() -> Result<(), String> {
    ctrlc::set_handler(|| {
        on_signal(exit_codes::SIGINT);
    })
    .map_err(|err| err.to_string())
}

fn on_signal(signal: i32) -> ! {
    warn!(signal, "termination signal received, running cleanup");
    if let Some(registry) = active_registry()
        && let Err(err) = registry.drain()
    {
        error!(err = %err, "cleanup after signal failed");
    }
    std::process::exit(exit_codes::from_signal(signal));
}
