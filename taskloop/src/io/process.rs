//! Helpers for running child processes with timeouts and bounded output.
//!
//! On unix every child leads its own process group. A timed-out child gets
//! SIGTERM on the whole group, then SIGKILL once the grace period lapses.
//! Leftover group members are killed after the leader exits, so the pipe
//! readers always finish and no descendant outlives the call.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Time limits for a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    pub timeout: Duration,
    /// Wait between the graceful and the forced termination signal.
    pub kill_grace: Duration,
    pub output_limit_bytes: usize,
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn exit_code(&self) -> i32 {
        exit_code(&self.status)
    }

    pub fn stdout_lossy(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        if self.stdout_truncated > 0 {
            text.push_str(&format!("\n[stdout truncated {} bytes]\n", self.stdout_truncated));
        }
        text
    }

    pub fn stderr_lossy(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stderr).into_owned();
        if self.stderr_truncated > 0 {
            text.push_str(&format!("\n[stderr truncated {} bytes]\n", self.stderr_truncated));
        }
        text
    }
}

/// Exit code of a finished process; signals map to `128 + signal`.
pub fn exit_code(status: &ExitStatus) -> i32 {
    status.code().unwrap_or_else(|| signal_exit_code(status))
}

#[cfg(unix)]
fn signal_exit_code(status: &ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map_or(1, crate::exit_codes::from_signal)
}

#[cfg(not(unix))]
fn signal_exit_code(_status: &ExitStatus) -> i32 {
    1
}

/// Build a `sh -c <command>` invocation.
pub fn shell_command(command: &str) -> Command {
    #[cfg(unix)]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
    #[cfg(not(unix))]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Stdin is closed. Output is read concurrently while the child runs.
/// `output_limit_bytes` bounds the amount of stdout/stderr stored in memory
/// (bytes beyond this are discarded while still draining the pipe).
#[instrument(
    skip_all,
    fields(
        timeout_ms = limits.timeout.as_millis() as u64,
        output_limit_bytes = limits.output_limit_bytes
    )
)]
pub fn run_command_with_timeout(mut cmd: Command, limits: &RunLimits) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    own_process_group(&mut cmd);

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = limits.output_limit_bytes;
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, limit));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

    let mut timed_out = false;
    let status = match child
        .wait_timeout(limits.timeout)
        .context("wait for command")?
    {
        Some(status) => {
            kill_leftovers(&child);
            status
        }
        None => {
            warn!(
                timeout_ms = limits.timeout.as_millis() as u64,
                "command timed out, terminating process group"
            );
            timed_out = true;
            terminate(&mut child, limits.kill_grace)?
        }
    };
    let elapsed = started.elapsed();

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(
        exit_code = ?status.code(),
        timed_out,
        elapsed_ms = elapsed.as_millis() as u64,
        "command finished"
    );
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        elapsed,
    })
}

#[cfg(unix)]
fn own_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_cmd: &mut Command) {}

/// SIGTERM the group, wait `grace`, then SIGKILL whatever is left.
#[cfg(unix)]
fn terminate(child: &mut Child, grace: Duration) -> Result<ExitStatus> {
    use nix::sys::signal::Signal;

    signal_group(child, Signal::SIGTERM);
    let status = match child
        .wait_timeout(grace)
        .context("wait for command after SIGTERM")?
    {
        Some(status) => status,
        None => {
            debug!("command ignored SIGTERM, sending SIGKILL");
            signal_group(child, Signal::SIGKILL);
            child.wait().context("wait command after kill")?
        }
    };
    // Descendants that ignored SIGTERM may still hold the pipes.
    signal_group(child, Signal::SIGKILL);
    Ok(status)
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, _grace: Duration) -> Result<ExitStatus> {
    child.kill().context("kill command")?;
    child.wait().context("wait command after kill")
}

#[cfg(unix)]
fn kill_leftovers(child: &Child) {
    signal_group(child, nix::sys::signal::Signal::SIGKILL);
}

#[cfg(not(unix))]
fn kill_leftovers(_child: &Child) {}

#[cfg(unix)]
fn signal_group(child: &Child, signal: nix::sys::signal::Signal) {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Ok(pgid) = i32::try_from(child.id()) else {
        return;
    };
    match killpg(Pid::from_raw(pgid), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!(pgid, ?signal, err = %err, "failed to signal process group"),
    }
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
