//! Spawning, supervising and killing one command's process tree.

use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::OutputChunk;
use crate::error::SandboxError;
use crate::limits::LimitedBuffer;

/// Exit code reported when a command hits its deadline.
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Exit code reported when a command is cancelled.
pub const CANCELLED_EXIT_CODE: i32 = 130;

const READ_CHUNK: usize = 8 * 1024;
/// How long to keep reading after the shell exits, for output still held by
/// background children.
const LINGER: Duration = Duration::from_millis(200);
const DRAIN: Duration = Duration::from_millis(100);

pub(crate) struct RunOptions<'a> {
    pub timeout: Duration,
    pub grace: Duration,
    pub max_output_bytes: usize,
    pub cpu_seconds: Option<u64>,
    pub max_memory_bytes: u64,
    pub sink: Option<&'a mpsc::UnboundedSender<OutputChunk>>,
    pub cancel: &'a CancellationToken,
}

#[derive(Debug)]
pub(crate) struct ProcessOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    pub timed_out: bool,
    pub cancelled: bool,
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Deadline,
    Cancelled,
}

struct Capture<'a> {
    stdout: LimitedBuffer,
    stderr: LimitedBuffer,
    sink: Option<&'a mpsc::UnboundedSender<OutputChunk>>,
}

impl Capture<'_> {
    /// Keep what fits under the cap and forward exactly that to the sink.
    fn push(&mut self, is_stderr: bool, data: &[u8]) {
        let buffer = if is_stderr {
            &mut self.stderr
        } else {
            &mut self.stdout
        };
        let kept = buffer.push(data);
        if kept.is_empty() {
            return;
        }
        if let Some(sink) = self.sink {
            let chunk = if is_stderr {
                OutputChunk::Stderr(kept.to_vec())
            } else {
                OutputChunk::Stdout(kept.to_vec())
            };
            // The consumer going away must not affect the command.
            let _ = sink.send(chunk);
        }
    }
}

/// Spawn `command` in its own process group and supervise it until it exits,
/// its deadline passes or `cancel` fires. Either of the latter two kills the
/// whole group.
pub(crate) async fn run(
    mut command: Command,
    opts: RunOptions<'_>,
) -> Result<ProcessOutcome, SandboxError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0);

    let cpu_seconds = opts.cpu_seconds;
    let max_memory = opts.max_memory_bytes;
    // SAFETY: the closure only calls setrlimit, which is async-signal-safe.
    unsafe {
        command.pre_exec(move || apply_rlimits(cpu_seconds, max_memory));
    }

    let mut child = command.spawn().map_err(|e| {
        SandboxError::SandboxUnavailable(format!("failed to start sandbox process: {e}"))
    })?;
    // Captured now: `Child::id` returns None once the child has been reaped.
    let pgid = child.id().and_then(|id| i32::try_from(id).ok());
    // `kill_on_drop` only reaches the shell; this reaches the rest of its group
    // when the caller drops the future or an early return leaves it running.
    let mut group = GroupGuard { pgid };

    let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(SandboxError::Internal("process output was not captured".into()));
    };

    let mut capture = Capture {
        stdout: LimitedBuffer::new(opts.max_output_bytes),
        stderr: LimitedBuffer::new(opts.max_output_bytes),
        sink: opts.sink,
    };
    let deadline = Instant::now() + opts.timeout;
    let mut out_buf = vec![0u8; READ_CHUNK];
    let mut err_buf = vec![0u8; READ_CHUNK];
    let mut out_open = true;
    let mut err_open = true;
    let mut status: Option<ExitStatus> = None;
    let mut linger_until: Option<Instant> = None;

    let stop = loop {
        if !out_open && !err_open && status.is_some() {
            break None;
        }
        tokio::select! {
            biased;
            _ = opts.cancel.cancelled() => break Some(Stop::Cancelled),
            _ = tokio::time::sleep_until(deadline) => break Some(Stop::Deadline),
            _ = tokio::time::sleep_until(linger_until.unwrap_or(deadline)), if linger_until.is_some() => {
                break None;
            }
            read = stdout.read(&mut out_buf), if out_open => match read {
                Ok(0) | Err(_) => out_open = false,
                Ok(n) => capture.push(false, &out_buf[..n]),
            },
            read = stderr.read(&mut err_buf), if err_open => match read {
                Ok(0) | Err(_) => err_open = false,
                Ok(n) => capture.push(true, &err_buf[..n]),
            },
            waited = child.wait(), if status.is_none() => match waited {
                Ok(exit) => {
                    status = Some(exit);
                    linger_until = Some(Instant::now() + LINGER);
                }
                Err(e) => {
                    return Err(SandboxError::Internal(format!("waiting for process: {e}")));
                }
            },
        }
    };

    match stop {
        Some(_) => {
            terminate(&mut child, pgid, opts.grace).await;
            group.disarm();
            if out_open {
                drain(&mut stdout, &mut capture, false).await;
            }
            if err_open {
                drain(&mut stderr, &mut capture, true).await;
            }
        }
        // The shell is gone; sweep anything it left running in the group.
        None => group.kill(),
    }

    let exit_code = match stop {
        Some(Stop::Deadline) => TIMEOUT_EXIT_CODE,
        Some(Stop::Cancelled) => CANCELLED_EXIT_CODE,
        None => status.map(exit_code_of).unwrap_or(-1),
    };
    let truncated = capture.stdout.was_truncated() || capture.stderr.was_truncated();
    Ok(ProcessOutcome {
        stdout: capture.stdout.into_bytes(),
        stderr: capture.stderr.into_bytes(),
        exit_code,
        timed_out: stop == Some(Stop::Deadline),
        cancelled: stop == Some(Stop::Cancelled),
        truncated,
    })
}

/// SIGKILLs a process group when dropped while still armed.
struct GroupGuard {
    pgid: Option<i32>,
}

impl GroupGuard {
    fn kill(&mut self) {
        kill_group(self.pgid.take());
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if self.pgid.is_some() {
            tracing::debug!(pgid = self.pgid, "command abandoned, killing its process group");
            self.kill();
        }
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

async fn drain<R: AsyncRead + Unpin>(reader: &mut R, capture: &mut Capture<'_>, is_stderr: bool) {
    let mut buf = vec![0u8; READ_CHUNK];
    let _ = tokio::time::timeout(DRAIN, async {
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => capture.push(is_stderr, &buf[..n]),
            }
        }
    })
    .await;
}

/// SIGTERM the group, give it `grace` to exit, then SIGKILL whatever is left.
async fn terminate(child: &mut Child, pgid: Option<i32>, grace: Duration) {
    signal_group(pgid, libc::SIGTERM);
    let status = match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            tracing::warn!("wait after SIGTERM failed: {}", e);
            None
        }
        Err(_) => {
            tracing::debug!(pgid, "process group ignored SIGTERM, sending SIGKILL");
            None
        }
    };
    kill_group(pgid);
    if status.is_none() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

fn kill_group(pgid: Option<i32>) {
    signal_group(pgid, libc::SIGKILL);
}

fn signal_group(pgid: Option<i32>, signal: libc::c_int) {
    let Some(pgid) = pgid.filter(|p| *p > 0) else {
        return;
    };
    // SAFETY: kill(2) with a negative pid signals the process group and
    // touches no memory.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc == -1 {
        let errno = std::io::Error::last_os_error();
        if errno.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(pgid, signal, "signalling process group failed: {}", errno);
        }
    }
}

fn apply_rlimits(cpu_seconds: Option<u64>, max_memory_bytes: u64) -> std::io::Result<()> {
    if let Some(seconds) = cpu_seconds {
        set_rlimit(libc::RLIMIT_CPU, seconds)?;
    }
    if max_memory_bytes > 0 {
        set_rlimit(libc::RLIMIT_AS, max_memory_bytes)?;
    }
    Ok(())
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type Resource = libc::__rlimit_resource_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type Resource = libc::c_int;

fn set_rlimit(resource: Resource, value: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };
    // SAFETY: `limit` is a valid, initialised rlimit for the duration of the call.
    if unsafe { libc::setrlimit(resource, &limit) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}
