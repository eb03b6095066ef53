//! Child-process execution of a [`ProgramImage`].
//!
//! Every launch forks a fresh child; the child (never the caller) execs the
//! image. The call waits for the child to exit, so a process never outlives
//! the `launch` that started it: the child runs in its own process group,
//! and the group is killed when the child exits, times out or the call is
//! cancelled.

use std::ffi::{OsStr, OsString};
use std::io;
use std::os::fd::RawFd;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::image::ProgramImage;

/// `argv[0]` given to the child unless overridden.
pub const DEFAULT_PROGRAM_NAME: &str = "converter";

/// Longest stderr tail kept in [`ExitOutcome::Failed`].
const STDERR_TAIL_BYTES: usize = 2048;

/// How long a failed child's stderr may take to reach EOF once its group
/// is dead.
const STDERR_GRACE: Duration = Duration::from_secs(1);

const SPAWN_RETRIES: u32 = 5;

/// How a launch ended.
///
/// `Success` only says the program exited with status 0; it says nothing
/// about the files it was supposed to produce.
#[derive(Debug)]
pub enum ExitOutcome {
    /// Exit status 0.
    Success,
    /// Non-zero exit, or killed by a signal (`code` is `None` then).
    Failed {
        code: Option<i32>,
        signal: Option<i32>,
        stderr: String,
    },
    /// The image could not be executed or waited on.
    LaunchFailed(io::Error),
    /// The child ran past the launcher's timeout and was killed.
    TimedOut(Duration),
}

impl ExitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitOutcome::Success)
    }
}

/// Runs one shared, read-only [`ProgramImage`] in isolated child processes.
///
/// Cheap to share behind an `Arc`; concurrent `launch` calls do not
/// coordinate with each other.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    image: Arc<dyn ProgramImage>,
    program_name: OsString,
    timeout: Option<Duration>,
    envs: Vec<(OsString, OsString)>,
}

impl ProcessLauncher {
    pub fn new(image: Arc<dyn ProgramImage>) -> Self {
        Self {
            image,
            program_name: OsString::from(DEFAULT_PROGRAM_NAME),
            timeout: None,
            envs: Vec::new(),
        }
    }

    /// Descriptive `argv[0]` for the child.
    pub fn program_name(mut self, name: impl Into<OsString>) -> Self {
        self.program_name = name.into();
        self
    }

    /// Kill the child if it runs longer than `limit`.
    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// Extra environment variable for every child.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn image(&self) -> &Arc<dyn ProgramImage> {
        &self.image
    }

    /// Run the image with `args` (after `argv[0]`) and wait for it to exit.
    ///
    /// The child leads its own process group. Whatever it forked is killed
    /// with it once it exits, times out or the call is dropped.
    pub async fn launch<I, S>(&self, args: I) -> ExitOutcome
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let exec_path = self.image.exec_path();
        let mut cmd = Command::new(&exec_path);
        cmd.arg0(&self.program_name)
            .args(args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        if let Some(fd) = self.image.inherited_fd() {
            // SAFETY: runs in the forked child before exec. `fcntl` is
            // async-signal-safe and the closure does not allocate.
            unsafe {
                cmd.pre_exec(move || keep_open_across_exec(fd));
            }
        }

        let mut child = match spawn_with_retry(|| cmd.spawn()).await {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to launch {}: {}", exec_path.display(), e);
                return ExitOutcome::LaunchFailed(e);
            }
        };
        debug!(
            "Launched {:?} (pid {:?})",
            self.program_name,
            child.id()
        );

        let mut group = ProcessGroup::new(&mut child);

        let waited = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(waited) => waited,
                Err(_) => {
                    group.kill();
                    warn!(
                        "{:?} exceeded {}ms, killed",
                        self.program_name,
                        limit.as_millis()
                    );
                    return ExitOutcome::TimedOut(limit);
                }
            },
            None => child.wait().await,
        };

        // Helpers left running by the converter must not outlive the call.
        group.kill();

        let status = match waited {
            Ok(status) => status,
            Err(e) => return ExitOutcome::LaunchFailed(e),
        };

        if status.success() {
            return ExitOutcome::Success;
        }

        let stderr = stderr_tail(&group.collect_stderr().await);
        debug!(
            "{:?} failed with {}: {}",
            self.program_name, status, stderr
        );
        ExitOutcome::Failed {
            code: status.code(),
            signal: status.signal(),
            stderr,
        }
    }
}

/// The child's process group and the task draining its stderr.
///
/// Dropping it kills the whole group and stops the drain.
struct ProcessGroup {
    pgid: Option<Pid>,
    stderr: Option<JoinHandle<Vec<u8>>>,
}

impl ProcessGroup {
    fn new(child: &mut Child) -> Self {
        Self {
            pgid: child.id().map(|pid| Pid::from_raw(pid as i32)),
            stderr: child
                .stderr
                .take()
                .map(|pipe| tokio::spawn(read_tail(pipe, STDERR_TAIL_BYTES))),
        }
    }

    fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!("Failed to kill process group {}: {}", pgid, e),
        }
    }

    /// Stderr tail, once every writer is gone. Empty if that takes too long.
    async fn collect_stderr(&mut self) -> Vec<u8> {
        let Some(mut drain) = self.stderr.take() else {
            return Vec::new();
        };
        match tokio::time::timeout(STDERR_GRACE, &mut drain).await {
            Ok(Ok(tail)) => tail,
            _ => {
                drain.abort();
                Vec::new()
            }
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
        if let Some(drain) = self.stderr.take() {
            drain.abort();
        }
    }
}

/// Read `reader` to EOF, keeping at most the last `limit` bytes.
async fn read_tail<R>(mut reader: R, limit: usize) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut tail = Vec::with_capacity(limit);
    let mut buf = [0u8; 8192];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return tail,
            Ok(n) => n,
        };
        tail.extend_from_slice(&buf[..n]);
        if tail.len() > limit {
            tail.drain(..tail.len() - limit);
        }
    }
}

/// Whether a failed spawn is worth another attempt.
///
/// A fork taken by another thread while some image was still writable holds
/// that write descriptor until its own exec, and the kernel refuses to exec
/// a file with writers (`ETXTBSY`). Nothing else is retried.
fn is_retryable_spawn_error(e: &io::Error) -> bool {
    e.raw_os_error() == Some(Errno::ETXTBSY as i32)
}

async fn spawn_with_retry<T, F>(mut spawn: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    let mut attempt = 0;
    loop {
        match spawn() {
            Err(e) if is_retryable_spawn_error(&e) && attempt < SPAWN_RETRIES => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(5 * u64::from(attempt))).await;
            }
            result => return result,
        }
    }
}

/// Clear `FD_CLOEXEC` so the image descriptor is still open for the
/// interpreter when the payload is a `#!` script.
fn keep_open_across_exec(fd: RawFd) -> io::Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))
        .map(drop)
        .map_err(io::Error::from)
}

fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}
