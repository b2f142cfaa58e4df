//! Bootstrap Launcher (§4.B): spawns the opaque helper binary that performs
//! the actual `clone`/`unshare`/`setns` dance, and tracks it until it exits.
//!
//! The helper is an external collaborator: this module only knows how to
//! start it with the right fds inherited, stream the bootstrap byte stream
//! into it, and reap it. What the bytes mean is the helper's business.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::error::{Context, Error};

/// fd slot the helper reads its sync socket from, by convention between this
/// crate and the helper binary.
pub const HELPER_SYNC_FD: RawFd = 3;
/// fd slot carrying the held-open container-root directory (InitDriver only).
pub const HELPER_ROOT_FD: RawFd = 4;

pub struct ExternalStdio {
    pub stdin: OwnedFd,
    pub stdout: OwnedFd,
    pub stderr: OwnedFd,
}

pub struct HelperSpawnOptions<'a> {
    pub helper_path: &'a Path,
    pub argv: &'a [String],
    pub envp: &'a [(String, String)],
    pub stdio: ExternalStdio,
    pub sync_child_end: OwnedFd,
    /// Root-dir fd, held open only for InitDriver; dropped locally after spawn.
    pub root_dir: Option<OwnedFd>,
}

/// A spawned, not-yet-reaped helper process.
pub struct HelperProcess {
    child: Child,
}

impl HelperProcess {
    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    /// Waits for the helper to exit, reaping it. This is distinct from
    /// waiting on the *tracked* grandchild -- the helper is a separate,
    /// short-lived process (§4.B step 4, §4.F step 7).
    pub fn wait(mut self) -> Result<ExitStatus, Error> {
        self.child.wait().context("waiting for bootstrap helper")
    }

    /// Kills and reaps the helper; used on failure paths that occur before
    /// it has exited on its own.
    pub fn kill_and_reap(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Spawns the bootstrap helper with the sync socket (and, for `InitDriver`,
/// the root-dir fd) dup'd into the well-known fd slots it expects, then
/// closes this process's copies of the fds that were handed off (§4.B
/// steps 1-2).
pub fn spawn_helper(opts: HelperSpawnOptions) -> Result<HelperProcess, Error> {
    let HelperSpawnOptions {
        helper_path,
        argv,
        envp,
        stdio,
        sync_child_end,
        root_dir,
    } = opts;

    let mut cmd = Command::new(helper_path);
    cmd.args(argv);
    cmd.env_clear();
    for (k, v) in envp {
        cmd.env(k, v);
    }
    cmd.stdin(Stdio::from(stdio.stdin));
    cmd.stdout(Stdio::from(stdio.stdout));
    cmd.stderr(Stdio::from(stdio.stderr));

    let sync_fd = sync_child_end.as_raw_fd();
    let root_fd = root_dir.as_ref().map(|f| f.as_raw_fd());

    // SAFETY: the closure only calls async-signal-safe libc functions
    // (dup2) between fork and exec, as required by `pre_exec`.
    unsafe {
        cmd.pre_exec(move || {
            dup_onto(sync_fd, HELPER_SYNC_FD)?;
            if let Some(root_fd) = root_fd {
                dup_onto(root_fd, HELPER_ROOT_FD)?;
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|e| Error::Spawn(Box::new(e)))?;

    // The fds were dup'd into the child; this process's originals (and the
    // ends owned by the parent-side wrapper types) are dropped here so the
    // parent never pins open the socket the child needs to see EOF on.
    drop(sync_child_end);
    drop(root_dir);

    Ok(HelperProcess { child })
}

fn dup_onto(fd: RawFd, target: RawFd) -> std::io::Result<()> {
    if fd != target {
        let ret = unsafe { libc::dup2(fd, target) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error());
        }
    } else {
        // Clear close-on-exec so the slot survives exec when it already
        // happens to sit at the target fd number.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags >= 0 {
            unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) };
        }
    }
    Ok(())
}

/// Interprets a helper's exit as success/failure per §4.B's failure
/// conditions: non-zero exit or signal death both surface as
/// [`Error::HelperExit`].
pub fn check_helper_exit(status: ExitStatus) -> Result<(), Error> {
    if status.success() {
        return Ok(());
    }
    match status.code() {
        Some(code) => Err(Error::HelperExit(format!("exited with status {code}"))),
        None => Err(Error::HelperExit(format!(
            "terminated by signal: {status:?}"
        ))),
    }
}

/// Sends `sig` to `pid`, reaps it as needed. Used by `Terminate`.
pub fn terminate(pid: Pid) -> Result<(), Error> {
    kill(pid, Signal::SIGKILL).context("sending SIGKILL to container process")?;
    reap(pid)
}

pub fn reap(pid: Pid) -> Result<WaitStatus, Error> {
    waitpid(pid, Some(WaitPidFlag::__WALL)).context("reaping container process")
}
