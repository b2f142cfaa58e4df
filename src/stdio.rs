//! Stdio Plumbing (§4.C): three anonymous pipes, ownership handed to the
//! mapped-root uid/gid so a process in a user namespace can use them.
//!
//! Pure setup, no synchronization. On any error every fd created so far is
//! closed -- `OwnedFd`'s `Drop` does that for free once the half-built
//! pipes go out of scope on the `?` early return.

use std::os::fd::OwnedFd;

use nix::unistd::{fchown, pipe, Gid, Uid};

use crate::bootstrap::ExternalStdio;
use crate::error::{Context, Error};

/// The caller/driver-side ends of the three stdio pipes.
pub struct CallerStdio {
    pub stdin: OwnedFd,
    pub stdout: OwnedFd,
    pub stderr: OwnedFd,
}

/// Creates the three stdio pipes and chowns all six fds to `uid`/`gid`.
///
/// Caller gets the read-end of stdin and the write-ends of stdout/stderr;
/// the external (container) side gets the complementary ends.
pub fn initialize_io(uid: Uid, gid: Gid) -> Result<(CallerStdio, ExternalStdio), Error> {
    let (stdin_r, stdin_w) = pipe().context("creating stdin pipe")?;
    let (stdout_r, stdout_w) = pipe().context("creating stdout pipe")?;
    let (stderr_r, stderr_w) = pipe().context("creating stderr pipe")?;

    for fd in [&stdin_r, &stdin_w, &stdout_r, &stdout_w, &stderr_r, &stderr_w] {
        fchown(fd, Some(uid), Some(gid)).context("chowning stdio pipe to mapped root")?;
    }

    Ok((
        CallerStdio {
            stdin: stdin_w,
            stdout: stdout_r,
            stderr: stderr_r,
        },
        ExternalStdio {
            stdin: stdin_r,
            stdout: stdout_w,
            stderr: stderr_w,
        },
    ))
}
