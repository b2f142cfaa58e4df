//! External FD Snapshot (§4.D): records what fds 0/1/2 pointed to before the
//! workload had a chance to `dup2` over them, so checkpoint/restore tooling
//! can re-identify them later.

use nix::unistd::Pid;

use crate::error::Error;

/// Reads `/proc/<pid>/fd/{0,1,2}` as symlinks and returns their targets.
///
/// Readlink failure is fatal (§4.D). A target that isn't actually a symlink
/// target in the usual sense (e.g. `pipe:[1234]`, `socket:[5678]`) is
/// tolerated as-is -- `readlink` already hands those back as opaque strings.
pub fn snapshot_external_fds(pid: Pid) -> Result<Vec<String>, Error> {
    (0..3)
        .map(|fd| {
            let path = format!("/proc/{pid}/fd/{fd}");
            std::fs::read_link(&path)
                .map(|target| target.to_string_lossy().into_owned())
                .map_err(|e| Error::io("reading external fd snapshot", e))
        })
        .collect()
}
