//! Resource-limit and oom_score_adj installation, run from the parent while
//! it still holds privilege over the grandchild pid (§3 invariant 4, §4.E
//! step 3, §4.F `ProcReady` handling).

use std::fs;

use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::error::{Context, Error};

/// One POSIX resource limit, named the way the wire config spells it
/// (`RLIMIT_NOFILE`, `RLIMIT_CORE`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rlimit {
    #[serde(rename = "type")]
    pub kind: String,
    pub soft: u64,
    pub hard: u64,
}

/// Installs every rlimit in `limits` on `pid` via `prlimit64`, which (unlike
/// `setrlimit`) can target another process.
pub fn set_rlimits(pid: Pid, limits: &[Rlimit]) -> Result<(), Error> {
    for limit in limits {
        set_rlimit(pid, limit).context("setting rlimit on container process")?;
    }
    Ok(())
}

fn set_rlimit(pid: Pid, limit: &Rlimit) -> std::io::Result<()> {
    let resource = resource_from_name(&limit.kind)?;
    let new = libc::rlimit64 {
        rlim_cur: limit.soft,
        rlim_max: limit.hard,
    };
    let ret = unsafe { libc::prlimit64(pid.as_raw(), resource, &new, std::ptr::null_mut()) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn resource_from_name(name: &str) -> std::io::Result<libc::__rlimit_resource_t> {
    let resource = match name {
        "RLIMIT_CPU" => libc::RLIMIT_CPU,
        "RLIMIT_FSIZE" => libc::RLIMIT_FSIZE,
        "RLIMIT_DATA" => libc::RLIMIT_DATA,
        "RLIMIT_STACK" => libc::RLIMIT_STACK,
        "RLIMIT_CORE" => libc::RLIMIT_CORE,
        "RLIMIT_RSS" => libc::RLIMIT_RSS,
        "RLIMIT_NPROC" => libc::RLIMIT_NPROC,
        "RLIMIT_NOFILE" => libc::RLIMIT_NOFILE,
        "RLIMIT_MEMLOCK" => libc::RLIMIT_MEMLOCK,
        "RLIMIT_AS" => libc::RLIMIT_AS,
        "RLIMIT_LOCKS" => libc::RLIMIT_LOCKS,
        "RLIMIT_SIGPENDING" => libc::RLIMIT_SIGPENDING,
        "RLIMIT_MSGQUEUE" => libc::RLIMIT_MSGQUEUE,
        "RLIMIT_NICE" => libc::RLIMIT_NICE,
        "RLIMIT_RTPRIO" => libc::RLIMIT_RTPRIO,
        "RLIMIT_RTTIME" => libc::RLIMIT_RTTIME,
        other => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unknown rlimit: {other}"),
            ))
        }
    };
    Ok(resource)
}

/// Writes `/proc/<pid>/oom_score_adj`.
pub fn set_oom_score_adj(pid: Pid, score: i32) -> Result<(), Error> {
    fs::write(format!("/proc/{pid}/oom_score_adj"), score.to_string())
        .context("setting oom_score_adj on container process")
}
