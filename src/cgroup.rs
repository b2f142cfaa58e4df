//! The cgroup subsystem manager is named in §1 as an external collaborator,
//! consumed only through `Apply`/`Set`/`Destroy`. This module defines that
//! interface and ships one reference implementation, `FsCgroupManager`,
//! backed directly by a cgroup v2 directory the way this codebase's own
//! `Cgroup` type is, so the drivers are exercisable without pulling in a
//! separate cgroup crate.

use std::fmt::Debug;
use std::fs::{create_dir_all, remove_dir, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::error::Error;

const CGROUP_PROCS: &str = "cgroup.procs";

/// Resource settings applied at `ProcReady` time (§4.F step 10), after the
/// grandchild has already been placed in the cgroup by `Apply`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CgroupConfig {
    pub cpu_weight: Option<u64>,
    pub cpu_quota_us: Option<i64>,
    pub cpu_period_us: Option<u64>,
    pub memory_limit_bytes: Option<i64>,
    pub pids_limit: Option<i64>,
}

/// `Apply(pid)` / `Set(config)` / `Destroy()` -- invariant 3 and 5 bind their
/// relative ordering, not their implementation.
pub trait CgroupManager: Send + Sync + Debug {
    /// Places `pid` into the cgroup. Must happen before the child can fork
    /// further (§4.F step 5).
    fn apply(&self, pid: Pid) -> Result<(), Error>;

    /// Applies resource settings. Always follows the child's `ProcReady`
    /// (invariant 3).
    fn set(&self, config: &CgroupConfig) -> Result<(), Error>;

    /// Tears the cgroup down. Invoked iff `apply` previously succeeded
    /// (invariant 5, testable property 4).
    fn destroy(&self) -> Result<(), Error>;

    /// Lists pids currently in the cgroup, used by `sharePidns` cleanup
    /// (§4.F.2).
    fn processes(&self) -> Result<Vec<Pid>, Error>;
}

/// A cgroup v2 directory under a fixed mount point.
#[derive(Clone, Debug)]
pub struct FsCgroupManager {
    path: PathBuf,
}

impl FsCgroupManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn as_path(&self) -> &Path {
        &self.path
    }

    fn write_controller(&self, file: &str, value: impl ToString) -> std::io::Result<()> {
        File::options()
            .write(true)
            .truncate(false)
            .open(self.path.join(file))?
            .write_all(value.to_string().as_bytes())
    }
}

impl CgroupManager for FsCgroupManager {
    fn apply(&self, pid: Pid) -> Result<(), Error> {
        create_dir_all(&self.path).map_err(Error::cgroup)?;
        File::options()
            .write(true)
            .truncate(false)
            .open(self.path.join(CGROUP_PROCS))
            .and_then(|mut f| f.write_all(pid.to_string().as_bytes()))
            .map_err(Error::cgroup)
    }

    fn set(&self, config: &CgroupConfig) -> Result<(), Error> {
        if let Some(weight) = config.cpu_weight {
            self.write_controller("cpu.weight", weight)
                .map_err(Error::cgroup)?;
        }
        if let (Some(quota), Some(period)) = (config.cpu_quota_us, config.cpu_period_us) {
            let value = if quota > 0 {
                format!("{quota} {period}")
            } else {
                format!("max {period}")
            };
            self.write_controller("cpu.max", value)
                .map_err(Error::cgroup)?;
        }
        if let Some(limit) = config.memory_limit_bytes {
            let value = if limit > 0 {
                limit.to_string()
            } else {
                "max".to_string()
            };
            self.write_controller("memory.max", value)
                .map_err(Error::cgroup)?;
        }
        if let Some(limit) = config.pids_limit {
            let value = if limit > 0 {
                limit.to_string()
            } else {
                "max".to_string()
            };
            self.write_controller("pids.max", value)
                .map_err(Error::cgroup)?;
        }
        Ok(())
    }

    fn destroy(&self) -> Result<(), Error> {
        remove_dir(&self.path).map_err(Error::cgroup)
    }

    fn processes(&self) -> Result<Vec<Pid>, Error> {
        let contents =
            std::fs::read_to_string(self.path.join(CGROUP_PROCS)).map_err(Error::cgroup)?;
        Ok(contents
            .lines()
            .filter_map(|line| line.trim().parse::<i32>().ok())
            .map(Pid::from_raw)
            .collect())
    }
}

/// Guards an `Apply` call, running `Destroy` on drop unless disarmed.
/// The natural Rust shape of §4.F's "deferred block rooted immediately
/// after Apply" (invariant 5 / testable property 4).
pub struct DestroyGuard<'a> {
    cgroup: &'a dyn CgroupManager,
    armed: bool,
}

impl<'a> DestroyGuard<'a> {
    pub fn new(cgroup: &'a dyn CgroupManager) -> Self {
        Self {
            cgroup,
            armed: true,
        }
    }

    /// Called on the success path: the cgroup should outlive `Start`.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for DestroyGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.cgroup.destroy() {
                log::warn!("cleaning up cgroup after failed start: {e}");
            }
        }
    }
}
