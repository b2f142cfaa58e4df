//! The join-existing-container driver (§4.E). Spawns the bootstrap helper,
//! places the recovered grandchild into the caller's cgroup paths, installs
//! rlimits/oom while privileged, hands over `initConfig`, then runs the sync
//! dispatcher accepting only the console handoff.

use std::collections::BTreeMap;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Arc;

use nix::sys::signal::kill;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::bootstrap::{self, ExternalStdio, HelperSpawnOptions};
use crate::cgroup::FsCgroupManager;
use crate::config::InitConfig;
use crate::error::Error;
use crate::process::{validate_signal, Process};
use crate::rlimit::{set_oom_score_adj, set_rlimits};
use crate::sync::{new_sync_pair, read_pid_record, stream_bootstrap, SyncSocket, SyncType};

pub struct SetnsDriverOptions {
    pub helper_path: PathBuf,
    pub argv: Vec<String>,
    pub envp: Vec<(String, String)>,
    pub stdio: ExternalStdio,
    pub bootstrap_bytes: Vec<u8>,
    pub config: InitConfig,
    /// Controller name -> cgroup directory for each controller to join.
    pub cgroup_paths: BTreeMap<String, PathBuf>,
    pub process: Arc<Process>,
}

/// A running joined process, tracked by the grandchild pid (invariant 1).
pub struct SetnsDriver {
    child_pid: Pid,
    process: Arc<Process>,
    reaped: bool,
}

impl SetnsDriverOptions {
    pub fn start(self) -> Result<SetnsDriver, Error> {
        let (parent_end, child_end) = new_sync_pair()?;
        let mut sync = SyncSocket::new(parent_end);

        log::debug!("setns driver: spawning bootstrap helper at {:?}", self.helper_path);
        let helper = bootstrap::spawn_helper(HelperSpawnOptions {
            helper_path: &self.helper_path,
            argv: &self.argv,
            envp: &self.envp,
            stdio: self.stdio,
            sync_child_end: child_end,
            root_dir: None,
        })?;

        stream_bootstrap(&mut sync, &self.bootstrap_bytes)?;

        let child_pid = match read_pid_record(&mut sync) {
            Ok(pid) => pid,
            Err(e) => {
                helper.kill_and_reap();
                return Err(e);
            }
        };
        log::info!("setns driver: recovered joined process pid {child_pid}");

        let helper_status = helper.wait()?;
        bootstrap::check_helper_exit(helper_status)?;

        if let Err(e) = join_cgroups(&self.cgroup_paths, child_pid) {
            let _ = bootstrap::terminate(child_pid);
            return Err(e);
        }

        if let Err(e) = install_privileged_limits(&self.config, child_pid) {
            let _ = bootstrap::terminate(child_pid);
            return Err(e);
        }

        let config_bytes = self
            .config
            .to_json()
            .map_err(|e| Error::io("encoding initConfig for joined process", e))?;
        if let Err(e) = sync.write_bytes(&config_bytes) {
            let _ = bootstrap::terminate(child_pid);
            return Err(e);
        }

        let dispatch_result = run_dispatcher(&mut sync, &self.process);

        // Invariant 2: shut the write half down exactly once, after all sync
        // traffic, before the parent waits on the final child.
        let _ = sync.shutdown_write();

        if let Err(e) = dispatch_result {
            let _ = bootstrap::terminate(child_pid);
            return Err(e);
        }

        self.process.set_pid(child_pid);
        Ok(SetnsDriver {
            child_pid,
            process: self.process,
            reaped: false,
        })
    }
}

fn join_cgroups(paths: &BTreeMap<String, PathBuf>, pid: Pid) -> Result<(), Error> {
    for (controller, path) in paths {
        let manager = FsCgroupManager::new(path.clone());
        manager
            .apply(pid)
            .map_err(|e| Error::cgroup(format!("joining {controller} cgroup at {path:?}: {e}")))?;
    }
    Ok(())
}

fn install_privileged_limits(config: &InitConfig, pid: Pid) -> Result<(), Error> {
    if let Some(score) = config.oom_score_adj {
        set_oom_score_adj(pid, score)?;
    }
    set_rlimits(pid, &config.rlimits)
}

/// Accepts only `ProcConsole`; any other message kind is a protocol
/// violation (§4.E step 5).
fn run_dispatcher(sync: &mut SyncSocket, process: &Arc<Process>) -> Result<(), Error> {
    sync.run_dispatcher(|sync, kind| match kind {
        SyncType::ProcConsole => handle_console_handoff(sync, process),
        other => Err(Error::Protocol(format!(
            "unexpected message {other:?} on setns driver"
        ))),
    })
}

fn handle_console_handoff(sync: &mut SyncSocket, process: &Arc<Process>) -> Result<(), Error> {
    use crate::sync::SyncMsg;
    sync.send_msg(&SyncMsg::new(SyncType::ProcConsoleReq))?;
    let fd: OwnedFd = sync.recv_fd()?;
    process.deliver_console_fd(fd)?;
    sync.send_msg(&SyncMsg::new(SyncType::ProcConsoleAck))
}

impl SetnsDriver {
    pub fn pid(&self) -> Pid {
        self.child_pid
    }

    pub fn signal(&self, raw: i32) -> Result<(), Error> {
        let sig = validate_signal(raw).map_err(|e| Error::io("validating signal", e))?;
        kill(self.child_pid, sig).map_err(|e| Error::io("delivering signal to joined process", e))
    }

    pub fn terminate(&mut self) -> Result<(), Error> {
        bootstrap::terminate(self.child_pid)?;
        self.reaped = true;
        Ok(())
    }

    pub fn wait(&mut self) -> Result<WaitStatus, Error> {
        let status = bootstrap::reap(self.child_pid)?;
        self.reaped = true;
        Ok(status)
    }
}

impl Drop for SetnsDriver {
    fn drop(&mut self) {
        if !self.reaped {
            if let Err(e) = bootstrap::reap(self.child_pid) {
                log::warn!("reaping joined process {}: {e}", self.child_pid);
            }
        }
    }
}
