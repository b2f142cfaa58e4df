//! The create-container driver (§4.F). Runs the full two-stage-fork
//! handshake: spawn the bootstrap helper, recover the grandchild pid,
//! snapshot its original fds, place it in the cgroup before it can fork
//! further, optionally release it into a new cgroup namespace, wait for the
//! helper to exit, wire up networking, hand over `initConfig`, then drive
//! the sync dispatcher through the ready/hooks/run/resume handshake.

use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Arc;

use nix::sys::signal::kill;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::bootstrap::{self, ExternalStdio, HelperProcess, HelperSpawnOptions};
use crate::cgroup::{CgroupManager, DestroyGuard};
use crate::config::InitConfig;
use crate::error::Error;
use crate::fds::snapshot_external_fds;
use crate::hooks::{run_hooks, HookState};
use crate::network::NetworkManager;
use crate::process::{validate_signal, Process};
use crate::rlimit::{set_oom_score_adj, set_rlimits};
use crate::sync::{new_sync_pair, read_pid_record, stream_bootstrap, SyncMsg, SyncSocket, SyncType};

pub struct InitDriverOptions<'a> {
    pub helper_path: PathBuf,
    pub argv: Vec<String>,
    pub envp: Vec<(String, String)>,
    pub stdio: ExternalStdio,
    pub root_dir: OwnedFd,
    pub bootstrap_bytes: Vec<u8>,
    pub config: InitConfig,
    pub container_id: String,
    pub bundle_path: String,
    /// Whether the container shares the host PID namespace (§4.F.2).
    pub share_pidns: bool,
    pub cgroup: &'a dyn CgroupManager,
    pub network: &'a dyn NetworkManager,
    pub process: Arc<Process>,
}

/// A running container's init process, tracked by the grandchild pid.
pub struct InitDriver<'a> {
    child_pid: Pid,
    cgroup: &'a dyn CgroupManager,
    share_pidns: bool,
    process: Arc<Process>,
    #[allow(dead_code)]
    network_handles: Vec<Box<dyn crate::network::NetworkHandle>>,
    reaped: bool,
}

impl<'a> InitDriverOptions<'a> {
    pub fn start(self) -> Result<InitDriver<'a>, Error> {
        let InitDriverOptions {
            helper_path,
            argv,
            envp,
            stdio,
            root_dir,
            bootstrap_bytes,
            config,
            container_id,
            bundle_path,
            share_pidns,
            cgroup,
            network,
            process,
        } = self;

        let (parent_end, child_end) = new_sync_pair()?;
        let mut sync = SyncSocket::new(parent_end);

        log::debug!("init driver: spawning bootstrap helper at {helper_path:?}");
        // Step 1: spawn; the child-end and root-dir fd are dropped locally by
        // spawn_helper immediately after the helper inherits them.
        let helper = bootstrap::spawn_helper(HelperSpawnOptions {
            helper_path: &helper_path,
            argv: &argv,
            envp: &envp,
            stdio,
            sync_child_end: child_end,
            root_dir: Some(root_dir),
        })?;

        // Step 2: stream bootstrap data.
        stream_bootstrap(&mut sync, &bootstrap_bytes)?;

        // Step 3: recover the grandchild pid.
        let child_pid = match read_pid_record(&mut sync) {
            Ok(pid) => pid,
            Err(e) => {
                helper.kill_and_reap();
                return Err(e);
            }
        };
        log::info!("init driver: recovered container init pid {child_pid}");

        // Step 4: snapshot external fds before the child can dup2 over them
        // (§4.D, §8 testable property 5 -- enforced by running this before
        // cgroup Apply).
        let external_fds = match snapshot_external_fds(child_pid) {
            Ok(fds) => fds,
            Err(e) => {
                helper.kill_and_reap();
                let _ = bootstrap::terminate(child_pid);
                return Err(e);
            }
        };
        process.set_external_descriptors(external_fds);

        // Step 5: Apply before the child can fork further. From here on, any
        // failure must run Destroy on the way out (invariant 5).
        if let Err(e) = cgroup.apply(child_pid) {
            helper.kill_and_reap();
            let _ = bootstrap::terminate(child_pid);
            return Err(Error::cgroup(e));
        }
        let destroy_guard = DestroyGuard::new(cgroup);

        let ctx = RunCtx {
            config: &config,
            container_id: &container_id,
            bundle_path: &bundle_path,
            cgroup,
            network,
            process: &process,
        };
        match run_rest(&mut sync, helper, child_pid, &ctx) {
            Ok(network_handles) => {
                destroy_guard.disarm();
                process.set_pid(child_pid);
                Ok(InitDriver {
                    child_pid,
                    cgroup,
                    share_pidns,
                    process,
                    network_handles,
                    reaped: false,
                })
            }
            Err(e) => {
                // destroy_guard drops here, running Destroy.
                Err(e)
            }
        }
    }
}

struct RunCtx<'a> {
    config: &'a InitConfig,
    container_id: &'a str,
    bundle_path: &'a str,
    cgroup: &'a dyn CgroupManager,
    network: &'a dyn NetworkManager,
    process: &'a Arc<Process>,
}

/// Everything from step 6 onward, factored out of `start` so the cgroup
/// `DestroyGuard` set up after `Apply` unconditionally covers it.
fn run_rest(
    sync: &mut SyncSocket,
    helper: HelperProcess,
    child_pid: Pid,
    ctx: &RunCtx,
) -> Result<Vec<Box<dyn crate::network::NetworkHandle>>, Error> {
    // Step 6: optionally tell the helper to enter a new cgroup namespace now
    // that the grandchild has been placed in the correct cgroup.
    if ctx.config.has_new_cgroup_ns_without_path() {
        if let Err(e) = sync.write_cgroupns_byte() {
            helper.kill_and_reap();
            return Err(e);
        }
    }

    // Step 7: wait for the helper (a distinct, short-lived process) to exit
    // successfully.
    let helper_status = helper.wait()?;
    bootstrap::check_helper_exit(helper_status)?;

    // Step 8: create networks tied to the grandchild's net namespace. The
    // returned handles must outlive the container, so they ride along on
    // the driver rather than being dropped here.
    let network_handles = ctx.network.create_networks(child_pid, &ctx.config.networks)?;

    // Step 9: hand over the full initConfig.
    let config_bytes = ctx
        .config
        .to_json()
        .map_err(|e| Error::io("encoding initConfig", e))?;
    sync.write_bytes(&config_bytes)?;

    // Step 10-11: dispatcher loop with the sentRun/sentResume latches.
    run_dispatcher(sync, child_pid, ctx)?;
    Ok(network_handles)
}

fn run_dispatcher(sync: &mut SyncSocket, child_pid: Pid, ctx: &RunCtx) -> Result<(), Error> {
    let mut sent_run = false;
    let mut sent_resume = false;
    let needs_mount_ns = ctx.config.has_new_mount_ns();
    let state = HookState::new(ctx.container_id, child_pid, ctx.bundle_path);

    let dispatch_result = sync.run_dispatcher(|sync, kind| match kind {
        SyncType::ProcConsole => handle_console_handoff(sync, ctx.process),
        SyncType::ProcReady => {
            ctx.cgroup.set(&ctx.config.cgroup).map_err(Error::cgroup)?;
            if let Some(score) = ctx.config.oom_score_adj {
                set_oom_score_adj(child_pid, score)?;
            }
            set_rlimits(child_pid, &ctx.config.rlimits)?;
            if !needs_mount_ns {
                run_hooks(&ctx.config.hooks.prestart, &state)?;
            }
            sync.send_msg(&SyncMsg::new(SyncType::ProcRun))?;
            sent_run = true;
            Ok(())
        }
        SyncType::ProcHooks => {
            run_hooks(&ctx.config.hooks.prestart, &state)?;
            sync.send_msg(&SyncMsg::new(SyncType::ProcResume))?;
            sent_resume = true;
            Ok(())
        }
        other => Err(Error::Protocol(format!(
            "unexpected message {other:?} on init driver"
        ))),
    });

    let _ = sync.shutdown_write();

    if !sent_run {
        let _ = bootstrap::terminate(child_pid);
        return Err(dispatch_result
            .err()
            .unwrap_or_else(|| Error::Synchronization("child never reached ProcReady".into())));
    }
    if needs_mount_ns && !sent_resume {
        let _ = bootstrap::terminate(child_pid);
        return Err(Error::Synchronization(
            "child requested a mount namespace but never reached ProcHooks".into(),
        ));
    }
    if let Err(e) = dispatch_result {
        let _ = bootstrap::terminate(child_pid);
        return Err(e);
    }
    Ok(())
}

fn handle_console_handoff(sync: &mut SyncSocket, process: &Arc<Process>) -> Result<(), Error> {
    sync.send_msg(&SyncMsg::new(SyncType::ProcConsoleReq))?;
    let fd: OwnedFd = sync.recv_fd()?;
    process.deliver_console_fd(fd)?;
    sync.send_msg(&SyncMsg::new(SyncType::ProcConsoleAck))
}

impl<'a> InitDriver<'a> {
    pub fn pid(&self) -> Pid {
        self.child_pid
    }

    pub fn signal(&self, raw: i32) -> Result<(), Error> {
        let sig = validate_signal(raw).map_err(|e| Error::io("validating signal", e))?;
        kill(self.child_pid, sig)
            .map_err(|e| Error::io("delivering signal to container process", e))
    }

    pub fn terminate(&mut self) -> Result<(), Error> {
        bootstrap::terminate(self.child_pid)?;
        self.reaped = true;
        Ok(())
    }

    /// Reaps the init process. If the container shares the host PID
    /// namespace, the kernel will not clean up remaining workload processes
    /// on its own (§4.F.2), so this enumerates and kills whatever is left
    /// in the cgroup afterward.
    pub fn wait(&mut self) -> Result<WaitStatus, Error> {
        let status = bootstrap::reap(self.child_pid)?;
        self.reaped = true;
        if self.share_pidns {
            self.kill_stragglers()?;
        }
        Ok(status)
    }

    fn kill_stragglers(&self) -> Result<(), Error> {
        for pid in self.cgroup.processes()? {
            if pid != self.child_pid {
                let _ = kill(pid, nix::sys::signal::Signal::SIGKILL);
            }
        }
        Ok(())
    }
}

impl Drop for InitDriver<'_> {
    fn drop(&mut self) {
        if !self.reaped {
            if let Err(e) = bootstrap::reap(self.child_pid) {
                log::warn!("reaping container process {}: {e}", self.child_pid);
            }
        }
    }
}
