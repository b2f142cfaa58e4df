//! Lifecycle hook invocation (§4.F.1). Hooks run sequentially; the first
//! failure aborts the sequence and fails the start (§7 hook failure,
//! testable property 3).

use std::io::Write as _;
use std::process::{Command, Stdio};

use nix::unistd::Pid;
use serde::Serialize;

use crate::config::Hook;
use crate::error::Error;

/// State handed to a hook on its stdin as JSON, the way OCI-style runtimes
/// pass container identity to lifecycle hooks.
#[derive(Debug, Clone, Serialize)]
pub struct HookState {
    pub version: String,
    pub id: String,
    pub pid: i32,
    pub bundle_path: String,
}

impl HookState {
    pub fn new(id: impl Into<String>, pid: Pid, bundle_path: impl Into<String>) -> Self {
        Self {
            version: "1.0.2".to_string(),
            id: id.into(),
            pid: pid.as_raw(),
            bundle_path: bundle_path.into(),
        }
    }
}

/// Runs `hooks` in declared order, each with `state` JSON-encoded on stdin.
/// Stops at the first failure and reports which hook (0-indexed, per §8 S5)
/// failed.
pub fn run_hooks(hooks: &[Hook], state: &HookState) -> Result<(), Error> {
    let payload = serde_json::to_vec(state).map_err(|e| Error::hook(0, e))?;
    for (index, hook) in hooks.iter().enumerate() {
        run_one(hook, &payload).map_err(|e| Error::hook(index, e))?;
    }
    Ok(())
}

fn run_one(hook: &Hook, payload: &[u8]) -> std::io::Result<()> {
    let mut cmd = Command::new(&hook.path);
    cmd.args(&hook.args);
    for kv in &hook.env {
        if let Some((key, value)) = kv.split_once('=') {
            cmd.env(key, value);
        }
    }
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::inherit());

    let mut child = cmd.spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(payload)?;
    }
    let status = child.wait()?;
    if !status.success() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("hook {:?} exited with {status}", hook.path),
        ));
    }
    Ok(())
}
