//! Network interface creation hook-in (§4.F step 8, §1 "network strategy
//! registry" external collaborator). The registry itself -- choosing a
//! strategy per requested `NetworkConfig` -- lives outside this crate; this
//! module defines the interface the `InitDriver` calls into once the
//! bootstrap helper has exited and the grandchild's net namespace exists,
//! plus one reference implementation.

use std::fmt::Debug;
use std::path::PathBuf;

use nix::unistd::Pid;

use crate::config::NetworkConfig;
use crate::error::Error;

/// An owned network resource (e.g. a slirp4netns child process, a veth
/// pair) that must be torn down when the container exits.
pub trait NetworkHandle: Send + Sync + Debug {}

pub trait NetworkManager: Send + Sync + Debug {
    /// Creates interfaces tied to `pid`'s net namespace for each configured
    /// network. Called strictly after the bootstrap helper has exited
    /// (§5 ordering guarantee: `wait(helper) < create networks`).
    fn create_networks(
        &self,
        pid: Pid,
        networks: &[NetworkConfig],
    ) -> Result<Vec<Box<dyn NetworkHandle>>, Error>;
}

/// No networks requested, or the embedding runtime manages networking
/// entirely out of band.
#[derive(Debug, Default)]
pub struct NoopNetworkManager;

impl NetworkManager for NoopNetworkManager {
    fn create_networks(
        &self,
        _pid: Pid,
        _networks: &[NetworkConfig],
    ) -> Result<Vec<Box<dyn NetworkHandle>>, Error> {
        Ok(Vec::new())
    }
}

/// Runs `slirp4netns` against the grandchild's pid for each `"slirp4netns"`
/// strategy network.
#[derive(Debug)]
pub struct Slirp4NetnsManager {
    pub binary: PathBuf,
}

impl Slirp4NetnsManager {
    pub fn new() -> Self {
        Self {
            binary: "/bin/slirp4netns".into(),
        }
    }
}

impl Default for Slirp4NetnsManager {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkManager for Slirp4NetnsManager {
    fn create_networks(
        &self,
        pid: Pid,
        networks: &[NetworkConfig],
    ) -> Result<Vec<Box<dyn NetworkHandle>>, Error> {
        let mut handles: Vec<Box<dyn NetworkHandle>> = Vec::new();
        for net in networks {
            if net.strategy != "slirp4netns" {
                continue;
            }
            let handle = std::process::Command::new(&self.binary)
                .arg("--configure")
                .arg("--mtu=65520")
                .arg("--disable-host-loopback")
                .arg(pid.to_string())
                .arg("tap0")
                .spawn()
                .map_err(|e| Error::io("starting slirp4netns", e))?;
            handles.push(Box::new(Slirp4NetnsHandle { handle }));
        }
        Ok(handles)
    }
}

#[derive(Debug)]
pub struct Slirp4NetnsHandle {
    handle: std::process::Child,
}

impl NetworkHandle for Slirp4NetnsHandle {}

impl Drop for Slirp4NetnsHandle {
    fn drop(&mut self) {
        let _ = self.handle.kill();
        let _ = self.handle.wait();
    }
}
