//! Parent-side orchestration core: the two process drivers (`InitDriver`,
//! `SetnsDriver`), the synchronization protocol they share, and the
//! collaborators they drive (cgroup manager, network manager, hooks,
//! rlimits, stdio plumbing).

pub mod bootstrap;
pub mod cgroup;
pub mod config;
pub mod error;
pub mod fds;
pub mod hooks;
pub mod init_driver;
pub mod network;
pub mod process;
pub mod rlimit;
pub mod setns_driver;
pub mod stdio;
pub mod sync;

pub use cgroup::{CgroupConfig, CgroupManager, DestroyGuard, FsCgroupManager};
pub use config::{Hook, Hooks, IdMapping, InitConfig, NamespaceType, Namespaces, NetworkConfig};
pub use error::Error;
pub use init_driver::{InitDriver, InitDriverOptions};
pub use network::{NetworkHandle, NetworkManager, NoopNetworkManager, Slirp4NetnsManager};
pub use process::Process;
pub use rlimit::Rlimit;
pub use setns_driver::{SetnsDriver, SetnsDriverOptions};
