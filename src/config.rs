//! The `initConfig` wire payload (§3 data model, §6 external interfaces).
//!
//! Schema ownership for the full OCI bundle lives outside this crate; this
//! module only models the fields the orchestration core actually reads.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cgroup::CgroupConfig;
use crate::rlimit::Rlimit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NamespaceType {
    Newns,
    Newuts,
    Newipc,
    Newuser,
    Newpid,
    Newnet,
    Newcgroup,
    Newtime,
}

/// Which namespaces are requested, and for each, an optional pre-existing
/// path to `setns` into instead of creating a fresh one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Namespaces(BTreeMap<NamespaceType, Option<PathBuf>>);

impl Namespaces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, kind: NamespaceType, path: Option<PathBuf>) -> Self {
        self.0.insert(kind, path);
        self
    }

    pub fn contains(&self, kind: NamespaceType) -> bool {
        self.0.contains_key(&kind)
    }

    pub fn path_of(&self, kind: NamespaceType) -> Option<&Path> {
        self.0.get(&kind).and_then(|p| p.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hook {
    pub path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hooks {
    #[serde(default)]
    pub prestart: Vec<Hook>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub strategy: String,
    #[serde(default)]
    pub bridge: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdMapping {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

/// The full payload sent to the child after initial synchronization
/// (§3 `initConfig`, §6 `initConfig payload`). Immutable once `Start` begins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitConfig {
    pub namespaces: Namespaces,
    #[serde(default)]
    pub uid_mappings: Vec<IdMapping>,
    #[serde(default)]
    pub gid_mappings: Vec<IdMapping>,
    #[serde(default)]
    pub mounts: Vec<String>,
    #[serde(default)]
    pub rlimits: Vec<Rlimit>,
    #[serde(default)]
    pub oom_score_adj: Option<i32>,
    #[serde(default)]
    pub hooks: Hooks,
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
    #[serde(default)]
    pub cgroup_paths: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub cgroup: CgroupConfig,
}

impl InitConfig {
    pub fn new(namespaces: Namespaces) -> Self {
        Self {
            namespaces,
            uid_mappings: Vec::new(),
            gid_mappings: Vec::new(),
            mounts: Vec::new(),
            rlimits: Vec::new(),
            oom_score_adj: None,
            hooks: Hooks::default(),
            networks: Vec::new(),
            cgroup_paths: BTreeMap::new(),
            labels: Vec::new(),
            cgroup: CgroupConfig::default(),
        }
    }

    pub fn has_new_mount_ns(&self) -> bool {
        self.namespaces.contains(NamespaceType::Newns)
    }

    pub fn has_new_cgroup_ns_without_path(&self) -> bool {
        self.namespaces.contains(NamespaceType::Newcgroup)
            && self.namespaces.path_of(NamespaceType::Newcgroup).is_none()
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
