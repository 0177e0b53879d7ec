// SPDX-License-Identifier: MIT
//! Container runtime capability.
//!
//! The core never talks to a container engine directly; the serving process
//! plugs in a client implementing [`ContainerRuntime`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::Result;

/// Host directory exposed inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub host: PathBuf,
    pub container: PathBuf,
    #[serde(default)]
    pub read_only: bool,
}

impl BindMount {
    /// `host:container[:ro]` as container engines spell it.
    pub fn to_volume_spec(&self) -> String {
        let mut spec = format!("{}:{}", self.host.display(), self.container.display());
        if self.read_only {
            spec.push_str(":ro");
        }
        spec
    }
}

/// Container creation request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub image: String,
    /// Command override (image default when empty)
    #[serde(default)]
    pub command: Vec<String>,
    /// Cgroup the container's own group is created under
    #[serde(default)]
    pub cgroup_parent: Option<String>,
    #[serde(default)]
    pub bind_mounts: Vec<BindMount>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    /// `uid:gid` the container process runs as
    #[serde(default)]
    pub user: Option<String>,
}

/// Operations of a container engine client.
pub trait ContainerRuntime: Send + Sync {
    /// Create a container and return its id. The container is not started.
    fn run(&self, request: &RunRequest) -> Result<String>;
    fn start(&self, container_id: &str) -> Result<()>;
    fn stop(&self, container_id: &str) -> Result<()>;
    fn logs(&self, container_id: &str) -> Result<String>;
    fn inspect(&self, container_id: &str) -> Result<serde_json::Value>;
    fn remove(&self, container_id: &str, force: bool) -> Result<()>;
    /// Pull an image and return its id.
    fn pull(&self, image: &str) -> Result<String>;
    fn remove_image(&self, image_id: &str) -> Result<()>;
}
