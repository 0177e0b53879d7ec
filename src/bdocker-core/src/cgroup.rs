// SPDX-License-Identifier: MIT
//! Control group hierarchy driver.
//!
//! Works on the per-controller (v1) layout used by grid-engine hosts:
//!
//! ```text
//! {root}/{controller}/{parent_path}/{group}/tasks
//! {root}/memory/{parent_path}/{group}/memory.usage_in_bytes
//! {root}/cpuacct/{parent_path}/{group}/cpuacct.usage
//! ```
//!
//! Every controller mounted under `root` gets the same group, only `memory`
//! and `cpuacct` are read back.

use cgroups_rs::hierarchies;
use log::{debug, info, warn};
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Component, Path, PathBuf};

use crate::error::{BdockerError, Result};

/// Suffixes systemd appends to unit groups. Directory listings of the tree
/// may already have them stripped, so they never take part in a path.
const SYSTEMD_SUFFIXES: [&str; 3] = [".slice", ".scope", ".partition"];

const TASKS_FILE: &str = "tasks";
const MEMORY_CONTROLLER: &str = "memory";
const MEMORY_USAGE_FILE: &str = "memory.usage_in_bytes";
const CPUACCT_CONTROLLER: &str = "cpuacct";
const CPU_USAGE_FILE: &str = "cpuacct.usage";

/// Resource usage snapshot of a group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Accumulated CPU time in nanoseconds
    pub cpu_usage: u64,
    /// Current memory usage in bytes
    pub memory_usage: u64,
}

/// Strip a systemd unit suffix from a group name.
pub fn normalize_group_name(name: &str) -> &str {
    for suffix in SYSTEMD_SUFFIXES {
        if let Some(stripped) = name.strip_suffix(suffix) {
            if !stripped.is_empty() {
                return stripped;
            }
        }
    }
    name
}

/// Turn a group path such as `/sge/user.slice` into the relative `sge/user`.
///
/// Rejects `..` so a group path can never leave a controller hierarchy.
pub fn normalize_group_path(path: &str) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(segment) => {
                let segment = segment.to_str().ok_or_else(|| {
                    BdockerError::Cgroup(format!("Non UTF-8 group path: {}", path))
                })?;
                normalized.push(normalize_group_name(segment));
            }
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(BdockerError::Cgroup(format!(
                    "Invalid group path (traversal): {}",
                    path
                )));
            }
        }
    }
    Ok(normalized)
}

/// Join a parent group path and a child group name, as stored in job records.
pub fn join_group_path(parent_path: &str, group_name: &str) -> String {
    format!(
        "{}/{}",
        parent_path.trim_end_matches('/'),
        normalize_group_name(group_name)
    )
}

fn io_error(action: &str, path: &Path, e: io::Error) -> BdockerError {
    BdockerError::Cgroup(format!("Failed to {} {}: {}", action, path.display(), e))
}

fn is_errno(e: &io::Error, errno: Errno) -> bool {
    e.raw_os_error() == Some(errno as i32)
}

/// Creates, removes and reads groups below a cgroup root.
#[derive(Debug, Clone)]
pub struct CgroupDriver {
    root: PathBuf,
}

impl CgroupDriver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        if root == Path::new("/sys/fs/cgroup") && hierarchies::is_cgroup2_unified_mode() {
            warn!(
                "Host runs the unified cgroup v2 hierarchy; per-controller groups under {} will not be found",
                root.display()
            );
        }
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Controller hierarchies mounted under root (symlinked aliases such as
    /// `cpu -> cpu,cpuacct` are skipped).
    fn controllers(&self) -> Result<Vec<PathBuf>> {
        let entries =
            fs::read_dir(&self.root).map_err(|e| io_error("list controllers in", &self.root, e))?;

        let mut controllers = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_error("list controllers in", &self.root, e))?;
            let file_type = entry
                .file_type()
                .map_err(|e| io_error("stat", &entry.path(), e))?;
            if file_type.is_dir() {
                controllers.push(entry.path());
            }
        }
        controllers.sort();
        Ok(controllers)
    }

    /// Existing `parent_path` nodes, one per controller that carries it.
    fn parent_nodes(&self, parent_path: &str) -> Result<Vec<PathBuf>> {
        let relative = normalize_group_path(parent_path)?;
        Ok(self
            .controllers()?
            .into_iter()
            .map(|controller| controller.join(&relative))
            .filter(|node| node.is_dir())
            .collect())
    }

    /// Create `group_name` below `parent_path` in every controller.
    ///
    /// An already existing group is kept. When `pid` is given it is attached
    /// to the new group.
    pub fn create_tree(&self, group_name: &str, parent_path: &str, pid: Option<i32>) -> Result<()> {
        let group = normalize_group_name(group_name);
        validate_group_name(group)?;

        let nodes = self.parent_nodes(parent_path)?;
        if nodes.is_empty() {
            return Err(BdockerError::Cgroup(format!(
                "Parent group {} not found under {}",
                parent_path,
                self.root.display()
            )));
        }

        for node in nodes {
            let child = node.join(group);
            match fs::create_dir(&child) {
                Ok(()) => debug!("Created cgroup node {}", child.display()),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    warn!("Cgroup node {} already exists, reusing it", child.display());
                }
                Err(e) => return Err(io_error("create", &child, e)),
            }

            if let Some(pid) = pid {
                append_task(&child, pid)?;
            }
        }

        info!(
            "group={} parent={} pid={:?} Created cgroup tree",
            group, parent_path, pid
        );
        Ok(())
    }

    /// Remove `group_name` (and any nested group) below `parent_path`.
    ///
    /// Tasks still attached are moved back to the parent group first. A group
    /// that is already gone is not an error.
    pub fn delete_tree(&self, group_name: &str, parent_path: &str) -> Result<()> {
        let group = normalize_group_name(group_name);
        validate_group_name(group)?;

        let nodes = match self.parent_nodes(parent_path) {
            Ok(nodes) => nodes,
            Err(BdockerError::Cgroup(msg)) if !self.root.exists() => {
                debug!("Cgroup root missing, nothing to delete: {}", msg);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        for node in nodes {
            remove_group(&node.join(group), &node)?;
        }

        info!("group={} parent={} Deleted cgroup tree", group, parent_path);
        Ok(())
    }

    /// Read memory and CPU usage of `group_name`.
    ///
    /// Fails once the group is gone, which is how the monitor learns that the
    /// job has ended.
    pub fn read_usage(&self, group_name: &str, parent_path: &str) -> Result<Usage> {
        let relative = normalize_group_path(parent_path)?.join(normalize_group_name(group_name));

        let memory_usage = read_counter(
            &self
                .root
                .join(MEMORY_CONTROLLER)
                .join(&relative)
                .join(MEMORY_USAGE_FILE),
        )?;
        let cpu_usage = read_counter(
            &self
                .root
                .join(CPUACCT_CONTROLLER)
                .join(&relative)
                .join(CPU_USAGE_FILE),
        )?;

        Ok(Usage {
            cpu_usage,
            memory_usage,
        })
    }
}

fn validate_group_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(BdockerError::Cgroup(format!("Invalid group name: '{}'", name)));
    }
    Ok(())
}

fn append_task(group: &Path, pid: i32) -> Result<()> {
    let tasks = group.join(TASKS_FILE);
    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(&tasks)
        .map_err(|e| io_error("open", &tasks, e))?;
    writeln!(file, "{}", pid).map_err(|e| io_error("attach task to", &tasks, e))
}

/// Depth-first removal: nested groups go before their parent.
fn remove_group(group: &Path, reclaim_to: &Path) -> Result<()> {
    let entries = match fs::read_dir(group) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("Cgroup node {} already removed", group.display());
            return Ok(());
        }
        Err(e) => return Err(io_error("list", group, e)),
    };

    for entry in entries {
        let entry = entry.map_err(|e| io_error("list", group, e))?;
        let is_dir = entry
            .file_type()
            .map_err(|e| io_error("stat", &entry.path(), e))?
            .is_dir();
        if is_dir {
            remove_group(&entry.path(), reclaim_to)?;
        }
    }

    reclaim_tasks(group, reclaim_to)?;

    match fs::remove_dir(group) {
        Ok(()) => {
            debug!("Removed cgroup node {}", group.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        // Not a cgroupfs mount: pseudo-files are regular files.
        Err(e) if is_errno(&e, Errno::ENOTEMPTY) => {
            fs::remove_dir_all(group).map_err(|e| io_error("remove", group, e))
        }
        Err(e) => Err(io_error("remove", group, e)),
    }
}

/// Move every task of `group` into `target`.
fn reclaim_tasks(group: &Path, target: &Path) -> Result<()> {
    let tasks = group.join(TASKS_FILE);
    let content = match fs::read_to_string(&tasks) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(io_error("read", &tasks, e)),
    };

    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let pid: i32 = line.parse().map_err(|_| {
            BdockerError::Cgroup(format!("Invalid pid '{}' in {}", line, tasks.display()))
        })?;
        match append_task(target, pid) {
            Ok(()) => debug!("Reclaimed task {} into {}", pid, target.display()),
            Err(e) => {
                // The task may have exited between read and write.
                if Path::new("/proc").join(pid.to_string()).exists() {
                    return Err(e);
                }
                debug!("Task {} exited before it could be reclaimed", pid);
            }
        }
    }
    Ok(())
}

fn read_counter(path: &Path) -> Result<u64> {
    let content = fs::read_to_string(path).map_err(|e| io_error("read", path, e))?;
    content.trim().parse().map_err(|_| {
        BdockerError::Cgroup(format!(
            "Invalid counter value '{}' in {}",
            content.trim(),
            path.display()
        ))
    })
}
