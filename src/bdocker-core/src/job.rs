// SPDX-License-Identifier: MIT
//! Batch job descriptor attached to a session.
//!
//! A job is attached once, when the session token is issued, and from then
//! on only its quotas, cgroup path and accounting file are updated.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{BdockerError, Result};

/// Job sub-record of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    /// Batch system job identifier
    pub job_id: String,
    /// Per-job spool directory written by the batch system
    pub spool: PathBuf,
    pub queue_name: String,
    pub host_name: String,
    pub job_name: String,
    pub account_name: String,
    pub log_name: String,
    pub user_name: String,
    /// CPU quota in nanoseconds (None = unlimited)
    #[serde(default)]
    pub max_cpu: Option<u64>,
    /// Memory quota in bytes (None = unlimited)
    #[serde(default)]
    pub max_memory: Option<u64>,
    /// Process attached to the job cgroup at configuration
    #[serde(default)]
    pub parent_pid: Option<i32>,
    /// Submit time (Unix seconds) when the batch system reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_time: Option<i64>,
    /// Job cgroup path, set after configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cgroup: Option<String>,
    /// Accounting file, set after configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acc_file: Option<PathBuf>,
}

/// Fields of a job that may change after it is attached.
///
/// `None` leaves the current value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobUpdate {
    pub max_cpu: Option<u64>,
    pub max_memory: Option<u64>,
    pub cgroup: Option<String>,
    pub acc_file: Option<PathBuf>,
}

impl JobInfo {
    /// Check the fields later used in paths and group names.
    pub fn validate(&self) -> Result<()> {
        validate_job_id(&self.job_id)
            .map_err(|e| BdockerError::Parse(format!("job_id: {}", e)))?;

        if !self.spool.is_absolute() {
            return Err(BdockerError::Parse(format!(
                "spool: must be an absolute path, got {}",
                self.spool.display()
            )));
        }

        if let Some(pid) = self.parent_pid {
            if pid <= 1 {
                return Err(BdockerError::Parse(format!(
                    "parent_pid: refusing pid {}",
                    pid
                )));
            }
        }

        Ok(())
    }

    pub fn apply(&mut self, update: JobUpdate) {
        if let Some(max_cpu) = update.max_cpu {
            self.max_cpu = Some(max_cpu);
        }
        if let Some(max_memory) = update.max_memory {
            self.max_memory = Some(max_memory);
        }
        if let Some(cgroup) = update.cgroup {
            self.cgroup = Some(cgroup);
        }
        if let Some(acc_file) = update.acc_file {
            self.acc_file = Some(acc_file);
        }
    }
}

/// A job id names a file in the user's home and a cgroup directory.
fn validate_job_id(job_id: &str) -> std::result::Result<(), String> {
    if job_id.is_empty() {
        return Err("must not be empty".to_string());
    }
    if let Some(c) = job_id
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '.' | '-' | '_'))
    {
        return Err(format!("invalid character '{}' in '{}'", c, job_id));
    }
    if job_id == "." || job_id == ".." {
        return Err(format!("'{}' is not a job id", job_id));
    }
    Ok(())
}
