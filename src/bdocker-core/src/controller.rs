// SPDX-License-Identifier: MIT
//! Job resource controller.
//!
//! Job lifecycle when isolation is enabled:
//! ```text
//! UNCONFIGURED --conf_environment--> CONFIGURED (monitor polling)
//!     CONFIGURED --quota reached--> QUOTA_KILLED
//!     CONFIGURED --group removed--> GROUP_REMOVED
//!     any --clean_environment--> CLEANED
//! ```
//! The controller never waits for the monitor: removing the job group makes
//! the next usage read fail, which ends the monitor.

use chrono::Utc;
use log::{debug, error, info, warn};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::accounting::{self, accounting_file_path, job_fields, write_owned_accounting_file};
use crate::cgroup::{join_group_path, CgroupDriver};
use crate::config::{Config, ResourceConfig};
use crate::error::{BdockerError, Result};
use crate::job::{JobInfo, JobUpdate};
use crate::monitor::{DetachedLauncher, MonitorLauncher, MonitorPlan};
use crate::notifier::{AccountingNotifier, HttpAccountingNotifier};
use crate::token_store::{Owner, SessionRecord};

/// What configuration attached to a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEnvironment {
    /// Job level group path
    pub cgroup: String,
    pub acc_file: PathBuf,
}

impl From<JobEnvironment> for JobUpdate {
    fn from(env: JobEnvironment) -> Self {
        JobUpdate {
            cgroup: Some(env.cgroup),
            acc_file: Some(env.acc_file),
            ..Default::default()
        }
    }
}

pub struct JobController {
    resource: ResourceConfig,
    driver: CgroupDriver,
    notifier: Option<Box<dyn AccountingNotifier>>,
    launcher: Box<dyn MonitorLauncher>,
}

impl JobController {
    pub fn new(
        resource: ResourceConfig,
        notifier: Option<Box<dyn AccountingNotifier>>,
        launcher: Box<dyn MonitorLauncher>,
    ) -> Self {
        let driver = CgroupDriver::new(resource.cgroups_dir.clone());
        Self {
            resource,
            driver,
            notifier,
            launcher,
        }
    }

    /// Controller with the HTTP notifier and the detached monitor.
    ///
    /// The notifier is only built when isolation is enabled.
    pub fn from_config(config: &Config) -> Result<Self> {
        let notifier: Option<Box<dyn AccountingNotifier>> = if config.resource.enable_cgroups {
            Some(Box::new(HttpAccountingNotifier::new(&config.accounting)?))
        } else {
            None
        };
        let driver = CgroupDriver::new(config.resource.cgroups_dir.clone());
        Ok(Self {
            resource: config.resource.clone(),
            launcher: Box::new(DetachedLauncher::new(driver.clone())),
            driver,
            notifier,
        })
    }

    pub fn enabled(&self) -> bool {
        self.resource.enable_cgroups
    }

    /// Build the job cgroup tree, write the initial accounting file and start
    /// the monitor.
    ///
    /// Returns `None` without touching the filesystem when isolation is
    /// disabled.
    pub fn conf_environment(&self, record: &SessionRecord) -> Result<Option<JobEnvironment>> {
        if !self.enabled() {
            debug!("Resource isolation disabled, nothing to configure");
            return Ok(None);
        }

        let job = session_job(record)?;
        let parent_pid = job.parent_pid.ok_or_else(|| {
            BdockerError::Batch(format!("Job {} has no parent pid", job.job_id))
        })?;
        let parent_group = &self.resource.parent_group;

        self.driver.create_tree(&job.job_id, parent_group, Some(parent_pid))?;
        let job_group = join_group_path(parent_group, &job.job_id);

        let acc_file = accounting_file_path(&record.home, &job.job_id);
        if let Err(e) = self
            .driver
            .create_tree(&self.resource.container_group, &job_group, None)
            .and_then(|_| self.start_accounting(record, job, &acc_file))
        {
            self.rollback(job, &acc_file);
            return Err(e);
        }

        let plan = MonitorPlan {
            job_id: job.job_id.clone(),
            parent_group: parent_group.clone(),
            acc_file: acc_file.clone(),
            spool: job.spool.clone(),
            parent_pid: Some(parent_pid),
            max_cpu: job.max_cpu,
            max_memory: job.max_memory,
            interval: self.resource.flush_interval(),
        };
        if let Err(e) = self.launcher.launch(&plan) {
            error!("job_id={} Monitor launch failed: {}", job.job_id, e);
            self.rollback(job, &acc_file);
            return Err(match e {
                e @ BdockerError::Batch(_) => e,
                other => BdockerError::Batch(other.to_string()),
            });
        }

        info!(
            "job_id={} cgroup={} acc_file={} Job environment configured",
            job.job_id,
            job_group,
            acc_file.display()
        );
        Ok(Some(JobEnvironment {
            cgroup: job_group,
            acc_file,
        }))
    }

    /// Send the final accounting record and remove the job cgroup tree.
    ///
    /// The group is removed even when delivery fails; the delivery error is
    /// returned afterwards and the accounting file is kept for a resend.
    /// A missing accounting file skips delivery with a warning.
    /// Returns whether cleanup ran at all.
    pub fn clean_environment(&self, record: &SessionRecord, admin_token: &str) -> Result<bool> {
        if !self.enabled() {
            debug!("Resource isolation disabled, nothing to clean");
            return Ok(false);
        }

        let job = session_job(record)?;
        let acc_file = job
            .acc_file
            .clone()
            .unwrap_or_else(|| accounting_file_path(&record.home, &job.job_id));

        let delivery = match fs::symlink_metadata(&acc_file) {
            // Nothing left to send; the teardown must still close the session.
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(
                    "job_id={} acc_file={} No accounting file, record skipped",
                    job.job_id,
                    acc_file.display()
                );
                Ok(())
            }
            _ => {
                let delivery = self.deliver_accounting(&acc_file, admin_token);
                match &delivery {
                    Ok(()) => remove_accounting_file(&acc_file),
                    Err(e) => error!(
                        "job_id={} acc_file={} Accounting not delivered, file kept: {}",
                        job.job_id,
                        acc_file.display(),
                        e
                    ),
                }
                delivery
            }
        };

        self.driver
            .delete_tree(&job.job_id, &self.resource.parent_group)?;
        delivery?;

        info!("job_id={} Job environment cleaned", job.job_id);
        Ok(true)
    }

    fn start_accounting(&self, record: &SessionRecord, job: &JobInfo, acc_file: &Path) -> Result<()> {
        let owner = Owner {
            uid: record.uid,
            gid: record.gid,
        };
        write_owned_accounting_file(acc_file, &job_fields(job, Utc::now().timestamp()), Some(owner))
    }

    fn deliver_accounting(&self, acc_file: &Path, admin_token: &str) -> Result<()> {
        let notifier = self.notifier.as_ref().ok_or_else(|| {
            BdockerError::Configuration("No accounting notifier configured".to_string())
        })?;
        let register = accounting::finalize_accounting(acc_file)?;
        notifier.notify_accounting(admin_token, &register.to_string())
    }

    fn rollback(&self, job: &JobInfo, acc_file: &Path) {
        remove_accounting_file(acc_file);
        if let Err(e) = self
            .driver
            .delete_tree(&job.job_id, &self.resource.parent_group)
        {
            warn!("job_id={} Failed to roll back cgroup tree: {}", job.job_id, e);
        }
    }
}

fn session_job(record: &SessionRecord) -> Result<&JobInfo> {
    record
        .job
        .as_ref()
        .ok_or_else(|| BdockerError::Batch("Session has no batch job".to_string()))
}

fn remove_accounting_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed accounting file {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove accounting file {}: {}", path.display(), e),
    }
}
