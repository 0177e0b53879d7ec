// SPDX-License-Identifier: MIT
//! Batch system environment of the running job.

use log::debug;
use nix::unistd::getppid;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::ResourceConfig;
use crate::error::{BdockerError, Result};
use crate::job::JobInfo;
use crate::monitor::SPOOL_PID_FILE;

/// Reads the scheduler's per-job runtime context.
pub trait BatchEnvironment {
    fn job_info(&self) -> Result<JobInfo>;
}

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Grid-engine job environment.
///
/// Grid engine does not export the submit time to prolog and epilog, so
/// jobs read here carry none and their record reports the configuration
/// time as submission time.
pub struct SgeEnvironment {
    lookup: Lookup,
    max_cpu: Option<u64>,
    max_memory: Option<u64>,
}

impl SgeEnvironment {
    /// Environment of the current process, quotas from configuration.
    pub fn new(resource: &ResourceConfig) -> Self {
        Self::with_lookup(resource, |key| env::var(key).ok())
    }

    pub fn with_lookup<F>(resource: &ResourceConfig, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            lookup: Box::new(lookup),
            max_cpu: resource.max_cpu,
            max_memory: resource.max_memory,
        }
    }

    fn required(&self, key: &str) -> Result<String> {
        (self.lookup)(key)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| BdockerError::Batch(format!("{} is not set in the job environment", key)))
    }

    fn parent_pid(&self, spool: &Path) -> Result<i32> {
        let pid_file = spool.join(SPOOL_PID_FILE);
        match fs::read_to_string(&pid_file) {
            Ok(content) => content.trim().parse().map_err(|_| {
                BdockerError::Batch(format!(
                    "Invalid pid '{}' in {}",
                    content.trim(),
                    pid_file.display()
                ))
            }),
            Err(e) => {
                debug!(
                    "No job pid in {} ({}), using parent process",
                    pid_file.display(),
                    e
                );
                Ok(getppid().as_raw())
            }
        }
    }
}

impl BatchEnvironment for SgeEnvironment {
    fn job_info(&self) -> Result<JobInfo> {
        let job_id = self.required("JOB_ID")?;
        let spool = PathBuf::from(self.required("SGE_JOB_SPOOL_DIR")?);
        let user_name = self.required("USER")?;
        let log_name = (self.lookup)("LOGNAME").unwrap_or_else(|| user_name.clone());

        let job = JobInfo {
            parent_pid: Some(self.parent_pid(&spool)?),
            submission_time: None,
            job_id,
            spool,
            queue_name: self.required("QUEUE")?,
            host_name: self.required("HOSTNAME")?,
            job_name: self.required("JOB_NAME")?,
            account_name: (self.lookup)("SGE_ACCOUNT").unwrap_or_else(|| "sge".to_string()),
            log_name,
            user_name,
            max_cpu: self.max_cpu,
            max_memory: self.max_memory,
            cgroup: None,
            acc_file: None,
        };

        job.validate()?;
        debug!("job_id={} queue={} Batch job environment read", job.job_id, job.queue_name);
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn sge_env(spool: &str) -> HashMap<String, String> {
        [
            ("JOB_ID", "4242"),
            ("SGE_JOB_SPOOL_DIR", spool),
            ("USER", "alice"),
            ("QUEUE", "all.q"),
            ("HOSTNAME", "node01"),
            ("JOB_NAME", "container.sh"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn environment(vars: HashMap<String, String>, resource: &ResourceConfig) -> SgeEnvironment {
        SgeEnvironment::with_lookup(resource, move |k| vars.get(k).cloned())
    }

    #[test]
    fn test_job_info() {
        let spool = TempDir::new().unwrap();
        fs::write(spool.path().join(SPOOL_PID_FILE), "5555\n").unwrap();

        let mut resource = ResourceConfig::default();
        resource.max_memory = Some(1 << 30);

        let job = environment(sge_env(spool.path().to_str().unwrap()), &resource)
            .job_info()
            .unwrap();

        assert_eq!(job.job_id, "4242");
        assert_eq!(job.queue_name, "all.q");
        assert_eq!(job.log_name, "alice");
        assert_eq!(job.account_name, "sge");
        assert_eq!(job.parent_pid, Some(5555));
        assert_eq!(job.max_memory, Some(1 << 30));
        assert_eq!(job.max_cpu, None);
        assert_eq!(job.submission_time, None);
    }

    #[test]
    fn test_parent_pid_fallback() {
        let spool = TempDir::new().unwrap();
        let job = environment(sge_env(spool.path().to_str().unwrap()), &ResourceConfig::default())
            .job_info()
            .unwrap();
        assert_eq!(job.parent_pid, Some(getppid().as_raw()));
    }

    #[test]
    fn test_missing_variable_named() {
        let mut vars = sge_env("/var/spool/sge/4242");
        vars.remove("QUEUE");

        let err = environment(vars, &ResourceConfig::default())
            .job_info()
            .unwrap_err();
        assert!(matches!(err, BdockerError::Batch(_)));
        assert!(err.to_string().contains("QUEUE"));
    }

    #[test]
    fn test_invalid_job_id_rejected() {
        let mut vars = sge_env("/var/spool/sge/4242");
        vars.insert("JOB_ID".into(), "42/../../etc".into());

        let err = environment(vars, &ResourceConfig::default())
            .job_info()
            .unwrap_err();
        assert!(err.to_string().contains("job_id"));
    }
}
