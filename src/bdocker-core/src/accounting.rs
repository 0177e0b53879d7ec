// SPDX-License-Identifier: MIT
//! Job accounting: the per-job accounting file and the grid-engine record.
//!
//! The accounting file lives in the user's home as a flat YAML mapping
//! (`key: value`). It holds the job descriptor written at configuration and
//! the latest usage snapshot written by the monitor, so cleanup can rebuild
//! the record even after the serving process restarted.
//!
//! The record itself is a colon-delimited line in the legacy grid-engine
//! field order:
//!
//! ```text
//! queue:host:0:log:job_name:job_id:account:0:submit:start:end:failed:status:
//! wallclock:<13 x 0>:cpu:memory:io:<6 x 0>
//! ```

use chrono::Utc;
use log::debug;
use nix::libc;
use nix::unistd::{fchown, Gid, Uid};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::cgroup::Usage;
use crate::error::{BdockerError, Result};
use crate::job::JobInfo;
use crate::token_store::Owner;

/// Number of fields in a record.
pub const FIELD_COUNT: usize = 36;

const DELIMITER: char = ':';
const PADDING_AFTER_WALLCLOCK: usize = 13;
const PADDING_AFTER_USAGE: usize = 6;

/// `failed` code recorded for a quota kill (grid-engine "assumedly after job").
pub const QUOTA_KILL_FAILED: &str = "100";
/// Exit status recorded for a quota kill (128 + SIGKILL).
pub const QUOTA_KILL_STATUS: &str = "137";

/// Flat key/value view of an accounting file.
pub type JobFields = BTreeMap<String, String>;

/// Accounting file of a job in `home`.
pub fn accounting_file_path(home: &Path, job_id: &str) -> PathBuf {
    home.join(format!(".bdocker_accounting_{}", job_id))
}

/// Descriptor fields written at configuration time (no usage yet).
///
/// Without a submit time from the batch system, `start_time` stands in.
pub fn job_fields(job: &JobInfo, start_time: i64) -> JobFields {
    let mut fields = JobFields::new();
    fields.insert("job_id".into(), job.job_id.clone());
    fields.insert("queue_name".into(), job.queue_name.clone());
    fields.insert("host_name".into(), job.host_name.clone());
    fields.insert("job_name".into(), job.job_name.clone());
    fields.insert("account_name".into(), job.account_name.clone());
    fields.insert("log_name".into(), job.log_name.clone());
    fields.insert("user_name".into(), job.user_name.clone());
    fields.insert(
        "submission_time".into(),
        job.submission_time.unwrap_or(start_time).to_string(),
    );
    fields.insert("start_time".into(), start_time.to_string());
    fields
}

/// Replace the accounting file atomically, so a reader never sees a torn write.
pub fn write_accounting_file(path: &Path, fields: &JobFields) -> Result<()> {
    write_owned_accounting_file(path, fields, None)
}

/// Like [`write_accounting_file`], handing the file to `owner` first.
///
/// The home directory belongs to the job user, so the temp file is chowned
/// through its descriptor and renamed over `path`: a symlink planted at
/// `path` is replaced, never followed.
pub fn write_owned_accounting_file(
    path: &Path,
    fields: &JobFields,
    owner: Option<Owner>,
) -> Result<()> {
    let dir = path.parent().ok_or_else(|| {
        BdockerError::Batch(format!("Invalid accounting file path: {}", path.display()))
    })?;
    let content = serde_yaml::to_string(fields)?;

    let mut temp = NamedTempFile::new_in(dir).map_err(|e| {
        BdockerError::Batch(format!(
            "Failed to create accounting file in {}: {}",
            dir.display(),
            e
        ))
    })?;
    temp.write_all(content.as_bytes())
        .and_then(|_| temp.flush())
        .map_err(|e| {
            BdockerError::Batch(format!("Failed to write accounting file {}: {}", path.display(), e))
        })?;

    if let Some(owner) = owner {
        fchown(
            temp.as_file().as_raw_fd(),
            Some(Uid::from_raw(owner.uid)),
            Some(Gid::from_raw(owner.gid)),
        )
        .map_err(|e| {
            BdockerError::Batch(format!(
                "Failed to hand accounting file {} to uid {}: {}",
                path.display(),
                owner.uid,
                e
            ))
        })?;
    }

    temp.persist(path).map_err(|e| {
        BdockerError::Batch(format!("Failed to write accounting file {}: {}", path.display(), e))
    })?;

    debug!("Accounting file written: {}", path.display());
    Ok(())
}

/// Open the accounting file, refusing a symlink.
fn open_accounting_file(path: &Path) -> Result<(JobFields, Owner)> {
    let read_error = |e: std::io::Error| {
        BdockerError::Batch(format!("Failed to read accounting file {}: {}", path.display(), e))
    };
    let mut file = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path)
        .map_err(read_error)?;
    let metadata = file.metadata().map_err(read_error)?;
    let mut content = String::new();
    file.read_to_string(&mut content).map_err(read_error)?;

    let fields = serde_yaml::from_str(&content).map_err(|e| {
        BdockerError::Parse(format!("Invalid accounting file {}: {}", path.display(), e))
    })?;
    let owner = Owner {
        uid: metadata.uid(),
        gid: metadata.gid(),
    };
    Ok((fields, owner))
}

pub fn read_accounting_file(path: &Path) -> Result<JobFields> {
    open_accounting_file(path).map(|(fields, _)| fields)
}

/// Overwrite the usage fields with the latest snapshot.
pub fn record_usage(path: &Path, usage: Usage) -> Result<()> {
    let (mut fields, owner) = open_accounting_file(path)?;
    fields.insert("cpu_usage".into(), usage.cpu_usage.to_string());
    fields.insert("memory_usage".into(), usage.memory_usage.to_string());
    write_owned_accounting_file(path, &fields, Some(owner))
}

/// Flag the job as killed for exceeding a quota.
pub fn record_quota_kill(path: &Path) -> Result<()> {
    let (mut fields, owner) = open_accounting_file(path)?;
    fields.insert("failed".into(), QUOTA_KILL_FAILED.to_string());
    fields.insert("status".into(), QUOTA_KILL_STATUS.to_string());
    write_owned_accounting_file(path, &fields, Some(owner))
}

/// Grid-engine compatible accounting record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountingRecord {
    pub queue_name: String,
    pub host_name: String,
    pub log_name: String,
    pub job_name: String,
    pub job_id: String,
    pub account_name: String,
    pub submission_time: i64,
    pub start_time: i64,
    pub end_time: i64,
    pub failed: String,
    pub status: String,
    pub wallclock: i64,
    pub cpu_usage: u64,
    pub memory_usage: u64,
    pub io_usage: u64,
}

impl AccountingRecord {
    /// Mark the record as belonging to a job that did not end on its own.
    pub fn mark_killed(&mut self, failed: &str, status: &str) {
        self.failed = failed.to_string();
        self.status = status.to_string();
    }

    /// Fields in wire order.
    pub fn fields(&self) -> Vec<String> {
        let mut fields = vec![
            self.queue_name.clone(),
            self.host_name.clone(),
            "0".to_string(),
            self.log_name.clone(),
            self.job_name.clone(),
            self.job_id.clone(),
            self.account_name.clone(),
            "0".to_string(),
            self.submission_time.to_string(),
            self.start_time.to_string(),
            self.end_time.to_string(),
            self.failed.clone(),
            self.status.clone(),
            self.wallclock.to_string(),
        ];
        fields.extend(std::iter::repeat("0".to_string()).take(PADDING_AFTER_WALLCLOCK));
        fields.push(self.cpu_usage.to_string());
        fields.push(self.memory_usage.to_string());
        fields.push(self.io_usage.to_string());
        fields.extend(std::iter::repeat("0".to_string()).take(PADDING_AFTER_USAGE));
        fields
    }
}

impl fmt::Display for AccountingRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for field in self.fields() {
            if !first {
                write!(f, "{}", DELIMITER)?;
            }
            write!(f, "{}", field)?;
            first = false;
        }
        Ok(())
    }
}

fn required<'a>(job: &'a JobFields, key: &str) -> Result<&'a str> {
    job.get(key)
        .map(String::as_str)
        .ok_or_else(|| BdockerError::Parse(format!("Missing job accounting field '{}'", key)))
}

fn required_time(job: &JobFields, key: &str) -> Result<i64> {
    let value = required(job, key)?;
    value.trim().parse().map_err(|_| {
        BdockerError::Parse(format!("Invalid job accounting field '{}': '{}'", key, value))
    })
}

fn optional_counter(job: &JobFields, key: &str) -> Result<u64> {
    match job.get(key) {
        None => Ok(0),
        Some(value) => value.trim().parse().map_err(|_| {
            BdockerError::Parse(format!("Invalid job accounting field '{}': '{}'", key, value))
        }),
    }
}

/// Build the accounting record of a job.
///
/// `failed` and `status` always start as `"0"`; use
/// [`AccountingRecord::mark_killed`] for jobs that were killed.
pub fn create_accounting_register(job: &JobFields) -> Result<AccountingRecord> {
    let start_time = required_time(job, "start_time")?;
    let end_time = required_time(job, "end_time")?;

    Ok(AccountingRecord {
        queue_name: required(job, "queue_name")?.to_string(),
        host_name: required(job, "host_name")?.to_string(),
        log_name: required(job, "log_name")?.to_string(),
        job_name: required(job, "job_name")?.to_string(),
        job_id: required(job, "job_id")?.to_string(),
        account_name: required(job, "account_name")?.to_string(),
        submission_time: required_time(job, "submission_time")?,
        start_time,
        end_time,
        failed: "0".to_string(),
        status: "0".to_string(),
        wallclock: (end_time - start_time).max(0),
        cpu_usage: optional_counter(job, "cpu_usage")?,
        memory_usage: optional_counter(job, "memory_usage")?,
        io_usage: optional_counter(job, "io_usage")?,
    })
}

/// Close the accounting file of a job and build its final record.
pub fn finalize_accounting(path: &Path) -> Result<AccountingRecord> {
    let mut fields = read_accounting_file(path)?;
    fields
        .entry("end_time".to_string())
        .or_insert_with(|| Utc::now().timestamp().to_string());

    let mut record = create_accounting_register(&fields)?;
    if let (Some(failed), Some(status)) = (fields.get("failed"), fields.get("status")) {
        record.mark_killed(failed, status);
    }
    Ok(record)
}
