// SPDX-License-Identifier: MIT
//! Job usage monitor.
//!
//! Runs in a detached process for the lifetime of a job: polls the job
//! cgroup, keeps the accounting file up to date and kills the job's process
//! group once a quota is reached. It talks to the serving process only
//! through the accounting file.
//!
//! Exit conditions:
//! - usage can no longer be read: the group was removed, the job is over
//! - a quota was reached: the job was killed
//! - anything else unexpected: monitoring stops, the host keeps running

use log::{debug, error, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::fcntl::OFlag;
use nix::sys::wait::waitpid;
use nix::unistd::{chdir, close, dup2, fork, getppid, pipe2, setsid, ForkResult, Pid};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::{IntoRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::accounting;
use crate::cgroup::{CgroupDriver, Usage};
use crate::error::{BdockerError, Result};

/// File in the job spool directory holding the job's process group id.
pub const SPOOL_PID_FILE: &str = "job_pid";

/// Source of usage snapshots.
pub trait UsageProbe {
    fn read_usage(&mut self) -> Result<Usage>;
}

/// Terminates the monitored job.
pub trait JobKiller {
    fn kill_job(&mut self) -> Result<()>;
}

/// Usage of one job group read through the cgroup driver.
pub struct CgroupProbe {
    driver: CgroupDriver,
    group_name: String,
    parent_path: String,
}

impl CgroupProbe {
    pub fn new(driver: CgroupDriver, group_name: &str, parent_path: &str) -> Self {
        Self {
            driver,
            group_name: group_name.to_string(),
            parent_path: parent_path.to_string(),
        }
    }
}

impl UsageProbe for CgroupProbe {
    fn read_usage(&mut self) -> Result<Usage> {
        self.driver.read_usage(&self.group_name, &self.parent_path)
    }
}

/// Kills the process group recorded in the job spool directory.
pub struct SpoolKiller {
    spool: PathBuf,
    fallback_pid: Option<i32>,
}

impl SpoolKiller {
    pub fn new(spool: &Path, fallback_pid: Option<i32>) -> Self {
        Self {
            spool: spool.to_path_buf(),
            fallback_pid,
        }
    }

    /// Process group to signal: the spool record, else the pid attached at
    /// configuration.
    pub fn process_group(&self) -> Result<i32> {
        let pid_file = self.spool.join(SPOOL_PID_FILE);
        let pid = match fs::read_to_string(&pid_file) {
            Ok(content) => content.trim().parse::<i32>().map_err(|_| {
                BdockerError::Batch(format!(
                    "Invalid pid '{}' in {}",
                    content.trim(),
                    pid_file.display()
                ))
            })?,
            Err(e) => {
                let pid = self.fallback_pid.ok_or_else(|| {
                    BdockerError::Batch(format!(
                        "Failed to read job pid from {}: {}",
                        pid_file.display(),
                        e
                    ))
                })?;
                warn!(
                    "Job pid file {} unreadable ({}), using recorded pid {}",
                    pid_file.display(),
                    e,
                    pid
                );
                pid
            }
        };

        // kill(-1) and kill(0) would hit far more than the job.
        if pid <= 1 {
            return Err(BdockerError::Batch(format!(
                "Refusing to kill process group {}",
                pid
            )));
        }
        Ok(pid)
    }
}

impl JobKiller for SpoolKiller {
    fn kill_job(&mut self) -> Result<()> {
        let pgid = self.process_group()?;
        kill(Pid::from_raw(-pgid), Signal::SIGKILL).map_err(|e| {
            BdockerError::Batch(format!("Failed to kill process group {}: {}", pgid, e))
        })?;
        info!("pgid={} Job process group killed", pgid);
        Ok(())
    }
}

/// Why the monitor stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorExit {
    /// Usage became unreadable; the job group is gone
    GroupRemoved,
    /// A quota was reached and the job was killed
    QuotaKilled(String),
    /// Monitoring stopped on an unexpected error
    Aborted(String),
}

/// Everything a detached monitor needs, captured at configuration time.
#[derive(Debug, Clone)]
pub struct MonitorPlan {
    pub job_id: String,
    pub parent_group: String,
    pub acc_file: PathBuf,
    pub spool: PathBuf,
    pub parent_pid: Option<i32>,
    pub max_cpu: Option<u64>,
    pub max_memory: Option<u64>,
    pub interval: Duration,
}

/// Poll loop over a probe and a killer.
pub struct Monitor<P, K> {
    probe: P,
    killer: K,
    acc_file: PathBuf,
    max_cpu: Option<u64>,
    max_memory: Option<u64>,
    interval: Duration,
    polls: u64,
}

impl<P: UsageProbe, K: JobKiller> Monitor<P, K> {
    pub fn new(probe: P, killer: K, plan: &MonitorPlan) -> Self {
        Self {
            probe,
            killer,
            acc_file: plan.acc_file.clone(),
            max_cpu: plan.max_cpu,
            max_memory: plan.max_memory,
            interval: plan.interval,
            polls: 0,
        }
    }

    /// Number of usage polls done so far.
    pub fn polls(&self) -> u64 {
        self.polls
    }

    /// Poll until the job ends, is killed or monitoring fails.
    pub fn run(&mut self) -> MonitorExit {
        loop {
            thread::sleep(self.interval);
            match self.poll() {
                Ok(None) => continue,
                Ok(Some(exit)) => return exit,
                Err(e) => {
                    error!("acc_file={} Monitoring aborted: {}", self.acc_file.display(), e);
                    return MonitorExit::Aborted(e.to_string());
                }
            }
        }
    }

    /// One poll cycle. `Ok(Some(_))` ends monitoring.
    pub fn poll(&mut self) -> Result<Option<MonitorExit>> {
        self.polls += 1;

        let usage = match self.probe.read_usage() {
            Ok(usage) => usage,
            Err(BdockerError::Cgroup(msg)) => {
                info!("Job group gone, stopping monitor: {}", msg);
                return Ok(Some(MonitorExit::GroupRemoved));
            }
            Err(e) => return Err(e),
        };

        debug!(
            "poll={} cpu_usage={} memory_usage={} Usage snapshot",
            self.polls, usage.cpu_usage, usage.memory_usage
        );

        // A lost snapshot is recovered by the next poll.
        if let Err(e) = accounting::record_usage(&self.acc_file, usage) {
            warn!("Failed to update accounting file: {}", e);
        }

        if let Some(reason) = self.quota_exceeded(usage) {
            warn!("Quota exceeded, killing job: {}", reason);
            if let Err(e) = accounting::record_quota_kill(&self.acc_file) {
                warn!("Failed to record quota kill: {}", e);
            }
            self.killer.kill_job()?;
            return Ok(Some(MonitorExit::QuotaKilled(reason)));
        }

        Ok(None)
    }

    fn quota_exceeded(&self, usage: Usage) -> Option<String> {
        if let Some(max_cpu) = self.max_cpu {
            if usage.cpu_usage >= max_cpu {
                return Some(format!("cpu_usage {} >= max_cpu {}", usage.cpu_usage, max_cpu));
            }
        }
        if let Some(max_memory) = self.max_memory {
            if usage.memory_usage >= max_memory {
                return Some(format!(
                    "memory_usage {} >= max_memory {}",
                    usage.memory_usage, max_memory
                ));
            }
        }
        None
    }
}

/// Starts the monitor of a configured job.
pub trait MonitorLauncher: Send + Sync {
    fn launch(&self, plan: &MonitorPlan) -> Result<()>;
}

/// Runs the monitor in a process detached from the caller's session.
///
/// Double fork: the intermediate child calls `setsid` and exits at once, so
/// the monitor is reparented to init and never lingers as our zombie. The
/// monitor holds none of the caller's descriptors: a hook runner waiting on
/// our stdout sees EOF as soon as we return.
pub struct DetachedLauncher {
    driver: CgroupDriver,
}

impl DetachedLauncher {
    pub fn new(driver: CgroupDriver) -> Self {
        Self { driver }
    }

    /// Start the monitor and return its pid.
    pub fn spawn(&self, plan: &MonitorPlan) -> Result<Pid> {
        let fork_error = |e: nix::Error| {
            BdockerError::Batch(format!("Failed to fork monitor for job {}: {}", plan.job_id, e))
        };
        let (pid_read, pid_write) = pipe2(OFlag::O_CLOEXEC).map_err(fork_error)?;

        match unsafe { fork() } {
            Err(e) => Err(fork_error(e)),
            Ok(ForkResult::Parent { child }) => {
                drop(pid_write);
                waitpid(child, None).map_err(|e| {
                    BdockerError::Batch(format!(
                        "Failed to wait for monitor launcher of job {}: {}",
                        plan.job_id, e
                    ))
                })?;

                let mut reported = String::new();
                File::from(pid_read)
                    .read_to_string(&mut reported)
                    .map_err(|e| BdockerError::Batch(format!("Failed to read monitor pid: {}", e)))?;
                let pid: i32 = reported.trim().parse().map_err(|_| {
                    BdockerError::Batch(format!("Monitor of job {} did not start", plan.job_id))
                })?;

                info!("job_id={} pid={} Monitor launched", plan.job_id, pid);
                Ok(Pid::from_raw(pid))
            }
            Ok(ForkResult::Child) => {
                drop(pid_read);
                if let Err(e) = setsid() {
                    error!("Failed to detach monitor: {}", e);
                    std::process::exit(1);
                }
                match unsafe { fork() } {
                    Ok(ForkResult::Parent { child }) => {
                        let mut pipe = File::from(pid_write);
                        let code = if write!(pipe, "{}", child).is_ok() { 0 } else { 1 };
                        std::process::exit(code);
                    }
                    Ok(ForkResult::Child) => {
                        drop(pid_write);
                        if let Err(e) = detach_stdio() {
                            error!("Failed to detach monitor: {}", e);
                            std::process::exit(1);
                        }
                        run_detached(&self.driver, plan)
                    }
                    Err(e) => {
                        error!("Failed to fork monitor: {}", e);
                        std::process::exit(1);
                    }
                }
            }
        }
    }
}

impl MonitorLauncher for DetachedLauncher {
    fn launch(&self, plan: &MonitorPlan) -> Result<()> {
        self.spawn(plan).map(|_| ())
    }
}

/// Point stdio at `/dev/null`, close every other inherited descriptor and
/// leave the caller's working directory.
fn detach_stdio() -> Result<()> {
    let null = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(|e| BdockerError::Batch(format!("Failed to open /dev/null: {}", e)))?
        .into_raw_fd();
    for fd in 0..=2 {
        dup2(null, fd)
            .map_err(|e| BdockerError::Batch(format!("Failed to redirect fd {}: {}", fd, e)))?;
    }
    if null > 2 {
        let _ = close(null);
    }

    close_inherited_fds();
    chdir("/").map_err(|e| BdockerError::Batch(format!("Failed to chdir to /: {}", e)))
}

fn close_inherited_fds() {
    let fds: Vec<RawFd> = match fs::read_dir("/proc/self/fd") {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse::<RawFd>().ok())
            .filter(|&fd| fd > 2)
            .collect(),
        Err(e) => {
            warn!("Cannot list inherited descriptors: {}", e);
            return;
        }
    };
    // Includes the listing's own descriptor, already closed; EBADF is fine.
    for fd in fds {
        let _ = close(fd);
    }
}

/// Body of the detached monitor process (never returns).
fn run_detached(driver: &CgroupDriver, plan: &MonitorPlan) -> ! {
    info!(
        "job_id={} ppid={} interval={:?} Monitor started",
        plan.job_id,
        getppid(),
        plan.interval
    );

    let probe = CgroupProbe::new(driver.clone(), &plan.job_id, &plan.parent_group);
    let killer = SpoolKiller::new(&plan.spool, plan.parent_pid);
    let mut monitor = Monitor::new(probe, killer, plan);

    let exit = monitor.run();
    info!(
        "job_id={} polls={} exit={:?} Monitor finished",
        plan.job_id,
        monitor.polls(),
        exit
    );
    std::process::exit(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::{job_fields, read_accounting_file, write_accounting_file};
    use crate::job::tests::sample_job;
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::rc::Rc;
    use tempfile::TempDir;

    struct ScriptedProbe {
        readings: VecDeque<Result<Usage>>,
        calls: Rc<Cell<u32>>,
    }

    impl UsageProbe for ScriptedProbe {
        fn read_usage(&mut self) -> Result<Usage> {
            self.calls.set(self.calls.get() + 1);
            self.readings
                .pop_front()
                .unwrap_or_else(|| Err(BdockerError::Cgroup("group removed".into())))
        }
    }

    struct RecordingKiller {
        kills: Rc<Cell<u32>>,
        fail: bool,
    }

    impl JobKiller for RecordingKiller {
        fn kill_job(&mut self) -> Result<()> {
            self.kills.set(self.kills.get() + 1);
            if self.fail {
                Err(BdockerError::Batch("no such process".into()))
            } else {
                Ok(())
            }
        }
    }

    struct Harness {
        _home: TempDir,
        plan: MonitorPlan,
        calls: Rc<Cell<u32>>,
        kills: Rc<Cell<u32>>,
    }

    fn harness(max_cpu: Option<u64>, max_memory: Option<u64>) -> Harness {
        let home = TempDir::new().unwrap();
        let acc_file = home.path().join(".bdocker_accounting_4242");
        write_accounting_file(&acc_file, &job_fields(&sample_job(), 1_700_000_000)).unwrap();

        Harness {
            plan: MonitorPlan {
                job_id: "4242".into(),
                parent_group: "/sge".into(),
                acc_file,
                spool: home.path().to_path_buf(),
                parent_pid: None,
                max_cpu,
                max_memory,
                interval: Duration::ZERO,
            },
            _home: home,
            calls: Rc::new(Cell::new(0)),
            kills: Rc::new(Cell::new(0)),
        }
    }

    fn cpu(values: &[u64]) -> VecDeque<Result<Usage>> {
        values
            .iter()
            .map(|&cpu_usage| {
                Ok(Usage {
                    cpu_usage,
                    memory_usage: 0,
                })
            })
            .collect()
    }

    fn monitor(
        h: &Harness,
        readings: VecDeque<Result<Usage>>,
        fail_kill: bool,
    ) -> Monitor<ScriptedProbe, RecordingKiller> {
        Monitor::new(
            ScriptedProbe {
                readings,
                calls: h.calls.clone(),
            },
            RecordingKiller {
                kills: h.kills.clone(),
                fail: fail_kill,
            },
            &h.plan,
        )
    }

    #[test]
    fn test_cpu_quota_kills_on_third_poll() {
        let h = harness(Some(10), None);
        let mut m = monitor(&h, cpu(&[5, 9, 11, 20]), false);

        assert_eq!(m.poll().unwrap(), None);
        assert_eq!(m.poll().unwrap(), None);
        assert_eq!(h.kills.get(), 0);
        assert!(matches!(m.poll().unwrap(), Some(MonitorExit::QuotaKilled(_))));
        assert_eq!(h.kills.get(), 1);
        assert_eq!(h.calls.get(), 3);
    }

    #[test]
    fn test_run_stops_after_quota_kill() {
        let h = harness(Some(10), None);
        let mut m = monitor(&h, cpu(&[5, 9, 11, 20]), false);

        let exit = m.run();
        assert!(matches!(exit, MonitorExit::QuotaKilled(ref r) if r.contains("max_cpu")));
        assert_eq!(m.polls(), 3);
        assert_eq!(h.kills.get(), 1);

        let fields = read_accounting_file(&h.plan.acc_file).unwrap();
        assert_eq!(fields.get("cpu_usage").map(String::as_str), Some("11"));
        assert_eq!(
            fields.get("failed").map(String::as_str),
            Some(accounting::QUOTA_KILL_FAILED)
        );
    }

    #[test]
    fn test_memory_quota_reached_exactly() {
        let h = harness(None, Some(1024));
        let readings = vec![
            Ok(Usage { cpu_usage: 1, memory_usage: 512 }),
            Ok(Usage { cpu_usage: 2, memory_usage: 1024 }),
        ]
        .into();
        let mut m = monitor(&h, readings, false);

        assert!(matches!(m.run(), MonitorExit::QuotaKilled(ref r) if r.contains("max_memory")));
        assert_eq!(m.polls(), 2);
    }

    #[test]
    fn test_unlimited_job_ends_when_group_removed() {
        let h = harness(None, None);
        let mut m = monitor(&h, cpu(&[5, u64::MAX]), false);

        assert_eq!(m.run(), MonitorExit::GroupRemoved);
        assert_eq!(m.polls(), 3);
        assert_eq!(h.kills.get(), 0);

        let fields = read_accounting_file(&h.plan.acc_file).unwrap();
        assert_eq!(fields.get("cpu_usage"), Some(&u64::MAX.to_string()));
        assert!(!fields.contains_key("failed"));
    }

    #[test]
    fn test_accounting_write_failure_is_survived() {
        let mut h = harness(Some(10), None);
        h.plan.acc_file = h.plan.acc_file.with_file_name("missing/acc");
        let mut m = monitor(&h, cpu(&[1, 2]), false);

        assert_eq!(m.run(), MonitorExit::GroupRemoved);
        assert_eq!(m.polls(), 3);
    }

    #[test]
    fn test_kill_failure_aborts() {
        let h = harness(Some(10), None);
        let mut m = monitor(&h, cpu(&[50]), true);

        assert!(matches!(m.run(), MonitorExit::Aborted(_)));
        assert_eq!(h.kills.get(), 1);
    }

    #[test]
    fn test_unexpected_probe_error_aborts() {
        let h = harness(None, None);
        let readings = vec![Err(BdockerError::Internal("boom".into()))].into();
        let mut m = monitor(&h, readings, false);

        assert!(matches!(m.run(), MonitorExit::Aborted(ref msg) if msg.contains("boom")));
    }

    #[test]
    fn test_spool_killer_process_group() {
        let spool = TempDir::new().unwrap();

        let killer = SpoolKiller::new(spool.path(), Some(4321));
        assert_eq!(killer.process_group().unwrap(), 4321);

        fs::write(spool.path().join(SPOOL_PID_FILE), "1234\n").unwrap();
        assert_eq!(killer.process_group().unwrap(), 1234);

        fs::write(spool.path().join(SPOOL_PID_FILE), "1").unwrap();
        assert!(killer.process_group().is_err());

        fs::write(spool.path().join(SPOOL_PID_FILE), "garbage").unwrap();
        assert!(killer.process_group().is_err());

        let no_fallback = SpoolKiller::new(&spool.path().join("nope"), None);
        assert!(matches!(
            no_fallback.process_group().unwrap_err(),
            BdockerError::Batch(_)
        ));
    }

    #[test]
    fn test_cgroup_probe_reports_removed_group() {
        let root = TempDir::new().unwrap();
        let mut probe = CgroupProbe::new(CgroupDriver::new(root.path()), "4242", "/sge");
        assert!(matches!(probe.read_usage(), Err(BdockerError::Cgroup(_))));
    }

    fn process_running(pid: Pid) -> bool {
        match fs::read_to_string(format!("/proc/{}/stat", pid)) {
            // State follows the parenthesised command name.
            Ok(stat) => stat
                .rsplit_once(')')
                .map_or(false, |(_, rest)| !rest.trim_start().starts_with('Z')),
            Err(_) => false,
        }
    }

    #[test]
    fn test_detached_monitor_releases_caller_descriptors() {
        // No job group under the root: the first poll ends the monitor.
        let root = TempDir::new().unwrap();
        let home = TempDir::new().unwrap();
        let plan = MonitorPlan {
            job_id: "4242".into(),
            parent_group: "/sge".into(),
            acc_file: home.path().join(".bdocker_accounting_4242"),
            spool: home.path().to_path_buf(),
            parent_pid: None,
            max_cpu: None,
            max_memory: None,
            interval: Duration::from_secs(3),
        };

        // Inheritable, like the stdout pipe of a hook runner.
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        let pid = DetachedLauncher::new(CgroupDriver::new(root.path()))
            .spawn(&plan)
            .unwrap();
        drop(write_end);

        let (tx, rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            let mut out = Vec::new();
            let _ = File::from(read_end).read_to_end(&mut out);
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(1))
            .expect("monitor still holds the caller's pipe");
        assert!(process_running(pid));

        let deadline = std::time::Instant::now() + Duration::from_secs(15);
        while process_running(pid) {
            assert!(std::time::Instant::now() < deadline, "monitor did not exit");
            thread::sleep(Duration::from_millis(50));
        }
    }
}
