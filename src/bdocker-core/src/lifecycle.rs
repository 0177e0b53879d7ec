// SPDX-License-Identifier: MIT
//! Session lifecycle: configure at job start, clean at job end.

use log::{info, warn};
use std::sync::Arc;

use crate::config::Config;
use crate::controller::JobController;
use crate::error::Result;
use crate::token_store::{token_prefix, SessionData, TokenStore};

pub struct JobSessions {
    store: Arc<TokenStore>,
    controller: JobController,
}

impl JobSessions {
    pub fn new(store: Arc<TokenStore>, controller: JobController) -> Self {
        Self { store, controller }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            Arc::new(TokenStore::open(config)),
            JobController::from_config(config)?,
        ))
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    /// Issue a session token and set up the job environment.
    ///
    /// The token is withdrawn again when the environment cannot be set up.
    pub fn configure(&self, admin_token: &str, data: SessionData) -> Result<String> {
        let token = self.store.authenticate(admin_token, data)?;

        if let Err(e) = self.configure_environment(&token) {
            warn!(
                "token={} Environment setup failed, withdrawing token: {}",
                token_prefix(&token),
                e
            );
            if let Err(remove_err) = self.store.remove_token_from_cache(&token) {
                warn!("token={} {}", token_prefix(&token), remove_err);
            }
            return Err(e);
        }

        info!("token={} Session configured", token_prefix(&token));
        Ok(token)
    }

    fn configure_environment(&self, token: &str) -> Result<()> {
        let record = self.store.authorize(token)?;
        if let Some(env) = self.controller.conf_environment(&record)? {
            self.store.update_job(token, env.into())?;
        }
        Ok(())
    }

    /// Tear down the job environment and drop the session.
    ///
    /// On failure the session is kept so cleanup can be retried; a kept
    /// accounting file is then delivered by the retry.
    pub fn clean(&self, admin_token: &str, token: &str) -> Result<bool> {
        self.store.authorize_admin(admin_token)?;
        let record = self.store.authorize(token)?;

        let cleaned = self.controller.clean_environment(&record, admin_token)?;
        self.store.remove_token_from_cache(token)?;

        info!(
            "token={} cleaned={} Session closed",
            token_prefix(token),
            cleaned
        );
        Ok(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::{accounting_file_path, job_fields, write_accounting_file};
    use crate::config::ResourceConfig;
    use crate::error::BdockerError;
    use crate::job::tests::sample_job;
    use crate::monitor::{MonitorLauncher, MonitorPlan};
    use crate::notifier::AccountingNotifier;
    use crate::token_store::{SessionRecord, SessionRepository, YamlFileRepository};
    use nix::unistd::{getgid, getuid, User};
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    struct NoopLauncher;

    impl MonitorLauncher for NoopLauncher {
        fn launch(&self, _plan: &MonitorPlan) -> Result<()> {
            Ok(())
        }
    }

    struct FlakyNotifier {
        fail: Arc<AtomicBool>,
    }

    impl AccountingNotifier for FlakyNotifier {
        fn notify_accounting(&self, _admin_token: &str, _record: &str) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                Err(BdockerError::Internal("aggregator down".into()))
            } else {
                Ok(())
            }
        }
    }

    struct Fixture {
        dir: TempDir,
        sessions: JobSessions,
        admin: String,
        fail_delivery: Arc<AtomicBool>,
    }

    /// Sessions over a fake cgroup root with a `/sge` parent in `controllers`.
    fn fixture(enable_cgroups: bool, controllers: &[&str]) -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("cgroup");
        for controller in controllers {
            fs::create_dir_all(root.join(controller).join("sge")).unwrap();
        }

        let store = Arc::new(TokenStore::new(Box::new(YamlFileRepository::new(
            dir.path().join("token_store.yaml"),
        ))));
        let admin = store.ensure_admin_token().unwrap();

        let fail_delivery = Arc::new(AtomicBool::new(false));
        let resource = ResourceConfig {
            enable_cgroups,
            cgroups_dir: root,
            parent_group: "/sge".to_string(),
            ..Default::default()
        };
        let controller = JobController::new(
            resource,
            Some(Box::new(FlakyNotifier {
                fail: fail_delivery.clone(),
            })),
            Box::new(NoopLauncher),
        );

        Fixture {
            dir,
            sessions: JobSessions::new(store, controller),
            admin,
            fail_delivery,
        }
    }

    /// Current user as the user database knows it.
    fn session_data() -> SessionData {
        let user = User::from_uid(getuid()).unwrap().unwrap();
        SessionData {
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            home: user.dir,
            job: Some(sample_job()),
        }
    }

    #[test]
    fn test_configure_and_clean_without_isolation() {
        let fx = fixture(false, &[]);
        let token = fx.sessions.configure(&fx.admin, session_data()).unwrap();

        let job = fx.sessions.store().get_job_from_token(&token).unwrap();
        assert_eq!(job.cgroup, None);

        assert!(!fx.sessions.clean(&fx.admin, &token).unwrap());
        assert!(fx.sessions.store().authorize(&token).is_err());
    }

    #[test]
    fn test_failed_setup_withdraws_token() {
        // No controller carries the parent group.
        let fx = fixture(true, &[]);
        fs::create_dir_all(fx.dir.path().join("cgroup")).unwrap();

        let err = fx.sessions.configure(&fx.admin, session_data()).unwrap_err();
        assert!(matches!(err, BdockerError::Cgroup(_)));

        let content = fs::read_to_string(fx.dir.path().join("token_store.yaml")).unwrap();
        let entries: serde_yaml::Mapping = serde_yaml::from_str(&content).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_clean_requires_admin() {
        let fx = fixture(false, &[]);
        let token = fx.sessions.configure(&fx.admin, session_data()).unwrap();

        let err = fx.sessions.clean(&token, &token).unwrap_err();
        assert!(matches!(err, BdockerError::UserCredentials(_)));
        assert!(fx.sessions.store().authorize(&token).is_ok());
    }

    const STORED_TOKEN: &str = "0123456789abcdef0123456789abcdef";

    /// Configured job session under a temp home; returns its accounting file.
    fn stored_session(fx: &Fixture) -> PathBuf {
        let home = fx.dir.path().join("home");
        fs::create_dir(&home).unwrap();

        let mut job = sample_job();
        let acc_file = accounting_file_path(&home, &job.job_id);
        write_accounting_file(&acc_file, &job_fields(&job, 1_700_000_000)).unwrap();
        job.cgroup = Some("/sge/4242".to_string());
        job.acc_file = Some(acc_file.clone());

        // Stored directly: the user database check would pin home to the real one.
        YamlFileRepository::new(fx.dir.path().join("token_store.yaml"))
            .put(
                STORED_TOKEN,
                &SessionRecord {
                    uid: getuid().as_raw(),
                    gid: getgid().as_raw(),
                    home,
                    job: Some(job),
                    containers: None,
                    images: None,
                },
            )
            .unwrap();
        acc_file
    }

    #[test]
    fn test_clean_is_retried_after_delivery_failure() {
        let fx = fixture(true, &["cpuacct", "memory"]);
        let acc_file = stored_session(&fx);
        let token = STORED_TOKEN;

        fx.fail_delivery.store(true, Ordering::SeqCst);
        assert!(fx.sessions.clean(&fx.admin, token).is_err());
        assert!(acc_file.exists());
        assert!(fx.sessions.store().authorize(token).is_ok());

        fx.fail_delivery.store(false, Ordering::SeqCst);
        assert!(fx.sessions.clean(&fx.admin, token).unwrap());
        assert!(!acc_file.exists());
        assert!(fx.sessions.store().authorize(token).is_err());
    }

    #[test]
    fn test_retry_without_accounting_file_closes_session() {
        let fx = fixture(true, &["cpuacct", "memory"]);
        let acc_file = stored_session(&fx);
        let token = STORED_TOKEN;

        fx.fail_delivery.store(true, Ordering::SeqCst);
        assert!(fx.sessions.clean(&fx.admin, token).is_err());
        assert!(fx.sessions.store().authorize(token).is_ok());

        // The file lives in the user's home and may vanish before the retry.
        fs::remove_file(&acc_file).unwrap();
        assert!(fx.sessions.clean(&fx.admin, token).unwrap());
        assert!(fx.sessions.store().authorize(token).is_err());
    }
}
