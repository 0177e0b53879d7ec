// SPDX-License-Identifier: MIT
//! Token-checked access to the container runtime.
//!
//! Nothing reaches the runtime before the session token has been resolved
//! and the container, image or directory involved has been authorized.

use log::{info, warn};
use std::sync::Arc;

use crate::cgroup::join_group_path;
use crate::config::DEFAULT_CONTAINER_GROUP;
use crate::error::Result;
use crate::runtime::{ContainerRuntime, RunRequest};
use crate::token_store::{token_prefix, TokenStore};

pub struct ContainerGateway {
    store: Arc<TokenStore>,
    runtime: Box<dyn ContainerRuntime>,
    container_group: String,
}

impl ContainerGateway {
    pub fn new(store: Arc<TokenStore>, runtime: Box<dyn ContainerRuntime>) -> Self {
        Self {
            store,
            runtime,
            container_group: DEFAULT_CONTAINER_GROUP.to_string(),
        }
    }

    /// Nested group containers are placed in, as in `resource.container_group`.
    pub fn with_container_group(mut self, container_group: &str) -> Self {
        self.container_group = container_group.to_string();
        self
    }

    /// Pull an image and grant it to the session under both its name and id.
    pub fn pull(&self, token: &str, image: &str) -> Result<String> {
        self.store.authorize(token)?;
        let image_id = self.runtime.pull(image)?;

        self.store.add_image(token, &image_id)?;
        if image_id != image {
            self.store.add_image(token, image)?;
        }
        info!(
            "token={} image={} image_id={} Image pulled",
            token_prefix(token),
            image,
            image_id
        );
        Ok(image_id)
    }

    /// Create and start a container for the session.
    ///
    /// The container runs as the session owner inside the nested container
    /// group of the job cgroup; the caller's `user` and `cgroup_parent` are
    /// ignored.
    pub fn run(&self, token: &str, request: &RunRequest) -> Result<String> {
        let record = self.store.authorize(token)?;
        self.store.authorize_image(token, &request.image)?;
        for mount in &request.bind_mounts {
            self.store.authorize_directory(token, &mount.host)?;
        }
        if let Some(workdir) = &request.workdir {
            self.store.authorize_directory(token, workdir)?;
        }

        let request = RunRequest {
            user: Some(format!("{}:{}", record.uid, record.gid)),
            cgroup_parent: record
                .job
                .as_ref()
                .and_then(|job| job.cgroup.as_deref())
                .map(|group| join_group_path(group, &self.container_group)),
            ..request.clone()
        };

        let container_id = self.runtime.run(&request)?;
        self.store.add_container(token, &container_id)?;
        self.runtime.start(&container_id)?;

        info!(
            "token={} container={} image={} Container started",
            token_prefix(token),
            container_id,
            request.image
        );
        Ok(container_id)
    }

    pub fn start(&self, token: &str, container_id: &str) -> Result<()> {
        let id = self.store.authorize_container(token, container_id)?;
        self.runtime.start(&id)
    }

    pub fn stop(&self, token: &str, container_id: &str) -> Result<()> {
        let id = self.store.authorize_container(token, container_id)?;
        self.runtime.stop(&id)
    }

    pub fn logs(&self, token: &str, container_id: &str) -> Result<String> {
        let id = self.store.authorize_container(token, container_id)?;
        self.runtime.logs(&id)
    }

    pub fn inspect(&self, token: &str, container_id: &str) -> Result<serde_json::Value> {
        let id = self.store.authorize_container(token, container_id)?;
        self.runtime.inspect(&id)
    }

    /// Remove a container and forget it.
    pub fn remove(&self, token: &str, container_id: &str, force: bool) -> Result<()> {
        let id = self.store.authorize_container(token, container_id)?;
        self.runtime.remove(&id, force)?;
        self.store.remove_container(token, &id)?;
        info!("token={} container={} Container removed", token_prefix(token), id);
        Ok(())
    }

    pub fn remove_image(&self, token: &str, image_id: &str) -> Result<()> {
        self.store.authorize_image(token, image_id)?;
        self.runtime.remove_image(image_id)?;
        self.store.remove_image(token, image_id)
    }

    /// Force-remove every container of the session before cleanup.
    ///
    /// Failures are logged and the container stays recorded. Returns how many
    /// containers were removed.
    pub fn release_containers(&self, token: &str) -> Result<usize> {
        let record = self.store.authorize(token)?;
        let mut released = 0;

        for container_id in record.containers() {
            match self
                .runtime
                .remove(container_id, true)
                .and_then(|_| self.store.remove_container(token, container_id))
            {
                Ok(()) => released += 1,
                Err(e) => warn!(
                    "token={} container={} Failed to release container: {}",
                    token_prefix(token),
                    container_id,
                    e
                ),
            }
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BdockerError;
    use crate::job::tests::sample_job;
    use crate::runtime::BindMount;
    use crate::token_store::{SessionRecord, SessionRepository, YamlFileRepository};
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct FakeRuntime {
        calls: Arc<Mutex<Vec<String>>>,
        runs: Arc<Mutex<Vec<RunRequest>>>,
        failing_removals: Arc<Mutex<Vec<String>>>,
    }

    impl FakeRuntime {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ContainerRuntime for FakeRuntime {
        fn run(&self, request: &RunRequest) -> Result<String> {
            let mut runs = self.runs.lock().unwrap();
            runs.push(request.clone());
            Ok(format!("c{}{}", runs.len(), "0".repeat(62)))
        }

        fn start(&self, container_id: &str) -> Result<()> {
            self.record(format!("start {}", container_id));
            Ok(())
        }

        fn stop(&self, container_id: &str) -> Result<()> {
            self.record(format!("stop {}", container_id));
            Ok(())
        }

        fn logs(&self, container_id: &str) -> Result<String> {
            Ok(format!("logs of {}", container_id))
        }

        fn inspect(&self, container_id: &str) -> Result<serde_json::Value> {
            Ok(serde_json::json!({ "Id": container_id }))
        }

        fn remove(&self, container_id: &str, force: bool) -> Result<()> {
            if self.failing_removals.lock().unwrap().iter().any(|c| c == container_id) {
                return Err(BdockerError::Runtime("device busy".into()));
            }
            self.record(format!("remove {} force={}", container_id, force));
            Ok(())
        }

        fn pull(&self, image: &str) -> Result<String> {
            self.record(format!("pull {}", image));
            Ok("sha256:cafe".to_string())
        }

        fn remove_image(&self, image_id: &str) -> Result<()> {
            self.record(format!("rmi {}", image_id));
            Ok(())
        }
    }

    struct Fixture {
        dir: TempDir,
        home: PathBuf,
        token: String,
        runtime: FakeRuntime,
        gateway: ContainerGateway,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let home = dir.path().join("home/alice");
        fs::create_dir_all(&home).unwrap();
        let store_path = dir.path().join("token_store.yaml");

        let mut job = sample_job();
        job.cgroup = Some("/sge/4242".to_string());
        let token = "feedfacefeedfacefeedfacefeedface".to_string();
        YamlFileRepository::new(&store_path)
            .put(
                &token,
                &SessionRecord {
                    uid: 1000,
                    gid: 1001,
                    home: home.clone(),
                    job: Some(job),
                    containers: None,
                    images: None,
                },
            )
            .unwrap();

        let store = Arc::new(TokenStore::new(Box::new(YamlFileRepository::new(&store_path))));
        let runtime = FakeRuntime::default();
        let gateway = ContainerGateway::new(store, Box::new(runtime.clone()));
        Fixture {
            dir,
            home,
            token,
            runtime,
            gateway,
        }
    }

    fn request(fx: &Fixture) -> RunRequest {
        RunRequest {
            image: "centos:7".to_string(),
            bind_mounts: vec![BindMount {
                host: fx.home.clone(),
                container: PathBuf::from("/data"),
                read_only: false,
            }],
            workdir: Some(fx.home.clone()),
            user: Some("0:0".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_pull_grants_name_and_id() {
        let fx = fixture();
        assert_eq!(fx.gateway.pull(&fx.token, "centos:7").unwrap(), "sha256:cafe");

        let record = fx.gateway.store.authorize(&fx.token).unwrap();
        let images: Vec<&String> = record.images().collect();
        assert_eq!(images, ["centos:7", "sha256:cafe"]);
    }

    #[test]
    fn test_run_requires_pulled_image() {
        let fx = fixture();
        let err = fx.gateway.run(&fx.token, &request(&fx)).unwrap_err();
        assert!(matches!(err, BdockerError::UserCredentials(_)));
        assert!(fx.runtime.runs.lock().unwrap().is_empty());
    }

    #[test]
    fn test_run_as_session_owner_in_job_cgroup() {
        let fx = fixture();
        fx.gateway.pull(&fx.token, "centos:7").unwrap();

        let id = fx.gateway.run(&fx.token, &request(&fx)).unwrap();

        let runs = fx.runtime.runs.lock().unwrap();
        assert_eq!(runs[0].user.as_deref(), Some("1000:1001"));
        assert_eq!(runs[0].cgroup_parent.as_deref(), Some("/sge/4242/docker"));
        assert!(fx.runtime.calls().contains(&format!("start {}", id)));
        assert_eq!(
            fx.gateway.store.authorize_container(&fx.token, &id[..12]).unwrap(),
            id
        );
    }

    #[test]
    fn test_run_rejects_mount_outside_home() {
        let fx = fixture();
        fx.gateway.pull(&fx.token, "centos:7").unwrap();

        let mut req = request(&fx);
        req.bind_mounts[0].host = fx.dir.path().to_path_buf();

        let err = fx.gateway.run(&fx.token, &req).unwrap_err();
        assert!(matches!(err, BdockerError::UserCredentials(_)));
        assert!(fx.runtime.runs.lock().unwrap().is_empty());
    }

    #[test]
    fn test_foreign_container_rejected() {
        let fx = fixture();
        let err = fx.gateway.stop(&fx.token, "deadbeef").unwrap_err();
        assert!(matches!(err, BdockerError::UserCredentials(_)));
        assert!(fx.runtime.calls().is_empty());
    }

    #[test]
    fn test_remove_forgets_container() {
        let fx = fixture();
        fx.gateway.pull(&fx.token, "centos:7").unwrap();
        let id = fx.gateway.run(&fx.token, &request(&fx)).unwrap();

        fx.gateway.remove(&fx.token, &id[..12], false).unwrap();

        assert!(fx.runtime.calls().contains(&format!("remove {} force=false", id)));
        let record = fx.gateway.store.authorize(&fx.token).unwrap();
        assert_eq!(record.containers, None);
    }

    #[test]
    fn test_release_containers_survives_failures() {
        let fx = fixture();
        fx.gateway.pull(&fx.token, "centos:7").unwrap();
        let first = fx.gateway.run(&fx.token, &request(&fx)).unwrap();
        let second = fx.gateway.run(&fx.token, &request(&fx)).unwrap();
        fx.runtime.failing_removals.lock().unwrap().push(first.clone());

        assert_eq!(fx.gateway.release_containers(&fx.token).unwrap(), 1);

        let record = fx.gateway.store.authorize(&fx.token).unwrap();
        let left: Vec<&String> = record.containers().collect();
        assert_eq!(left, [&first]);
        assert!(fx.runtime.calls().contains(&format!("remove {} force=true", second)));
    }

    #[test]
    fn test_remove_image() {
        let fx = fixture();
        fx.gateway.pull(&fx.token, "centos:7").unwrap();
        fx.gateway.remove_image(&fx.token, "sha256:cafe").unwrap();

        assert!(fx.gateway.remove_image(&fx.token, "sha256:cafe").is_err());
        assert!(fx.runtime.calls().contains(&"rmi sha256:cafe".to_string()));
    }

    #[test]
    fn test_run_in_configured_container_group() {
        let mut fx = fixture();
        let runtime = fx.runtime.clone();
        fx.gateway = ContainerGateway::new(fx.gateway.store.clone(), Box::new(runtime))
            .with_container_group("containers");
        fx.gateway.pull(&fx.token, "centos:7").unwrap();

        fx.gateway.run(&fx.token, &request(&fx)).unwrap();

        let runs = fx.runtime.runs.lock().unwrap();
        assert_eq!(runs[0].cgroup_parent.as_deref(), Some("/sge/4242/containers"));
    }
}
