// SPDX-License-Identifier: MIT
//! Token-based authorization store.
//!
//! Binds an opaque session token to a user identity, its batch job and the
//! containers and images it may touch. Every operation re-reads the backing
//! store, applies its change and writes the whole store back.
//!
//! Store layout (YAML):
//! ```text
//! admin:
//!   token: 5f0c...            # cluster-wide admin token ("prolog" in older stores)
//! 9b1d...:                    # session token
//!   uid: 1000
//!   gid: 1000
//!   home: /home/alice
//!   job: {job_id: "4242", ...}
//!   containers: [...]         # absent when empty
//!   images: [...]             # absent when empty
//! ```
//!
//! Read-modify-write cycles are serialised by an in-process lock and the file
//! is replaced atomically. Writers in other processes are not coordinated:
//! only the serving process may mutate the store.

use log::{debug, info, warn};
use nix::unistd::{Uid, User};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use subtle::ConstantTimeEq;
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{BdockerError, Result};
use crate::job::{JobInfo, JobUpdate};

/// Key of the admin record.
pub const ADMIN_KEY: &str = "admin";
/// Key older stores use for the admin record.
pub const LEGACY_ADMIN_KEY: &str = "prolog";

/// Symlinks followed before a path is rejected (mirrors the kernel's ELOOP limit).
const MAX_SYMLINK_DEPTH: usize = 40;

/// Identity a session is requested for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionData {
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
    #[serde(default)]
    pub job: Option<JobInfo>,
}

/// Everything a session token grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<JobInfo>,
    /// Containers created under this session, absent when empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub containers: Option<BTreeSet<String>>,
    /// Images this session may reference, absent when empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<BTreeSet<String>>,
}

impl SessionRecord {
    fn from_data(data: SessionData) -> Self {
        Self {
            uid: data.uid,
            gid: data.gid,
            home: data.home,
            job: data.job,
            containers: None,
            images: None,
        }
    }

    pub fn containers(&self) -> impl Iterator<Item = &String> {
        self.containers.iter().flatten()
    }

    pub fn images(&self) -> impl Iterator<Item = &String> {
        self.images.iter().flatten()
    }
}

/// Owner of files written on behalf of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

/// Storage behind the token store.
pub trait SessionRepository: Send + Sync {
    fn admin_token(&self) -> Result<Option<String>>;
    fn set_admin_token(&self, token: &str) -> Result<()>;
    fn get(&self, token: &str) -> Result<Option<SessionRecord>>;
    fn put(&self, token: &str, record: &SessionRecord) -> Result<()>;
    /// Returns whether a record was removed.
    fn delete(&self, token: &str) -> Result<bool>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct AdminRecord {
    token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum StoreEntry {
    Admin(AdminRecord),
    Session(SessionRecord),
}

/// Single YAML file, rewritten as a whole on every change.
#[derive(Debug, Clone)]
pub struct YamlFileRepository {
    path: PathBuf,
}

impl YamlFileRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, StoreEntry>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(BdockerError::Internal(format!(
                    "Failed to read token store {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        serde_yaml::from_str(&content).map_err(|e| {
            BdockerError::Internal(format!(
                "Corrupt token store {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn save(&self, entries: &BTreeMap<String, StoreEntry>) -> Result<()> {
        let store_error = |e: &dyn std::fmt::Display| {
            BdockerError::Internal(format!(
                "Failed to write token store {}: {}",
                self.path.display(),
                e
            ))
        };

        let content = serde_yaml::to_string(entries).map_err(|e| store_error(&e))?;
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };

        // NamedTempFile is created with mode 0600, which the store keeps.
        let mut temp = NamedTempFile::new_in(dir).map_err(|e| store_error(&e))?;
        temp.write_all(content.as_bytes()).map_err(|e| store_error(&e))?;
        temp.persist(&self.path).map_err(|e| store_error(&e))?;
        Ok(())
    }
}

impl SessionRepository for YamlFileRepository {
    fn admin_token(&self) -> Result<Option<String>> {
        let entries = self.load()?;
        for key in [ADMIN_KEY, LEGACY_ADMIN_KEY] {
            if let Some(StoreEntry::Admin(admin)) = entries.get(key) {
                return Ok(Some(admin.token.clone()));
            }
        }
        Ok(None)
    }

    fn set_admin_token(&self, token: &str) -> Result<()> {
        let mut entries = self.load()?;
        entries.insert(
            ADMIN_KEY.to_string(),
            StoreEntry::Admin(AdminRecord {
                token: token.to_string(),
            }),
        );
        self.save(&entries)
    }

    fn get(&self, token: &str) -> Result<Option<SessionRecord>> {
        match self.load()?.remove(token) {
            Some(StoreEntry::Session(record)) => Ok(Some(record)),
            _ => Ok(None),
        }
    }

    fn put(&self, token: &str, record: &SessionRecord) -> Result<()> {
        if is_admin_key(token) {
            return Err(BdockerError::Internal(format!(
                "Refusing to store a session under reserved key '{}'",
                token
            )));
        }
        let mut entries = self.load()?;
        entries.insert(token.to_string(), StoreEntry::Session(record.clone()));
        self.save(&entries)
    }

    fn delete(&self, token: &str) -> Result<bool> {
        if is_admin_key(token) {
            return Ok(false);
        }
        let mut entries = self.load()?;
        match entries.remove(token) {
            Some(StoreEntry::Session(_)) => {
                self.save(&entries)?;
                Ok(true)
            }
            Some(admin) => {
                entries.insert(token.to_string(), admin);
                Ok(false)
            }
            None => Ok(false),
        }
    }
}

fn is_admin_key(key: &str) -> bool {
    key == ADMIN_KEY || key == LEGACY_ADMIN_KEY
}

/// First characters of a token, safe to log.
pub fn token_prefix(token: &str) -> &str {
    token.get(..8).unwrap_or(token)
}

fn credentials_error(msg: impl Into<String>) -> BdockerError {
    BdockerError::UserCredentials(msg.into())
}

/// Authorization front of the session repository.
pub struct TokenStore {
    repo: Box<dyn SessionRepository>,
    write_lock: Mutex<()>,
}

impl TokenStore {
    pub fn new(repo: Box<dyn SessionRepository>) -> Self {
        Self {
            repo,
            write_lock: Mutex::new(()),
        }
    }

    /// Store backed by the configured token file.
    pub fn open(config: &Config) -> Self {
        Self::new(Box::new(YamlFileRepository::new(
            config.credentials.token_store.clone(),
        )))
    }

    /// Return the admin token, minting one if the store has none.
    pub fn ensure_admin_token(&self) -> Result<String> {
        let _guard = self.lock()?;
        if let Some(token) = self.repo.admin_token()? {
            return Ok(token);
        }
        let token = new_token();
        self.repo.set_admin_token(&token)?;
        info!("token={} Admin token created", token_prefix(&token));
        Ok(token)
    }

    /// Issue a session token for `data`.
    ///
    /// `uid`, `gid` and `home` must match the user database entry of `uid`.
    pub fn authenticate(&self, admin_token: &str, data: SessionData) -> Result<String> {
        self.authorize_admin(admin_token)?;
        validate_user(&data)?;
        if let Some(job) = &data.job {
            job.validate()?;
        }

        let _guard = self.lock()?;
        let mut token = new_token();
        while self.repo.get(&token)?.is_some() {
            token = new_token();
        }

        let job_id = data.job.as_ref().map(|j| j.job_id.clone());
        self.repo.put(&token, &SessionRecord::from_data(data))?;

        info!(
            "token={} job_id={} Session token issued",
            token_prefix(&token),
            job_id.as_deref().unwrap_or("-")
        );
        Ok(token)
    }

    pub fn authorize_admin(&self, token: &str) -> Result<()> {
        let admin = self
            .repo
            .admin_token()?
            .ok_or_else(|| credentials_error("No admin token configured"))?;

        if admin.as_bytes().ct_eq(token.as_bytes()).into() {
            Ok(())
        } else {
            warn!("token={} Admin authorization rejected", token_prefix(token));
            Err(credentials_error("Invalid admin token"))
        }
    }

    /// Resolve a session token.
    pub fn authorize(&self, token: &str) -> Result<SessionRecord> {
        self.repo.get(token)?.ok_or_else(|| {
            warn!("token={} Unknown session token", token_prefix(token));
            credentials_error(format!("Token {}... not authorized", token_prefix(token)))
        })
    }

    /// Resolve a container id, full or short, to the stored id.
    pub fn authorize_container(&self, token: &str, container_id: &str) -> Result<String> {
        let record = self.authorize(token)?;
        let denied = || {
            credentials_error(format!(
                "Container {} not authorized for token {}...",
                container_id,
                token_prefix(token)
            ))
        };

        if container_id.is_empty() {
            return Err(denied());
        }

        if record.containers().any(|c| c == container_id) {
            return Ok(container_id.to_string());
        }

        let matches: Vec<&String> = record
            .containers()
            .filter(|c| c.starts_with(container_id))
            .collect();

        match matches.as_slice() {
            [single] => Ok((*single).clone()),
            [] => Err(denied()),
            _ => Err(credentials_error(format!(
                "Container id {} is ambiguous ({} matches)",
                container_id,
                matches.len()
            ))),
        }
    }

    pub fn authorize_image(&self, token: &str, image_id: &str) -> Result<()> {
        let record = self.authorize(token)?;
        if record.images().any(|i| i == image_id) {
            Ok(())
        } else {
            Err(credentials_error(format!(
                "Image {} not authorized for token {}...",
                image_id,
                token_prefix(token)
            )))
        }
    }

    /// Check that `path` resolves inside the session home.
    ///
    /// Returns the owner files written there on the session's behalf must get.
    pub fn authorize_directory(&self, token: &str, path: &Path) -> Result<Owner> {
        let record = self.authorize(token)?;
        let home = real_path(&record.home)?;
        let resolved = real_path(path)?;

        if resolved.starts_with(&home) {
            debug!(
                "token={} path={} Directory authorized",
                token_prefix(token),
                resolved.display()
            );
            Ok(Owner {
                uid: record.uid,
                gid: record.gid,
            })
        } else {
            warn!(
                "token={} path={} home={} Directory outside session home",
                token_prefix(token),
                resolved.display(),
                home.display()
            );
            Err(credentials_error(format!(
                "Path {} is outside the session home {}",
                path.display(),
                record.home.display()
            )))
        }
    }

    pub fn add_container(&self, token: &str, container_id: &str) -> Result<()> {
        self.mutate(token, |record| {
            record
                .containers
                .get_or_insert_with(BTreeSet::new)
                .insert(container_id.to_string());
            Ok(())
        })
    }

    pub fn remove_container(&self, token: &str, container_id: &str) -> Result<()> {
        self.mutate(token, |record| {
            remove_member(&mut record.containers, container_id).then_some(()).ok_or_else(|| {
                credentials_error(format!("Container {} not in session", container_id))
            })
        })
    }

    pub fn add_image(&self, token: &str, image_id: &str) -> Result<()> {
        self.mutate(token, |record| {
            record
                .images
                .get_or_insert_with(BTreeSet::new)
                .insert(image_id.to_string());
            Ok(())
        })
    }

    pub fn remove_image(&self, token: &str, image_id: &str) -> Result<()> {
        self.mutate(token, |record| {
            remove_member(&mut record.images, image_id)
                .then_some(())
                .ok_or_else(|| credentials_error(format!("Image {} not in session", image_id)))
        })
    }

    pub fn get_job_from_token(&self, token: &str) -> Result<JobInfo> {
        let record = self.authorize(token)?;
        record.job.ok_or_else(|| no_job(token))
    }

    /// Update the mutable fields of the session job.
    pub fn update_job(&self, token: &str, update: JobUpdate) -> Result<JobInfo> {
        self.mutate(token, |record| {
            let job = record.job.as_mut().ok_or_else(|| no_job(token))?;
            job.apply(update);
            Ok(job.clone())
        })
    }

    /// Replace the batch descriptor of the session job.
    ///
    /// The job id cannot change: a job belongs to the token it was issued with.
    pub fn set_token_batch_info(&self, token: &str, job: JobInfo) -> Result<()> {
        job.validate()?;
        self.mutate(token, |record| {
            let current = record.job.as_mut().ok_or_else(|| no_job(token))?;
            if current.job_id != job.job_id {
                return Err(credentials_error(format!(
                    "Token {}... belongs to job {}, not {}",
                    token_prefix(token),
                    current.job_id,
                    job.job_id
                )));
            }
            *current = job;
            Ok(())
        })
    }

    /// Delete a session. A second call for the same token fails.
    pub fn remove_token_from_cache(&self, token: &str) -> Result<()> {
        let _guard = self.lock()?;
        if self.repo.delete(token)? {
            info!("token={} Session token removed", token_prefix(token));
            Ok(())
        } else {
            Err(credentials_error(format!(
                "Token {}... not authorized",
                token_prefix(token)
            )))
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| BdockerError::Internal("Token store lock poisoned".to_string()))
    }

    fn mutate<T, F>(&self, token: &str, apply: F) -> Result<T>
    where
        F: FnOnce(&mut SessionRecord) -> Result<T>,
    {
        let _guard = self.lock()?;
        let mut record = self.authorize(token)?;
        let result = apply(&mut record)?;
        self.repo.put(token, &record)?;
        Ok(result)
    }
}

fn new_token() -> String {
    Uuid::new_v4().simple().to_string()
}

fn no_job(token: &str) -> BdockerError {
    credentials_error(format!(
        "Token {}... has no batch job attached",
        token_prefix(token)
    ))
}

/// Remove `member`; an emptied set is dropped entirely.
fn remove_member(set: &mut Option<BTreeSet<String>>, member: &str) -> bool {
    let Some(members) = set.as_mut() else {
        return false;
    };
    let removed = members.remove(member);
    if members.is_empty() {
        *set = None;
    }
    removed
}

fn validate_user(data: &SessionData) -> Result<()> {
    let user = User::from_uid(Uid::from_raw(data.uid))
        .map_err(|e| BdockerError::Internal(format!("User database lookup failed: {}", e)))?
        .ok_or_else(|| credentials_error(format!("uid {} does not exist", data.uid)))?;

    if user.gid.as_raw() != data.gid {
        return Err(credentials_error(format!(
            "gid {} does not match uid {} (expected {})",
            data.gid, data.uid, user.gid
        )));
    }

    if user.dir != data.home {
        return Err(credentials_error(format!(
            "home {} does not match uid {}",
            data.home.display(),
            data.uid
        )));
    }

    Ok(())
}

/// Resolve symlinks and `..` the way realpath(3) does, without requiring the
/// tail of the path to exist.
fn real_path(path: &Path) -> Result<PathBuf> {
    if !path.is_absolute() {
        return Err(BdockerError::Parse(format!(
            "Path must be absolute: {}",
            path.display()
        )));
    }
    resolve(path, 0)
}

fn resolve(path: &Path, depth: usize) -> Result<PathBuf> {
    if depth > MAX_SYMLINK_DEPTH {
        return Err(credentials_error(format!(
            "Too many levels of symbolic links: {}",
            path.display()
        )));
    }

    let mut resolved = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::RootDir | Component::Prefix(_) => resolved = PathBuf::from("/"),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(name) => {
                resolved.push(name);
                if let Ok(target) = fs::read_link(&resolved) {
                    resolved.pop();
                    let target = if target.is_absolute() {
                        target
                    } else {
                        resolved.join(target)
                    };
                    resolved = resolve(&target, depth + 1)?;
                }
            }
        }
    }
    Ok(resolved)
}
