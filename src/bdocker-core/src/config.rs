// SPDX-License-Identifier: MIT
//! Static configuration for bdocker components.
//!
//! Loaded from a YAML file, then overridden from the environment:
//! ```yaml
//! credentials:
//!   token_store: /etc/bdocker/token_store.yaml
//!
//! resource:
//!   enable_cgroups: true
//!   cgroups_dir: /sys/fs/cgroup
//!   parent_group: /sge
//!   flush_time: 10
//!
//! accounting:
//!   endpoint: "http://accounting.example.org:5000/accounting"
//!
//! batch:
//!   system: SGE
//! ```
//!
//! Environment variables override file settings:
//! - BDOCKER_TOKEN_STORE
//! - BDOCKER_ENABLE_CGROUPS
//! - BDOCKER_CGROUPS_DIR
//! - BDOCKER_ACCOUNTING_ENDPOINT
//! - BDOCKER_FLUSH_TIME
//!
//! The resulting [`Config`] is built once and handed by reference to each
//! component constructor.

use log::debug;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BdockerError, Result};

/// Token store location
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CredentialsConfig {
    /// YAML file holding the admin token and every session record
    #[serde(default = "default_token_store")]
    pub token_store: PathBuf,
}

fn default_token_store() -> PathBuf {
    PathBuf::from("/etc/bdocker/token_store.yaml")
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            token_store: default_token_store(),
        }
    }
}

/// Resource isolation and accounting
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResourceConfig {
    /// Build a cgroup tree per job and monitor it
    #[serde(default)]
    pub enable_cgroups: bool,

    /// Root under which every controller hierarchy is mounted
    #[serde(default = "default_cgroups_dir")]
    pub cgroups_dir: PathBuf,

    /// Group under which job groups are created
    #[serde(default = "default_parent_group")]
    pub parent_group: String,

    /// Name of the nested group holding the container's process tree
    #[serde(default = "default_container_group")]
    pub container_group: String,

    /// Seconds between two usage polls
    #[serde(default = "default_flush_time")]
    pub flush_time: u64,

    /// Default CPU quota in nanoseconds (None = unlimited)
    #[serde(default)]
    pub max_cpu: Option<u64>,

    /// Default memory quota in bytes (None = unlimited)
    #[serde(default)]
    pub max_memory: Option<u64>,
}

fn default_cgroups_dir() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup")
}

fn default_parent_group() -> String {
    "/".to_string()
}

/// Nested group under each job group that holds the job's containers.
pub const DEFAULT_CONTAINER_GROUP: &str = "docker";

fn default_container_group() -> String {
    DEFAULT_CONTAINER_GROUP.to_string()
}

fn default_flush_time() -> u64 {
    10
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            enable_cgroups: false,
            cgroups_dir: default_cgroups_dir(),
            parent_group: default_parent_group(),
            container_group: default_container_group(),
            flush_time: default_flush_time(),
            max_cpu: None,
            max_memory: None,
        }
    }
}

impl ResourceConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_time)
    }
}

/// Remote accounting aggregator
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountingConfig {
    /// Endpoint receiving `{admin_token, accounting}`
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_accounting_timeout")]
    pub timeout: u64,
}

fn default_accounting_timeout() -> u64 {
    30
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout: default_accounting_timeout(),
        }
    }
}

/// Batch system integration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_system")]
    pub system: String,
}

fn default_batch_system() -> String {
    "SGE".to_string()
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            system: default_batch_system(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub credentials: CredentialsConfig,

    #[serde(default)]
    pub resource: ResourceConfig,

    #[serde(default)]
    pub accounting: AccountingConfig,

    #[serde(default)]
    pub batch: BatchConfig,
}

impl Config {
    /// Load configuration from a YAML file, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::load_from_file(path)?;
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from YAML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            BdockerError::Configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        serde_yaml::from_str(&content).map_err(|e| {
            BdockerError::Configuration(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| BdockerError::Configuration(format!("Invalid config file: {}", e)))
    }

    /// Apply overrides from `lookup` (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("BDOCKER_TOKEN_STORE") {
            self.credentials.token_store = PathBuf::from(path);
        }

        if let Some(value) = lookup("BDOCKER_ENABLE_CGROUPS") {
            self.resource.enable_cgroups = parse_bool(&value).ok_or_else(|| {
                BdockerError::Configuration(format!(
                    "Invalid BDOCKER_ENABLE_CGROUPS value '{}' (expected true/false)",
                    value
                ))
            })?;
        }

        if let Some(dir) = lookup("BDOCKER_CGROUPS_DIR") {
            self.resource.cgroups_dir = PathBuf::from(dir);
        }

        if let Some(endpoint) = lookup("BDOCKER_ACCOUNTING_ENDPOINT") {
            self.accounting.endpoint = Some(endpoint);
        }

        if let Some(value) = lookup("BDOCKER_FLUSH_TIME") {
            self.resource.flush_time = value.parse().map_err(|_| {
                BdockerError::Configuration(format!(
                    "Invalid BDOCKER_FLUSH_TIME value '{}' (must be a number of seconds)",
                    value
                ))
            })?;
        }

        debug!("Configuration overrides applied");
        Ok(())
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if !self.batch.system.eq_ignore_ascii_case("SGE") {
            return Err(BdockerError::Configuration(format!(
                "batch.system: unsupported batch system '{}'",
                self.batch.system
            )));
        }

        if self.credentials.token_store.as_os_str().is_empty() {
            return Err(BdockerError::Configuration(
                "credentials.token_store must not be empty".to_string(),
            ));
        }

        if self.resource.enable_cgroups {
            if self.resource.flush_time == 0 {
                return Err(BdockerError::Configuration(
                    "resource.flush_time must be greater than 0".to_string(),
                ));
            }
            if self.resource.container_group.is_empty()
                || self.resource.container_group.contains('/')
            {
                return Err(BdockerError::Configuration(format!(
                    "resource.container_group: invalid group name '{}'",
                    self.resource.container_group
                )));
            }
            match &self.accounting.endpoint {
                Some(endpoint) if !endpoint.is_empty() => {}
                _ => {
                    return Err(BdockerError::Configuration(
                        "accounting.endpoint is required when resource.enable_cgroups is set"
                            .to_string(),
                    ))
                }
            }
        }

        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
