// SPDX-License-Identifier: MIT
//! bdocker core library
//!
//! Lets a batch-scheduled job run a container as its payload while the
//! cluster keeps accounting and bounding its CPU and memory usage.
//!
//! This crate provides:
//! - **token_store**: session tokens bound to a user, a batch job and the
//!   containers and images it may touch
//! - **cgroup**: per-job cgroup v1 trees and usage counters
//! - **controller**: job environment setup and teardown
//! - **monitor**: detached usage poller enforcing quotas
//! - **accounting**: grid-engine accounting records and the per-job file
//! - **notifier**: delivery of accounting records to the aggregator
//! - **gateway**: token-checked container operations
//! - **lifecycle**: configure/clean of a job session
//!
//! # Processes
//!
//! Two processes exist per job: the serving process (this library) and the
//! detached monitor. They share nothing but the accounting file and the
//! job's process group, which the monitor may SIGKILL.

pub mod accounting;
pub mod batch;
pub mod cgroup;
pub mod config;
pub mod controller;
pub mod error;
pub mod gateway;
pub mod job;
pub mod lifecycle;
pub mod monitor;
pub mod notifier;
pub mod runtime;
pub mod token_store;

pub use accounting::{create_accounting_register, AccountingRecord};
pub use batch::{BatchEnvironment, SgeEnvironment};
pub use cgroup::{CgroupDriver, Usage};
pub use config::Config;
pub use controller::{JobController, JobEnvironment};
pub use error::{BdockerError, Result};
pub use gateway::ContainerGateway;
pub use job::{JobInfo, JobUpdate};
pub use lifecycle::JobSessions;
pub use notifier::{AccountingNotifier, HttpAccountingNotifier};
pub use runtime::{BindMount, ContainerRuntime, RunRequest};
pub use token_store::{SessionData, SessionRecord, TokenStore};
