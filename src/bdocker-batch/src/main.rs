// SPDX-License-Identifier: MIT
// ============================================================================
// bdocker-batch - grid-engine prolog/epilog hook
//
// Runs as root from the queue's prolog and epilog. The prolog issues the
// job's session token and builds its cgroup tree; the epilog sends the
// accounting record and tears everything down.
// ============================================================================

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use nix::unistd::User;
use std::path::PathBuf;

use bdocker_core::{BatchEnvironment, Config, JobInfo, JobSessions, SessionData, SgeEnvironment};

mod token_file;

use token_file::{read_token_file, token_file_path, write_token_file};

/// Grid-engine hook for bdocker job sessions
#[derive(Parser)]
#[command(name = "bdocker-batch")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "/etc/bdocker/configuration.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the admin token if the store has none
    Init,

    /// Prolog: issue the session token and configure the job environment
    Configure,

    /// Epilog: deliver accounting, tear down the job environment
    Clean,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load configuration {}", cli.config.display()))?;

    match cli.command {
        Commands::Init => init(&config),
        Commands::Configure => configure(&config),
        Commands::Clean => clean(&config),
    }
}

fn init(config: &Config) -> Result<()> {
    let sessions = JobSessions::from_config(config)?;
    sessions
        .store()
        .ensure_admin_token()
        .context("Failed to initialise the token store")?;
    info!(
        "store={} Token store ready",
        config.credentials.token_store.display()
    );
    Ok(())
}

/// Batch job of this hook invocation and its owner.
fn job_owner(config: &Config) -> Result<(JobInfo, User)> {
    let job = SgeEnvironment::new(&config.resource)
        .job_info()
        .context("Failed to read the batch job environment")?;
    let user = User::from_name(&job.user_name)
        .with_context(|| format!("Failed to look up user {}", job.user_name))?
        .with_context(|| format!("Unknown user {}", job.user_name))?;
    Ok((job, user))
}

fn configure(config: &Config) -> Result<()> {
    let sessions = JobSessions::from_config(config)?;
    let admin_token = sessions.store().ensure_admin_token()?;
    let (job, user) = job_owner(config)?;
    let job_id = job.job_id.clone();

    let data = SessionData {
        uid: user.uid.as_raw(),
        gid: user.gid.as_raw(),
        home: user.dir.clone(),
        job: Some(job),
    };
    let token = sessions
        .configure(&admin_token, data)
        .with_context(|| format!("Failed to configure job {}", job_id))?;

    let path = token_file_path(&user.dir, &job_id);
    write_token_file(&path, &token, Some((user.uid, user.gid)))?;

    info!(
        "job_id={} user={} token_file={} Job configured",
        job_id,
        user.name,
        path.display()
    );
    Ok(())
}

fn clean(config: &Config) -> Result<()> {
    let sessions = JobSessions::from_config(config)?;
    let admin_token = sessions.store().ensure_admin_token()?;
    let (job, user) = job_owner(config)?;

    let path = token_file_path(&user.dir, &job.job_id);
    let token = read_token_file(&path)?;

    let cleaned = sessions
        .clean(&admin_token, &token)
        .with_context(|| format!("Failed to clean job {}", job.job_id))?;

    std::fs::remove_file(&path)
        .with_context(|| format!("Failed to remove token file {}", path.display()))?;

    info!(
        "job_id={} cgroups_cleaned={} Job cleaned",
        job.job_id, cleaned
    );
    Ok(())
}
