// SPDX-License-Identifier: MIT
//! Session token hand-off file in the job owner's home.
//!
//! The home directory belongs to the job user, so nothing here follows a
//! symlink at the token path: writes go through a fresh temp file that is
//! renamed over the path, and reads refuse a link.

use anyhow::{bail, Context, Result};
use nix::libc;
use nix::unistd::{fchown, Gid, Uid};
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub fn token_file_path(home: &Path, job_id: &str) -> PathBuf {
    home.join(format!(".bdocker_token_{}", job_id))
}

/// Write `token` readable by its owner only.
///
/// The temp file is created 0600 with `O_EXCL` and chowned through its
/// descriptor before it replaces `path`.
pub fn write_token_file(path: &Path, token: &str, owner: Option<(Uid, Gid)>) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("Token file {} has no parent directory", path.display()))?;
    let mut temp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create token file in {}", dir.display()))?;

    writeln!(temp, "{}", token)
        .and_then(|_| temp.flush())
        .with_context(|| format!("Failed to write token file {}", path.display()))?;

    if let Some((uid, gid)) = owner {
        fchown(temp.as_file().as_raw_fd(), Some(uid), Some(gid))
            .with_context(|| format!("Failed to chown token file {} to {}", path.display(), uid))?;
    }

    temp.persist(path)
        .with_context(|| format!("Failed to install token file {}", path.display()))?;
    Ok(())
}

pub fn read_token_file(path: &Path) -> Result<String> {
    let mut content = String::new();
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path)
        .and_then(|mut file| file.read_to_string(&mut content))
        .with_context(|| format!("Failed to read token file {}", path.display()))?;

    let token = content.trim();
    if token.is_empty() {
        bail!("Token file {} is empty", path.display());
    }
    Ok(token.to_string())
}
