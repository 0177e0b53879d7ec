// SPDX-License-Identifier: MIT
//! Error kinds shared by every bdocker component.
//!
//! Each variant maps to a stable status code so that whatever sits at the
//! boundary (REST layer, CLI, batch hook) can react programmatically.

use thiserror::Error;

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, BdockerError>;

#[derive(Debug, Error)]
pub enum BdockerError {
    /// Authentication or authorization failure. Never retried.
    #[error("user credentials error: {0}")]
    UserCredentials(String),

    /// Malformed input (missing job field, unparsable value)
    #[error("parse error: {0}")]
    Parse(String),

    /// Batch system or job monitoring failure
    #[error("batch error: {0}")]
    Batch(String),

    /// Control group I/O failure
    #[error("cgroup error: {0}")]
    Cgroup(String),

    /// Missing or invalid static configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Container runtime collaborator failure
    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BdockerError {
    /// Status code exposed at the boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            BdockerError::UserCredentials(_) => 401,
            BdockerError::Parse(_) => 400,
            BdockerError::Batch(_)
            | BdockerError::Cgroup(_)
            | BdockerError::Configuration(_)
            | BdockerError::Runtime(_)
            | BdockerError::Internal(_) => 500,
        }
    }

    /// Stable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            BdockerError::UserCredentials(_) => "UserCredentialsException",
            BdockerError::Parse(_) => "ParseException",
            BdockerError::Batch(_) => "BatchException",
            BdockerError::Cgroup(_) => "CgroupException",
            BdockerError::Configuration(_) => "ConfigurationException",
            BdockerError::Runtime(_) => "DockerException",
            BdockerError::Internal(_) => "InternalException",
        }
    }

    /// Translate a non-2xx answer from a remote bdocker service.
    pub fn from_remote(status: u16, message: &str) -> Self {
        let message = format!("remote returned {}: {}", status, message.trim());
        match status {
            401 => BdockerError::UserCredentials(message),
            400 => BdockerError::Parse(message),
            _ => BdockerError::Internal(message),
        }
    }
}

impl From<serde_yaml::Error> for BdockerError {
    fn from(e: serde_yaml::Error) -> Self {
        BdockerError::Parse(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(BdockerError::UserCredentials("x".into()).status_code(), 401);
        assert_eq!(BdockerError::Parse("x".into()).status_code(), 400);
        assert_eq!(BdockerError::Cgroup("x".into()).status_code(), 500);
        assert_eq!(BdockerError::Configuration("x".into()).status_code(), 500);
    }

    #[test]
    fn test_from_remote() {
        let err = BdockerError::from_remote(401, "bad token\n");
        assert!(matches!(err, BdockerError::UserCredentials(_)));
        assert!(err.to_string().contains("bad token"));

        assert!(matches!(BdockerError::from_remote(400, ""), BdockerError::Parse(_)));

        let err = BdockerError::from_remote(503, "unavailable");
        assert_eq!(err.kind(), "InternalException");
        assert!(err.to_string().contains("503"));
    }
}
