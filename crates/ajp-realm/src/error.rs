// SPDX-License-Identifier: AGPL-3.0-only
use thiserror::Error;

/// Failures reported by a directory connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    /// The connection broke; the realm closes it and retries once.
    #[error("directory communication failure: {0}")]
    Communication(String),
    #[error("directory service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("invalid directory credentials")]
    InvalidCredentials,
    #[error("directory name not found: {0}")]
    NameNotFound(String),
    #[error("directory error: {0}")]
    Naming(String),
}

impl DirectoryError {
    /// Whether the realm should reopen the connection and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DirectoryError::Communication(_) | DirectoryError::ServiceUnavailable(_)
        )
    }
}

/// Outcome of a failed login module run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoginError {
    #[error("login failed")]
    Failed,
    #[error("account expired")]
    AccountExpired,
    #[error("credential expired")]
    CredentialExpired,
    #[error("login configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Error)]
pub enum RealmError {
    #[error("realm {realm} failed to start: {reason}")]
    Start { realm: String, reason: String },
    #[error("users file {path}: {source}")]
    UsersFile {
        path: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}
