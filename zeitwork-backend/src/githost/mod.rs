mod github;

pub use github::GitHubApp;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitHostError {
    #[error("Webhook signature mismatch")]
    Signature,

    #[error("Repository not found: {0}")]
    NotFound(String),

    #[error("Git host API error: {0}")]
    Api(String),

    #[error("Token issuance failed: {0}")]
    Token(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
}

/// Short-lived token scoped to one repository.
///
/// Handed to the builder to clone; never persisted.
#[derive(Debug, Clone)]
pub struct InstallationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RepositoryInfo {
    pub full_name: String,
    pub default_branch: String,
    pub clone_url: String,
    pub private: bool,
}

#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub sha: String,
}

/// The Git-host integration the control plane consumes.
///
/// Any provider matching this shape is substitutable; tests use a stub.
#[async_trait]
pub trait GitHost: Send + Sync {
    /// Verify an HMAC-SHA256 webhook signature (`sha256=<hex>`) against the
    /// raw request body.
    fn verify_webhook_signature(&self, payload: &[u8], signature: &str) -> bool;

    /// Issue a short-lived installation token scoped to the repository
    async fn installation_token(&self, repository: &str)
        -> Result<InstallationToken, GitHostError>;

    /// Fetch repository metadata
    async fn repository(&self, repository: &str) -> Result<RepositoryInfo, GitHostError>;

    /// Resolve the head commit of a branch
    async fn branch_head(&self, repository: &str, branch: &str)
        -> Result<CommitInfo, GitHostError>;
}
