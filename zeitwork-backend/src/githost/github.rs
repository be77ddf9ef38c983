use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use super::{CommitInfo, GitHost, GitHostError, InstallationToken, RepositoryInfo};
use crate::settings::GitHubSettings;

type HmacSha256 = Hmac<Sha256>;

/// GitHub App implementation of the git-host integration.
///
/// Authenticates as the App with a short-lived RS256 JWT, then exchanges it
/// for per-installation access tokens scoped to a single repository.
pub struct GitHubApp {
    app_id: String,
    private_key_pem: String,
    webhook_secret: String,
    api_url: String,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Deserialize)]
struct InstallationResponse {
    id: u64,
}

#[derive(Deserialize)]
struct AccessTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RepoResponse {
    full_name: String,
    default_branch: String,
    clone_url: String,
    private: bool,
}

#[derive(Deserialize)]
struct BranchResponse {
    commit: BranchCommit,
}

#[derive(Deserialize)]
struct BranchCommit {
    sha: String,
}

impl GitHubApp {
    pub fn new(settings: &GitHubSettings) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("zeitwork-backend")
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            app_id: settings.app_id.clone(),
            private_key_pem: settings.private_key_pem.clone(),
            webhook_secret: settings.webhook_secret.clone(),
            api_url: settings.api_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Mint the App JWT GitHub requires for installation endpoints.
    /// Backdated 60s to absorb clock skew, 9 minute lifetime (max is 10).
    fn app_jwt(&self) -> Result<String, GitHostError> {
        let now = Utc::now();
        let claims = AppClaims {
            iat: (now - Duration::seconds(60)).timestamp(),
            exp: (now + Duration::minutes(9)).timestamp(),
            iss: self.app_id.clone(),
        };

        let key = EncodingKey::from_rsa_pem(self.private_key_pem.as_bytes())
            .map_err(|e| GitHostError::Token(format!("invalid app private key: {}", e)))?;

        encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| GitHostError::Token(format!("failed to sign app JWT: {}", e)))
    }

    async fn installation_id(&self, repository: &str) -> Result<u64, GitHostError> {
        let jwt = self.app_jwt()?;
        let url = format!("{}/repos/{}/installation", self.api_url, repository);

        let response = self
            .http
            .get(&url)
            .bearer_auth(jwt)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(GitHostError::NotFound(repository.to_string()));
        }
        if !response.status().is_success() {
            return Err(GitHostError::Api(format!(
                "installation lookup returned {}",
                response.status()
            )));
        }

        let installation: InstallationResponse = response.json().await?;
        Ok(installation.id)
    }
}

#[async_trait]
impl GitHost for GitHubApp {
    fn verify_webhook_signature(&self, payload: &[u8], signature: &str) -> bool {
        let Some(hex_digest) = signature.strip_prefix("sha256=") else {
            return false;
        };
        let Ok(expected) = hex::decode(hex_digest) else {
            return false;
        };

        let mut mac = match HmacSha256::new_from_slice(self.webhook_secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(payload);
        mac.verify_slice(&expected).is_ok()
    }

    async fn installation_token(
        &self,
        repository: &str,
    ) -> Result<InstallationToken, GitHostError> {
        let installation_id = self.installation_id(repository).await?;
        let jwt = self.app_jwt()?;

        let repo_name = repository.split('/').next_back().unwrap_or(repository);
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_url, installation_id
        );

        debug!("Requesting installation token for {}", repository);

        let response = self
            .http
            .post(&url)
            .bearer_auth(jwt)
            .header("Accept", "application/vnd.github+json")
            .json(&serde_json::json!({ "repositories": [repo_name] }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(GitHostError::Token(format!(
                "token issuance returned {}",
                response.status()
            )));
        }

        let token: AccessTokenResponse = response.json().await?;
        Ok(InstallationToken {
            token: token.token,
            expires_at: token.expires_at,
        })
    }

    async fn repository(&self, repository: &str) -> Result<RepositoryInfo, GitHostError> {
        let token = self.installation_token(repository).await?;
        let url = format!("{}/repos/{}", self.api_url, repository);

        let response = self
            .http
            .get(&url)
            .bearer_auth(&token.token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(GitHostError::NotFound(repository.to_string()));
        }
        if !response.status().is_success() {
            return Err(GitHostError::Api(format!(
                "repository lookup returned {}",
                response.status()
            )));
        }

        let repo: RepoResponse = response.json().await?;
        Ok(RepositoryInfo {
            full_name: repo.full_name,
            default_branch: repo.default_branch,
            clone_url: repo.clone_url,
            private: repo.private,
        })
    }

    async fn branch_head(
        &self,
        repository: &str,
        branch: &str,
    ) -> Result<CommitInfo, GitHostError> {
        let token = self.installation_token(repository).await?;
        let url = format!("{}/repos/{}/branches/{}", self.api_url, repository, branch);

        let response = self
            .http
            .get(&url)
            .bearer_auth(&token.token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(GitHostError::NotFound(format!("{}#{}", repository, branch)));
        }
        if !response.status().is_success() {
            return Err(GitHostError::Api(format!(
                "branch lookup returned {}",
                response.status()
            )));
        }

        let branch: BranchResponse = response.json().await?;
        Ok(CommitInfo {
            sha: branch.commit.sha,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::GitHubSettings;

    fn test_app() -> GitHubApp {
        GitHubApp::new(&GitHubSettings {
            app_id: "12345".to_string(),
            private_key_pem: "unused".to_string(),
            webhook_secret: "It's a Secret to Everybody".to_string(),
            api_url: "https://api.github.com".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_verify_webhook_signature_known_vector() {
        // Published GitHub webhook documentation example
        let app = test_app();
        let payload = b"Hello, World!";
        let signature =
            "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17";
        assert!(app.verify_webhook_signature(payload, signature));
    }

    #[test]
    fn test_verify_webhook_signature_rejects_tampered_payload() {
        let app = test_app();
        let signature =
            "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17";
        assert!(!app.verify_webhook_signature(b"Hello, World?", signature));
    }

    #[test]
    fn test_verify_webhook_signature_rejects_malformed_header() {
        let app = test_app();
        assert!(!app.verify_webhook_signature(b"body", "sha1=deadbeef"));
        assert!(!app.verify_webhook_signature(b"body", "sha256=nothex"));
        assert!(!app.verify_webhook_signature(b"body", ""));
    }
}
