//! Credentials and access tokens for the REST backend.
//!
//! Supported credential files:
//! - `authorized_user` JSON (client id/secret + refresh token), exchanged for
//!   an access token at the token endpoint
//! - a JSON file holding a ready `access_token`, as minted by a sidecar or by
//!   `gcloud auth print-access-token`
//!
//! Tokens are cached until shortly before they expire.

use crate::errors::{CloudError, CloudResult};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::debug;

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq)]
pub enum Credentials {
    AuthorizedUser {
        client_id: String,
        client_secret: String,
        refresh_token: String,
        token_uri: String,
        quota_project_id: Option<String>,
    },
    AccessToken {
        access_token: String,
        project_id: Option<String>,
    },
}

#[derive(Deserialize)]
struct RawCredentials {
    #[serde(rename = "type")]
    kind: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    refresh_token: Option<String>,
    token_uri: Option<String>,
    access_token: Option<String>,
    project_id: Option<String>,
    quota_project_id: Option<String>,
}

impl Credentials {
    pub async fn from_file(path: impl AsRef<Path>) -> CloudResult<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|err| {
            CloudError::Auth(format!("reading credentials {}: {}", path.display(), err))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> CloudResult<Self> {
        let parsed: RawCredentials = serde_json::from_str(raw)
            .map_err(|err| CloudError::Auth(format!("malformed credentials: {}", err)))?;

        if let Some(access_token) = parsed.access_token.filter(|t| !t.is_empty()) {
            return Ok(Credentials::AccessToken {
                access_token,
                project_id: parsed.project_id.or(parsed.quota_project_id),
            });
        }

        match parsed.kind.as_deref() {
            Some("authorized_user") => {
                let field = |value: Option<String>, name: &str| {
                    value
                        .filter(|v| !v.is_empty())
                        .ok_or_else(|| CloudError::Auth(format!("authorized_user credentials lack `{}`", name)))
                };
                Ok(Credentials::AuthorizedUser {
                    client_id: field(parsed.client_id, "client_id")?,
                    client_secret: field(parsed.client_secret, "client_secret")?,
                    refresh_token: field(parsed.refresh_token, "refresh_token")?,
                    token_uri: parsed
                        .token_uri
                        .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
                    quota_project_id: parsed.quota_project_id,
                })
            }
            Some(other) => Err(CloudError::Auth(format!(
                "credential type `{}` is not supported; provide authorized_user credentials or an access token",
                other
            ))),
            None => Err(CloudError::Auth(
                "credentials carry neither a type nor an access_token".into(),
            )),
        }
    }

    /// Project named by the credentials, if any.
    pub fn project_id(&self) -> Option<&str> {
        match self {
            Credentials::AuthorizedUser {
                quota_project_id, ..
            } => quota_project_id.as_deref(),
            Credentials::AccessToken { project_id, .. } => project_id.as_deref(),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .is_none_or(|at| now + Duration::seconds(EXPIRY_MARGIN_SECS) < at)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
}

pub struct TokenSource {
    http: reqwest::Client,
    credentials: Credentials,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenSource {
    pub fn new(http: reqwest::Client, credentials: Credentials) -> Self {
        Self {
            http,
            credentials,
            cached: Mutex::new(None),
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// A valid bearer token, refreshed when the cached one is about to expire.
    pub async fn token(&self) -> CloudResult<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh(Utc::now())) {
            return Ok(token.value.clone());
        }
        let fresh = self.fetch().await?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }

    async fn fetch(&self) -> CloudResult<CachedToken> {
        match &self.credentials {
            Credentials::AccessToken { access_token, .. } => Ok(CachedToken {
                value: access_token.clone(),
                expires_at: None,
            }),
            Credentials::AuthorizedUser {
                client_id,
                client_secret,
                refresh_token,
                token_uri,
                ..
            } => {
                debug!(%token_uri, "refreshing access token");
                let resp = self
                    .http
                    .post(token_uri)
                    .form(&[
                        ("grant_type", "refresh_token"),
                        ("client_id", client_id.as_str()),
                        ("client_secret", client_secret.as_str()),
                        ("refresh_token", refresh_token.as_str()),
                    ])
                    .send()
                    .await
                    .map_err(|err| CloudError::Auth(format!("token endpoint unreachable: {}", err)))?;
                let status = resp.status();
                if !status.is_success() {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(CloudError::Auth(format!(
                        "token refresh rejected with {}: {}",
                        status, body
                    )));
                }
                let token: TokenResponse = resp
                    .json()
                    .await
                    .map_err(|err| CloudError::Auth(format!("malformed token response: {}", err)))?;
                Ok(CachedToken {
                    value: token.access_token,
                    expires_at: token
                        .expires_in
                        .map(|secs| Utc::now() + Duration::seconds(secs)),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorized_user_credentials_parse() {
        let creds = Credentials::from_json(
            r#"{"type":"authorized_user","client_id":"id","client_secret":"secret",
                "refresh_token":"rt","quota_project_id":"proj"}"#,
        )
        .unwrap();
        assert_eq!(creds.project_id(), Some("proj"));
        assert!(matches!(
            creds,
            Credentials::AuthorizedUser { ref token_uri, .. } if token_uri == DEFAULT_TOKEN_URI
        ));
    }

    #[test]
    fn access_token_file_wins_over_type() {
        let creds =
            Credentials::from_json(r#"{"access_token":"ya29.x","project_id":"p"}"#).unwrap();
        assert_eq!(
            creds,
            Credentials::AccessToken {
                access_token: "ya29.x".into(),
                project_id: Some("p".into())
            }
        );
    }

    #[test]
    fn service_account_keys_are_rejected_as_auth_errors() {
        let err = Credentials::from_json(r#"{"type":"service_account","private_key":"k"}"#)
            .unwrap_err();
        assert!(matches!(err, CloudError::Auth(msg) if msg.contains("service_account")));
    }

    #[test]
    fn missing_refresh_token_is_reported() {
        let err =
            Credentials::from_json(r#"{"type":"authorized_user","client_id":"a","client_secret":"b"}"#)
                .unwrap_err();
        assert!(matches!(err, CloudError::Auth(msg) if msg.contains("refresh_token")));
    }

    #[tokio::test]
    async fn static_token_is_served_from_cache() {
        let source = TokenSource::new(
            reqwest::Client::new(),
            Credentials::AccessToken {
                access_token: "tok".into(),
                project_id: None,
            },
        );
        assert_eq!(source.token().await.unwrap(), "tok");
        assert_eq!(source.token().await.unwrap(), "tok");
    }

    #[test]
    fn tokens_expire_with_margin() {
        let now = Utc::now();
        let token = CachedToken {
            value: "t".into(),
            expires_at: Some(now + Duration::seconds(30)),
        };
        assert!(!token.is_fresh(now));
        let token = CachedToken {
            value: "t".into(),
            expires_at: Some(now + Duration::seconds(3600)),
        };
        assert!(token.is_fresh(now));
    }
}
