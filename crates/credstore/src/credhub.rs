//! CredHub v1 API client authenticated through UAA client credentials.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use charter_core::Value;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{value_text, CredStore, Permission};

/// Tokens this close to expiry are refreshed before use.
const TOKEN_SLACK: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredHubConfig {
    pub url: String,
    pub uaa_url: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expiry")]
    expires_in: u64,
}

fn default_expiry() -> u64 { 300 }

#[derive(Debug, Deserialize)]
struct DataResponse {
    data: Vec<DataEntry>,
}

#[derive(Debug, Deserialize)]
struct DataEntry {
    value: Value,
}

#[derive(Debug, Serialize)]
struct SetRequest<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    value: &'a Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct PermissionsBody {
    credential_name: String,
    #[serde(default)]
    permissions: Vec<Permission>,
}

struct CachedToken {
    value: String,
    expires: Instant,
}

pub struct CredHubStore {
    http: reqwest::Client,
    config: CredHubConfig,
    token: Mutex<Option<CachedToken>>,
}

impl CredHubStore {
    pub fn new(config: CredHubConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.skip_tls_verify)
            .timeout(Duration::from_secs(30))
            .build()
            .context("building credhub http client")?;
        Ok(Self { http, config, token: Mutex::new(None) })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.url.trim_end_matches('/'), path)
    }

    /// Actor the broker itself authenticates as; never revoked.
    fn own_actor(&self) -> String { format!("uaa-client:{}", self.config.client_id) }

    async fn bearer(&self) -> Result<String> {
        let mut guard = self.token.lock().await;
        if let Some(t) = guard.as_ref() {
            if t.expires > Instant::now() + TOKEN_SLACK {
                return Ok(t.value.clone());
            }
        }
        let url = format!("{}/oauth/token", self.config.uaa_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[("grant_type", "client_credentials"), ("response_type", "token")])
            .send()
            .await
            .with_context(|| format!("requesting token from {}", url))?
            .error_for_status()
            .context("uaa token request rejected")?;
        let token: TokenResponse = resp.json().await.context("decoding uaa token")?;
        debug!(expires_in = token.expires_in, "credhub token refreshed");
        let value = token.access_token.clone();
        *guard = Some(CachedToken {
            value: token.access_token,
            expires: Instant::now() + Duration::from_secs(token.expires_in),
        });
        Ok(value)
    }
}

#[async_trait::async_trait]
impl CredStore for CredHubStore {
    async fn get(&self, path: &str) -> Result<String> {
        let token = self.bearer().await?;
        let resp = self
            .http
            .get(self.endpoint("/api/v1/data"))
            .bearer_auth(token)
            .query(&[("name", path), ("current", "true")])
            .send()
            .await
            .with_context(|| format!("reading credential {}", path))?
            .error_for_status()
            .with_context(|| format!("reading credential {}", path))?;
        let body: DataResponse = resp.json().await.context("decoding credential")?;
        let entry = body.data.into_iter().next().ok_or_else(|| anyhow!("credential {} has no value", path))?;
        value_text(&entry.value)
    }

    async fn put(&self, path: &str, value: &Value) -> Result<()> {
        let token = self.bearer().await?;
        self.http
            .put(self.endpoint("/api/v1/data"))
            .bearer_auth(token)
            .json(&SetRequest { name: path, kind: "json", value })
            .send()
            .await
            .with_context(|| format!("writing credential {}", path))?
            .error_for_status()
            .with_context(|| format!("writing credential {}", path))?;
        metrics::counter!("credstore_put_total", 1u64);
        info!(path = %path, "credential stored");
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let token = self.bearer().await?;
        self.http
            .delete(self.endpoint("/api/v1/data"))
            .bearer_auth(token)
            .query(&[("name", path)])
            .send()
            .await
            .with_context(|| format!("deleting credential {}", path))?
            .error_for_status()
            .with_context(|| format!("deleting credential {}", path))?;
        info!(path = %path, "credential deleted");
        Ok(())
    }

    async fn add_permission(&self, path: &str, actor: &str, operations: &[&str]) -> Result<()> {
        let token = self.bearer().await?;
        let body = PermissionsBody {
            credential_name: path.to_string(),
            permissions: vec![Permission {
                actor: actor.to_string(),
                operations: operations.iter().map(|o| o.to_string()).collect(),
            }],
        };
        self.http
            .post(self.endpoint("/api/v1/permissions"))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("granting {} on {}", actor, path))?
            .error_for_status()
            .with_context(|| format!("granting {} on {}", actor, path))?;
        debug!(path = %path, actor = %actor, "permission granted");
        Ok(())
    }

    async fn delete_permission(&self, path: &str) -> Result<()> {
        let token = self.bearer().await?;
        let current: PermissionsBody = self
            .http
            .get(self.endpoint("/api/v1/permissions"))
            .bearer_auth(&token)
            .query(&[("credential_name", path)])
            .send()
            .await
            .with_context(|| format!("listing permissions on {}", path))?
            .error_for_status()
            .with_context(|| format!("listing permissions on {}", path))?
            .json()
            .await
            .context("decoding permissions")?;
        let own = self.own_actor();
        for p in current.permissions.iter().filter(|p| p.actor != own) {
            self.http
                .delete(self.endpoint("/api/v1/permissions"))
                .bearer_auth(&token)
                .query(&[("credential_name", path), ("actor", p.actor.as_str())])
                .send()
                .await
                .with_context(|| format!("revoking {} on {}", p.actor, path))?
                .error_for_status()
                .with_context(|| format!("revoking {} on {}", p.actor, path))?;
            debug!(path = %path, actor = %p.actor, "permission revoked");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CredHubStore {
        CredHubStore::new(CredHubConfig {
            url: "https://credhub.example:8844/".into(),
            uaa_url: "https://uaa.example".into(),
            client_id: "charter".into(),
            client_secret: "s3cret".into(),
            skip_tls_verify: false,
        })
        .unwrap()
    }

    #[test]
    fn endpoints_join_without_double_slash() {
        assert_eq!(store().endpoint("/api/v1/data"), "https://credhub.example:8844/api/v1/data");
    }

    #[test]
    fn own_actor_is_the_uaa_client() {
        assert_eq!(store().own_actor(), "uaa-client:charter");
    }

    #[test]
    fn decodes_data_responses() {
        let body: DataResponse =
            serde_json::from_str(r#"{"data":[{"type":"json","name":"/c/x","value":{"a":1}}]}"#).unwrap();
        assert_eq!(value_text(&body.data[0].value).unwrap(), r#"{"a":1}"#);
        let body: DataResponse = serde_json::from_str(r#"{"data":[{"type":"value","value":"plain"}]}"#).unwrap();
        assert_eq!(value_text(&body.data[0].value).unwrap(), "plain");
    }

    #[test]
    fn set_request_is_typed_json() {
        let v = Value::Map(Default::default());
        let body = serde_json::to_value(SetRequest { name: "/c/x", kind: "json", value: &v }).unwrap();
        assert_eq!(body, serde_json::json!({"name": "/c/x", "type": "json", "value": {}}));
    }
}
