//! BambuLab cloud account API: login, e-mail code verification and the
//! latest print task summary shown next to the live status.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Number};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::persistence::TokenInfo;

pub const DEFAULT_API_BASE: &str = "https://api.bambulab.com";

const LOGIN_PATH: &str = "/v1/user-service/user/login";
const SEND_CODE_PATH: &str = "/v1/user-service/user/sendemail/code";
const TASKS_PATH: &str = "/v1/user-service/my/tasks";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    #[error("Cloud API returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Cloud API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid cloud API response: {0}")]
    InvalidResponse(String),
}

/// Tokens handed out by a successful login.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}

impl TokenGrant {
    pub fn into_token(self, issued_at: DateTime<Utc>) -> TokenInfo {
        TokenInfo::issued(
            self.access_token,
            self.refresh_token,
            self.expires_in,
            issued_at,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Authenticated(TokenGrant),
    /// A code was e-mailed to the account; finish with `verify`.
    VerificationRequired,
    /// Any other login type, two-factor included.
    Rejected,
}

/// Most recent print task of the account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSummary {
    pub image_url: String,
    pub model_title: String,
    pub model_weight: Number,
    pub model_cost_time: Number,
    pub total_prints: u64,
}

#[async_trait]
pub trait CloudApi: Send + Sync {
    async fn login(&self, account: &str, password: &str) -> Result<LoginOutcome, CloudError>;

    async fn verify(&self, account: &str, code: &str) -> Result<TokenGrant, CloudError>;

    async fn latest_task(&self, access_token: &str) -> Result<ModelSummary, CloudError>;
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    expires_in: i64,
    #[serde(default)]
    login_type: Option<String>,
}

impl LoginResponse {
    fn grant(self) -> TokenGrant {
        TokenGrant {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_in: self.expires_in,
        }
    }
}

enum LoginStep {
    Granted(TokenGrant),
    SendCode,
    Rejected,
}

fn login_step(response: LoginResponse) -> LoginStep {
    if response.success {
        return LoginStep::Granted(response.grant());
    }
    match response.login_type.as_deref() {
        Some("verifyCode") => LoginStep::SendCode,
        _ => LoginStep::Rejected,
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskHit {
    #[serde(default)]
    cover: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    weight: Option<Number>,
    #[serde(default)]
    cost_time: Option<Number>,
}

#[derive(Debug, Default, Deserialize)]
struct TasksResponse {
    #[serde(default)]
    hits: Vec<TaskHit>,
    #[serde(default)]
    total: Option<u64>,
}

fn summarize(tasks: TasksResponse) -> ModelSummary {
    let hit = tasks.hits.into_iter().next().unwrap_or_default();
    ModelSummary {
        image_url: hit.cover.unwrap_or_default(),
        model_title: hit.title.unwrap_or_default(),
        model_weight: hit.weight.unwrap_or_else(|| Number::from(0)),
        model_cost_time: hit.cost_time.unwrap_or_else(|| Number::from(0)),
        total_prints: tasks.total.unwrap_or(0),
    }
}

/// reqwest client for the public cloud API.
#[derive(Debug, Clone)]
pub struct BambuCloud {
    client: reqwest::Client,
    base_url: String,
}

impl BambuCloud {
    pub fn new(base_url: impl Into<String>) -> Result<Self, CloudError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("deskrelay/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();

        Ok(Self { client, base_url })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send_login_code(&self, account: &str) -> Result<(), CloudError> {
        let response = self
            .client
            .post(self.url(SEND_CODE_PATH))
            .json(&json!({ "email": account, "type": "codeLogin" }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            warn!("Sending login code failed with {}", status);
            return Err(CloudError::Upstream { status, body });
        }
        Ok(())
    }
}

#[async_trait]
impl CloudApi for BambuCloud {
    async fn login(&self, account: &str, password: &str) -> Result<LoginOutcome, CloudError> {
        let response = self
            .client
            .post(self.url(LOGIN_PATH))
            .json(&json!({ "account": account, "password": password, "apiError": "" }))
            .send()
            .await?;
        debug!("Login answered {}", response.status());

        let parsed: LoginResponse = response
            .json()
            .await
            .map_err(|e| CloudError::InvalidResponse(format!("login: {}", e)))?;

        match login_step(parsed) {
            LoginStep::Granted(grant) => {
                info!("Cloud login succeeded");
                Ok(LoginOutcome::Authenticated(grant))
            }
            LoginStep::SendCode => {
                self.send_login_code(account).await?;
                info!("Cloud login needs an e-mailed verification code");
                Ok(LoginOutcome::VerificationRequired)
            }
            LoginStep::Rejected => {
                warn!("Cloud login rejected");
                Ok(LoginOutcome::Rejected)
            }
        }
    }

    async fn verify(&self, account: &str, code: &str) -> Result<TokenGrant, CloudError> {
        let response = self
            .client
            .post(self.url(LOGIN_PATH))
            .json(&json!({ "account": account, "code": code }))
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CloudError::VerificationFailed(body));
        }

        let parsed: LoginResponse = response
            .json()
            .await
            .map_err(|e| CloudError::InvalidResponse(format!("verify: {}", e)))?;
        Ok(parsed.grant())
    }

    async fn latest_task(&self, access_token: &str) -> Result<ModelSummary, CloudError> {
        let response = self
            .client
            .get(self.url(TASKS_PATH))
            .bearer_auth(access_token)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(CloudError::Upstream { status, body });
        }

        let tasks: TasksResponse = response
            .json()
            .await
            .map_err(|e| CloudError::InvalidResponse(format!("tasks: {}", e)))?;
        Ok(summarize(tasks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn successful_login_grants_tokens() {
        let response: LoginResponse = serde_json::from_value(json!({
            "success": true,
            "accessToken": "abc",
            "refreshToken": "def",
            "expiresIn": 7776000
        }))
        .unwrap();

        match login_step(response) {
            LoginStep::Granted(grant) => {
                assert_eq!(grant.access_token, "abc");
                assert_eq!(grant.refresh_token, "def");
                assert_eq!(grant.expires_in, 7776000);
            }
            _ => panic!("expected a grant"),
        }
    }

    #[test]
    fn verify_code_login_type_asks_for_code() {
        let response: LoginResponse =
            serde_json::from_value(json!({ "loginType": "verifyCode" })).unwrap();
        assert!(matches!(login_step(response), LoginStep::SendCode));
    }

    #[test]
    fn other_login_types_are_rejected() {
        let response: LoginResponse =
            serde_json::from_value(json!({ "loginType": "tfa", "tfaKey": "x" })).unwrap();
        assert!(matches!(login_step(response), LoginStep::Rejected));
    }

    #[test]
    fn grant_expiry_is_relative_to_issue_time() {
        let issued_at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let token = TokenGrant {
            access_token: "abc".into(),
            refresh_token: "def".into(),
            expires_in: 60,
        }
        .into_token(issued_at);

        assert_eq!(token.token_expiration, 1_700_000_060_000);
    }

    #[test]
    fn summary_uses_first_task() {
        let tasks: TasksResponse = serde_json::from_value(json!({
            "total": 42,
            "hits": [
                { "cover": "https://img/1.png", "title": "Benchy", "weight": 12.5, "costTime": 3600 },
                { "cover": "https://img/2.png", "title": "Older" }
            ]
        }))
        .unwrap();

        let summary = serde_json::to_value(summarize(tasks)).unwrap();
        assert_eq!(
            summary,
            json!({
                "imageUrl": "https://img/1.png",
                "modelTitle": "Benchy",
                "modelWeight": 12.5,
                "modelCostTime": 3600,
                "totalPrints": 42
            })
        );
    }

    #[test]
    fn summary_without_tasks_is_empty() {
        let tasks: TasksResponse = serde_json::from_value(json!({})).unwrap();
        let summary = summarize(tasks);

        assert_eq!(summary.image_url, "");
        assert_eq!(summary.model_title, "");
        assert_eq!(summary.model_weight, Number::from(0));
        assert_eq!(summary.total_prints, 0);
    }

    #[test]
    fn base_url_trailing_slash_is_dropped() {
        let cloud = BambuCloud::new("https://example.test/").unwrap();
        assert_eq!(cloud.url(LOGIN_PATH), "https://example.test/v1/user-service/user/login");
    }
}
