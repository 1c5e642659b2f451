//! Push delivery through Firebase Cloud Messaging (HTTP v1 API).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::FcmConfig;
use crate::error::ServiceError;

/// Who receives a push message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushTarget {
    Tokens(Vec<String>),
    Topic(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    pub data: HashMap<String, String>,
}

/// Per-call delivery counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PushReport {
    pub sent: usize,
    pub failed: usize,
    /// Tokens the gateway reported as unregistered.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub invalid_tokens: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("Failed to parse credentials: {0}")]
    Credentials(String),

    #[error("Failed to create JWT: {0}")]
    Jwt(String),

    #[error("Failed to get access token: {0}")]
    Token(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("FCM API error: {0}")]
    Api(String),

    #[error("Invalid FCM token")]
    InvalidToken,

    #[error("push delivery is not configured")]
    NotEnabled,
}

impl From<PushError> for ServiceError {
    fn from(err: PushError) -> Self {
        ServiceError::dependency("push", err)
    }
}

#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn send(&self, target: &PushTarget, message: &PushMessage)
        -> Result<PushReport, PushError>;
}

/// Gateway used when no FCM credentials are configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledPush;

#[async_trait]
impl PushGateway for DisabledPush {
    async fn send(&self, _: &PushTarget, _: &PushMessage) -> Result<PushReport, PushError> {
        Err(PushError::NotEnabled)
    }
}

/// FCM client using a Google service account.
pub struct FcmClient {
    client: reqwest::Client,
    config: FcmConfig,
    credentials: ServiceAccountCredentials,
    token_cache: RwLock<Option<CachedToken>>,
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Debug, Clone, Deserialize)]
struct ServiceAccountCredentials {
    client_email: String,
    private_key: String,
    token_uri: String,
}

#[derive(Debug, Serialize)]
struct JwtClaims {
    iss: String,
    scope: String,
    aud: String,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Serialize)]
struct FcmMessage<'a> {
    message: MessagePayload<'a>,
}

#[derive(Debug, Serialize)]
struct MessagePayload<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    topic: Option<&'a str>,
    notification: NotificationBody<'a>,
    data: &'a HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct NotificationBody<'a> {
    title: &'a str,
    body: &'a str,
}

impl FcmClient {
    pub fn new(config: FcmConfig, timeout: Duration) -> Result<Self, PushError> {
        let credentials = Self::load_credentials(&config.credentials)?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            config,
            credentials,
            token_cache: RwLock::new(None),
        })
    }

    /// Credentials are either inline JSON or a path to the service account file.
    fn load_credentials(source: &str) -> Result<ServiceAccountCredentials, PushError> {
        if source.trim().starts_with('{') {
            serde_json::from_str(source)
                .map_err(|e| PushError::Credentials(format!("Invalid JSON: {}", e)))
        } else {
            let content = std::fs::read_to_string(source).map_err(|e| {
                PushError::Credentials(format!("Failed to read credentials file: {}", e))
            })?;
            serde_json::from_str(&content)
                .map_err(|e| PushError::Credentials(format!("Invalid credentials JSON: {}", e)))
        }
    }

    async fn access_token(&self) -> Result<String, PushError> {
        {
            let cache = self.token_cache.read().await;
            if let Some(token) = cache.as_ref() {
                if token.expires_at > Instant::now() + Duration::from_secs(60) {
                    return Ok(token.access_token.clone());
                }
            }
        }

        let (access_token, expires_at) = self.fetch_access_token().await?;
        *self.token_cache.write().await = Some(CachedToken {
            access_token: access_token.clone(),
            expires_at,
        });

        Ok(access_token)
    }

    async fn fetch_access_token(&self) -> Result<(String, Instant), PushError> {
        let now = Utc::now().timestamp();
        let claims = JwtClaims {
            iss: self.credentials.client_email.clone(),
            scope: "https://www.googleapis.com/auth/firebase.messaging".to_string(),
            aud: self.credentials.token_uri.clone(),
            iat: now,
            exp: now + 3600,
        };

        let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);
        let encoding_key =
            jsonwebtoken::EncodingKey::from_rsa_pem(self.credentials.private_key.as_bytes())
                .map_err(|e| PushError::Jwt(format!("Invalid private key: {}", e)))?;
        let jwt = jsonwebtoken::encode(&header, &claims, &encoding_key)
            .map_err(|e| PushError::Jwt(e.to_string()))?;

        let response = self
            .client
            .post(&self.credentials.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", jwt.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(PushError::Token(format!("Token exchange failed: {}", error_text)));
        }

        let token: TokenResponse = response.json().await?;
        let expires_at = Instant::now() + Duration::from_secs(token.expires_in);
        Ok((token.access_token, expires_at))
    }

    async fn send_one(
        &self,
        access_token: &str,
        payload: MessagePayload<'_>,
    ) -> Result<(), PushError> {
        let url = format!(
            "https://fcm.googleapis.com/v1/projects/{}/messages:send",
            self.config.project_id
        );
        let message = FcmMessage { message: payload };

        let mut last_error = None;
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(retry_delay(attempt)).await;
            }

            let response = match self
                .client
                .post(&url)
                .bearer_auth(access_token)
                .json(&message)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    last_error = Some(PushError::Http(e));
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return Ok(());
            }

            let error_text = response.text().await.unwrap_or_default();
            if status.as_u16() == 404 || status.as_u16() == 400 {
                if error_text.contains("UNREGISTERED") || error_text.contains("INVALID_ARGUMENT") {
                    return Err(PushError::InvalidToken);
                }
                return Err(PushError::Api(error_text));
            }
            if status.is_server_error() {
                last_error = Some(PushError::Api(error_text));
                continue;
            }
            return Err(PushError::Api(error_text));
        }

        Err(last_error.unwrap_or_else(|| PushError::Api("Unknown error".to_string())))
    }
}

#[async_trait]
impl PushGateway for FcmClient {
    async fn send(
        &self,
        target: &PushTarget,
        message: &PushMessage,
    ) -> Result<PushReport, PushError> {
        let access_token = self.access_token().await?;
        let notification = || NotificationBody {
            title: &message.title,
            body: &message.body,
        };

        let mut report = PushReport::default();
        match target {
            PushTarget::Topic(topic) => {
                let payload = MessagePayload {
                    token: None,
                    topic: Some(topic.as_str()),
                    notification: notification(),
                    data: &message.data,
                };
                self.send_one(&access_token, payload).await?;
                report.sent = 1;
            }
            PushTarget::Tokens(tokens) => {
                for token in tokens {
                    let payload = MessagePayload {
                        token: Some(token.as_str()),
                        topic: None,
                        notification: notification(),
                        data: &message.data,
                    };
                    match self.send_one(&access_token, payload).await {
                        Ok(()) => report.sent += 1,
                        Err(PushError::InvalidToken) => {
                            log::warn!("FCM token rejected as unregistered");
                            report.failed += 1;
                            report.invalid_tokens.push(token.clone());
                        }
                        Err(e) => {
                            log::warn!("FCM delivery failed: {e}");
                            report.failed += 1;
                        }
                    }
                }
            }
        }

        Ok(report)
    }
}

/// 100ms, 200ms, 400ms, ... capped at 30s.
fn retry_delay(attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    Duration::from_millis(100u64.saturating_mul(factor).min(30_000))
}
