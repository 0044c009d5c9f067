use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::config::FcmConfig;
use crate::error::{AppError, AppResult};
use crate::services::push::{
    BatchResponse, DeliveryErrorCode, EndpointResult, PushMessage, PushTransport,
};

const FCM_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const MAX_CONCURRENT_SENDS: usize = 50;
const TOKEN_REFRESH_MARGIN_SECONDS: i64 = 60;

/// The fields of a Google service-account key file we need.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccount {
    pub project_id: Option<String>,
    pub private_key_id: Option<String>,
    pub private_key: String,
    pub client_email: String,
    pub token_uri: Option<String>,
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    message: FcmMessage<'a>,
}

#[derive(Debug, Serialize)]
struct FcmMessage<'a> {
    token: &'a str,
    notification: FcmNotification<'a>,
    #[serde(skip_serializing_if = "is_empty_map")]
    data: &'a HashMap<String, String>,
}

fn is_empty_map(data: &&HashMap<String, String>) -> bool {
    data.is_empty()
}

#[derive(Debug, Serialize)]
struct FcmNotification<'a> {
    title: &'a str,
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    name: String,
}

/// Firebase Cloud Messaging HTTP v1 transport.
///
/// A multicast is one `messages:send` call per token, run with bounded
/// concurrency; results keep token order.
pub struct FcmTransport {
    client: reqwest::Client,
    project_id: String,
    api_base_url: String,
    account: ServiceAccount,
    signing_key: EncodingKey,
    token: RwLock<Option<CachedToken>>,
}

impl FcmTransport {
    pub fn from_config(config: &FcmConfig) -> AppResult<Self> {
        let raw = std::fs::read_to_string(&config.credentials_path).map_err(|e| {
            AppError::Config(format!(
                "Failed to read service account file {}: {}",
                config.credentials_path, e
            ))
        })?;
        let account: ServiceAccount = serde_json::from_str(&raw)
            .map_err(|e| AppError::Config(format!("Invalid service account file: {}", e)))?;
        Self::new(config, account)
    }

    pub fn new(config: &FcmConfig, account: ServiceAccount) -> AppResult<Self> {
        let project_id = config
            .project_id
            .clone()
            .or_else(|| account.project_id.clone())
            .ok_or_else(|| AppError::Config("FCM project id is not configured".to_string()))?;

        let signing_key = EncodingKey::from_rsa_pem(account.private_key.as_bytes())?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| AppError::Push(format!("Failed to create HTTP client: {}", e)))?;

        tracing::info!(
            "FCM transport initialized for project {} as {}",
            project_id,
            account.client_email
        );

        Ok(Self {
            client,
            project_id,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            account,
            signing_key,
            token: RwLock::new(None),
        })
    }

    /// Transport with a pre-minted access token, for tests against a local server.
    #[cfg(test)]
    fn with_access_token(api_base_url: &str, access_token: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .no_proxy()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap(),
            project_id: "demo".to_string(),
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            account: ServiceAccount {
                project_id: None,
                private_key_id: None,
                private_key: String::new(),
                client_email: "svc@demo.iam.gserviceaccount.com".to_string(),
                token_uri: None,
            },
            signing_key: EncodingKey::from_secret(b"unused"),
            token: RwLock::new(Some(CachedToken {
                value: access_token.to_string(),
                expires_at: Utc::now() + chrono::Duration::hours(1),
            })),
        }
    }

    fn send_url(&self) -> String {
        format!(
            "{}/v1/projects/{}/messages:send",
            self.api_base_url, self.project_id
        )
    }

    /// A valid OAuth2 access token, minted from the service account when the
    /// cached one is missing or about to expire.
    async fn access_token(&self) -> AppResult<String> {
        let now = Utc::now();
        if let Some(cached) = self.token.read().await.as_ref() {
            if cached.expires_at > now + chrono::Duration::seconds(TOKEN_REFRESH_MARGIN_SECONDS) {
                return Ok(cached.value.clone());
            }
        }

        let mut slot = self.token.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(cached) = slot.as_ref() {
            if cached.expires_at > now + chrono::Duration::seconds(TOKEN_REFRESH_MARGIN_SECONDS) {
                return Ok(cached.value.clone());
            }
        }

        let fresh = self.mint_token().await?;
        let value = fresh.value.clone();
        *slot = Some(fresh);
        Ok(value)
    }

    async fn mint_token(&self) -> AppResult<CachedToken> {
        let token_uri = self
            .account
            .token_uri
            .as_deref()
            .unwrap_or(DEFAULT_TOKEN_URI);
        let iat = Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &self.account.client_email,
            scope: FCM_SCOPE,
            aud: token_uri,
            iat,
            exp: iat + 3600,
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.account.private_key_id.clone();
        let assertion = encode(&header, &claims, &self.signing_key)?;

        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer")
            .append_pair("assertion", &assertion)
            .finish();

        let response = self
            .client
            .post(token_uri)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| AppError::Push(format!("Failed to obtain FCM access token: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::Push(format!(
                "Google OAuth2 error ({}): {}",
                status, error_text
            )));
        }

        let token: TokenResponse = response.json().await?;
        tracing::debug!("Minted FCM access token valid for {}s", token.expires_in);

        Ok(CachedToken {
            value: token.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(token.expires_in),
        })
    }

    async fn send_one(&self, access_token: &str, message: &PushMessage, token: &str) -> SendAttempt {
        let request = SendRequest {
            message: FcmMessage {
                token,
                notification: FcmNotification {
                    title: &message.title,
                    body: &message.body,
                },
                data: &message.data,
            },
        };

        let response = match self
            .client
            .post(self.send_url())
            .bearer_auth(access_token)
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let unreachable = e.is_connect() || e.is_timeout();
                return SendAttempt {
                    result: EndpointResult::failed(DeliveryErrorCode::Unknown, e.to_string()),
                    unreachable,
                    unauthenticated: false,
                };
            }
        };

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let result = if status.is_success() {
            match serde_json::from_str::<SendResponse>(&text) {
                Ok(sent) => EndpointResult::Delivered {
                    message_id: sent.name,
                },
                Err(e) => EndpointResult::failed(
                    DeliveryErrorCode::Unknown,
                    format!("Unexpected FCM response: {}", e),
                ),
            }
        } else {
            let (code, message) = classify_error(status.as_u16(), &text);
            EndpointResult::failed(code, message)
        };

        SendAttempt {
            result,
            unreachable: false,
            unauthenticated: status == reqwest::StatusCode::UNAUTHORIZED,
        }
    }
}

struct SendAttempt {
    result: EndpointResult,
    unreachable: bool,
    unauthenticated: bool,
}

#[async_trait]
impl PushTransport for FcmTransport {
    async fn send_multicast(
        &self,
        message: &PushMessage,
        tokens: &[String],
    ) -> AppResult<BatchResponse> {
        if tokens.is_empty() {
            return Ok(BatchResponse::default());
        }

        let access_token = self.access_token().await?;

        let sends: Vec<_> = tokens
            .iter()
            .map(|token| self.send_one(&access_token, message, token))
            .collect();
        let attempts: Vec<SendAttempt> = stream::iter(sends)
            .buffered(MAX_CONCURRENT_SENDS)
            .collect()
            .await;

        if attempts.iter().any(|a| a.unauthenticated) {
            tracing::warn!("FCM rejected the cached access token; it will be minted again");
            *self.token.write().await = None;
        }

        // Nothing got through at all: the provider is down, not the devices.
        if attempts.iter().all(|a| a.unreachable) {
            let detail = match attempts.first().map(|a| &a.result) {
                Some(EndpointResult::Failed(failure)) => failure.message.clone(),
                _ => String::new(),
            };
            return Err(AppError::Push(format!("FCM unreachable: {}", detail)));
        }

        Ok(BatchResponse {
            responses: attempts.into_iter().map(|a| a.result).collect(),
        })
    }
}

/// Map an FCM v1 error response to a delivery error code and message.
///
/// The `FcmError` detail's `errorCode` wins over the generic RPC `status`;
/// the HTTP status is the fallback when the body is not the expected shape.
/// Only `UNREGISTERED` or a token-related `INVALID_ARGUMENT` mark a token as
/// permanently invalid; a bare `NOT_FOUND` or 404 usually means a wrong URL
/// or project and stays `Unknown`.
pub fn classify_error(http_status: u16, body: &str) -> (DeliveryErrorCode, String) {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let error = parsed.as_ref().and_then(|v| v.get("error"));

    let message = error
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("FCM error ({}): {}", http_status, body));

    let fcm_code = error
        .and_then(|e| e.get("details"))
        .and_then(Value::as_array)
        .and_then(|details| {
            details.iter().find_map(|d| {
                let is_fcm_error = d
                    .get("@type")
                    .and_then(Value::as_str)
                    .map(|t| t.ends_with("google.firebase.fcm.v1.FcmError"))
                    .unwrap_or(false);
                if is_fcm_error {
                    d.get("errorCode").and_then(Value::as_str)
                } else {
                    None
                }
            })
        });
    let rpc_status = error.and_then(|e| e.get("status")).and_then(Value::as_str);

    let code = match fcm_code.or(rpc_status) {
        Some("UNREGISTERED") => DeliveryErrorCode::RegistrationTokenNotRegistered,
        Some("INVALID_ARGUMENT") => {
            if message.to_lowercase().contains("registration token") {
                DeliveryErrorCode::InvalidRegistrationToken
            } else {
                DeliveryErrorCode::InvalidArgument
            }
        }
        Some("SENDER_ID_MISMATCH") | Some("PERMISSION_DENIED") => DeliveryErrorCode::SenderIdMismatch,
        Some("QUOTA_EXCEEDED") | Some("RESOURCE_EXHAUSTED") => DeliveryErrorCode::QuotaExceeded,
        Some("UNAVAILABLE") => DeliveryErrorCode::Unavailable,
        Some("INTERNAL") => DeliveryErrorCode::Internal,
        Some("THIRD_PARTY_AUTH_ERROR") | Some("UNAUTHENTICATED") => {
            DeliveryErrorCode::ThirdPartyAuthError
        }
        _ => match http_status {
            429 => DeliveryErrorCode::QuotaExceeded,
            500 => DeliveryErrorCode::Internal,
            502..=504 => DeliveryErrorCode::Unavailable,
            _ => DeliveryErrorCode::Unknown,
        },
    };

    (code, message)
}
