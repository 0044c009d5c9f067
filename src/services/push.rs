use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::AppResult;

/// One logical push message, addressed to many endpoints by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    pub data: HashMap<String, String>,
}

/// Reason a single endpoint could not be delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryErrorCode {
    /// The token is malformed.
    InvalidRegistrationToken,
    /// The token was valid once but the app instance is gone.
    RegistrationTokenNotRegistered,
    InvalidArgument,
    SenderIdMismatch,
    QuotaExceeded,
    Unavailable,
    Internal,
    ThirdPartyAuthError,
    Unknown,
}

impl DeliveryErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryErrorCode::InvalidRegistrationToken => "messaging/invalid-registration-token",
            DeliveryErrorCode::RegistrationTokenNotRegistered => {
                "messaging/registration-token-not-registered"
            }
            DeliveryErrorCode::InvalidArgument => "messaging/invalid-argument",
            DeliveryErrorCode::SenderIdMismatch => "messaging/mismatched-credential",
            DeliveryErrorCode::QuotaExceeded => "messaging/message-rate-exceeded",
            DeliveryErrorCode::Unavailable => "messaging/server-unavailable",
            DeliveryErrorCode::Internal => "messaging/internal-error",
            DeliveryErrorCode::ThirdPartyAuthError => "messaging/third-party-auth-error",
            DeliveryErrorCode::Unknown => "messaging/unknown-error",
        }
    }

    /// Whether the endpoint itself is dead and should leave the registry.
    /// Every other code is treated as transient.
    pub fn is_permanently_invalid(&self) -> bool {
        matches!(
            self,
            DeliveryErrorCode::InvalidRegistrationToken
                | DeliveryErrorCode::RegistrationTokenNotRegistered
        )
    }
}

impl std::fmt::Display for DeliveryErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointFailure {
    pub code: DeliveryErrorCode,
    pub message: String,
}

/// Per-endpoint result of a multicast send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointResult {
    Delivered { message_id: String },
    Failed(EndpointFailure),
}

impl EndpointResult {
    pub fn failed(code: DeliveryErrorCode, message: impl Into<String>) -> Self {
        EndpointResult::Failed(EndpointFailure {
            code,
            message: message.into(),
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, EndpointResult::Delivered { .. })
    }
}

/// Results of a multicast send, one per endpoint in submission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResponse {
    pub responses: Vec<EndpointResult>,
}

impl BatchResponse {
    pub fn success_count(&self) -> usize {
        self.responses.iter().filter(|r| r.is_success()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.responses.len() - self.success_count()
    }
}

/// A push provider able to fan one message out to many endpoints.
///
/// Implementations return `Err` only when the batch as a whole could not be
/// attempted (credentials, provider unreachable before any send). Failures
/// for individual endpoints are reported inside the `BatchResponse`.
#[async_trait]
pub trait PushTransport: Send + Sync + 'static {
    async fn send_multicast(
        &self,
        message: &PushMessage,
        tokens: &[String],
    ) -> AppResult<BatchResponse>;
}
