//! Transactional email provider.

use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use eventmail_common::config::EmailSettings;
use eventmail_common::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::jobs::SendRequest;

/// Error name the provider uses for rate-limit rejections.
pub const RATE_LIMIT_ERROR_NAME: &str = "rate_limit_exceeded";

const RATE_LIMIT_MARKERS: [&str; 3] = ["rate limit", "rate_limit", "too many requests"];

/// A failed send.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("rate limit exceeded: {message}")]
    RateLimited { message: String },

    #[error("provider rejected the request ({status}) {name}: {message}")]
    Rejected {
        status: u16,
        name: String,
        message: String,
    },

    #[error("transport error: {0}")]
    Transport(String),
}

impl ProviderError {
    /// Whether the provider refused the send because of its rate limit.
    #[must_use]
    pub fn is_rate_limit(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Rejected { name, message, .. } => {
                name == RATE_LIMIT_ERROR_NAME || mentions_rate_limit(message)
            }
            Self::Transport(message) => mentions_rate_limit(message),
        }
    }
}

fn mentions_rate_limit(message: &str) -> bool {
    let message = message.to_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|m| message.contains(m))
}

/// Successful send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub id: String,
}

/// Anything that can deliver a [`SendRequest`].
#[async_trait]
pub trait EmailProvider: Send + Sync {
    async fn send(&self, request: &SendRequest) -> Result<SendReceipt, ProviderError>;
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Map a non-success response to a [`ProviderError`].
#[must_use]
pub fn classify_failure(status: u16, body: &str) -> ProviderError {
    let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();
    let name = parsed
        .as_ref()
        .and_then(|b| b.name.clone())
        .unwrap_or_default();
    let message = parsed
        .and_then(|b| b.message)
        .unwrap_or_else(|| body.trim().to_string());

    if status == 429 || name == RATE_LIMIT_ERROR_NAME {
        return ProviderError::RateLimited { message };
    }
    ProviderError::Rejected {
        status,
        name,
        message,
    }
}

#[derive(Serialize)]
struct OutgoingAttachment<'a> {
    filename: &'a str,
    content: String,
    content_type: &'a str,
}

#[derive(Serialize)]
struct OutgoingEmail<'a> {
    from: &'a str,
    to: &'a [String],
    subject: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    html: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    template_data: Option<&'a serde_json::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<OutgoingAttachment<'a>>,
}

impl<'a> From<&'a SendRequest> for OutgoingEmail<'a> {
    fn from(request: &'a SendRequest) -> Self {
        Self {
            from: &request.from,
            to: &request.to,
            subject: &request.subject,
            html: request.html.as_deref(),
            template_data: request.template_data.as_ref(),
            attachments: request
                .attachments
                .iter()
                .map(|a| OutgoingAttachment {
                    filename: &a.filename,
                    content: BASE64.encode(a.content.as_bytes()),
                    content_type: &a.content_type,
                })
                .collect(),
        }
    }
}

/// Provider reached over its HTTP API.
#[derive(Clone)]
pub struct HttpEmailProvider {
    http_client: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl HttpEmailProvider {
    pub fn new(settings: &EmailSettings) -> AppResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            api_url: settings.api_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
        })
    }
}

#[async_trait]
impl EmailProvider for HttpEmailProvider {
    async fn send(&self, request: &SendRequest) -> Result<SendReceipt, ProviderError> {
        let response = self
            .http_client
            .post(format!("{}/emails", self.api_url))
            .bearer_auth(&self.api_key)
            .json(&OutgoingEmail::from(request))
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let receipt: SendReceipt = response
                .json()
                .await
                .map_err(|e| ProviderError::Transport(format!("unreadable response: {e}")))?;
            debug!(message_id = %receipt.id, to = ?request.to, "Email accepted by provider");
            Ok(receipt)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify_failure(status.as_u16(), &body))
        }
    }
}
