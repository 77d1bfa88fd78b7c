//! Services the queue calls into but does not own.
//!
//! Template rendering, calendar files, reminder persistence and chat delivery live
//! in the host application. The adapters here cover the cases that are a plain
//! HTTP call plus a minimal placeholder-based template resolver.

use std::time::Duration;

use async_trait::async_trait;
use eventmail_common::config::{ReminderSettings, SlackSettings};
use eventmail_common::{AppError, AppResult};
use serde_json::{Value, json};
use thiserror::Error;

use crate::jobs::{EmailType, NotificationRequest, Receiver, ReminderSchedulingRequest, RsvpType};

/// Failure of an external collaborator.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{service} answered {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("{0}")]
    Other(String),
}

/// Inputs for rendering one email.
#[derive(Debug, Clone, Copy)]
pub struct TemplateProps<'a> {
    pub email_type: EmailType,
    pub recipient_name: &'a str,
    /// Event with normalised dates.
    pub event: &'a Value,
    pub text: Option<&'a str>,
    pub rsvp_type: Option<RsvpType>,
    pub previous_rsvp_type: Option<RsvpType>,
}

/// Rendered body and a subject that may still contain `{{path}}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedTemplate {
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait TemplateResolver: Send + Sync {
    async fn resolve(&self, props: TemplateProps<'_>) -> Result<RenderedTemplate, CollaboratorError>;
}

/// iCalendar `METHOD` of an attached invite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarMethod {
    Request,
    Cancel,
}

impl CalendarMethod {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "REQUEST",
            Self::Cancel => "CANCEL",
        }
    }
}

/// Produces iCalendar text for an event.
#[async_trait]
pub trait CalendarGenerator: Send + Sync {
    async fn generate(
        &self,
        event: &Value,
        receiver: &Receiver,
        method: CalendarMethod,
    ) -> Result<String, CollaboratorError>;
}

/// Persists reminders for a recipient of an event.
#[async_trait]
pub trait ReminderScheduler: Send + Sync {
    async fn schedule(&self, request: &ReminderSchedulingRequest) -> Result<(), CollaboratorError>;
}

/// Posts event notifications to a chat channel.
#[async_trait]
pub trait ChatNotifier: Send + Sync {
    async fn notify(&self, request: &NotificationRequest) -> Result<(), CollaboratorError>;
}

fn http_client() -> AppResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
        .map_err(|e| AppError::Internal(format!("failed to build HTTP client: {e}")))
}

async fn check_status(
    service: &'static str,
    response: reqwest::Response,
) -> Result<(), CollaboratorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(CollaboratorError::Status {
        service,
        status: status.as_u16(),
        body,
    })
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Subject lines per email type and a bare HTML body.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTemplateResolver;

impl PlainTemplateResolver {
    #[must_use]
    pub const fn subject_for(email_type: EmailType) -> &'static str {
        match email_type {
            EmailType::ProposerConfirmation => "Your event {{title}} is live",
            EmailType::Invitation => "You're invited: {{title}}",
            EmailType::EventUpdated => "Updated: {{title}}",
            EmailType::EventCancelled => "Cancelled: {{title}}",
            EmailType::RsvpConfirmation => "You're confirmed for {{title}}",
            EmailType::RsvpUpdated => "Your RSVP for {{title}} changed",
            EmailType::Reminder => "Reminder: {{title}} starts {{startTime}}",
        }
    }
}

#[async_trait]
impl TemplateResolver for PlainTemplateResolver {
    async fn resolve(&self, props: TemplateProps<'_>) -> Result<RenderedTemplate, CollaboratorError> {
        let title = props
            .event
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("your event");
        let mut html = format!(
            "<p>Hi {},</p><p>{}</p>",
            escape_html(props.recipient_name),
            escape_html(title)
        );
        if let Some(start) = props.event.get("startTime").and_then(Value::as_str) {
            html.push_str(&format!("<p>Starts: {}</p>", escape_html(start)));
        }
        if let Some(text) = props.text {
            html.push_str(&format!("<p>{}</p>", escape_html(text)));
        }

        Ok(RenderedTemplate {
            subject: Self::subject_for(props.email_type).to_string(),
            html,
        })
    }
}

/// Slack incoming webhook.
#[derive(Clone)]
pub struct SlackWebhookNotifier {
    http_client: reqwest::Client,
    webhook_url: String,
}

impl SlackWebhookNotifier {
    pub fn new(settings: &SlackSettings) -> AppResult<Self> {
        Ok(Self {
            http_client: http_client()?,
            webhook_url: settings.webhook_url.clone(),
        })
    }

    fn message(request: &NotificationRequest) -> Value {
        json!({
            "channel": request.channel_id,
            "text": format!(
                "Event {} ({}) by {}",
                request.event_id, request.kind, request.host
            ),
        })
    }
}

#[async_trait]
impl ChatNotifier for SlackWebhookNotifier {
    async fn notify(&self, request: &NotificationRequest) -> Result<(), CollaboratorError> {
        let response = self
            .http_client
            .post(&self.webhook_url)
            .json(&Self::message(request))
            .send()
            .await?;
        check_status("slack", response).await
    }
}

/// Forwards reminder requests to the host application.
#[derive(Clone)]
pub struct HttpReminderScheduler {
    http_client: reqwest::Client,
    callback_url: String,
    secret: Option<String>,
}

impl HttpReminderScheduler {
    pub fn new(settings: &ReminderSettings) -> AppResult<Self> {
        Ok(Self {
            http_client: http_client()?,
            callback_url: settings.callback_url.clone(),
            secret: settings.secret.clone(),
        })
    }
}

#[async_trait]
impl ReminderScheduler for HttpReminderScheduler {
    async fn schedule(&self, request: &ReminderSchedulingRequest) -> Result<(), CollaboratorError> {
        let mut builder = self.http_client.post(&self.callback_url).json(request);
        if let Some(secret) = &self.secret {
            builder = builder.bearer_auth(secret);
        }
        let response = builder.send().await?;
        check_status("reminder callback", response).await
    }
}

/// Reminder scheduler used when no callback is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredReminderScheduler;

#[async_trait]
impl ReminderScheduler for UnconfiguredReminderScheduler {
    async fn schedule(&self, request: &ReminderSchedulingRequest) -> Result<(), CollaboratorError> {
        Err(CollaboratorError::Other(format!(
            "no reminder callback configured; cannot schedule reminders for event {}",
            request.event_id
        )))
    }
}

/// Chat notifier used when no webhook is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredChatNotifier;

#[async_trait]
impl ChatNotifier for UnconfiguredChatNotifier {
    async fn notify(&self, request: &NotificationRequest) -> Result<(), CollaboratorError> {
        Err(CollaboratorError::Other(format!(
            "no chat webhook configured; dropping notification for event {}",
            request.event_id
        )))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_plain_template_escapes_values() {
        let event = json!({"title": "<b>Launch</b>", "startTime": "2026-03-01T18:30:00+00:00"});
        let rendered = PlainTemplateResolver
            .resolve(TemplateProps {
                email_type: EmailType::Invitation,
                recipient_name: "Ada & Co",
                event: &event,
                text: None,
                rsvp_type: None,
                previous_rsvp_type: None,
            })
            .await
            .unwrap();

        assert_eq!(rendered.subject, "You're invited: {{title}}");
        assert!(rendered.html.contains("Ada &amp; Co"));
        assert!(rendered.html.contains("&lt;b&gt;Launch&lt;/b&gt;"));
        assert!(rendered.html.contains("Starts: 2026-03-01"));
    }

    #[test]
    fn test_slack_message_shape() {
        let message = SlackWebhookNotifier::message(&NotificationRequest {
            event_id: "ev1".into(),
            host: "Ada".into(),
            kind: "created".into(),
            channel_id: "C1".into(),
        });
        assert_eq!(message["channel"], "C1");
        assert_eq!(message["text"], "Event ev1 (created) by Ada");
    }

    #[tokio::test]
    async fn test_unconfigured_collaborators_fail() {
        let request = ReminderSchedulingRequest {
            event_id: "ev1".into(),
            recipient_id: "u1".into(),
            is_proposer: false,
            is_maybe: true,
        };
        assert!(UnconfiguredReminderScheduler.schedule(&request).await.is_err());
    }
}
