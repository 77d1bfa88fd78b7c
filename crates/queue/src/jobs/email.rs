//! Email send payloads.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::{Validate, ValidateEmail, ValidationError};

/// RSVP answer given by a receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RsvpType {
    Going,
    Maybe,
    NotGoing,
}

/// Kind of transactional email, used to pick a template and subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EmailType {
    /// Confirmation to the person who proposed the event.
    ProposerConfirmation,
    /// Invitation to a prospective attendee.
    Invitation,
    EventUpdated,
    EventCancelled,
    RsvpConfirmation,
    RsvpUpdated,
    Reminder,
}

impl EmailType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ProposerConfirmation => "proposerConfirmation",
            Self::Invitation => "invitation",
            Self::EventUpdated => "eventUpdated",
            Self::EventCancelled => "eventCancelled",
            Self::RsvpConfirmation => "rsvpConfirmation",
            Self::RsvpUpdated => "rsvpUpdated",
            Self::Reminder => "reminder",
        }
    }
}

/// Recipient of a standard send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Receiver {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[validate(email(message = "receiver has no usable email address"))]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsvp_type: Option<RsvpType>,
}

impl Receiver {
    /// Receiver with only an address.
    #[must_use]
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            id: None,
            name: None,
            email: email.into(),
            rsvp_type: None,
        }
    }

    /// Display name, falling back to the address.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&self.email)
    }
}

/// Raw parameters for an email the worker still has to compose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StandardSendRequest {
    #[validate(nested)]
    pub receiver: Receiver,
    /// Event document; date fields may arrive in any serialized shape.
    #[validate(custom(function = "validate_event"))]
    pub event: Value,
    pub email_type: EmailType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_rsvp_type: Option<RsvpType>,
}

impl StandardSendRequest {
    #[must_use]
    pub fn new(receiver: Receiver, event: Value, email_type: EmailType) -> Self {
        Self {
            receiver,
            event,
            email_type,
            text: None,
            previous_rsvp_type: None,
        }
    }

    /// Whether the event is marked deleted.
    #[must_use]
    pub fn event_deleted(&self) -> bool {
        match self.event.get("deletedAt") {
            Some(Value::Null) | None => self
                .event
                .get("deleted")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            Some(_) => true,
        }
    }
}

/// File attached to a send request; `content` is raw text or bytes encoded as UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub filename: String,
    pub content: String,
    pub content_type: String,
}

/// Fully assembled request accepted by the email provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "validate_body"))]
pub struct SendRequest {
    /// Sender, either a bare address or `Name <address>`.
    #[validate(length(min = 1, message = "send request has no sender"))]
    pub from: String,
    #[validate(
        length(min = 1, message = "send request has no recipients"),
        custom(function = "validate_recipients")
    )]
    pub to: Vec<String>,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_data: Option<Value>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

fn invalid(code: &'static str, message: &'static str) -> ValidationError {
    ValidationError::new(code).with_message(Cow::Borrowed(message))
}

fn validate_event(event: &Value) -> Result<(), ValidationError> {
    if event.is_object() {
        Ok(())
    } else {
        Err(invalid("event", "event must be an object"))
    }
}

fn validate_recipients(to: &[String]) -> Result<(), ValidationError> {
    if to.iter().all(|address| address.validate_email()) {
        Ok(())
    } else {
        Err(invalid("email", "send request has an unusable recipient address"))
    }
}

fn validate_body(request: &SendRequest) -> Result<(), ValidationError> {
    if request.html.is_none() && request.template_data.is_none() {
        return Err(invalid(
            "body",
            "send request needs either an html body or template data",
        ));
    }
    Ok(())
}

/// Send request built by the producer; the worker sends it as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltSendRequest {
    pub options: SendRequest,
}
