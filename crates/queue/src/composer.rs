//! Turns a standard send request into a provider-ready [`SendRequest`].

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use tracing::debug;
use validator::Validate;

use crate::collaborators::{CalendarGenerator, CalendarMethod, TemplateProps, TemplateResolver};
use crate::dates::normalize_event_dates;
use crate::jobs::{Attachment, RsvpType, SendRequest, StandardSendRequest};
use crate::workers::JobError;

#[allow(clippy::unwrap_used)]
static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_$]+(?:\.[A-Za-z0-9_$]+)*)\s*\}\}").unwrap());

/// Replace `{{dotted.path}}` placeholders with values from `context`.
///
/// Strings are inserted as-is, numbers and booleans in their JSON form. Missing,
/// null and structured values resolve to an empty string.
#[must_use]
pub fn resolve_placeholders(template: &str, context: &Value) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            let resolved = caps[1]
                .split('.')
                .try_fold(context, |value, segment| match value {
                    Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                    _ => value.get(segment),
                });
            match resolved {
                Some(Value::String(s)) => s.clone(),
                Some(v @ (Value::Number(_) | Value::Bool(_))) => v.to_string(),
                _ => String::new(),
            }
        })
        .into_owned()
}

/// Assembles send requests from raw job parameters.
#[derive(Clone)]
pub struct EmailComposer {
    from_address: String,
    templates: Arc<dyn TemplateResolver>,
    calendar: Option<Arc<dyn CalendarGenerator>>,
}

impl EmailComposer {
    #[must_use]
    pub fn new(from_address: impl Into<String>, templates: Arc<dyn TemplateResolver>) -> Self {
        Self {
            from_address: from_address.into(),
            templates,
            calendar: None,
        }
    }

    /// Attach an iCalendar invite to every composed email.
    #[must_use]
    pub fn with_calendar(mut self, calendar: Arc<dyn CalendarGenerator>) -> Self {
        self.calendar = Some(calendar);
        self
    }

    /// Invite method for a request: cancelled when the receiver is not going or the
    /// event is deleted.
    #[must_use]
    pub fn calendar_method(request: &StandardSendRequest) -> CalendarMethod {
        if request.receiver.rsvp_type == Some(RsvpType::NotGoing) || request.event_deleted() {
            CalendarMethod::Cancel
        } else {
            CalendarMethod::Request
        }
    }

    pub async fn compose(&self, request: &StandardSendRequest) -> Result<SendRequest, JobError> {
        request.validate()?;

        let mut event = request.event.clone();
        normalize_event_dates(&mut event);

        let rendered = self
            .templates
            .resolve(TemplateProps {
                email_type: request.email_type,
                recipient_name: request.receiver.display_name(),
                event: &event,
                text: request.text.as_deref(),
                rsvp_type: request.receiver.rsvp_type,
                previous_rsvp_type: request.previous_rsvp_type,
            })
            .await?;
        let subject = resolve_placeholders(&rendered.subject, &event);

        let mut attachments = Vec::new();
        if let Some(calendar) = &self.calendar {
            let method = Self::calendar_method(request);
            let content = calendar.generate(&event, &request.receiver, method).await?;
            attachments.push(Attachment {
                filename: "invite.ics".to_string(),
                content,
                content_type: format!("text/calendar; method={}", method.as_str()),
            });
        }

        debug!(
            to = %request.receiver.email,
            email_type = request.email_type.as_str(),
            "Composed email"
        );

        Ok(SendRequest {
            from: self.from_address.clone(),
            to: vec![request.receiver.email.clone()],
            subject,
            html: Some(rendered.html),
            template_data: None,
            attachments,
        })
    }
}
