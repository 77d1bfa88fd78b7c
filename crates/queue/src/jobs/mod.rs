//! Job payload definitions.

mod email;
mod notification;
mod priority;
mod reminder;

use serde::{Deserialize, Serialize};

pub use email::{
    Attachment, EmailType, PrebuiltSendRequest, Receiver, RsvpType, SendRequest,
    StandardSendRequest,
};
pub use notification::NotificationRequest;
pub use priority::PriorityBatchRequest;
pub use reminder::ReminderSchedulingRequest;

/// Every payload shape a job can carry, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum JobPayload {
    StandardSend(StandardSendRequest),
    PrebuiltSend(PrebuiltSendRequest),
    ReminderScheduling(ReminderSchedulingRequest),
    Notification(NotificationRequest),
    PriorityBatch(PriorityBatchRequest),
}

impl JobPayload {
    /// Short name of the payload kind, for logs and listings.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::StandardSend(_) => "standardSend",
            Self::PrebuiltSend(_) => "prebuiltSend",
            Self::ReminderScheduling(_) => "reminderScheduling",
            Self::Notification(_) => "notification",
            Self::PriorityBatch(_) => "priorityBatch",
        }
    }

    /// Primary recipient shown to operators.
    #[must_use]
    pub fn recipient(&self) -> Option<String> {
        match self {
            Self::StandardSend(request) => Some(request.receiver.email.clone()),
            Self::PrebuiltSend(request) => Some(request.options.to.join(", ")),
            Self::ReminderScheduling(request) => Some(request.recipient_id.clone()),
            Self::Notification(request) => Some(request.channel_id.clone()),
            Self::PriorityBatch(request) => Some(format!("{} recipients", request.len())),
        }
    }

    /// Serialize into the raw form stored on a job.
    pub fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

impl From<StandardSendRequest> for JobPayload {
    fn from(request: StandardSendRequest) -> Self {
        Self::StandardSend(request)
    }
}

impl From<PrebuiltSendRequest> for JobPayload {
    fn from(request: PrebuiltSendRequest) -> Self {
        Self::PrebuiltSend(request)
    }
}

impl From<ReminderSchedulingRequest> for JobPayload {
    fn from(request: ReminderSchedulingRequest) -> Self {
        Self::ReminderScheduling(request)
    }
}

impl From<NotificationRequest> for JobPayload {
    fn from(request: NotificationRequest) -> Self {
        Self::Notification(request)
    }
}

impl From<PriorityBatchRequest> for JobPayload {
    fn from(request: PriorityBatchRequest) -> Self {
        Self::PriorityBatch(request)
    }
}
