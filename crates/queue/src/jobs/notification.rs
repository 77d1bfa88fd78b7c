//! Chat notification payload.

use serde::{Deserialize, Serialize};

/// Post a message about an event to a chat channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequest {
    pub event_id: String,
    /// Host (organiser) shown in the message.
    pub host: String,
    /// Notification type, e.g. `created` or `cancelled`.
    #[serde(rename = "type")]
    pub kind: String,
    pub channel_id: String,
}
