//! Reminder scheduling payload.

use serde::{Deserialize, Serialize};

/// Ask the host application to schedule reminders for one recipient of an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderSchedulingRequest {
    pub event_id: String,
    pub recipient_id: String,
    #[serde(default)]
    pub is_proposer: bool,
    #[serde(default)]
    pub is_maybe: bool,
}
