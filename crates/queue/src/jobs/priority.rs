//! Priority batch payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::StandardSendRequest;

/// Recipients that must be mailed ahead of the standard backlog.
///
/// Each recipient carries its own copy of the event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorityBatchRequest {
    pub event: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_id: Option<String>,
    #[serde(default)]
    pub proposer_recipients: Vec<StandardSendRequest>,
    #[serde(default)]
    pub attendee_recipients: Vec<StandardSendRequest>,
}

impl PriorityBatchRequest {
    /// Total number of recipients in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.proposer_recipients.len() + self.attendee_recipients.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
