use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::metadata::MessageMetadata;

/// One stored exchange: the user's prompt and the assistant's reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub message: String,
    pub response: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

/// Body of both the REST history endpoint and the streaming
/// `history-snapshot` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySnapshot {
    #[serde(default)]
    pub conversations: Vec<ConversationRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}
