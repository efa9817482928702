//! Named events exchanged over the streaming channel.
//!
//! Every text frame is `{"event": "<kebab-case name>", "data": {...}}`.
//! Outbound events derive both directions so test servers can decode them;
//! inbound events are decoded through [`decode_server_frame`], which treats an
//! unrecognised name as a soft [`ProtocolError::UnknownEvent`] rather than a
//! malformed frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::chunk::StreamChunk;
use crate::history::HistorySnapshot;
use crate::metadata::MessageMetadata;

pub const CONNECTION_STATUS: &str = "connection-status";
pub const DIRECT_RESPONSE: &str = "direct-response";
pub const STREAMING_CHUNK: &str = "streaming-chunk";
pub const HISTORY_SNAPSHOT: &str = "history-snapshot";
pub const HISTORY_CLEARED: &str = "history-cleared";
pub const ERROR: &str = "error";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown event `{0}`")]
    UnknownEvent(String),
}

/// Client → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    DirectMessage(OutboundMessage),
    StreamingMessage(OutboundMessage),
    RequestHistory(HistoryRequest),
    ClearHistory,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::DirectMessage(_) => "direct-message",
            ClientEvent::StreamingMessage(_) => "streaming-message",
            ClientEvent::RequestHistory(_) => "request-history",
            ClientEvent::ClearHistory => "clear-history",
        }
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub message: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    ConnectionStatus(ConnectionStatus),
    DirectResponse(DirectResponse),
    StreamingChunk(StreamChunk),
    HistorySnapshot(HistorySnapshot),
    HistoryCleared,
    Error(ServerError),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::ConnectionStatus(_) => CONNECTION_STATUS,
            ServerEvent::DirectResponse(_) => DIRECT_RESPONSE,
            ServerEvent::StreamingChunk(_) => STREAMING_CHUNK,
            ServerEvent::HistorySnapshot(_) => HISTORY_SNAPSHOT,
            ServerEvent::HistoryCleared => HISTORY_CLEARED,
            ServerEvent::Error(_) => ERROR,
        }
    }

    /// Session id advertised by the event, if any.
    pub fn session_id(&self) -> Option<&str> {
        let id = match self {
            ServerEvent::ConnectionStatus(status) => status.session_id.as_deref(),
            ServerEvent::DirectResponse(response) => response.session_id.as_deref(),
            ServerEvent::StreamingChunk(chunk) => chunk.session_id.as_deref(),
            ServerEvent::HistorySnapshot(snapshot) => snapshot.session_id.as_deref(),
            ServerEvent::HistoryCleared | ServerEvent::Error(_) => None,
        };
        id.map(str::trim).filter(|id| !id.is_empty())
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Post-connect acknowledgement. A present, non-empty `user.id` means the
/// bearer credential was accepted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl UserIdentity {
    pub fn is_valid(&self) -> bool {
        !self.id.trim().is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectResponse {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipes: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipe_data: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl DirectResponse {
    /// Metadata with structured results resolved through the fallback chain
    /// `metadata.structuredResults` → `recipes` → `recipeData`.
    pub fn folded_metadata(&self) -> MessageMetadata {
        let mut metadata = self.metadata.clone().unwrap_or_default();
        if metadata.structured_results.is_empty() {
            let results = self
                .recipes
                .clone()
                .filter(|items| !items.is_empty())
                .or_else(|| self.recipe_data.clone())
                .unwrap_or_default();
            metadata = metadata.with_structured_results(results);
        }
        metadata
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Deserialize)]
struct Frame {
    event: String,
    #[serde(default)]
    data: Value,
}

/// Decodes one inbound text frame.
pub fn decode_server_frame(text: &str) -> Result<ServerEvent, ProtocolError> {
    let Frame { event, data } = serde_json::from_str(text)?;
    let data = match data {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    let decoded = match event.as_str() {
        CONNECTION_STATUS => ServerEvent::ConnectionStatus(serde_json::from_value(data)?),
        DIRECT_RESPONSE => ServerEvent::DirectResponse(serde_json::from_value(data)?),
        STREAMING_CHUNK => ServerEvent::StreamingChunk(serde_json::from_value(data)?),
        HISTORY_SNAPSHOT => ServerEvent::HistorySnapshot(serde_json::from_value(data)?),
        HISTORY_CLEARED => ServerEvent::HistoryCleared,
        ERROR => ServerEvent::Error(serde_json::from_value(data)?),
        _ => return Err(ProtocolError::UnknownEvent(event)),
    };
    Ok(decoded)
}

/// Decodes one outbound frame; used by servers and test harnesses.
pub fn decode_client_frame(text: &str) -> Result<ClientEvent, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkKind;
    use serde_json::json;

    #[test]
    fn client_events_use_kebab_case_names() {
        let event = ClientEvent::StreamingMessage(OutboundMessage {
            message: "파스타 추천해줘".into(),
            session_id: "s1".into(),
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "streaming-message",
                "data": { "message": "파스타 추천해줘", "sessionId": "s1" }
            })
        );
        assert_eq!(event.name(), "streaming-message");
    }

    #[test]
    fn clear_history_has_no_payload() {
        let text = ClientEvent::ClearHistory.to_text().unwrap();
        assert_eq!(text, r#"{"event":"clear-history"}"#);
        assert_eq!(decode_client_frame(&text).unwrap(), ClientEvent::ClearHistory);
    }

    #[test]
    fn decodes_streaming_chunk_frame() {
        let frame = r#"{"event":"streaming-chunk","data":{"type":"token","content":"안","sessionId":"s1"}}"#;
        match decode_server_frame(frame).unwrap() {
            ServerEvent::StreamingChunk(chunk) => {
                assert_eq!(chunk.kind, ChunkKind::Token);
                assert_eq!(chunk.content.as_deref(), Some("안"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn connection_status_without_data_is_unauthenticated() {
        let event = decode_server_frame(r#"{"event":"connection-status"}"#).unwrap();
        assert_eq!(event, ServerEvent::ConnectionStatus(ConnectionStatus::default()));
    }

    #[test]
    fn unknown_event_is_reported_by_name() {
        let err = decode_server_frame(r#"{"event":"bookmark-added","data":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownEvent(name) if name == "bookmark-added"));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            decode_server_frame("not json"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn server_events_round_trip_through_decoder() {
        let event = ServerEvent::DirectResponse(DirectResponse {
            content: "여기 레시피입니다".into(),
            session_id: Some("s1".into()),
            ..Default::default()
        });
        let text = event.to_text().unwrap();
        assert_eq!(decode_server_frame(&text).unwrap(), event);
        assert_eq!(event.session_id(), Some("s1"));
    }

    #[test]
    fn direct_response_folds_recipe_aliases() {
        let response: DirectResponse = serde_json::from_value(json!({
            "content": "ok",
            "recipeData": [{ "title": "bibimbap" }],
        }))
        .unwrap();
        let metadata = response.folded_metadata();
        assert_eq!(metadata.structured_results, vec![json!({ "title": "bibimbap" })]);
    }

    #[test]
    fn blank_session_ids_are_ignored() {
        let event = ServerEvent::StreamingChunk(StreamChunk::typing().with_session_id("  "));
        assert_eq!(event.session_id(), None);
    }
}
