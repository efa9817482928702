use serde::{Deserialize, Serialize};

use crate::metadata::MessageMetadata;

/// Discriminant of a streaming chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Typing,
    Token,
    Metadata,
    Content,
    /// Dedicated terminal marker. A `content` chunk with `isComplete` set is
    /// equally terminal.
    Complete,
    Error,
}

impl ChunkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChunkKind::Typing => "typing",
            ChunkKind::Token => "token",
            ChunkKind::Metadata => "metadata",
            ChunkKind::Content => "content",
            ChunkKind::Complete => "complete",
            ChunkKind::Error => "error",
        }
    }
}

/// One unit of an in-flight assistant response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunk {
    #[serde(rename = "type")]
    pub kind: ChunkKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
    #[serde(default)]
    pub is_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl StreamChunk {
    pub fn new(kind: ChunkKind) -> Self {
        Self {
            kind,
            content: None,
            metadata: None,
            is_complete: false,
            session_id: None,
        }
    }

    pub fn typing() -> Self {
        Self::new(ChunkKind::Typing)
    }

    pub fn token(text: impl Into<String>) -> Self {
        Self::new(ChunkKind::Token).with_content(text)
    }

    pub fn content(text: impl Into<String>) -> Self {
        Self::new(ChunkKind::Content).with_content(text)
    }

    pub fn complete(text: impl Into<String>) -> Self {
        let mut chunk = Self::content(text);
        chunk.is_complete = true;
        chunk
    }

    pub fn metadata(metadata: MessageMetadata) -> Self {
        let mut chunk = Self::new(ChunkKind::Metadata);
        chunk.metadata = Some(metadata);
        chunk
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ChunkKind::Error).with_content(message)
    }

    pub fn with_content(mut self, text: impl Into<String>) -> Self {
        self.content = Some(text.into());
        self
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Only explicitly marked chunks end a response; silence never does.
    pub fn is_terminal(&self) -> bool {
        match self.kind {
            ChunkKind::Complete => true,
            ChunkKind::Content => self.is_complete,
            _ => false,
        }
    }
}
