//! Transcript entries.
//!
//! An assistant reply lives as [`Message::Pending`] while chunks arrive and is
//! swapped for a [`Message::Final`] with a fresh id once complete, so
//! consumers keyed on `id` can tell a growing reply from an addressable one.

use pantry_protocol::{ConversationRecord, MessageMetadata};
use time::OffsetDateTime;
use uuid::Uuid;

pub type MessageId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Author {
    User,
    Assistant,
}

/// Immutable, addressable transcript entry.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalMessage {
    pub id: MessageId,
    pub author: Author,
    pub content: String,
    pub timestamp: OffsetDateTime,
    pub metadata: Option<MessageMetadata>,
}

impl FinalMessage {
    pub fn user(content: impl Into<String>, timestamp: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            author: Author::User,
            content: content.into(),
            timestamp,
            metadata: None,
        }
    }

    pub fn assistant(
        content: impl Into<String>,
        timestamp: OffsetDateTime,
        metadata: MessageMetadata,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            author: Author::Assistant,
            content: content.into(),
            timestamp,
            metadata: (!metadata.is_empty()).then_some(metadata),
        }
    }

    /// Expands one stored exchange into its user and assistant turns, both
    /// stamped with the stored timestamp.
    pub fn pair_from_record(record: &ConversationRecord) -> [FinalMessage; 2] {
        [
            FinalMessage::user(record.message.clone(), record.timestamp),
            FinalMessage::assistant(
                record.response.clone(),
                record.timestamp,
                record.metadata.clone().unwrap_or_default(),
            ),
        ]
    }
}

/// In-progress assistant reply. `content` mirrors the assembler's buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingReply {
    pub placeholder_id: MessageId,
    pub content: String,
    pub metadata: MessageMetadata,
    pub started_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Pending(PendingReply),
    Final(FinalMessage),
}

impl Message {
    pub fn id(&self) -> MessageId {
        match self {
            Message::Pending(pending) => pending.placeholder_id,
            Message::Final(message) => message.id,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Message::Pending(pending) => &pending.content,
            Message::Final(message) => &message.content,
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(
            self,
            Message::Final(FinalMessage {
                author: Author::User,
                ..
            })
        )
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Message::Pending(_))
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        match self {
            Message::Pending(pending) => pending.started_at,
            Message::Final(message) => message.timestamp,
        }
    }

    pub fn metadata(&self) -> Option<&MessageMetadata> {
        match self {
            Message::Pending(pending) => Some(&pending.metadata),
            Message::Final(message) => message.metadata.as_ref(),
        }
    }
}

/// Ordered, append-only sequence of messages. At most one entry is pending.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    entries: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter()
    }

    pub fn messages(&self) -> &[Message] {
        &self.entries
    }

    pub fn push(&mut self, message: FinalMessage) {
        self.entries.push(Message::Final(message));
    }

    pub fn pending(&self) -> Option<&PendingReply> {
        self.entries.iter().find_map(|entry| match entry {
            Message::Pending(pending) => Some(pending),
            Message::Final(_) => None,
        })
    }

    pub fn streaming_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_streaming()).count()
    }

    /// Shows `reply` as the single pending entry, replacing any earlier
    /// placeholder in place or appending a new one.
    pub fn upsert_pending(&mut self, reply: PendingReply) {
        match self.pending_index() {
            Some(index) => self.entries[index] = Message::Pending(reply),
            None => self.entries.push(Message::Pending(reply)),
        }
    }

    /// Swaps the placeholder for its finalized message, keeping its position.
    /// Appends when no placeholder is visible.
    pub fn finalize_pending(&mut self, message: FinalMessage) {
        match self.pending_index() {
            Some(index) => self.entries[index] = Message::Final(message),
            None => self.entries.push(Message::Final(message)),
        }
    }

    pub fn discard_pending(&mut self) -> Option<PendingReply> {
        let index = self.pending_index()?;
        match self.entries.remove(index) {
            Message::Pending(pending) => Some(pending),
            Message::Final(_) => None,
        }
    }

    pub fn last_assistant(&self) -> Option<&FinalMessage> {
        self.entries.iter().rev().find_map(|entry| match entry {
            Message::Final(message) if message.author == Author::Assistant => Some(message),
            _ => None,
        })
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn pending_index(&self) -> Option<usize> {
        self.entries.iter().position(Message::is_streaming)
    }
}
