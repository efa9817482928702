//! Folds the ordered chunk stream of one in-flight response into a single
//! finalized message.
//!
//! Chunks are applied strictly in arrival order. Completion is only ever taken
//! from an explicitly terminal chunk; a pause in the stream means nothing.

use pantry_protocol::{ChunkKind, MessageMetadata, StreamChunk};
use time::OffsetDateTime;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::message::{FinalMessage, MessageId, PendingReply};

#[derive(Debug, Clone, PartialEq)]
pub enum AssemblyOutcome {
    /// A placeholder became visible.
    Started(PendingReply),
    /// The placeholder's content or metadata changed.
    Updated(PendingReply),
    Finalized {
        placeholder_id: MessageId,
        message: FinalMessage,
    },
    /// The response was abandoned because the server reported an error.
    Failed(String),
    Ignored,
}

#[derive(Debug, Clone, Default)]
enum AssemblerState {
    #[default]
    Idle,
    Streaming {
        placeholder_id: MessageId,
        buffer: String,
        metadata: MessageMetadata,
        started_at: OffsetDateTime,
    },
}

#[derive(Debug, Default)]
pub struct StreamAssembler {
    state: AssemblerState,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, AssemblerState::Streaming { .. })
    }

    pub fn placeholder_id(&self) -> Option<MessageId> {
        match &self.state {
            AssemblerState::Streaming { placeholder_id, .. } => Some(*placeholder_id),
            AssemblerState::Idle => None,
        }
    }

    pub fn apply(&mut self, chunk: StreamChunk, now: OffsetDateTime) -> AssemblyOutcome {
        trace!(
            target: "pantry::assembler",
            kind = chunk.kind.as_str(),
            active = self.is_active(),
            "chunk"
        );
        if chunk.is_terminal() {
            return self.finalize(chunk, now);
        }
        match chunk.kind {
            ChunkKind::Typing => {
                if self.is_active() {
                    AssemblyOutcome::Ignored
                } else {
                    self.start(now);
                    self.render(true)
                }
            }
            ChunkKind::Token | ChunkKind::Content => {
                let started = self.ensure_started(now);
                if let (Some(text), AssemblerState::Streaming { buffer, .. }) =
                    (chunk.content, &mut self.state)
                {
                    buffer.push_str(&text);
                }
                if let Some(update) = chunk.metadata {
                    self.merge_metadata(update);
                }
                self.render(started)
            }
            ChunkKind::Metadata => {
                let started = self.ensure_started(now);
                if let Some(update) = chunk.metadata {
                    self.merge_metadata(update);
                }
                self.render(started)
            }
            ChunkKind::Error => {
                let reason = chunk
                    .content
                    .filter(|text| !text.trim().is_empty())
                    .unwrap_or_else(|| "response failed".to_string());
                if let Some(placeholder_id) = self.placeholder_id() {
                    debug!(
                        target: "pantry::assembler",
                        placeholder = %placeholder_id,
                        reason = %reason,
                        "discarding placeholder after error chunk"
                    );
                }
                self.state = AssemblerState::Idle;
                AssemblyOutcome::Failed(reason)
            }
            // Terminal kinds are handled above.
            ChunkKind::Complete => AssemblyOutcome::Ignored,
        }
    }

    /// Drops any in-flight response. Returns the placeholder that was
    /// abandoned, if one existed.
    pub fn abandon(&mut self) -> Option<MessageId> {
        let abandoned = self.placeholder_id();
        if let Some(id) = abandoned {
            debug!(target: "pantry::assembler", placeholder = %id, "abandoning partial response");
        }
        self.state = AssemblerState::Idle;
        abandoned
    }

    fn start(&mut self, now: OffsetDateTime) {
        self.state = AssemblerState::Streaming {
            placeholder_id: Uuid::new_v4(),
            buffer: String::new(),
            metadata: MessageMetadata::default(),
            started_at: now,
        };
    }

    fn ensure_started(&mut self, now: OffsetDateTime) -> bool {
        if self.is_active() {
            false
        } else {
            self.start(now);
            true
        }
    }

    fn merge_metadata(&mut self, update: MessageMetadata) {
        if let AssemblerState::Streaming { metadata, .. } = &mut self.state {
            metadata.merge(update);
        }
    }

    fn render(&self, started: bool) -> AssemblyOutcome {
        match &self.state {
            AssemblerState::Streaming {
                placeholder_id,
                buffer,
                metadata,
                started_at,
            } => {
                let reply = PendingReply {
                    placeholder_id: *placeholder_id,
                    content: buffer.clone(),
                    metadata: metadata.clone(),
                    started_at: *started_at,
                };
                if started {
                    AssemblyOutcome::Started(reply)
                } else {
                    AssemblyOutcome::Updated(reply)
                }
            }
            AssemblerState::Idle => AssemblyOutcome::Ignored,
        }
    }

    fn finalize(&mut self, chunk: StreamChunk, now: OffsetDateTime) -> AssemblyOutcome {
        let (placeholder_id, buffer, mut metadata) = match std::mem::take(&mut self.state) {
            AssemblerState::Streaming {
                placeholder_id,
                buffer,
                metadata,
                ..
            } => (placeholder_id, buffer, metadata),
            // A lone terminal chunk still carries a complete answer.
            AssemblerState::Idle => (Uuid::new_v4(), String::new(), MessageMetadata::default()),
        };
        if let Some(update) = chunk.metadata {
            metadata.merge(update);
        }
        let content = match chunk.content {
            Some(authoritative) if !authoritative.is_empty() => {
                if authoritative != buffer && !buffer.is_empty() {
                    debug!(
                        target: "pantry::assembler",
                        placeholder = %placeholder_id,
                        buffered = buffer.len(),
                        authoritative = authoritative.len(),
                        "terminal content overrides buffer"
                    );
                }
                authoritative
            }
            _ => buffer,
        };
        AssemblyOutcome::Finalized {
            placeholder_id,
            message: FinalMessage::assistant(content, now, metadata),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH
    }

    fn finalized(outcome: AssemblyOutcome) -> (MessageId, FinalMessage) {
        match outcome {
            AssemblyOutcome::Finalized {
                placeholder_id,
                message,
            } => (placeholder_id, message),
            other => panic!("expected finalization, got {other:?}"),
        }
    }

    #[test]
    fn terminal_content_overrides_buffer() {
        let mut assembler = StreamAssembler::new();
        let started = assembler.apply(StreamChunk::typing(), now());
        let AssemblyOutcome::Started(placeholder) = started else {
            panic!("typing should start a placeholder");
        };
        assert!(placeholder.content.is_empty());

        assembler.apply(StreamChunk::token("안"), now());
        match assembler.apply(StreamChunk::token("녕"), now()) {
            AssemblyOutcome::Updated(reply) => assert_eq!(reply.content, "안녕"),
            other => panic!("unexpected {other:?}"),
        }

        let (placeholder_id, message) =
            finalized(assembler.apply(StreamChunk::complete("안녕하세요"), now()));
        assert_eq!(placeholder_id, placeholder.placeholder_id);
        assert_ne!(message.id, placeholder_id);
        assert_eq!(message.content, "안녕하세요");
        assert!(!assembler.is_active());
    }

    #[test]
    fn finalization_concatenates_tokens_and_content_bursts() {
        let mut assembler = StreamAssembler::new();
        let parts = ["Boil ", "water", ", then add ", "pasta."];
        for (index, part) in parts.iter().enumerate() {
            let chunk = if index % 2 == 0 {
                StreamChunk::token(*part)
            } else {
                StreamChunk::content(*part)
            };
            assembler.apply(chunk, now());
        }
        let (_, message) = finalized(
            assembler.apply(StreamChunk::new(ChunkKind::Complete), now()),
        );
        assert_eq!(message.content, parts.concat());
    }

    #[test]
    fn metadata_merges_without_touching_content() {
        let mut assembler = StreamAssembler::new();
        assembler.apply(StreamChunk::token("draft"), now());
        let stage = MessageMetadata {
            stage: Some("intent_analysis".into()),
            ..Default::default()
        };
        match assembler.apply(StreamChunk::metadata(stage), now()) {
            AssemblyOutcome::Updated(reply) => {
                assert_eq!(reply.content, "draft");
                assert_eq!(reply.metadata.stage.as_deref(), Some("intent_analysis"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let terminal = StreamChunk::new(ChunkKind::Complete).with_metadata(MessageMetadata {
            intent: Some("recipe_search".into()),
            ..Default::default()
        });
        let (_, message) = finalized(assembler.apply(terminal, now()));
        let metadata = message.metadata.expect("metadata kept");
        assert_eq!(metadata.stage.as_deref(), Some("intent_analysis"));
        assert_eq!(metadata.intent.as_deref(), Some("recipe_search"));
        assert_eq!(message.content, "draft");
    }

    #[test]
    fn error_discards_partial_response() {
        let mut assembler = StreamAssembler::new();
        assembler.apply(StreamChunk::typing(), now());
        assembler.apply(StreamChunk::token("half"), now());
        let outcome = assembler.apply(StreamChunk::error("model overloaded"), now());
        assert_eq!(outcome, AssemblyOutcome::Failed("model overloaded".into()));
        assert!(!assembler.is_active());

        // The next response starts from an empty buffer.
        let (_, message) = finalized(assembler.apply(
            StreamChunk::new(ChunkKind::Complete).with_content("fresh"),
            now(),
        ));
        assert_eq!(message.content, "fresh");
    }

    #[test]
    fn tokens_without_typing_start_implicitly() {
        let mut assembler = StreamAssembler::new();
        assert!(matches!(
            assembler.apply(StreamChunk::token("a"), now()),
            AssemblyOutcome::Started(_)
        ));
        assert_eq!(
            assembler.apply(StreamChunk::typing(), now()),
            AssemblyOutcome::Ignored
        );
    }

    #[test]
    fn abandon_reports_the_dropped_placeholder() {
        let mut assembler = StreamAssembler::new();
        assert_eq!(assembler.abandon(), None);
        assembler.apply(StreamChunk::typing(), now());
        let id = assembler.placeholder_id();
        assert!(id.is_some());
        assert_eq!(assembler.abandon(), id);
        assert!(!assembler.is_active());
    }
}
