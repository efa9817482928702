//! Duplicate-admission guard for the transcript.
//!
//! A candidate is the same logical turn as an existing entry when the ids
//! match, or when sender, content, and a timestamp within `window` all match.
//! Discards are silent and only visible at debug level.

use time::Duration;
use tracing::debug;

use crate::message::{Author, FinalMessage, Message, MessageId, Transcript};

pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::seconds(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted(MessageId),
    Duplicate(MessageId),
}

impl Admission {
    pub fn is_admitted(self) -> bool {
        matches!(self, Admission::Admitted(_))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DedupGuard {
    window: Duration,
}

impl Default for DedupGuard {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}

impl DedupGuard {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Returns the id of the existing entry `candidate` duplicates, if any.
    /// Pending entries only ever match by id.
    pub fn find_duplicate<'a>(
        &self,
        mut existing: impl Iterator<Item = &'a Message>,
        candidate: &FinalMessage,
    ) -> Option<MessageId> {
        existing
            .find(|entry| self.matches(entry, candidate))
            .map(Message::id)
    }

    /// Appends `candidate` unless it duplicates an existing entry.
    pub fn admit(&self, transcript: &mut Transcript, candidate: FinalMessage) -> Admission {
        if let Some(existing) = self.find_duplicate(transcript.iter(), &candidate) {
            debug!(
                target: "pantry::dedup",
                existing = %existing,
                candidate = %candidate.id,
                is_user = candidate.author == Author::User,
                "discarding duplicate message"
            );
            return Admission::Duplicate(existing);
        }
        let id = candidate.id;
        transcript.push(candidate);
        Admission::Admitted(id)
    }

    fn matches(&self, entry: &Message, candidate: &FinalMessage) -> bool {
        if entry.id() == candidate.id {
            return true;
        }
        match entry {
            Message::Pending(_) => false,
            Message::Final(existing) => {
                existing.author == candidate.author
                    && existing.content == candidate.content
                    && (existing.timestamp - candidate.timestamp).abs() <= self.window
            }
        }
    }
}
