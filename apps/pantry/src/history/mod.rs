//! Loads durable history into the transcript at most once per session.
//!
//! The REST fetch is tried first. If it fails while the session is still
//! connected, history is requested once over the streaming channel instead.
//! Two guards keep a reconnect storm from loading twice: the in-memory latch
//! and a persisted timestamp of the last load (see [`guard`]).

pub mod backend;
pub mod guard;

use std::sync::Arc;

use pantry_protocol::ConversationRecord;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::dedup::DedupGuard;
use crate::message::{FinalMessage, Transcript};

pub use backend::{HistoryBackend, HistoryError, MockHistoryBackend, ReqwestHistoryBackend};
pub use guard::{FileGuardStore, GuardStore, MemoryGuardStore};

pub const DEFAULT_GUARD_WINDOW: Duration = Duration::seconds(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistorySource {
    Rest,
    Stream,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HistoryStatus {
    #[default]
    Idle,
    Loading(HistorySource),
    Loaded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Latched,
    InFlight,
    RecentlyLoaded,
}

/// What the caller has to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryStep {
    FetchPrimary,
    RequestOverStream,
    Failed(String),
    Skip(SkipReason),
}

pub struct HistoryReconciler {
    guard: Arc<dyn GuardStore>,
    window: Duration,
    latched: bool,
    status: HistoryStatus,
    error: Option<String>,
    fallback_attempt: u64,
}

impl HistoryReconciler {
    pub fn new(guard: Arc<dyn GuardStore>, window: Duration) -> Self {
        Self {
            guard,
            window,
            latched: false,
            status: HistoryStatus::Idle,
            error: None,
            fallback_attempt: 0,
        }
    }

    pub fn status(&self) -> HistoryStatus {
        self.status
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_latched(&self) -> bool {
        self.latched
    }

    /// Counter of streaming-channel requests issued so far; the latest one is
    /// the only one whose timeout counts.
    pub fn fallback_attempt(&self) -> u64 {
        self.fallback_attempt
    }

    /// Starts a load. `bypass_window` skips the persisted-timestamp check for
    /// explicit user retries; the latch still applies.
    pub fn begin(&mut self, now: OffsetDateTime, bypass_window: bool) -> HistoryStep {
        let skip = if self.latched {
            Some(SkipReason::Latched)
        } else if matches!(self.status, HistoryStatus::Loading(_)) {
            Some(SkipReason::InFlight)
        } else if !bypass_window && self.loaded_recently(now) {
            Some(SkipReason::RecentlyLoaded)
        } else {
            None
        };
        if let Some(reason) = skip {
            debug!(target: "pantry::history", ?reason, "history load skipped");
            return HistoryStep::Skip(reason);
        }

        self.guard.record_load(now);
        self.status = HistoryStatus::Loading(HistorySource::Rest);
        self.error = None;
        HistoryStep::FetchPrimary
    }

    /// The REST fetch failed. Falls back to the streaming channel once.
    pub fn primary_failed(&mut self, reason: &str, connected: bool) -> HistoryStep {
        if self.latched {
            debug!(target: "pantry::history", "primary history failure after load, ignoring");
            return HistoryStep::Skip(SkipReason::Latched);
        }
        if connected {
            warn!(target: "pantry::history", error = %reason, "history fetch failed, requesting over stream");
            self.status = HistoryStatus::Loading(HistorySource::Stream);
            self.fallback_attempt += 1;
            HistoryStep::RequestOverStream
        } else {
            self.fail(format!("history unavailable: {reason}"))
        }
    }

    /// The streaming-channel request got no snapshot in time.
    pub fn fallback_timed_out(&mut self, attempt: u64) -> Option<HistoryStep> {
        if attempt != self.fallback_attempt {
            debug!(target: "pantry::history", attempt, current = self.fallback_attempt, "stale fallback timer ignored");
            return None;
        }
        if self.status == HistoryStatus::Loading(HistorySource::Stream) {
            Some(self.fail("history request timed out".to_string()))
        } else {
            None
        }
    }

    /// The connection dropped while history was being requested over it.
    pub fn connection_lost(&mut self) -> Option<HistoryStep> {
        if self.status == HistoryStatus::Loading(HistorySource::Stream) {
            Some(self.fail("connection lost while loading history".to_string()))
        } else {
            None
        }
    }

    /// Appends stored conversations as user/assistant pairs and engages the
    /// latch. Returns how many messages were admitted; zero when the latch was
    /// already set.
    pub fn accept(
        &mut self,
        records: &[ConversationRecord],
        transcript: &mut Transcript,
        dedup: &DedupGuard,
    ) -> usize {
        if self.latched {
            debug!(
                target: "pantry::history",
                conversations = records.len(),
                "history already loaded, dropping snapshot"
            );
            return 0;
        }
        let mut admitted = 0;
        for message in records.iter().flat_map(FinalMessage::pair_from_record) {
            if dedup.admit(transcript, message).is_admitted() {
                admitted += 1;
            }
        }
        self.latched = true;
        self.status = HistoryStatus::Loaded;
        self.error = None;
        info!(
            target: "pantry::history",
            conversations = records.len(),
            admitted,
            "history loaded"
        );
        admitted
    }

    /// Clears both guards so a later connection may load again.
    pub fn reset(&mut self) {
        self.latched = false;
        self.status = HistoryStatus::Idle;
        self.error = None;
        self.guard.clear();
    }

    fn fail(&mut self, reason: String) -> HistoryStep {
        warn!(target: "pantry::history", error = %reason, "history load failed");
        self.status = HistoryStatus::Failed;
        self.error = Some(reason.clone());
        // Nothing was loaded, so a later attempt cannot duplicate anything.
        self.guard.clear();
        HistoryStep::Failed(reason)
    }

    fn loaded_recently(&self, now: OffsetDateTime) -> bool {
        self.guard
            .last_load()
            .map(|at| (now - at).abs() < self.window)
            .unwrap_or(false)
    }
}
