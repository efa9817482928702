//! Pure session state machine.
//!
//! Every input, whether a UI command, transport event, or the result of a
//! spawned side task, goes through [`SessionState::apply`], which mutates the
//! state and returns the [`Effect`]s the controller must carry out. Nothing in
//! here performs I/O, so the whole protocol is testable without a socket.

use std::time::Duration;

use pantry_protocol::{
    ClientEvent, ConversationRecord, HistoryRequest, OutboundMessage, ServerEvent, StreamChunk,
    UserIdentity,
};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::assembler::{AssemblyOutcome, StreamAssembler};
use crate::auth::AuthHandshake;
use crate::dedup::{Admission, DedupGuard};
use crate::history::{HistoryReconciler, HistorySource, HistoryStatus, HistoryStep};
use crate::message::{FinalMessage, Message, MessageId, Transcript};
use crate::transport::TransportEvent;

pub const INITIAL_STAGE: &str = "greeting";
pub const RECONNECT_DELAY: Duration = Duration::from_millis(500);
pub const HISTORY_FALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendRejection {
    #[error("message is empty")]
    Empty,
    #[error("not connected")]
    NotConnected,
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("a response is still streaming")]
    Streaming,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Transport(TransportEvent),
    Send { text: String, streaming: bool },
    ClearHistory,
    Reconnect,
    ReconnectDue,
    RetryHistory,
    SelectResult(usize),
    HistoryFetched(Result<Vec<ConversationRecord>, String>),
    /// Carries the fallback attempt the timer was armed for.
    HistoryFallbackTimedOut(u64),
    RemoteClearFinished(Result<(), String>),
}

impl SessionEvent {
    fn kind(&self) -> &'static str {
        match self {
            SessionEvent::Transport(_) => "transport",
            SessionEvent::Send { .. } => "send",
            SessionEvent::ClearHistory => "clear_history",
            SessionEvent::Reconnect => "reconnect",
            SessionEvent::ReconnectDue => "reconnect_due",
            SessionEvent::RetryHistory => "retry_history",
            SessionEvent::SelectResult(_) => "select_result",
            SessionEvent::HistoryFetched(_) => "history_fetched",
            SessionEvent::HistoryFallbackTimedOut(_) => "history_fallback_timeout",
            SessionEvent::RemoteClearFinished(_) => "remote_clear_finished",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Connect,
    Disconnect,
    ScheduleReconnect(Duration),
    Emit(ClientEvent),
    FetchHistory,
    ArmHistoryFallback { timeout: Duration, attempt: u64 },
    ClearRemoteHistory,
    SendAccepted(MessageId),
    SendRejected(SendRejection),
}

/// Read-only view published to UI consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub is_connected: bool,
    pub is_authenticated: bool,
    pub messages: Vec<Message>,
    pub is_streaming: bool,
    pub connection_error: Option<String>,
    pub session_id: String,
    pub current_stage: String,
    pub can_send_message: bool,
    pub history_status: HistoryStatus,
    pub history_error: Option<String>,
    pub response_error: Option<String>,
    /// Structured results attached to the latest assistant message.
    pub selected_results: Vec<Value>,
    pub selected_index: Option<usize>,
    pub user: Option<UserIdentity>,
}

pub struct SessionState {
    session_id: String,
    stage: String,
    connected: bool,
    auth: AuthHandshake,
    transcript: Transcript,
    assembler: StreamAssembler,
    dedup: DedupGuard,
    history: HistoryReconciler,
    awaiting_stream: bool,
    connection_error: Option<String>,
    response_error: Option<String>,
    selected_index: Option<usize>,
}

impl SessionState {
    pub fn new(history: HistoryReconciler, dedup: DedupGuard) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            stage: INITIAL_STAGE.to_string(),
            connected: false,
            auth: AuthHandshake::new(),
            transcript: Transcript::new(),
            assembler: StreamAssembler::new(),
            dedup,
            history,
            awaiting_stream: false,
            connection_error: None,
            response_error: None,
            selected_index: None,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.is_authenticated()
    }

    pub fn is_streaming(&self) -> bool {
        self.assembler.is_active() || self.awaiting_stream
    }

    pub fn can_send_message(&self) -> bool {
        self.connected && self.is_authenticated() && !self.is_streaming()
    }

    pub fn connection_error(&self) -> Option<&str> {
        self.connection_error.as_deref()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            is_connected: self.connected,
            is_authenticated: self.is_authenticated(),
            messages: self.transcript.messages().to_vec(),
            is_streaming: self.is_streaming(),
            connection_error: self.connection_error.clone(),
            session_id: self.session_id.clone(),
            current_stage: self.stage.clone(),
            can_send_message: self.can_send_message(),
            history_status: self.history.status(),
            history_error: self.history.error().map(str::to_string),
            response_error: self.response_error.clone(),
            selected_results: self.latest_results().to_vec(),
            selected_index: self.selected_index,
            user: self.auth.identity().cloned(),
        }
    }

    pub fn apply(&mut self, event: SessionEvent, now: OffsetDateTime) -> Vec<Effect> {
        debug!(target: "pantry::session", event = event.kind(), "apply");
        match event {
            SessionEvent::Transport(event) => self.on_transport(event, now),
            SessionEvent::Send { text, streaming } => self.on_send(text, streaming, now),
            SessionEvent::ClearHistory => self.on_clear_history(),
            SessionEvent::Reconnect => {
                vec![Effect::Disconnect, Effect::ScheduleReconnect(RECONNECT_DELAY)]
            }
            SessionEvent::ReconnectDue => vec![Effect::Connect],
            SessionEvent::RetryHistory => {
                let step = self.history.begin(now, true);
                self.history_effects(step)
            }
            SessionEvent::SelectResult(index) => {
                self.on_select(index);
                Vec::new()
            }
            SessionEvent::HistoryFetched(result) => self.on_history_fetched(result),
            SessionEvent::HistoryFallbackTimedOut(attempt) => {
                self.history.fallback_timed_out(attempt);
                Vec::new()
            }
            SessionEvent::RemoteClearFinished(result) => {
                if let Err(reason) = result {
                    warn!(target: "pantry::history", error = %reason, "remote history clear failed, resetting locally anyway");
                }
                self.reset_local();
                Vec::new()
            }
        }
    }

    fn on_transport(&mut self, event: TransportEvent, now: OffsetDateTime) -> Vec<Effect> {
        match event {
            TransportEvent::Connected => {
                self.connected = true;
                self.connection_error = None;
                self.auth.reset();
                Vec::new()
            }
            TransportEvent::Received(event) => {
                if !self.connected {
                    debug!(target: "pantry::session", event = event.name(), "dropping event received while disconnected");
                    return Vec::new();
                }
                self.adopt_session_id(&event);
                self.on_server_event(event, now)
            }
            TransportEvent::Closed => {
                self.teardown();
                Vec::new()
            }
            TransportEvent::Disconnected { reason, reconnecting } => {
                info!(target: "pantry::session", reason = %reason, reconnecting, "connection lost");
                self.teardown();
                self.connection_error = Some(reason);
                Vec::new()
            }
            TransportEvent::Error { message, fatal } => {
                if fatal {
                    self.teardown();
                }
                self.connection_error = Some(message);
                Vec::new()
            }
        }
    }

    fn on_server_event(&mut self, event: ServerEvent, now: OffsetDateTime) -> Vec<Effect> {
        match event {
            ServerEvent::ConnectionStatus(status) => {
                self.auth.acknowledge(&status);
                if let Some(reason) = self.auth.rejection() {
                    self.connection_error = Some(reason.to_string());
                    return Vec::new();
                }
                self.connection_error = None;
                let step = self.history.begin(now, false);
                self.history_effects(step)
            }
            ServerEvent::StreamingChunk(chunk) => {
                self.on_chunk(chunk, now);
                Vec::new()
            }
            ServerEvent::DirectResponse(response) => {
                let metadata = response.folded_metadata();
                self.note_stage(metadata.stage.as_deref());
                let message = FinalMessage::assistant(response.content, now, metadata);
                if self.dedup.admit(&mut self.transcript, message).is_admitted() {
                    self.selected_index = None;
                    self.response_error = None;
                }
                Vec::new()
            }
            ServerEvent::HistorySnapshot(snapshot) => {
                self.history
                    .accept(&snapshot.conversations, &mut self.transcript, &self.dedup);
                Vec::new()
            }
            ServerEvent::HistoryCleared => {
                debug!(target: "pantry::history", "server acknowledged history clear");
                Vec::new()
            }
            ServerEvent::Error(error) => {
                warn!(target: "pantry::session", message = %error.message, "server reported an error");
                self.abandon_stream();
                self.response_error = Some(error.message);
                Vec::new()
            }
        }
    }

    fn on_chunk(&mut self, chunk: StreamChunk, now: OffsetDateTime) {
        self.note_stage(chunk.metadata.as_ref().and_then(|m| m.stage.as_deref()));
        match self.assembler.apply(chunk, now) {
            AssemblyOutcome::Started(reply) | AssemblyOutcome::Updated(reply) => {
                self.transcript.upsert_pending(reply);
            }
            AssemblyOutcome::Finalized {
                placeholder_id,
                message,
            } => {
                self.awaiting_stream = false;
                self.response_error = None;
                let existing = self.dedup.find_duplicate(
                    self.transcript.iter().filter(|entry| entry.id() != placeholder_id),
                    &message,
                );
                match existing {
                    Some(existing) => {
                        debug!(
                            target: "pantry::dedup",
                            existing = %existing,
                            "finalized reply already delivered, dropping placeholder"
                        );
                        self.transcript.discard_pending();
                    }
                    None => {
                        debug!(target: "pantry::assembler", message_id = %message.id, "response finalized");
                        self.transcript.finalize_pending(message);
                        self.selected_index = None;
                    }
                }
            }
            AssemblyOutcome::Failed(reason) => {
                self.transcript.discard_pending();
                self.awaiting_stream = false;
                self.response_error = Some(reason);
            }
            AssemblyOutcome::Ignored => {}
        }
    }

    fn on_send(&mut self, text: String, streaming: bool, now: OffsetDateTime) -> Vec<Effect> {
        let text = text.trim();
        let rejection = if text.is_empty() {
            Some(SendRejection::Empty)
        } else if !self.connected {
            Some(SendRejection::NotConnected)
        } else if !self.is_authenticated() {
            Some(SendRejection::NotAuthenticated)
        } else if self.is_streaming() {
            Some(SendRejection::Streaming)
        } else {
            None
        };
        if let Some(rejection) = rejection {
            debug!(target: "pantry::session", %rejection, "send rejected");
            return vec![Effect::SendRejected(rejection)];
        }

        let message = FinalMessage::user(text, now);
        let id = match self.dedup.admit(&mut self.transcript, message) {
            Admission::Admitted(id) => id,
            Admission::Duplicate(existing) => {
                debug!(target: "pantry::session", message_id = %existing, "repeated send folded into existing turn");
                return vec![Effect::SendAccepted(existing)];
            }
        };
        let payload = OutboundMessage {
            message: text.to_string(),
            session_id: self.session_id.clone(),
        };
        let event = if streaming {
            self.awaiting_stream = true;
            ClientEvent::StreamingMessage(payload)
        } else {
            ClientEvent::DirectMessage(payload)
        };
        self.response_error = None;
        debug!(target: "pantry::session", message_id = %id, streaming, session_id = %self.session_id, "sending message");
        vec![Effect::Emit(event), Effect::SendAccepted(id)]
    }

    fn on_clear_history(&mut self) -> Vec<Effect> {
        let mut effects = vec![Effect::ClearRemoteHistory];
        if self.connected && self.is_authenticated() {
            effects.push(Effect::Emit(ClientEvent::ClearHistory));
        }
        effects
    }

    fn on_select(&mut self, index: usize) {
        if index < self.latest_results().len() {
            self.selected_index = Some(index);
        } else {
            debug!(target: "pantry::session", index, "selection out of range");
        }
    }

    fn on_history_fetched(
        &mut self,
        result: Result<Vec<ConversationRecord>, String>,
    ) -> Vec<Effect> {
        if self.history.status() != HistoryStatus::Loading(HistorySource::Rest) {
            debug!(target: "pantry::history", "stale history fetch result dropped");
            return Vec::new();
        }
        match result {
            Ok(records) => {
                self.history
                    .accept(&records, &mut self.transcript, &self.dedup);
                Vec::new()
            }
            Err(reason) => {
                let step = self
                    .history
                    .primary_failed(&reason, self.connected && self.is_authenticated());
                self.history_effects(step)
            }
        }
    }

    fn history_effects(&self, step: HistoryStep) -> Vec<Effect> {
        match step {
            HistoryStep::FetchPrimary => vec![Effect::FetchHistory],
            HistoryStep::RequestOverStream => vec![
                Effect::Emit(ClientEvent::RequestHistory(HistoryRequest {
                    session_id: Some(self.session_id.clone()),
                })),
                Effect::ArmHistoryFallback {
                    timeout: HISTORY_FALLBACK_TIMEOUT,
                    attempt: self.history.fallback_attempt(),
                },
            ],
            HistoryStep::Failed(_) | HistoryStep::Skip(_) => Vec::new(),
        }
    }

    fn adopt_session_id(&mut self, event: &ServerEvent) {
        if let Some(session_id) = event.session_id() {
            if session_id != self.session_id {
                info!(
                    target: "pantry::session",
                    previous = %self.session_id,
                    session_id = %session_id,
                    "server reassigned session id"
                );
                self.session_id = session_id.to_string();
            }
        }
    }

    fn note_stage(&mut self, stage: Option<&str>) {
        if let Some(stage) = stage.map(str::trim).filter(|stage| !stage.is_empty()) {
            self.stage = stage.to_string();
        }
    }

    fn abandon_stream(&mut self) {
        self.assembler.abandon();
        self.transcript.discard_pending();
        self.awaiting_stream = false;
    }

    fn teardown(&mut self) {
        self.connected = false;
        self.auth.reset();
        self.abandon_stream();
        self.history.connection_lost();
    }

    fn reset_local(&mut self) {
        self.abandon_stream();
        self.transcript.clear();
        self.selected_index = None;
        self.stage = INITIAL_STAGE.to_string();
        self.response_error = None;
        self.history.reset();
        self.session_id = Uuid::new_v4().to_string();
        info!(target: "pantry::session", session_id = %self.session_id, "local history cleared, new session");
    }

    fn latest_results(&self) -> &[Value] {
        self.transcript
            .last_assistant()
            .and_then(|message| message.metadata.as_ref())
            .map(|metadata| metadata.structured_results.as_slice())
            .unwrap_or(&[])
    }
}
