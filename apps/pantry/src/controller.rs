//! The session actor.
//!
//! [`SessionController`] is a single Tokio task that owns the
//! [`SessionState`], the transport, and the history backend. UI commands and
//! transport events are serialised through one `select!` loop, so all state
//! changes happen on one logical thread. Slow calls (REST fetch, remote clear,
//! timers) run as spawned tasks that report back as [`SessionEvent`]s.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::Credential;
use crate::config::{Config, ConfigError};
use crate::dedup::DedupGuard;
use crate::history::{
    FileGuardStore, HistoryBackend, HistoryError, HistoryReconciler, ReqwestHistoryBackend,
};
use crate::message::MessageId;
use crate::state::{Effect, SendRejection, SessionEvent, SessionSnapshot, SessionState};
use crate::transport::{Transport, TransportEvent, WebSocketConfig, WebSocketTransport};

const COMMAND_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("message rejected: {0}")]
    Rejected(#[from] SendRejection),
    #[error("session controller has stopped")]
    Closed,
    #[error("transport event stream already taken")]
    EventsTaken,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    History(#[from] HistoryError),
}

enum Command {
    Send {
        text: String,
        streaming: bool,
        reply: oneshot::Sender<Result<MessageId, SessionError>>,
    },
    ClearHistory {
        reply: oneshot::Sender<()>,
    },
    Reconnect,
    RetryHistory,
    SelectResult(usize),
    Shutdown,
}

enum Input {
    Command(Option<Command>),
    Event(SessionEvent),
}

/// Cloneable front door used by the UI layer.
#[derive(Clone)]
pub struct ChatHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl ChatHandle {
    pub async fn send_message(&self, text: impl Into<String>) -> Result<MessageId, SessionError> {
        self.send(text.into(), false).await
    }

    pub async fn send_streaming(&self, text: impl Into<String>) -> Result<MessageId, SessionError> {
        self.send(text.into(), true).await
    }

    /// Resolves once the local transcript has been reset, whatever the
    /// remote clear returned.
    pub async fn clear_history(&self) -> Result<(), SessionError> {
        let (reply, done) = oneshot::channel();
        self.command(Command::ClearHistory { reply }).await?;
        done.await.map_err(|_| SessionError::Closed)
    }

    pub async fn reconnect(&self) -> Result<(), SessionError> {
        self.command(Command::Reconnect).await
    }

    pub async fn retry_history(&self) -> Result<(), SessionError> {
        self.command(Command::RetryHistory).await
    }

    pub async fn select_result(&self, index: usize) -> Result<(), SessionError> {
        self.command(Command::SelectResult(index)).await
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    async fn send(&self, text: String, streaming: bool) -> Result<MessageId, SessionError> {
        let (reply, outcome) = oneshot::channel();
        self.command(Command::Send {
            text,
            streaming,
            reply,
        })
        .await?;
        outcome.await.map_err(|_| SessionError::Closed)?
    }

    async fn command(&self, command: Command) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Closed)
    }
}

pub struct SessionController {
    state: SessionState,
    transport: Arc<dyn Transport>,
    backend: Arc<dyn HistoryBackend>,
    credential: Option<Credential>,
    commands: mpsc::Receiver<Command>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    internal_tx: mpsc::UnboundedSender<SessionEvent>,
    internal_rx: mpsc::UnboundedReceiver<SessionEvent>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    pending_clears: Vec<oneshot::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionController {
    /// Starts the actor and opens the connection.
    pub fn spawn(
        state: SessionState,
        transport: Arc<dyn Transport>,
        backend: Arc<dyn HistoryBackend>,
        credential: Option<Credential>,
    ) -> Result<(ChatHandle, JoinHandle<()>), SessionError> {
        let transport_events = transport.take_events().ok_or(SessionError::EventsTaken)?;
        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(state.snapshot());

        let controller = SessionController {
            state,
            transport,
            backend,
            credential,
            commands,
            transport_events,
            internal_tx,
            internal_rx,
            snapshot_tx,
            pending_clears: Vec::new(),
            tasks: Vec::new(),
        };
        let task = tokio::spawn(controller.run());
        let handle = ChatHandle {
            commands: commands_tx,
            snapshot,
        };
        Ok((handle, task))
    }

    async fn run(mut self) {
        info!(target: "pantry::session", session_id = %self.state.session_id(), "session started");
        self.execute(vec![Effect::Connect]);
        loop {
            let input = tokio::select! {
                command = self.commands.recv() => Input::Command(command),
                Some(event) = self.transport_events.recv() => Input::Event(SessionEvent::Transport(event)),
                Some(event) = self.internal_rx.recv() => Input::Event(event),
            };
            match input {
                Input::Command(None) | Input::Command(Some(Command::Shutdown)) => break,
                Input::Command(Some(command)) => self.on_command(command),
                Input::Event(event) => self.dispatch(event),
            }
            self.publish();
            self.tasks.retain(|task| !task.is_finished());
        }

        self.transport.disconnect();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!(target: "pantry::session", session_id = %self.state.session_id(), "session stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Send {
                text,
                streaming,
                reply,
            } => {
                let effects = self.state.apply(SessionEvent::Send { text, streaming }, now());
                let outcome = effects
                    .iter()
                    .find_map(|effect| match effect {
                        Effect::SendAccepted(id) => Some(Ok(*id)),
                        Effect::SendRejected(rejection) => Some(Err(SessionError::from(*rejection))),
                        _ => None,
                    })
                    .unwrap_or(Err(SessionError::Closed));
                self.execute(effects);
                self.publish();
                let _ = reply.send(outcome);
            }
            Command::ClearHistory { reply } => {
                self.pending_clears.push(reply);
                self.dispatch(SessionEvent::ClearHistory);
            }
            Command::Reconnect => self.dispatch(SessionEvent::Reconnect),
            Command::RetryHistory => self.dispatch(SessionEvent::RetryHistory),
            Command::SelectResult(index) => self.dispatch(SessionEvent::SelectResult(index)),
            // Handled by the run loop.
            Command::Shutdown => {}
        }
    }

    fn dispatch(&mut self, event: SessionEvent) {
        let clear_finished = matches!(event, SessionEvent::RemoteClearFinished(_));
        let effects = self.state.apply(event, now());
        self.execute(effects);
        if clear_finished {
            self.publish();
            for reply in self.pending_clears.drain(..) {
                let _ = reply.send(());
            }
        }
    }

    fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Connect => self.transport.connect(self.credential.clone()),
                Effect::Disconnect => self.transport.disconnect(),
                Effect::ScheduleReconnect(delay) => {
                    self.after(delay, SessionEvent::ReconnectDue);
                }
                Effect::Emit(event) => {
                    let name = event.name();
                    if let Err(err) = self.transport.send(event) {
                        warn!(target: "pantry::session", event = name, error = %err, "failed to emit event");
                    }
                }
                Effect::FetchHistory => {
                    let backend = Arc::clone(&self.backend);
                    let credential = self.credential.clone();
                    self.background(async move {
                        let result = backend
                            .fetch_history(credential.as_ref())
                            .await
                            .map_err(|err| err.to_string());
                        SessionEvent::HistoryFetched(result)
                    });
                }
                Effect::ArmHistoryFallback { timeout, attempt } => {
                    self.after(timeout, SessionEvent::HistoryFallbackTimedOut(attempt));
                }
                Effect::ClearRemoteHistory => {
                    let backend = Arc::clone(&self.backend);
                    let credential = self.credential.clone();
                    self.background(async move {
                        let result = backend
                            .clear_history(credential.as_ref())
                            .await
                            .map_err(|err| err.to_string());
                        SessionEvent::RemoteClearFinished(result)
                    });
                }
                Effect::SendAccepted(_) | Effect::SendRejected(_) => {}
            }
        }
    }

    fn after(&mut self, delay: Duration, event: SessionEvent) {
        debug!(target: "pantry::session", delay_ms = delay.as_millis() as u64, "timer armed");
        self.background(async move {
            tokio::time::sleep(delay).await;
            event
        });
    }

    fn background<F>(&mut self, work: F)
    where
        F: std::future::Future<Output = SessionEvent> + Send + 'static,
    {
        let tx = self.internal_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            let _ = tx.send(work.await);
        }));
    }

    fn publish(&self) {
        let next = self.state.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Wires the WebSocket transport, REST history backend, and on-disk history
/// guard from `config`, then starts the session.
pub fn connect(config: &Config) -> Result<(ChatHandle, JoinHandle<()>), SessionError> {
    let websocket = WebSocketConfig {
        url: config.websocket_url()?,
        reconnect: config.reconnect_policy(),
        heartbeat: config.heartbeat,
    };
    let transport = Arc::new(WebSocketTransport::new(websocket));
    let backend = Arc::new(ReqwestHistoryBackend::new(&config.base_url()?)?);
    let guard = Arc::new(FileGuardStore::new(config.history_guard_path()?));
    let history = HistoryReconciler::new(guard, config.history_guard_window());
    let state = SessionState::new(history, DedupGuard::new(config.dedup_window()));
    SessionController::spawn(state, transport, backend, config.credential())
}
