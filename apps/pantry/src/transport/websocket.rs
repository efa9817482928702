//! WebSocket realisation of [`Transport`].
//!
//! A single driver task per `connect()` owns the socket. It opens the
//! connection, pumps frames in both directions with a heartbeat ping, and on
//! unexpected closure walks the [`ReconnectPolicy`] before giving up with a
//! fatal error. Events from a superseded driver are dropped by generation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pantry_protocol::{ClientEvent, ProtocolError, decode_server_frame};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::AUTHORIZATION};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};
use url::Url;

use super::{ReconnectPolicy, Transport, TransportError, TransportEvent};
use crate::auth::Credential;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    pub url: Url,
    pub reconnect: ReconnectPolicy,
    /// `None` disables the heartbeat.
    pub heartbeat: Option<Duration>,
}

impl WebSocketConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            reconnect: ReconnectPolicy::default(),
            heartbeat: Some(Duration::from_secs(25)),
        }
    }
}

struct Connection {
    outbound: mpsc::UnboundedSender<ClientEvent>,
    task: JoinHandle<()>,
}

pub struct WebSocketTransport {
    config: WebSocketConfig,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    connection: Mutex<Option<Connection>>,
    connected: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
}

impl WebSocketTransport {
    pub fn new(config: WebSocketConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            connection: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn url(&self) -> &Url {
        &self.config.url
    }
}

impl Transport for WebSocketTransport {
    fn connect(&self, credential: Option<Credential>) {
        let mut connection = self.connection.lock();
        if connection
            .as_ref()
            .is_some_and(|existing| !existing.task.is_finished())
        {
            debug!(target: "pantry::transport", "connect ignored, already connected");
            return;
        }
        let Some(credential) = credential else {
            warn!(target: "pantry::transport", "connect refused: no credential");
            let _ = self.events_tx.send(TransportEvent::Error {
                message: TransportError::MissingCredential.to_string(),
                fatal: true,
            });
            return;
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            url: self.config.url.clone(),
            credential,
            policy: self.config.reconnect,
            heartbeat: self.config.heartbeat,
            emitter: Emitter {
                tx: self.events_tx.clone(),
                current: Arc::clone(&self.generation),
                mine: generation,
                connected: Arc::clone(&self.connected),
            },
        };
        let task = tokio::spawn(driver.run(outbound_rx));
        *connection = Some(Connection {
            outbound: outbound_tx,
            task,
        });
    }

    fn send(&self, event: ClientEvent) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let connection = self.connection.lock();
        let connection = connection.as_ref().ok_or(TransportError::NotConnected)?;
        trace!(target: "pantry::transport", event = event.name(), "queueing outbound event");
        connection
            .outbound
            .send(event)
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn disconnect(&self) {
        let Some(connection) = self.connection.lock().take() else {
            return;
        };
        // Stale the running driver before it can report anything else.
        self.generation.fetch_add(1, Ordering::SeqCst);
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        drop(connection.outbound);
        if !was_connected {
            connection.task.abort();
        }
        info!(target: "pantry::transport", url = %self.config.url, "disconnected");
        let _ = self.events_tx.send(TransportEvent::Closed);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().take()
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.lock().take() {
            connection.task.abort();
        }
    }
}

struct Emitter {
    tx: mpsc::UnboundedSender<TransportEvent>,
    current: Arc<AtomicU64>,
    mine: u64,
    connected: Arc<AtomicBool>,
}

impl Emitter {
    fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.mine
    }

    fn emit(&self, event: TransportEvent) {
        if self.is_current() {
            let _ = self.tx.send(event);
        }
    }

    fn set_connected(&self, connected: bool) {
        if self.is_current() {
            self.connected.store(connected, Ordering::SeqCst);
        }
    }
}

enum PumpEnd {
    /// The local side hung up (outbound channel closed).
    Local,
    Remote(String),
}

struct Driver {
    url: Url,
    credential: Credential,
    policy: ReconnectPolicy,
    heartbeat: Option<Duration>,
    emitter: Emitter,
}

impl Driver {
    async fn run(self, mut outbound: mpsc::UnboundedReceiver<ClientEvent>) {
        let mut attempt = 0u32;
        loop {
            let opened = tokio::select! {
                opened = self.open() => opened,
                _ = closed(&mut outbound) => return,
            };
            let reason = match opened {
                Ok(socket) => {
                    if attempt > 0 {
                        info!(target: "pantry::transport", attempt, "reconnected");
                    } else {
                        info!(target: "pantry::transport", url = %self.url, "connected");
                    }
                    attempt = 0;
                    self.emitter.set_connected(true);
                    self.emitter.emit(TransportEvent::Connected);
                    let end = self.pump(socket, &mut outbound).await;
                    self.emitter.set_connected(false);
                    match end {
                        PumpEnd::Local => return,
                        PumpEnd::Remote(reason) => reason,
                    }
                }
                Err(err) => err.to_string(),
            };

            attempt += 1;
            let Some(delay) = self.policy.delay_for(attempt) else {
                warn!(
                    target: "pantry::transport",
                    attempts = self.policy.max_attempts,
                    reason = %reason,
                    "reconnect budget exhausted"
                );
                self.emitter.emit(TransportEvent::Error {
                    message: format!(
                        "connection lost after {} reconnect attempts: {reason}",
                        self.policy.max_attempts
                    ),
                    fatal: true,
                });
                return;
            };
            warn!(
                target: "pantry::transport",
                attempt,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "connection lost, scheduling reconnect"
            );
            self.emitter.emit(TransportEvent::Disconnected {
                reason,
                reconnecting: true,
            });
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = closed(&mut outbound) => return,
            }
        }
    }

    async fn open(&self) -> Result<Socket, TransportError> {
        let mut request = self.url.as_str().into_client_request()?;
        let header = HeaderValue::from_str(&self.credential.header_value())
            .map_err(|err| TransportError::InvalidCredential(err.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, header);
        let (socket, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| TransportError::Timeout)??;
        Ok(socket)
    }

    async fn pump(
        &self,
        socket: Socket,
        outbound: &mut mpsc::UnboundedReceiver<ClientEvent>,
    ) -> PumpEnd {
        let (mut sink, mut stream) = socket.split();
        let mut heartbeat = self.heartbeat.map(|period| {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        loop {
            tokio::select! {
                outgoing = outbound.recv() => match outgoing {
                    Some(event) => {
                        let text = match event.to_text() {
                            Ok(text) => text,
                            Err(err) => {
                                warn!(target: "pantry::transport", event = event.name(), error = %err, "failed to encode outbound event");
                                continue;
                            }
                        };
                        if let Err(err) = sink.send(Message::Text(text)).await {
                            return PumpEnd::Remote(err.to_string());
                        }
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return PumpEnd::Local;
                    }
                },
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.dispatch(&text),
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|frame| frame.reason.to_string())
                            .filter(|reason| !reason.is_empty())
                            .unwrap_or_else(|| "server closed the connection".to_string());
                        return PumpEnd::Remote(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        match &err {
                            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                                debug!(target: "pantry::transport", "websocket closed: {err}");
                            }
                            _ => warn!(target: "pantry::transport", "websocket error: {err}"),
                        }
                        return PumpEnd::Remote(err.to_string());
                    }
                    None => return PumpEnd::Remote("connection closed".to_string()),
                },
                _ = tick(&mut heartbeat) => {
                    trace!(target: "pantry::transport", "heartbeat");
                    if let Err(err) = sink.send(Message::Ping(Vec::new())).await {
                        return PumpEnd::Remote(err.to_string());
                    }
                }
            }
        }
    }

    fn dispatch(&self, text: &str) {
        match decode_server_frame(text) {
            Ok(event) => {
                trace!(target: "pantry::transport", event = event.name(), len = text.len(), "inbound event");
                self.emitter.emit(TransportEvent::Received(event));
            }
            Err(ProtocolError::UnknownEvent(name)) => {
                debug!(target: "pantry::transport", event = %name, "ignoring unknown event");
            }
            Err(err) => {
                warn!(target: "pantry::transport", error = %err, "dropping malformed frame");
            }
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Resolves once the local side has hung up. Events queued while offline are
/// dropped; callers only send while connected.
async fn closed(outbound: &mut mpsc::UnboundedReceiver<ClientEvent>) {
    while outbound.recv().await.is_some() {}
}
