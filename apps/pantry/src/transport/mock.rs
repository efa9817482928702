use std::sync::Arc;

use pantry_protocol::{ClientEvent, ConnectionStatus, ServerEvent};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Transport, TransportError, TransportEvent};
use crate::auth::Credential;

#[derive(Default)]
struct MockState {
    connected: bool,
    sent: Vec<ClientEvent>,
    credentials: Vec<Option<Credential>>,
    status_on_connect: Option<ConnectionStatus>,
}

/// In-memory transport. Records every outbound event and lets tests inject
/// inbound traffic and connection loss. Clones share state.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            events_tx,
            events_rx: Arc::new(Mutex::new(Some(events_rx))),
        }
    }

    /// Acknowledges every successful connect with `status`, the way a real
    /// backend greets an authenticated socket.
    pub fn acknowledge_with(self, status: ConnectionStatus) -> Self {
        self.state.lock().status_on_connect = Some(status);
        self
    }

    pub fn inject(&self, event: ServerEvent) {
        let _ = self.events_tx.send(TransportEvent::Received(event));
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Simulates the server vanishing without a close handshake.
    pub fn drop_connection(&self, reason: impl Into<String>) {
        self.state.lock().connected = false;
        self.emit(TransportEvent::Disconnected {
            reason: reason.into(),
            reconnecting: false,
        });
    }

    pub fn sent(&self) -> Vec<ClientEvent> {
        self.state.lock().sent.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().credentials.len()
    }

    pub fn last_credential(&self) -> Option<Credential> {
        self.state.lock().credentials.last().cloned().flatten()
    }
}

impl Transport for MockTransport {
    fn connect(&self, credential: Option<Credential>) {
        let status = {
            let mut state = self.state.lock();
            if state.connected {
                return;
            }
            state.credentials.push(credential.clone());
            if credential.is_none() {
                drop(state);
                self.emit(TransportEvent::Error {
                    message: TransportError::MissingCredential.to_string(),
                    fatal: true,
                });
                return;
            }
            state.connected = true;
            state.status_on_connect.clone()
        };
        self.emit(TransportEvent::Connected);
        if let Some(status) = status {
            self.inject(ServerEvent::ConnectionStatus(status));
        }
    }

    fn send(&self, event: ClientEvent) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        state.sent.push(event);
        Ok(())
    }

    fn disconnect(&self) {
        let was_connected = std::mem::take(&mut self.state.lock().connected);
        if was_connected {
            self.emit(TransportEvent::Closed);
        }
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().take()
    }
}
