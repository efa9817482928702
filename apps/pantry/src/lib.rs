//! Streaming chat client for the Pantry recipe assistant.
//!
//! [`controller::connect`] wires a WebSocket session from a [`Config`] and
//! returns a [`ChatHandle`]; everything else is the machinery behind it.

pub mod assembler;
pub mod auth;
pub mod config;
pub mod controller;
pub mod dedup;
pub mod history;
pub mod message;
pub mod state;
pub mod telemetry;
pub mod transport;

pub use config::Config;
pub use controller::{ChatHandle, SessionController, SessionError, connect};
pub use message::{Author, FinalMessage, Message, MessageId, PendingReply};
pub use state::{SendRejection, SessionSnapshot, SessionState};
