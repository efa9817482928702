//! Shared protocol definitions for the Pantry chat client ↔ assistant backend.
//! Keeping the wire vocabulary in its own crate lets test harnesses and the
//! client agree on frame shapes without pulling in the runtime.

pub mod chunk;
pub mod events;
pub mod history;
pub mod metadata;

pub use chunk::{ChunkKind, StreamChunk};
pub use events::{
    decode_client_frame, decode_server_frame, ClientEvent, ConnectionStatus, DirectResponse,
    HistoryRequest, OutboundMessage, ProtocolError, ServerError, ServerEvent, UserIdentity,
};
pub use history::{ConversationRecord, HistorySnapshot};
pub use metadata::MessageMetadata;
