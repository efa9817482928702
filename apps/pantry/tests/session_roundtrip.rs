use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use pantry_chat_core::auth::Credential;
use pantry_chat_core::dedup::DedupGuard;
use pantry_chat_core::history::{
    DEFAULT_GUARD_WINDOW, HistoryReconciler, HistoryStatus, MemoryGuardStore,
    ReqwestHistoryBackend,
};
use pantry_chat_core::transport::websocket::{WebSocketConfig, WebSocketTransport};
use pantry_chat_core::{
    Author, ChatHandle, Message, SendRejection, SessionController, SessionError, SessionSnapshot,
    SessionState,
};
use pantry_protocol::{
    ClientEvent, ConnectionStatus, ConversationRecord, DirectResponse, HistorySnapshot,
    MessageMetadata, ServerEvent, StreamChunk, UserIdentity, decode_client_frame,
};
use parking_lot::Mutex;
use serde_json::json;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use url::Url;

const TOKEN: &str = "test-token";

#[derive(Default)]
struct Backend {
    history: Mutex<Vec<ConversationRecord>>,
    fail_fetch: AtomicBool,
    fail_clear: AtomicBool,
    drop_mid_stream: AtomicBool,
    hold_stream: AtomicBool,
    duplicate_replies: AtomicBool,
    fetch_calls: AtomicUsize,
    clear_calls: AtomicUsize,
    history_requests: AtomicUsize,
}

impl Backend {
    fn with_history(records: Vec<ConversationRecord>) -> Arc<Self> {
        let backend = Backend::default();
        *backend.history.lock() = records;
        Arc::new(backend)
    }

    fn snapshot(&self) -> HistorySnapshot {
        HistorySnapshot {
            conversations: self.history.lock().clone(),
            session_id: Some("s1".into()),
        }
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == format!("Bearer {TOKEN}"))
}

async fn chat_socket(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(backend): State<Arc<Backend>>,
) -> Response {
    let authorized = authorized(&headers);
    ws.on_upgrade(move |socket| serve_socket(socket, backend, authorized))
}

async fn send(socket: &mut WebSocket, event: ServerEvent) -> bool {
    let text = event.to_text().expect("server event encodes");
    socket.send(WsMessage::Text(text)).await.is_ok()
}

async fn serve_socket(mut socket: WebSocket, backend: Arc<Backend>, authorized: bool) {
    let status = if authorized {
        ConnectionStatus {
            user: Some(UserIdentity {
                id: "u-1".into(),
                email: Some("cook@example.com".into()),
                name: Some("Cook".into()),
            }),
            session_id: Some("s1".into()),
            message: None,
        }
    } else {
        ConnectionStatus {
            message: Some("invalid token".into()),
            ..Default::default()
        }
    };
    if !send(&mut socket, ServerEvent::ConnectionStatus(status)).await {
        return;
    }

    while let Some(Ok(frame)) = socket.recv().await {
        let WsMessage::Text(text) = frame else {
            continue;
        };
        let Ok(event) = decode_client_frame(&text) else {
            continue;
        };
        match event {
            ClientEvent::DirectMessage(_) => {
                let reply = ServerEvent::DirectResponse(DirectResponse {
                    content: "여기 레시피입니다".into(),
                    session_id: Some("s1".into()),
                    recipes: Some(vec![json!({ "title": "carbonara" })]),
                    ..Default::default()
                });
                let repeats = if backend.duplicate_replies.load(Ordering::SeqCst) {
                    2
                } else {
                    1
                };
                for _ in 0..repeats {
                    send(&mut socket, reply.clone()).await;
                }
                if repeats > 1 {
                    send(
                        &mut socket,
                        ServerEvent::DirectResponse(DirectResponse {
                            content: "끝".into(),
                            ..Default::default()
                        }),
                    )
                    .await;
                }
            }
            ClientEvent::StreamingMessage(_) => {
                let stage = MessageMetadata {
                    stage: Some("recommendation".into()),
                    ..Default::default()
                };
                for chunk in [
                    StreamChunk::typing(),
                    StreamChunk::metadata(stage),
                    StreamChunk::token("안"),
                    StreamChunk::token("녕"),
                ] {
                    send(&mut socket, ServerEvent::StreamingChunk(chunk.with_session_id("s1"))).await;
                }
                if backend.drop_mid_stream.load(Ordering::SeqCst) {
                    return;
                }
                if backend.hold_stream.load(Ordering::SeqCst) {
                    continue;
                }
                let mut last = StreamChunk::content("안녕하세요");
                last.is_complete = true;
                send(&mut socket, ServerEvent::StreamingChunk(last)).await;
            }
            ClientEvent::RequestHistory(_) => {
                backend.history_requests.fetch_add(1, Ordering::SeqCst);
                send(&mut socket, ServerEvent::HistorySnapshot(backend.snapshot())).await;
            }
            ClientEvent::ClearHistory => {
                send(&mut socket, ServerEvent::HistoryCleared).await;
            }
        }
    }
}

async fn fetch_history(headers: HeaderMap, State(backend): State<Arc<Backend>>) -> Response {
    backend.fetch_calls.fetch_add(1, Ordering::SeqCst);
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if backend.fail_fetch.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    axum::Json(backend.snapshot()).into_response()
}

async fn clear_history(State(backend): State<Arc<Backend>>) -> StatusCode {
    backend.clear_calls.fetch_add(1, Ordering::SeqCst);
    if backend.fail_clear.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    backend.history.lock().clear();
    StatusCode::NO_CONTENT
}

async fn serve(backend: Arc<Backend>) -> SocketAddr {
    let app = Router::new()
        .route("/ws/chat", get(chat_socket))
        .route("/api/chat/history", get(fetch_history).delete(clear_history))
        .with_state(backend);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server");
    });
    addr
}

fn start(addr: SocketAddr, token: &str) -> (ChatHandle, JoinHandle<()>) {
    let base = Url::parse(&format!("http://{addr}/")).unwrap();
    let ws_url = Url::parse(&format!("ws://{addr}/ws/chat")).unwrap();
    let transport = Arc::new(WebSocketTransport::new(WebSocketConfig::new(ws_url)));
    let backend = Arc::new(ReqwestHistoryBackend::new(&base).unwrap());
    let history = HistoryReconciler::new(Arc::new(MemoryGuardStore::new()), DEFAULT_GUARD_WINDOW);
    let state = SessionState::new(history, DedupGuard::default());
    SessionController::spawn(state, transport, backend, Credential::new(token)).unwrap()
}

async fn wait_for(
    handle: &ChatHandle,
    condition: impl FnMut(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    let mut updates = handle.subscribe();
    let snapshot = updates.wait_for(condition).await.unwrap().clone();
    snapshot
}

fn record(message: &str, response: &str) -> ConversationRecord {
    ConversationRecord {
        message: message.into(),
        response: response.into(),
        timestamp: OffsetDateTime::now_utc(),
        metadata: None,
    }
}

#[test_timeout::tokio_timeout_test]
async fn direct_message_yields_one_user_and_one_assistant_message() {
    let addr = serve(Arc::new(Backend::default())).await;
    let (chat, _task) = start(addr, TOKEN);
    let ready = wait_for(&chat, |s| {
        s.can_send_message && s.history_status == HistoryStatus::Loaded
    })
    .await;
    assert_eq!(ready.session_id, "s1");
    assert_eq!(ready.user.as_ref().map(|u| u.id.as_str()), Some("u-1"));

    chat.send_message("파스타 추천해줘").await.unwrap();
    let snapshot = wait_for(&chat, |s| s.messages.len() == 2).await;

    let authors: Vec<_> = snapshot
        .messages
        .iter()
        .map(|m| match m {
            Message::Final(message) => message.author,
            Message::Pending(_) => panic!("unexpected pending message"),
        })
        .collect();
    assert_eq!(authors, vec![Author::User, Author::Assistant]);
    assert_eq!(snapshot.messages[1].content(), "여기 레시피입니다");
    assert!(!snapshot.is_streaming);
    assert_eq!(snapshot.selected_results, vec![json!({ "title": "carbonara" })]);
}

#[test_timeout::tokio_timeout_test]
async fn streamed_reply_finalizes_with_terminal_content() {
    let addr = serve(Arc::new(Backend::default())).await;
    let (chat, _task) = start(addr, TOKEN);
    wait_for(&chat, |s| s.can_send_message).await;

    chat.send_streaming("인사해줘").await.unwrap();
    let mut updates = chat.subscribe();
    let done = loop {
        let snapshot = updates.borrow_and_update().clone();
        assert!(snapshot.messages.iter().filter(|m| m.is_streaming()).count() <= 1);
        if snapshot.messages.len() == 2 && !snapshot.is_streaming {
            break snapshot;
        }
        updates.changed().await.unwrap();
    };

    assert!(done.messages.iter().all(|m| !m.is_streaming()));
    assert_eq!(done.messages[1].content(), "안녕하세요");
    assert_eq!(done.current_stage, "recommendation");
    assert!(done.can_send_message);
}

#[test_timeout::tokio_timeout_test]
async fn racing_history_triggers_load_each_conversation_once() {
    let backend = Backend::with_history(vec![record("q1", "a1"), record("q2", "a2")]);
    let addr = serve(Arc::clone(&backend)).await;
    let (chat, _task) = start(addr, TOKEN);

    chat.retry_history().await.unwrap();
    chat.retry_history().await.unwrap();
    wait_for(&chat, |s| s.history_status == HistoryStatus::Loaded).await;
    chat.retry_history().await.unwrap();

    chat.reconnect().await.unwrap();
    wait_for(&chat, |s| !s.is_connected).await;
    let snapshot = wait_for(&chat, |s| s.is_authenticated).await;

    assert_eq!(snapshot.messages.len(), 4);
    let contents: Vec<_> = snapshot.messages.iter().map(Message::content).collect();
    assert_eq!(contents, vec!["q1", "a1", "q2", "a2"]);
}

#[test_timeout::tokio_timeout_test]
async fn disconnect_mid_stream_leaves_nothing_streaming() {
    let backend = Arc::new(Backend::default());
    backend.drop_mid_stream.store(true, Ordering::SeqCst);
    let addr = serve(Arc::clone(&backend)).await;
    let (chat, _task) = start(addr, TOKEN);
    wait_for(&chat, |s| s.can_send_message).await;

    chat.send_streaming("hi").await.unwrap();
    let snapshot = wait_for(&chat, |s| s.connection_error.is_some()).await;

    assert!(!snapshot.is_connected);
    assert!(!snapshot.is_streaming);
    assert!(snapshot.messages.iter().all(|m| !m.is_streaming()));
    assert_eq!(snapshot.messages.len(), 1);
}

#[test_timeout::tokio_timeout_test]
async fn clear_history_resets_locally_when_remote_clear_fails() {
    let backend = Backend::with_history(vec![record("q", "a")]);
    backend.fail_clear.store(true, Ordering::SeqCst);
    let addr = serve(Arc::clone(&backend)).await;
    let (chat, _task) = start(addr, TOKEN);
    wait_for(&chat, |s| s.messages.len() == 2 && s.can_send_message).await;

    chat.send_streaming("추천").await.unwrap();
    wait_for(&chat, |s| s.current_stage == "recommendation" && !s.is_streaming).await;

    chat.clear_history().await.unwrap();
    let snapshot = chat.snapshot();
    assert!(snapshot.messages.is_empty());
    assert_eq!(snapshot.current_stage, "greeting");
    assert_eq!(snapshot.history_status, HistoryStatus::Idle);
    assert_eq!(backend.clear_calls.load(Ordering::SeqCst), 1);
}

#[test_timeout::tokio_timeout_test]
async fn duplicate_deliveries_are_admitted_once() {
    let backend = Arc::new(Backend::default());
    backend.duplicate_replies.store(true, Ordering::SeqCst);
    let addr = serve(Arc::clone(&backend)).await;
    let (chat, _task) = start(addr, TOKEN);
    wait_for(&chat, |s| s.can_send_message).await;

    chat.send_message("파스타 추천해줘").await.unwrap();
    let snapshot = wait_for(&chat, |s| s.messages.iter().any(|m| m.content() == "끝")).await;

    let replies = snapshot
        .messages
        .iter()
        .filter(|m| m.content() == "여기 레시피입니다")
        .count();
    assert_eq!(replies, 1);
    assert_eq!(snapshot.messages.len(), 3);
}

#[test_timeout::tokio_timeout_test]
async fn primary_history_failure_falls_back_to_the_stream() {
    let backend = Backend::with_history(vec![record("q", "a")]);
    backend.fail_fetch.store(true, Ordering::SeqCst);
    let addr = serve(Arc::clone(&backend)).await;
    let (chat, _task) = start(addr, TOKEN);

    let snapshot = wait_for(&chat, |s| s.history_status == HistoryStatus::Loaded).await;
    assert_eq!(snapshot.messages.len(), 2);
    assert_eq!(backend.fetch_calls.load(Ordering::SeqCst), 1);
    assert_eq!(backend.history_requests.load(Ordering::SeqCst), 1);
}

#[test_timeout::tokio_timeout_test]
async fn send_is_refused_before_the_connection_opens() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let (chat, _task) = start(addr, TOKEN);

    let err = chat.send_message("hello").await.unwrap_err();
    assert!(matches!(err, SessionError::Rejected(SendRejection::NotConnected)));
    assert!(chat.snapshot().messages.is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn send_is_refused_without_an_accepted_credential() {
    let backend = Arc::new(Backend::default());
    let addr = serve(Arc::clone(&backend)).await;
    let (chat, _task) = start(addr, "stale-token");

    let snapshot = wait_for(&chat, |s| s.connection_error.is_some()).await;
    assert!(snapshot.is_connected);
    assert!(!snapshot.is_authenticated);
    assert!(!snapshot.can_send_message);
    assert_eq!(snapshot.connection_error.as_deref(), Some("invalid token"));

    let err = chat.send_message("hello").await.unwrap_err();
    assert!(matches!(err, SessionError::Rejected(SendRejection::NotAuthenticated)));
    assert_eq!(backend.fetch_calls.load(Ordering::SeqCst), 0);
}

#[test_timeout::tokio_timeout_test]
async fn send_is_refused_while_a_reply_is_streaming() {
    let backend = Arc::new(Backend::default());
    backend.hold_stream.store(true, Ordering::SeqCst);
    let addr = serve(Arc::clone(&backend)).await;
    let (chat, _task) = start(addr, TOKEN);
    wait_for(&chat, |s| s.can_send_message).await;

    chat.send_streaming("first").await.unwrap();
    let snapshot = wait_for(&chat, |s| s.is_streaming).await;
    assert!(!snapshot.can_send_message);

    let err = chat.send_message("second").await.unwrap_err();
    assert!(matches!(err, SessionError::Rejected(SendRejection::Streaming)));
    let users = chat.snapshot().messages.iter().filter(|m| m.is_user()).count();
    assert_eq!(users, 1);
}
