use std::collections::HashSet;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use pantry_chat_core::telemetry::logging::{self, LogConfig, LogLevel};
use pantry_chat_core::{Config, Message, MessageId, SessionError, SessionSnapshot};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "pantry")]
#[command(about = "Terminal client for the Pantry recipe assistant")]
struct Cli {
    /// Backend address (scheme optional)
    #[arg(long, env = "PANTRY_SERVER")]
    server: Option<String>,

    /// Bearer token for the chat backend
    #[arg(long, env = "PANTRY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[arg(long, value_enum, env = "PANTRY_LOG_LEVEL", default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    #[arg(long, help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,
}

#[derive(Debug, PartialEq)]
enum ReplCommand {
    Stream(String),
    Direct(String),
    Clear,
    Reconnect,
    Retry,
    Select(usize),
    Help,
    Quit,
    Unknown(String),
}

impl ReplCommand {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Some(ReplCommand::Stream(line.to_string()));
        };
        let (name, argument) = rest.split_once(' ').unwrap_or((rest, ""));
        let argument = argument.trim();
        let command = match name {
            "direct" if !argument.is_empty() => ReplCommand::Direct(argument.to_string()),
            "clear" => ReplCommand::Clear,
            "reconnect" => ReplCommand::Reconnect,
            "retry" => ReplCommand::Retry,
            // Shown 1-based.
            "select" => match argument.parse::<usize>() {
                Ok(index) if index > 0 => ReplCommand::Select(index - 1),
                _ => ReplCommand::Unknown(line.to_string()),
            },
            "help" => ReplCommand::Help,
            "quit" | "exit" => ReplCommand::Quit,
            _ => ReplCommand::Unknown(line.to_string()),
        };
        Some(command)
    }
}

const HELP: &str = "\
type a message to stream a reply
  /direct <text>   ask without streaming
  /select <n>      pick a result from the last reply
  /clear           clear conversation history
  /reconnect       drop and reopen the connection
  /retry           retry loading history
  /quit            exit";

/// Prints transcript changes as they arrive. Streaming replies are written
/// incrementally and closed off when they finalize.
#[derive(Default)]
struct TranscriptView {
    printed: HashSet<MessageId>,
    streamed: Option<String>,
    status: Option<(bool, bool, Option<String>)>,
    history_error: Option<String>,
    response_error: Option<String>,
    results: usize,
}

impl TranscriptView {
    fn render(&mut self, snapshot: &SessionSnapshot, out: &mut impl Write) -> io::Result<()> {
        let status = (
            snapshot.is_connected,
            snapshot.is_authenticated,
            snapshot.connection_error.clone(),
        );
        if self.status.as_ref() != Some(&status) {
            match &status {
                (_, _, Some(error)) => writeln!(out, "[connection] {error}")?,
                (true, true, None) => writeln!(
                    out,
                    "[connected as {}]",
                    snapshot
                        .user
                        .as_ref()
                        .and_then(|user| user.name.clone().or_else(|| user.email.clone()))
                        .unwrap_or_else(|| "guest".to_string())
                )?,
                (true, false, None) => writeln!(out, "[authenticating...]")?,
                (false, _, None) => writeln!(out, "[disconnected]")?,
            }
            self.status = Some(status);
        }
        if snapshot.history_error != self.history_error {
            if let Some(error) = &snapshot.history_error {
                writeln!(out, "[history] {error} (use /retry)")?;
            }
            self.history_error = snapshot.history_error.clone();
        }

        if snapshot.messages.is_empty() && !self.printed.is_empty() {
            writeln!(out, "[history cleared]")?;
            self.printed.clear();
        }

        for message in &snapshot.messages {
            match message {
                Message::Pending(pending) => {
                    let shown = self.streamed.get_or_insert_with(|| {
                        let _ = write!(out, "assistant> ");
                        String::new()
                    });
                    if let Some(delta) = pending.content.strip_prefix(shown.as_str()) {
                        write!(out, "{delta}")?;
                    }
                    *shown = pending.content.clone();
                }
                Message::Final(message) => {
                    if !self.printed.insert(message.id) {
                        continue;
                    }
                    if message.author == pantry_chat_core::Author::User {
                        writeln!(out, "you> {}", message.content)?;
                        continue;
                    }
                    match self.streamed.take() {
                        Some(shown) => match message.content.strip_prefix(shown.as_str()) {
                            Some(rest) => writeln!(out, "{rest}")?,
                            None => writeln!(out, "\nassistant> {}", message.content)?,
                        },
                        None => writeln!(out, "assistant> {}", message.content)?,
                    }
                }
            }
        }

        if !snapshot.messages.iter().any(Message::is_streaming) {
            if let Some(_abandoned) = self.streamed.take() {
                writeln!(out, " [interrupted]")?;
            }
        }
        if snapshot.selected_results.len() != self.results {
            self.results = snapshot.selected_results.len();
            for (index, result) in snapshot.selected_results.iter().enumerate() {
                let title = result
                    .get("title")
                    .or_else(|| result.get("name"))
                    .and_then(|value| value.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| result.to_string());
                writeln!(out, "  {}. {title}", index + 1)?;
            }
        }
        if snapshot.response_error != self.response_error {
            if let Some(error) = &snapshot.response_error {
                writeln!(out, "[response] {error}")?;
            }
            self.response_error = snapshot.response_error.clone();
        }
        out.flush()
    }
}

async fn render(mut updates: watch::Receiver<SessionSnapshot>) {
    let mut view = TranscriptView::default();
    let mut stdout = io::stdout();
    loop {
        let snapshot = updates.borrow_and_update().clone();
        if let Err(err) = view.render(&snapshot, &mut stdout) {
            debug!(target: "pantry::cli", error = %err, "stdout closed");
            return;
        }
        if updates.changed().await.is_err() {
            return;
        }
    }
}

fn report(result: Result<(), SessionError>) {
    if let Err(err) = result {
        eprintln!("! {err}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })
    .context("failed to initialise logging")?;

    let mut config = Config::from_env();
    if let Some(server) = cli.server {
        config.server = server;
    }
    if let Some(token) = cli.token {
        config.token = Some(token);
    }

    let (chat, session) = pantry_chat_core::connect(&config).context("failed to start session")?;
    let renderer = tokio::spawn(render(chat.subscribe()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(command) = ReplCommand::parse(&line) else {
            continue;
        };
        match command {
            ReplCommand::Stream(text) => report(chat.send_streaming(text).await.map(|_| ())),
            ReplCommand::Direct(text) => report(chat.send_message(text).await.map(|_| ())),
            ReplCommand::Clear => report(chat.clear_history().await),
            ReplCommand::Reconnect => report(chat.reconnect().await),
            ReplCommand::Retry => report(chat.retry_history().await),
            ReplCommand::Select(index) => report(chat.select_result(index).await),
            ReplCommand::Help => println!("{HELP}"),
            ReplCommand::Quit => break,
            ReplCommand::Unknown(line) => eprintln!("! unknown command: {line} (try /help)"),
        }
    }

    chat.shutdown().await;
    let _ = session.await;
    renderer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pantry_chat_core::history::HistoryStatus;
    use pantry_chat_core::{FinalMessage, PendingReply};
    use pantry_protocol::MessageMetadata;
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn snapshot(messages: Vec<Message>) -> SessionSnapshot {
        SessionSnapshot {
            is_connected: true,
            is_authenticated: true,
            messages,
            is_streaming: false,
            connection_error: None,
            session_id: "s1".into(),
            current_stage: "greeting".into(),
            can_send_message: true,
            history_status: HistoryStatus::Loaded,
            history_error: None,
            response_error: None,
            selected_results: Vec::new(),
            selected_index: None,
            user: None,
        }
    }

    fn pending(id: MessageId, content: &str) -> Message {
        Message::Pending(PendingReply {
            placeholder_id: id,
            content: content.into(),
            metadata: MessageMetadata::default(),
            started_at: OffsetDateTime::UNIX_EPOCH,
        })
    }

    #[test]
    fn parses_repl_commands() {
        assert_eq!(ReplCommand::parse("  "), None);
        assert_eq!(
            ReplCommand::parse("파스타 추천해줘"),
            Some(ReplCommand::Stream("파스타 추천해줘".into()))
        );
        assert_eq!(
            ReplCommand::parse("/direct hi there"),
            Some(ReplCommand::Direct("hi there".into()))
        );
        assert_eq!(ReplCommand::parse("/select 2"), Some(ReplCommand::Select(1)));
        assert!(matches!(
            ReplCommand::parse("/select 0"),
            Some(ReplCommand::Unknown(_))
        ));
        assert!(matches!(ReplCommand::parse("/direct"), Some(ReplCommand::Unknown(_))));
        assert_eq!(ReplCommand::parse("/quit"), Some(ReplCommand::Quit));
    }

    #[test]
    fn streams_deltas_then_closes_the_line() {
        let mut view = TranscriptView::default();
        let mut out = Vec::new();
        let placeholder = Uuid::new_v4();
        view.render(&snapshot(vec![pending(placeholder, "안")]), &mut out).unwrap();
        view.render(&snapshot(vec![pending(placeholder, "안녕")]), &mut out).unwrap();
        let done = FinalMessage::assistant(
            "안녕하세요",
            OffsetDateTime::UNIX_EPOCH,
            MessageMetadata::default(),
        );
        view.render(&snapshot(vec![Message::Final(done.clone())]), &mut out).unwrap();
        view.render(&snapshot(vec![Message::Final(done)]), &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with("assistant> 안녕하세요\n"));
        assert_eq!(text.matches("안녕하세요").count(), 1);
    }

    #[test]
    fn cleared_transcript_is_announced() {
        let mut view = TranscriptView::default();
        let mut out = Vec::new();
        let user = FinalMessage::user("hi", OffsetDateTime::UNIX_EPOCH);
        view.render(&snapshot(vec![Message::Final(user)]), &mut out).unwrap();
        view.render(&snapshot(Vec::new()), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("you> hi"));
        assert!(text.contains("[history cleared]"));
    }
}
