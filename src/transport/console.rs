//! Console gateway — a local development transport.
//!
//! Definition sources are files in a directory: the file stem is the source
//! name (`cmd-ping.lua` → source `cmd-ping`), an optional leading block
//! delimited by `---` lines is the source's configuration text (the "topic"),
//! and the rest of the file is the script body. Trigger messages are read
//! from stdin, outgoing messages are printed to stdout, and a poll loop
//! turns file modifications into `SourceChanged` events.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    ChatMessage, Gateway, GatewayCommand, GatewayError, GatewayEvent, SourceInfo, TransportAction,
};

/// Channel the console operator talks on.
const CONSOLE_CHANNEL: &str = "console";

/// Sender name for stdin lines.
const CONSOLE_SENDER: &str = "operator";

pub struct ConsoleGateway {
    sources_path: PathBuf,
    poll_interval: Duration,
}

/// A parsed source file: configuration header and script body.
struct SourceFile {
    topic: Option<String>,
    body: String,
}

impl ConsoleGateway {
    pub fn new(sources_path: PathBuf, poll_secs: u64) -> Self {
        Self {
            sources_path,
            poll_interval: Duration::from_secs(poll_secs.max(1)),
        }
    }
}

#[async_trait]
impl Gateway for ConsoleGateway {
    async fn connect(
        &self,
    ) -> Result<(mpsc::Receiver<GatewayEvent>, mpsc::Sender<GatewayCommand>), GatewayError> {
        // The sources directory is this transport's "community": not
        // finding it is the fatal init error nothing can recover from.
        if !self.sources_path.is_dir() {
            return Err(GatewayError::Fatal(format!(
                "sources directory not found: {}",
                self.sources_path.display()
            )));
        }

        let (event_tx, event_rx) = mpsc::channel::<GatewayEvent>(100);
        let (cmd_tx, cmd_rx) = mpsc::channel::<GatewayCommand>(100);

        info!(
            "Console gateway up, sources at {}",
            self.sources_path.display()
        );
        let _ = event_tx.send(GatewayEvent::Ready).await;

        tokio::spawn(run_command_loop(self.sources_path.clone(), cmd_rx));
        tokio::spawn(run_stdin_loop(event_tx.clone()));
        tokio::spawn(run_poll_loop(
            self.sources_path.clone(),
            self.poll_interval,
            event_tx,
        ));

        Ok((event_rx, cmd_tx))
    }
}

/// Services runtime commands against the sources directory and stdout.
async fn run_command_loop(sources_path: PathBuf, mut cmd_rx: mpsc::Receiver<GatewayCommand>) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            GatewayCommand::SendMessage { channel, content } => {
                println!("[{channel}] {content}");
            }
            GatewayCommand::SendEmbed { channel, embed } => {
                let rendered =
                    serde_json::to_string_pretty(&embed).unwrap_or_else(|e| e.to_string());
                println!("[{channel}] (embed) {rendered}");
            }
            GatewayCommand::Perform(action) => match action {
                TransportAction::SendMessage { channel, content } => {
                    println!("[{channel}] {content}");
                }
                TransportAction::SetPresence { status, activity } => {
                    info!("Presence: {status:?} ({})", activity.unwrap_or_default());
                }
            },
            GatewayCommand::FetchHistory { source, reply, .. } => {
                let _ = reply.send(fetch_source_body(&sources_path, &source));
            }
            GatewayCommand::ListSources { reply } => {
                let _ = reply.send(list_source_files(&sources_path));
            }
            GatewayCommand::SetPresence { status, activity } => {
                info!("Presence: {status:?} ({})", activity.unwrap_or_default());
            }
        }
    }
    debug!("Console command loop stopped");
}

/// Turns stdin lines into trigger messages.
async fn run_stdin_loop(event_tx: mpsc::Sender<GatewayEvent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let msg = ChatMessage {
            sender: CONSOLE_SENDER.to_string(),
            channel: CONSOLE_CHANNEL.to_string(),
            content: line,
            from_bot: false,
        };
        if event_tx.send(GatewayEvent::Message(msg)).await.is_err() {
            break;
        }
    }
    debug!("Console stdin loop stopped");
}

/// Polls source file mtimes and emits change/removal events.
async fn run_poll_loop(
    sources_path: PathBuf,
    interval: Duration,
    event_tx: mpsc::Sender<GatewayEvent>,
) {
    let mut known: HashMap<String, SystemTime> = snapshot_mtimes(&sources_path);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let current = snapshot_mtimes(&sources_path);

        for (name, mtime) in &current {
            if known.get(name) != Some(mtime) {
                let topic = read_source_file(&sources_path, name)
                    .ok()
                    .and_then(|f| f.topic);
                let event = GatewayEvent::SourceChanged {
                    name: name.clone(),
                    topic,
                };
                if event_tx.send(event).await.is_err() {
                    return;
                }
            }
        }
        for name in known.keys() {
            if !current.contains_key(name) {
                let event = GatewayEvent::SourceRemoved {
                    old_name: name.clone(),
                };
                if event_tx.send(event).await.is_err() {
                    return;
                }
            }
        }
        known = current;
    }
}

fn snapshot_mtimes(dir: &Path) -> HashMap<String, SystemTime> {
    let mut out = HashMap::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Ok(mtime) = entry.metadata().and_then(|m| m.modified()) {
            out.insert(stem.to_string(), mtime);
        }
    }
    out
}

fn list_source_files(dir: &Path) -> Result<Vec<SourceInfo>, GatewayError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| GatewayError::Fatal(format!("cannot list sources: {e}")))?;
    let mut out = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        match read_source_file(dir, stem) {
            Ok(file) => out.push(SourceInfo {
                name: stem.to_string(),
                topic: file.topic,
            }),
            Err(e) => warn!("Skipping unreadable source {stem}: {e}"),
        }
    }
    Ok(out)
}

/// The source body is delivered as a single "message", regardless of the
/// requested history length — a file has no message granularity.
fn fetch_source_body(dir: &Path, source: &str) -> Result<Vec<String>, GatewayError> {
    read_source_file(dir, source).map(|f| vec![f.body])
}

fn read_source_file(dir: &Path, source: &str) -> Result<SourceFile, GatewayError> {
    let path = find_source_path(dir, source)
        .ok_or_else(|| GatewayError::Transient(format!("source not found: {source}")))?;
    let content = std::fs::read_to_string(&path)
        .map_err(|e| GatewayError::Transient(format!("cannot read {}: {e}", path.display())))?;
    Ok(parse_source(&content))
}

fn find_source_path(dir: &Path, source: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .flatten()
        .map(|e| e.path())
        .find(|p| p.is_file() && p.file_stem().and_then(|s| s.to_str()) == Some(source))
}

/// Splits an optional leading `---`-delimited configuration block off the
/// script body.
fn parse_source(content: &str) -> SourceFile {
    let mut lines = content.lines();
    if lines.next().map(str::trim) != Some("---") {
        return SourceFile {
            topic: None,
            body: content.to_string(),
        };
    }

    let mut header = Vec::new();
    for line in lines.by_ref() {
        if line.trim() == "---" {
            let body: Vec<&str> = lines.collect();
            let topic = header.join("\n");
            return SourceFile {
                topic: (!topic.trim().is_empty()).then_some(topic),
                body: body.join("\n"),
            };
        }
        header.push(line);
    }

    // No closing delimiter — treat the whole file as body.
    SourceFile {
        topic: None,
        body: content.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_parse_source_without_header() {
        let file = parse_source("return 1 + 1\n");
        assert!(file.topic.is_none());
        assert_eq!(file.body, "return 1 + 1\n");
    }

    #[test]
    fn test_parse_source_with_header() {
        let file = parse_source("---\n{ timeout: 3 }\n---\n\"pong\"");
        assert_eq!(file.topic.as_deref(), Some("{ timeout: 3 }"));
        assert_eq!(file.body, "\"pong\"");
    }

    #[test]
    fn test_parse_source_with_empty_header() {
        let file = parse_source("---\n---\nbody");
        assert!(file.topic.is_none());
        assert_eq!(file.body, "body");
    }

    #[test]
    fn test_parse_source_unterminated_header_is_body() {
        let content = "---\n{ lang: \"rhai\" }\nno closing delimiter";
        let file = parse_source(content);
        assert!(file.topic.is_none());
        assert_eq!(file.body, content);
    }

    #[test]
    fn test_list_and_fetch_sources() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cmd-ping.lua"), "\"pong\"").unwrap();
        fs::write(
            dir.path().join("mthd-add.lua"),
            "---\n{ params: { a: \"int\", b: \"int\" }, type: \"int\" }\n---\nreturn a + b",
        )
        .unwrap();

        let mut sources = list_source_files(dir.path()).unwrap();
        sources.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].name, "cmd-ping");
        assert!(sources[0].topic.is_none());
        assert_eq!(sources[1].name, "mthd-add");
        assert!(sources[1].topic.as_deref().unwrap().contains("params"));

        let body = fetch_source_body(dir.path(), "mthd-add").unwrap();
        assert_eq!(body, vec!["return a + b".to_string()]);
    }

    #[test]
    fn test_fetch_missing_source_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let err = fetch_source_body(dir.path(), "cmd-nope").unwrap_err();
        assert!(err.is_retriable());
    }
}
