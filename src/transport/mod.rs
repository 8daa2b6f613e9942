//! Chat gateway interface.
//!
//! The concrete chat protocol is a collaborator, not part of this crate's
//! core: the runtime consumes a stream of [`GatewayEvent`]s and drives the
//! transport through [`GatewayCommand`]s, exactly like any production
//! transport would be wired. The crate ships one implementation, the
//! [`console`] gateway, used for local development and integration tests.

pub mod console;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

/// Events emitted by the gateway to the runtime
#[derive(Debug)]
pub enum GatewayEvent {
    /// Connection is established and events will flow.
    Ready,
    /// A definition source changed (created, message edited/posted/deleted,
    /// or its topic changed). Carries the currently-effective topic text.
    SourceChanged {
        name: String,
        topic: Option<String>,
    },
    /// A definition source disappeared or was renamed away; `old_name`
    /// is the name it was registered under.
    SourceRemoved { old_name: String },
    /// A regular chat message — a potential command trigger.
    Message(ChatMessage),
}

/// Commands sent by the runtime to the gateway
#[derive(Debug)]
pub enum GatewayCommand {
    SendMessage {
        channel: String,
        content: String,
    },
    SendEmbed {
        channel: String,
        embed: Embed,
    },
    /// Perform a deferred transport operation produced by a script.
    Perform(TransportAction),
    /// Fetch the last `limit` messages of a source, newest first.
    FetchHistory {
        source: String,
        limit: usize,
        reply: oneshot::Sender<Result<Vec<String>, GatewayError>>,
    },
    /// List all sources (channels) of the configured community.
    ListSources {
        reply: oneshot::Sender<Result<Vec<SourceInfo>, GatewayError>>,
    },
    SetPresence {
        status: Presence,
        activity: Option<String>,
    },
}

/// An incoming chat message
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub sender: String,
    pub channel: String,
    pub content: String,
    /// True when the sender is a bot (including ourselves) — such
    /// messages never trigger commands.
    pub from_bot: bool,
}

/// A definition source as listed by the gateway: its name plus the
/// raw configuration text (the channel topic).
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub name: String,
    pub topic: Option<String>,
}

/// Rich content a command may return instead of plain text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Embed {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub inline: bool,
}

/// A transport operation a script can hand back without performing it;
/// the pipeline triggers it as the command's output action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransportAction {
    SendMessage { channel: String, content: String },
    SetPresence {
        status: Presence,
        #[serde(default)]
        activity: Option<String>,
    },
}

/// Bot presence shown to the community
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Online,
    Busy,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Retriable failure (network hiccup, missing message...).
    #[error("transient gateway error: {0}")]
    Transient(String),
    /// Non-retriable failure; the process should give up. The prime
    /// example is the configured community not existing at init.
    #[error("fatal gateway error: {0}")]
    Fatal(String),
}

impl GatewayError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

/// A chat transport. `connect` completes the protocol handshake and hands
/// back the event/command channel pair; the transport's own loops run as
/// background tasks until the channels close.
#[async_trait]
pub trait Gateway {
    async fn connect(
        &self,
    ) -> Result<(mpsc::Receiver<GatewayEvent>, mpsc::Sender<GatewayCommand>), GatewayError>;
}

/// Fetches the last `limit` messages of a source through the command
/// channel, newest first.
pub async fn fetch_history(
    gateway: &mpsc::Sender<GatewayCommand>,
    source: &str,
    limit: usize,
) -> Result<Vec<String>, GatewayError> {
    let (reply, rx) = oneshot::channel();
    gateway
        .send(GatewayCommand::FetchHistory {
            source: source.to_string(),
            limit,
            reply,
        })
        .await
        .map_err(|_| GatewayError::Transient("gateway command channel closed".into()))?;
    rx.await
        .map_err(|_| GatewayError::Transient("gateway dropped history reply".into()))?
}

/// Lists all sources of the configured community.
pub async fn list_sources(
    gateway: &mpsc::Sender<GatewayCommand>,
) -> Result<Vec<SourceInfo>, GatewayError> {
    let (reply, rx) = oneshot::channel();
    gateway
        .send(GatewayCommand::ListSources { reply })
        .await
        .map_err(|_| GatewayError::Transient("gateway command channel closed".into()))?;
    rx.await
        .map_err(|_| GatewayError::Transient("gateway dropped source listing".into()))?
}
