//! The runtime event loop: registry upkeep and command dispatch.
//!
//! Consumes the gateway event stream. Source notifications mutate the
//! registry; chat messages are matched against the configured prefix and,
//! on a hit, spawn an execution pipeline run. Trigger delivery is never
//! blocked by execution.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::Config;
use crate::executor::Executor;
use crate::registry::definition::{DefinitionConfig, SourceKind};
use crate::registry::Registry;
use crate::transport::{fetch_history, ChatMessage, GatewayCommand, GatewayEvent};

pub struct Runtime {
    config: Arc<Config>,
    registry: Arc<Registry>,
    executor: Arc<Executor>,
}

impl Runtime {
    pub fn new(config: Arc<Config>, registry: Arc<Registry>, executor: Arc<Executor>) -> Self {
        Self {
            config,
            registry,
            executor,
        }
    }

    /// Main loop; returns when the gateway closes its event stream.
    pub async fn run(
        &self,
        mut event_rx: mpsc::Receiver<GatewayEvent>,
        gateway: mpsc::Sender<GatewayCommand>,
    ) -> Result<()> {
        info!("Runtime started — waiting for events...");

        while let Some(event) = event_rx.recv().await {
            match event {
                GatewayEvent::Ready => {
                    info!("✓ Gateway is up");
                }
                GatewayEvent::SourceChanged { name, topic } => {
                    self.refresh_source(&gateway, &name, topic.as_deref()).await;
                }
                GatewayEvent::SourceRemoved { old_name } => {
                    self.registry.remove(&old_name).await;
                }
                GatewayEvent::Message(message) => {
                    self.dispatch(message);
                }
            }
        }

        Ok(())
    }

    /// Re-reads a changed source and rebuilds its definitions.
    async fn refresh_source(
        &self,
        gateway: &mpsc::Sender<GatewayCommand>,
        name: &str,
        topic: Option<&str>,
    ) {
        if SourceKind::classify(name).is_none() {
            return;
        }
        // The body length comes from the source's own config; an
        // unparseable topic falls back to one message and fails properly
        // during the rebuild.
        let length = DefinitionConfig::parse(topic)
            .map(|c| c.length())
            .unwrap_or(1);
        match fetch_history(gateway, name, length).await {
            Ok(messages) => self.registry.upsert(name, topic, messages).await,
            Err(e) => warn!("Could not fetch the messages of \"{name}\": {e}"),
        }
    }

    /// Matches a trigger message and spawns the pipeline; returns
    /// immediately either way.
    fn dispatch(&self, message: ChatMessage) {
        if message.from_bot {
            return;
        }
        let Some((name, args)) = parse_trigger(&self.config.dispatch.prefix, &message.content)
        else {
            return;
        };
        // No matching command is not an error; the message was just chat.
        let Some(command) = self.registry.lookup_command(&name) else {
            return;
        };

        let executor = self.executor.clone();
        let args = args.to_string();
        tokio::spawn(async move {
            executor.execute(command, message, args).await;
        });
    }
}

/// Extracts the command name and verbatim argument remainder from trigger
/// text: prefix, then the first whitespace-delimited token, then the rest
/// after the single separating whitespace run. The name is lowercased for
/// the case-insensitive lookup.
pub fn parse_trigger<'a>(prefix: &str, content: &'a str) -> Option<(String, &'a str)> {
    let content = content.strip_prefix(prefix)?;
    let (name, args) = match content.split_once(|c: char| c.is_whitespace()) {
        Some((name, rest)) => (name, rest.trim_start()),
        None => (content, ""),
    };
    if name.is_empty() {
        return None;
    }
    Some((name.to_lowercase(), args))
}
