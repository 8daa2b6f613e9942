//! Live definition registry.
//!
//! Three independent keyed stores (commands, methods, variables) rebuilt
//! from source snapshots at startup and kept current by change
//! notifications. Mutations are serialized; readers load immutable map
//! snapshots and may race one step behind an in-flight update, which only
//! means a trigger runs the previous definition version.

pub mod definition;

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures::future::join_all;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info};

use crate::report::Reporter;
use crate::transport::{
    fetch_history, list_sources, GatewayCommand, GatewayError, Presence, SourceInfo,
};
use definition::{Command, DefinitionConfig, Method, SourceKind, Variables};

pub struct Registry {
    commands: ArcSwap<HashMap<String, Arc<Command>>>,
    methods: ArcSwap<HashMap<String, Arc<Method>>>,
    vars: ArcSwap<HashMap<String, Arc<Variables>>>,
    /// Serializes all mutations so no derived name is ever observed
    /// half-updated.
    write_lock: Mutex<()>,
    reporter: Arc<Reporter>,
}

impl Registry {
    pub fn new(reporter: Arc<Reporter>) -> Self {
        Self {
            commands: ArcSwap::from_pointee(HashMap::new()),
            methods: ArcSwap::from_pointee(HashMap::new()),
            vars: ArcSwap::from_pointee(HashMap::new()),
            write_lock: Mutex::new(()),
            reporter,
        }
    }

    // ── Snapshot reads ────────────────────────────────────

    pub fn commands(&self) -> Arc<HashMap<String, Arc<Command>>> {
        self.commands.load_full()
    }

    pub fn methods(&self) -> Arc<HashMap<String, Arc<Method>>> {
        self.methods.load_full()
    }

    pub fn vars(&self) -> Arc<HashMap<String, Arc<Variables>>> {
        self.vars.load_full()
    }

    /// Case-insensitive command lookup.
    pub fn lookup_command(&self, name: &str) -> Option<Arc<Command>> {
        self.commands.load().get(&name.to_lowercase()).cloned()
    }

    // ── Mutations ─────────────────────────────────────────

    /// Rebuilds the definition(s) of one source and installs them under
    /// all derived names. Any build failure drops the source's previous
    /// names: a throwing rebuild never leaves stale state behind.
    pub async fn upsert(&self, source: &str, topic: Option<&str>, messages: Vec<String>) {
        if SourceKind::classify(source).is_none() {
            return;
        }
        let _guard = self.write_lock.lock().await;
        match self.install(source, topic, messages) {
            Ok(names) => info!("Updated {source} → {names:?}"),
            Err(e) => {
                error!("An error occurred while updating {source}: {e:#}");
                self.reporter
                    .report(&format!("updating {source}"), &format!("{e:#}"))
                    .await;
                self.remove_names(source);
            }
        }
    }

    /// Removes a source's definitions by derived names (deletion or
    /// rename-away).
    pub async fn remove(&self, source: &str) {
        if SourceKind::classify(source).is_none() {
            return;
        }
        let _guard = self.write_lock.lock().await;
        self.remove_names(source);
        info!("Removed {source}");
    }

    /// Startup path: fetches every eligible source's body concurrently
    /// (per-fetch failures are logged and skip that source only), builds
    /// all methods, then all variables, then all commands, and announces
    /// readiness.
    pub async fn bulk_init(
        &self,
        gateway: &mpsc::Sender<GatewayCommand>,
        prefix: &str,
    ) -> Result<(), GatewayError> {
        let sources = list_sources(gateway).await?;
        let script_sources: Vec<SourceInfo> = sources
            .into_iter()
            .filter(|s| SourceKind::classify(&s.name).is_some())
            .collect();

        let fetches = script_sources.into_iter().map(|source| {
            let gateway = gateway.clone();
            async move {
                let length = DefinitionConfig::parse(source.topic.as_deref())
                    .map(|c| c.length())
                    .unwrap_or(1);
                match fetch_history(&gateway, &source.name, length).await {
                    Ok(messages) => Some((source, messages)),
                    Err(e) => {
                        error!(
                            "An error occurred while retrieving the messages of \"{}\": {e}",
                            source.name
                        );
                        None
                    }
                }
            }
        });
        let snapshots: Vec<(SourceInfo, Vec<String>)> =
            join_all(fetches).await.into_iter().flatten().collect();

        let _guard = self.write_lock.lock().await;
        for kind in [SourceKind::Method, SourceKind::Variables, SourceKind::Command] {
            for (source, messages) in &snapshots {
                if SourceKind::classify(&source.name).map(|(k, _)| k) != Some(kind) {
                    continue;
                }
                if let Err(e) =
                    self.install(&source.name, source.topic.as_deref(), messages.clone())
                {
                    error!(
                        "An error occurred while initialising {}: {e:#}",
                        source.name
                    );
                    self.reporter
                        .report(&format!("initialising {}", source.name), &format!("{e:#}"))
                        .await;
                    self.remove_names(&source.name);
                }
            }
        }

        info!("Accepting commands now");
        let _ = gateway
            .send(GatewayCommand::SetPresence {
                status: Presence::Online,
                activity: Some(format!("{prefix}help")),
            })
            .await;
        Ok(())
    }

    // ── Internals (write lock held) ───────────────────────

    fn install(
        &self,
        source: &str,
        topic: Option<&str>,
        messages: Vec<String>,
    ) -> anyhow::Result<Vec<String>> {
        let (kind, names) = SourceKind::derived_names(source)
            .ok_or_else(|| anyhow::anyhow!("not a script source: {source}"))?;
        let config = DefinitionConfig::parse(topic)?;
        let body = assemble_body(&config, messages);

        match kind {
            SourceKind::Command => {
                let command = Arc::new(Command::new(source, config, body)?);
                let mut map = HashMap::clone(&self.commands.load());
                for name in &names {
                    map.insert(name.clone(), command.clone());
                }
                self.commands.store(Arc::new(map));
            }
            SourceKind::Method => {
                let method = Arc::new(Method::new(&names[0], config, body)?);
                let mut map = HashMap::clone(&self.methods.load());
                map.insert(names[0].clone(), method);
                self.methods.store(Arc::new(map));
            }
            SourceKind::Variables => {
                let vars = Arc::new(Variables::new(config, body)?);
                let mut map = HashMap::clone(&self.vars.load());
                map.insert(names[0].clone(), vars);
                self.vars.store(Arc::new(map));
            }
        }
        Ok(names)
    }

    fn remove_names(&self, source: &str) {
        let Some((kind, names)) = SourceKind::derived_names(source) else {
            return;
        };
        match kind {
            SourceKind::Command => {
                let mut map = HashMap::clone(&self.commands.load());
                for name in &names {
                    map.remove(name);
                }
                self.commands.store(Arc::new(map));
            }
            SourceKind::Method => {
                let mut map = HashMap::clone(&self.methods.load());
                map.remove(&names[0]);
                self.methods.store(Arc::new(map));
            }
            SourceKind::Variables => {
                let mut map = HashMap::clone(&self.vars.load());
                map.remove(&names[0]);
                self.vars.store(Arc::new(map));
            }
        }
    }
}

/// Joins a source's trailing messages (newest first, as fetched) into one
/// body: chronological order, each message stripped of an exact
/// ```` ```<lang> ```` fence.
fn assemble_body(config: &DefinitionConfig, mut messages: Vec<String>) -> String {
    messages.reverse();
    let fence_open = format!("```{}\n", config.lang());
    messages
        .iter()
        .map(|m| {
            if m.starts_with(&fence_open) && m.ends_with("\n```") {
                m[fence_open.len()..m.len() - 4].to_string()
            } else {
                m.clone()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        let (tx, _rx) = mpsc::channel(16);
        // No report channel configured — reports are dropped silently.
        Registry::new(Arc::new(Reporter::new(tx, None)))
    }

    #[tokio::test]
    async fn test_upsert_and_lookup_is_case_insensitive() {
        let registry = registry();
        registry
            .upsert("cmd-ping", None, vec!["\"pong\"".to_string()])
            .await;

        assert!(registry.lookup_command("ping").is_some());
        assert!(registry.lookup_command("PING").is_some());
        assert!(registry.lookup_command("pong").is_none());
    }

    #[tokio::test]
    async fn test_multi_name_source_shares_one_definition() {
        let registry = registry();
        registry
            .upsert("cmd-ping-pong", None, vec!["\"hi\"".to_string()])
            .await;

        let a = registry.lookup_command("ping").unwrap();
        let b = registry.lookup_command("pong").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_upsert_replaces_previous_definition() {
        let registry = registry();
        registry
            .upsert("cmd-ping", None, vec!["\"old\"".to_string()])
            .await;
        let old = registry.lookup_command("ping").unwrap();

        registry
            .upsert("cmd-ping", None, vec!["\"new\"".to_string()])
            .await;
        let new = registry.lookup_command("ping").unwrap();

        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(new.wrapped(), "\"new\"");
    }

    #[tokio::test]
    async fn test_failing_rebuild_drops_stale_names() {
        let registry = registry();
        registry
            .upsert("cmd-ping-pong", None, vec!["\"hi\"".to_string()])
            .await;
        assert!(registry.lookup_command("ping").is_some());

        // Same source reparses with a broken config.
        registry
            .upsert(
                "cmd-ping-pong",
                Some("{ lang: \"tcl\" }"),
                vec!["\"hi\"".to_string()],
            )
            .await;
        assert!(registry.lookup_command("ping").is_none());
        assert!(registry.lookup_command("pong").is_none());
    }

    #[tokio::test]
    async fn test_remove_by_old_name() {
        let registry = registry();
        registry
            .upsert("mthd-add", Some("{ type: \"int\" }"), vec!["1".to_string()])
            .await;
        assert!(registry.methods().contains_key("add"));

        registry.remove("mthd-add").await;
        assert!(!registry.methods().contains_key("add"));
    }

    #[tokio::test]
    async fn test_non_script_sources_are_ignored() {
        let registry = registry();
        registry
            .upsert("general", None, vec!["hello".to_string()])
            .await;
        assert!(registry.commands().is_empty());
        assert!(registry.methods().is_empty());
        assert!(registry.vars().is_empty());
    }

    #[test]
    fn test_assemble_body_is_chronological_and_unfenced() {
        let config = DefinitionConfig::parse(None).unwrap();
        // Fetched newest first: the last posted message comes first.
        let messages = vec![
            "return greeting".to_string(),
            "```lua\ngreeting = \"hi\"\n```".to_string(),
        ];
        assert_eq!(
            assemble_body(&config, messages),
            "greeting = \"hi\"\nreturn greeting"
        );
    }

    #[test]
    fn test_assemble_body_keeps_foreign_fences() {
        let config = DefinitionConfig::parse(Some("{ lang: \"rhai\" }")).unwrap();
        let messages = vec!["```lua\nx = 1\n```".to_string()];
        assert_eq!(assemble_body(&config, messages), "```lua\nx = 1\n```");
    }
}
