//! Immutable definition model: one parsed representation per source.
//!
//! A definition is rebuilt from scratch whenever its source changes and
//! swapped into the registry as a whole — never mutated in place.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use anyhow::{bail, Context};
use indexmap::IndexMap;
use serde::Deserialize;

use crate::script::Capability;

/// Source name prefixes, one per definition kind.
const COMMAND_PREFIX: &str = "cmd-";
const METHOD_PREFIX: &str = "mthd-";
const VARIABLES_PREFIX: &str = "vars-";

/// Declared return/parameter type tokens accepted in configs.
const TYPE_TOKENS: [&str; 8] = [
    "void", "bool", "int", "float", "string", "array", "object", "any",
];

/// Per-definition configuration, parsed from the source's topic text
/// (hjson). Every key is optional; an absent or empty topic means all
/// defaults. Unknown keys are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DefinitionConfig {
    lang: Option<String>,
    imports: Vec<String>,
    timeout: Option<u64>,
    length: Option<usize>,
    #[serde(rename = "type")]
    return_type: Option<String>,
    params: IndexMap<String, String>,
}

impl DefinitionConfig {
    pub fn parse(topic: Option<&str>) -> anyhow::Result<Self> {
        match topic {
            None => Ok(Self::default()),
            Some(text) if text.trim().is_empty() => Ok(Self::default()),
            Some(text) => {
                deser_hjson::from_str(text).context("invalid definition config")
            }
        }
    }

    /// Engine name; definitions are Lua unless configured otherwise.
    pub fn lang(&self) -> &str {
        self.lang.as_deref().unwrap_or("lua")
    }

    /// Configured evaluation timeout in seconds, if any. The effective
    /// bound is computed against the global default at evaluation time.
    pub fn timeout(&self) -> Option<u64> {
        self.timeout
    }

    /// How many trailing messages compose this definition's body.
    pub fn length(&self) -> usize {
        self.length.unwrap_or(1).max(1)
    }

    pub fn return_type(&self) -> &str {
        self.return_type.as_deref().unwrap_or("void")
    }

    pub fn params(&self) -> &IndexMap<String, String> {
        &self.params
    }

    pub fn imports(&self) -> BTreeSet<String> {
        self.imports.iter().cloned().collect()
    }
}

/// What kind of definition a source name denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Command,
    Method,
    Variables,
}

impl SourceKind {
    /// Classifies a source name by prefix; `None` for sources that do not
    /// define scripts. The remainder after the prefix must be non-empty.
    pub fn classify(source: &str) -> Option<(SourceKind, &str)> {
        let (kind, remainder) = if let Some(rest) = source.strip_prefix(COMMAND_PREFIX) {
            (SourceKind::Command, rest)
        } else if let Some(rest) = source.strip_prefix(METHOD_PREFIX) {
            (SourceKind::Method, rest)
        } else if let Some(rest) = source.strip_prefix(VARIABLES_PREFIX) {
            (SourceKind::Variables, rest)
        } else {
            return None;
        };
        (!remainder.is_empty()).then_some((kind, remainder))
    }

    /// The registry names a source installs under. A command source maps
    /// to one name per `-`-separated segment; methods and variables keep
    /// the remainder verbatim.
    pub fn derived_names(source: &str) -> Option<(SourceKind, Vec<String>)> {
        let (kind, remainder) = Self::classify(source)?;
        let names = match kind {
            SourceKind::Command => remainder
                .split('-')
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect(),
            SourceKind::Method | SourceKind::Variables => vec![remainder.to_string()],
        };
        (!names.is_empty()).then_some((kind, names))
    }
}

/// The immutable core every definition shares: its config, resolved
/// capability, raw body and capability-unwrapped body.
#[derive(Debug)]
pub struct Executable {
    config: DefinitionConfig,
    capability: Capability,
    raw_body: String,
    body: String,
}

impl Executable {
    fn new(config: DefinitionConfig, raw_body: String) -> anyhow::Result<Self> {
        let capability = Capability::from_name(config.lang())?;
        let body = capability.unwrap_code_block(&raw_body);
        Ok(Self {
            config,
            capability,
            raw_body,
            body,
        })
    }

    pub fn config(&self) -> &DefinitionConfig {
        &self.config
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn raw_body(&self) -> &str {
        &self.raw_body
    }

    pub fn body(&self) -> &str {
        &self.body
    }
}

/// An invocable command. One instance may be registered under several
/// names; `source` is kept for error attribution.
#[derive(Debug)]
pub struct Command {
    exec: Executable,
    wrapped: String,
    source: String,
}

impl Command {
    pub fn new(source: &str, config: DefinitionConfig, raw_body: String) -> anyhow::Result<Self> {
        let exec = Executable::new(config, raw_body)?;
        let wrapped = exec.capability().wrap(exec.body(), &exec.config().imports());
        Ok(Self {
            exec,
            wrapped,
            source: source.to_string(),
        })
    }

    pub fn capability(&self) -> Capability {
        self.exec.capability()
    }

    pub fn config(&self) -> &DefinitionConfig {
        self.exec.config()
    }

    /// The fully wrapped, ready-to-evaluate script text.
    pub fn wrapped(&self) -> &str {
        &self.wrapped
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// A variable-initialization script. No declared interface; it exists for
/// its side effects on the shared context.
#[derive(Debug)]
pub struct Variables {
    exec: Executable,
    wrapped: String,
}

impl Variables {
    pub fn new(config: DefinitionConfig, raw_body: String) -> anyhow::Result<Self> {
        let exec = Executable::new(config, raw_body)?;
        let wrapped = exec.capability().wrap(exec.body(), &exec.config().imports());
        Ok(Self { exec, wrapped })
    }

    pub fn capability(&self) -> Capability {
        self.exec.capability()
    }

    pub fn config(&self) -> &DefinitionConfig {
        self.exec.config()
    }

    pub fn wrapped(&self) -> &str {
        &self.wrapped
    }
}

/// A method: a named script callable from any engine, with a declared
/// return type and ordered parameter list.
#[derive(Debug)]
pub struct Method {
    exec: Executable,
    name: String,
    return_type: String,
    params: Vec<(String, String)>,
    wrapped: String,
    /// Per-capability proxy sources, generated on first request.
    proxies: [OnceLock<Option<String>>; Capability::ALL.len()],
}

impl Method {
    pub fn new(name: &str, config: DefinitionConfig, raw_body: String) -> anyhow::Result<Self> {
        let return_type = config.return_type().to_string();
        validate_type_token(&return_type)?;

        let mut params = Vec::with_capacity(config.params().len());
        for (param, token) in config.params() {
            validate_type_token(token)
                .with_context(|| format!("parameter \"{param}\""))?;
            params.push((param.clone(), token.clone()));
        }

        let exec = Executable::new(config, raw_body)?;
        let wrapped = exec.capability().wrap(exec.body(), &exec.config().imports());
        Ok(Self {
            exec,
            name: name.to_string(),
            return_type,
            params,
            wrapped,
            proxies: [OnceLock::new(), OnceLock::new()],
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capability(&self) -> Capability {
        self.exec.capability()
    }

    pub fn config(&self) -> &DefinitionConfig {
        self.exec.config()
    }

    pub fn return_type(&self) -> &str {
        &self.return_type
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// The method body wrapped for its own capability — what actually runs
    /// when the method is invoked.
    pub fn wrapped(&self) -> &str {
        &self.wrapped
    }

    /// The proxy source making this method natively callable in the given
    /// capability; `None` when that capability does not use proxies.
    /// Generated lazily, cached per capability.
    pub fn proxy(&self, capability: Capability) -> Option<String> {
        self.proxies[capability.index()]
            .get_or_init(|| capability.proxy(&self.name, &self.return_type, &self.params))
            .clone()
    }
}

fn validate_type_token(token: &str) -> anyhow::Result<()> {
    if TYPE_TOKENS.contains(&token) {
        Ok(())
    } else {
        bail!("unknown type token \"{token}\"");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_topic_means_defaults() {
        for topic in [None, Some(""), Some("   ")] {
            let config = DefinitionConfig::parse(topic).unwrap();
            assert_eq!(config.lang(), "lua");
            assert_eq!(config.length(), 1);
            assert_eq!(config.return_type(), "void");
            assert!(config.timeout().is_none());
            assert!(config.params().is_empty());
            assert!(config.imports().is_empty());
        }
    }

    #[test]
    fn test_hjson_topic() {
        // hjson: unquoted keys, trailing commas, comments
        let topic = r#"
        {
            lang: "rhai"
            timeout: 3
            # two trailing messages form the body
            length: 2
        }
        "#;
        let config = DefinitionConfig::parse(Some(topic)).unwrap();
        assert_eq!(config.lang(), "rhai");
        assert_eq!(config.timeout(), Some(3));
        assert_eq!(config.length(), 2);
    }

    #[test]
    fn test_params_keep_declaration_order() {
        let topic = r#"{ params: { b: "int", a: "string", c: "bool" }, type: "int" }"#;
        let config = DefinitionConfig::parse(Some(topic)).unwrap();
        let order: Vec<&str> = config.params().keys().map(String::as_str).collect();
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_invalid_topic_is_an_error() {
        assert!(DefinitionConfig::parse(Some("{ lang: ")).is_err());
    }

    #[test]
    fn test_classify_sources() {
        assert_eq!(
            SourceKind::classify("cmd-ping"),
            Some((SourceKind::Command, "ping"))
        );
        assert_eq!(
            SourceKind::classify("mthd-add"),
            Some((SourceKind::Method, "add"))
        );
        assert_eq!(
            SourceKind::classify("vars-colors"),
            Some((SourceKind::Variables, "colors"))
        );
        assert_eq!(SourceKind::classify("general"), None);
        assert_eq!(SourceKind::classify("cmd-"), None);
    }

    #[test]
    fn test_command_source_derives_multiple_names() {
        let (kind, names) = SourceKind::derived_names("cmd-ping-pong").unwrap();
        assert_eq!(kind, SourceKind::Command);
        assert_eq!(names, vec!["ping", "pong"]);
    }

    #[test]
    fn test_method_name_keeps_hyphens() {
        let (_, names) = SourceKind::derived_names("mthd-my-helper").unwrap();
        assert_eq!(names, vec!["my-helper"]);
    }

    #[test]
    fn test_command_build_wraps_and_unwraps() {
        let config = DefinitionConfig::parse(Some(r#"{ imports: ["json"] }"#)).unwrap();
        let command = Command::new(
            "cmd-ping",
            config,
            "```lua\nreturn json.encode({})\n```".to_string(),
        )
        .unwrap();
        assert_eq!(command.capability(), Capability::Lua);
        assert_eq!(
            command.wrapped(),
            "local json = require(\"json\")\nreturn json.encode({})"
        );
        assert_eq!(command.source(), "cmd-ping");
    }

    #[test]
    fn test_unknown_lang_fails_build() {
        let config = DefinitionConfig::parse(Some(r#"{ lang: "tcl" }"#)).unwrap();
        assert!(Command::new("cmd-x", config, "1".to_string()).is_err());
    }

    #[test]
    fn test_method_build() {
        let config = DefinitionConfig::parse(Some(
            r#"{ params: { a: "int", b: "int" }, type: "int" }"#,
        ))
        .unwrap();
        let method = Method::new("add", config, "return a + b".to_string()).unwrap();
        assert_eq!(method.return_type(), "int");
        assert_eq!(
            method.params(),
            &[
                ("a".to_string(), "int".to_string()),
                ("b".to_string(), "int".to_string())
            ]
        );
        // Lua binds the hook natively; rhai gets a generated proxy.
        assert!(method.proxy(Capability::Lua).is_none());
        let proxy = method.proxy(Capability::Rhai).unwrap();
        assert_eq!(proxy, "fn add(a, b) { __invoke(\"add\", [a, b]) }");
    }

    #[test]
    fn test_method_rejects_unknown_type_token() {
        let config =
            DefinitionConfig::parse(Some(r#"{ type: "java.lang.String" }"#)).unwrap();
        assert!(Method::new("m", config, "1".to_string()).is_err());
    }
}
