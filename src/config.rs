use serde::Deserialize;
use std::path::PathBuf;

/// Global bot configuration, loaded from a TOML file at startup.
///
/// Per-definition configuration (language, timeout, params...) is not here —
/// it lives in each source channel's topic and is parsed by
/// [`crate::registry::definition::DefinitionConfig`].
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Community/guild identifier the bot serves. Consumed by transports
    /// that multiplex several communities; the console gateway ignores it.
    pub guild_id: Option<String>,
    #[serde(flatten)]
    pub mode: GatewayMode,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum GatewayMode {
    /// Local development gateway: sources are files in a directory,
    /// triggers are stdin lines, output goes to stdout.
    Console {
        /// Directory holding source files (one file per definition source).
        sources_path: PathBuf,
        /// How often to poll source files for changes, in seconds.
        #[serde(default = "default_poll_secs")]
        poll_secs: u64,
    },
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    /// Trigger prefix commands must start with.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Global default evaluation timeout in seconds. Per-definition
    /// timeouts are capped at this value.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Channel receiving error reports. None disables forwarding
    /// (errors are still logged).
    pub report_channel: Option<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            timeout: default_timeout(),
            report_channel: None,
        }
    }
}

fn default_prefix() -> String {
    "&&".to_string()
}

fn default_timeout() -> u64 {
    5
}

fn default_poll_secs() -> u64 {
    2
}

impl GatewayConfig {
    /// Human-readable description of the gateway mode
    pub fn mode_description(&self) -> String {
        match &self.mode {
            GatewayMode::Console { sources_path, .. } => {
                format!("console ({})", sources_path.display())
            }
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${REPORT_CHANNEL}
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Config {
        toml::from_str(toml_str).expect("config should parse")
    }

    #[test]
    fn test_minimal_config() {
        let config = parse(
            r#"
            [gateway]
            mode = "console"
            sources_path = "./sources"
            "#,
        );
        assert_eq!(config.dispatch.prefix, "&&");
        assert_eq!(config.dispatch.timeout, 5);
        assert!(config.dispatch.report_channel.is_none());
        assert!(config.gateway.guild_id.is_none());
    }

    #[test]
    fn test_full_config() {
        let config = parse(
            r#"
            [gateway]
            mode = "console"
            sources_path = "/tmp/defs"
            poll_secs = 10
            guild_id = "197072474679017472"

            [dispatch]
            prefix = "!"
            timeout = 3
            report_channel = "errors"
            "#,
        );
        assert_eq!(config.dispatch.prefix, "!");
        assert_eq!(config.dispatch.timeout, 3);
        assert_eq!(config.dispatch.report_channel.as_deref(), Some("errors"));
        assert_eq!(
            config.gateway.guild_id.as_deref(),
            Some("197072474679017472")
        );
        match config.gateway.mode {
            GatewayMode::Console {
                ref sources_path,
                poll_secs,
            } => {
                assert_eq!(sources_path, &PathBuf::from("/tmp/defs"));
                assert_eq!(poll_secs, 10);
            }
        }
    }

    #[test]
    fn test_mode_description() {
        let config = parse(
            r#"
            [gateway]
            mode = "console"
            sources_path = "./sources"
            "#,
        );
        assert_eq!(config.gateway.mode_description(), "console (./sources)");
    }
}
