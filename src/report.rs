//! Best-effort error reporting to a designated chat channel.
//!
//! Every recoverable failure in the registry and the execution pipeline is
//! forwarded here with a short context string. Reporting must never make
//! things worse: failures to deliver a report are swallowed and logged.

use std::fmt::Display;

use tokio::sync::mpsc;
use tracing::warn;

use crate::transport::GatewayCommand;

/// Reports longer than this are truncated to stay well inside any
/// transport's message size limit.
const MAX_REPORT_LEN: usize = 1800;

pub struct Reporter {
    gateway: mpsc::Sender<GatewayCommand>,
    channel: Option<String>,
}

impl Reporter {
    pub fn new(gateway: mpsc::Sender<GatewayCommand>, channel: Option<String>) -> Self {
        Self { gateway, channel }
    }

    /// Forwards `(error, context)` to the report channel, if one is
    /// configured. The error is always assumed to have been logged by the
    /// caller already; this only handles the chat-visible copy.
    pub async fn report(&self, context: &str, error: &(dyn Display + Sync)) {
        let Some(channel) = &self.channel else {
            return;
        };

        let mut text = format!("**{context}**\n```\n{error}\n```");
        if text.len() > MAX_REPORT_LEN {
            let mut cut = MAX_REPORT_LEN;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
            text.push_str("\n```");
        }

        let cmd = GatewayCommand::SendMessage {
            channel: channel.clone(),
            content: text,
        };
        if self.gateway.send(cmd).await.is_err() {
            warn!("Could not deliver error report for: {context}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_report_sends_to_configured_channel() {
        let (tx, mut rx) = mpsc::channel(4);
        let reporter = Reporter::new(tx, Some("errors".to_string()));

        reporter.report("updating cmd-ping", &"boom").await;

        match rx.recv().await.unwrap() {
            GatewayCommand::SendMessage { channel, content } => {
                assert_eq!(channel, "errors");
                assert!(content.contains("updating cmd-ping"));
                assert!(content.contains("boom"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_report_without_channel_is_silent() {
        let (tx, mut rx) = mpsc::channel(4);
        let reporter = Reporter::new(tx, None);

        reporter.report("ctx", &"boom").await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_long_reports_are_truncated() {
        let (tx, mut rx) = mpsc::channel(4);
        let reporter = Reporter::new(tx, Some("errors".to_string()));

        let huge = "x".repeat(5000);
        reporter.report("ctx", &huge).await;

        match rx.recv().await.unwrap() {
            GatewayCommand::SendMessage { content, .. } => {
                assert!(content.len() <= MAX_REPORT_LEN + 4);
                assert!(content.ends_with("```"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
