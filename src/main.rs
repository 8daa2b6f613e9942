use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use scriptbot::backoff::Backoff;
use scriptbot::config::{Config, GatewayMode};
use scriptbot::executor::Executor;
use scriptbot::registry::Registry;
use scriptbot::report::Reporter;
use scriptbot::runtime::Runtime;
use scriptbot::script::context::GlobalStore;
use scriptbot::transport::console::ConsoleGateway;
use scriptbot::transport::{Gateway, GatewayCommand, Presence};

/// How long a connection must be up before we consider it "stable"
/// and reset the backoff to initial values.
const STABILITY_THRESHOLD: Duration = Duration::from_secs(60);

/// Maximum consecutive transient failures before giving up.
const MAX_RECONNECT_ATTEMPTS: u32 = 20;

fn print_help() {
    println!(
        "\
scriptbot v{}

A chat bot whose commands are live script messages.

USAGE:
    scriptbot [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/scriptbot.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing
                (e.g. debug, scriptbot=debug,warn)",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("scriptbot v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("scriptbot=info")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/scriptbot.toml".to_string());

    info!("Loading configuration from {config_path}");
    let config = Arc::new(Config::load(&config_path)?);

    info!("Gateway: {}", config.gateway.mode_description());
    info!("Prefix: {}", config.dispatch.prefix);
    info!("Default timeout: {}s", config.dispatch.timeout);
    match &config.dispatch.report_channel {
        Some(channel) => info!("Error reports go to #{channel}"),
        None => info!("Error reports are log-only (no report channel)"),
    }

    let gateway: Arc<dyn Gateway + Send + Sync> = match &config.gateway.mode {
        GatewayMode::Console {
            sources_path,
            poll_secs,
        } => Arc::new(ConsoleGateway::new(sources_path.clone(), *poll_secs)),
    };

    // The one piece of state scripts share across invocations; survives
    // reconnections on purpose.
    let global = Arc::new(GlobalStore::new());

    let mut backoff = Backoff::new(
        Duration::from_secs(2),
        Duration::from_secs(60),
        MAX_RECONNECT_ATTEMPTS,
    );

    // ── Reconnection loop ──────────────────────────────────────────
    loop {
        info!(
            "Connecting to the chat gateway (attempt {})...",
            backoff.attempts() + 1
        );

        match gateway.connect().await {
            Ok((event_rx, cmd_tx)) => {
                let connected_at = Instant::now();

                let _ = cmd_tx
                    .send(GatewayCommand::SetPresence {
                        status: Presence::Busy,
                        activity: Some("loading...".to_string()),
                    })
                    .await;

                // The registry is rebuilt from source snapshots on every
                // (re)connection; definitions have no other persistence.
                let reporter = Arc::new(Reporter::new(
                    cmd_tx.clone(),
                    config.dispatch.report_channel.clone(),
                ));
                let registry = Arc::new(Registry::new(reporter.clone()));
                if let Err(e) = registry
                    .bulk_init(&cmd_tx, &config.dispatch.prefix)
                    .await
                {
                    if !e.is_retriable() {
                        error!("Cannot initialise the definition registry: {e}");
                        return Err(anyhow!("registry init failed: {e}"));
                    }
                    warn!("Registry init failed, will reconnect: {e}");
                } else {
                    let executor = Arc::new(Executor::new(
                        registry.clone(),
                        cmd_tx.clone(),
                        reporter,
                        global.clone(),
                        config.dispatch.prefix.clone(),
                        config.dispatch.timeout,
                    ));
                    let runtime = Runtime::new(config.clone(), registry, executor);

                    tokio::select! {
                        result = runtime.run(event_rx, cmd_tx) => {
                            if let Err(e) = result {
                                error!("Runtime error: {e}");
                            }
                        }
                        _ = tokio::signal::ctrl_c() => {
                            info!("Shutdown signal received, exiting");
                            return Ok(());
                        }
                    }

                    // Reset backoff if the connection was stable
                    if connected_at.elapsed() >= STABILITY_THRESHOLD {
                        backoff.reset();
                        info!("Connection was stable, backoff reset");
                    } else {
                        warn!(
                            "Connection lasted only {}s",
                            connected_at.elapsed().as_secs()
                        );
                    }
                    warn!("Gateway connection lost, preparing to reconnect...");
                }
            }
            Err(e) => {
                // Permanent errors — exit immediately
                if !e.is_retriable() {
                    error!("Permanent gateway error: {e}");
                    return Err(anyhow!("Cannot connect: {e}"));
                }
                warn!("Connection failed: {e}");
            }
        }

        if backoff.exhausted() {
            error!(
                "Exceeded {} reconnection attempts, giving up",
                MAX_RECONNECT_ATTEMPTS
            );
            return Err(anyhow!(
                "Max reconnection attempts ({MAX_RECONNECT_ATTEMPTS}) exceeded"
            ));
        }

        // Wait before retrying, but allow graceful shutdown during the wait
        let delay = backoff.next_delay();
        info!(
            "Reconnecting in {}s (attempt {})...",
            delay.as_secs(),
            backoff.attempts() + 1
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received during backoff, exiting");
                return Ok(());
            }
        }
    }
}
