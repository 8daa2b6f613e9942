//! The execution pipeline — one command invocation.
//!
//! Strictly ordered per trigger: build a fresh engine set, seed the shared
//! context, run every variable definition, register every method, evaluate
//! the command body, interpret the result into one output action. Every
//! failure is contained here; nothing thrown by a script ever reaches the
//! dispatcher.

pub mod invoke;
pub mod outcome;

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::registry::definition::{Command, Method};
use crate::registry::Registry;
use crate::report::Reporter;
use crate::script::context::{GlobalStore, SharedContext};
use crate::script::interpreter::{effective_timeout, run_bounded};
use crate::script::set::EngineSet;
use crate::script::{Capability, EvalError};
use crate::transport::{ChatMessage, GatewayCommand};

use invoke::MethodInvoker;
use outcome::Outcome;

/// The chat-visible notice for a failed command. Everything else about the
/// failure goes to logs and the report channel only.
const GENERIC_FAILURE: &str = "An error occurred";

pub struct Executor {
    registry: Arc<Registry>,
    gateway: mpsc::Sender<GatewayCommand>,
    reporter: Arc<Reporter>,
    global: Arc<GlobalStore>,
    prefix: String,
    default_timeout: u64,
    started_at: Instant,
}

impl Executor {
    pub fn new(
        registry: Arc<Registry>,
        gateway: mpsc::Sender<GatewayCommand>,
        reporter: Arc<Reporter>,
        global: Arc<GlobalStore>,
        prefix: String,
        default_timeout: u64,
    ) -> Self {
        Self {
            registry,
            gateway,
            reporter,
            global,
            prefix,
            default_timeout,
            started_at: Instant::now(),
        }
    }

    /// Runs one full pipeline invocation. Never returns an error: all
    /// failure paths end in logging, reporting, and at most one generic
    /// failure notice to the triggering channel.
    pub async fn execute(&self, command: Arc<Command>, message: ChatMessage, args: String) {
        let invocation = Uuid::new_v4();
        info!(
            "Executing {} for {} ({invocation})",
            command.source(),
            message.sender
        );

        // Step 1 — fresh engine set, seeded context.
        let ctx = SharedContext::new();
        ctx.set(
            "event",
            json!({
                "sender": message.sender,
                "channel": message.channel,
                "content": message.content,
            }),
        );
        ctx.set("args", Value::String(args));
        ctx.set(
            "bot",
            json!({
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
                "prefix": self.prefix,
                "uptime_secs": self.started_at.elapsed().as_secs(),
            }),
        );

        let set = match self.build_engine_set(ctx.clone()) {
            Ok(set) => set,
            Err(e) => {
                error!("Could not build the engine set ({invocation}): {e}");
                self.reporter.report("building the engine set", &e).await;
                self.send_failure_notice(&message.channel).await;
                return;
            }
        };

        // Step 2 — variables, each independent; failures never abort.
        for (name, vars) in self.registry.vars().iter() {
            let timeout = effective_timeout(vars.config().timeout(), self.default_timeout);
            let interpreter = set.get(vars.capability());
            if let Err(e) = run_bounded(interpreter, vars.wrapped().to_string(), timeout).await {
                error!("An error occurred while evaluating the vars \"{name}\" ({invocation}): {e}");
                self.reporter
                    .report(&format!("evaluating the vars \"{name}\""), &e)
                    .await;
            }
        }

        // Step 3 — method registration in every engine.
        let methods: Arc<Vec<Arc<Method>>> =
            Arc::new(self.registry.methods().values().cloned().collect());
        let handle = tokio::runtime::Handle::current();
        for method in methods.iter() {
            let hook = MethodInvoker::new(
                method.clone(),
                methods.clone(),
                ctx.clone(),
                self.global.clone(),
                self.default_timeout,
                handle.clone(),
            )
            .host_fn();

            for capability in Capability::ALL {
                let interpreter = set.get(capability);
                if let Err(e) = interpreter.bind_callable(method.name(), hook.clone()) {
                    self.report_method_failure(method.name(), capability, &e, &invocation)
                        .await;
                    continue;
                }
                // A capability without a proxy for this method is skipped
                // for that capability only.
                if let Some(proxy) = method.proxy(capability) {
                    if let Err(e) = interpreter.define(&proxy) {
                        self.report_method_failure(method.name(), capability, &e, &invocation)
                            .await;
                    }
                }
            }
        }

        // Step 4 — the command body, on its own engine, time-boxed.
        let timeout = effective_timeout(command.config().timeout(), self.default_timeout);
        let result = run_bounded(
            set.get(command.capability()),
            command.wrapped().to_string(),
            timeout,
        )
        .await;

        // Step 5 — exactly one output action.
        match result {
            Ok(value) => self.dispatch_outcome(&message.channel, &value).await,
            Err(e) => {
                if e.is_timeout() {
                    warn!(
                        "The command \"{}\" timed out ({invocation}): {e}",
                        command.source()
                    );
                } else {
                    error!(
                        "An error occurred while executing the command \"{}\" ({invocation}): {e}",
                        command.source()
                    );
                }
                self.reporter
                    .report(&format!("executing the command \"{}\"", command.source()), &e)
                    .await;
                self.send_failure_notice(&message.channel).await;
            }
        }
    }

    fn build_engine_set(&self, ctx: SharedContext) -> Result<EngineSet, EvalError> {
        let set = EngineSet::new(ctx, self.global.clone())?;
        for capability in Capability::ALL {
            outcome::bind_output_helpers(&set.get(capability))?;
        }
        Ok(set)
    }

    async fn dispatch_outcome(&self, channel: &str, value: &Value) {
        let command = match outcome::interpret(value) {
            Outcome::Text(content) => GatewayCommand::SendMessage {
                channel: channel.to_string(),
                content,
            },
            Outcome::Rich(embed) => GatewayCommand::SendEmbed {
                channel: channel.to_string(),
                embed,
            },
            Outcome::Message(message) => match (message.content, message.embed) {
                // Rich content wins when a message object carries both.
                (_, Some(embed)) => GatewayCommand::SendEmbed {
                    channel: channel.to_string(),
                    embed,
                },
                (Some(content), None) => GatewayCommand::SendMessage {
                    channel: channel.to_string(),
                    content,
                },
                (None, None) => return,
            },
            Outcome::Action(action) => GatewayCommand::Perform(action),
            Outcome::Silent => return,
        };
        if self.gateway.send(command).await.is_err() {
            warn!("Gateway closed, dropping command output");
        }
    }

    async fn report_method_failure(
        &self,
        name: &str,
        capability: Capability,
        e: &EvalError,
        invocation: &Uuid,
    ) {
        error!(
            "An error occurred while registering the method \"{name}\" for {capability} ({invocation}): {e}"
        );
        self.reporter
            .report(&format!("registering the method \"{name}\" for {capability}"), e)
            .await;
    }

    async fn send_failure_notice(&self, channel: &str) {
        let notice = GatewayCommand::SendMessage {
            channel: channel.to_string(),
            content: GENERIC_FAILURE.to_string(),
        };
        if self.gateway.send(notice).await.is_err() {
            warn!("Gateway closed, dropping failure notice");
        }
    }
}
