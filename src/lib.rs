//! scriptbot — a chat bot whose commands are live script messages.
//!
//! A community operator writes command, method and variable definitions as
//! messages in dedicated source channels. The bot keeps a live registry of
//! those definitions and, for every trigger message, builds an ephemeral set
//! of cooperating script engines that share one evaluation context, runs the
//! definitions in a fixed order, and turns the command's return value into a
//! chat-visible action.
//!
//! The chat transport itself is a collaborator behind the [`transport`]
//! interface; the crate ships a console gateway for development and tests.

pub mod backoff;
pub mod config;
pub mod executor;
pub mod registry;
pub mod report;
pub mod runtime;
pub mod script;
pub mod transport;
