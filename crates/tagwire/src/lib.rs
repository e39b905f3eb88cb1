//! Tagged request/response protocol over a child process's stdin/stdout.
//!
//! A parent spawns a child and exchanges newline-delimited JSON with it:
//! - requests go to the child's stdin as `{"tag": <u64>, "cmd": <string>, "ext": <value>}`;
//! - replies come back on its stdout as `{"tag": <u64>, "ext": <value>}`.
//!
//! Every request gets a fresh tag, so any number of callers can have requests in flight
//! at once and the child may answer in any order. Stdout lines that are not replies
//! (diagnostics, banners) are skipped.
//!
//! ## Surfaces
//! - [`Channel::open`] spawns the child (see [`ChannelConfig`] / [`ChannelDefinition`])
//!   and starts the single reader task that routes replies back to their callers.
//! - [`Channel::request`] sends a command and waits, optionally bounded by a timeout.
//!   Timeouts, a dead child, or a broken pipe come back as [`Outcome`] variants rather
//!   than errors; [`Channel::ask`] reduces that to `Option<Value>`.
//! - [`Channel::close`] closes the child's input, waits for it to exit (killing it after
//!   the configured grace period), joins the reader task, and reports the exit status.
//! - [`Channel::scoped`] wraps open/close around an async block and turns a non-zero
//!   exit into [`ChannelError::BadExit`] unless the block failed first.
//! - [`Responder`] implements the child side: register command handlers and serve
//!   stdin/stdout.
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use serde_json::json;
//! use tagwire::{Channel, ChannelConfig, ScopeError};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ChannelConfig::from_command_line("snippet")?;
//! let uptime = Channel::scoped(config, |channel| async move {
//!     let reply = channel
//!         .ask("uptime", json!({}), Some(Duration::from_secs(1)))
//!         .await;
//!     channel.ask("shutdown", json!({}), Some(Duration::from_secs(1))).await;
//!     Ok::<_, std::io::Error>(reply)
//! })
//! .await;
//!
//! match uptime {
//!     Ok(reply) => println!("uptime: {reply:?}"),
//!     Err(ScopeError::Channel(err)) => eprintln!("child failed: {err}"),
//!     Err(ScopeError::Body(err)) => eprintln!("caller failed: {err}"),
//! }
//! # Ok(()) }
//! ```

mod channel;
pub mod codec;
mod config;
mod error;
mod process;
mod reader;
mod responder;
mod table;

pub use channel::{Channel, ChannelState, Outcome};
pub use codec::{ReplyEnvelope, RequestEnvelope, Tag};
pub use config::{
    ChannelConfig, ChannelDefinition, ConfigError, StderrMode, DEFAULT_SHUTDOWN_GRACE,
};
pub use error::{ChannelError, ScopeError};
pub use responder::Responder;

/// Version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests;
