//! Shared foundations of the Dakara project tools.
//!
//! - [`workers`]: supervised worker threads sharing one stop signal
//! - [`websocket`]: always-retrying WebSocket client to the Dakara server
//! - [`http`]: token-authenticated JSON API client
//! - [`config`], [`logging`], [`progress`]: program scaffolding

pub mod config;
pub mod error;
pub mod http;
pub mod logging;
pub mod progress;
pub mod utils;
pub mod websocket;
pub mod workers;

pub use error::{exit_code, DakaraError, ErrorKind, Result};
