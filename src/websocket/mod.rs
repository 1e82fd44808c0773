//! Reconnecting WebSocket client for the Dakara server.
//!
//! # Architecture
//!
//! A [`ReconnectingClient`] runs two supervised workers (see
//! [`crate::workers`]) around one [`PersistentConnection`]:
//!
//! - the maintenance loop connects, and after a failure or a loss waits for
//!   the [`ReconnectPolicy`] delay before trying again;
//! - the receive loop reads with a bounded timeout and calls `on_message` for
//!   each complete message. When the connection drops it declares the loss and
//!   leaves reconnection to the maintenance loop.
//!
//! Connection states move through [`ConnectionState`]:
//!
//! ```text
//! DISCONNECTED -> CONNECTING -> CONNECTED -> DISCONNECTED -> ...
//!       any state -> CLOSING -> CLOSED
//! ```
//!
//! # Callbacks
//!
//! [`EventCallbacks`] holds at most one handler per event:
//!
//! - `on_connected`: after each successful handshake, before any message
//! - `on_disconnected(reason)`: after the last message of a lost connection
//! - `on_message(payload)`: for each received message
//! - `on_error(kind, detail)`: for each failed connection attempt
//!
//! Handlers run on the worker threads and should return quickly.
//!
//! # Sending
//!
//! [`ReconnectingClient::send`] fails with
//! [`DakaraError::NotConnected`](crate::DakaraError::NotConnected) while not
//! connected. Messages are never buffered across reconnections.
//!
//! # Reconnection Behavior
//!
//! - Delay: 5 seconds doubling up to 60 seconds by default
//! - Attempts: unbounded by default; with a cap, exhaustion is fatal
//! - The attempt counter is reset on every successful connection
//! - A handshake rejected with 401/403 is fatal

pub mod callbacks;
pub mod client;
pub mod connection;
pub mod policy;
pub mod state;
pub mod transport;

pub use callbacks::{EventCallbacks, Payload};
pub use client::{ClientConfig, ClientHandle, ReconnectingClient};
pub use connection::PersistentConnection;
pub use policy::ReconnectPolicy;
pub use state::{ConnectionState, RetryState};
pub use transport::{Connector, Received, Transport, WebSocketConnector};
