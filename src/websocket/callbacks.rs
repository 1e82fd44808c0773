use std::fmt;
use std::sync::Arc;

use crate::error::ErrorKind;

/// A complete message carried by the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(text) => text.as_bytes(),
            Payload::Binary(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Binary(bytes)
    }
}

type ConnectedHandler = Arc<dyn Fn() + Send + Sync + 'static>;
type DisconnectedHandler = Arc<dyn Fn(&str) + Send + Sync + 'static>;
type MessageHandler = Arc<dyn Fn(Payload) + Send + Sync + 'static>;
type ErrorHandler = Arc<dyn Fn(ErrorKind, &str) + Send + Sync + 'static>;

/// At most one handler per connection event.
///
/// Handlers run on worker threads. A panicking handler takes the whole
/// supervised run down with it.
#[derive(Clone, Default)]
pub struct EventCallbacks {
    on_connected: Option<ConnectedHandler>,
    on_disconnected: Option<DisconnectedHandler>,
    on_message: Option<MessageHandler>,
    on_error: Option<ErrorHandler>,
}

impl EventCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connected(mut self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connected = Some(Arc::new(handler));
        self
    }

    pub fn on_disconnected(mut self, handler: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_disconnected = Some(Arc::new(handler));
        self
    }

    pub fn on_message(mut self, handler: impl Fn(Payload) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(handler));
        self
    }

    pub fn on_error(mut self, handler: impl Fn(ErrorKind, &str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(handler));
        self
    }

    pub(crate) fn connected(&self) {
        if let Some(handler) = &self.on_connected {
            handler();
        }
    }

    pub(crate) fn disconnected(&self, reason: &str) {
        if let Some(handler) = &self.on_disconnected {
            handler(reason);
        }
    }

    pub(crate) fn message(&self, payload: Payload) {
        if let Some(handler) = &self.on_message {
            handler(payload);
        }
    }

    pub(crate) fn error(&self, kind: ErrorKind, detail: &str) {
        if let Some(handler) = &self.on_error {
            handler(kind, detail);
        }
    }
}

impl fmt::Debug for EventCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventCallbacks")
            .field("on_connected", &self.on_connected.is_some())
            .field("on_disconnected", &self.on_disconnected.is_some())
            .field("on_message", &self.on_message.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}
