use log::{debug, trace, warn};
use std::io::ErrorKind as IoErrorKind;
use std::net::TcpStream;
use std::time::Duration;
use tungstenite::client::IntoClientRequest;
use tungstenite::handshake::{HandshakeError, HandshakeRole};
use tungstenite::http::{header::AUTHORIZATION, HeaderValue, StatusCode};
use tungstenite::protocol::Message;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Error as WsError, WebSocket};
use url::Url;

use super::callbacks::Payload;
use crate::error::{DakaraError, Result};

/// Longest a single socket read blocks. Writes handed over by other threads
/// wait at most this long for the reader to release the socket.
pub const READ_SLICE: Duration = Duration::from_millis(20);

/// Outcome of one bounded read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Message(Payload),
    /// Nothing complete arrived before the read timeout.
    Idle,
    /// The peer closed the connection.
    Closed(String),
}

/// One live, established connection.
pub trait Transport: Send {
    /// Writes one message. A connection already gone is reported as
    /// [`DakaraError::NotConnected`], any other failure as
    /// [`DakaraError::ConnectionWriteError`].
    fn send(&mut self, payload: &Payload) -> Result<()>;

    /// Reads at most one message, returning [`Received::Idle`] after at most
    /// [`READ_SLICE`] without a complete message. Failures are
    /// [`DakaraError::ConnectionReadError`].
    fn recv(&mut self) -> Result<Received>;

    /// Best effort close handshake.
    fn close(&mut self);
}

/// Opens [`Transport`]s to a fixed endpoint.
pub trait Connector: Send + Sync {
    fn endpoint(&self) -> &str;

    /// Failures worth retrying are [`DakaraError::ConnectionFailed`]; a
    /// rejected handshake is [`DakaraError::AuthenticationError`].
    fn connect(&self) -> Result<Box<dyn Transport>>;
}

type WsStream = WebSocket<MaybeTlsStream<TcpStream>>;

/// WebSocket connector over `ws://` or `wss://` with token authentication.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: Url,
    token: Option<String>,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(
        url: Url,
        token: Option<String>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self> {
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(DakaraError::ConfigurationError(format!(
                "Unsupported WebSocket scheme '{}' in {}",
                url.scheme(),
                url
            )));
        }
        if connect_timeout.is_zero() || read_timeout.is_zero() {
            return Err(DakaraError::ConfigurationError(
                "Connection timeouts must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            url,
            token,
            connect_timeout,
            read_timeout,
        })
    }

    fn open_stream(&self) -> Result<TcpStream> {
        let addrs = self
            .url
            .socket_addrs(|| None)
            .map_err(|e| DakaraError::ConnectionFailed(format!("{}: {}", self.url, e)))?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    trace!("Unable to reach {}: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }
        Err(DakaraError::ConnectionFailed(match last_error {
            Some(e) => format!("{}: {}", self.url, e),
            None => format!("{}: no address resolved", self.url),
        }))
    }
}

impl Connector for WebSocketConnector {
    fn endpoint(&self) -> &str {
        self.url.as_str()
    }

    fn connect(&self) -> Result<Box<dyn Transport>> {
        let stream = self.open_stream()?;
        // the handshake gets the connect timeout, reads after it the short one
        stream
            .set_nodelay(true)
            .and_then(|_| stream.set_read_timeout(Some(self.connect_timeout)))
            .and_then(|_| stream.set_write_timeout(Some(self.connect_timeout)))
            .map_err(socket_error)?;
        let tuning = stream.try_clone().map_err(socket_error)?;

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| DakaraError::ConfigurationError(format!("Invalid request: {}", e)))?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Token {}", token)).map_err(|e| {
                DakaraError::ConfigurationError(format!("Invalid token header: {}", e))
            })?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (socket, response) = tungstenite::client_tls(request, stream).map_err(classify)?;
        debug!(
            "WebSocket handshake with {} done: {}",
            self.url,
            response.status()
        );

        tuning
            .set_read_timeout(Some(self.read_timeout.min(READ_SLICE)))
            .map_err(socket_error)?;
        Ok(Box::new(WebSocketTransport { socket }))
    }
}

fn socket_error(error: std::io::Error) -> DakaraError {
    DakaraError::ConnectionFailed(format!("Socket setup failed: {}", error))
}

fn classify<R: HandshakeRole>(error: HandshakeError<R>) -> DakaraError {
    match error {
        HandshakeError::Failure(WsError::Http(response))
            if response.status() == StatusCode::UNAUTHORIZED
                || response.status() == StatusCode::FORBIDDEN =>
        {
            DakaraError::AuthenticationError(format!(
                "Unable to connect to server with this user ({})",
                response.status()
            ))
        }
        HandshakeError::Failure(e) => DakaraError::ConnectionFailed(e.to_string()),
        HandshakeError::Interrupted(_) => {
            DakaraError::ConnectionFailed("Handshake timed out".to_string())
        }
    }
}

struct WebSocketTransport {
    socket: WsStream,
}

impl Transport for WebSocketTransport {
    fn send(&mut self, payload: &Payload) -> Result<()> {
        let message = match payload {
            Payload::Text(text) => Message::Text(text.clone()),
            Payload::Binary(bytes) => Message::Binary(bytes.clone()),
        };
        trace!("Sending WS message ({} bytes)", payload.len());
        match self.socket.write_message(message) {
            Ok(()) => Ok(()),
            Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Err(
                DakaraError::NotConnected("Connection closed while sending".to_string()),
            ),
            Err(e) => Err(DakaraError::ConnectionWriteError(e.to_string())),
        }
    }

    fn recv(&mut self) -> Result<Received> {
        match self.socket.read_message() {
            Ok(Message::Text(text)) => {
                trace!("Received WS Text: {}", text);
                Ok(Received::Message(Payload::Text(text)))
            }
            Ok(Message::Binary(bytes)) => {
                trace!("Received WS Binary ({} bytes)", bytes.len());
                Ok(Received::Message(Payload::Binary(bytes)))
            }
            // pongs are queued by the protocol layer and flushed on next I/O
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {
                Ok(Received::Idle)
            }
            Ok(Message::Close(frame)) => {
                let reason = match frame {
                    Some(frame) if !frame.reason.is_empty() => {
                        format!("closed by server ({}): {}", frame.code, frame.reason)
                    }
                    Some(frame) => format!("closed by server ({})", frame.code),
                    None => "closed by server".to_string(),
                };
                Ok(Received::Closed(reason))
            }
            Err(WsError::Io(e))
                if matches!(e.kind(), IoErrorKind::WouldBlock | IoErrorKind::TimedOut) =>
            {
                Ok(Received::Idle)
            }
            Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {
                Ok(Received::Closed("connection closed".to_string()))
            }
            Err(e) => Err(DakaraError::ConnectionReadError(e.to_string())),
        }
    }

    fn close(&mut self) {
        if let Err(e) = self.socket.close(None) {
            debug!("WebSocket close frame not sent: {}", e);
            return;
        }
        if let Err(e) = self.socket.write_pending() {
            match e {
                WsError::ConnectionClosed | WsError::AlreadyClosed => {}
                e => warn!("Unable to flush WebSocket close: {}", e),
            }
        }
    }
}
