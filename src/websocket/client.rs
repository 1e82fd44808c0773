use log::{debug, error, info, trace, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::callbacks::{EventCallbacks, Payload};
use super::connection::PersistentConnection;
use super::policy::ReconnectPolicy;
use super::state::{ConnectionState, RetryState};
use super::transport::{Connector, Received, WebSocketConnector};
use crate::config::Config;
use crate::error::{DakaraError, Result};
use crate::utils::create_url;
use crate::workers::{StopSignal, Worker, WorkerContext, WorkerSupervisor};

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound on how long a loop may take to notice the stop signal.
const MAX_TICK: Duration = Duration::from_secs(1);

const MAINTENANCE_WORKER: &str = "maintenance";
const RECEIVE_WORKER: &str = "receive";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    pub token: Option<String>,
    pub reconnect: ReconnectPolicy,
    pub read_timeout: Duration,
    pub connect_timeout: Duration,
    pub join_timeout: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            reconnect: ReconnectPolicy::default(),
            read_timeout: DEFAULT_READ_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_join_timeout(mut self, join_timeout: Duration) -> Self {
        self.join_timeout = join_timeout;
        self
    }

    /// Builds the configuration from a server section of the config file.
    ///
    /// Reads `url` (or `address`/`host`, `port`, `ssl`), `token`, and the
    /// optional `reconnect_interval`, `reconnect_max_interval` (seconds),
    /// `reconnect_max_attempts` and `read_timeout` (seconds) keys. The
    /// WebSocket scheme follows `ssl`.
    pub fn from_config(config: &Config, route: &str) -> Result<Self> {
        let url = create_url(config, route, "ws", "wss")?;
        let defaults = ReconnectPolicy::default();

        let mut reconnect = ReconnectPolicy {
            base_delay: config.get_duration_secs("reconnect_interval", defaults.base_delay)?,
            max_delay: config.get_duration_secs("reconnect_max_interval", defaults.max_delay)?,
            max_attempts: None,
        };
        if let Some(max_attempts) = config.get_parsed::<u32>("reconnect_max_attempts")? {
            reconnect = reconnect.with_max_attempts(max_attempts);
        }
        if reconnect.max_delay < reconnect.base_delay {
            reconnect.max_delay = reconnect.base_delay;
        }

        Ok(Self {
            url: url.to_string(),
            token: config.get_str("token"),
            reconnect,
            read_timeout: config.get_duration_secs("read_timeout", DEFAULT_READ_TIMEOUT)?,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        })
    }

    fn validate(&self) -> Result<Url> {
        self.reconnect.validate()?;
        if self.read_timeout.is_zero() {
            return Err(DakaraError::ConfigurationError(
                "Read timeout must be greater than zero".to_string(),
            ));
        }
        Url::parse(&self.url).map_err(|e| {
            DakaraError::ConfigurationError(format!("Invalid server URL '{}': {}", self.url, e))
        })
    }

    /// How long the loops may block before rechecking the stop signal.
    fn tick(&self) -> Duration {
        self.read_timeout.min(MAX_TICK)
    }
}

/// Cloneable access to a running client: send and stop from anywhere,
/// callbacks included.
#[derive(Clone, Debug)]
pub struct ClientHandle {
    connection: Arc<PersistentConnection>,
    signal: StopSignal,
}

impl ClientHandle {
    pub fn send(&self, payload: impl Into<Payload>) -> Result<()> {
        self.connection.send(payload.into())
    }

    pub fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let text = serde_json::to_string(value)?;
        self.connection.send(Payload::Text(text))
    }

    pub fn stop(&self) {
        self.signal.set();
        self.connection.close();
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }
}

/// Always-retrying persistent WebSocket client.
///
/// Two supervised workers drive one [`PersistentConnection`]: the maintenance
/// loop (re)connects with exponential backoff, the receive loop reads with a
/// bounded timeout and hands messages to `on_message`. An unhandled failure
/// in either, a panicking callback or an exhausted attempt cap, stops both and
/// comes out of [`ReconnectingClient::run_and_wait`] as a
/// [`DakaraError::SupervisorFailure`].
///
/// ```no_run
/// use dakara_base::websocket::{ClientConfig, EventCallbacks, ReconnectingClient};
///
/// let callbacks = EventCallbacks::new()
///     .on_connected(|| println!("connected"))
///     .on_message(|payload| println!("received {:?}", payload.as_text()));
///
/// let mut client = ReconnectingClient::new(
///     ClientConfig::new("ws://localhost:8000/ws/playlist/device/").with_token("token"),
///     callbacks,
/// )?;
/// client.start()?;
/// client.stop_on_interrupt()?;
/// client.run_and_wait()?;
/// # Ok::<(), dakara_base::DakaraError>(())
/// ```
pub struct ReconnectingClient {
    connection: Arc<PersistentConnection>,
    supervisor: WorkerSupervisor,
    tick: Duration,
    join_timeout: Duration,
}

impl ReconnectingClient {
    pub fn new(config: ClientConfig, callbacks: EventCallbacks) -> Result<Self> {
        let url = config.validate()?;
        let connector = WebSocketConnector::new(
            url,
            config.token.clone(),
            config.connect_timeout,
            config.read_timeout,
        )?;
        Self::with_connector(config, callbacks, connector)
    }

    /// Same as [`ReconnectingClient::new`] over any transport.
    pub fn with_connector(
        config: ClientConfig,
        callbacks: EventCallbacks,
        connector: impl Connector + 'static,
    ) -> Result<Self> {
        config.validate()?;
        let connection = PersistentConnection::new(Box::new(connector), config.reconnect, callbacks);
        Ok(Self {
            connection: Arc::new(connection),
            supervisor: WorkerSupervisor::new().with_join_timeout(config.join_timeout),
            tick: config.tick(),
            join_timeout: config.join_timeout,
        })
    }

    /// Shares a pre-made stop signal, typically one also captured by callbacks.
    ///
    /// Must be called before [`ReconnectingClient::start`].
    pub fn with_stop_signal(mut self, signal: StopSignal) -> Self {
        self.supervisor = WorkerSupervisor::with_signal(signal).with_join_timeout(self.join_timeout);
        self
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.supervisor.stop_signal().clone()
    }

    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            connection: Arc::clone(&self.connection),
            signal: self.stop_signal(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn retry(&self) -> RetryState {
        self.connection.retry()
    }

    /// Launches the maintenance and receive workers.
    pub fn start(&mut self) -> Result<()> {
        info!("Starting WebSocket client for {}", self.connection.endpoint());
        let tick = self.tick;

        let connection = Arc::clone(&self.connection);
        let maintenance = Worker::new(MAINTENANCE_WORKER, move |context: WorkerContext| {
            let outcome = maintain(&connection, &context, tick);
            connection.close();
            outcome
        });

        let connection = Arc::clone(&self.connection);
        let receive = Worker::new(RECEIVE_WORKER, move |context: WorkerContext| {
            receive(&connection, &context, tick);
            Ok(())
        });

        self.supervisor.start(vec![maintenance, receive])
    }

    /// Sends one message; [`DakaraError::NotConnected`] unless connected.
    pub fn send(&self, payload: impl Into<Payload>) -> Result<()> {
        self.connection.send(payload.into())
    }

    pub fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let text = serde_json::to_string(value)?;
        self.connection.send(Payload::Text(text))
    }

    /// Closes the connection and stops both workers. Idempotent.
    pub fn stop(&self) {
        info!("Stopping WebSocket client...");
        self.supervisor.stop();
        self.connection.close();
    }

    pub fn stop_on_interrupt(&self) -> Result<()> {
        self.supervisor.stop_on_interrupt()
    }

    /// Blocks until stopped, then joins the workers. See
    /// [`WorkerSupervisor::run_and_wait`].
    pub fn run_and_wait(&mut self) -> Result<()> {
        let outcome = self.supervisor.run_and_wait();
        self.connection.close();
        match &outcome {
            Ok(()) => info!("WebSocket client stopped"),
            Err(e) => error!("WebSocket client stopped on failure: {}", e),
        }
        outcome
    }
}

fn maintain(
    connection: &PersistentConnection,
    context: &WorkerContext,
    tick: Duration,
) -> anyhow::Result<()> {
    let signal = context.stop_signal();
    let policy = *connection.policy();
    let mut first_attempt = true;

    while !signal.is_set() {
        match connection.state() {
            ConnectionState::Disconnected => {
                let retry = connection.retry();
                if policy.is_exhausted(retry.attempts()) {
                    error!(
                        "[{}] Max retries ({}) reached. Stopping connection attempts.",
                        context.name(),
                        retry.attempts()
                    );
                    return Err(DakaraError::RetriesExhausted {
                        attempts: retry.attempts(),
                    }
                    .into());
                }

                if !first_attempt {
                    warn!(
                        "[{}] Disconnected. Retrying in {:?}...",
                        context.name(),
                        retry.delay()
                    );
                    if signal.wait_timeout(retry.delay()) {
                        break;
                    }
                }
                first_attempt = false;

                info!(
                    "[{}] Attempting connection (Retry {})...",
                    context.name(),
                    retry.attempts()
                );
                if let Err(e) = connection.connect() {
                    if !e.is_recoverable() {
                        return Err(e.into());
                    }
                }
            }
            state @ (ConnectionState::Connected | ConnectionState::Connecting) => {
                connection.wait_state_change(state, tick);
            }
            ConnectionState::Closing | ConnectionState::Closed => break,
        }
    }

    debug!("[{}] Task finished.", context.name());
    Ok(())
}

fn receive(connection: &PersistentConnection, context: &WorkerContext, tick: Duration) {
    let signal = context.stop_signal();

    while !signal.is_set() {
        if !connection.wait_readable(tick) {
            if connection.state().is_terminal() {
                break;
            }
            continue;
        }

        connection.flush_outbox();
        match connection.receive() {
            Received::Message(payload) => connection.callbacks().message(payload),
            Received::Idle => trace!("[{}] Nothing received", context.name()),
            Received::Closed(reason) => {
                if signal.is_set() {
                    break;
                }
                connection.mark_lost(&reason);
            }
        }
    }

    debug!("[{}] Task finished.", context.name());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::tests::{policy, recorder, ScriptedConnector};
    use crate::websocket::policy::DEFAULT_MAX_DELAY;
    use crate::workers::FailureKind;
    use serde_json::json;
    use std::thread;
    use std::time::Instant;

    fn scripted_config() -> ClientConfig {
        ClientConfig::new("ws://localhost:8000/ws/")
            .with_reconnect(policy())
            .with_read_timeout(Duration::from_millis(20))
            .with_join_timeout(Duration::from_secs(2))
    }

    fn wait_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_config_from_server_section() {
        let config = Config::from_value(
            "TESTCLIENT",
            json!({
                "address": "localhost",
                "port": 8000,
                "ssl": true,
                "token": "abc",
                "reconnect_interval": 2,
                "reconnect_max_attempts": 4,
            }),
        )
        .unwrap();

        let client_config = ClientConfig::from_config(&config, "ws/playlist/device/").unwrap();
        assert_eq!(client_config.url, "wss://localhost:8000/ws/playlist/device/");
        assert_eq!(client_config.token.as_deref(), Some("abc"));
        assert_eq!(client_config.reconnect.base_delay, Duration::from_secs(2));
        assert_eq!(client_config.reconnect.max_delay, DEFAULT_MAX_DELAY);
        assert_eq!(client_config.reconnect.max_attempts, Some(4));
        assert_eq!(client_config.read_timeout, DEFAULT_READ_TIMEOUT);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let bad_url = ClientConfig::new("not a url");
        assert!(matches!(
            ReconnectingClient::new(bad_url, EventCallbacks::new()),
            Err(DakaraError::ConfigurationError(_))
        ));

        let bad_policy = ClientConfig::new("ws://localhost/").with_reconnect(ReconnectPolicy {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(1),
            max_attempts: None,
        });
        assert!(ReconnectingClient::new(bad_policy, EventCallbacks::new()).is_err());

        let http = ClientConfig::new("http://localhost/");
        assert!(ReconnectingClient::new(http, EventCallbacks::new()).is_err());
    }

    #[test]
    fn test_loss_then_reconnect_through_workers() {
        let connector = ScriptedConnector::default();
        connector
            .script
            .lock()
            .unwrap()
            .inbox
            .extend([Received::Message("hello".into()), Received::Closed("gone".into())]);
        let (callbacks, events) = recorder();

        let mut client =
            ReconnectingClient::with_connector(scripted_config(), callbacks, connector.clone())
                .unwrap();
        client.start().unwrap();

        assert!(wait_for(Duration::from_secs(2), || {
            connector.script.lock().unwrap().connects >= 2
                && client.state() == ConnectionState::Connected
        }));
        client.send_json(&json!({"type": "ready"})).unwrap();
        client.stop();
        client.run_and_wait().unwrap();

        let events = events.lock().unwrap().clone();
        assert_eq!(
            events[..4],
            [
                "connected".to_string(),
                "message:hello".to_string(),
                "disconnected:gone".to_string(),
                "connected".to_string(),
            ]
        );
        let sent = connector.script.lock().unwrap().sent.clone();
        assert_eq!(sent, vec![Payload::Text("{\"type\":\"ready\"}".to_string())]);
    }

    #[test]
    fn test_loss_wakes_maintenance_before_tick() {
        let connector = ScriptedConnector::default();
        connector
            .script
            .lock()
            .unwrap()
            .inbox
            .push_back(Received::Closed("dropped".into()));
        let connected_at = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorded = Arc::clone(&connected_at);
        let callbacks =
            EventCallbacks::new().on_connected(move || recorded.lock().unwrap().push(Instant::now()));

        // one second tick: only a wake-up on the loss gets the retry in early
        let config = scripted_config().with_read_timeout(Duration::from_secs(1));
        let mut client =
            ReconnectingClient::with_connector(config, callbacks, connector).unwrap();
        client.start().unwrap();

        assert!(wait_for(Duration::from_secs(3), || {
            connected_at.lock().unwrap().len() >= 2
        }));
        client.stop();
        client.run_and_wait().unwrap();

        let connected_at = connected_at.lock().unwrap();
        let gap = connected_at[1] - connected_at[0];
        assert!(gap < Duration::from_millis(500), "reconnected after {:?}", gap);
    }

    #[test]
    fn test_send_while_receive_loop_reads() {
        let connector = ScriptedConnector::default();
        let mut client = ReconnectingClient::with_connector(
            scripted_config().with_read_timeout(Duration::from_secs(1)),
            EventCallbacks::new(),
            connector.clone(),
        )
        .unwrap();
        client.start().unwrap();
        assert!(wait_for(Duration::from_secs(2), || {
            client.state() == ConnectionState::Connected
        }));

        for index in 0..20 {
            let started = Instant::now();
            client.send(format!("message {}", index)).unwrap();
            assert!(started.elapsed() < Duration::from_millis(200));
        }
        client.stop();
        client.run_and_wait().unwrap();

        let sent = connector.script.lock().unwrap().sent.clone();
        let expected: Vec<Payload> = (0..20).map(|i| Payload::from(format!("message {}", i))).collect();
        assert_eq!(sent, expected);
    }

    #[test]
    fn test_panicking_callback_fails_the_run() {
        let connector = ScriptedConnector::default();
        connector
            .script
            .lock()
            .unwrap()
            .inbox
            .push_back(Received::Message("boom".into()));
        let callbacks = EventCallbacks::new().on_message(|_| panic!("handler exploded"));

        let mut client =
            ReconnectingClient::with_connector(scripted_config(), callbacks, connector).unwrap();
        client.start().unwrap();

        match client.run_and_wait() {
            Err(DakaraError::SupervisorFailure {
                worker,
                kind,
                cause,
            }) => {
                assert_eq!(worker, RECEIVE_WORKER);
                assert_eq!(kind, FailureKind::Panic);
                assert!(cause.contains("handler exploded"));
            }
            other => panic!("expected a supervisor failure, got {:?}", other),
        }
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_rejected_authentication_is_not_retried() {
        let connector = ScriptedConnector::default();
        connector.script.lock().unwrap().reject_auth = true;

        let mut client = ReconnectingClient::with_connector(
            scripted_config(),
            EventCallbacks::new(),
            connector.clone(),
        )
        .unwrap();
        client.start().unwrap();

        assert!(matches!(
            client.run_and_wait(),
            Err(DakaraError::SupervisorFailure { .. })
        ));
        assert_eq!(connector.script.lock().unwrap().connects, 1);
    }

    #[test]
    fn test_handle_stops_client() {
        let connector = ScriptedConnector::default();
        let mut client = ReconnectingClient::with_connector(
            scripted_config(),
            EventCallbacks::new(),
            connector,
        )
        .unwrap();
        let handle = client.handle();
        client.start().unwrap();

        assert!(wait_for(Duration::from_secs(2), || {
            handle.state() == ConnectionState::Connected
        }));
        handle.send("ping").unwrap();
        handle.stop();

        client.run_and_wait().unwrap();
        assert_eq!(handle.state(), ConnectionState::Closed);
        assert!(matches!(handle.send("late"), Err(DakaraError::NotConnected(_))));
    }
}
