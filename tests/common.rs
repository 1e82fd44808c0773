// tests/common.rs
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

// Initializes test logging once across all tests of a binary.
// RUST_LOG=debug cargo test -- --nocapture shows the client logs.
pub fn setup() {
    INIT.call_once(|| {
        env_logger::builder().is_test(true).try_init().ok();
    });
}

/// A local port nothing listens on.
#[allow(dead_code)]
pub fn refused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    port
}

/// Binds a listener on a free local port and returns it with its ws:// URL.
#[allow(dead_code)]
pub fn ws_listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    (listener, format!("ws://127.0.0.1:{}/ws/", port))
}

/// Accepts one WebSocket connection on `listener`.
#[allow(dead_code)]
pub fn accept_one(listener: &TcpListener) -> tungstenite::WebSocket<TcpStream> {
    let (stream, _) = listener.accept().expect("accept");
    tungstenite::accept(stream).expect("handshake")
}

/// Reads until the peer goes away.
#[allow(dead_code)]
pub fn drain(socket: &mut tungstenite::WebSocket<TcpStream>) {
    while socket.read_message().is_ok() {}
}

/// Polls `condition` every 10ms until it holds or `timeout` elapses.
#[allow(dead_code)]
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Shared, timestamped event log written by client callbacks.
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct Events {
    entries: Arc<Mutex<Vec<(Instant, String)>>>,
}

#[allow(dead_code)]
impl Events {
    pub fn push(&self, event: impl Into<String>) {
        self.entries
            .lock()
            .unwrap()
            .push((Instant::now(), event.into()));
    }

    pub fn names(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.names().iter().filter(|n| n.starts_with(prefix)).count()
    }

    pub fn instants(&self, prefix: &str) -> Vec<Instant> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, name)| name.starts_with(prefix))
            .map(|(at, _)| *at)
            .collect()
    }
}
