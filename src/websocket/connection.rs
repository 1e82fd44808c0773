use log::{debug, info, trace, warn};
use std::collections::VecDeque;
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;

use super::callbacks::{EventCallbacks, Payload};
use super::policy::ReconnectPolicy;
use super::state::{ConnectionState, RetryState};
use super::transport::{Connector, Received, Transport, READ_SLICE};
use crate::error::{DakaraError, Result};

type Slot = Option<Box<dyn Transport>>;

#[derive(Debug, Default)]
struct Status {
    state: ConnectionState,
    retry: RetryState,
    /// Set once `on_connected` has returned; the receive side waits for it.
    readable: bool,
    /// Write failure noticed by a sender, turned into a loss by the reader.
    fault: Option<String>,
    /// Bumped on every established connection; a send only targets the
    /// connection it saw.
    generation: u64,
}

/// A send waiting for the receive loop to write it.
struct Outgoing {
    payload: Payload,
    generation: u64,
    reply: SyncSender<Result<()>>,
}

/// The single live connection of a client and its lifecycle.
///
/// Transitions happen on the two loops that drive it: the maintenance loop
/// connects, the receive loop declares losses. Senders only read the state.
/// Callbacks are always invoked with no lock held, so they may call back into
/// the connection.
pub struct PersistentConnection {
    connector: Box<dyn Connector>,
    policy: ReconnectPolicy,
    callbacks: EventCallbacks,
    status: Mutex<Status>,
    changed: Condvar,
    transport: Mutex<Slot>,
    outbox: Mutex<VecDeque<Outgoing>>,
}

impl PersistentConnection {
    pub fn new(
        connector: Box<dyn Connector>,
        policy: ReconnectPolicy,
        callbacks: EventCallbacks,
    ) -> Self {
        Self {
            connector,
            policy,
            callbacks,
            status: Mutex::new(Status::default()),
            changed: Condvar::new(),
            transport: Mutex::new(None),
            outbox: Mutex::new(VecDeque::new()),
        }
    }

    pub fn endpoint(&self) -> &str {
        self.connector.endpoint()
    }

    pub fn state(&self) -> ConnectionState {
        self.status().state
    }

    pub fn retry(&self) -> RetryState {
        self.status().retry
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub(crate) fn callbacks(&self) -> &EventCallbacks {
        &self.callbacks
    }

    /// One connection attempt: `DISCONNECTED -> CONNECTING -> CONNECTED` or
    /// back to `DISCONNECTED`.
    ///
    /// A failed attempt bumps the retry counter, reports the error through
    /// `on_error` and returns it. A successful one resets the counter and
    /// fires `on_connected`. Nothing happens unless the connection is
    /// `DISCONNECTED`.
    pub fn connect(&self) -> Result<()> {
        {
            let mut status = self.status();
            if status.state != ConnectionState::Disconnected {
                debug!("Connect skipped in state {}", status.state);
                return Ok(());
            }
            status.state = ConnectionState::Connecting;
        }

        debug!("Connecting to {}", self.endpoint());
        match self.connector.connect() {
            Ok(transport) => self.established(transport),
            Err(error) => {
                let closing = {
                    let mut status = self.status();
                    let attempts = status.retry.attempts().saturating_add(1);
                    let delay = self.policy.delay_for(attempts - 1);
                    status.retry.record_failure(delay);
                    if status.state == ConnectionState::Connecting {
                        status.state = ConnectionState::Disconnected;
                        false
                    } else {
                        true
                    }
                };
                self.changed.notify_all();

                if !closing {
                    warn!("Unable to connect to {}: {}", self.endpoint(), error);
                    self.callbacks.error(error.kind(), &error.to_string());
                }
                Err(error)
            }
        }
    }

    fn established(&self, transport: Box<dyn Transport>) -> Result<()> {
        *self.transport() = Some(transport);

        let still_wanted = {
            let mut status = self.status();
            if status.state == ConnectionState::Connecting {
                status.state = ConnectionState::Connected;
                status.retry.reset();
                status.fault = None;
                status.generation = status.generation.wrapping_add(1);
                true
            } else {
                false
            }
        };

        if !still_wanted {
            // closed while the handshake was running
            if let Some(mut transport) = self.transport().take() {
                transport.close();
            }
            return Ok(());
        }

        info!("Connected to {}", self.endpoint());
        self.callbacks.connected();

        {
            let mut status = self.status();
            if status.state == ConnectionState::Connected {
                status.readable = true;
            }
        }
        self.changed.notify_all();
        Ok(())
    }

    /// Sends one message.
    ///
    /// Fails with [`DakaraError::NotConnected`] unless `CONNECTED`, including
    /// when the connection drops between the check and the write. Nothing is
    /// ever queued for a later connection.
    ///
    /// The write happens on the calling thread when the transport is free.
    /// While the receive loop is reading, the message is handed to it and
    /// written between two read slices; the result comes back either way.
    pub fn send(&self, payload: Payload) -> Result<()> {
        let generation = self.writable_generation()?;

        match self.transport.try_lock() {
            Ok(mut transport) => self.write(&mut transport, generation, &payload),
            Err(TryLockError::Poisoned(poisoned)) => {
                self.write(&mut poisoned.into_inner(), generation, &payload)
            }
            Err(TryLockError::WouldBlock) => self.enqueue(payload, generation),
        }
    }

    fn enqueue(&self, payload: Payload, generation: u64) -> Result<()> {
        let (reply, replied) = mpsc::sync_channel(1);
        self.outbox().push_back(Outgoing {
            payload,
            generation,
            reply,
        });
        trace!("Message queued for the receive loop");

        loop {
            match replied.recv_timeout(READ_SLICE) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Timeout) => self.ensure_writable(generation)?,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(DakaraError::NotConnected(
                        "Message dropped before being sent".to_string(),
                    ))
                }
            }
        }
    }

    /// Writes the messages queued by senders. Called by the receive loop
    /// between reads.
    pub(crate) fn flush_outbox(&self) {
        if self.outbox().is_empty() {
            return;
        }

        let mut transport = self.transport();
        loop {
            let next = self.outbox().pop_front();
            let Some(outgoing) = next else {
                break;
            };
            let result = self.write(&mut transport, outgoing.generation, &outgoing.payload);
            let _ = outgoing.reply.send(result);
        }
    }

    fn write(&self, transport: &mut Slot, generation: u64, payload: &Payload) -> Result<()> {
        self.ensure_writable(generation)?;
        let live = transport
            .as_mut()
            .ok_or_else(|| DakaraError::NotConnected("No connection established".to_string()))?;

        live.send(payload).map_err(|error| {
            let mut status = self.status();
            if status.generation == generation
                && status.state == ConnectionState::Connected
                && status.fault.is_none()
            {
                status.fault = Some(error.to_string());
            }
            error
        })
    }

    /// Fails every queued message; they were meant for a connection that is gone.
    fn drop_outbox(&self) {
        let pending: Vec<Outgoing> = self.outbox().drain(..).collect();
        for outgoing in pending {
            let _ = outgoing.reply.send(Err(DakaraError::NotConnected(
                "Connection lost before sending".to_string(),
            )));
        }
    }

    fn writable_generation(&self) -> Result<u64> {
        let status = self.status();
        Self::check_writable(&status)?;
        Ok(status.generation)
    }

    fn ensure_writable(&self, generation: u64) -> Result<()> {
        let status = self.status();
        Self::check_writable(&status)?;
        if status.generation != generation {
            return Err(DakaraError::NotConnected(
                "Connection replaced before sending".to_string(),
            ));
        }
        Ok(())
    }

    fn check_writable(status: &Status) -> Result<()> {
        if status.state != ConnectionState::Connected {
            return Err(DakaraError::NotConnected(format!(
                "Connection is {}",
                status.state
            )));
        }
        if let Some(fault) = &status.fault {
            return Err(DakaraError::NotConnected(format!(
                "Connection broken: {}",
                fault
            )));
        }
        Ok(())
    }

    /// Waits up to `timeout` for the connection to be readable.
    pub(crate) fn wait_readable(&self, timeout: Duration) -> bool {
        let status = self.status();
        let (status, _) = self
            .changed
            .wait_timeout_while(status, timeout, |status| {
                !status.readable && !status.state.is_terminal()
            })
            .unwrap_or_else(PoisonError::into_inner);
        status.readable
    }

    /// Waits up to `timeout` for the state to leave `state`; returns the current one.
    pub(crate) fn wait_state_change(
        &self,
        state: ConnectionState,
        timeout: Duration,
    ) -> ConnectionState {
        let status = self.status();
        let (status, _) = self
            .changed
            .wait_timeout_while(status, timeout, |status| status.state == state)
            .unwrap_or_else(PoisonError::into_inner);
        status.state
    }

    /// One bounded read on the live connection.
    ///
    /// Losses (remote close, read failure, earlier write failure) come back
    /// as [`Received::Closed`] for the caller to hand to [`Self::mark_lost`].
    pub(crate) fn receive(&self) -> Received {
        if let Some(fault) = self.status().fault.clone() {
            return Received::Closed(format!("write failure: {}", fault));
        }

        let mut transport = self.transport();
        let Some(live) = transport.as_mut() else {
            return Received::Idle;
        };
        match live.recv() {
            Ok(received) => received,
            Err(error) => Received::Closed(error.to_string()),
        }
    }

    /// `CONNECTED -> DISCONNECTED`, firing `on_disconnected`. Ignored in any
    /// other state, so a loss racing with `close()` stays silent.
    pub(crate) fn mark_lost(&self, reason: &str) {
        if self.state() != ConnectionState::Connected {
            return;
        }

        // taken before the state flips so a reconnect cannot hand its fresh
        // transport to this cleanup
        let stale = self.transport().take();

        let lost = {
            let mut status = self.status();
            if status.state == ConnectionState::Connected {
                status.state = ConnectionState::Disconnected;
                status.readable = false;
                status.fault = None;
                status.retry.schedule(self.policy.delay_for(0));
                true
            } else {
                false
            }
        };

        if let Some(mut transport) = stale {
            transport.close();
        }
        if !lost {
            return;
        }

        self.changed.notify_all();
        self.drop_outbox();
        warn!("Connection to {} lost: {}", self.endpoint(), reason);
        self.callbacks.disconnected(reason);
    }

    /// `any -> CLOSING -> CLOSED`. Idempotent; no callback fires afterwards.
    pub fn close(&self) {
        {
            let mut status = self.status();
            if status.state.is_terminal() {
                return;
            }
            status.state = ConnectionState::Closing;
            status.readable = false;
        }
        self.changed.notify_all();
        debug!("Closing connection to {}", self.endpoint());

        if let Some(mut transport) = self.transport().take() {
            transport.close();
        }

        self.status().state = ConnectionState::Closed;
        self.changed.notify_all();
        self.drop_outbox();
        info!("Connection to {} closed", self.endpoint());
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transport(&self) -> MutexGuard<'_, Slot> {
        self.transport.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outbox(&self) -> MutexGuard<'_, VecDeque<Outgoing>> {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for PersistentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentConnection")
            .field("endpoint", &self.endpoint())
            .field("state", &self.state())
            .field("retry", &self.retry())
            .finish()
    }
}
