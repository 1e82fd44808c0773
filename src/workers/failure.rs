use log::{debug, error};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::error::DakaraError;

/// How a worker died.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The worker function returned an error.
    Error,
    /// The worker function panicked.
    Panic,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Error => f.write_str("error"),
            FailureKind::Panic => f.write_str("panic"),
        }
    }
}

/// A captured worker failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub sequence: u64,
    pub worker: String,
    pub kind: FailureKind,
    pub message: String,
}

impl FailureRecord {
    pub fn into_error(self) -> DakaraError {
        DakaraError::SupervisorFailure {
            worker: self.worker,
            kind: self.kind,
            cause: self.message,
        }
    }
}

/// Write-once outcome slot shared by the workers of one supervisor.
///
/// Every failure draws a sequence number; the slot keeps the record with the
/// lowest one. Later failures are logged and dropped.
#[derive(Debug, Default)]
pub struct FailureSlot {
    sequence: AtomicU64,
    record: Mutex<Option<FailureRecord>>,
}

impl FailureSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure; returns `true` if it is now the surfaced one.
    pub fn record(&self, worker: &str, kind: FailureKind, message: String) -> bool {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let mut slot = self.record.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = slot.as_ref() {
            if existing.sequence < sequence {
                debug!(
                    "Worker '{}' also failed ({}: {}), keeping the failure of '{}'",
                    worker, kind, message, existing.worker
                );
                return false;
            }
        }

        error!("Worker '{}' failed ({}): {}", worker, kind, message);
        *slot = Some(FailureRecord {
            sequence,
            worker: worker.to_string(),
            kind,
            message,
        });
        true
    }

    pub fn get(&self) -> Option<FailureRecord> {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_empty(&self) -> bool {
        self.get().is_none()
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
