//! Supervised background workers.
//!
//! A group of workers runs on plain OS threads and shares one [`StopSignal`].
//! Any unhandled failure in one worker (an error return or a panic) is
//! captured, sets the signal and brings the whole group down, so a run can
//! never end up half alive:
//!
//! ```no_run
//! use dakara_base::workers::{Worker, WorkerContext, WorkerSupervisor};
//! use std::time::Duration;
//!
//! let mut supervisor = WorkerSupervisor::new();
//! supervisor
//!     .start(vec![
//!         Worker::new("heartbeat", |context: WorkerContext| {
//!             while !context.stop_signal().wait_timeout(Duration::from_secs(1)) {
//!                 println!("still alive");
//!             }
//!             Ok(())
//!         }),
//!         Worker::new("listener", |_context| {
//!             anyhow::bail!("socket vanished")
//!         }),
//!     ])
//!     .expect("valid workers");
//!
//! // returns the listener failure once the heartbeat has been joined
//! let outcome = supervisor.run_and_wait();
//! assert!(outcome.is_err());
//! ```

pub mod failure;
pub mod signal;
pub mod supervisor;

pub use failure::{FailureKind, FailureRecord, FailureSlot};
pub use signal::StopSignal;
pub use supervisor::{SupervisorHandle, Worker, WorkerContext, WorkerSupervisor};
