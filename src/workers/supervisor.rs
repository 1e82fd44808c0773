use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::failure::{panic_message, FailureKind, FailureSlot};
use super::signal::StopSignal;
use crate::error::{DakaraError, Result};

const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

type WorkerFn = Box<dyn FnOnce(WorkerContext) -> anyhow::Result<()> + Send + 'static>;

/// A named function to run on its own thread under a [`WorkerSupervisor`].
pub struct Worker {
    name: String,
    run: WorkerFn,
}

impl Worker {
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(WorkerContext) -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(run),
        }
    }

    /// Timer worker: waits `delay`, then runs `run`. If the run is stopped
    /// during the wait, `run` is never called.
    pub fn delayed<F>(name: impl Into<String>, delay: Duration, run: F) -> Self
    where
        F: FnOnce(WorkerContext) -> anyhow::Result<()> + Send + 'static,
    {
        Self::new(name, move |context: WorkerContext| {
            if context.stop_signal().wait_timeout(delay) {
                debug!("Timer of worker '{}' cancelled", context.name());
                return Ok(());
            }
            run(context)
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker").field("name", &self.name).finish()
    }
}

/// What a running worker sees of its supervisor.
#[derive(Clone, Debug)]
pub struct WorkerContext {
    name: Arc<str>,
    signal: StopSignal,
}

impl WorkerContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.signal
    }

    pub fn is_stopped(&self) -> bool {
        self.signal.is_set()
    }

    /// Requests an orderly stop of the whole run.
    pub fn stop(&self) {
        self.signal.set();
    }
}

/// Cloneable handle to stop a supervised run from any thread.
#[derive(Clone, Debug)]
pub struct SupervisorHandle {
    signal: StopSignal,
    failures: Arc<FailureSlot>,
}

impl SupervisorHandle {
    pub fn stop(&self) {
        if self.signal.set() {
            debug!("Stop requested");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.signal.is_set()
    }

    pub fn has_failed(&self) -> bool {
        !self.failures.is_empty()
    }
}

struct RunningWorker {
    name: String,
    handle: JoinHandle<()>,
}

/// Runs a group of workers so that the failure of any one of them stops all
/// of them.
///
/// Every worker thread funnels its exit through the same wrapper: an error
/// return or a panic is recorded in the shared [`FailureSlot`] and sets the
/// [`StopSignal`]. [`WorkerSupervisor::run_and_wait`] then joins everybody and
/// surfaces the first failure as a [`DakaraError::SupervisorFailure`].
pub struct WorkerSupervisor {
    signal: StopSignal,
    failures: Arc<FailureSlot>,
    join_timeout: Duration,
    running: Vec<RunningWorker>,
    exits_tx: Sender<String>,
    exits_rx: Receiver<String>,
}

impl Default for WorkerSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerSupervisor {
    pub fn new() -> Self {
        Self::with_signal(StopSignal::new())
    }

    /// Builds a supervisor around an existing signal, so that code created
    /// before the supervisor (callbacks for instance) can stop the run.
    pub fn with_signal(signal: StopSignal) -> Self {
        let (exits_tx, exits_rx) = mpsc::channel();
        Self {
            signal,
            failures: Arc::new(FailureSlot::new()),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            running: Vec::new(),
            exits_tx,
            exits_rx,
        }
    }

    pub fn with_join_timeout(mut self, join_timeout: Duration) -> Self {
        self.join_timeout = join_timeout;
        self
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.signal
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            signal: self.signal.clone(),
            failures: Arc::clone(&self.failures),
        }
    }

    /// Names of the workers started and not yet joined.
    pub fn worker_names(&self) -> Vec<&str> {
        self.running.iter().map(|w| w.name.as_str()).collect()
    }

    /// Launches each worker on its own thread.
    ///
    /// Fails with [`DakaraError::ConfigurationError`] before launching anything
    /// if a name is empty or collides with another worker of this supervisor,
    /// or if the supervisor was already stopped. A supervisor runs once; a new
    /// run needs a new supervisor and a fresh signal.
    pub fn start(&mut self, workers: Vec<Worker>) -> Result<()> {
        if self.signal.is_set() {
            return Err(DakaraError::ConfigurationError(
                "Supervisor already stopped, a new run needs a new supervisor".to_string(),
            ));
        }

        let mut names: HashSet<&str> = self.running.iter().map(|w| w.name.as_str()).collect();
        for worker in &workers {
            if worker.name.is_empty() {
                return Err(DakaraError::ConfigurationError(
                    "Worker name cannot be empty".to_string(),
                ));
            }
            if !names.insert(worker.name.as_str()) {
                return Err(DakaraError::ConfigurationError(format!(
                    "Duplicate worker name '{}'",
                    worker.name
                )));
            }
        }

        for worker in workers {
            let name = worker.name.clone();
            let spawned = thread::Builder::new()
                .name(name.clone())
                .spawn(self.wrap(worker));
            match spawned {
                Ok(handle) => {
                    debug!("Started worker '{}'", name);
                    self.running.push(RunningWorker { name, handle });
                }
                Err(e) => {
                    // siblings already launched must not keep running alone
                    error!("Unable to spawn worker '{}': {}", name, e);
                    self.signal.set();
                    return Err(DakaraError::IoError(e));
                }
            }
        }
        Ok(())
    }

    fn wrap(&self, worker: Worker) -> impl FnOnce() + Send + 'static {
        let Worker { name, run } = worker;
        let context = WorkerContext {
            name: Arc::from(name.as_str()),
            signal: self.signal.clone(),
        };
        let signal = self.signal.clone();
        let failures = Arc::clone(&self.failures);
        let exits = self.exits_tx.clone();

        move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(move || run(context)));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some((FailureKind::Error, format!("{:#}", e))),
                Err(payload) => Some((FailureKind::Panic, panic_message(payload.as_ref()))),
            };
            match failure {
                Some((kind, message)) => {
                    failures.record(&name, kind, message);
                    signal.set();
                }
                None => debug!("Worker '{}' finished", name),
            }
            let _ = exits.send(name);
        }
    }

    /// Sets the stop signal; idempotent and callable from any thread.
    pub fn stop(&self) {
        if self.signal.set() {
            debug!("Stop requested");
        }
    }

    /// Installs a Ctrl+C listener that stops the run in an orderly way.
    ///
    /// The listener lives on its own thread and goes away with the run.
    pub fn stop_on_interrupt(&self) -> Result<()> {
        let signal = self.signal.clone();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        thread::Builder::new()
            .name("interrupt-listener".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let waiter = signal.clone();
                    let stopped = tokio::task::spawn_blocking(move || waiter.wait());
                    tokio::select! {
                        result = tokio::signal::ctrl_c() => match result {
                            Ok(()) => {
                                info!("Interrupt received, stopping");
                                signal.set();
                            }
                            Err(e) => warn!("Unable to listen for interrupt: {}", e),
                        },
                        _ = stopped => {},
                    }
                });
            })?;
        Ok(())
    }

    /// Blocks until the stop signal is set, joins every worker and reports.
    ///
    /// Returns `Ok(())` after an orderly stop, the first recorded failure as a
    /// [`DakaraError::SupervisorFailure`] otherwise. Workers still running after
    /// the join timeout are left behind and reported as a
    /// [`DakaraError::ShutdownTimeoutError`] when no failure takes precedence.
    pub fn run_and_wait(&mut self) -> Result<()> {
        debug!("Waiting for stop signal");
        self.signal.wait();
        self.join_all()
    }

    fn join_all(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.join_timeout;
        let mut pending: HashSet<String> = self.running.iter().map(|w| w.name.clone()).collect();

        while !pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.exits_rx.recv_timeout(remaining) {
                Ok(name) => {
                    pending.remove(&name);
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        for worker in self.running.drain(..) {
            if pending.contains(&worker.name) {
                error!(
                    "Worker '{}' did not exit within {:?}, leaving it behind",
                    worker.name, self.join_timeout
                );
                continue;
            }
            if worker.handle.join().is_err() {
                warn!("Worker '{}' thread ended abnormally", worker.name);
            }
            debug!("Joined worker '{}'", worker.name);
        }

        if let Some(record) = self.failures.get() {
            return Err(record.into_error());
        }

        if !pending.is_empty() {
            let mut workers: Vec<String> = pending.into_iter().collect();
            workers.sort();
            return Err(DakaraError::ShutdownTimeoutError {
                workers,
                timeout: self.join_timeout,
            });
        }

        debug!("All workers stopped");
        Ok(())
    }
}

impl Drop for WorkerSupervisor {
    fn drop(&mut self) {
        if !self.running.is_empty() {
            self.signal.set();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn looping(name: &str, exited: Arc<AtomicUsize>) -> Worker {
        Worker::new(name, move |context: WorkerContext| {
            while !context.stop_signal().wait_timeout(Duration::from_millis(10)) {}
            exited.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut supervisor = WorkerSupervisor::new();
        let result = supervisor.start(vec![
            Worker::new("same", |_| Ok(())),
            Worker::new("same", |_| Ok(())),
        ]);
        assert!(matches!(result, Err(DakaraError::ConfigurationError(_))));
        assert!(supervisor.worker_names().is_empty());
    }

    #[test]
    fn test_name_collision_with_running_worker() {
        let mut supervisor = WorkerSupervisor::new();
        let exited = Arc::new(AtomicUsize::new(0));
        supervisor.start(vec![looping("one", exited.clone())]).unwrap();
        let result = supervisor.start(vec![looping("one", exited)]);
        assert!(matches!(result, Err(DakaraError::ConfigurationError(_))));
        supervisor.stop();
        supervisor.run_and_wait().unwrap();
    }

    #[test]
    fn test_stopped_supervisor_cannot_be_restarted() {
        let mut supervisor = WorkerSupervisor::new();
        supervisor
            .start(vec![Worker::new("first-run", |_| bail!("first run failed"))])
            .unwrap();
        assert!(matches!(
            supervisor.run_and_wait(),
            Err(DakaraError::SupervisorFailure { .. })
        ));

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let result = supervisor.start(vec![Worker::new("second-run", move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })]);

        assert!(matches!(result, Err(DakaraError::ConfigurationError(_))));
        assert!(supervisor.worker_names().is_empty());
        thread::sleep(Duration::from_millis(20));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_error_stops_siblings_and_surfaces() {
        let exited = Arc::new(AtomicUsize::new(0));
        let mut supervisor = WorkerSupervisor::new();
        supervisor
            .start(vec![
                looping("sibling-a", exited.clone()),
                looping("sibling-b", exited.clone()),
                Worker::new("faulty", |_| bail!("disk on fire")),
            ])
            .unwrap();

        match supervisor.run_and_wait() {
            Err(DakaraError::SupervisorFailure {
                worker, kind, cause, ..
            }) => {
                assert_eq!(worker, "faulty");
                assert_eq!(kind, FailureKind::Error);
                assert!(cause.contains("disk on fire"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(exited.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panic_is_captured() {
        let mut supervisor = WorkerSupervisor::new();
        supervisor
            .start(vec![Worker::new("panicky", |_| panic!("bad index"))])
            .unwrap();
        match supervisor.run_and_wait() {
            Err(DakaraError::SupervisorFailure { worker, kind, cause }) => {
                assert_eq!(worker, "panicky");
                assert_eq!(kind, FailureKind::Panic);
                assert_eq!(cause, "bad index");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_external_stop_is_orderly_and_idempotent() {
        let exited = Arc::new(AtomicUsize::new(0));
        let mut supervisor = WorkerSupervisor::new();
        supervisor.start(vec![looping("loop", exited.clone())]).unwrap();

        let handle = supervisor.handle();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            handle.stop();
            handle.stop();
        });

        supervisor.run_and_wait().unwrap();
        stopper.join().unwrap();
        supervisor.stop();
        assert!(supervisor.run_and_wait().is_ok());
        assert_eq!(exited.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_from_inside_worker() {
        let mut supervisor = WorkerSupervisor::new();
        supervisor
            .start(vec![Worker::new("quitter", |context: WorkerContext| {
                context.stop();
                Ok(())
            })])
            .unwrap();
        assert!(supervisor.run_and_wait().is_ok());
        assert!(!supervisor.handle().has_failed());
    }

    #[test]
    fn test_stuck_worker_reports_shutdown_timeout() {
        let release = StopSignal::new();
        let blocker = release.clone();
        let mut supervisor =
            WorkerSupervisor::new().with_join_timeout(Duration::from_millis(50));
        supervisor
            .start(vec![Worker::new("stuck", move |_| {
                blocker.wait_timeout(Duration::from_secs(10));
                Ok(())
            })])
            .unwrap();
        supervisor.stop();

        let start = Instant::now();
        match supervisor.run_and_wait() {
            Err(DakaraError::ShutdownTimeoutError { workers, .. }) => {
                assert_eq!(workers, vec!["stuck".to_string()]);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(start.elapsed() < Duration::from_secs(5));
        release.set();
    }

    #[test]
    fn test_delayed_worker_cancelled_by_stop() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let mut supervisor = WorkerSupervisor::new();
        supervisor
            .start(vec![Worker::delayed(
                "timer",
                Duration::from_secs(30),
                move |_| {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                },
            )])
            .unwrap();
        supervisor.stop();
        supervisor.run_and_wait().unwrap();
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_delayed_worker_runs_after_delay() {
        let mut supervisor = WorkerSupervisor::new();
        let start = Instant::now();
        supervisor
            .start(vec![Worker::delayed(
                "timer",
                Duration::from_millis(30),
                |context: WorkerContext| {
                    context.stop();
                    Ok(())
                },
            )])
            .unwrap();
        supervisor.run_and_wait().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
