//! Host-side request broker.
//!
//! [`ExecutionBroker`] turns `run` and `load` calls into message round-trips
//! with the current worker and recovers from workers that stop answering.
//!
//! Every call gets its own reply channel and is bound to the worker
//! generation it was posted to. Two budgets bound a call:
//!
//! ```text
//! post ──(start_timeout)──► Started ──(settle_timeout)──► RunResponse
//! ```
//!
//! When a budget runs out the worker is killed and replaced, and the call
//! fails with [`BrokerError::Timeout`]. If a load had succeeded earlier, the
//! replacement is loaded in the background so the next call starts warm.
//!
//! The worker's output buffer is shared by every call it serves, so callers
//! should not overlap calls. Overlapping calls still get their own replies.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{Instant, sleep_until};

use crate::config::{BrokerConfig, RuntimeConfig};
use crate::error::Result;
use crate::ipc::{
    GuestError, ProcessWorkerFactory, ReplyPort, Request, Response, RunOptions,
    ThreadWorkerFactory, WorkerFactory, WorkerLink,
};
use crate::worker::RuntimeLoader;

/// Which budget ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// No `started` (or load result) within the start budget.
    Start,
    /// No result within the settle budget after `started`.
    Settle,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutPhase::Start => f.write_str("waiting for the worker to start"),
            TimeoutPhase::Settle => f.write_str("waiting for the result"),
        }
    }
}

/// Why a broker call failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// The worker stopped answering and has been replaced.
    #[error("timed out {phase}")]
    Timeout { phase: TimeoutPhase },

    /// No worker could take the call.
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    /// The worker answered with a failure.
    #[error("{0}")]
    Guest(GuestError),

    /// The worker answered with a message that doesn't fit the call.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// The broker's single worker slot.
struct Slot {
    worker: Option<Box<dyn WorkerLink>>,
    /// Bumped whenever the occupant is removed, so calls bound to a removed
    /// worker can't affect its replacement.
    generation: u64,
    /// A load has succeeded at least once.
    loaded: bool,
}

struct Inner {
    config: BrokerConfig,
    factory: Box<dyn WorkerFactory>,
    slot: Mutex<Slot>,
}

/// Call/response API over a worker that may hang.
///
/// Cloning is cheap; clones share the worker slot.
#[derive(Clone)]
pub struct ExecutionBroker {
    inner: Arc<Inner>,
}

impl ExecutionBroker {
    /// Create a broker and start its first worker.
    pub fn new(config: BrokerConfig, factory: impl WorkerFactory + 'static) -> Self {
        let broker = Self {
            inner: Arc::new(Inner {
                config,
                factory: Box::new(factory),
                slot: Mutex::new(Slot {
                    worker: None,
                    generation: 0,
                    loaded: false,
                }),
            }),
        };
        broker.fill_slot();
        broker
    }

    /// Broker whose workers run on threads of this process.
    pub fn with_thread_worker<L>(config: BrokerConfig, loader: L) -> Self
    where
        L: RuntimeLoader + Clone + Send + Sync + 'static,
    {
        Self::new(config, ThreadWorkerFactory::new(loader))
    }

    /// Broker whose workers are `pysnip-worker` processes.
    pub fn with_process_worker(config: BrokerConfig, runtime: &RuntimeConfig) -> Result<Self> {
        Ok(Self::new(config, ProcessWorkerFactory::locate(runtime)?))
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Generation of the worker currently in the slot.
    pub fn generation(&self) -> u64 {
        self.lock_slot().generation
    }

    pub fn has_worker(&self) -> bool {
        self.lock_slot().worker.is_some()
    }

    /// Whether any load has succeeded on this broker.
    pub fn is_loaded(&self) -> bool {
        self.lock_slot().loaded
    }

    /// Check and run `code`, resolving with its captured output.
    pub async fn run(
        &self,
        code: impl Into<String>,
        options: RunOptions,
    ) -> std::result::Result<String, BrokerError> {
        let request = Request::Run {
            code: code.into(),
            options,
        };
        let (generation, mut replies) = self.post(request)?;

        let config = self.inner.config;
        let mut phase = TimeoutPhase::Start;
        let mut deadline = Instant::now() + config.start_timeout;

        loop {
            tokio::select! {
                reply = replies.recv() => match reply {
                    Some(Response::Started) if phase == TimeoutPhase::Start => {
                        phase = TimeoutPhase::Settle;
                        deadline = Instant::now() + config.settle_timeout;
                    }
                    Some(Response::Started) => {
                        tracing::warn!("Ignoring repeated started acknowledgment");
                    }
                    Some(Response::RunResponse(response)) => {
                        return response.into_outcome().map_err(BrokerError::Guest);
                    }
                    Some(other) => {
                        return Err(BrokerError::Protocol(format!(
                            "unexpected reply to run: {:?}",
                            other
                        )));
                    }
                    None => {
                        return Err(BrokerError::Unavailable(
                            "worker stopped before replying".to_string(),
                        ));
                    }
                },
                () = sleep_until(deadline) => {
                    self.replace(generation, "run timed out", true);
                    return Err(BrokerError::Timeout { phase });
                }
            }
        }
    }

    /// Ask the worker to initialize its interpreter. Resolves with whether
    /// the interpreter is available.
    pub async fn load(&self) -> std::result::Result<bool, BrokerError> {
        self.load_with(true).await
    }

    async fn load_with(&self, reload_on_timeout: bool) -> std::result::Result<bool, BrokerError> {
        let (generation, mut replies) = self.post(Request::Load)?;
        let deadline = Instant::now() + self.inner.config.start_timeout;

        tokio::select! {
            reply = replies.recv() => match reply {
                Some(Response::LoadResponse { ok }) => {
                    if ok {
                        self.lock_slot().loaded = true;
                    }
                    Ok(ok)
                }
                Some(other) => Err(BrokerError::Protocol(format!(
                    "unexpected reply to load: {:?}",
                    other
                ))),
                None => Err(BrokerError::Unavailable(
                    "worker stopped before replying".to_string(),
                )),
            },
            () = sleep_until(deadline) => {
                self.replace(generation, "load timed out", reload_on_timeout);
                Err(BrokerError::Timeout { phase: TimeoutPhase::Start })
            }
        }
    }

    /// Kill the current worker and start a fresh one, reloading it if a
    /// load had succeeded before.
    pub fn restart(&self) {
        let generation = self.generation();
        self.replace(generation, "restart requested", true);
    }

    /// Kill the current worker. The next call starts a new one.
    pub fn shutdown(&self) {
        let worker = {
            let mut slot = self.lock_slot();
            let worker = slot.worker.take();
            if worker.is_some() {
                slot.generation += 1;
            }
            worker
        };
        if let Some(mut worker) = worker {
            tracing::debug!("Shutting down worker {}", worker.describe());
            worker.terminate();
        }
    }

    /// Post a request to the current worker on a fresh reply channel,
    /// starting a worker if the slot is empty.
    ///
    /// Posting only queues the request, so holding the slot lock here never
    /// waits on the worker.
    fn post(
        &self,
        request: Request,
    ) -> std::result::Result<(u64, UnboundedReceiver<Response>), BrokerError> {
        if !self.has_worker() {
            self.fill_slot();
        }

        let mut slot = self.lock_slot();
        let generation = slot.generation;
        let worker = slot
            .worker
            .as_mut()
            .ok_or_else(|| BrokerError::Unavailable("no worker available".to_string()))?;

        let (port, replies) = ReplyPort::channel();
        worker
            .post(request, port)
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        Ok((generation, replies))
    }

    /// Replace the worker of `generation`, if it is still the current one.
    fn replace(&self, generation: u64, reason: &str, allow_reload: bool) {
        let (old, reload) = {
            let mut slot = self.lock_slot();
            if slot.generation != generation {
                tracing::debug!(generation, "Worker already replaced");
                return;
            }
            slot.generation += 1;
            (slot.worker.take(), allow_reload && slot.loaded)
        };

        if let Some(mut worker) = old {
            tracing::info!("Terminating worker {} ({})", worker.describe(), reason);
            worker.terminate();
        }

        if self.fill_slot() && reload {
            self.reload_in_background();
        }
    }

    fn reload_in_background(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("No async runtime, skipping background reload");
            return;
        };

        let broker = self.clone();
        runtime.spawn(async move {
            match broker.load_with(false).await {
                Ok(true) => tracing::debug!("Replacement worker loaded"),
                Ok(false) => tracing::warn!("Replacement worker failed to load"),
                Err(e) => tracing::warn!("Replacement worker load failed: {}", e),
            }
        });
    }

    /// Start a worker and put it in the slot unless another call filled the
    /// slot first. Spawning happens without the slot lock held. Returns
    /// whether the slot ends up occupied.
    fn fill_slot(&self) -> bool {
        let mut worker = match self.inner.factory.spawn() {
            Ok(worker) => worker,
            Err(e) => {
                tracing::warn!("Failed to start worker: {}", e);
                return self.has_worker();
            }
        };

        {
            let mut slot = self.lock_slot();
            if slot.worker.is_none() {
                tracing::debug!(
                    generation = slot.generation,
                    "Worker started: {}",
                    worker.describe()
                );
                slot.worker = Some(worker);
                return true;
            }
        }

        tracing::debug!("Slot already filled, discarding {}", worker.describe());
        worker.terminate();
        self.has_worker()
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::worker::testing::{FakeLoader, HANG_CHECK, HANG_RUN, TYPE_ERROR};
    use crate::worker::{OUTPUT_LIMIT, output::truncation_marker};
    use std::time::Duration;

    fn fast_config() -> BrokerConfig {
        BrokerConfig {
            start_timeout: Duration::from_millis(400),
            settle_timeout: Duration::from_millis(200),
        }
    }

    fn broker(loader: &FakeLoader) -> ExecutionBroker {
        ExecutionBroker::with_thread_worker(fast_config(), loader.clone())
    }

    async fn wait_until(condition: impl Fn() -> bool) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        condition()
    }

    /// Thread workers that take `delay` to start.
    struct SlowWorkers {
        delay: Duration,
        inner: ThreadWorkerFactory<FakeLoader>,
    }

    impl WorkerFactory for SlowWorkers {
        fn spawn(&self) -> Result<Box<dyn WorkerLink>> {
            std::thread::sleep(self.delay);
            self.inner.spawn()
        }
    }

    struct NoWorkers;

    impl WorkerFactory for NoWorkers {
        fn spawn(&self) -> Result<Box<dyn WorkerLink>> {
            Err(Error::Ipc("no workers here".to_string()))
        }
    }

    #[tokio::test]
    async fn test_hello_world() {
        let broker = broker(&FakeLoader::new());
        let output = broker
            .run(r#"print("Hello, world!")"#, RunOptions::default())
            .await;
        assert_eq!(output, Ok("Hello, world!".to_string()));
    }

    #[tokio::test]
    async fn test_silent_code_resolves_empty() {
        let broker = broker(&FakeLoader::new());
        assert_eq!(
            broker.run("x = 1", RunOptions::default()).await,
            Ok(String::new())
        );
    }

    #[tokio::test]
    async fn test_guest_exception_rejects_with_structured_error() {
        let broker = broker(&FakeLoader::new());
        match broker.run("print(1 / 0)", RunOptions::default()).await {
            Err(BrokerError::Guest(GuestError::Exception(exception))) => {
                assert_eq!(exception.kind, "ZeroDivisionError");
                assert!(!exception.message.is_empty());
            }
            other => panic!("expected a guest exception, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_style_violation_reports_line() {
        let broker = broker(&FakeLoader::new());
        let code = "def a():\n    pass\ndef b():\n    pass\n";
        match broker.run(code, RunOptions::default()).await {
            Err(BrokerError::Guest(GuestError::Style(diagnostic))) => {
                assert!(diagnostic.contains("Line 3"), "got {}", diagnostic);
            }
            other => panic!("expected a style diagnostic, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_check_failure_still_executes() {
        // Diagnostics settle the call, but the worker runs the code anyway
        // and its result is discarded. Whether a failed check should skip
        // execution is an open product question; this pins current behavior.
        let loader = FakeLoader::new();
        let broker = broker(&loader);
        let code = "def a():\n    pass\ndef b():\n    pass\n";
        let result = broker.run(code, RunOptions::default()).await;
        assert!(matches!(
            result,
            Err(BrokerError::Guest(GuestError::Style(_)))
        ));
        assert!(wait_until(|| loader.executed().contains(&code.to_string())).await);

        // The discarded result doesn't leak into the next call.
        assert_eq!(
            broker.run(r#"print("next")"#, RunOptions::default()).await,
            Ok("next".to_string())
        );
    }

    #[tokio::test]
    async fn test_no_mypy_skips_type_check() {
        let broker = broker(&FakeLoader::new());
        let code = format!("x: int = 'a'  {}", TYPE_ERROR);

        match broker.run(code.clone(), RunOptions::default()).await {
            Err(BrokerError::Guest(GuestError::TypeCheck(diagnostic))) => {
                assert!(diagnostic.starts_with("Line 1"), "got {}", diagnostic);
            }
            other => panic!("expected a type diagnostic, got {:?}", other),
        }

        let skipped = broker.run(code, RunOptions { no_mypy: true }).await;
        assert_eq!(skipped, Ok(String::new()));
    }

    #[tokio::test]
    async fn test_truncated_output_is_identical_across_runs() {
        let broker = broker(&FakeLoader::new());
        let code = "for i in range(5000): print(i)";
        let first = broker.run(code, RunOptions::default()).await.unwrap();
        let second = broker.run(code, RunOptions::default()).await.unwrap();

        assert_eq!(first, second);
        let lines: Vec<&str> = first.lines().collect();
        assert_eq!(lines.len(), OUTPUT_LIMIT + 1);
        assert_eq!(lines.last().copied(), Some(truncation_marker(OUTPUT_LIMIT).as_str()));
    }

    #[tokio::test]
    async fn test_concurrent_loads_initialize_once() {
        let loader = FakeLoader::new();
        let broker = broker(&loader);

        let (a, b) = tokio::join!(broker.load(), broker.load());
        assert_eq!(a, Ok(true));
        assert_eq!(b, Ok(true));
        assert_eq!(loader.loads(), 1);
        // One warm-up, not two.
        assert_eq!(loader.executed().len(), 1);
        assert!(broker.is_loaded());
    }

    #[tokio::test]
    async fn test_overlapping_runs_keep_their_own_replies() {
        let broker = broker(&FakeLoader::new());
        let (a, b) = tokio::join!(
            broker.run(r#"print("a")"#, RunOptions::default()),
            broker.run(r#"print("b")"#, RunOptions::default()),
        );
        assert_eq!(a, Ok("a".to_string()));
        assert_eq!(b, Ok("b".to_string()));
    }

    #[tokio::test]
    async fn test_start_timeout_replaces_worker() {
        let loader = FakeLoader::new();
        let broker = broker(&loader);
        let before = broker.generation();

        let result = broker
            .run(format!("x = 1  {}", HANG_CHECK), RunOptions::default())
            .await;
        assert_eq!(
            result,
            Err(BrokerError::Timeout {
                phase: TimeoutPhase::Start
            })
        );
        assert!(broker.generation() > before);
        assert!(broker.has_worker());

        assert_eq!(
            broker.run(r#"print("recovered")"#, RunOptions::default()).await,
            Ok("recovered".to_string())
        );
    }

    #[tokio::test]
    async fn test_settle_timeout_uses_short_window() {
        let broker = ExecutionBroker::with_thread_worker(
            BrokerConfig {
                start_timeout: Duration::from_secs(10),
                settle_timeout: Duration::from_millis(200),
            },
            FakeLoader::new(),
        );

        let start = std::time::Instant::now();
        let result = broker
            .run(format!("x = 1  {}", HANG_RUN), RunOptions::default())
            .await;
        let elapsed = start.elapsed();

        assert_eq!(
            result,
            Err(BrokerError::Timeout {
                phase: TimeoutPhase::Settle
            })
        );
        assert!(
            elapsed < Duration::from_secs(3),
            "settle timeout took {:?}",
            elapsed
        );
    }

    #[tokio::test]
    async fn test_timeout_kills_abandoned_session() {
        let loader = FakeLoader::new();
        let broker = broker(&loader);

        let result = broker
            .run(format!("x = 1  {}", HANG_RUN), RunOptions::default())
            .await;
        assert!(matches!(result, Err(BrokerError::Timeout { .. })));
        assert_eq!(loader.kills(), 1);

        assert_eq!(
            broker.run(r#"print("fresh")"#, RunOptions::default()).await,
            Ok("fresh".to_string())
        );
        assert_eq!(loader.kills(), 1);
    }

    #[test]
    fn test_slot_is_not_locked_while_spawning() {
        let broker = ExecutionBroker::new(
            fast_config(),
            SlowWorkers {
                delay: Duration::from_millis(500),
                inner: ThreadWorkerFactory::new(FakeLoader::new()),
            },
        );
        let before = broker.generation();

        let restarting = broker.clone();
        let restart = std::thread::spawn(move || restarting.restart());
        std::thread::sleep(Duration::from_millis(100));

        let start = std::time::Instant::now();
        let generation = broker.generation();
        let occupied = broker.has_worker();
        assert!(
            start.elapsed() < Duration::from_millis(200),
            "slot lock held for {:?}",
            start.elapsed()
        );
        assert_eq!(generation, before + 1);
        assert!(!occupied);

        restart.join().unwrap();
        assert!(broker.has_worker());
        assert_eq!(broker.generation(), before + 1);
    }

    #[tokio::test]
    async fn test_replacement_is_reloaded_after_successful_load() {
        let loader = FakeLoader::new();
        let broker = broker(&loader);
        assert_eq!(broker.load().await, Ok(true));
        assert_eq!(loader.loads(), 1);

        let result = broker
            .run(format!("x = 1  {}", HANG_CHECK), RunOptions::default())
            .await;
        assert!(matches!(result, Err(BrokerError::Timeout { .. })));

        assert!(wait_until(|| loader.loads() == 2).await);
    }

    #[tokio::test]
    async fn test_replacement_is_not_reloaded_without_prior_load() {
        let loader = FakeLoader::new();
        let broker = broker(&loader);

        let result = broker
            .run(format!("x = 1  {}", HANG_CHECK), RunOptions::default())
            .await;
        assert!(matches!(result, Err(BrokerError::Timeout { .. })));
        assert!(!broker.is_loaded());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(loader.loads(), 1);
    }

    #[tokio::test]
    async fn test_stale_generation_does_not_replace() {
        let broker = broker(&FakeLoader::new());
        let stale = broker.generation();
        broker.restart();
        let current = broker.generation();
        assert!(current > stale);

        broker.replace(stale, "late timer", true);
        assert_eq!(broker.generation(), current);
        assert!(broker.has_worker());
    }

    #[tokio::test]
    async fn test_failed_load_is_retried_by_run() {
        let loader = FakeLoader::failing(1);
        let broker = broker(&loader);

        assert_eq!(broker.load().await, Ok(false));
        assert!(!broker.is_loaded());
        assert_eq!(
            broker.run(r#"print("ok")"#, RunOptions::default()).await,
            Ok("ok".to_string())
        );
        assert_eq!(loader.attempts(), 2);
    }

    #[tokio::test]
    async fn test_no_worker_is_unavailable() {
        let broker = ExecutionBroker::new(fast_config(), NoWorkers);
        assert!(!broker.has_worker());
        assert!(matches!(
            broker.run("x = 1", RunOptions::default()).await,
            Err(BrokerError::Unavailable(_))
        ));
        assert!(matches!(
            broker.load().await,
            Err(BrokerError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_then_run_starts_fresh_worker() {
        let loader = FakeLoader::new();
        let broker = broker(&loader);
        assert_eq!(broker.load().await, Ok(true));

        broker.shutdown();
        assert!(!broker.has_worker());

        assert_eq!(
            broker.run(r#"print("again")"#, RunOptions::default()).await,
            Ok("again".to_string())
        );
        assert_eq!(loader.loads(), 2);
    }
}
