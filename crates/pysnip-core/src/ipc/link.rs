//! Host-side handles to a live worker.
//!
//! A [`WorkerLink`] posts requests to one worker instance, each paired with
//! the [`ReplyPort`] its responses must go to. Dropping the receiving half
//! of a port is how a settled call stops listening: anything the worker
//! sends afterwards is discarded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::error::{Error, Result};
use crate::worker::{ExecutionWorker, KillSwitch, ReplySink, RuntimeLoader};

use super::protocol::{Request, Response};

/// Sending half of a single call's reply channel.
#[derive(Debug, Clone)]
pub struct ReplyPort {
    tx: UnboundedSender<Response>,
}

impl ReplyPort {
    /// Create a fresh channel for one call.
    pub fn channel() -> (ReplyPort, UnboundedReceiver<Response>) {
        let (tx, rx) = unbounded_channel();
        (ReplyPort { tx }, rx)
    }

    /// Deliver a response. Returns `false` once the caller stopped listening.
    pub fn send(&self, response: Response) -> bool {
        self.tx.send(response).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl ReplySink for ReplyPort {
    fn post(&mut self, response: Response) {
        if !self.send(response) {
            tracing::trace!("Reply dropped, caller no longer listening");
        }
    }
}

/// One live worker instance, as seen from the broker.
pub trait WorkerLink: Send {
    /// Post a request; responses arrive on `reply`.
    fn post(&mut self, request: Request, reply: ReplyPort) -> Result<()>;

    /// Stop the worker. In-flight calls are abandoned and their reply
    /// channels close. Idempotent.
    fn terminate(&mut self);

    /// Short description for logs.
    fn describe(&self) -> String;
}

/// Creates worker instances for the broker's slot.
pub trait WorkerFactory: Send + Sync {
    fn spawn(&self) -> Result<Box<dyn WorkerLink>>;
}

type Job = (Request, ReplyPort);

/// A worker running on a dedicated thread of the host process.
///
/// A thread can't be killed: terminating disconnects its request queue,
/// trips the worker's [`KillSwitch`] so its interpreter stops, and abandons
/// the thread. The thread exits once it next looks for work.
pub struct ThreadLink {
    jobs: Option<mpsc::Sender<Job>>,
    kill_switch: KillSwitch,
    name: String,
}

impl ThreadLink {
    pub fn spawn<L>(loader: L, name: String) -> Result<Self>
    where
        L: RuntimeLoader + Send + 'static,
    {
        let (jobs, queue) = mpsc::channel::<Job>();
        let kill_switch = KillSwitch::new();
        let worker_switch = kill_switch.clone();
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let mut worker = ExecutionWorker::with_kill_switch(loader, worker_switch);
                while let Ok((request, mut reply)) = queue.recv() {
                    worker.handle(request, &mut reply);
                }
                tracing::debug!("Worker thread exiting");
            })
            .map_err(|e| Error::Ipc(format!("Failed to start worker thread: {}", e)))?;

        Ok(Self {
            jobs: Some(jobs),
            kill_switch,
            name,
        })
    }
}

impl WorkerLink for ThreadLink {
    fn post(&mut self, request: Request, reply: ReplyPort) -> Result<()> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| Error::Ipc("Worker has been terminated".to_string()))?;
        jobs.send((request, reply))
            .map_err(|_| Error::Ipc("Worker thread has exited".to_string()))
    }

    fn terminate(&mut self) {
        if self.jobs.take().is_some() {
            tracing::debug!("Abandoning worker thread {}", self.name);
            self.kill_switch.trip();
        }
    }

    fn describe(&self) -> String {
        format!("thread {}", self.name)
    }
}

impl Drop for ThreadLink {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Spawns [`ThreadLink`] workers sharing a cloneable loader.
pub struct ThreadWorkerFactory<L> {
    loader: L,
    spawned: AtomicU64,
}

impl<L> ThreadWorkerFactory<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            spawned: AtomicU64::new(0),
        }
    }
}

impl<L> WorkerFactory for ThreadWorkerFactory<L>
where
    L: RuntimeLoader + Clone + Send + Sync + 'static,
{
    fn spawn(&self) -> Result<Box<dyn WorkerLink>> {
        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        let link = ThreadLink::spawn(self.loader.clone(), format!("pysnip-worker-{}", n))?;
        Ok(Box::new(link))
    }
}
