//! Worker process management.
//!
//! Provides [`ProcessLink`] for spawning and talking to an isolated
//! `pysnip-worker` process, and [`ProcessWorkerFactory`] for the broker.

use std::collections::HashMap;
use std::ffi::OsString;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};

use super::link::{ReplyPort, WorkerFactory, WorkerLink};
use super::protocol::{Envelope, Request, Response, read_frame, write_message};

/// Environment variable naming the worker binary.
pub const ENV_WORKER_PATH: &str = "PYSNIP_WORKER_PATH";

const WORKER_NAME: &str = if cfg!(windows) {
    "pysnip-worker.exe"
} else {
    "pysnip-worker"
};

type Routes = Arc<Mutex<HashMap<Uuid, ReplyPort>>>;

/// Handle to a worker process.
///
/// Requests are encoded on the caller's thread and queued for a writer
/// thread that feeds the child's stdin, so posting never blocks on a worker
/// that stopped reading. A reader thread routes reply envelopes to the port
/// registered under their call id.
pub struct ProcessLink {
    /// The child process.
    child: Child,
    /// Encoded frames waiting for the writer thread.
    frames: Option<Sender<Vec<u8>>>,
    /// Reply ports of calls still listening, by call id.
    routes: Routes,
    /// Whether the worker has been killed.
    killed: bool,
}

impl ProcessLink {
    /// Spawn a worker process from `worker_path` with extra environment.
    pub fn spawn(worker_path: &Path, env: &[(&'static str, OsString)]) -> Result<Self> {
        let mut command = Command::new(worker_path);
        command.envs(env.iter().map(|(k, v)| (*k, v)));
        Self::spawn_command(command)
    }

    /// Spawn a worker from a prepared command. Stdio is always piped, with
    /// stderr passed through.
    pub(crate) fn spawn_command(mut command: Command) -> Result<Self> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()); // Let worker stderr pass through for debugging
        bind_to_parent(&mut command);

        let program = command.get_program().to_string_lossy().into_owned();
        let mut child = command.spawn().map_err(|e| {
            Error::Ipc(format!("Failed to spawn worker process '{}': {}", program, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get worker stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get worker stdout".to_string()))?;

        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let pid = child.id();

        let (frames, queue) = mpsc::channel();
        if let Err(e) = thread::Builder::new()
            .name(format!("pysnip-worker-{}-requests", pid))
            .spawn(move || write_frames(queue, BufWriter::new(stdin)))
        {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Ipc(format!("Failed to start request writer: {}", e)));
        }

        let reader_routes = routes.clone();
        if let Err(e) = thread::Builder::new()
            .name(format!("pysnip-worker-{}-replies", pid))
            .spawn(move || route_replies(BufReader::new(stdout), reader_routes))
        {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Ipc(format!("Failed to start reply reader: {}", e)));
        }

        tracing::debug!(pid, "Worker process started");

        Ok(Self {
            child,
            frames: Some(frames),
            routes,
            killed: false,
        })
    }

    /// Find the pysnip-worker binary path.
    ///
    /// Looks in the following order:
    /// 1. `PYSNIP_WORKER_PATH` environment variable
    /// 2. Same directory as the current executable
    /// 3. System PATH
    /// 4. `target/{debug,release}` of this workspace, for development
    pub fn find_worker_binary() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(ENV_WORKER_PATH) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(path);
            }
        }

        if let Ok(exe_path) = std::env::current_exe()
            && let Some(exe_dir) = exe_path.parent()
        {
            let worker_path = exe_dir.join(WORKER_NAME);
            if worker_path.exists() {
                return Ok(worker_path);
            }
            // Test binaries live one level down, in target/<profile>/deps.
            if let Some(profile_dir) = exe_dir.parent() {
                let worker_path = profile_dir.join(WORKER_NAME);
                if worker_path.exists() {
                    return Ok(worker_path);
                }
            }
        }

        if let Ok(path) = which::which(WORKER_NAME) {
            return Ok(path);
        }

        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            for profile in &["debug", "release"] {
                let path = PathBuf::from(&manifest_dir)
                    .join("..")
                    .join("..")
                    .join("target")
                    .join(profile)
                    .join(WORKER_NAME);
                if path.exists() {
                    return Ok(path.canonicalize().unwrap_or(path));
                }
            }
        }

        Err(Error::Ipc(format!(
            "Could not find {} binary. Set {} or ensure it's in PATH.",
            WORKER_NAME, ENV_WORKER_PATH
        )))
    }

    /// Get the process ID of the worker.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Check if the worker process is still running.
    pub fn is_alive(&mut self) -> bool {
        if self.killed {
            return false;
        }
        matches!(self.child.try_wait(), Ok(None))
    }

    fn lock_routes(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, ReplyPort>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WorkerLink for ProcessLink {
    fn post(&mut self, request: Request, reply: ReplyPort) -> Result<()> {
        let frames = match (&self.frames, self.killed) {
            (Some(frames), false) => frames,
            _ => return Err(Error::Ipc("Worker has been killed".to_string())),
        };

        let id = Uuid::new_v4();
        let mut frame = Vec::new();
        write_message(&mut frame, &Envelope::new(id, &request))?;

        self.lock_routes().insert(id, reply);
        if frames.send(frame).is_err() {
            self.lock_routes().remove(&id);
            return Err(Error::Ipc("Worker stopped accepting requests".to_string()));
        }
        Ok(())
    }

    /// Kill the worker process immediately.
    ///
    /// Works mid-computation without any cooperation from the worker or
    /// its interpreter.
    fn terminate(&mut self) {
        if self.killed {
            return;
        }
        self.killed = true;

        if let Err(e) = self.child.kill() {
            // Already exited, which is fine
            tracing::debug!("Failed to kill worker {}: {}", self.child.id(), e);
        }

        // Wait to reap zombie
        let _ = self.child.wait();

        // The writer thread exits once its queue is gone.
        self.frames = None;

        // Close every pending call's channel.
        self.lock_routes().clear();
    }

    fn describe(&self) -> String {
        format!("process {}", self.child.id())
    }
}

impl Drop for ProcessLink {
    fn drop(&mut self) {
        // Ensure worker is killed when handle is dropped
        self.terminate();
    }
}

/// Writer thread body: copy queued frames to the worker's stdin.
fn write_frames(queue: Receiver<Vec<u8>>, mut stdin: BufWriter<ChildStdin>) {
    while let Ok(frame) = queue.recv() {
        if let Err(e) = stdin.write_all(&frame).and_then(|()| stdin.flush()) {
            tracing::debug!("Worker request stream closed: {}", e);
            return;
        }
    }
}

/// Reader thread body: deliver each reply to its call's port.
///
/// A route is dropped on the call's first terminal response or once its
/// receiver is gone; later replies for that id are discarded.
fn route_replies<R: Read>(mut reader: R, routes: Routes) {
    loop {
        let bytes = match read_frame(&mut reader) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Worker reply stream failed: {}", e);
                break;
            }
        };

        let envelope: Envelope<Response> = match serde_json::from_slice(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Dropping malformed reply from worker: {}", e);
                continue;
            }
        };

        let mut routes = routes.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(port) = routes.get(&envelope.id) else {
            tracing::trace!(call = %envelope.id, "Reply for a settled call dropped");
            continue;
        };
        let terminal = envelope.body.is_terminal();
        if !port.send(envelope.body) || terminal {
            routes.remove(&envelope.id);
        }
    }

    // Worker is gone: close every channel still waiting on it.
    routes
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
}

/// Make `command`'s child die with the thread that spawned it (Linux only).
pub(crate) fn bind_to_parent(command: &mut Command) {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::process::CommandExt;

        // SAFETY: prctl is async-signal-safe and touches no shared state.
        unsafe {
            command.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = command;
}

/// Spawns [`ProcessLink`] workers.
pub struct ProcessWorkerFactory {
    worker_path: PathBuf,
    env: Vec<(&'static str, OsString)>,
}

impl ProcessWorkerFactory {
    pub fn new(worker_path: PathBuf, runtime: &RuntimeConfig) -> Self {
        Self {
            worker_path,
            env: runtime.to_env(),
        }
    }

    /// Locate the worker binary with [`ProcessLink::find_worker_binary`].
    pub fn locate(runtime: &RuntimeConfig) -> Result<Self> {
        Ok(Self::new(ProcessLink::find_worker_binary()?, runtime))
    }
}

impl WorkerFactory for ProcessWorkerFactory {
    fn spawn(&self) -> Result<Box<dyn WorkerLink>> {
        Ok(Box::new(ProcessLink::spawn(&self.worker_path, &self.env)?))
    }
}
