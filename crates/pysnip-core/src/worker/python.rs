//! CPython-backed interpreter session.
//!
//! The session is a long-lived `python3 -u` child running an embedded driver
//! script. Requests are single JSON lines on the child's stdin; the driver
//! answers with `line` events for captured output followed by exactly one
//! `done` or `error` event. The guest's own file descriptors 0 and 1 point at
//! the null device, so guest code cannot read or forge protocol lines.

use std::io::{BufRead, BufReader, BufWriter, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::ipc::bind_to_parent;
use crate::ipc::protocol::GuestException;

use super::manifest::{LockManifest, PackageSource};
use super::output::OutputBuffer;
use super::session::{ExecOutcome, Interpreter, KillHandle, KillSwitch, RuntimeLoader};

const DRIVER: &str = include_str!("driver.py");

/// Loads [`PythonSession`]s according to a [`RuntimeConfig`].
#[derive(Debug, Clone)]
pub struct PythonLoader {
    config: RuntimeConfig,
}

impl PythonLoader {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }
}

impl RuntimeLoader for PythonLoader {
    type Session = PythonSession;

    fn load(&self, kill_switch: &KillSwitch) -> Result<PythonSession> {
        let manifest = LockManifest::load(&self.config.lock_file)?;
        let packages = manifest.resolve(&self.config.packages)?;

        let mut session = PythonSession::spawn(&self.config)?;
        kill_switch.arm(session.kill_handle());

        let start = Instant::now();
        let installed = session.install(&packages)?;
        tracing::debug!(
            "Support packages ready ({} installed, +{}ms)",
            installed.len(),
            start.elapsed().as_millis()
        );

        Ok(session)
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum DriverOp<'a> {
    Exec {
        code: &'a str,
    },
    Style {
        code: &'a str,
        select: &'a [&'a str],
        name: &'a str,
    },
    Typecheck {
        path: &'a str,
    },
    Install {
        packages: &'a [PackageSource],
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum DriverEvent {
    Line {
        text: String,
    },
    Done {
        #[serde(default)]
        value: serde_json::Value,
    },
    Error {
        #[serde(default)]
        guest: bool,
        #[serde(rename = "type")]
        kind: String,
        message: String,
        #[serde(default)]
        traceback: Option<String>,
    },
}

/// A running Python interpreter with a persistent `__main__` namespace.
pub struct PythonSession {
    /// Shared with kill handles, which may fire from another thread.
    child: Arc<Mutex<Child>>,
    requests: BufWriter<ChildStdin>,
    events: BufReader<ChildStdout>,
    /// Root of the session's virtual filesystem; removed on drop.
    scratch: TempDir,
}

impl PythonSession {
    /// Start the interpreter process.
    pub fn spawn(config: &RuntimeConfig) -> Result<Self> {
        let python = config.python_executable()?;

        let scratch = match &config.scratch_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                tempfile::Builder::new().prefix("pysnip-").tempdir_in(root)?
            }
            None => tempfile::Builder::new().prefix("pysnip-").tempdir()?,
        };

        let mut command = Command::new(&python);
        command
            .args(["-u", "-c", DRIVER])
            .current_dir(scratch.path())
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        bind_to_parent(&mut command);

        let mut child = command.spawn().map_err(|e| {
            Error::Interpreter(format!(
                "Failed to start interpreter '{}': {}",
                python.display(),
                e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Interpreter("Failed to get interpreter stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Interpreter("Failed to get interpreter stdout".to_string()))?;

        tracing::debug!(pid = child.id(), "Interpreter started: {}", python.display());

        Ok(Self {
            child: Arc::new(Mutex::new(child)),
            requests: BufWriter::new(stdin),
            events: BufReader::new(stdout),
            scratch,
        })
    }

    /// Make sure every package is importable, installing the missing ones
    /// from their manifest URLs. Returns the names that were installed.
    pub fn install(&mut self, packages: &[PackageSource]) -> Result<Vec<String>> {
        let mut sink = OutputBuffer::new();
        let value = self
            .call(&DriverOp::Install { packages }, &mut sink)?
            .map_err(|e| Error::Interpreter(format!("package installation failed: {}", e)))?;
        Ok(serde_json::from_value(value)?)
    }

    /// A handle that kills the interpreter process, even while another
    /// thread is blocked in a call. Does nothing once the session is gone.
    pub fn kill_handle(&self) -> KillHandle {
        let child = Arc::downgrade(&self.child);
        KillHandle::new(move || {
            if let Some(shared) = child.upgrade() {
                let mut child = shared.lock().unwrap_or_else(PoisonError::into_inner);
                tracing::debug!(pid = child.id(), "Killing interpreter");
                let _ = child.kill();
            }
        })
    }

    /// Send one op and collect events until its terminal event.
    ///
    /// The inner `Err` is an exception raised by guest code; an exception in
    /// the driver itself becomes `Error::Interpreter`.
    fn call(
        &mut self,
        op: &DriverOp<'_>,
        output: &mut OutputBuffer,
    ) -> Result<std::result::Result<serde_json::Value, GuestException>> {
        let mut line = serde_json::to_string(op)?;
        line.push('\n');
        self.requests
            .write_all(line.as_bytes())
            .and_then(|()| self.requests.flush())
            .map_err(|e| Error::Interpreter(format!("interpreter is gone: {}", e)))?;

        let mut raw = String::new();
        loop {
            raw.clear();
            let read = self.events.read_line(&mut raw)?;
            if read == 0 {
                return Err(Error::Interpreter("interpreter exited".to_string()));
            }

            match serde_json::from_str::<DriverEvent>(raw.trim_end())? {
                DriverEvent::Line { text } => output.push_line(text),
                DriverEvent::Done { value } => return Ok(Ok(value)),
                DriverEvent::Error {
                    guest: true,
                    kind,
                    message,
                    traceback,
                } => {
                    return Ok(Err(GuestException {
                        kind,
                        message,
                        traceback,
                    }));
                }
                DriverEvent::Error { kind, message, .. } => {
                    return Err(Error::Interpreter(format!("{}: {}", kind, message)));
                }
            }
        }
    }

    /// Like [`Self::call`] for ops where a guest exception is not expected.
    fn call_tool(
        &mut self,
        op: &DriverOp<'_>,
        output: &mut OutputBuffer,
    ) -> Result<serde_json::Value> {
        self.call(op, output)?
            .map_err(|e| Error::Interpreter(e.to_string()))
    }
}

impl Interpreter for PythonSession {
    fn exec(&mut self, code: &str, output: &mut OutputBuffer) -> Result<ExecOutcome> {
        Ok(self.call(&DriverOp::Exec { code }, output)?.map(|_| ()))
    }

    fn style_check(
        &mut self,
        code: &str,
        select: &[&str],
        output: &mut OutputBuffer,
    ) -> Result<usize> {
        let op = DriverOp::Style {
            code,
            select,
            name: super::checks::STYLE_SOURCE_NAME,
        };
        let value = self.call_tool(&op, output)?;
        Ok(serde_json::from_value(value)?)
    }

    fn type_check(&mut self, path: &str, output: &mut OutputBuffer) -> Result<i32> {
        let value = self.call_tool(&DriverOp::Typecheck { path }, output)?;
        Ok(serde_json::from_value(value)?)
    }

    fn write_file(&mut self, name: &str, contents: &str) -> Result<String> {
        let path = self.scratch.path().join(name);
        std::fs::write(&path, contents)?;
        Ok(path.to_string_lossy().into_owned())
    }
}

impl Drop for PythonSession {
    fn drop(&mut self) {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = child.kill() {
            tracing::debug!("Interpreter already exited: {}", e);
        }
        let _ = child.wait();
    }
}
