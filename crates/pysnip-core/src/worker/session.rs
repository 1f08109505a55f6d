//! Interpreter session abstraction.
//!
//! A session is the loaded, stateful guest runtime owned by one worker. The
//! worker lends its output buffer to each call; the session appends every
//! line the guest writes to standard output.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::Result;
use crate::ipc::protocol::GuestException;

use super::output::OutputBuffer;

/// Outcome of executing guest code: `Err` is an exception raised by the
/// guest, distinct from the outer `Result` which reports session failures.
pub type ExecOutcome = std::result::Result<(), GuestException>;

/// A loaded guest language runtime.
pub trait Interpreter {
    /// Execute `code` in the session's persistent namespace.
    fn exec(&mut self, code: &str, output: &mut OutputBuffer) -> Result<ExecOutcome>;

    /// Run the style checker over `code` with only the `select`ed codes
    /// enabled. Diagnostics go to `output` with the file name `stdin`.
    /// Returns the violation count.
    fn style_check(
        &mut self,
        code: &str,
        select: &[&str],
        output: &mut OutputBuffer,
    ) -> Result<usize>;

    /// Run the strict type checker on a file previously written with
    /// [`Interpreter::write_file`]. Returns the checker's exit status.
    fn type_check(&mut self, path: &str, output: &mut OutputBuffer) -> Result<i32>;

    /// Write a file into the session's virtual filesystem and return the
    /// path diagnostics will refer to it by.
    fn write_file(&mut self, name: &str, contents: &str) -> Result<String>;
}

/// Performs the expensive one-time initialization of a session.
pub trait RuntimeLoader {
    type Session: Interpreter;

    /// Load a session. A loader whose runtime lives outside the calling
    /// thread arms `kill_switch` with a way to stop it.
    fn load(&self, kill_switch: &KillSwitch) -> Result<Self::Session>;
}

/// Stops a session's runtime from any thread.
#[derive(Clone)]
pub struct KillHandle(Arc<dyn Fn() + Send + Sync>);

impl KillHandle {
    pub fn new(kill: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(kill))
    }

    pub fn kill(&self) {
        (self.0)()
    }
}

impl fmt::Debug for KillHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KillHandle")
    }
}

#[derive(Debug, Default)]
struct SwitchState {
    handle: Option<KillHandle>,
    tripped: bool,
}

/// Shared between a worker and whoever may have to abandon it.
///
/// The worker arms the switch with its current session; tripping it kills
/// that session and every session armed afterwards.
#[derive(Debug, Clone, Default)]
pub struct KillSwitch {
    state: Arc<Mutex<SwitchState>>,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the live session's kill handle. Kills it right away if the
    /// switch was already tripped.
    pub fn arm(&self, handle: KillHandle) {
        let mut state = self.lock();
        if state.tripped {
            drop(state);
            handle.kill();
        } else {
            state.handle = Some(handle);
        }
    }

    /// Forget the registered session.
    pub fn disarm(&self) {
        self.lock().handle = None;
    }

    /// Kill the registered session.
    pub fn trip(&self) {
        let handle = {
            let mut state = self.lock();
            state.tripped = true;
            state.handle.take()
        };
        if let Some(handle) = handle {
            handle.kill();
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.lock().tripped
    }

    fn lock(&self) -> MutexGuard<'_, SwitchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
