//! Execution worker: the side of the boundary that owns the interpreter.
//!
//! An [`ExecutionWorker`] handles one request at a time. It lazily loads
//! its interpreter session, runs the static checks, executes guest code and
//! reports every outcome as a [`Response`]; nothing it does can fail across
//! the message boundary.
//!
//! ```text
//! Request::Run
//!     │
//!     ├── load()          (once; warm-up check + run)
//!     ├── check()   ──►  RunResponse(error)   if style/type diagnostics
//!     ├──           ──►  Started
//!     └── run()     ──►  RunResponse(result | error)
//! ```

mod checks;
pub mod manifest;
pub mod output;
pub mod python;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

use std::io::{Read, Write};
use std::time::Instant;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::ipc::protocol::{
    Envelope, GuestError, GuestException, Request, Response, RunOptions, RunResponse, read_frame,
    write_message,
};

pub use checks::{STYLE_CODES, rewrite_locations};
pub use output::{OUTPUT_LIMIT, OutputBuffer};
pub use python::{PythonLoader, PythonSession};
pub use session::{ExecOutcome, Interpreter, KillHandle, KillSwitch, RuntimeLoader};

/// Code run once after loading so the first real request starts warm.
pub const WARM_UP_CODE: &str = r#"print("Hello, world!")"#;

/// Reason reported for run requests when the session can't be loaded.
pub const UNAVAILABLE_REASON: &str = "Python runtime not loaded";

/// Destination for the responses to one request.
pub trait ReplySink {
    fn post(&mut self, response: Response);
}

impl ReplySink for Vec<Response> {
    fn post(&mut self, response: Response) {
        self.push(response);
    }
}

/// Owns one interpreter session and the worker-scoped output buffer.
pub struct ExecutionWorker<L: RuntimeLoader> {
    loader: L,
    session: Option<L::Session>,
    output: OutputBuffer,
    kill_switch: KillSwitch,
}

impl<L: RuntimeLoader> ExecutionWorker<L> {
    pub fn new(loader: L) -> Self {
        Self::with_kill_switch(loader, KillSwitch::new())
    }

    /// A worker whose sessions are killed when `kill_switch` trips.
    pub fn with_kill_switch(loader: L, kill_switch: KillSwitch) -> Self {
        Self {
            loader,
            session: None,
            output: OutputBuffer::new(),
            kill_switch,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.session.is_some()
    }

    /// Ensure the session exists, initializing it on first use.
    ///
    /// A failed initialization leaves the worker unloaded so the next call
    /// retries it.
    pub fn load(&mut self) -> bool {
        if self.session.is_some() {
            return true;
        }

        tracing::debug!("Loading interpreter");
        let start = Instant::now();

        match self.initialize(start) {
            Ok(session) => {
                self.session = Some(session);
                true
            }
            Err(e) => {
                tracing::warn!("Interpreter failed to load: {}", e);
                self.kill_switch.disarm();
                self.output.clear();
                false
            }
        }
    }

    fn initialize(&mut self, start: Instant) -> Result<L::Session> {
        let mut session = self.loader.load(&self.kill_switch)?;
        tracing::debug!("Interpreter loaded (+{}ms)", start.elapsed().as_millis());

        checks::check_code(
            &mut session,
            &mut self.output,
            WARM_UP_CODE,
            RunOptions::default(),
        )?;
        run_code(&mut session, &mut self.output, WARM_UP_CODE)?
            .map_err(|e| Error::Interpreter(format!("warm-up failed: {}", e)))?;
        self.output.clear();

        tracing::debug!("Interpreter warmed (+{}ms)", start.elapsed().as_millis());
        Ok(session)
    }

    /// Run the static checks. `None` means the code may run.
    pub fn check(&mut self, code: &str, options: RunOptions) -> Option<RunResponse> {
        let Some(session) = self.session.as_mut() else {
            return Some(RunResponse::failure(unavailable()));
        };

        match checks::check_code(session, &mut self.output, code, options) {
            Ok(None) => None,
            Ok(Some(diagnostic)) => Some(RunResponse::failure(diagnostic)),
            Err(e) => Some(self.discard_session(e)),
        }
    }

    /// Execute guest code and capture its output.
    pub fn run(&mut self, code: &str) -> RunResponse {
        let Some(session) = self.session.as_mut() else {
            return RunResponse::failure(unavailable());
        };

        match run_code(session, &mut self.output, code) {
            Ok(Ok(output)) => RunResponse::success(output),
            Ok(Err(exception)) => RunResponse::failure(GuestError::Exception(exception)),
            Err(e) => self.discard_session(e),
        }
    }

    /// Handle one request, posting every response to `reply`.
    ///
    /// A run request whose checks fail still executes: the diagnostic is
    /// posted first, then `Started` and the run result.
    pub fn handle(&mut self, request: Request, reply: &mut impl ReplySink) {
        let loaded = self.load();

        match request {
            Request::Load => reply.post(Response::LoadResponse { ok: loaded }),
            Request::Run { .. } if !loaded => {
                reply.post(Response::RunResponse(RunResponse::failure(unavailable())));
            }
            Request::Run { code, options } => {
                if let Some(diagnostic) = self.check(&code, options) {
                    reply.post(Response::RunResponse(diagnostic));
                }
                reply.post(Response::Started);
                let result = self.run(&code);
                reply.post(Response::RunResponse(result));
            }
        }
    }

    /// A session that failed outside guest code can't be trusted; drop it so
    /// the next request loads a fresh one.
    fn discard_session(&mut self, error: Error) -> RunResponse {
        tracing::warn!("Interpreter session failed, discarding it: {}", error);
        self.session = None;
        self.kill_switch.disarm();
        self.output.clear();
        RunResponse::failure(GuestError::Protocol(error.to_string()))
    }
}

fn unavailable() -> GuestError {
    GuestError::Unavailable(UNAVAILABLE_REASON.to_string())
}

fn run_code<I: Interpreter>(
    session: &mut I,
    output: &mut OutputBuffer,
    code: &str,
) -> Result<std::result::Result<String, GuestException>> {
    output.clear();
    let outcome = session.exec(code, output);
    let captured = output.joined();
    output.clear();
    Ok(outcome?.map(|()| captured))
}

/// Replies for one call, framed onto the worker's output stream.
struct FrameReply<'a, W: Write> {
    id: Uuid,
    writer: &'a mut W,
}

impl<W: Write> ReplySink for FrameReply<'_, W> {
    fn post(&mut self, response: Response) {
        if let Err(e) = write_message(&mut *self.writer, &Envelope::new(self.id, response)) {
            tracing::warn!(call = %self.id, "Failed to post reply: {}", e);
        }
    }
}

/// Serve framed requests from `reader` until it closes.
///
/// Each envelope is validated once: a body that isn't a valid [`Request`]
/// is answered with a protocol failure on the same call id.
pub fn serve<L: RuntimeLoader, R: Read, W: Write>(
    worker: &mut ExecutionWorker<L>,
    reader: &mut R,
    writer: &mut W,
) -> Result<()> {
    while let Some(bytes) = read_frame(reader)? {
        let envelope: Envelope<serde_json::Value> = match serde_json::from_slice(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Dropping undecodable frame: {}", e);
                continue;
            }
        };

        let mut reply = FrameReply {
            id: envelope.id,
            writer: &mut *writer,
        };
        match serde_json::from_value::<Request>(envelope.body) {
            Ok(request) => worker.handle(request, &mut reply),
            Err(e) => reply.post(Response::RunResponse(RunResponse::failure(
                GuestError::Protocol(format!("invalid request: {}", e)),
            ))),
        }
    }

    tracing::debug!("Request stream closed");
    Ok(())
}
