//! Scripted interpreter for worker and broker tests.
//!
//! Understands just enough Python-looking input to drive every protocol
//! path: `print(...)` lines, `for i in range(N): print(i)`, division by
//! zero, and marker comments that hang or trigger diagnostics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::ipc::protocol::GuestException;

use super::output::OutputBuffer;
use super::session::{ExecOutcome, Interpreter, KillHandle, KillSwitch, RuntimeLoader};

/// Blocks inside the style check, before `started` is sent.
pub const HANG_CHECK: &str = "# hang-check";
/// Blocks inside execution, after `started` is sent.
pub const HANG_RUN: &str = "# hang-run";
/// Makes the style checker print a line without reporting a violation.
pub const STYLE_NOISE: &str = "# style-noise";
/// Marks a line the type checker rejects.
pub const TYPE_ERROR: &str = "# type-error";

const HANG: Duration = Duration::from_secs(30);

#[derive(Default)]
struct FakeState {
    attempts: AtomicUsize,
    loads: AtomicUsize,
    kills: AtomicUsize,
    failures_left: AtomicUsize,
    type_checks: AtomicUsize,
    executed: Mutex<Vec<String>>,
}

#[derive(Clone, Default)]
pub struct FakeLoader {
    state: Arc<FakeState>,
}

impl FakeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// A loader whose first `failures` loads fail.
    pub fn failing(failures: usize) -> Self {
        let loader = Self::default();
        loader.state.failures_left.store(failures, Ordering::SeqCst);
        loader
    }

    /// Successful loads across every worker using this loader.
    pub fn loads(&self) -> usize {
        self.state.loads.load(Ordering::SeqCst)
    }

    /// Sessions killed through their kill switch.
    pub fn kills(&self) -> usize {
        self.state.kills.load(Ordering::SeqCst)
    }

    pub fn attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    pub fn type_checks(&self) -> usize {
        self.state.type_checks.load(Ordering::SeqCst)
    }

    /// Every snippet executed so far, warm-ups included.
    pub fn executed(&self) -> Vec<String> {
        self.state
            .executed
            .lock()
            .map(|executed| executed.clone())
            .unwrap_or_default()
    }
}

impl RuntimeLoader for FakeLoader {
    type Session = FakeSession;

    fn load(&self, kill_switch: &KillSwitch) -> Result<FakeSession> {
        self.state.attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .state
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::Interpreter("simulated load failure".to_string()));
        }

        self.state.loads.fetch_add(1, Ordering::SeqCst);
        let killed = Arc::new(AtomicBool::new(false));
        let (flag, state) = (killed.clone(), self.state.clone());
        kill_switch.arm(KillHandle::new(move || {
            if !flag.swap(true, Ordering::SeqCst) {
                state.kills.fetch_add(1, Ordering::SeqCst);
            }
        }));

        Ok(FakeSession {
            state: self.state.clone(),
            files: HashMap::new(),
            killed,
        })
    }
}

pub struct FakeSession {
    state: Arc<FakeState>,
    files: HashMap<String, String>,
    killed: Arc<AtomicBool>,
}

impl FakeSession {
    /// Block like a runaway guest until killed or [`HANG`] passes.
    fn hang(&self) -> Result<()> {
        let until = Instant::now() + HANG;
        while Instant::now() < until {
            if self.killed.load(Ordering::SeqCst) {
                return Err(Error::Interpreter("interpreter killed".to_string()));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    }
}

impl Interpreter for FakeSession {
    fn exec(&mut self, code: &str, output: &mut OutputBuffer) -> Result<ExecOutcome> {
        if let Ok(mut executed) = self.state.executed.lock() {
            executed.push(code.to_string());
        }

        if code.contains(HANG_RUN) {
            self.hang()?;
        }
        if code.contains("crash()") {
            return Err(Error::Interpreter("simulated interpreter crash".to_string()));
        }
        if code.contains("/ 0") || code.contains("/0") {
            return Ok(Err(GuestException {
                kind: "ZeroDivisionError".to_string(),
                message: "division by zero".to_string(),
                traceback: None,
            }));
        }

        for line in code.lines().map(str::trim) {
            if let Some(rest) = line.strip_prefix("for i in range(") {
                let count: usize = rest
                    .split(')')
                    .next()
                    .and_then(|n| n.trim().parse().ok())
                    .unwrap_or(0);
                for i in 0..count {
                    output.push_line(i.to_string());
                }
            } else if let Some(arg) = line
                .strip_prefix("print(")
                .and_then(|l| l.strip_suffix(')'))
            {
                output.push_line(arg.trim_matches('"'));
            }
        }

        Ok(Ok(()))
    }

    fn style_check(
        &mut self,
        code: &str,
        select: &[&str],
        output: &mut OutputBuffer,
    ) -> Result<usize> {
        if code.contains(HANG_CHECK) {
            self.hang()?;
        }
        if code.contains(STYLE_NOISE) {
            output.push_line("noise from the style checker");
        }
        if !select.contains(&"E302") {
            return Ok(0);
        }

        let lines: Vec<&str> = code.lines().collect();
        let mut violations = 0;
        for (idx, line) in lines.iter().enumerate() {
            if idx == 0 || !line.starts_with("def ") {
                continue;
            }
            let blank_before = lines[..idx]
                .iter()
                .rev()
                .take_while(|l| l.trim().is_empty())
                .count();
            if blank_before < 2 {
                violations += 1;
                output.push_line(format!(
                    "stdin:{}:1: E302 expected 2 blank lines, found {}",
                    idx + 1,
                    blank_before
                ));
            }
        }
        Ok(violations)
    }

    fn type_check(&mut self, path: &str, output: &mut OutputBuffer) -> Result<i32> {
        self.state.type_checks.fetch_add(1, Ordering::SeqCst);
        let contents = self
            .files
            .get(path)
            .ok_or_else(|| Error::Interpreter(format!("no such file: {}", path)))?;

        let errors: Vec<usize> = contents
            .lines()
            .enumerate()
            .filter(|(_, line)| line.contains(TYPE_ERROR))
            .map(|(idx, _)| idx + 1)
            .collect();
        for line in &errors {
            output.push_line(format!(
                "{}:{}: error: Incompatible types in assignment",
                path, line
            ));
        }
        if errors.is_empty() {
            Ok(0)
        } else {
            output.push_line(format!("Found {} error in 1 file", errors.len()));
            Ok(1)
        }
    }

    fn write_file(&mut self, name: &str, contents: &str) -> Result<String> {
        let path = format!("/{}", name);
        self.files.insert(path.clone(), contents.to_string());
        Ok(path)
    }
}
