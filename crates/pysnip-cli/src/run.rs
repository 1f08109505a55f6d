//! Run and check command implementations.
//!
//! Both send the snippet through the broker's full run path. `run` prints
//! the captured output; `check` reports only the style and type
//! diagnostics.

use std::path::Path;
use std::time::Instant;

use anyhow::Context;
use pysnip_core::{BrokerError, ExecutionBroker, GuestError, RunOptions};

use crate::colors;

/// Read a snippet from disk.
pub fn read_snippet(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read snippet {}", path.display()))
}

/// Check and run a snippet, printing its output.
pub async fn execute(broker: &ExecutionBroker, code: String, no_mypy: bool) -> anyhow::Result<()> {
    let start = Instant::now();

    match broker.run(code, RunOptions { no_mypy }).await {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
            tracing::debug!("Snippet finished in {:.2}s", start.elapsed().as_secs_f64());
            Ok(())
        }
        Err(err) => {
            eprintln!("{}", render_failure(&err));
            anyhow::bail!("{}", summary(&err))
        }
    }
}

/// Report diagnostics for a snippet without printing its output.
pub async fn check(broker: &ExecutionBroker, code: String, no_mypy: bool) -> anyhow::Result<()> {
    match broker.run(code, RunOptions { no_mypy }).await {
        Err(BrokerError::Guest(error)) if error.is_diagnostic() => {
            eprintln!("{}", render_failure(&BrokerError::Guest(error)));
            anyhow::bail!("Snippet has diagnostics")
        }
        // A guest exception means the checks passed.
        Ok(_) | Err(BrokerError::Guest(GuestError::Exception(_))) => {
            println!("{}No diagnostics{}", colors::GREEN, colors::RESET);
            Ok(())
        }
        Err(err) => {
            eprintln!("{}", render_failure(&err));
            anyhow::bail!("{}", summary(&err))
        }
    }
}

/// One-line description used as the command's error.
fn summary(err: &BrokerError) -> &'static str {
    match err {
        BrokerError::Guest(GuestError::Style(_)) => "Style check failed",
        BrokerError::Guest(GuestError::TypeCheck(_)) => "Type check failed",
        BrokerError::Guest(GuestError::Exception(_)) => "Snippet raised an exception",
        BrokerError::Guest(GuestError::Unavailable(_)) | BrokerError::Unavailable(_) => {
            "Python runtime unavailable"
        }
        BrokerError::Timeout { .. } => "Snippet timed out",
        BrokerError::Guest(GuestError::Protocol(_)) | BrokerError::Protocol(_) => {
            "Worker protocol error"
        }
    }
}

/// Console-style rendering of a failed call.
fn render_failure(err: &BrokerError) -> String {
    match err {
        BrokerError::Guest(GuestError::Style(diagnostic)) => format!(
            "{}Style:{}\n{}",
            colors::YELLOW,
            colors::RESET,
            diagnostic
        ),
        BrokerError::Guest(GuestError::TypeCheck(diagnostic)) => format!(
            "{}Type check:{}\n{}",
            colors::YELLOW,
            colors::RESET,
            diagnostic
        ),
        BrokerError::Guest(GuestError::Exception(exception)) => match &exception.traceback {
            Some(traceback) => format!(
                "{}{}{}\n{}{}{}",
                colors::DIM,
                traceback.trim_end(),
                colors::RESET,
                colors::RED,
                exception,
                colors::RESET
            ),
            None => format!("{}{}{}", colors::RED, exception, colors::RESET),
        },
        other => format!("{}{}{}{}", colors::BOLD, colors::RED, other, colors::RESET),
    }
}
