//! Static checks run before execution.

use crate::error::Result;
use crate::ipc::protocol::{GuestError, RunOptions};

use super::output::OutputBuffer;
use super::session::Interpreter;

/// Style codes the fast scan reports: blank lines around top-level
/// definitions and blank lines at the end of the file.
pub const STYLE_CODES: &[&str] = &["E302", "E303", "E305", "W391"];

/// Name the style checker reports the in-memory source under.
pub const STYLE_SOURCE_NAME: &str = "stdin";

/// Virtual file the type checker reads.
pub const SNIPPET_FILE: &str = "snippet.py";

/// Run the style scan and, unless disabled, the strict type check.
///
/// `Ok(None)` means the code may run. The buffer is empty on return.
pub(crate) fn check_code<I: Interpreter>(
    session: &mut I,
    output: &mut OutputBuffer,
    code: &str,
    options: RunOptions,
) -> Result<Option<GuestError>> {
    output.clear();
    let style = session.style_check(code, STYLE_CODES, output);
    let (violations, captured) = finish(output, style)?;
    if violations > 0 {
        let prefix = format!("{}:", STYLE_SOURCE_NAME);
        return Ok(Some(GuestError::Style(rewrite_locations(&captured, &prefix))));
    }

    if options.no_mypy {
        return Ok(None);
    }

    let path = session.write_file(SNIPPET_FILE, code)?;
    let status = session.type_check(&path, output);
    let (status, captured) = finish(output, status)?;
    if status != 0 {
        let prefix = format!("{}:", path);
        return Ok(Some(GuestError::TypeCheck(rewrite_locations(&captured, &prefix))));
    }

    Ok(None)
}

/// Take the captured text and clear the buffer, whatever the result.
fn finish<T>(output: &mut OutputBuffer, result: Result<T>) -> Result<(T, String)> {
    let captured = output.joined();
    output.clear();
    result.map(|value| (value, captured))
}

/// Replace every `<file>:` location prefix with `Line `.
pub fn rewrite_locations(diagnostics: &str, file_prefix: &str) -> String {
    diagnostics.replace(file_prefix, "Line ")
}
