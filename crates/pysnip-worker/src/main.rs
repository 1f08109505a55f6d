//! pysnip worker process.
//!
//! Runs one execution worker over length-prefixed JSON envelopes on
//! stdin/stdout. Logs go to stderr, which the host passes through.

use std::io::{self, BufReader, BufWriter};

use pysnip_core::config::RuntimeConfig;
use pysnip_core::worker::{ExecutionWorker, PythonLoader, serve};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let config = RuntimeConfig::from_env();
    tracing::debug!(lock_file = %config.lock_file.display(), "Worker starting");

    let mut worker = ExecutionWorker::new(PythonLoader::new(config));

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut reader = BufReader::new(stdin.lock());
    let mut writer = BufWriter::new(stdout.lock());

    serve(&mut worker, &mut reader, &mut writer)?;

    tracing::debug!("Worker exiting");
    Ok(())
}
