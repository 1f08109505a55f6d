//! Load command implementation.

use std::time::Instant;

use pysnip_core::ExecutionBroker;

use crate::colors;

/// Initialize the runtime and report whether it came up.
pub async fn execute(broker: &ExecutionBroker) -> anyhow::Result<()> {
    let start = Instant::now();
    let ok = broker.load().await?;
    if !ok {
        anyhow::bail!("Python runtime failed to load (run with --verbose for details)");
    }

    println!(
        "{}Runtime ready{} in {:.2}s",
        colors::GREEN,
        colors::RESET,
        start.elapsed().as_secs_f64()
    );
    Ok(())
}
