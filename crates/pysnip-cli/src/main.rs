//! pysnip CLI - check and run Python snippets in an isolated worker.

mod colors;
mod load;
mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use pysnip_core::config::{BrokerConfig, ENV_ENVIRONMENT, Environment, RuntimeConfig};
use pysnip_core::worker::PythonLoader;
use pysnip_core::ExecutionBroker;

#[derive(Parser)]
#[command(name = "pysnip")]
#[command(about = "Check and run Python snippets in an isolated worker")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Environment picking the timeout defaults (development or production)
    #[arg(long, global = true)]
    env: Option<Environment>,

    /// Lock manifest listing the support packages
    #[arg(long, global = true)]
    lock_file: Option<PathBuf>,

    /// Python interpreter to run snippets with
    #[arg(long, global = true)]
    python: Option<PathBuf>,

    /// Where the worker runs
    #[arg(long, value_enum, default_value_t = Isolation::Process, global = true)]
    isolation: Isolation,
}

#[derive(Subcommand)]
enum Commands {
    /// Check and run a snippet, printing its output
    Run {
        /// Path to the snippet (.py file)
        file: PathBuf,

        /// Skip the type check
        #[arg(long)]
        no_mypy: bool,
    },

    /// Report style and type diagnostics for a snippet
    Check {
        /// Path to the snippet (.py file)
        file: PathBuf,

        /// Skip the type check
        #[arg(long)]
        no_mypy: bool,
    },

    /// Initialize the Python runtime and report whether it is usable
    Load,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Isolation {
    /// A separate pysnip-worker process, killed on timeout
    Process,
    /// A thread of this process, abandoned on timeout
    Thread,
}

impl Cli {
    fn broker_config(&self) -> pysnip_core::Result<BrokerConfig> {
        let env = self.env;
        BrokerConfig::from_lookup(|key| match (key, env) {
            (ENV_ENVIRONMENT, Some(Environment::Development)) => Some("development".to_string()),
            (ENV_ENVIRONMENT, Some(Environment::Production)) => Some("production".to_string()),
            _ => std::env::var(key).ok(),
        })
    }

    fn runtime_config(&self) -> RuntimeConfig {
        let mut runtime = RuntimeConfig::from_env();
        if let Some(python) = &self.python {
            runtime.python = Some(python.clone());
        }
        if let Some(lock_file) = &self.lock_file {
            runtime.lock_file = lock_file.clone();
        }
        runtime
    }

    fn broker(&self) -> pysnip_core::Result<ExecutionBroker> {
        let config = self.broker_config()?;
        let runtime = self.runtime_config();
        tracing::debug!(?config, isolation = ?self.isolation, "Starting broker");

        match self.isolation {
            Isolation::Process => ExecutionBroker::with_process_worker(config, &runtime),
            Isolation::Thread => Ok(ExecutionBroker::with_thread_worker(
                config,
                PythonLoader::new(runtime),
            )),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    // Helper to format pysnip-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(core_err) = err.downcast_ref::<pysnip_core::Error>() {
            anyhow::anyhow!("{}", core_err.with_hint())
        } else {
            err
        }
    };

    let source = match &cli.command {
        Commands::Run { file, .. } | Commands::Check { file, .. } => run::read_snippet(file)?,
        Commands::Load => String::new(),
    };

    let broker = cli.broker().map_err(|e| format_error(e.into()))?;

    let result = match &cli.command {
        Commands::Run { no_mypy, .. } => run::execute(&broker, source, *no_mypy).await,
        Commands::Check { no_mypy, .. } => run::check(&broker, source, *no_mypy).await,
        Commands::Load => load::execute(&broker).await,
    };

    broker.shutdown();
    result.map_err(format_error)
}
