//! Runtime and broker configuration.
//!
//! Values come from `PYSNIP_*` environment variables with per-environment
//! defaults; the CLI layers its flags on top.

use std::ffi::OsString;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Support packages the worker installs before its first check.
pub const SUPPORT_PACKAGES: &[&str] = &[
    "mypy",
    "pycodestyle",
    "typing-extensions",
    "mypy_extensions",
];

/// Default location of the lock manifest, relative to the working directory.
pub const DEFAULT_LOCK_FILE: &str = "pysnip-lock.json";

pub const ENV_ENVIRONMENT: &str = "PYSNIP_ENV";
pub const ENV_START_TIMEOUT_MS: &str = "PYSNIP_START_TIMEOUT_MS";
pub const ENV_SETTLE_TIMEOUT_MS: &str = "PYSNIP_SETTLE_TIMEOUT_MS";
pub const ENV_PYTHON: &str = "PYSNIP_PYTHON";
pub const ENV_LOCK_FILE: &str = "PYSNIP_LOCK_FILE";
pub const ENV_SCRATCH_ROOT: &str = "PYSNIP_SCRATCH_ROOT";

/// Deployment environment, which picks the timeout defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Environment {
    Development,
    #[default]
    Production,
}

impl FromStr for Environment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(Error::Config(format!("unknown environment '{}'", other))),
        }
    }
}

/// Timeout budgets for a single broker call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Budget from posting a request until `started` (or the terminal
    /// response, for loads). Covers a cold interpreter start.
    pub start_timeout: Duration,
    /// Budget between `started` and the terminal response.
    pub settle_timeout: Duration,
}

impl BrokerConfig {
    pub fn for_environment(environment: Environment) -> Self {
        let start_timeout = match environment {
            Environment::Development => Duration::from_secs(5),
            Environment::Production => Duration::from_secs(30),
        };
        Self {
            start_timeout,
            settle_timeout: Duration::from_secs(1),
        }
    }

    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let environment = match lookup(ENV_ENVIRONMENT) {
            Some(value) => value.parse()?,
            None => Environment::default(),
        };
        let mut config = Self::for_environment(environment);

        if let Some(ms) = lookup(ENV_START_TIMEOUT_MS) {
            config.start_timeout = parse_millis(ENV_START_TIMEOUT_MS, &ms)?;
        }
        if let Some(ms) = lookup(ENV_SETTLE_TIMEOUT_MS) {
            config.settle_timeout = parse_millis(ENV_SETTLE_TIMEOUT_MS, &ms)?;
        }

        Ok(config)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::for_environment(Environment::default())
    }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| {
            Error::Config(format!(
                "{} must be a number of milliseconds, got '{}'",
                key, value
            ))
        })
}

/// How the worker finds and prepares its interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Python executable. `None` resolves `python3` on PATH at load time.
    pub python: Option<PathBuf>,
    /// Lock manifest listing the support packages.
    pub lock_file: PathBuf,
    /// Packages that must be importable before the worker reports ready.
    pub packages: Vec<String>,
    /// Parent directory for session scratch space. `None` uses the system
    /// temp directory.
    pub scratch_root: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            python: None,
            lock_file: PathBuf::from(DEFAULT_LOCK_FILE),
            packages: SUPPORT_PACKAGES.iter().map(|p| p.to_string()).collect(),
            scratch_root: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(python) = lookup(ENV_PYTHON).filter(|v| !v.is_empty()) {
            config.python = Some(PathBuf::from(python));
        }
        if let Some(lock_file) = lookup(ENV_LOCK_FILE).filter(|v| !v.is_empty()) {
            config.lock_file = PathBuf::from(lock_file);
        }
        if let Some(root) = lookup(ENV_SCRATCH_ROOT).filter(|v| !v.is_empty()) {
            config.scratch_root = Some(PathBuf::from(root));
        }
        config
    }

    /// Environment to hand a worker process so it rebuilds this config.
    pub fn to_env(&self) -> Vec<(&'static str, OsString)> {
        let mut env = vec![(ENV_LOCK_FILE, self.lock_file.clone().into_os_string())];
        if let Some(python) = &self.python {
            env.push((ENV_PYTHON, python.clone().into_os_string()));
        }
        if let Some(root) = &self.scratch_root {
            env.push((ENV_SCRATCH_ROOT, root.clone().into_os_string()));
        }
        env
    }

    /// Resolve the interpreter executable.
    pub fn python_executable(&self) -> Result<PathBuf> {
        if let Some(python) = &self.python {
            return Ok(python.clone());
        }
        which::which("python3")
            .or_else(|_| which::which("python"))
            .map_err(|e| Error::Interpreter(format!("no Python interpreter found on PATH: {}", e)))
    }
}
