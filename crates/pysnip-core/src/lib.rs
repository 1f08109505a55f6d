//! Core of the pysnip Python snippet sandbox.
//!
//! This crate provides:
//! - The execution worker: lazy interpreter loading, style and type checks,
//!   guest execution with captured, truncated output
//! - The message protocol between host and worker
//! - Thread and process worker links
//! - The execution broker: per-call reply channels, start and settle
//!   timeouts, kill-and-replace recovery

pub mod broker;
pub mod config;
pub mod error;
pub mod ipc;
pub mod worker;

pub use broker::{BrokerError, ExecutionBroker, TimeoutPhase};
pub use config::{BrokerConfig, Environment, RuntimeConfig};
pub use error::{Error, Result};
pub use ipc::{GuestError, GuestException, Request, Response, RunOptions, RunResponse};
pub use worker::{ExecutionWorker, PythonLoader, RuntimeLoader, serve};
