//! Communication between the broker and execution workers.
//!
//! This module provides the message protocol and the links the broker uses
//! to reach a worker, either on a thread of the host process or in an
//! isolated worker process.

pub mod link;
pub mod protocol;
mod worker;

pub(crate) use worker::bind_to_parent;

pub use link::{ReplyPort, ThreadLink, ThreadWorkerFactory, WorkerFactory, WorkerLink};
pub use protocol::{
    Envelope, GuestError, GuestException, Request, Response, RunOptions, RunResponse,
    read_message, write_message,
};
pub use worker::{ENV_WORKER_PATH, ProcessLink, ProcessWorkerFactory};
