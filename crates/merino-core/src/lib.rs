#![deny(unsafe_code)]

//! Merino sheep worker runtime.
//!
//! A sheep is a worker process that executes untrusted test harnesses inside
//! isolated sandboxes on behalf of a central dispatcher (the shepherd) and
//! returns graded results. This crate provides the whole runtime: the
//! bounded dispatch queue, the fixed-size worker pool, the pluggable sandbox
//! provider, the fault-tolerant shepherd control channel, and the cooperative
//! shutdown machinery tying them together.

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send`-safe, boxed future — the standard return type for async
/// trait methods that require dynamic dispatch (`dyn Trait`).
///
/// Native `async fn` in traits (stable since Rust 1.75) produces opaque return
/// types that are **not** object-safe. Traits consumed via `Box<dyn Trait>` or
/// `&dyn Trait` must return a concrete `Pin<Box<dyn Future>>` instead. This
/// alias keeps those signatures readable.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Compile-time build metadata (version, git hash, profile).
pub mod build_info;
/// Static host capability snapshot sent in the handshake.
pub mod environment;
/// Local control surface (Unix-socket IPC for CLI `stop`/`status`).
pub mod ipc;
/// Test request and result types.
pub mod job;
/// Holding area for results produced while no shepherd session is live.
pub mod orphanage;
/// Wire messages exchanged with the shepherd.
pub mod protocol;
/// Sandbox provider abstraction and backends.
pub mod provider;
/// Bounded FIFO hand-off between the control channel and the worker pool.
pub mod queue;
/// Shepherd control channel: session state machine, heartbeats, recovery.
pub mod shepherd;
/// The sheep daemon wiring every component together.
pub mod sheep;
/// Process-wide cooperative cancellation token.
pub mod shutdown;
/// Fixed-size pool of request executors.
pub mod worker;

pub use environment::EnvironmentDescriptor;
pub use job::{OrphanedResult, ResourceLimits, TestRequest, TestResult};
pub use orphanage::OrphanSink;
pub use provider::{SandboxHandle, SandboxProvider};
pub use queue::DispatchQueue;
pub use shepherd::{ControlChannel, ResultRouter, SessionState};
pub use sheep::Sheep;
pub use shutdown::Shutdown;
pub use worker::WorkerPool;
