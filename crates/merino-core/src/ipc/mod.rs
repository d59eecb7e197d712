//! Daemon IPC — Unix domain socket transport for CLI control.
//!
//! The sheep daemon exposes an HTTP/JSON API over a Unix socket. The CLI
//! connects as a client to query status, inspect the running config, and
//! request shutdown.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐         Unix socket        ┌──────────────┐
//! │   CLI    │───────────────────────────▶│  IPC Server  │
//! │          │  HTTP/1.1 + JSON           │  (axum)      │
//! └──────────┘                            └──────┬───────┘
//!                                                │
//!                                         ┌──────▼───────┐
//!                                         │    Sheep     │
//!                                         │   Runtime    │
//!                                         └──────────────┘
//! ```

pub mod client;
pub mod server;
pub mod types;

pub use client::IpcClient;
pub use server::IpcState;
pub use types::*;
