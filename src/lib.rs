//! Multi-session SSH client backend.
//!
//! Manages any number of concurrent SSH connections, each with one-shot
//! command execution, an interactive PTY shell, SFTP browsing and
//! transfer, remote file watching, and host telemetry. [`api::Backend`]
//! is the entry point; push traffic (terminal output, watched-file
//! changes) arrives through [`events::EventBus`] subscriptions.
//!
//! Each connection's SSH session lives on a dedicated worker thread and
//! is never shared; callers talk to it over a bounded request queue,
//! which also serializes channel opens against the server's limit.

pub mod ai;
pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod monitor;
pub mod sftp;
pub mod ssh;
pub mod watcher;

pub use api::{Backend, Envelope};
pub use error::{AppError, AppResult, SerializableError};
pub use events::{Event, EventBus, EventChannel};
pub use ssh::{
    AuthMethod, CommandOutput, ConnectionConfig, ConnectionInfo, ConnectionStatus, KeySource,
    ShellOptions,
};
