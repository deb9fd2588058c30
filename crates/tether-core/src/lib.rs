//! Host side of the tether RPC channel.
//!
//! This crate provides:
//! - Length-prefixed JSON wire protocol shared with the worker
//! - Process and in-memory transports
//! - Correlation of unary and streaming calls with per-category timeouts
//! - A reverse-call bridge so the worker can call back into the host
//! - Lifecycle management with crash detection and bounded restart

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod ipc;
pub mod lifecycle;
pub mod proxy;
pub mod rpc;

pub use config::{AbandonPolicy, ProxyConfig, RestartPolicy, TimeoutConfig};
pub use diagnostics::Diagnostic;
pub use error::{Error, Result};
pub use ipc::{
    Channel, ChannelEvent, Launcher, MemoryLauncher, Message, Outbox, ProcessLauncher, Progress,
    Transport, WorkerEndpoint,
};
pub use lifecycle::LifecycleState;
pub use proxy::{ProxyBuilder, WorkerProxy};
pub use rpc::{
    CallCategory, HandlerError, Operation, ResponseStream, ReverseCallBridge, StaticToolRegistry,
    ToolDescriptor, ToolRegistry,
};
