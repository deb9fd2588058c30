//! Inter-process communication with the inference worker.
//!
//! This module provides the wire protocol, the transport abstraction and the
//! two transports: a child process and an in-memory pair.

pub mod memory;
pub mod process;
pub mod protocol;
mod transport;

pub use memory::{MemoryLauncher, WorkerEndpoint};
pub use process::ProcessLauncher;
pub use protocol::{Inbound, Message, Progress, STREAM_COMPLETE, read_frame, write_frame};
pub use transport::{Channel, ChannelEvent, EventReceiver, Launcher, Outbox, Transport};
