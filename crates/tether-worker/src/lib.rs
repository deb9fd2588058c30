//! Worker side of the tether channel.
//!
//! This crate provides:
//! - `WorkerRuntime`, the message loop that serves forward calls
//! - The `ModelEngine` interface and a per-call `RequestContext`
//! - `HostClient` for reverse calls into the host
//! - A loopback `EchoEngine`
//! - Stdio serving for the `tether-worker` binary and an in-process launcher

pub mod echo;
pub mod engine;
pub mod host;
pub mod runtime;
pub mod stdio;

use std::sync::Arc;

use tether_core::MemoryLauncher;

pub use echo::EchoEngine;
pub use engine::{ModelEngine, RequestContext};
pub use host::HostClient;
pub use runtime::WorkerRuntime;
pub use stdio::serve_stdio;

/// Launcher that runs each worker generation as a task in this process.
///
/// The engine is shared across restarts.
pub fn in_process_launcher(engine: Arc<dyn ModelEngine>) -> MemoryLauncher {
    MemoryLauncher::new(move |endpoint| {
        let runtime = WorkerRuntime::shared(engine.clone());
        let (inbound, outbox) = endpoint.into_parts();
        tokio::spawn(async move {
            if let Err(e) = runtime.run(inbound, outbox).await {
                tracing::error!("in-process worker failed: {:#}", e);
            }
        });
        Ok(())
    })
}
