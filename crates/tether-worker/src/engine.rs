//! The model engine interface served by the worker.

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use tether_core::ipc::Outbox;
use tether_core::{Message, Operation};

use crate::host::HostClient;

/// Performs the forward operations. Model loading, tokenization and
/// generation live behind this trait.
pub trait ModelEngine: Send + Sync + 'static {
    /// Prepare the engine. Runs once per worker, before `init` is acknowledged.
    fn initialize(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        async { Ok(()) }.boxed()
    }

    /// Serve one forward call.
    ///
    /// Streaming operations emit their output through
    /// [`RequestContext::emit_chunk`]; the returned value is then ignored.
    fn handle(
        &self,
        op: Operation,
        payload: Option<Value>,
        ctx: RequestContext,
    ) -> BoxFuture<'_, anyhow::Result<Value>>;
}

/// Per-call handle for side messages and reverse calls.
#[derive(Debug, Clone)]
pub struct RequestContext {
    id: String,
    outbox: Outbox,
    host: HostClient,
}

impl RequestContext {
    pub(crate) fn new(id: String, outbox: Outbox, host: HostClient) -> Self {
        Self { id, outbox, host }
    }

    /// Id the host assigned to this call.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Send one chunk of a streaming result.
    pub fn emit_chunk(&self, text: impl Into<String>) -> tether_core::Result<()> {
        self.outbox.send(Message::chunk(&self.id, text))
    }

    /// Report progress of a long-running call.
    pub fn emit_progress(&self, progress: f64, speed: Option<String>) -> tether_core::Result<()> {
        self.outbox
            .send(Message::download_progress(&self.id, progress, speed))
    }

    pub(crate) fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    /// Client for calls back into the host.
    pub fn host(&self) -> &HostClient {
        &self.host
    }
}
