//! Worker-side message loop.
//!
//! Receives calls from the host, serves each on its own task and replies with
//! exactly one `response` per call. Replies to the worker's own reverse calls
//! are routed to the waiting [`HostClient`].

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use tether_core::ipc::protocol::kind;
use tether_core::ipc::{Inbound, Outbox};
use tether_core::{Message, Operation};

use crate::engine::{ModelEngine, RequestContext};
use crate::host::HostClient;

/// Default time the worker waits for the host to answer a reverse call.
pub const DEFAULT_HOST_TIMEOUT: Duration = Duration::from_secs(60);

/// Serves forward calls from the host with a [`ModelEngine`].
pub struct WorkerRuntime {
    engine: Arc<dyn ModelEngine>,
    host_timeout: Duration,
}

impl WorkerRuntime {
    pub fn new(engine: impl ModelEngine) -> Self {
        Self::shared(Arc::new(engine))
    }

    /// Runtime over an engine shared with other runtimes.
    pub fn shared(engine: Arc<dyn ModelEngine>) -> Self {
        Self {
            engine,
            host_timeout: DEFAULT_HOST_TIMEOUT,
        }
    }

    pub fn with_host_timeout(mut self, timeout: Duration) -> Self {
        self.host_timeout = timeout;
        self
    }

    /// Serve until the host closes the channel or sends `cleanup`.
    pub async fn run(
        self,
        mut inbound: mpsc::UnboundedReceiver<Message>,
        outbox: Outbox,
    ) -> anyhow::Result<()> {
        let host = HostClient::new(outbox.clone(), self.host_timeout);
        let mut calls = JoinSet::new();

        while let Some(message) = inbound.recv().await {
            while calls.try_join_next().is_some() {}

            let (id, call_kind, data) = match message.classify() {
                Inbound::Call {
                    id,
                    kind,
                    data,
                    error,
                } => {
                    if host.is_waiting(&id) {
                        if !host.resolve(&id, &kind, data, error) {
                            tracing::warn!(%id, %kind, "dropping unexpected reply from host");
                        }
                        continue;
                    }
                    (id, kind, data)
                }
                other => {
                    tracing::warn!("ignoring unexpected message from host: {:?}", other);
                    continue;
                }
            };

            if call_kind == kind::INIT {
                let reply = match self.engine.initialize().await {
                    Ok(()) => {
                        tracing::info!("worker initialized");
                        Message::success(id, None)
                    }
                    Err(e) => {
                        tracing::error!("engine failed to initialize: {:#}", e);
                        Message::failure(id, format!("{:#}", e))
                    }
                };
                send(&outbox, reply);
                continue;
            }

            let Some(op) = Operation::from_name(&call_kind) else {
                tracing::warn!(%id, %call_kind, "unsupported call type");
                send(
                    &outbox,
                    Message::failure(id, format!("unsupported call type: {}", call_kind)),
                );
                continue;
            };

            let ctx = RequestContext::new(id, outbox.clone(), host.clone());
            if op == Operation::Cleanup {
                // Reply before leaving the loop so the host sees the result.
                serve(self.engine.clone(), op, data, ctx).await;
                break;
            }
            calls.spawn(serve(self.engine.clone(), op, data, ctx));
        }

        calls.shutdown().await;
        tracing::debug!("worker loop finished");
        Ok(())
    }
}

/// Serve one call and send its reply.
async fn serve(
    engine: Arc<dyn ModelEngine>,
    op: Operation,
    payload: Option<Value>,
    ctx: RequestContext,
) {
    let id = ctx.id().to_string();
    let outbox = ctx.outbox();
    tracing::debug!(%id, call_type = %op, "serving call");

    // Own task so a panicking engine still gets a reply out.
    let outcome = tokio::spawn(async move { engine.handle(op, payload, ctx).await }).await;

    let reply = match outcome {
        Ok(Ok(_)) if op.is_streaming() => Message::stream_complete(id),
        Ok(Ok(value)) => Message::success(id, Some(value)),
        Ok(Err(e)) => {
            tracing::debug!(%id, call_type = %op, "call failed: {:#}", e);
            Message::failure(id, format!("{:#}", e))
        }
        Err(join) if join.is_panic() => {
            Message::failure(id, format!("{} panicked in the engine", op))
        }
        Err(_) => Message::failure(id, format!("{} was cancelled", op)),
    };
    send(&outbox, reply);
}

fn send(outbox: &Outbox, message: Message) {
    if let Err(e) = outbox.send(message) {
        tracing::debug!("host is gone, dropping reply: {}", e);
    }
}

impl std::fmt::Debug for WorkerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRuntime")
            .field("host_timeout", &self.host_timeout)
            .finish_non_exhaustive()
    }
}
