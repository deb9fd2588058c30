//! Calls from the worker back into the host.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, anyhow};
use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use tokio::sync::oneshot;

use tether_core::ipc::Outbox;
use tether_core::ipc::protocol::kind;
use tether_core::{Message, ToolDescriptor};

type Reply = Result<Option<Value>, String>;

struct Waiting {
    reply_kind: String,
    tx: oneshot::Sender<Reply>,
}

/// Issues reverse calls to the host and matches their replies.
///
/// Ids are chosen on this side and never collide with host-chosen ids.
#[derive(Clone)]
pub struct HostClient {
    outbox: Outbox,
    waiting: Arc<Mutex<FxHashMap<String, Waiting>>>,
    timeout: Duration,
}

impl HostClient {
    pub(crate) fn new(outbox: Outbox, timeout: Duration) -> Self {
        Self {
            outbox,
            waiting: Arc::default(),
            timeout,
        }
    }

    /// Tools the host can execute on the worker's behalf.
    pub async fn list_tools(&self) -> anyhow::Result<Vec<ToolDescriptor>> {
        let data = self
            .call(kind::MCP_TOOLS_REQUEST, kind::MCP_TOOLS_RESPONSE, None)
            .await?;
        serde_json::from_value(data).context("host sent a malformed tool list")
    }

    /// Run a tool on the host.
    pub async fn execute_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        params: Value,
    ) -> anyhow::Result<Value> {
        let payload = json!({
            "serverId": server_id,
            "toolName": tool_name,
            "params": params,
        });
        self.call(
            kind::EXECUTE_MCP_TOOL,
            kind::MCP_TOOL_EXECUTION_RESPONSE,
            Some(payload),
        )
        .await
    }

    /// Send `call_kind` and wait for the reply tagged `reply_kind`.
    pub async fn call(
        &self,
        call_kind: &str,
        reply_kind: &str,
        payload: Option<Value>,
    ) -> anyhow::Result<Value> {
        let id = format!("w-{}", uuid::Uuid::new_v4());
        let (tx, rx) = oneshot::channel();
        self.lock().insert(
            id.clone(),
            Waiting {
                reply_kind: reply_kind.to_string(),
                tx,
            },
        );

        // Removes the entry however this call ends.
        let _evict = EvictOnDrop {
            client: self,
            id: &id,
        };

        self.outbox.send(Message::call(&id, call_kind, payload))?;
        tracing::debug!(%id, call_kind, "sent reverse call");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Ok(data))) => Ok(data.unwrap_or(Value::Null)),
            Ok(Ok(Err(error))) => Err(anyhow!("host failed {}: {}", call_kind, error)),
            Ok(Err(_)) => Err(anyhow!("host reply for {} was lost", call_kind)),
            Err(_) => Err(anyhow!("host did not answer {} within {:?}", call_kind, self.timeout)),
        }
    }

    /// Whether `id` is a reverse call awaiting its reply.
    pub(crate) fn is_waiting(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Deliver a reply. Returns `false` if nothing was waiting for it.
    pub(crate) fn resolve(
        &self,
        id: &str,
        reply_kind: &str,
        data: Option<Value>,
        error: Option<String>,
    ) -> bool {
        let mut waiting = self.lock();
        match waiting.get(id) {
            Some(entry) if entry.reply_kind == reply_kind => {}
            Some(entry) => {
                tracing::warn!(
                    %id,
                    expected = %entry.reply_kind,
                    got = reply_kind,
                    "ignoring reply of the wrong type"
                );
                return false;
            }
            None => return false,
        }

        let Some(entry) = waiting.remove(id) else {
            return false;
        };
        let reply = match error {
            Some(error) => Err(error),
            None => Ok(data),
        };
        let _ = entry.tx.send(reply);
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<String, Waiting>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Forgets a reverse call once its caller stops waiting.
struct EvictOnDrop<'a> {
    client: &'a HostClient,
    id: &'a str,
}

impl Drop for EvictOnDrop<'_> {
    fn drop(&mut self) {
        if self.client.lock().remove(self.id).is_some() {
            tracing::debug!(id = self.id, "stopped waiting for host reply");
        }
    }
}

impl std::fmt::Debug for HostClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostClient")
            .field("waiting", &self.lock().len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn client(timeout: Duration) -> (HostClient, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (HostClient::new(Outbox::frames(tx), timeout), rx)
    }

    #[tokio::test]
    async fn test_list_tools_matches_reply_by_id() {
        let (host, mut sent) = client(Duration::from_secs(5));

        let pending = tokio::spawn({
            let host = host.clone();
            async move { host.list_tools().await }
        });

        let request = sent.recv().await.unwrap();
        assert_eq!(request.kind, "mcpToolsRequest");
        assert!(request.id.starts_with("w-"));

        // A reply with the right id but the wrong type is not accepted.
        assert!(!host.resolve(&request.id, "somethingElse", None, None));
        assert!(host.resolve(
            &request.id,
            "mcpToolsResponse",
            Some(json!([{"name": "search", "serverId": "web"}])),
            None,
        ));

        let tools = pending.await.unwrap().unwrap();
        assert_eq!(tools, vec![ToolDescriptor::new("search").with_server("web")]);
        assert!(!host.is_waiting(&request.id));
    }

    #[tokio::test]
    async fn test_error_reply_fails_the_call() {
        let (host, mut sent) = client(Duration::from_secs(5));

        let pending = tokio::spawn({
            let host = host.clone();
            async move { host.execute_tool("fs", "read", json!({"path": "/etc"})).await }
        });

        let request = sent.recv().await.unwrap();
        assert_eq!(
            request.data,
            Some(json!({"serverId": "fs", "toolName": "read", "params": {"path": "/etc"}}))
        );
        host.resolve(
            &request.id,
            "mcpToolExecutionResponse",
            None,
            Some("permission denied".to_string()),
        );

        let err = pending.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("permission denied"));
    }

    #[tokio::test]
    async fn test_dropped_call_is_forgotten() {
        let (host, mut sent) = client(Duration::from_secs(5));

        let pending = tokio::spawn({
            let host = host.clone();
            async move { host.list_tools().await }
        });
        let request = sent.recv().await.unwrap();
        assert!(host.is_waiting(&request.id));

        pending.abort();
        assert!(pending.await.unwrap_err().is_cancelled());
        assert!(!host.is_waiting(&request.id));
        assert!(!host.resolve(&request.id, "mcpToolsResponse", None, None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_call_times_out() {
        let (host, _sent) = client(Duration::from_secs(30));
        let err = host.list_tools().await.unwrap_err();
        assert!(err.to_string().contains("did not answer"));
        assert_eq!(host.lock().len(), 0);
    }
}
