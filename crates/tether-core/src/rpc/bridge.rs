//! Reverse-call bridge.
//!
//! The worker may address the host as a server. Each call-shaped message
//! with a registered type is handed to a local handler and answered with
//! exactly one reply tagged with the worker's id, whether the handler
//! succeeds, fails or panics. The tool calls are answered even when no
//! registry backs them.

use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::ipc::Message;
use crate::ipc::protocol::kind;

/// Error returned by reverse-call handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Future returned by a reverse-call handler.
pub type HandlerFuture = BoxFuture<'static, Result<Value, HandlerError>>;

type Handler = Arc<dyn Fn(Option<Value>) -> HandlerFuture + Send + Sync>;

struct Route {
    reply_type: String,
    handler: Handler,
}

/// A tool the worker may invoke through the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Server that hosts the tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// JSON schema of the tool's parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            server_id: None,
            input_schema: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_server(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }
}

/// Registry of tools that backs the reverse-call handlers.
pub trait ToolRegistry: Send + Sync + 'static {
    /// Tools currently available.
    fn list_tools(&self) -> BoxFuture<'_, Result<Vec<ToolDescriptor>, HandlerError>>;

    /// Run a tool on a server.
    fn execute(
        &self,
        server_id: String,
        tool_name: String,
        params: Value,
    ) -> BoxFuture<'_, Result<Value, HandlerError>>;
}

/// A registry with a fixed tool list and no executable tools.
#[derive(Debug, Clone, Default)]
pub struct StaticToolRegistry {
    tools: Vec<ToolDescriptor>,
}

impl StaticToolRegistry {
    pub fn new(tools: Vec<ToolDescriptor>) -> Self {
        Self { tools }
    }
}

impl ToolRegistry for StaticToolRegistry {
    fn list_tools(&self) -> BoxFuture<'_, Result<Vec<ToolDescriptor>, HandlerError>> {
        let tools = self.tools.clone();
        async move { Ok(tools) }.boxed()
    }

    fn execute(
        &self,
        server_id: String,
        tool_name: String,
        _params: Value,
    ) -> BoxFuture<'_, Result<Value, HandlerError>> {
        async move {
            let error = format!(
                "tool {} on server {} cannot be executed by this host",
                tool_name, server_id
            );
            Err::<Value, HandlerError>(error.into())
        }
        .boxed()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteToolArgs {
    server_id: String,
    tool_name: String,
    #[serde(default)]
    params: Value,
}

/// Table of reverse-call handlers keyed by call type.
#[derive(Clone, Default)]
pub struct ReverseCallBridge {
    routes: FxHashMap<String, Arc<Route>>,
}

impl ReverseCallBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bridge serving `mcpToolsRequest` and `executeMCPTool` from a registry.
    pub fn with_tool_registry(registry: Arc<dyn ToolRegistry>) -> Self {
        let list_registry = registry.clone();
        Self::new()
            .register(kind::MCP_TOOLS_REQUEST, kind::MCP_TOOLS_RESPONSE, move |_| {
                let registry = list_registry.clone();
                async move {
                    let tools = registry.list_tools().await?;
                    Ok::<Value, HandlerError>(serde_json::to_value(tools)?)
                }
            })
            .register(
                kind::EXECUTE_MCP_TOOL,
                kind::MCP_TOOL_EXECUTION_RESPONSE,
                move |payload| {
                    let registry = registry.clone();
                    async move {
                        let payload = payload.ok_or("executeMCPTool requires a payload")?;
                        let args: ExecuteToolArgs = serde_json::from_value(payload)?;
                        registry.execute(args.server_id, args.tool_name, args.params).await
                    }
                },
            )
    }

    /// Register a handler for `call_type`, answered with `reply_type`.
    pub fn register<F, Fut>(mut self, call_type: &str, reply_type: &str, handler: F) -> Self
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |payload| handler(payload).boxed());
        self.routes.insert(
            call_type.to_string(),
            Arc::new(Route {
                reply_type: reply_type.to_string(),
                handler,
            }),
        );
        self
    }

    /// Whether `call_type` is answered by this bridge.
    ///
    /// The tool calls always are, even without a registered handler.
    pub fn handles(&self, call_type: &str) -> bool {
        self.routes.contains_key(call_type) || tool_reply_type(call_type).is_some()
    }

    /// Start serving a reverse call.
    ///
    /// Returns `None` if `call_type` is not answered here. Otherwise the
    /// returned future always yields exactly one reply message; handler
    /// failures and panics become an error-tagged reply. Must be polled
    /// inside a tokio runtime.
    pub fn serve(
        &self,
        id: String,
        call_type: &str,
        payload: Option<Value>,
    ) -> Option<impl Future<Output = Message> + Send + 'static> {
        let (reply_type, handler) = match self.routes.get(call_type) {
            Some(route) => (route.reply_type.clone(), Some(route.handler.clone())),
            None => (tool_reply_type(call_type)?.to_string(), None),
        };
        let call_type = call_type.to_string();

        Some(async move {
            let outcome = match handler {
                Some(handler) => run_handler(handler, payload, &call_type).await,
                None => Err(Error::ReverseHandler(format!(
                    "no tool registry is configured for {}",
                    call_type
                ))),
            };

            match &outcome {
                Ok(_) => tracing::debug!(%id, %call_type, "reverse call served"),
                Err(error) => tracing::warn!(%id, %call_type, %error, "reverse call failed"),
            }

            Message::reply(id, reply_type, outcome.map_err(|e| e.to_string()))
        })
    }
}

/// Reply type of a tool call from the fixed catalog.
fn tool_reply_type(call_type: &str) -> Option<&'static str> {
    match call_type {
        kind::MCP_TOOLS_REQUEST => Some(kind::MCP_TOOLS_RESPONSE),
        kind::EXECUTE_MCP_TOOL => Some(kind::MCP_TOOL_EXECUTION_RESPONSE),
        _ => None,
    }
}

async fn run_handler(
    handler: Handler,
    payload: Option<Value>,
    call_type: &str,
) -> Result<Value, Error> {
    // Run on its own task so a panic stays inside the bridge.
    match tokio::spawn(async move { handler(payload).await }).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) if e.to_string().trim().is_empty() => Err(Error::ReverseHandler(format!(
            "{} handler failed without a message",
            call_type
        ))),
        Ok(Err(e)) => Err(Error::ReverseHandler(e.to_string())),
        Err(join) if join.is_panic() => {
            Err(Error::ReverseHandler(format!("{} handler panicked", call_type)))
        }
        Err(_) => Err(Error::ReverseHandler(format!(
            "{} handler was cancelled",
            call_type
        ))),
    }
}

impl std::fmt::Debug for ReverseCallBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReverseCallBridge")
            .field("routes", &self.routes.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct TestRegistry;

    impl ToolRegistry for TestRegistry {
        fn list_tools(&self) -> BoxFuture<'_, Result<Vec<ToolDescriptor>, HandlerError>> {
            async { Ok(vec![ToolDescriptor::new("test-tool").with_description("Test tool")]) }.boxed()
        }

        fn execute(
            &self,
            server_id: String,
            tool_name: String,
            params: Value,
        ) -> BoxFuture<'_, Result<Value, HandlerError>> {
            async move { Ok(json!({"server": server_id, "tool": tool_name, "echo": params})) }.boxed()
        }
    }

    fn registry_bridge() -> ReverseCallBridge {
        ReverseCallBridge::with_tool_registry(Arc::new(TestRegistry))
    }

    #[tokio::test]
    async fn test_tools_request_reply() {
        let bridge = registry_bridge();
        let reply = bridge
            .serve("x".to_string(), kind::MCP_TOOLS_REQUEST, None)
            .unwrap()
            .await;

        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({
                "id": "x",
                "type": "mcpToolsResponse",
                "data": [{"name": "test-tool", "description": "Test tool"}]
            })
        );
    }

    #[tokio::test]
    async fn test_execute_tool_reply() {
        let bridge = registry_bridge();
        let payload = json!({"serverId": "fs", "toolName": "read", "params": {"path": "/tmp"}});
        let reply = bridge
            .serve("w-1".to_string(), kind::EXECUTE_MCP_TOOL, Some(payload))
            .unwrap()
            .await;

        assert_eq!(reply.kind, "mcpToolExecutionResponse");
        assert_eq!(
            reply.data,
            Some(json!({"server": "fs", "tool": "read", "echo": {"path": "/tmp"}}))
        );
    }

    #[tokio::test]
    async fn test_malformed_execute_payload_is_an_error_reply() {
        let bridge = registry_bridge();
        let reply = bridge
            .serve("w-2".to_string(), kind::EXECUTE_MCP_TOOL, Some(json!({"toolName": 3})))
            .unwrap()
            .await;

        assert_eq!(reply.id, "w-2");
        assert!(reply.data.is_none());
        assert!(!reply.error.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_and_panicking_handlers_still_reply() {
        let bridge = ReverseCallBridge::new()
            .register("fails", "failsResponse", |_| async {
                Err::<Value, HandlerError>("".into())
            })
            .register("panics", "panicsResponse", |payload| async move {
                match payload {
                    None => panic!("handler blew up"),
                    Some(value) => Ok::<Value, HandlerError>(value),
                }
            });

        let reply = bridge.serve("a".to_string(), "fails", None).unwrap().await;
        assert_eq!(reply.kind, "failsResponse");
        assert_eq!(
            reply.error.as_deref(),
            Some("reverse call handler failed: fails handler failed without a message")
        );

        let reply = bridge.serve("b".to_string(), "panics", None).unwrap().await;
        assert_eq!(reply.id, "b");
        assert_eq!(
            reply.error.as_deref(),
            Some("reverse call handler failed: panics handler panicked")
        );
    }

    #[tokio::test]
    async fn test_tool_calls_without_registry_get_error_replies() {
        let bridge = ReverseCallBridge::new();
        assert!(bridge.handles(kind::MCP_TOOLS_REQUEST));
        assert!(bridge.handles(kind::EXECUTE_MCP_TOOL));

        let reply = bridge
            .serve("x".to_string(), kind::MCP_TOOLS_REQUEST, None)
            .unwrap()
            .await;
        assert_eq!(reply.id, "x");
        assert_eq!(reply.kind, "mcpToolsResponse");
        assert!(reply.data.is_none());
        assert_eq!(
            reply.error.as_deref(),
            Some("reverse call handler failed: no tool registry is configured for mcpToolsRequest")
        );

        let reply = bridge
            .serve("y".to_string(), kind::EXECUTE_MCP_TOOL, Some(json!({})))
            .unwrap()
            .await;
        assert_eq!(reply.kind, "mcpToolExecutionResponse");
        assert!(reply.error.is_some());
    }

    #[test]
    fn test_unregistered_type_is_not_served() {
        let bridge = registry_bridge();
        assert!(bridge.handles(kind::MCP_TOOLS_REQUEST));
        assert!(bridge.serve("c".to_string(), "mystery", None).is_none());
    }
}
