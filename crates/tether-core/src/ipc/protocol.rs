//! Wire messages exchanged with the worker.
//!
//! Both directions share one JSON object shape. Over byte pipes each message
//! is framed as a 4-byte length (u32 LE) followed by the JSON body.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Payload of the `response` that ends a streaming call.
pub const STREAM_COMPLETE: &str = "STREAM_COMPLETE";

/// Frames larger than this are rejected (100MB).
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Message type tags that are not forward operations.
pub mod kind {
    pub const INIT: &str = "init";
    pub const RESPONSE: &str = "response";
    pub const STREAM_CHUNK: &str = "streamChunk";
    pub const DOWNLOAD_PROGRESS: &str = "downloadProgress";
    pub const PROGRESS: &str = "progress";
    pub const MCP_TOOLS_REQUEST: &str = "mcpToolsRequest";
    pub const MCP_TOOLS_RESPONSE: &str = "mcpToolsResponse";
    pub const EXECUTE_MCP_TOOL: &str = "executeMCPTool";
    pub const MCP_TOOL_EXECUTION_RESPONSE: &str = "mcpToolExecutionResponse";
}

/// One message on the channel, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Correlation id.
    pub id: String,
    /// Type tag.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,
}

/// A progress notification for a long-running call.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    /// Completion, as reported by the worker (0-100 for downloads).
    pub progress: f64,
    /// Human-readable transfer speed, if reported.
    pub speed: Option<String>,
}

/// An inbound message classified by its type tag and shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Terminal answer to a call. `Ok` carries the optional `data`.
    Response {
        id: String,
        outcome: std::result::Result<Option<Value>, String>,
    },
    /// One chunk of a streaming call.
    StreamChunk { id: String, text: String },
    /// Side-channel progress keyed by the call id.
    Progress { id: String, update: Progress },
    /// A call-shaped message: a request, or a reply to a request issued by
    /// the receiving side.
    Call {
        id: String,
        kind: String,
        data: Option<Value>,
        error: Option<String>,
    },
    /// Anything that fits none of the above.
    Unknown(Message),
}

impl Message {
    fn bare(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            success: None,
            data: None,
            error: None,
            progress: None,
            speed: None,
        }
    }

    /// A call of `kind` with an optional payload.
    pub fn call(id: impl Into<String>, kind: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            data,
            ..Self::bare(id, kind)
        }
    }

    /// A successful `response`.
    pub fn success(id: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            success: Some(true),
            data,
            ..Self::bare(id, kind::RESPONSE)
        }
    }

    /// A failed `response`.
    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: Some(false),
            error: Some(error.into()),
            ..Self::bare(id, kind::RESPONSE)
        }
    }

    /// The `response` that completes a streaming call.
    pub fn stream_complete(id: impl Into<String>) -> Self {
        Self::success(id, Some(Value::String(STREAM_COMPLETE.to_string())))
    }

    /// A `streamChunk` carrying text.
    pub fn chunk(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            data: Some(Value::String(text.into())),
            ..Self::bare(id, kind::STREAM_CHUNK)
        }
    }

    /// A `downloadProgress` notification.
    pub fn download_progress(id: impl Into<String>, progress: f64, speed: Option<String>) -> Self {
        Self {
            progress: Some(progress),
            speed,
            ..Self::bare(id, kind::DOWNLOAD_PROGRESS)
        }
    }

    /// A reply to a call, tagged with `reply_kind`.
    pub fn reply(
        id: impl Into<String>,
        reply_kind: impl Into<String>,
        outcome: std::result::Result<Value, String>,
    ) -> Self {
        let mut message = Self::bare(id, reply_kind);
        match outcome {
            Ok(data) => message.data = Some(data),
            Err(error) => message.error = Some(error),
        }
        message
    }

    /// Classify this message by its type tag and shape.
    pub fn classify(self) -> Inbound {
        match self.kind.as_str() {
            kind::RESPONSE => {
                let outcome = if self.success == Some(true) {
                    Ok(self.data)
                } else {
                    Err(self
                        .error
                        .filter(|e| !e.is_empty())
                        .unwrap_or_else(|| "worker reported failure without detail".to_string()))
                };
                Inbound::Response {
                    id: self.id,
                    outcome,
                }
            }
            kind::STREAM_CHUNK => match self.data {
                Some(Value::String(text)) => Inbound::StreamChunk { id: self.id, text },
                _ => Inbound::Unknown(self),
            },
            kind::DOWNLOAD_PROGRESS | kind::PROGRESS => Inbound::Progress {
                id: self.id,
                update: Progress {
                    progress: self.progress.unwrap_or(0.0),
                    speed: self.speed,
                },
            },
            _ if self.success.is_none() && self.progress.is_none() && !self.id.is_empty() => {
                Inbound::Call {
                    id: self.id,
                    kind: self.kind,
                    data: self.data,
                    error: self.error,
                }
            }
            _ => Inbound::Unknown(self),
        }
    }
}

/// Write a message using length-prefixed JSON encoding.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    let bytes = serde_json::to_vec(message)?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!(
            "outgoing message too large: {} bytes",
            bytes.len()
        )));
    }

    let len = bytes.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;

    Ok(())
}

/// Read one length-prefixed JSON message.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Message>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!("incoming message too large: {} bytes", len)));
    }

    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).await.map_err(|e| {
        Error::Protocol(format!("truncated frame ({} bytes expected): {}", len, e))
    })?;

    Ok(Some(serde_json::from_slice(&bytes)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_absent_fields_are_omitted() {
        let message = Message::call("7", "getLocalModels", None);
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json, json!({"id": "7", "type": "getLocalModels"}));
    }

    #[test]
    fn test_classify_response() {
        let ok = Message::success("1", Some(json!([{"id": "m1"}]))).classify();
        assert_eq!(
            ok,
            Inbound::Response {
                id: "1".to_string(),
                outcome: Ok(Some(json!([{"id": "m1"}]))),
            }
        );

        let failed = Message::failure("2", "model not found").classify();
        assert_eq!(
            failed,
            Inbound::Response {
                id: "2".to_string(),
                outcome: Err("model not found".to_string()),
            }
        );
    }

    #[test]
    fn test_response_without_success_is_a_failure() {
        let message: Message = serde_json::from_value(json!({"id": "3", "type": "response"})).unwrap();
        match message.classify() {
            Inbound::Response { outcome: Err(error), .. } => assert!(!error.is_empty()),
            other => panic!("Wrong classification: {:?}", other),
        }
    }

    #[test]
    fn test_classify_side_messages() {
        assert_eq!(
            Message::chunk("4", "Hello").classify(),
            Inbound::StreamChunk {
                id: "4".to_string(),
                text: "Hello".to_string(),
            }
        );

        let progress = Message::download_progress("5", 42.5, Some("3 MB/s".to_string())).classify();
        assert_eq!(
            progress,
            Inbound::Progress {
                id: "5".to_string(),
                update: Progress {
                    progress: 42.5,
                    speed: Some("3 MB/s".to_string()),
                },
            }
        );
    }

    #[test]
    fn test_classify_call_and_unknown() {
        match Message::call("x", kind::MCP_TOOLS_REQUEST, None).classify() {
            Inbound::Call { id, kind, .. } => {
                assert_eq!(id, "x");
                assert_eq!(kind, "mcpToolsRequest");
            }
            other => panic!("Wrong classification: {:?}", other),
        }

        // A chunk whose payload is not text cannot be appended to a stream.
        let bad_chunk = Message::call("y", kind::STREAM_CHUNK, Some(json!(12)));
        assert!(matches!(bad_chunk.classify(), Inbound::Unknown(_)));

        let mut odd = Message::call("z", "mystery", None);
        odd.success = Some(true);
        assert!(matches!(odd.classify(), Inbound::Unknown(_)));
    }

    #[test]
    fn test_reply_carries_error_or_data() {
        let ok = Message::reply("x", kind::MCP_TOOLS_RESPONSE, Ok(json!([])));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"id": "x", "type": "mcpToolsResponse", "data": []})
        );

        let err = Message::reply("x", kind::MCP_TOOLS_RESPONSE, Err("boom".to_string()));
        assert_eq!(err.error.as_deref(), Some("boom"));
        assert!(err.data.is_none());
    }

    #[tokio::test]
    async fn test_frames_roundtrip_in_order() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, &Message::chunk("1", "Hello")).await.unwrap();
        write_frame(&mut client, &Message::stream_complete("1")).await.unwrap();
        drop(client);

        let first = read_frame(&mut server).await.unwrap().unwrap();
        let second = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(first, Message::chunk("1", "Hello"));
        assert_eq!(second.data, Some(json!(STREAM_COMPLETE)));
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_FRAME_LEN as u32) + 1;
        client.write_all(&len.to_le_bytes()).await.unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
