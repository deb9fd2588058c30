//! Loopback engine for exercising the channel without a model.
//!
//! Generation echoes the prompt back, streamed word by word. Downloads
//! report simulated progress. `generateResponse` with `"withTools": true`
//! asks the host for its tool list through a reverse call.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::bail;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Value, json};

use tether_core::Operation;

use crate::engine::{ModelEngine, RequestContext};

const ECHO_MODEL: &str = "echo";

#[derive(Debug, Default)]
struct EchoState {
    loaded: Option<String>,
    settings: Value,
    history: Vec<Value>,
}

/// Model engine that answers every generation with its own prompt.
#[derive(Debug, Default)]
pub struct EchoEngine {
    /// Pause between streamed chunks and progress steps.
    step_delay: Duration,
    state: Mutex<EchoState>,
    aborted: AtomicBool,
}

impl EchoEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, EchoState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    async fn pause(&self) {
        if !self.step_delay.is_zero() {
            tokio::time::sleep(self.step_delay).await;
        }
    }

    fn catalog() -> Value {
        json!([{
            "id": ECHO_MODEL,
            "name": "Echo",
            "size": 0,
            "description": "Repeats the prompt back"
        }])
    }

    async fn generate(&self, payload: Option<Value>, ctx: &RequestContext) -> anyhow::Result<Value> {
        let mut text = prompt(&payload)?;
        let with_tools = payload
            .as_ref()
            .and_then(|p| p.get("withTools"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if with_tools {
            let tools = ctx.host().list_tools().await?;
            let names: Vec<_> = tools.iter().map(|tool| tool.name.as_str()).collect();
            text = format!("{} [tools: {}]", text, names.join(", "));
        }
        Ok(json!({ "text": text }))
    }

    async fn generate_stream(
        &self,
        payload: Option<Value>,
        ctx: &RequestContext,
    ) -> anyhow::Result<Value> {
        let text = prompt(&payload)?;
        self.aborted.store(false, Ordering::SeqCst);

        for chunk in word_chunks(&text) {
            if self.aborted.load(Ordering::SeqCst) {
                tracing::debug!(id = ctx.id(), "generation aborted");
                break;
            }
            ctx.emit_chunk(chunk)?;
            self.pause().await;
        }
        Ok(Value::Null)
    }

    async fn download(&self, payload: Option<Value>, ctx: &RequestContext) -> anyhow::Result<Value> {
        let model_id = model_id(&payload)?;
        for step in 1..=4 {
            self.pause().await;
            ctx.emit_progress(f64::from(step) * 25.0, Some("1.0 MB/s".to_string()))?;
        }
        Ok(json!({ "modelId": model_id, "status": "downloaded" }))
    }

    async fn serve(
        &self,
        op: Operation,
        payload: Option<Value>,
        ctx: RequestContext,
    ) -> anyhow::Result<Value> {
        match op {
            Operation::GetLocalModels | Operation::GetAvailableModels => Ok(Self::catalog()),
            Operation::SearchModels => {
                let query = payload
                    .as_ref()
                    .and_then(|p| p.get("query"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if ECHO_MODEL.contains(query) {
                    Ok(Self::catalog())
                } else {
                    Ok(json!([]))
                }
            }
            Operation::DownloadModel => self.download(payload, &ctx).await,
            Operation::DeleteModel | Operation::CancelDownload => Ok(json!({ "success": true })),
            Operation::GetDownloadProgress => Ok(json!({ "progress": 100.0 })),
            Operation::LoadModel => {
                let model_id = model_id(&payload)?;
                if model_id != ECHO_MODEL {
                    bail!("model not found: {}", model_id);
                }
                self.state().loaded = Some(model_id.clone());
                Ok(json!({ "loaded": model_id }))
            }
            Operation::UnloadModel => {
                self.state().loaded = None;
                Ok(json!({ "loaded": null }))
            }
            Operation::UpdateSessionHistory => {
                let entries = payload.unwrap_or(Value::Null);
                let mut state = self.state();
                match entries {
                    Value::Array(items) => state.history = items,
                    Value::Null => state.history.clear(),
                    other => state.history = vec![other],
                }
                Ok(json!({ "entries": state.history.len() }))
            }
            Operation::GenerateResponse => {
                self.ensure_loaded()?;
                self.generate(payload, &ctx).await
            }
            Operation::GenerateStreamResponse => {
                self.ensure_loaded()?;
                self.generate_stream(payload, &ctx).await
            }
            Operation::AbortGeneration => {
                self.aborted.store(true, Ordering::SeqCst);
                Ok(json!({ "aborted": true }))
            }
            Operation::SetModelSettings => {
                self.state().settings = payload.unwrap_or(Value::Null);
                Ok(json!({ "success": true }))
            }
            Operation::GetModelSettings => Ok(self.state().settings.clone()),
            Operation::GetModelStatus => {
                let state = self.state();
                Ok(json!({
                    "loaded": state.loaded.is_some(),
                    "modelId": state.loaded,
                }))
            }
            Operation::GetModelRuntimeInfo => Ok(json!({
                "engine": "echo",
                "contextSize": 0,
                "gpuLayers": 0,
            })),
            Operation::ClearContextSizeCache | Operation::Cleanup => Ok(Value::Null),
            Operation::Init | Operation::CalculateOptimalSettings => {
                bail!("{} is not supported by the echo engine", op)
            }
        }
    }

    fn ensure_loaded(&self) -> anyhow::Result<()> {
        if self.state().loaded.is_none() {
            bail!("no model loaded");
        }
        Ok(())
    }
}

impl ModelEngine for EchoEngine {
    fn handle(
        &self,
        op: Operation,
        payload: Option<Value>,
        ctx: RequestContext,
    ) -> BoxFuture<'_, anyhow::Result<Value>> {
        self.serve(op, payload, ctx).boxed()
    }
}

fn prompt(payload: &Option<Value>) -> anyhow::Result<String> {
    match payload {
        Some(Value::String(prompt)) => Ok(prompt.clone()),
        Some(value) => match value.get("prompt").and_then(Value::as_str) {
            Some(prompt) => Ok(prompt.to_string()),
            None => bail!("missing prompt"),
        },
        None => bail!("missing prompt"),
    }
}

fn model_id(payload: &Option<Value>) -> anyhow::Result<String> {
    match payload {
        Some(Value::String(id)) => Ok(id.clone()),
        Some(value) => match value.get("modelId").and_then(Value::as_str) {
            Some(id) => Ok(id.to_string()),
            None => bail!("missing modelId"),
        },
        None => bail!("missing modelId"),
    }
}

/// Split text before each run of whitespace: "Hello world" -> ["Hello", " world"].
fn word_chunks(text: &str) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut prev_space = true;

    for (i, c) in text.char_indices() {
        let space = c.is_whitespace();
        if space && !prev_space && i > start {
            chunks.push(&text[start..i]);
            start = i;
        }
        prev_space = space;
    }
    if start < text.len() {
        chunks.push(&text[start..]);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_chunks_keep_leading_space() {
        assert_eq!(word_chunks("Hello world"), vec!["Hello", " world"]);
        assert_eq!(word_chunks("  a  b"), vec!["  a", "  b"]);
        assert!(word_chunks("").is_empty());
    }

    #[test]
    fn test_prompt_from_object_or_string() {
        assert_eq!(prompt(&Some(json!("hi"))).unwrap(), "hi");
        assert_eq!(prompt(&Some(json!({"prompt": "yo"}))).unwrap(), "yo");
        assert!(prompt(&Some(json!({"text": "no"}))).is_err());
        assert!(prompt(&None).is_err());
    }
}
