//! Generate command implementation for tether CLI.
//!
//! Loads a model and streams a response to stdout as it is produced.

use std::io::Write;
use std::time::Instant;

use futures::StreamExt;
use serde_json::json;

use tether_core::Operation;

use crate::colors;
use crate::connect::{WorkerOptions, connect};

/// Stream a response to `prompt`.
pub async fn execute(options: &WorkerOptions, model: &str, prompt: &str) -> anyhow::Result<()> {
    let start = Instant::now();
    let proxy = connect(options).await?;

    let result = async {
        proxy
            .call(Operation::LoadModel, Some(json!({ "modelId": model })))
            .await?;

        let mut stream = proxy
            .call_streaming(Operation::GenerateStreamResponse, Some(json!({ "prompt": prompt })))
            .await?;

        let mut stdout = std::io::stdout();
        let mut chunks = 0usize;
        while let Some(chunk) = stream.next().await {
            write!(stdout, "{}", chunk?)?;
            stdout.flush()?;
            chunks += 1;
        }
        Ok::<_, anyhow::Error>(chunks)
    }
    .await;

    proxy.shutdown().await;
    let chunks = result?;

    eprintln!(
        "\n{}Generated{} {} chunks in {:.2}s",
        colors::GREEN,
        colors::RESET,
        chunks,
        start.elapsed().as_secs_f64()
    );
    Ok(())
}
