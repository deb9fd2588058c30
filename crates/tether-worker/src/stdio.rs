//! Serving the host over the worker process's stdin/stdout.
//!
//! Frames use the same length-prefixed JSON encoding as the host side.
//! Nothing else may be written to stdout; logs go to stderr.
//!
//! tokio reads stdin on a blocking thread that cannot be interrupted, so the
//! caller should shut its runtime down with
//! [`Runtime::shutdown_background`](tokio::runtime::Runtime::shutdown_background)
//! once [`serve_stdio`] returns. Otherwise exit waits for the host to close
//! stdin.

use std::time::Duration;

use tokio::io::{BufReader, BufWriter};
use tokio::sync::mpsc;

use tether_core::ipc::{Outbox, read_frame, write_frame};
use tether_core::Message;

use crate::runtime::WorkerRuntime;

/// How long queued replies get to flush after the loop ends.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Run `runtime` against the host connected to stdin/stdout.
pub async fn serve_stdio(runtime: WorkerRuntime) -> anyhow::Result<()> {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Message>();

    let reader = tokio::spawn(async move {
        let mut stdin = BufReader::new(tokio::io::stdin());
        loop {
            match read_frame(&mut stdin).await {
                Ok(Some(message)) => {
                    if inbound_tx.send(message).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    tracing::debug!("host closed stdin");
                    break;
                }
                Err(e) => {
                    tracing::error!("failed to read from host: {}", e);
                    break;
                }
            }
        }
    });

    let writer = tokio::spawn(async move {
        let mut stdout = BufWriter::new(tokio::io::stdout());
        while let Some(message) = frames_rx.recv().await {
            write_frame(&mut stdout, &message).await?;
        }
        Ok::<_, tether_core::Error>(())
    });

    let result = runtime.run(inbound_rx, Outbox::frames(frames_tx)).await;
    // Stops forwarding only. The blocking stdin read underneath cannot be
    // cancelled and ends when the host closes stdin or the runtime is shut
    // down in the background.
    reader.abort();

    // The writer ends once every outbox clone is gone.
    match tokio::time::timeout(FLUSH_TIMEOUT, writer).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::warn!("failed to write to host: {}", e),
        Ok(Err(e)) => tracing::warn!("writer task failed: {}", e),
        Err(_) => tracing::warn!("gave up flushing replies to host"),
    }

    result
}
