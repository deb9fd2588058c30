//! Consumer side of a streaming call.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};

/// Invoked when a stream is dropped before it finished.
pub(crate) type AbandonHook = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    /// Waiting for chunks and the terminal outcome.
    Open,
    /// Completed; draining buffered chunks.
    Draining,
    /// Ended, successfully or not.
    Done,
}

/// Lazy, finite sequence of text chunks from one streaming call.
///
/// Not restartable: issuing the call again yields a new stream. A failure is
/// surfaced on the next pull even if chunks were already yielded, so partial
/// output is never evidence of success. Dropping the stream early stops local
/// consumption only; see [`AbandonPolicy`](crate::AbandonPolicy).
pub struct ResponseStream {
    id: String,
    chunks: mpsc::UnboundedReceiver<String>,
    outcome: Option<oneshot::Receiver<Result<()>>>,
    state: StreamState,
    on_abandon: Option<AbandonHook>,
}

impl ResponseStream {
    pub(crate) fn new(
        id: String,
        chunks: mpsc::UnboundedReceiver<String>,
        outcome: oneshot::Receiver<Result<()>>,
        on_abandon: AbandonHook,
    ) -> Self {
        Self {
            id,
            chunks,
            outcome: Some(outcome),
            state: StreamState::Open,
            on_abandon: Some(on_abandon),
        }
    }

    /// Request id of the underlying call.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Pull every chunk. Fails if the call failed, even after partial output.
    pub async fn collect_chunks(mut self) -> Result<Vec<String>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.next().await {
            chunks.push(chunk?);
        }
        Ok(chunks)
    }

    fn finish(&mut self) {
        self.state = StreamState::Done;
        self.outcome = None;
        self.on_abandon = None;
    }

    /// Poll the terminal outcome while the stream is open.
    fn poll_outcome(&mut self, cx: &mut Context<'_>) -> Option<Error> {
        let outcome = self.outcome.as_mut()?;
        match Pin::new(outcome).poll(cx) {
            Poll::Ready(Ok(Ok(()))) => {
                self.outcome = None;
                self.state = StreamState::Draining;
                None
            }
            Poll::Ready(Ok(Err(error))) => Some(error),
            Poll::Ready(Err(_)) => Some(Error::ChannelUnavailable(
                "stream dropped without completing".to_string(),
            )),
            Poll::Pending => None,
        }
    }
}

impl Stream for ResponseStream {
    type Item = Result<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.state == StreamState::Done {
            return Poll::Ready(None);
        }

        if this.state == StreamState::Open {
            if let Some(error) = this.poll_outcome(cx) {
                this.finish();
                return Poll::Ready(Some(Err(error)));
            }
        }

        match this.chunks.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(None) => {
                // The sender goes away only after the outcome is sent.
                if this.state == StreamState::Open {
                    if let Some(error) = this.poll_outcome(cx) {
                        this.finish();
                        return Poll::Ready(Some(Err(error)));
                    }
                }
                if this.state == StreamState::Draining {
                    this.finish();
                    Poll::Ready(None)
                } else {
                    Poll::Pending
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        if let Some(on_abandon) = self.on_abandon.take() {
            on_abandon();
        }
    }
}

impl std::fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Feed {
        chunks: mpsc::UnboundedSender<String>,
        outcome: oneshot::Sender<Result<()>>,
        abandoned: Arc<AtomicBool>,
    }

    fn stream() -> (ResponseStream, Feed) {
        let (chunks_tx, chunks_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let abandoned = Arc::new(AtomicBool::new(false));
        let flag = abandoned.clone();
        let stream = ResponseStream::new(
            "7".to_string(),
            chunks_rx,
            outcome_rx,
            Box::new(move || flag.store(true, Ordering::SeqCst)),
        );
        let feed = Feed {
            chunks: chunks_tx,
            outcome: outcome_tx,
            abandoned,
        };
        (stream, feed)
    }

    #[tokio::test]
    async fn test_completion_drains_buffered_chunks() {
        let (stream, feed) = stream();
        feed.chunks.send("Hello".to_string()).unwrap();
        feed.chunks.send(" world".to_string()).unwrap();
        feed.outcome.send(Ok(())).unwrap();
        drop(feed.chunks);

        assert_eq!(stream.collect_chunks().await.unwrap(), vec!["Hello", " world"]);
        assert!(!feed.abandoned.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failure_preempts_buffered_chunks() {
        let (mut stream, feed) = stream();
        feed.chunks.send("Hello".to_string()).unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "Hello");

        feed.chunks.send(" wor".to_string()).unwrap();
        feed.outcome
            .send(Err(Error::WorkerReported("out of memory".to_string())))
            .unwrap();

        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, Error::WorkerReported(_)));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_open_stream_runs_abandon_hook() {
        let (stream, feed) = stream();
        drop(stream);
        assert!(feed.abandoned.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_lost_outcome_is_an_error() {
        let (mut stream, feed) = stream();
        drop(feed.outcome);
        drop(feed.chunks);
        assert!(matches!(
            stream.next().await,
            Some(Err(Error::ChannelUnavailable(_)))
        ));
    }
}
