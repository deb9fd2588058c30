//! Correlation tables for in-flight calls.
//!
//! Every entry owns its completion handle and its timeout timer. Removing an
//! entry is the only way to complete it, so a call resolves at most once.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::error::{Error, Result};
use crate::ipc::Progress;

/// Callback receiving progress for one call.
pub(crate) type ProgressObserver = Arc<dyn Fn(Progress) + Send + Sync>;

/// An in-flight unary call.
pub(crate) struct PendingUnary {
    call_type: String,
    tx: oneshot::Sender<Result<Value>>,
    timer: Option<AbortHandle>,
    progress: Option<ProgressObserver>,
}

impl PendingUnary {
    pub(crate) fn new(
        call_type: impl Into<String>,
        tx: oneshot::Sender<Result<Value>>,
        timer: AbortHandle,
        progress: Option<ProgressObserver>,
    ) -> Self {
        Self {
            call_type: call_type.into(),
            tx,
            timer: Some(timer),
            progress,
        }
    }

    /// Complete the call. The receiver may already be gone.
    pub(crate) fn resolve(mut self, result: Result<Value>) {
        cancel(&mut self.timer);
        let _ = self.tx.send(result);
    }
}

/// An in-flight streaming call.
pub(crate) struct PendingStream {
    call_type: String,
    chunks: mpsc::UnboundedSender<String>,
    outcome: oneshot::Sender<Result<()>>,
    timer: Option<AbortHandle>,
}

impl PendingStream {
    pub(crate) fn new(
        call_type: impl Into<String>,
        chunks: mpsc::UnboundedSender<String>,
        outcome: oneshot::Sender<Result<()>>,
        timer: AbortHandle,
    ) -> Self {
        Self {
            call_type: call_type.into(),
            chunks,
            outcome,
            timer: Some(timer),
        }
    }

    /// Append a chunk in arrival order.
    fn push(&self, text: String) {
        let _ = self.chunks.send(text);
    }

    /// Signal completion; buffered chunks stay readable.
    pub(crate) fn complete(mut self) {
        cancel(&mut self.timer);
        let _ = self.outcome.send(Ok(()));
    }

    /// Signal failure; it pre-empts buffered chunks.
    pub(crate) fn fail(mut self, error: Error) {
        cancel(&mut self.timer);
        let _ = self.outcome.send(Err(error));
    }
}

fn cancel(timer: &mut Option<AbortHandle>) {
    if let Some(timer) = timer.take() {
        timer.abort();
    }
}

/// An entry removed from either table.
pub(crate) enum Pending {
    Unary(PendingUnary),
    Stream(PendingStream),
}

impl Pending {
    pub(crate) fn call_type(&self) -> &str {
        match self {
            Pending::Unary(entry) => &entry.call_type,
            Pending::Stream(entry) => &entry.call_type,
        }
    }

    /// Forget the timer without aborting it. Used by the timer itself.
    pub(crate) fn disarm_timer(&mut self) {
        match self {
            Pending::Unary(entry) => entry.timer = None,
            Pending::Stream(entry) => entry.timer = None,
        }
    }

    pub(crate) fn fail(self, error: Error) {
        match self {
            Pending::Unary(entry) => entry.resolve(Err(error)),
            Pending::Stream(entry) => entry.fail(error),
        }
    }
}

/// In-flight unary and streaming calls keyed by request id.
#[derive(Default)]
pub(crate) struct CorrelationTables {
    unary: FxHashMap<String, PendingUnary>,
    streams: FxHashMap<String, PendingStream>,
}

impl CorrelationTables {
    /// Whether `id` occupies either table.
    pub(crate) fn contains(&self, id: &str) -> bool {
        self.unary.contains_key(id) || self.streams.contains_key(id)
    }

    pub(crate) fn insert_unary(&mut self, id: String, entry: PendingUnary) -> Result<()> {
        if self.contains(&id) {
            return Err(Error::Protocol(format!("request id {} is already in flight", id)));
        }
        self.unary.insert(id, entry);
        Ok(())
    }

    pub(crate) fn insert_stream(&mut self, id: String, entry: PendingStream) -> Result<()> {
        if self.contains(&id) {
            return Err(Error::Protocol(format!("request id {} is already in flight", id)));
        }
        self.streams.insert(id, entry);
        Ok(())
    }

    pub(crate) fn take_unary(&mut self, id: &str) -> Option<PendingUnary> {
        self.unary.remove(id)
    }

    pub(crate) fn take_stream(&mut self, id: &str) -> Option<PendingStream> {
        self.streams.remove(id)
    }

    /// Remove `id` from whichever table holds it.
    pub(crate) fn take(&mut self, id: &str) -> Option<Pending> {
        self.take_unary(id)
            .map(Pending::Unary)
            .or_else(|| self.take_stream(id).map(Pending::Stream))
    }

    /// Append a chunk to a stream. Returns `false` if the stream is unknown.
    pub(crate) fn push_chunk(&self, id: &str, text: String) -> bool {
        match self.streams.get(id) {
            Some(stream) => {
                stream.push(text);
                true
            }
            None => false,
        }
    }

    /// The progress observer registered for `id`, if any.
    pub(crate) fn progress_observer(&self, id: &str) -> Option<ProgressObserver> {
        self.unary.get(id).and_then(|entry| entry.progress.clone())
    }

    /// Fail every pending call. Returns how many were failed.
    pub(crate) fn fail_all(&mut self, mut make_error: impl FnMut() -> Error) -> usize {
        let count = self.len();
        for (_, entry) in self.unary.drain() {
            entry.resolve(Err(make_error()));
        }
        for (_, entry) in self.streams.drain() {
            entry.fail(make_error());
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.unary.len() + self.streams.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn idle_timer() -> (tokio::task::JoinHandle<()>, AbortHandle) {
        let handle = tokio::spawn(tokio::time::sleep(Duration::from_secs(3600)));
        let abort = handle.abort_handle();
        (handle, abort)
    }

    #[tokio::test]
    async fn test_id_occupies_one_table() {
        let mut tables = CorrelationTables::default();
        let (tx, _rx) = oneshot::channel();
        let (_h1, timer) = idle_timer();
        tables
            .insert_unary("1".to_string(), PendingUnary::new("getLocalModels", tx, timer, None))
            .unwrap();

        let (chunks, _chunks_rx) = mpsc::unbounded_channel();
        let (outcome, _outcome_rx) = oneshot::channel();
        let (_h2, timer) = idle_timer();
        let duplicate = PendingStream::new("generateStreamResponse", chunks, outcome, timer);
        assert!(tables.insert_stream("1".to_string(), duplicate).is_err());
        assert_eq!(tables.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_cancels_timer() {
        let mut tables = CorrelationTables::default();
        let (tx, rx) = oneshot::channel();
        let (handle, timer) = idle_timer();
        tables
            .insert_unary("1".to_string(), PendingUnary::new("getModelStatus", tx, timer, None))
            .unwrap();

        tables.take_unary("1").unwrap().resolve(Ok(Value::Bool(true)));

        assert_eq!(rx.await.unwrap().unwrap(), Value::Bool(true));
        assert!(handle.await.unwrap_err().is_cancelled());
        assert!(!tables.contains("1"));
    }

    #[tokio::test]
    async fn test_fail_all_empties_both_tables() {
        let mut tables = CorrelationTables::default();

        let (tx, rx) = oneshot::channel();
        let (_h1, timer) = idle_timer();
        tables
            .insert_unary("1".to_string(), PendingUnary::new("loadModel", tx, timer, None))
            .unwrap();

        let (chunks, _chunks_rx) = mpsc::unbounded_channel();
        let (outcome, outcome_rx) = oneshot::channel();
        let (_h2, timer) = idle_timer();
        tables
            .insert_stream(
                "2".to_string(),
                PendingStream::new("generateStreamResponse", chunks, outcome, timer),
            )
            .unwrap();

        let failed = tables.fail_all(|| Error::ChannelCrash("boom".to_string()));

        assert_eq!(failed, 2);
        assert_eq!(tables.len(), 0);
        assert!(matches!(rx.await.unwrap(), Err(Error::ChannelCrash(_))));
        assert!(matches!(outcome_rx.await.unwrap(), Err(Error::ChannelCrash(_))));
    }

    #[tokio::test]
    async fn test_chunks_for_unknown_stream_are_rejected() {
        let tables = CorrelationTables::default();
        assert!(!tables.push_chunk("nope", "Hello".to_string()));
        assert!(tables.progress_observer("nope").is_none());
    }
}
