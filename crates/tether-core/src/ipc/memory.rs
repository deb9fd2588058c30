//! In-process channels.
//!
//! The worker runs as a task in the host's runtime. Used for the threaded
//! worker variant and for scripting fake workers in tests.

use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::mpsc;

use crate::error::{Error, Result};

use super::protocol::Message;
use super::transport::{Channel, ChannelEvent, Launcher, Outbox, Transport};

/// Create a connected host channel and worker endpoint.
pub fn channel() -> (Channel, WorkerEndpoint) {
    let (to_worker, from_host) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let channel = Channel {
        transport: Box::new(MemoryTransport {
            to_worker: Some(to_worker),
        }),
        events: events_rx,
    };
    let endpoint = WorkerEndpoint {
        receiver: from_host,
        events: events_tx,
    };

    (channel, endpoint)
}

/// Host-side half of an in-memory channel.
struct MemoryTransport {
    to_worker: Option<mpsc::UnboundedSender<Message>>,
}

impl Transport for MemoryTransport {
    fn send(&mut self, message: Message) -> Result<()> {
        let tx = self
            .to_worker
            .as_ref()
            .ok_or_else(|| Error::ChannelUnavailable("channel closed".to_string()))?;
        tx.send(message)
            .map_err(|_| Error::ChannelUnavailable("worker endpoint dropped".to_string()))
    }

    fn close(&mut self) -> Result<()> {
        match self.to_worker.take() {
            Some(_) => Ok(()),
            None => Err(Error::ChannelUnavailable("channel already closed".to_string())),
        }
    }
}

/// Worker-side half of an in-memory channel.
pub struct WorkerEndpoint {
    receiver: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl WorkerEndpoint {
    /// Receive the next message from the host. `None` once the host closed.
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// Receive without waiting.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }

    /// Deliver a message to the host.
    pub fn send(&self, message: Message) -> Result<()> {
        self.outbox().send(message)
    }

    /// Outbox for concurrent senders on the worker side.
    pub fn outbox(&self) -> Outbox {
        Outbox::events(self.events.clone())
    }

    /// Simulate a transport-level error.
    pub fn fail(&self, cause: impl Into<String>) {
        let _ = self.events.send(ChannelEvent::Error(cause.into()));
    }

    /// Simulate the worker exiting.
    pub fn exit(&self, code: Option<i32>) {
        let _ = self.events.send(ChannelEvent::Closed { code });
    }

    /// Split into the inbound receiver and an outbox.
    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<Message>, Outbox) {
        let outbox = Outbox::events(self.events);
        (self.receiver, outbox)
    }
}

type StartWorker = dyn Fn(WorkerEndpoint) -> Result<()> + Send + Sync;

/// Launcher that hands each new worker endpoint to a callback.
///
/// The callback usually spawns a worker task; returning an error simulates a
/// failed launch.
pub struct MemoryLauncher {
    start: Box<StartWorker>,
    launches: AtomicU32,
}

impl MemoryLauncher {
    pub fn new<F>(start: F) -> Self
    where
        F: Fn(WorkerEndpoint) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            start: Box::new(start),
            launches: AtomicU32::new(0),
        }
    }

    /// Number of launch attempts so far.
    pub fn launches(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }
}

impl Launcher for MemoryLauncher {
    fn launch(&self) -> Result<Channel> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let (channel, endpoint) = channel();
        (self.start)(endpoint)?;
        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_messages_flow_both_ways() {
        let (mut channel, mut endpoint) = channel();

        channel.transport.send(Message::call("1", "init", None)).unwrap();
        assert_eq!(endpoint.recv().await.unwrap().kind, "init");

        endpoint.send(Message::success("1", None)).unwrap();
        match channel.events.recv().await.unwrap() {
            ChannelEvent::Message(message) => assert_eq!(message.id, "1"),
            other => panic!("Wrong event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_ends_worker_stream() {
        let (mut channel, mut endpoint) = channel();

        channel.transport.close().unwrap();
        assert!(endpoint.recv().await.is_none());
        assert!(channel.transport.close().is_err());
        assert!(channel.transport.send(Message::call("2", "ping", None)).is_err());
    }

    #[tokio::test]
    async fn test_simulated_crash_is_an_event() {
        let (mut channel, endpoint) = channel();
        endpoint.fail("segfault");
        assert_eq!(
            channel.events.recv().await,
            Some(ChannelEvent::Error("segfault".to_string()))
        );
    }

    #[test]
    fn test_failed_launch_is_counted() {
        let launcher = MemoryLauncher::new(|_| Err(Error::ChannelUnavailable("no worker".into())));
        assert!(launcher.launch().is_err());
        assert_eq!(launcher.launches(), 1);
    }
}
