//! Channel abstractions shared by the process and in-memory transports.

use tokio::sync::mpsc;

use crate::error::{Error, Result};

use super::protocol::Message;

/// Event delivered from a channel to its single inbound notification point.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A message from the peer.
    Message(Message),
    /// The peer side reported an error; the channel is unusable.
    Error(String),
    /// The peer terminated. `code` is its exit status when known.
    Closed { code: Option<i32> },
}

/// Receiving end of a channel's event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<ChannelEvent>;

/// Outbound half of a duplex channel to the worker.
pub trait Transport: Send {
    /// Queue a message for delivery to the peer. Never blocks.
    fn send(&mut self, message: Message) -> Result<()>;

    /// Tear the channel down. Closing twice is an error.
    fn close(&mut self) -> Result<()>;
}

/// One generation of a channel: the outbound transport and its events.
pub struct Channel {
    pub transport: Box<dyn Transport>,
    pub events: EventReceiver,
}

/// Creates channels to a fresh worker, once at startup and again after each
/// crash.
pub trait Launcher: Send + Sync + 'static {
    /// Start a worker and connect to it.
    fn launch(&self) -> Result<Channel>;
}

/// Cloneable sender for messages flowing toward the other side.
///
/// Used by the worker side of the channel, where many tasks reply
/// concurrently.
#[derive(Debug, Clone)]
pub struct Outbox {
    inner: OutboxInner,
}

#[derive(Debug, Clone)]
enum OutboxInner {
    /// Straight into the host's event stream (in-memory channels).
    Events(mpsc::UnboundedSender<ChannelEvent>),
    /// Into a writer task that frames messages onto a pipe.
    Frames(mpsc::UnboundedSender<Message>),
}

impl Outbox {
    /// Outbox feeding a host-side event stream directly.
    pub fn events(tx: mpsc::UnboundedSender<ChannelEvent>) -> Self {
        Self {
            inner: OutboxInner::Events(tx),
        }
    }

    /// Outbox feeding a frame writer.
    pub fn frames(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            inner: OutboxInner::Frames(tx),
        }
    }

    /// Send a message to the other side.
    pub fn send(&self, message: Message) -> Result<()> {
        let delivered = match &self.inner {
            OutboxInner::Events(tx) => tx.send(ChannelEvent::Message(message)).is_ok(),
            OutboxInner::Frames(tx) => tx.send(message).is_ok(),
        };

        if delivered {
            Ok(())
        } else {
            Err(Error::ChannelUnavailable("peer has gone away".to_string()))
        }
    }
}
