//! Call correlation, streaming and reverse calls.

mod bridge;
mod operation;
mod stream;
pub(crate) mod tables;

pub use bridge::{
    HandlerError, HandlerFuture, ReverseCallBridge, StaticToolRegistry, ToolDescriptor,
    ToolRegistry,
};
pub use operation::{CallCategory, Operation};
pub use stream::ResponseStream;
