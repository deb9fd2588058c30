//! Unsolicited inbound traffic that resolves nothing.

use crate::ipc::Message;

/// Something the dispatcher could not route.
///
/// Always logged. Delivered to the diagnostics channel when one is attached
/// with [`ProxyBuilder::diagnostics`](crate::ProxyBuilder::diagnostics).
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// A message whose type tag or shape is not part of the protocol.
    UnknownMessage(Message),
    /// A call-shaped message with no reverse-call handler, or reusing an id
    /// that is pending on this side.
    UnexpectedCall { id: String, kind: String },
}

impl Diagnostic {
    pub(crate) fn log(&self) {
        match self {
            Diagnostic::UnknownMessage(message) => {
                tracing::warn!(id = %message.id, kind = %message.kind, "ignoring unknown message from worker");
            }
            Diagnostic::UnexpectedCall { id, kind } => {
                tracing::warn!(%id, %kind, "ignoring unexpected call from worker");
            }
        }
    }
}
