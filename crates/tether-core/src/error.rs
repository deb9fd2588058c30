//! Error types for tether-core.

use std::time::Duration;

use thiserror::Error;

/// Result type for tether-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to the worker.
#[derive(Debug, Error)]
pub enum Error {
    /// No worker channel is present, or the restart budget is exhausted.
    #[error("worker channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// The worker did not acknowledge `init` in time.
    #[error("worker initialization timed out after {0:?}")]
    InitializationTimeout(Duration),

    /// No response arrived within the call category's timeout.
    #[error("Worker request timeout")]
    RequestTimeout {
        /// Call type that timed out.
        call_type: String,
        /// Timeout that elapsed.
        after: Duration,
    },

    /// The worker answered with `success: false`.
    #[error("worker reported error: {0}")]
    WorkerReported(String),

    /// Transport-level error or unexpected worker exit.
    #[error("worker channel crashed: {0}")]
    ChannelCrash(String),

    /// A local reverse-call handler failed.
    #[error("reverse call handler failed: {0}")]
    ReverseHandler(String),

    /// Malformed frame or message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Lifecycle state machine refused a transition.
    #[error("illegal lifecycle transition from {from} to {to}")]
    IllegalTransition {
        from: &'static str,
        to: &'static str,
    },
}

impl Error {
    /// Render the error together with a recovery hint for terminal output.
    pub fn with_hint(&self) -> String {
        let hint = match self {
            Error::ChannelUnavailable(_) => {
                Some("the worker is down; restart the host or check the worker's stderr for the crash cause")
            }
            Error::InitializationTimeout(_) => {
                Some("the worker started but never acknowledged init; is TETHER_WORKER_PATH pointing at a tether worker?")
            }
            Error::RequestTimeout { .. } => {
                Some("the worker may still be busy; raise the timeout with --request-timeout")
            }
            Error::ChannelCrash(_) => Some("run with -v to see the worker's exit status"),
            _ => None,
        };

        match hint {
            Some(hint) => format!("{}\n  hint: {}", self, hint),
            None => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_timeout_message() {
        let err = Error::RequestTimeout {
            call_type: "downloadModel".to_string(),
            after: Duration::from_secs(600),
        };
        assert_eq!(err.to_string(), "Worker request timeout");
    }

    #[test]
    fn test_hint_only_for_actionable_errors() {
        let err = Error::ChannelUnavailable("restart budget exhausted".to_string());
        assert!(err.with_hint().contains("hint:"));

        let err = Error::WorkerReported("model not found".to_string());
        assert_eq!(err.with_hint(), "worker reported error: model not found");
    }
}
