//! Worker lifecycle state machine.
//!
//! ```text
//! Uninitialized -> Initializing -> Ready -> Crashed -> Initializing
//!                        |                     |
//!                        +-----> Crashed       +-> (stays down)
//! any state except Terminated -> Terminated
//! ```

use std::fmt;

use tokio::sync::watch;

use crate::error::{Error, Result};

/// Where the proxy is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed; no channel yet.
    Uninitialized,
    /// A channel exists and `init` is in flight.
    Initializing,
    /// The worker acknowledged `init`.
    Ready,
    /// The channel failed. `restarting` is false once the restart budget is spent.
    Crashed { restarting: bool },
    /// Shut down for good.
    Terminated,
}

impl LifecycleState {
    pub fn name(self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Ready => "ready",
            LifecycleState::Crashed { restarting: true } => "crashed (restarting)",
            LifecycleState::Crashed { restarting: false } => "crashed",
            LifecycleState::Terminated => "terminated",
        }
    }

    /// Whether the machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;

        match (self, next) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (Uninitialized, Initializing) => true,
            (Initializing, Ready) => true,
            (Initializing, Crashed { .. }) | (Ready, Crashed { .. }) => true,
            (Crashed { restarting: true }, Initializing) => true,
            _ => false,
        }
    }

    /// Callers waiting for readiness can stop waiting.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            LifecycleState::Ready
                | LifecycleState::Terminated
                | LifecycleState::Crashed { restarting: false }
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Owner of the current state, observable through a watch channel.
pub(crate) struct Lifecycle {
    state: watch::Sender<LifecycleState>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(LifecycleState::Uninitialized);
        Self { state }
    }

    pub(crate) fn current(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Move to `next`. Illegal transitions are refused, and abort debug builds.
    pub(crate) fn transition(&self, next: LifecycleState) -> Result<()> {
        let mut refused = None;
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                tracing::debug!(from = %current, to = %next, "lifecycle transition");
                *current = next;
                true
            } else {
                refused = Some(Error::IllegalTransition {
                    from: current.name(),
                    to: next.name(),
                });
                false
            }
        });

        match refused {
            None => Ok(()),
            Some(err) => {
                tracing::error!("{}", err);
                debug_assert!(false, "{}", err);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::*;

    #[test]
    fn test_allowed_transitions() {
        assert!(Uninitialized.can_transition_to(Initializing));
        assert!(Initializing.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Crashed { restarting: true }));
        assert!(Crashed { restarting: true }.can_transition_to(Initializing));
        assert!(Ready.can_transition_to(Terminated));
    }

    #[test]
    fn test_refused_transitions() {
        assert!(!Uninitialized.can_transition_to(Ready));
        assert!(!Crashed { restarting: false }.can_transition_to(Initializing));
        assert!(!Ready.can_transition_to(Initializing));
        assert!(!Terminated.can_transition_to(Terminated));
        assert!(!Terminated.can_transition_to(Initializing));
    }

    #[tokio::test]
    async fn test_watchers_see_transitions() {
        let lifecycle = Lifecycle::new();
        let mut rx = lifecycle.subscribe();

        lifecycle.transition(Initializing).unwrap();
        lifecycle.transition(Ready).unwrap();

        let state = *rx.wait_for(|state| state.is_settled()).await.unwrap();
        assert_eq!(state, Ready);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "illegal lifecycle transition from uninitialized to ready")]
    fn test_illegal_transition_is_loud_in_debug() {
        let _ = Lifecycle::new().transition(Ready);
    }
}
