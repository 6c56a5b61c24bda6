use std::fmt;
use std::sync::Arc;

use blogmesh_store::LogHandle;

/// Replication state of one log address.
///
/// ```text
/// Unopened -> Opening -> Open -> (Joined <-> Updated) -> Closed
///                |
///                +-- open failed --> Unopened (retried on the next trigger)
/// ```
///
/// `Closed` is terminal and only reached on shutdown.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LogState {
    Unopened,
    Opening,
    Open,
    Joined,
    Updated,
    Closed,
}

impl LogState {
    /// Open and replicating.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Open | Self::Joined | Self::Updated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unopened => "unopened",
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Joined => "joined",
            Self::Updated => "updated",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for LogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of asking the tracker to open an address.
#[derive(Clone)]
pub enum OpenOutcome {
    /// This call opened the log.
    Opened(Arc<dyn LogHandle>),
    /// The address was already replicated, or another caller's open of it
    /// finished first. Carries the handle that open produced.
    AlreadyTracked(LogState, Arc<dyn LogHandle>),
    /// The tracker no longer accepts opens.
    ShuttingDown,
}

impl OpenOutcome {
    pub fn is_opened(&self) -> bool {
        matches!(self, Self::Opened(_))
    }

    pub fn handle(&self) -> Option<&Arc<dyn LogHandle>> {
        match self {
            Self::Opened(handle) | Self::AlreadyTracked(_, handle) => Some(handle),
            Self::ShuttingDown => None,
        }
    }
}

impl fmt::Debug for OpenOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opened(handle) => f.debug_tuple("Opened").field(handle.address()).finish(),
            Self::AlreadyTracked(state, handle) => f
                .debug_tuple("AlreadyTracked")
                .field(state)
                .field(handle.address())
                .finish(),
            Self::ShuttingDown => f.write_str("ShuttingDown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_states() {
        assert!(!LogState::Unopened.is_active());
        assert!(!LogState::Opening.is_active());
        assert!(LogState::Open.is_active());
        assert!(LogState::Joined.is_active());
        assert!(LogState::Updated.is_active());
        assert!(!LogState::Closed.is_active());
    }
}
