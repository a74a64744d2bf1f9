//! Settlement lifecycle states

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a settlement container
///
/// `Created → Activated → VerifyingCounterparty → ReadyToAccept → Signing →
/// Completed`. `Failed` and `Cancelled` are reachable from every non-terminal
/// state. Terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SettlementState {
    Created,
    Activated,
    VerifyingCounterparty,
    ReadyToAccept,
    Signing,
    Completed,
    Failed,
    Cancelled,
}

impl SettlementState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SettlementState::Completed | SettlementState::Failed | SettlementState::Cancelled
        )
    }

    /// Whether the settlement timer applies
    pub fn is_timed(self) -> bool {
        matches!(
            self,
            SettlementState::Activated | SettlementState::VerifyingCounterparty | SettlementState::ReadyToAccept
        )
    }

    /// Whether `next` is a legal successor of `self`
    pub fn can_move_to(self, next: SettlementState) -> bool {
        use SettlementState::*;
        if self.is_terminal() {
            return false;
        }
        match next {
            Failed | Cancelled => true,
            Activated => self == Created,
            VerifyingCounterparty => self == Activated,
            ReadyToAccept => self == VerifyingCounterparty,
            Signing => self == ReadyToAccept,
            Completed => self == Signing,
            Created => false,
        }
    }
}

impl fmt::Display for SettlementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::SettlementState::*;

    #[test]
    fn test_transitions() {
        assert!(Created.can_move_to(Activated));
        assert!(!Created.can_move_to(ReadyToAccept));
        assert!(Signing.can_move_to(Cancelled));
        assert!(!Completed.can_move_to(Failed));
        assert!(!Cancelled.can_move_to(Cancelled));
        assert!(ReadyToAccept.is_timed());
        assert!(!Signing.is_timed());
    }
}
