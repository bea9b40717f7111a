//! Task status state machine.
//!
//! Enforces the allowed transition graph. Terminal states are absorbing;
//! an operator force update is the only escape hatch and is recorded in
//! the event detail by the caller.

use crate::models::TaskStatus;

/// The task status state machine.
///
/// ```text
/// requested,pending -> approved | queued | running | blocked | cancelled | failed
/// approved          -> queued | running | blocked | cancelled | failed
/// queued            -> queued | running | blocked | cancelled | failed | expired
/// running           -> running | succeeded | failed | blocked | cancelled | expired
/// blocked           -> approved | queued | running | succeeded | failed | cancelled | expired
/// ```
pub struct StatusMachine;

impl StatusMachine {
    /// Check whether `from -> to` is a valid edge in the transition graph.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match from {
            Requested | Pending => {
                matches!(to, Approved | Queued | Running | Blocked | Cancelled | Failed)
            }
            Approved => matches!(to, Queued | Running | Blocked | Cancelled | Failed),
            Queued => matches!(to, Queued | Running | Blocked | Cancelled | Failed | Expired),
            Running => matches!(to, Running | Succeeded | Failed | Blocked | Cancelled | Expired),
            Blocked => matches!(
                to,
                Approved | Queued | Running | Succeeded | Failed | Cancelled | Expired
            ),
            // Terminal states accept nothing without force.
            Succeeded | Failed | Cancelled | Expired => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskStatus::*;

    #[test]
    fn pending_cannot_jump_to_succeeded() {
        assert!(!StatusMachine::is_valid_transition(Pending, Succeeded));
    }

    #[test]
    fn pending_to_blocked_and_back_is_one_way() {
        assert!(StatusMachine::is_valid_transition(Pending, Blocked));
        assert!(!StatusMachine::is_valid_transition(Blocked, Pending));
    }

    #[test]
    fn blocked_can_complete() {
        assert!(StatusMachine::is_valid_transition(Blocked, Succeeded));
        assert!(StatusMachine::is_valid_transition(Blocked, Queued));
        assert!(StatusMachine::is_valid_transition(Blocked, Approved));
    }

    #[test]
    fn terminal_states_are_absorbing() {
        for terminal in [Succeeded, Failed, Cancelled, Expired] {
            for target in [
                Requested, Pending, Approved, Queued, Running, Blocked, Succeeded, Failed,
                Cancelled, Expired,
            ] {
                assert!(
                    !StatusMachine::is_valid_transition(terminal, target),
                    "{terminal} -> {target} should be rejected"
                );
            }
        }
    }

    #[test]
    fn self_loops_only_where_declared() {
        assert!(StatusMachine::is_valid_transition(Queued, Queued));
        assert!(StatusMachine::is_valid_transition(Running, Running));
        assert!(!StatusMachine::is_valid_transition(Pending, Pending));
        assert!(!StatusMachine::is_valid_transition(Blocked, Blocked));
    }

    #[test]
    fn running_reaches_all_terminals_except_nothing() {
        assert!(StatusMachine::is_valid_transition(Running, Succeeded));
        assert!(StatusMachine::is_valid_transition(Running, Failed));
        assert!(StatusMachine::is_valid_transition(Running, Cancelled));
        assert!(StatusMachine::is_valid_transition(Running, Expired));
    }
}
