//! Sync round state machine
//!
//! One round moves `Idle → SelectingPeers → Exchanging → Reconciling → Idle`.
//! A round in which any exchange failed passes through `Backoff` on its way
//! from `Exchanging` to `Reconciling`.

use std::collections::VecDeque;

use crate::unix_millis;

/// Phase of the current sync round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    Idle,
    SelectingPeers,
    Exchanging,
    Reconciling,
    /// Failed peers are being scheduled for retry
    Backoff,
}

impl SyncState {
    fn allows(&self, next: SyncState) -> bool {
        use SyncState::*;
        matches!(
            (self, next),
            (Idle, SelectingPeers)
                | (SelectingPeers, Exchanging)
                | (SelectingPeers, Idle)
                | (Exchanging, Reconciling)
                | (Exchanging, Backoff)
                | (Backoff, Reconciling)
                | (Reconciling, Idle)
        )
    }
}

/// Record of a state transition
#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub from: SyncState,
    pub to: SyncState,
    pub timestamp: u64,
}

/// Tracks the phase of sync rounds and keeps a short history
pub struct RoundStateMachine {
    current: SyncState,
    history: VecDeque<TransitionRecord>,
    max_history: usize,
    rounds_completed: u64,
}

impl Default for RoundStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundStateMachine {
    pub fn new() -> Self {
        Self {
            current: SyncState::Idle,
            history: VecDeque::with_capacity(64),
            max_history: 64,
            rounds_completed: 0,
        }
    }

    pub fn current_state(&self) -> SyncState {
        self.current
    }

    /// Move to `next`. Returns false and stays put on an illegal transition.
    pub fn transition(&mut self, next: SyncState) -> bool {
        if !self.current.allows(next) {
            return false;
        }

        self.history.push_back(TransitionRecord {
            from: self.current,
            to: next,
            timestamp: unix_millis(),
        });
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }

        if next == SyncState::Idle && self.current != SyncState::SelectingPeers {
            self.rounds_completed += 1;
        }
        self.current = next;
        true
    }

    pub fn history(&self) -> &VecDeque<TransitionRecord> {
        &self.history
    }

    /// Rounds that reached reconciliation
    pub fn rounds_completed(&self) -> u64 {
        self.rounds_completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_round() {
        let mut machine = RoundStateMachine::new();
        for state in [
            SyncState::SelectingPeers,
            SyncState::Exchanging,
            SyncState::Reconciling,
            SyncState::Idle,
        ] {
            assert!(machine.transition(state));
        }
        assert_eq!(machine.rounds_completed(), 1);
        assert_eq!(machine.history().len(), 4);
    }

    #[test]
    fn test_backoff_only_from_exchanging() {
        let mut machine = RoundStateMachine::new();
        assert!(!machine.transition(SyncState::Backoff));

        machine.transition(SyncState::SelectingPeers);
        machine.transition(SyncState::Exchanging);
        assert!(machine.transition(SyncState::Backoff));
        assert!(machine.transition(SyncState::Reconciling));
        assert!(machine.transition(SyncState::Idle));
    }

    #[test]
    fn test_illegal_transition_keeps_state() {
        let mut machine = RoundStateMachine::new();
        assert!(!machine.transition(SyncState::Reconciling));
        assert_eq!(machine.current_state(), SyncState::Idle);
    }

    #[test]
    fn test_no_peers_round_does_not_count() {
        let mut machine = RoundStateMachine::new();
        machine.transition(SyncState::SelectingPeers);
        assert!(machine.transition(SyncState::Idle));
        assert_eq!(machine.rounds_completed(), 0);
    }
}
