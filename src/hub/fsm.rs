//! Process-wide hub state machine record.
//!
//! Holds the current state, the previous one, and a bounded ring of
//! transitions. Predicates live in the hub loop; this type only enforces
//! the record-keeping: every change lands in the history with its reason.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::FSM_HISTORY_LIMIT;
use crate::models::now_ms;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HubState {
    Resting,
    Executing,
    Improving,
    Contemplating,
    Healing,
}

impl HubState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HubState::Resting => "resting",
            HubState::Executing => "executing",
            HubState::Improving => "improving",
            HubState::Contemplating => "contemplating",
            HubState::Healing => "healing",
        }
    }
}

impl fmt::Display for HubState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub from: HubState,
    pub to: HubState,
    pub reason: String,
    pub timestamp: i64,
}

pub struct HubFsm {
    state: HubState,
    previous: Option<HubState>,
    since: i64,
    paused: bool,
    history: VecDeque<Transition>,
}

impl HubFsm {
    pub fn new() -> Self {
        Self {
            state: HubState::Resting,
            previous: None,
            since: now_ms(),
            paused: false,
            history: VecDeque::with_capacity(FSM_HISTORY_LIMIT),
        }
    }

    pub fn state(&self) -> HubState {
        self.state
    }

    pub fn previous(&self) -> Option<HubState> {
        self.previous
    }

    pub fn since(&self) -> i64 {
        self.since
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    /// Pausing disables autonomous transitions; external submissions still
    /// queue and a critical health signal still forces healing.
    pub fn set_paused(&mut self, paused: bool) {
        tracing::info!(paused, "hub fsm pause flag changed");
        self.paused = paused;
    }

    /// Records a transition. A no-op when already in `to`.
    pub fn transition(&mut self, to: HubState, reason: &str) {
        if self.state == to {
            return;
        }
        tracing::info!(from = %self.state, %to, %reason, "hub transition");
        self.record(to, reason);
    }

    /// Transition that applies even while paused (healing preemption).
    pub fn force(&mut self, to: HubState, reason: &str) {
        if self.state == to {
            return;
        }
        tracing::warn!(from = %self.state, %to, %reason, "hub forced transition");
        self.record(to, reason);
    }

    fn record(&mut self, to: HubState, reason: &str) {
        let transition = Transition {
            from: self.state,
            to,
            reason: reason.to_string(),
            timestamp: now_ms(),
        };
        self.previous = Some(self.state);
        self.state = to;
        self.since = transition.timestamp;

        if self.history.len() == FSM_HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(transition);
    }

    pub fn history(&self) -> Vec<Transition> {
        self.history.iter().cloned().collect()
    }
}

impl Default for HubFsm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_record_history_with_reasons() {
        let mut fsm = HubFsm::new();
        assert_eq!(fsm.state(), HubState::Resting);

        fsm.transition(HubState::Executing, "pending goals");
        fsm.transition(HubState::Resting, "backlog drained");

        assert_eq!(fsm.state(), HubState::Resting);
        assert_eq!(fsm.previous(), Some(HubState::Executing));
        let history = fsm.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].reason, "pending goals");
        assert_eq!(history[1].from, HubState::Executing);
    }

    #[test]
    fn self_transition_is_a_no_op() {
        let mut fsm = HubFsm::new();
        fsm.transition(HubState::Resting, "still resting");
        assert!(fsm.history().is_empty());
    }

    #[test]
    fn history_ring_is_bounded() {
        let mut fsm = HubFsm::new();
        for i in 0..(FSM_HISTORY_LIMIT + 20) {
            let to = if i % 2 == 0 {
                HubState::Executing
            } else {
                HubState::Resting
            };
            fsm.transition(to, &format!("cycle {i}"));
        }
        assert_eq!(fsm.history().len(), FSM_HISTORY_LIMIT);
    }
}
