//! Internal publish/subscribe bus.
//!
//! Components publish lifecycle events here instead of holding references to
//! each other; the scheduler, goal orchestrator, and hub FSM subscribe. The
//! bus is a `tokio::sync::broadcast` channel: slow subscribers lose old
//! events rather than blocking publishers, which is acceptable because every
//! consumer also has a periodic safety sweep.

use tokio::sync::broadcast;
use tracing::debug;

const BUS_CAPACITY: usize = 1024;

/// Closed sum of hub lifecycle events.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    TaskSubmitted { task_id: String },
    TaskAssigned { task_id: String, agent_id: String, generation: u64 },
    TaskReclaimed { task_id: String, generation: u64 },
    TaskRetried { task_id: String, generation: u64 },
    TaskCompleted { task_id: String },
    TaskDeadLetter { task_id: String },
    AgentJoined { agent_id: String },
    AgentIdle { agent_id: String },
    AgentLeft { agent_id: String },
    GoalSubmitted { goal_id: String },
    GoalFinished { goal_id: String },
    CorruptionDetected { table: String, reason: String },
    /// Recovery could not restore the table; it is running empty.
    TableDegraded { table: String },
    HealthCritical { reason: String },
    BudgetExhausted { state: String },
}

impl HubEvent {
    /// Events that open a scheduling window. `TaskAssigned` is deliberately
    /// excluded (would loop) as is `TaskDeadLetter` (nothing to schedule).
    pub fn triggers_scheduling(&self) -> bool {
        matches!(
            self,
            HubEvent::TaskSubmitted { .. }
                | HubEvent::TaskReclaimed { .. }
                | HubEvent::TaskRetried { .. }
                | HubEvent::TaskCompleted { .. }
                | HubEvent::AgentJoined { .. }
                | HubEvent::AgentIdle { .. }
        )
    }
}

/// Handle for publishing to and subscribing on the bus. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<HubEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publishes an event. A bus with no live subscribers drops the event,
    /// which is fine: nothing to notify.
    pub fn publish(&self, event: HubEvent) {
        debug!(?event, "bus publish");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
