//! Per-agent state machine.
//!
//! One actor per connected agent, pinned to that agent's session. The actor
//! owns the agent's lifecycle state and processes commands one at a time;
//! every state change pushes a snapshot to the presence cache. Task-state
//! authority stays with the task queue: the actor forwards acknowledgments
//! and lets the queue's generation check decide staleness.
//!
//! ```text
//! offline → idle        connect + authenticated
//! idle → assigned       task pushed
//! assigned → working    agent acknowledges
//! assigned → idle       acceptance timeout (flag unresponsive, reclaim)
//! working → idle        task_complete
//! working → blocked     task_failed non-retryable
//! blocked → idle        operator clears block
//! any → offline         session drop (reclaim current task)
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, info, warn};

use crate::events::{EventBus, HubEvent};
use crate::models::{now_ms, AgentFsmState, AgentSnapshot, Task};
use crate::presence::PresenceCache;
use crate::protocol::OutboundFrame;
use crate::queue::{FailOutcome, TaskQueue};
use crate::session::SessionHandle;
use crate::HubError;

/// Advisory flag set when an agent misses an acceptance window.
pub const FLAG_UNRESPONSIVE: &str = "unresponsive";

/// Commands processed by the agent actor, one at a time.
#[derive(Debug)]
pub enum AgentCommand {
    /// Scheduler matched a task to this agent; the queue record is already
    /// assigned and generation-stamped.
    PushTask { task: Task },
    Accepted {
        task_id: String,
        generation: u64,
    },
    Completed {
        task_id: String,
        generation: u64,
        result: serde_json::Value,
    },
    Failed {
        task_id: String,
        generation: u64,
        reason: String,
    },
    Heartbeat,
    /// Operator or hub clears a blocked agent back to idle.
    ClearBlock,
    /// One-shot notification from the transport driver.
    SessionClosed,
    /// Supervisor-initiated shutdown (restart or replacement).
    Stop,
    Snapshot(oneshot::Sender<AgentSnapshot>),
}

pub struct AgentStateMachine {
    agent_id: String,
    name: String,
    capabilities: HashSet<String>,
    state: AgentFsmState,
    current_task_id: Option<String>,
    current_generation: u64,
    flags: HashSet<String>,
    connected_at: i64,
    acceptance_deadline: Option<Instant>,
    acceptance_timeout: Duration,

    session: Weak<dyn SessionHandle>,
    queue: Arc<TaskQueue>,
    presence: PresenceCache,
    bus: EventBus,
}

impl AgentStateMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_id: String,
        name: String,
        capabilities: HashSet<String>,
        session: Weak<dyn SessionHandle>,
        queue: Arc<TaskQueue>,
        presence: PresenceCache,
        bus: EventBus,
        acceptance_timeout_ms: u64,
    ) -> Self {
        Self {
            agent_id,
            name,
            capabilities,
            state: AgentFsmState::Idle,
            current_task_id: None,
            current_generation: 0,
            flags: HashSet::new(),
            connected_at: now_ms(),
            acceptance_deadline: None,
            acceptance_timeout: Duration::from_millis(acceptance_timeout_ms),
            session,
            queue,
            presence,
            bus,
        }
    }

    /// Actor loop. Runs until the session drops or the supervisor stops it;
    /// the supervisor removes the handle once this returns.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<AgentCommand>) {
        info!(agent_id = %self.agent_id, "agent connected");
        self.publish_snapshot().await;
        self.bus.publish(HubEvent::AgentJoined {
            agent_id: self.agent_id.clone(),
        });

        loop {
            let deadline = self.acceptance_deadline;
            let cmd = tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
                _ = async {
                    match deadline {
                        Some(at) => sleep_until(at).await,
                        // Never resolves while no timer is armed.
                        None => std::future::pending().await,
                    }
                } => {
                    self.on_acceptance_timeout().await;
                    continue;
                }
            };

            match cmd {
                AgentCommand::PushTask { task } => self.on_push_task(task).await,
                AgentCommand::Accepted { task_id, generation } => {
                    self.on_accepted(&task_id, generation).await
                }
                AgentCommand::Completed {
                    task_id,
                    generation,
                    result,
                } => self.on_completed(&task_id, generation, result).await,
                AgentCommand::Failed {
                    task_id,
                    generation,
                    reason,
                } => self.on_failed(&task_id, generation, &reason).await,
                AgentCommand::Heartbeat => self.presence.touch(&self.agent_id).await,
                AgentCommand::ClearBlock => self.on_clear_block().await,
                AgentCommand::Snapshot(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                AgentCommand::SessionClosed | AgentCommand::Stop => break,
            }
        }

        self.go_offline().await;
    }

    fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            agent_id: self.agent_id.clone(),
            name: self.name.clone(),
            capabilities: self.capabilities.clone(),
            fsm_state: self.state,
            current_task_id: self.current_task_id.clone(),
            flags: self.flags.clone(),
            connected_at: self.connected_at,
            last_seen: now_ms(),
        }
    }

    async fn publish_snapshot(&self) {
        self.presence.update(self.snapshot()).await;
    }

    async fn on_push_task(&mut self, task: Task) {
        if self.state != AgentFsmState::Idle {
            // The queue already stamped this assignment; hand it back rather
            // than holding two tasks.
            warn!(
                agent_id = %self.agent_id,
                task_id = %task.id,
                state = %self.state,
                "push refused in non-idle state, reclaiming"
            );
            let _ = self
                .queue
                .reclaim_from(&task.id, &self.agent_id, task.generation)
                .await;
            return;
        }

        let frame = OutboundFrame::PushTask {
            task_id: task.id.clone(),
            description: task.description.clone(),
            generation: task.generation,
            metadata: task.metadata.clone(),
            needed_capabilities: task.needed_capabilities.clone(),
            verification_steps: task.verification_steps.clone(),
            wake_command: task.metadata.get("wake_command").cloned(),
        };

        let Some(session) = self.session.upgrade() else {
            let _ = self
                .queue
                .reclaim_from(&task.id, &self.agent_id, task.generation)
                .await;
            self.bus.publish(HubEvent::AgentLeft {
                agent_id: self.agent_id.clone(),
            });
            return;
        };
        if let Err(e) = session.send(frame).await {
            warn!(agent_id = %self.agent_id, "push delivery failed: {e}");
            let _ = self
                .queue
                .reclaim_from(&task.id, &self.agent_id, task.generation)
                .await;
            return;
        }

        self.state = AgentFsmState::Assigned;
        self.current_task_id = Some(task.id.clone());
        self.current_generation = task.generation;
        self.acceptance_deadline = Some(Instant::now() + self.acceptance_timeout);
        self.publish_snapshot().await;
        debug!(agent_id = %self.agent_id, task_id = %task.id, "task pushed");
    }

    async fn on_accepted(&mut self, task_id: &str, generation: u64) {
        match self.queue.mark_working(task_id, &self.agent_id, generation).await {
            Ok(_) => {
                if self.current_task_id.as_deref() == Some(task_id) {
                    self.state = AgentFsmState::Working;
                    self.acceptance_deadline = None;
                    self.publish_snapshot().await;
                }
            }
            Err(HubError::StaleGeneration { .. }) => {
                info!(agent_id = %self.agent_id, %task_id, "stale acceptance discarded");
            }
            Err(e) => {
                debug!(agent_id = %self.agent_id, %task_id, "acceptance rejected: {e}");
            }
        }
    }

    async fn on_completed(&mut self, task_id: &str, generation: u64, result: serde_json::Value) {
        match self.queue.complete(task_id, generation, result).await {
            Ok(_) => {
                if self.current_task_id.as_deref() == Some(task_id) {
                    self.clear_task_to_idle().await;
                }
            }
            Err(HubError::StaleGeneration { .. }) => {
                info!(agent_id = %self.agent_id, %task_id, "stale completion discarded");
            }
            Err(e) => {
                debug!(agent_id = %self.agent_id, %task_id, "completion rejected: {e}");
            }
        }
    }

    async fn on_failed(&mut self, task_id: &str, generation: u64, reason: &str) {
        match self.queue.fail(task_id, generation, reason).await {
            Ok(outcome) => {
                if self.current_task_id.as_deref() == Some(task_id) {
                    match outcome {
                        FailOutcome::Retried => self.clear_task_to_idle().await,
                        FailOutcome::DeadLettered => {
                            // Non-retryable failure parks the agent until an
                            // operator clears it.
                            self.current_task_id = None;
                            self.current_generation = 0;
                            self.acceptance_deadline = None;
                            self.state = AgentFsmState::Blocked;
                            self.publish_snapshot().await;
                        }
                    }
                }
            }
            Err(HubError::StaleGeneration { .. }) => {
                info!(agent_id = %self.agent_id, %task_id, "stale failure discarded");
            }
            Err(e) => {
                debug!(agent_id = %self.agent_id, %task_id, "failure report rejected: {e}");
            }
        }
    }

    async fn on_acceptance_timeout(&mut self) {
        let Some(task_id) = self.current_task_id.clone() else {
            self.acceptance_deadline = None;
            return;
        };
        warn!(
            agent_id = %self.agent_id,
            %task_id,
            "acceptance timeout, reclaiming task and flagging agent"
        );
        let _ = self
            .queue
            .reclaim_from(&task_id, &self.agent_id, self.current_generation)
            .await;
        self.flags.insert(FLAG_UNRESPONSIVE.to_string());
        self.clear_task_to_idle().await;
    }

    async fn on_clear_block(&mut self) {
        if self.state == AgentFsmState::Blocked {
            self.state = AgentFsmState::Idle;
            self.publish_snapshot().await;
            self.bus.publish(HubEvent::AgentIdle {
                agent_id: self.agent_id.clone(),
            });
        }
    }

    async fn clear_task_to_idle(&mut self) {
        self.current_task_id = None;
        self.current_generation = 0;
        self.acceptance_deadline = None;
        self.state = AgentFsmState::Idle;
        self.publish_snapshot().await;
        self.bus.publish(HubEvent::AgentIdle {
            agent_id: self.agent_id.clone(),
        });
    }

    /// Terminal transition: reclaim any held task exactly once, drop out of
    /// presence, announce departure.
    async fn go_offline(&mut self) {
        if let Some(task_id) = self.current_task_id.take() {
            let _ = self
                .queue
                .reclaim_from(&task_id, &self.agent_id, self.current_generation)
                .await;
        }
        self.state = AgentFsmState::Offline;
        self.presence.remove(&self.agent_id).await;
        self.bus.publish(HubEvent::AgentLeft {
            agent_id: self.agent_id.clone(),
        });
        info!(agent_id = %self.agent_id, "agent offline");
    }
}
