//! Agent supervisor: keyed map of running state-machine actors.
//!
//! Restart policy is temporary: an actor that terminates is not restarted,
//! because its session is gone; a reconnect creates a fresh one.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{info, warn};

use crate::agents::{AgentCommand, AgentHandle, AgentStateMachine};
use crate::events::EventBus;
use crate::models::AgentSnapshot;
use crate::presence::PresenceCache;
use crate::queue::TaskQueue;
use crate::session::SessionHandle;
use crate::{HubError, Result};

pub struct AgentSupervisor {
    agents: Arc<RwLock<HashMap<String, AgentHandle>>>,
    queue: Arc<TaskQueue>,
    presence: PresenceCache,
    bus: EventBus,
    acceptance_timeout_ms: u64,
}

impl AgentSupervisor {
    pub fn new(
        queue: Arc<TaskQueue>,
        presence: PresenceCache,
        bus: EventBus,
        acceptance_timeout_ms: u64,
    ) -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            queue,
            presence,
            bus,
            acceptance_timeout_ms,
        }
    }

    /// Starts a state machine for a freshly authenticated agent.
    ///
    /// Fails if a live actor already holds the id. A stale one (dead channel
    /// or closed session, e.g. a half-dead connection the agent is
    /// reconnecting over) is stopped and replaced.
    pub async fn start(
        &self,
        agent_id: &str,
        name: &str,
        capabilities: std::collections::HashSet<String>,
        session: Weak<dyn SessionHandle>,
    ) -> Result<()> {
        let stale = {
            let mut agents = self.agents.write().await;
            match agents.get(agent_id) {
                Some(existing) if existing.is_live() => {
                    return Err(HubError::Agent {
                        message: format!("agent {agent_id} is already connected"),
                    });
                }
                Some(_) => agents.remove(agent_id),
                None => None,
            }
        };
        if let Some(stale) = stale {
            // Wait for the stale actor to finish its offline teardown so it
            // cannot race the replacement's presence entry.
            warn!(%agent_id, "replacing stale agent actor");
            let _ = stale.cmd_tx.send(AgentCommand::Stop);
            for _ in 0..500 {
                if stale.cmd_tx.is_closed() {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let actor = AgentStateMachine::new(
            agent_id.to_string(),
            name.to_string(),
            capabilities,
            session.clone(),
            self.queue.clone(),
            self.presence.clone(),
            self.bus.clone(),
            self.acceptance_timeout_ms,
        );

        let handle = AgentHandle {
            agent_id: agent_id.to_string(),
            cmd_tx,
            session,
        };
        {
            let mut agents = self.agents.write().await;
            agents.insert(agent_id.to_string(), handle);
        }

        // The actor removes its own map entry when it exits, so a dead agent
        // never lingers in lookups.
        let agents = self.agents.clone();
        let id = agent_id.to_string();
        tokio::spawn(async move {
            actor.run(cmd_rx).await;
            let mut agents = agents.write().await;
            if agents
                .get(&id)
                .map(|h| h.cmd_tx.is_closed())
                .unwrap_or(false)
            {
                agents.remove(&id);
            }
        });

        info!(%agent_id, "agent actor started");
        Ok(())
    }

    /// Stops the actor for `agent_id`. Idempotent.
    pub async fn stop(&self, agent_id: &str) {
        let handle = {
            let mut agents = self.agents.write().await;
            agents.remove(agent_id)
        };
        if let Some(handle) = handle {
            let _ = handle.cmd_tx.send(AgentCommand::Stop);
        }
    }

    pub async fn lookup(&self, agent_id: &str) -> Option<AgentHandle> {
        let agents = self.agents.read().await;
        agents.get(agent_id).cloned()
    }

    /// Sends a command to a running actor.
    pub async fn send(&self, agent_id: &str, cmd: AgentCommand) -> Result<()> {
        let handle = self
            .lookup(agent_id)
            .await
            .ok_or_else(|| HubError::NotFound(format!("agent {agent_id}")))?;
        handle
            .cmd_tx
            .send(cmd)
            .map_err(|_| HubError::Agent {
                message: format!("agent {agent_id} actor has terminated"),
            })
    }

    /// Snapshot of one agent, straight from its actor.
    pub async fn snapshot(&self, agent_id: &str) -> Option<AgentSnapshot> {
        let handle = self.lookup(agent_id).await?;
        let (tx, rx) = oneshot::channel();
        handle.cmd_tx.send(AgentCommand::Snapshot(tx)).ok()?;
        rx.await.ok()
    }

    /// Presence snapshots of every connected agent.
    pub async fn list_all(&self) -> Vec<AgentSnapshot> {
        self.presence.list().await
    }
}
