//! In-memory index of currently connected agents.
//!
//! Agent state machines push a snapshot here on every state change; the
//! scheduler and the API read from it. Entries are removed when the state
//! machine terminates, so presence always reflects live sessions only.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::models::{AgentSnapshot, now_ms};

#[derive(Clone, Default)]
pub struct PresenceCache {
    agents: Arc<RwLock<HashMap<String, AgentSnapshot>>>,
}

impl PresenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the snapshot for one agent.
    pub async fn update(&self, snapshot: AgentSnapshot) {
        debug!(agent_id = %snapshot.agent_id, state = %snapshot.fsm_state, "presence update");
        let mut agents = self.agents.write().await;
        agents.insert(snapshot.agent_id.clone(), snapshot);
    }

    pub async fn remove(&self, agent_id: &str) {
        let mut agents = self.agents.write().await;
        agents.remove(agent_id);
    }

    pub async fn get(&self, agent_id: &str) -> Option<AgentSnapshot> {
        let agents = self.agents.read().await;
        agents.get(agent_id).cloned()
    }

    pub async fn list(&self) -> Vec<AgentSnapshot> {
        let agents = self.agents.read().await;
        agents.values().cloned().collect()
    }

    /// Agents currently able to take work.
    pub async fn idle_agents(&self) -> Vec<AgentSnapshot> {
        let agents = self.agents.read().await;
        agents.values().filter(|a| a.is_idle()).cloned().collect()
    }

    /// Refreshes the heartbeat timestamp without a full snapshot push.
    pub async fn touch(&self, agent_id: &str) {
        let mut agents = self.agents.write().await;
        if let Some(snapshot) = agents.get_mut(agent_id) {
            snapshot.last_seen = now_ms();
        }
    }

    /// Agents that have not been heard from since `cutoff` (ms wall clock).
    pub async fn silent_since(&self, cutoff: i64) -> Vec<AgentSnapshot> {
        let agents = self.agents.read().await;
        agents
            .values()
            .filter(|a| a.last_seen < cutoff)
            .cloned()
            .collect()
    }

    pub async fn connected_count(&self) -> usize {
        let agents = self.agents.read().await;
        agents.len()
    }

    /// Connected agents carrying a given flag (e.g. `unresponsive`).
    pub async fn flagged(&self, flag: &str) -> Vec<AgentSnapshot> {
        let agents = self.agents.read().await;
        agents
            .values()
            .filter(|a| a.flags.contains(flag))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentFsmState;
    use std::collections::HashSet;

    fn snapshot(id: &str, state: AgentFsmState) -> AgentSnapshot {
        AgentSnapshot {
            agent_id: id.to_string(),
            name: id.to_string(),
            capabilities: HashSet::new(),
            fsm_state: state,
            current_task_id: None,
            flags: HashSet::new(),
            connected_at: now_ms(),
            last_seen: now_ms(),
        }
    }

    #[tokio::test]
    async fn idle_agents_filters_by_state() {
        let presence = PresenceCache::new();
        presence.update(snapshot("a", AgentFsmState::Idle)).await;
        presence.update(snapshot("b", AgentFsmState::Working)).await;

        let idle = presence.idle_agents().await;
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].agent_id, "a");
    }

    #[tokio::test]
    async fn removal_clears_entry() {
        let presence = PresenceCache::new();
        presence.update(snapshot("a", AgentFsmState::Idle)).await;
        assert_eq!(presence.connected_count().await, 1);

        presence.remove("a").await;
        assert_eq!(presence.connected_count().await, 0);
        assert!(presence.get("a").await.is_none());
    }
}
