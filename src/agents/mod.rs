//! Agent lifecycle: one state-machine actor per connected agent, plus the
//! supervisor that starts, stops, and looks them up.

pub mod state_machine;
pub mod supervisor;

pub use state_machine::{AgentCommand, AgentStateMachine};
pub use supervisor::AgentSupervisor;

use std::sync::Weak;

use tokio::sync::mpsc;

use crate::session::SessionHandle;

/// Supervisor-held handle to one running agent actor.
///
/// The session reference is weak: the transport driver owns the session, and
/// a dropped connection must never be kept alive from the hub side.
#[derive(Clone)]
pub struct AgentHandle {
    pub agent_id: String,
    pub cmd_tx: mpsc::UnboundedSender<AgentCommand>,
    pub session: Weak<dyn SessionHandle>,
}

impl AgentHandle {
    /// Whether the actor is still running behind a live session.
    pub fn is_live(&self) -> bool {
        !self.cmd_tx.is_closed()
            && self
                .session
                .upgrade()
                .map(|s| s.is_open())
                .unwrap_or(false)
    }
}
