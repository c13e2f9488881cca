//! # AgentCom
//!
//! AgentCom is a central hub that coordinates a fleet of long-running
//! worker agents connected over persistent bidirectional sessions. It
//! routes tasks and inter-agent messages, and drives an autonomous loop
//! that decomposes high-level goals into tasks, dispatches them, and
//! verifies their completion.
//!
//! ## Architecture
//!
//! - **Durable store**: typed crash-safe tables with backups, compaction,
//!   and corruption recovery
//! - **Task queue + scheduler**: priority lanes, capability matching,
//!   generation counters, stuck-task recovery
//! - **Agent lifecycle**: one state-machine actor per connected session,
//!   supervised with a temporary restart policy
//! - **Hub FSM**: resting / executing / improving / contemplating /
//!   healing, gated by a cost ledger
//! - **Goal orchestrator**: LLM-driven decomposition and verification
//!
//! The WebSocket/HTTP wire itself lives outside the core; the hub exposes
//! the session gateway and typed frames that transport drivers consume.

/// Per-agent state machines and their supervisor
pub mod agents;
/// HTTP control surface
pub mod api;
/// System configuration
pub mod config;
/// System-wide constants
pub mod constants;
/// Error types and handling
pub mod error;
/// Internal event bus
pub mod events;
/// Goal orchestration
pub mod goals;
/// Health aggregation and healing history
pub mod health;
/// Hub state machine and component aggregate
pub mod hub;
/// Cost ledger for external invocations
pub mod ledger;
/// LLM transport and circuit breaker
pub mod llm;
/// Message router and durable mailbox
pub mod messaging;
/// Core data models
pub mod models;
/// Connected-agent presence index
pub mod presence;
/// Agent session wire frames
pub mod protocol;
/// Durable task queue
pub mod queue;
/// Per-identity rate limiting
pub mod rate_limit;
/// Event-driven task scheduler
pub mod scheduler;
/// Session handles
pub mod session;
/// Durable small-record store
pub mod store;
/// Agent bearer tokens
pub mod tokens;
/// Inbound frame validation
pub mod validation;

#[cfg(test)]
mod tests;

pub use error::{HubError, Result};
