//! The hub: process-wide state machine plus the aggregate wiring every
//! component together.
//!
//! [`HubFsm`] gates autonomous behavior: the hub rests until there is work
//! and budget, executes the goal backlog, optionally runs improvement and
//! contemplation cycles, and drops everything to heal on a critical health
//! signal. [`Hub`] owns the component graph and the session gateway that
//! turns validated wire frames into component calls.

mod fsm;

pub use fsm::{HubFsm, HubState, Transition};

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::agents::{AgentCommand, AgentSupervisor};
use crate::config::Config;
use crate::constants::{FSM_TICK_INTERVAL_MS, HEALING_WATCHDOG_MS};
use crate::events::{EventBus, HubEvent};
use crate::goals::GoalOrchestrator;
use crate::health::{HealingRecord, HealthAggregator, HealthInputs, RemediationAction};
use crate::ledger::{BudgetVerdict, CostLedger};
use crate::llm::LlmTransport;
use crate::messaging::MessageRouter;
use crate::models::{normalize_capabilities, now_ms};
use crate::presence::PresenceCache;
use crate::protocol::{InboundFrame, OutboundFrame, ReportDecision};
use crate::queue::TaskQueue;
use crate::rate_limit::RateGate;
use crate::scheduler::Scheduler;
use crate::session::SessionHandle;
use crate::store::{Store, StoreCoordinator};
use crate::tokens::TokenRegistry;
use crate::validation::FrameValidator;
use crate::{HubError, Result};

/// Driver-side state for one connection: which agent (if any) has
/// authenticated over it.
pub struct SessionContext {
    pub session: Arc<dyn SessionHandle>,
    pub agent_id: Option<String>,
}

pub struct Hub {
    pub config: Config,
    pub bus: EventBus,
    pub presence: PresenceCache,
    pub tokens: TokenRegistry,
    pub queue: Arc<TaskQueue>,
    pub supervisor: Arc<AgentSupervisor>,
    pub scheduler: Arc<Scheduler>,
    pub router: Arc<MessageRouter>,
    pub gate: Arc<RateGate>,
    pub validator: FrameValidator,
    pub ledger: Arc<CostLedger>,
    pub health: Arc<HealthAggregator>,
    pub goals: Arc<GoalOrchestrator>,
    pub fsm: Arc<Mutex<HubFsm>>,
    coordinator: Mutex<Option<Arc<StoreCoordinator>>>,
    coordinator_handle: Arc<StoreCoordinator>,
    healing_started: Mutex<Option<Instant>>,
    improving_due: Mutex<Instant>,
}

impl Hub {
    /// Builds the full component graph over a fresh or existing data
    /// directory.
    pub async fn new(config: Config, llm: Arc<dyn LlmTransport>) -> Result<Arc<Self>> {
        let bus = EventBus::new();
        let mut store = Store::open(config.store.clone());

        let tasks_table = store.table("tasks")?;
        let tokens_table = store.table("tokens")?;
        let goals_table = store.table("goals")?;
        let mailbox_table = store.table("mailbox")?;
        let mailbox_seq_table = store.table("mailbox_seq")?;

        let presence = PresenceCache::new();
        let tokens = TokenRegistry::new(tokens_table);
        let queue = Arc::new(
            TaskQueue::load(tasks_table, bus.clone(), config.queue.clone()).await,
        );
        let supervisor = Arc::new(AgentSupervisor::new(
            queue.clone(),
            presence.clone(),
            bus.clone(),
            config.agent.acceptance_timeout_ms,
        ));
        let scheduler = Arc::new(Scheduler::new(
            queue.clone(),
            presence.clone(),
            supervisor.clone(),
            bus.clone(),
            config.scheduler.clone(),
        ));
        let router = Arc::new(MessageRouter::new(
            mailbox_table,
            mailbox_seq_table,
            presence.clone(),
            supervisor.clone(),
        ));
        let ledger = Arc::new(CostLedger::new(config.budgets.clone()));
        let health = Arc::new(HealthAggregator::new());
        let goals = Arc::new(GoalOrchestrator::new(
            goals_table,
            queue.clone(),
            llm,
            ledger.clone(),
            bus.clone(),
            config.goals.clone(),
        ));
        let gate = Arc::new(RateGate::new(&config.rate_limits));

        let coordinator = Arc::new(store.into_coordinator(bus.clone()));
        let improvement_tick = Duration::from_millis(config.goals.improvement_tick_ms);

        Ok(Arc::new(Self {
            config,
            bus,
            presence,
            tokens,
            queue,
            supervisor,
            scheduler,
            router,
            gate,
            validator: FrameValidator::new(),
            ledger,
            health,
            goals,
            fsm: Arc::new(Mutex::new(HubFsm::new())),
            coordinator: Mutex::new(Some(coordinator.clone())),
            coordinator_handle: coordinator,
            healing_started: Mutex::new(None),
            improving_due: Mutex::new(Instant::now() + improvement_tick),
        }))
    }

    /// Spawns the long-lived component loops and runs the hub FSM loop
    /// until the process exits.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        if let Some(coordinator) = self.coordinator.lock().await.take() {
            tokio::spawn(coordinator.run());
        }
        tokio::spawn(self.scheduler.clone().run());

        self.fsm_loop().await;
        Ok(())
    }

    async fn fsm_loop(&self) {
        let mut rx = self.bus.subscribe();
        let mut tick = tokio::time::interval(Duration::from_millis(FSM_TICK_INTERVAL_MS));
        info!("hub fsm loop started");

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.evaluate().await;
                }
                event = rx.recv() => match event {
                    Ok(HubEvent::TableDegraded { table }) => {
                        self.health.mark_degraded(&table).await;
                    }
                    Ok(HubEvent::HealthCritical { reason }) => {
                        self.health.raise_critical(&reason).await;
                        self.enter_healing(&reason).await;
                    }
                    Ok(HubEvent::GoalSubmitted { .. }) => {
                        self.evaluate().await;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    }

    async fn enter_healing(&self, reason: &str) {
        let mut fsm = self.fsm.lock().await;
        if fsm.state() == HubState::Healing {
            return;
        }
        // A critical signal preempts every state, paused or not.
        fsm.force(HubState::Healing, reason);
        *self.healing_started.lock().await = Some(Instant::now());
    }

    /// One evaluation of the transition predicates.
    async fn evaluate(&self) {
        let state = {
            let fsm = self.fsm.lock().await;
            if fsm.paused() && fsm.state() != HubState::Healing {
                return;
            }
            fsm.state()
        };

        match state {
            HubState::Resting => self.evaluate_resting().await,
            HubState::Executing => self.evaluate_executing().await,
            HubState::Improving => self.evaluate_improving().await,
            HubState::Contemplating => self.evaluate_contemplating().await,
            HubState::Healing => self.evaluate_healing().await,
        }
    }

    async fn evaluate_resting(&self) {
        if self.goals.open_count().await > 0 {
            if self.budget_ok("executing").await {
                self.transition(HubState::Executing, "pending goals with budget").await;
            }
            return;
        }

        let due = { *self.improving_due.lock().await };
        if Instant::now() >= due
            && !self.config.goals.repo_roots.is_empty()
            && self.budget_ok("improving").await
        {
            *self.improving_due.lock().await =
                Instant::now() + Duration::from_millis(self.config.goals.improvement_tick_ms);
            self.transition(HubState::Improving, "scheduled improvement tick").await;
        }
    }

    async fn evaluate_executing(&self) {
        self.goals.drive_pending().await;

        if self.goals.open_count().await == 0 {
            self.transition(HubState::Resting, "goal backlog drained").await;
        } else if !self.budget_ok("executing").await {
            self.bus.publish(HubEvent::BudgetExhausted {
                state: "executing".to_string(),
            });
            self.transition(HubState::Resting, "budget exhausted").await;
        }
    }

    async fn evaluate_improving(&self) {
        match self.goals.improvement_scan().await {
            Ok(0) => {
                if self.budget_ok("contemplating").await {
                    self.transition(HubState::Contemplating, "scan produced zero findings")
                        .await;
                } else {
                    self.transition(HubState::Resting, "scan clean, no contemplation budget")
                        .await;
                }
            }
            Ok(_) => {
                // Findings became goals; go work them.
                self.transition(HubState::Executing, "scan findings submitted as goals")
                    .await;
            }
            Err(e) => {
                warn!("improvement scan failed: {e}");
                self.transition(HubState::Resting, "improvement cycle failed").await;
            }
        }
    }

    async fn evaluate_contemplating(&self) {
        if let Err(e) = self.goals.write_proposal().await {
            warn!("proposal generation failed: {e}");
        }
        if self.goals.open_count().await > 0 && self.budget_ok("executing").await {
            self.transition(HubState::Executing, "goals submitted mid-cycle").await;
        } else {
            self.transition(HubState::Resting, "contemplation cycle complete").await;
        }
    }

    async fn evaluate_healing(&self) {
        let started = { *self.healing_started.lock().await };
        if let Some(started) = started {
            if started.elapsed() >= Duration::from_millis(HEALING_WATCHDOG_MS) {
                warn!("healing watchdog fired, abandoning cycle");
                self.health
                    .record_healing(HealingRecord {
                        reason: "watchdog timeout".to_string(),
                        actions_taken: vec![],
                        succeeded: false,
                        started_at: now_ms(),
                        finished_at: now_ms(),
                    })
                    .await;
                *self.healing_started.lock().await = None;
                self.transition(HubState::Resting, "healing watchdog timeout").await;
                return;
            }
        }

        let report = self.health.assess(&self.health_inputs().await).await;
        let started_at = now_ms();
        let mut taken = Vec::new();
        for action in &report.actions {
            match action {
                RemediationAction::VerifyTable { table } => {
                    // Recovery already restored or reset the table; accept
                    // the current state and lift the degraded mark.
                    self.health.clear_degraded(table).await;
                    taken.push(action.clone());
                }
                RemediationAction::BackupNow => {
                    self.coordinator_handle.run_backups().await;
                    taken.push(action.clone());
                }
                RemediationAction::ClearUnresponsiveFlags => {
                    // Advisory flags live in the per-agent actors and decay
                    // on reconnect; what healing can do is release agents
                    // parked in the blocked state.
                    for snapshot in self.presence.list().await {
                        if snapshot.fsm_state == crate::models::AgentFsmState::Blocked {
                            let _ = self
                                .supervisor
                                .send(&snapshot.agent_id, AgentCommand::ClearBlock)
                                .await;
                        }
                    }
                    taken.push(action.clone());
                }
            }
        }
        self.health.clear_critical().await;
        self.health
            .record_healing(HealingRecord {
                reason: report.reasons.join("; "),
                actions_taken: taken,
                succeeded: true,
                started_at,
                finished_at: now_ms(),
            })
            .await;

        *self.healing_started.lock().await = None;
        self.transition(HubState::Resting, "remediation complete").await;
    }

    async fn health_inputs(&self) -> HealthInputs {
        let mut exhausted = Vec::new();
        for state in ["executing", "improving", "contemplating"] {
            if self.ledger.check_budget(state).await == BudgetVerdict::Exhausted {
                exhausted.push(state.to_string());
            }
        }
        // Unresponsive = explicitly flagged, or silent for two heartbeat
        // windows.
        let heartbeat_cutoff =
            now_ms() - 2 * self.config.agent.heartbeat_interval_ms as i64;
        let mut unresponsive: std::collections::HashSet<String> = self
            .presence
            .flagged(crate::agents::state_machine::FLAG_UNRESPONSIVE)
            .await
            .into_iter()
            .map(|a| a.agent_id)
            .collect();
        unresponsive.extend(
            self.presence
                .silent_since(heartbeat_cutoff)
                .await
                .into_iter()
                .map(|a| a.agent_id),
        );

        HealthInputs {
            queued_tasks: self.queue.queued_count().await,
            max_queue_size: self.config.queue.max_queue_size,
            connected_agents: self.presence.connected_count().await,
            unresponsive_agents: unresponsive.len(),
            budget_exhausted_states: exhausted,
        }
    }

    async fn budget_ok(&self, state: &str) -> bool {
        self.ledger.check_budget(state).await == BudgetVerdict::Ok
    }

    async fn transition(&self, to: HubState, reason: &str) {
        let mut fsm = self.fsm.lock().await;
        fsm.transition(to, reason);
    }

    pub async fn pause(&self) {
        let mut fsm = self.fsm.lock().await;
        fsm.set_paused(true);
    }

    pub async fn resume(&self) {
        let mut fsm = self.fsm.lock().await;
        fsm.set_paused(false);
    }

    // ---- session gateway -------------------------------------------------

    pub fn open_session(&self, session: Arc<dyn SessionHandle>) -> SessionContext {
        SessionContext {
            session,
            agent_id: None,
        }
    }

    /// Entry point for every inbound frame on one connection. Validates,
    /// authenticates, and routes to the owning component. Errors are also
    /// reported back over the session as structured error frames.
    pub async fn handle_frame(&self, ctx: &mut SessionContext, raw: Value) -> Result<()> {
        let identity = ctx
            .agent_id
            .clone()
            .unwrap_or_else(|| "unidentified".to_string());

        if let Err(e) = self.gate.check(&identity, "general").await {
            let retry = match &e {
                HubError::RateLimited { retry_after_ms } => *retry_after_ms,
                _ => 0,
            };
            let _ = ctx
                .session
                .send(OutboundFrame::Error {
                    code: "rate_limited".to_string(),
                    details: format!("retry after {retry}ms"),
                })
                .await;
            return Err(e);
        }

        let frame = match self.validator.validate(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = ctx
                    .session
                    .send(OutboundFrame::Error {
                        code: "validation".to_string(),
                        details: e.to_string(),
                    })
                    .await;
                return Err(e);
            }
        };

        match frame {
            InboundFrame::Identify {
                agent_id,
                token,
                name,
                capabilities,
            } => {
                self.handle_identify(ctx, agent_id, token, name, capabilities)
                    .await
            }
            other => {
                let Some(agent_id) = ctx.agent_id.clone() else {
                    let _ = ctx
                        .session
                        .send(OutboundFrame::Error {
                            code: "unauthorized".to_string(),
                            details: "identify first".to_string(),
                        })
                        .await;
                    return Err(HubError::Unauthorized);
                };
                self.handle_agent_frame(ctx, &agent_id, other).await
            }
        }
    }

    async fn handle_identify(
        &self,
        ctx: &mut SessionContext,
        agent_id: String,
        token: String,
        name: String,
        capabilities: Vec<crate::models::CapabilitySpec>,
    ) -> Result<()> {
        if let Err(e) = self.gate.admit_connect(&agent_id).await {
            let _ = ctx
                .session
                .send(OutboundFrame::Error {
                    code: "rate_limited".to_string(),
                    details: "connect cooldown active".to_string(),
                })
                .await;
            return Err(e);
        }

        // One opaque failure for every authentication problem; nothing
        // reveals whether the agent id or the token was wrong.
        let authorized = matches!(
            self.tokens.verify(&token).await,
            Some(owner) if owner == agent_id
        );
        if !authorized {
            warn!(%agent_id, "authentication failed");
            let _ = ctx
                .session
                .send(OutboundFrame::Error {
                    code: "unauthorized".to_string(),
                    details: "authentication failed".to_string(),
                })
                .await;
            return Err(HubError::Unauthorized);
        }

        // Acknowledge before the actor spawns so `identified` is always the
        // first frame on the session, ahead of any immediate task push.
        ctx.session
            .send(OutboundFrame::Identified {
                agent_id: agent_id.clone(),
            })
            .await?;

        let capabilities = normalize_capabilities(capabilities);
        if let Err(e) = self
            .supervisor
            .start(
                &agent_id,
                &name,
                capabilities,
                Arc::downgrade(&ctx.session),
            )
            .await
        {
            let _ = ctx
                .session
                .send(OutboundFrame::Error {
                    code: "agent_conflict".to_string(),
                    details: e.to_string(),
                })
                .await;
            return Err(e);
        }
        ctx.agent_id = Some(agent_id);
        Ok(())
    }

    async fn handle_agent_frame(
        &self,
        ctx: &mut SessionContext,
        agent_id: &str,
        frame: InboundFrame,
    ) -> Result<()> {
        match frame {
            InboundFrame::TaskAccepted { task_id, generation } => {
                self.supervisor
                    .send(agent_id, AgentCommand::Accepted { task_id, generation })
                    .await
            }
            InboundFrame::TaskComplete {
                task_id,
                generation,
                result,
                verification_report: _,
            } => {
                self.supervisor
                    .send(
                        agent_id,
                        AgentCommand::Completed {
                            task_id,
                            generation,
                            result,
                        },
                    )
                    .await
            }
            InboundFrame::TaskFailed {
                task_id,
                generation,
                reason,
            } => {
                self.supervisor
                    .send(
                        agent_id,
                        AgentCommand::Failed {
                            task_id,
                            generation,
                            reason,
                        },
                    )
                    .await
            }
            InboundFrame::Heartbeat => {
                self.supervisor.send(agent_id, AgentCommand::Heartbeat).await
            }
            InboundFrame::StateReport {
                active_task_id,
                status: _,
                generation,
            } => {
                let decision = self
                    .reconcile_state_report(agent_id, active_task_id.clone(), generation)
                    .await;
                ctx.session
                    .send(OutboundFrame::StateReportAck { decision })
                    .await?;
                // An explicit continue for the surviving task, so the agent
                // does not need to infer which task the ack covered.
                if decision == ReportDecision::Continue {
                    if let Some(task_id) = active_task_id {
                        ctx.session
                            .send(OutboundFrame::TaskContinue { task_id })
                            .await?;
                    }
                }
                Ok(())
            }
            InboundFrame::WakeResult {
                task_id,
                success,
                error,
            } => {
                if success {
                    info!(%agent_id, %task_id, "wake succeeded");
                } else {
                    warn!(%agent_id, %task_id, ?error, "wake failed");
                }
                Ok(())
            }
            InboundFrame::Identify { .. } => Err(HubError::Validation(
                "session is already identified".to_string(),
            )),
        }
    }

    /// Reconnect reconciliation: the agent reports what it believes it is
    /// working on; the task-queue record decides.
    async fn reconcile_state_report(
        &self,
        agent_id: &str,
        active_task_id: Option<String>,
        generation: u64,
    ) -> ReportDecision {
        let Some(task_id) = active_task_id else {
            return ReportDecision::Continue;
        };
        let Some(task) = self.queue.get(&task_id).await else {
            return ReportDecision::Abort;
        };

        let matches = task.assigned_to.as_deref() == Some(agent_id)
            && task.generation == generation
            && task.status.is_held();
        if matches {
            // Keep the stuck sweep off a task that is demonstrably alive.
            if let Err(e) = self.queue.refresh(&task_id).await {
                error!(%task_id, "refresh failed during reconcile: {e}");
            }
            ReportDecision::Continue
        } else {
            info!(
                %agent_id,
                %task_id,
                reported_generation = generation,
                "state report does not match queue record, aborting agent task"
            );
            ReportDecision::Abort
        }
    }

    /// Transport driver notification that a connection dropped.
    pub async fn session_closed(&self, ctx: &mut SessionContext) {
        ctx.session.close();
        if let Some(agent_id) = ctx.agent_id.take() {
            self.router.unsubscribe_all(&agent_id).await;
            let _ = self
                .supervisor
                .send(&agent_id, AgentCommand::SessionClosed)
                .await;
        }
    }

    /// Store recovery history, surfaced alongside healing history.
    pub async fn recovery_history(&self) -> Vec<crate::store::RecoveryRecord> {
        self.coordinator_handle.recovery_history().await
    }
}
