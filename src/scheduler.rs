//! Event-driven scheduler.
//!
//! Subscribes to the hub bus and, on every scheduling trigger, pairs queued
//! dependency-resolved tasks with idle capable agents in one greedy pass.
//! The scheduler caches nothing: each pass queries the queue and the
//! presence index fresh. Triggers arriving while a pass runs coalesce into
//! a single follow-up pass. A periodic sweep reclaims tasks whose holders
//! went quiet, as a safety net for lost events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::agents::{AgentCommand, AgentSupervisor};
use crate::config::SchedulerConfig;
use crate::events::EventBus;
use crate::presence::PresenceCache;
use crate::queue::TaskQueue;

#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub passes: AtomicU64,
    pub assignments: AtomicU64,
    pub sweep_reclaims: AtomicU64,
}

pub struct Scheduler {
    queue: Arc<TaskQueue>,
    presence: PresenceCache,
    supervisor: Arc<AgentSupervisor>,
    bus: EventBus,
    config: SchedulerConfig,
    stats: SchedulerStats,
}

impl Scheduler {
    pub fn new(
        queue: Arc<TaskQueue>,
        presence: PresenceCache,
        supervisor: Arc<AgentSupervisor>,
        bus: EventBus,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            queue,
            presence,
            supervisor,
            bus,
            config,
            stats: SchedulerStats::default(),
        }
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// Scheduler loop; runs until the process exits.
    pub async fn run(self: Arc<Self>) {
        let mut rx = self.bus.subscribe();
        let mut sweep = tokio::time::interval(std::time::Duration::from_millis(
            self.config.stuck_sweep_interval_ms,
        ));
        sweep.tick().await;
        info!(
            sweep_interval_ms = self.config.stuck_sweep_interval_ms,
            stuck_threshold_ms = self.config.stuck_threshold_ms,
            "scheduler started"
        );

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Ok(event) if event.triggers_scheduling() => {
                        // Coalesce: everything queued behind this trigger is
                        // covered by the single pass we are about to run.
                        loop {
                            match rx.try_recv() {
                                Ok(_) => continue,
                                Err(_) => break,
                            }
                        }
                        self.run_pass().await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "scheduler lagged behind the bus, running catch-up pass");
                        self.run_pass().await;
                    }
                    Err(RecvError::Closed) => return,
                },
                _ = sweep.tick() => {
                    self.sweep_stuck().await;
                }
            }
        }
    }

    /// One greedy matching pass.
    ///
    /// Tasks are visited in (priority, FIFO) order; each consumes the first
    /// idle agent whose capability set covers its requirements. A task with
    /// no matching agent is skipped, never blocking later tasks, so a rare
    /// capability requirement cannot stall the rest of the queue.
    pub async fn run_pass(&self) {
        self.stats.passes.fetch_add(1, Ordering::Relaxed);

        let mut pool = self.presence.idle_agents().await;
        if pool.is_empty() {
            return;
        }
        let tasks = self.queue.dispatchable().await;
        if tasks.is_empty() {
            return;
        }

        let mut matched = 0u64;
        for task in tasks {
            if pool.is_empty() {
                break;
            }
            let Some(slot) = pool
                .iter()
                .position(|agent| agent.can_serve(&task.needed_capabilities))
            else {
                debug!(task_id = %task.id, "no idle agent matches capabilities, skipping");
                continue;
            };
            let agent = pool.remove(slot);

            let assigned = match self.queue.assign_task(&task.id, &agent.agent_id).await {
                Ok(assigned) => assigned,
                Err(e) => {
                    // Lost a race with another transition; the agent stays
                    // in the pool for the next task.
                    debug!(task_id = %task.id, "assignment lost race: {e}");
                    pool.push(agent);
                    continue;
                }
            };

            if let Err(e) = self
                .supervisor
                .send(agent.agent_id.as_str(), AgentCommand::PushTask { task: assigned })
                .await
            {
                warn!(agent_id = %agent.agent_id, task_id = %task.id, "push failed: {e}");
                let _ = self.queue.reclaim(&task.id).await;
                continue;
            }
            matched += 1;
        }

        if matched > 0 {
            self.stats.assignments.fetch_add(matched, Ordering::Relaxed);
            debug!(matched, "scheduling pass complete");
        }
    }

    /// Reclaims held tasks whose last update is older than the configured
    /// threshold. The displaced holder, if still connected, is told to drop
    /// the task so it does not keep burning work on a reassigned job.
    pub async fn sweep_stuck(&self) {
        let stuck = self.queue.stuck_tasks(self.config.stuck_threshold_ms).await;
        for task in stuck {
            warn!(
                task_id = %task.id,
                assigned_to = ?task.assigned_to,
                "stuck task reclaimed by sweep"
            );
            if self.queue.reclaim(&task.id).await.is_err() {
                continue;
            }
            self.stats.sweep_reclaims.fetch_add(1, Ordering::Relaxed);

            if let Some(holder) = task.assigned_to.as_deref() {
                if let Some(handle) = self.supervisor.lookup(holder).await {
                    if let Some(session) = handle.session.upgrade() {
                        let _ = session
                            .send(crate::protocol::OutboundFrame::TaskReassign {
                                task_id: task.id.clone(),
                            })
                            .await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::{AgentFsmState, AgentSnapshot, Priority, TaskStatus, TaskSubmission};
    use crate::session::{ChannelSession, SessionHandle};
    use crate::store::Store;
    use std::collections::{HashMap, HashSet};
    use std::sync::Weak;

    struct Fixture {
        scheduler: Arc<Scheduler>,
        queue: Arc<TaskQueue>,
        presence: PresenceCache,
        supervisor: Arc<AgentSupervisor>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_testing(dir.path());
        let mut store = Store::open(config.store.clone());
        let bus = EventBus::new();
        let queue = Arc::new(
            TaskQueue::load(store.table("tasks").unwrap(), bus.clone(), config.queue).await,
        );
        let presence = PresenceCache::new();
        let supervisor = Arc::new(AgentSupervisor::new(
            queue.clone(),
            presence.clone(),
            bus.clone(),
            60_000,
        ));
        let scheduler = Arc::new(Scheduler::new(
            queue.clone(),
            presence.clone(),
            supervisor.clone(),
            bus,
            config.scheduler,
        ));
        Fixture {
            scheduler,
            queue,
            presence,
            supervisor,
            _dir: dir,
        }
    }

    async fn connect(
        f: &Fixture,
        agent_id: &str,
        caps: &[&str],
    ) -> (
        Arc<ChannelSession>,
        tokio::sync::mpsc::UnboundedReceiver<crate::protocol::OutboundFrame>,
    ) {
        let (session, rx) = ChannelSession::new();
        f.supervisor
            .start(
                agent_id,
                agent_id,
                caps.iter().map(|c| c.to_string()).collect(),
                Arc::downgrade(&session) as Weak<dyn SessionHandle>,
            )
            .await
            .unwrap();
        // Wait for the actor's initial presence push.
        for _ in 0..100 {
            if f.presence.get(agent_id).await.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        (session, rx)
    }

    fn submission(description: &str, priority: Priority, caps: &[&str]) -> TaskSubmission {
        TaskSubmission {
            description: description.to_string(),
            priority,
            submitted_by: "test".to_string(),
            needed_capabilities: caps.iter().map(|c| c.to_string()).collect(),
            metadata: HashMap::new(),
            depends_on: HashSet::new(),
            goal_id: None,
            complexity_tier: None,
            verification_steps: vec![],
            max_retries: None,
        }
    }

    async fn wait_for_status(f: &Fixture, task_id: &str, status: TaskStatus) {
        for _ in 0..200 {
            if f.queue.get(task_id).await.map(|t| t.status) == Some(status) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("task {task_id} never reached {status}");
    }

    #[tokio::test]
    async fn pass_assigns_queued_task_to_idle_agent() {
        let f = fixture().await;
        let (_session, _frames) = connect(&f, "a1", &["code"]).await;
        let task = f
            .queue
            .submit(submission("build", Priority::Normal, &["code"]))
            .await
            .unwrap();

        f.scheduler.run_pass().await;
        wait_for_status(&f, &task.id, TaskStatus::Assigned).await;

        let assigned = f.queue.get(&task.id).await.unwrap();
        assert_eq!(assigned.assigned_to.as_deref(), Some("a1"));
        assert_eq!(assigned.generation, 1);
    }

    #[tokio::test]
    async fn capability_miss_does_not_block_later_tasks() {
        let f = fixture().await;
        let (_session, _frames) = connect(&f, "d", &["code", "git"]).await;

        let python_task = f
            .queue
            .submit(submission("needs python", Priority::Urgent, &["python"]))
            .await
            .unwrap();
        let any_task = f
            .queue
            .submit(submission("anyone", Priority::Normal, &[]))
            .await
            .unwrap();

        f.scheduler.run_pass().await;
        wait_for_status(&f, &any_task.id, TaskStatus::Assigned).await;
        assert_eq!(
            f.queue.get(&python_task.id).await.unwrap().status,
            TaskStatus::Queued
        );

        // A capable agent arrives; the skipped task is picked up.
        let (_e_session, _e_frames) = connect(&f, "e", &["python"]).await;
        f.scheduler.run_pass().await;
        wait_for_status(&f, &python_task.id, TaskStatus::Assigned).await;
        assert_eq!(
            f.queue.get(&python_task.id).await.unwrap().assigned_to.as_deref(),
            Some("e")
        );
    }

    #[tokio::test]
    async fn no_agent_receives_two_tasks_in_one_pass() {
        let f = fixture().await;
        let (_session, _frames) = connect(&f, "a1", &[]).await;

        let first = f
            .queue
            .submit(submission("first", Priority::High, &[]))
            .await
            .unwrap();
        let second = f
            .queue
            .submit(submission("second", Priority::High, &[]))
            .await
            .unwrap();

        f.scheduler.run_pass().await;
        wait_for_status(&f, &first.id, TaskStatus::Assigned).await;
        assert_eq!(
            f.queue.get(&second.id).await.unwrap().status,
            TaskStatus::Queued
        );
    }

    #[tokio::test]
    async fn priority_beats_submission_order() {
        let f = fixture().await;

        let low = f
            .queue
            .submit(submission("low first", Priority::Low, &[]))
            .await
            .unwrap();
        let urgent = f
            .queue
            .submit(submission("urgent later", Priority::Urgent, &[]))
            .await
            .unwrap();

        let (_session, _frames) = connect(&f, "a1", &[]).await;
        f.scheduler.run_pass().await;
        wait_for_status(&f, &urgent.id, TaskStatus::Assigned).await;
        assert_eq!(f.queue.get(&low.id).await.unwrap().status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn sweep_reclaims_only_overdue_held_tasks() {
        let f = fixture().await;
        // Presence entry without a live actor so assignment sticks without
        // an acceptance.
        f.presence
            .update(AgentSnapshot {
                agent_id: "ghost".to_string(),
                name: "ghost".to_string(),
                capabilities: HashSet::new(),
                fsm_state: AgentFsmState::Idle,
                current_task_id: None,
                flags: HashSet::new(),
                connected_at: 0,
                last_seen: 0,
            })
            .await;

        let task = f
            .queue
            .submit(submission("frozen", Priority::Normal, &[]))
            .await
            .unwrap();
        f.queue.assign_task(&task.id, "ghost").await.unwrap();

        // Fresh assignment is not overdue yet.
        f.scheduler.sweep_stuck().await;
        assert_eq!(
            f.queue.get(&task.id).await.unwrap().status,
            TaskStatus::Assigned
        );

        // Past the stuck threshold (1500ms in the test config) it is
        // reclaimed.
        tokio::time::sleep(std::time::Duration::from_millis(1_600)).await;
        f.scheduler.sweep_stuck().await;
        let reclaimed = f.queue.get(&task.id).await.unwrap();
        assert_eq!(reclaimed.status, TaskStatus::Queued);
        assert_eq!(reclaimed.generation, 2);
    }
}
