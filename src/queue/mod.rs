//! Durable task queue.
//!
//! Tasks persist in their own store table; an in-memory index keeps one FIFO
//! lane per priority for queued work. All mutating operations run under a
//! single lock, so per-task transitions are totally ordered. Every
//! (re)assignment increments the task's generation; acknowledgments carrying
//! any other generation are rejected as stale and change nothing.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::events::{EventBus, HubEvent};
use crate::models::{now_ms, Priority, Task, TaskStatus, TaskSubmission};
use crate::store::Table;
use crate::{HubError, Result};

/// What `fail` did with the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Retry budget remained; the task is queued again.
    Retried,
    /// Retries exhausted; the task is parked in the dead-letter status.
    DeadLettered,
}

/// Filter for `list`; all fields are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub assigned_to: Option<String>,
    pub goal_id: Option<String>,
}

/// One FIFO lane of queued task ids per priority.
struct Lanes {
    lanes: [VecDeque<String>; 4],
}

impl Lanes {
    fn new() -> Self {
        Self {
            lanes: [
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
            ],
        }
    }

    fn push(&mut self, priority: Priority, task_id: String) {
        self.lanes[priority.lane()].push_back(task_id);
    }

    fn remove(&mut self, priority: Priority, task_id: &str) {
        self.lanes[priority.lane()].retain(|id| id != task_id);
    }

    fn queued_count(&self) -> usize {
        self.lanes.iter().map(|l| l.len()).sum()
    }

    /// Ids in dispatch order: priority lanes highest first, FIFO within.
    fn ordered_ids(&self) -> Vec<String> {
        self.lanes.iter().flat_map(|l| l.iter().cloned()).collect()
    }
}

pub struct TaskQueue {
    table: Arc<Table<Task>>,
    lanes: Mutex<Lanes>,
    bus: EventBus,
    config: QueueConfig,
}

impl TaskQueue {
    /// Opens the queue over its table, rebuilding the in-memory lanes from
    /// whatever survived restart.
    pub async fn load(table: Arc<Table<Task>>, bus: EventBus, config: QueueConfig) -> Self {
        let mut queued: Vec<Task> = table
            .scan()
            .await
            .into_iter()
            .map(|(_, task)| task)
            .filter(|task| task.status == TaskStatus::Queued)
            .collect();
        queued.sort_by_key(|task| task.submitted_at);

        let mut lanes = Lanes::new();
        for task in &queued {
            lanes.push(task.priority, task.id.clone());
        }
        if !queued.is_empty() {
            info!(count = queued.len(), "rebuilt queue lanes from store");
        }

        Self {
            table,
            lanes: Mutex::new(lanes),
            bus,
            config,
        }
    }

    /// Validates and enqueues a new task.
    pub async fn submit(&self, submission: TaskSubmission) -> Result<Task> {
        if submission.description.trim().is_empty() {
            return Err(HubError::Validation(
                "task description cannot be empty".to_string(),
            ));
        }

        let mut lanes = self.lanes.lock().await;
        if lanes.queued_count() >= self.config.max_queue_size {
            return Err(HubError::QueueFull);
        }

        let task = Task::from_submission(submission, self.config.max_retries);
        self.table.insert(&task.id, &task).await?;
        lanes.push(task.priority, task.id.clone());
        drop(lanes);

        debug!(task_id = %task.id, priority = ?task.priority, "task submitted");
        self.bus.publish(HubEvent::TaskSubmitted {
            task_id: task.id.clone(),
        });
        Ok(task)
    }

    pub async fn get(&self, task_id: &str) -> Option<Task> {
        self.table.lookup(task_id).await
    }

    pub async fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        self.table
            .scan()
            .await
            .into_iter()
            .map(|(_, task)| task)
            .filter(|task| {
                filter.status.map_or(true, |s| task.status == s)
                    && filter.priority.map_or(true, |p| task.priority == p)
                    && filter
                        .assigned_to
                        .as_ref()
                        .map_or(true, |a| task.assigned_to.as_deref() == Some(a.as_str()))
                    && filter
                        .goal_id
                        .as_ref()
                        .map_or(true, |g| task.goal_id.as_deref() == Some(g.as_str()))
            })
            .collect()
    }

    /// Queued tasks whose dependencies are all completed, in dispatch order
    /// (priority descending, submission FIFO within a lane).
    pub async fn dispatchable(&self) -> Vec<Task> {
        let ordered = {
            let lanes = self.lanes.lock().await;
            lanes.ordered_ids()
        };

        let mut out = Vec::new();
        for task_id in ordered {
            let Some(task) = self.table.lookup(&task_id).await else {
                continue;
            };
            if task.status != TaskStatus::Queued {
                continue;
            }
            if self.dependencies_resolved(&task).await {
                out.push(task);
            }
        }
        out
    }

    async fn dependencies_resolved(&self, task: &Task) -> bool {
        for dep_id in &task.depends_on {
            match self.table.lookup(dep_id).await {
                Some(dep) if dep.status == TaskStatus::Completed => {}
                // Missing or unfinished dependency keeps the task parked.
                _ => return false,
            }
        }
        true
    }

    /// Atomically assigns a queued task to an agent, stamping a new
    /// generation.
    pub async fn assign_task(&self, task_id: &str, agent_id: &str) -> Result<Task> {
        let mut lanes = self.lanes.lock().await;
        let mut task = self
            .table
            .lookup(task_id)
            .await
            .ok_or_else(|| HubError::NotFound(format!("task {task_id}")))?;

        if task.status != TaskStatus::Queued {
            return Err(HubError::InvalidTransition {
                task_id: task_id.to_string(),
                operation: "assign".to_string(),
            });
        }

        task.status = TaskStatus::Assigned;
        task.assigned_to = Some(agent_id.to_string());
        task.assigned_at = Some(now_ms());
        task.updated_at = now_ms();
        task.generation += 1;
        self.table.insert(task_id, &task).await?;
        lanes.remove(task.priority, task_id);
        drop(lanes);

        info!(task_id = %task_id, agent_id = %agent_id, generation = task.generation, "task assigned");
        self.bus.publish(HubEvent::TaskAssigned {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            generation: task.generation,
        });
        Ok(task)
    }

    /// Agent acknowledged the assignment; moves assigned → working.
    /// Generation mismatches are stale acks and change nothing.
    pub async fn mark_working(&self, task_id: &str, agent_id: &str, generation: u64) -> Result<Task> {
        let _lanes = self.lanes.lock().await;
        let mut task = self
            .table
            .lookup(task_id)
            .await
            .ok_or_else(|| HubError::NotFound(format!("task {task_id}")))?;

        self.check_generation(&task, generation)?;
        if task.status != TaskStatus::Assigned || task.assigned_to.as_deref() != Some(agent_id) {
            return Err(HubError::InvalidTransition {
                task_id: task_id.to_string(),
                operation: "mark_working".to_string(),
            });
        }

        task.status = TaskStatus::Working;
        task.updated_at = now_ms();
        self.table.insert(task_id, &task).await?;
        Ok(task)
    }

    /// Completes a held task. Stale generations are rejected.
    pub async fn complete(
        &self,
        task_id: &str,
        generation: u64,
        result: serde_json::Value,
    ) -> Result<Task> {
        let _lanes = self.lanes.lock().await;
        let mut task = self
            .table
            .lookup(task_id)
            .await
            .ok_or_else(|| HubError::NotFound(format!("task {task_id}")))?;

        self.check_generation(&task, generation)?;
        if !task.status.is_held() {
            return Err(HubError::InvalidTransition {
                task_id: task_id.to_string(),
                operation: "complete".to_string(),
            });
        }

        task.status = TaskStatus::Completed;
        task.assigned_to = None;
        task.result = Some(result);
        task.updated_at = now_ms();
        self.table.insert(task_id, &task).await?;

        info!(task_id = %task_id, "task completed");
        self.bus.publish(HubEvent::TaskCompleted {
            task_id: task_id.to_string(),
        });
        Ok(task)
    }

    /// Fails a held task: requeue while retries remain, dead-letter after.
    pub async fn fail(&self, task_id: &str, generation: u64, reason: &str) -> Result<FailOutcome> {
        let mut lanes = self.lanes.lock().await;
        let mut task = self
            .table
            .lookup(task_id)
            .await
            .ok_or_else(|| HubError::NotFound(format!("task {task_id}")))?;

        self.check_generation(&task, generation)?;
        if !task.status.is_held() {
            return Err(HubError::InvalidTransition {
                task_id: task_id.to_string(),
                operation: "fail".to_string(),
            });
        }

        task.failure_reason = Some(reason.to_string());
        task.assigned_to = None;
        task.assigned_at = None;
        task.updated_at = now_ms();

        if task.retry_count < task.max_retries {
            task.retry_count += 1;
            task.generation += 1;
            task.status = TaskStatus::Queued;
            self.table.insert(task_id, &task).await?;
            lanes.push(task.priority, task_id.to_string());
            drop(lanes);

            info!(task_id = %task_id, retry = task.retry_count, "task failed, requeued");
            self.bus.publish(HubEvent::TaskRetried {
                task_id: task_id.to_string(),
                generation: task.generation,
            });
            Ok(FailOutcome::Retried)
        } else {
            task.status = TaskStatus::DeadLetter;
            self.table.insert(task_id, &task).await?;
            drop(lanes);

            warn!(task_id = %task_id, %reason, "task dead-lettered");
            self.bus.publish(HubEvent::TaskDeadLetter {
                task_id: task_id.to_string(),
            });
            Ok(FailOutcome::DeadLettered)
        }
    }

    /// Returns a held task to the queue with a fresh generation. Idempotent:
    /// reclaiming a task that is already queued (or terminal) is a no-op.
    pub async fn reclaim(&self, task_id: &str) -> Result<()> {
        let mut lanes = self.lanes.lock().await;
        let Some(mut task) = self.table.lookup(task_id).await else {
            return Ok(());
        };

        if !task.status.is_held() {
            return Ok(());
        }

        task.status = TaskStatus::Queued;
        task.assigned_to = None;
        task.assigned_at = None;
        task.generation += 1;
        task.updated_at = now_ms();
        self.table.insert(task_id, &task).await?;
        lanes.push(task.priority, task_id.to_string());
        drop(lanes);

        info!(task_id = %task_id, generation = task.generation, "task reclaimed");
        self.bus.publish(HubEvent::TaskReclaimed {
            task_id: task_id.to_string(),
            generation: task.generation,
        });
        Ok(())
    }

    /// Reclaim guarded by holder identity: a no-op unless the task is still
    /// held by `agent_id` at `generation`. Agent actors use this so a late
    /// timer (acceptance timeout, session drop) can never clobber a task
    /// that has already moved on to another agent.
    pub async fn reclaim_from(
        &self,
        task_id: &str,
        agent_id: &str,
        generation: u64,
    ) -> Result<()> {
        let mut lanes = self.lanes.lock().await;
        let Some(mut task) = self.table.lookup(task_id).await else {
            return Ok(());
        };
        if !task.status.is_held()
            || task.assigned_to.as_deref() != Some(agent_id)
            || task.generation != generation
        {
            return Ok(());
        }

        task.status = TaskStatus::Queued;
        task.assigned_to = None;
        task.assigned_at = None;
        task.generation += 1;
        task.updated_at = now_ms();
        self.table.insert(task_id, &task).await?;
        lanes.push(task.priority, task_id.to_string());
        drop(lanes);

        info!(task_id = %task_id, %agent_id, generation = task.generation, "task reclaimed from agent");
        self.bus.publish(HubEvent::TaskReclaimed {
            task_id: task_id.to_string(),
            generation: task.generation,
        });
        Ok(())
    }

    /// Requeues a dead-lettered task with a reset retry budget.
    pub async fn dead_letter_retry(&self, task_id: &str) -> Result<Task> {
        let mut lanes = self.lanes.lock().await;
        let mut task = self
            .table
            .lookup(task_id)
            .await
            .ok_or_else(|| HubError::NotFound(format!("task {task_id}")))?;

        if task.status != TaskStatus::DeadLetter {
            return Err(HubError::InvalidTransition {
                task_id: task_id.to_string(),
                operation: "dead_letter_retry".to_string(),
            });
        }

        task.status = TaskStatus::Queued;
        task.retry_count = 0;
        task.generation += 1;
        task.failure_reason = None;
        task.updated_at = now_ms();
        self.table.insert(task_id, &task).await?;
        lanes.push(task.priority, task_id.to_string());
        drop(lanes);

        info!(task_id = %task_id, "dead-letter task requeued");
        self.bus.publish(HubEvent::TaskRetried {
            task_id: task_id.to_string(),
            generation: task.generation,
        });
        Ok(task)
    }

    /// Bumps a held task's update timestamp, keeping it clear of the stuck
    /// sweep. Used when a reconnecting agent is told to continue its task.
    pub async fn refresh(&self, task_id: &str) -> Result<()> {
        let _lanes = self.lanes.lock().await;
        if let Some(mut task) = self.table.lookup(task_id).await {
            if task.status.is_held() {
                task.updated_at = now_ms();
                self.table.insert(task_id, &task).await?;
            }
        }
        Ok(())
    }

    /// Held tasks whose last update is older than `threshold_ms`; the
    /// scheduler's stuck sweep reclaims these.
    pub async fn stuck_tasks(&self, threshold_ms: u64) -> Vec<Task> {
        let cutoff = now_ms() - threshold_ms as i64;
        self.table
            .scan()
            .await
            .into_iter()
            .map(|(_, task)| task)
            .filter(|task| task.status.is_held() && task.updated_at < cutoff)
            .collect()
    }

    pub async fn queued_count(&self) -> usize {
        let lanes = self.lanes.lock().await;
        lanes.queued_count()
    }

    fn check_generation(&self, task: &Task, generation: u64) -> Result<()> {
        if task.generation != generation {
            debug!(
                task_id = %task.id,
                current = task.generation,
                presented = generation,
                "discarding stale generation"
            );
            return Err(HubError::StaleGeneration {
                task_id: task.id.clone(),
                generation,
            });
        }
        Ok(())
    }
}
