//! Goal orchestrator.
//!
//! Accepts high-level goals, decomposes them into tasks through the LLM
//! transport, watches the children run, and verifies the outcome against
//! the goal's success criteria. A goal that fails verification gets one
//! revision pass; after that it is terminally failed. No stage is allowed
//! to crash the orchestrator: every fault lands the goal in a terminal
//! status with a recorded reason.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::GoalConfig;
use crate::constants::MAX_GOAL_ATTEMPTS;
use crate::events::{EventBus, HubEvent};
use crate::ledger::CostLedger;
use crate::llm::{CompletionRequest, LlmTransport};
use crate::models::{now_ms, Goal, GoalStatus, Priority, TaskStatus, TaskSubmission};
use crate::queue::TaskQueue;
use crate::store::Table;
use crate::{HubError, Result};

const DECOMPOSE_SYSTEM: &str = "You are the planning module of an agent hub. Decompose the \
goal into executable tasks. Respond with a JSON array only; each element is an object with \
\"description\" (string), \"needed_capabilities\" (array of strings), \"depends_on\" (array \
of zero-based indices into this array), optional \"files\" (array of repo-relative paths the \
task touches), and optional \"complexity\" (trivial|standard|complex).";

const VERIFY_SYSTEM: &str = "You are the verification module of an agent hub. Given a goal's \
success criteria and the outputs of its tasks, decide whether the goal is met. Respond with \
a JSON object only: {\"verdict\": \"pass\" or \"fail\", \"reasoning\": string}.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalSubmission {
    pub title: String,
    pub description: String,
    pub success_criteria: String,
    #[serde(default = "default_goal_priority")]
    pub priority: Priority,
}

fn default_goal_priority() -> Priority {
    Priority::Normal
}

/// One candidate task from a decomposition response.
#[derive(Debug, Clone, Deserialize)]
struct CandidateTask {
    description: String,
    #[serde(default)]
    needed_capabilities: Vec<String>,
    #[serde(default)]
    depends_on: Vec<usize>,
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    complexity: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Verdict {
    verdict: String,
    #[serde(default)]
    reasoning: String,
}

pub struct GoalOrchestrator {
    goals: Arc<Table<Goal>>,
    queue: Arc<TaskQueue>,
    llm: Arc<dyn LlmTransport>,
    ledger: Arc<CostLedger>,
    bus: EventBus,
    config: GoalConfig,
}

impl GoalOrchestrator {
    pub fn new(
        goals: Arc<Table<Goal>>,
        queue: Arc<TaskQueue>,
        llm: Arc<dyn LlmTransport>,
        ledger: Arc<CostLedger>,
        bus: EventBus,
        config: GoalConfig,
    ) -> Self {
        Self {
            goals,
            queue,
            llm,
            ledger,
            bus,
            config,
        }
    }

    pub async fn submit(&self, submission: GoalSubmission) -> Result<Goal> {
        if submission.title.trim().is_empty() || submission.success_criteria.trim().is_empty() {
            return Err(HubError::Validation(
                "goal needs a title and success criteria".to_string(),
            ));
        }

        let goal = Goal {
            id: Uuid::new_v4().to_string(),
            title: submission.title,
            description: submission.description,
            success_criteria: submission.success_criteria,
            priority: submission.priority,
            status: GoalStatus::Submitted,
            submitted_at: now_ms(),
            updated_at: now_ms(),
            task_ids: Vec::new(),
            attempts: 0,
            failure_reason: None,
        };
        self.goals.insert(&goal.id, &goal).await?;
        info!(goal_id = %goal.id, title = %goal.title, "goal submitted");
        self.bus.publish(HubEvent::GoalSubmitted {
            goal_id: goal.id.clone(),
        });
        Ok(goal)
    }

    pub async fn get(&self, goal_id: &str) -> Option<Goal> {
        self.goals.lookup(goal_id).await
    }

    pub async fn list(&self) -> Vec<Goal> {
        self.goals.scan().await.into_iter().map(|(_, g)| g).collect()
    }

    /// Goals that still need driving.
    pub async fn open_count(&self) -> usize {
        self.list()
            .await
            .iter()
            .filter(|g| !g.status.is_terminal())
            .count()
    }

    /// Advances every non-terminal goal one step. Called from the hub FSM
    /// while in the executing state.
    pub async fn drive_pending(&self) {
        for goal in self.list().await {
            if goal.status.is_terminal() {
                continue;
            }
            if let Err(e) = self.advance(goal).await {
                warn!("goal advance error: {e}");
            }
        }
    }

    async fn advance(&self, goal: Goal) -> Result<()> {
        match goal.status {
            GoalStatus::Submitted => self.decompose(goal).await,
            // Decomposing is transient; a goal found in it was interrupted
            // mid-decomposition and gets decomposed again.
            GoalStatus::Decomposing => self.decompose(goal).await,
            GoalStatus::Executing => self.watch_children(goal).await,
            GoalStatus::Verifying => self.verify(goal).await,
            GoalStatus::Complete | GoalStatus::Failed => Ok(()),
        }
    }

    async fn decompose(&self, mut goal: Goal) -> Result<()> {
        goal.status = GoalStatus::Decomposing;
        goal.updated_at = now_ms();
        self.goals.insert(&goal.id, &goal).await?;

        let prompt = format!(
            "Goal: {}\n\nDetails: {}\n\nSuccess criteria: {}",
            goal.title, goal.description, goal.success_criteria
        );
        let response = match self
            .llm
            .complete(CompletionRequest {
                system: DECOMPOSE_SYSTEM.to_string(),
                prompt,
                max_tokens: 4096,
            })
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return self
                    .fail_goal(goal, &format!("decomposition call failed: {e}"))
                    .await;
            }
        };
        self.ledger
            .record(
                "executing",
                response.input_tokens,
                response.output_tokens,
                response.cost_estimate(),
            )
            .await;

        let candidates = match parse_json_payload::<Vec<CandidateTask>>(&response.text) {
            Ok(candidates) if !candidates.is_empty() => candidates,
            Ok(_) => {
                return self.fail_goal(goal, "decomposition produced no tasks").await;
            }
            Err(e) => {
                return self
                    .fail_goal(goal, &format!("unparseable decomposition: {e}"))
                    .await;
            }
        };

        if let Err(e) = self.validate_referenced_files(&candidates) {
            return self
                .fail_goal(goal, &format!("decomposition rejected: {e}"))
                .await;
        }

        // Submit in order, mapping dependency indices onto real task ids.
        let mut task_ids: Vec<String> = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            let depends_on: HashSet<String> = candidate
                .depends_on
                .iter()
                .filter_map(|&i| task_ids.get(i).cloned())
                .collect();
            let task = self
                .queue
                .submit(TaskSubmission {
                    description: candidate.description.clone(),
                    priority: goal.priority,
                    submitted_by: format!("goal:{}", goal.id),
                    needed_capabilities: candidate.needed_capabilities.iter().cloned().collect(),
                    metadata: HashMap::new(),
                    depends_on,
                    goal_id: Some(goal.id.clone()),
                    complexity_tier: candidate
                        .complexity
                        .as_deref()
                        .and_then(|c| serde_json::from_value(serde_json::json!(c)).ok()),
                    verification_steps: Vec::new(),
                    max_retries: None,
                })
                .await?;
            task_ids.push(task.id);
        }

        info!(goal_id = %goal.id, tasks = task_ids.len(), "goal decomposed");
        goal.task_ids = task_ids;
        goal.status = GoalStatus::Executing;
        goal.updated_at = now_ms();
        self.goals.insert(&goal.id, &goal).await?;
        Ok(())
    }

    /// Decompositions naming files that do not exist in any registered repo
    /// root are rejected outright.
    fn validate_referenced_files(&self, candidates: &[CandidateTask]) -> Result<()> {
        for candidate in candidates {
            for file in &candidate.files {
                let relative = Path::new(file);
                if relative.is_absolute() || file.contains("..") {
                    return Err(HubError::Validation(format!(
                        "suspicious file reference: {file}"
                    )));
                }
                let found = self
                    .config
                    .repo_roots
                    .iter()
                    .any(|root| root.join(relative).exists());
                if !found && !self.config.repo_roots.is_empty() {
                    return Err(HubError::Validation(format!(
                        "referenced file does not exist: {file}"
                    )));
                }
            }
        }
        Ok(())
    }

    async fn watch_children(&self, mut goal: Goal) -> Result<()> {
        let mut all_terminal = true;
        for task_id in &goal.task_ids {
            match self.queue.get(task_id).await {
                Some(task) if task.status.is_terminal() => {}
                Some(_) => {
                    all_terminal = false;
                    break;
                }
                None => {}
            }
        }
        if !all_terminal {
            return Ok(());
        }

        goal.status = GoalStatus::Verifying;
        goal.updated_at = now_ms();
        self.goals.insert(&goal.id, &goal).await?;
        self.verify(goal).await
    }

    async fn verify(&self, mut goal: Goal) -> Result<()> {
        let mut outputs = String::new();
        for task_id in &goal.task_ids {
            if let Some(task) = self.queue.get(task_id).await {
                outputs.push_str(&format!(
                    "- [{}] {}: {}\n",
                    task.status,
                    task.description,
                    task.result
                        .as_ref()
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| {
                            task.failure_reason.clone().unwrap_or_default()
                        })
                ));
            }
        }

        let prompt = format!(
            "Success criteria: {}\n\nTask outcomes:\n{outputs}",
            goal.success_criteria
        );
        let response = match self
            .llm
            .complete(CompletionRequest {
                system: VERIFY_SYSTEM.to_string(),
                prompt,
                max_tokens: 1024,
            })
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return self
                    .fail_goal(goal, &format!("verification call failed: {e}"))
                    .await;
            }
        };
        self.ledger
            .record(
                "executing",
                response.input_tokens,
                response.output_tokens,
                response.cost_estimate(),
            )
            .await;

        let verdict = match parse_json_payload::<Verdict>(&response.text) {
            Ok(verdict) => verdict,
            Err(e) => {
                return self
                    .fail_goal(goal, &format!("unparseable verdict: {e}"))
                    .await;
            }
        };

        if verdict.verdict.eq_ignore_ascii_case("pass") {
            info!(goal_id = %goal.id, "goal verified complete");
            goal.status = GoalStatus::Complete;
            goal.updated_at = now_ms();
            self.goals.insert(&goal.id, &goal).await?;
            self.bus.publish(HubEvent::GoalFinished {
                goal_id: goal.id.clone(),
            });
            return Ok(());
        }

        goal.attempts += 1;
        if goal.attempts >= MAX_GOAL_ATTEMPTS {
            return self
                .fail_goal(
                    goal,
                    &format!("verification failed: {}", verdict.reasoning),
                )
                .await;
        }

        // Revision pass: one follow-up task addressing the verifier's
        // feedback, plus the children that never completed.
        warn!(goal_id = %goal.id, attempt = goal.attempts, "verification failed, revising");
        let mut revision_ids = Vec::new();
        for task_id in goal.task_ids.clone() {
            if let Some(task) = self.queue.get(&task_id).await {
                if task.status != TaskStatus::Completed {
                    let resubmitted = self
                        .queue
                        .submit(TaskSubmission {
                            description: task.description.clone(),
                            priority: goal.priority,
                            submitted_by: format!("goal:{}", goal.id),
                            needed_capabilities: task.needed_capabilities.clone(),
                            metadata: HashMap::new(),
                            depends_on: HashSet::new(),
                            goal_id: Some(goal.id.clone()),
                            complexity_tier: task.complexity_tier,
                            verification_steps: task.verification_steps.clone(),
                            max_retries: None,
                        })
                        .await?;
                    revision_ids.push(resubmitted.id);
                }
            }
        }
        let feedback_task = self
            .queue
            .submit(TaskSubmission {
                description: format!(
                    "Address verification feedback for goal \"{}\": {}",
                    goal.title, verdict.reasoning
                ),
                priority: goal.priority,
                submitted_by: format!("goal:{}", goal.id),
                needed_capabilities: HashSet::new(),
                metadata: HashMap::new(),
                depends_on: revision_ids.iter().cloned().collect(),
                goal_id: Some(goal.id.clone()),
                complexity_tier: None,
                verification_steps: Vec::new(),
                max_retries: None,
            })
            .await?;
        revision_ids.push(feedback_task.id);

        goal.task_ids = revision_ids;
        goal.status = GoalStatus::Executing;
        goal.updated_at = now_ms();
        self.goals.insert(&goal.id, &goal).await?;
        Ok(())
    }

    async fn fail_goal(&self, mut goal: Goal, reason: &str) -> Result<()> {
        warn!(goal_id = %goal.id, %reason, "goal failed");
        goal.status = GoalStatus::Failed;
        goal.failure_reason = Some(reason.to_string());
        goal.updated_at = now_ms();
        self.goals.insert(&goal.id, &goal).await?;
        self.bus.publish(HubEvent::GoalFinished {
            goal_id: goal.id.clone(),
        });
        Ok(())
    }

    /// Improvement scan: ask the LLM for findings over the registered repo
    /// roots and submit each finding as a goal. Returns how many findings
    /// the scan produced.
    pub async fn improvement_scan(&self) -> Result<usize> {
        if self.config.repo_roots.is_empty() {
            return Ok(0);
        }

        let mut listing = String::new();
        for root in &self.config.repo_roots {
            listing.push_str(&format!("{}:\n", root.display()));
            if let Ok(entries) = std::fs::read_dir(root) {
                for entry in entries.flatten().take(200) {
                    listing.push_str(&format!("  {}\n", entry.file_name().to_string_lossy()));
                }
            }
        }

        let response = self
            .llm
            .complete(CompletionRequest {
                system: "You review repositories for concrete, small improvements. Respond \
                         with a JSON array of finding strings; an empty array means nothing \
                         worth doing."
                    .to_string(),
                prompt: format!("Repository contents:\n{listing}"),
                max_tokens: 2048,
            })
            .await?;
        self.ledger
            .record(
                "improving",
                response.input_tokens,
                response.output_tokens,
                response.cost_estimate(),
            )
            .await;

        let findings: Vec<String> = parse_json_payload(&response.text)?;
        for finding in findings.iter().take(3) {
            self.submit(GoalSubmission {
                title: finding.chars().take(80).collect(),
                description: finding.clone(),
                success_criteria: "The finding is addressed and verified.".to_string(),
                priority: Priority::Low,
            })
            .await?;
        }
        Ok(findings.len())
    }

    /// Contemplation output: a proposal document written as XML under the
    /// proposals directory.
    pub async fn write_proposal(&self) -> Result<std::path::PathBuf> {
        let response = self
            .llm
            .complete(CompletionRequest {
                system: "You draft a short forward-looking proposal for the hub's operators: \
                         one idea, its motivation, and a scalability note. Plain text."
                    .to_string(),
                prompt: "Draft the next proposal.".to_string(),
                max_tokens: 2048,
            })
            .await?;
        self.ledger
            .record(
                "contemplating",
                response.input_tokens,
                response.output_tokens,
                response.cost_estimate(),
            )
            .await;

        std::fs::create_dir_all(&self.config.proposals_dir)?;
        let path = self
            .config
            .proposals_dir
            .join(format!("proposal-{}.xml", now_ms()));
        let body = xml_escape(&response.text);
        let document = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<proposal generated_at=\"{}\">\n  \
             <body>{body}</body>\n</proposal>\n",
            now_ms()
        );
        std::fs::write(&path, document)?;
        info!(path = %path.display(), "proposal written");
        Ok(path)
    }
}

/// Extracts the JSON payload from an LLM reply, tolerating markdown fences.
fn parse_json_payload<T: serde::de::DeserializeOwned>(text: &str) -> Result<T> {
    let trimmed = text.trim();
    let stripped = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end_matches("```").trim())
        .unwrap_or(trimmed);
    Ok(serde_json::from_str(stripped)?)
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::llm::testing::ScriptedTransport;
    use crate::store::Store;

    struct Fixture {
        orchestrator: GoalOrchestrator,
        queue: Arc<TaskQueue>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(responses: Vec<Result<crate::llm::CompletionResponse>>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_testing(dir.path());
        let mut store = Store::open(config.store.clone());
        let bus = EventBus::new();
        let queue = Arc::new(
            TaskQueue::load(store.table("tasks").unwrap(), bus.clone(), config.queue).await,
        );
        let orchestrator = GoalOrchestrator::new(
            store.table("goals").unwrap(),
            queue.clone(),
            Arc::new(ScriptedTransport::new(responses)),
            Arc::new(CostLedger::new(config.budgets)),
            bus,
            config.goals,
        );
        Fixture {
            orchestrator,
            queue,
            _dir: dir,
        }
    }

    fn goal_submission() -> GoalSubmission {
        GoalSubmission {
            title: "Ship the widget".to_string(),
            description: "Build and test the widget".to_string(),
            success_criteria: "Widget builds and tests pass".to_string(),
            priority: Priority::Normal,
        }
    }

    async fn complete_all_children(f: &Fixture, goal_id: &str) {
        let goal = f.orchestrator.get(goal_id).await.unwrap();
        for task_id in &goal.task_ids {
            // Dependencies force completion in submission order.
            let assigned = f.queue.assign_task(task_id, "worker").await.unwrap();
            f.queue
                .complete(task_id, assigned.generation, serde_json::json!({"done": true}))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn decomposition_submits_tasks_with_dependencies() {
        let f = fixture(vec![ScriptedTransport::text(
            r#"[
                {"description": "write code", "needed_capabilities": ["code"]},
                {"description": "test code", "depends_on": [0]}
            ]"#,
        )])
        .await;

        let goal = f.orchestrator.submit(goal_submission()).await.unwrap();
        f.orchestrator.drive_pending().await;

        let goal = f.orchestrator.get(&goal.id).await.unwrap();
        assert_eq!(goal.status, GoalStatus::Executing);
        assert_eq!(goal.task_ids.len(), 2);

        let second = f.queue.get(&goal.task_ids[1]).await.unwrap();
        assert!(second.depends_on.contains(&goal.task_ids[0]));
        // Only the first task is dispatchable until its dependency clears.
        assert_eq!(f.queue.dispatchable().await.len(), 1);
    }

    #[tokio::test]
    async fn passing_verification_completes_goal() {
        let f = fixture(vec![
            ScriptedTransport::text(r#"[{"description": "only task"}]"#),
            ScriptedTransport::text(r#"{"verdict": "pass", "reasoning": "looks done"}"#),
        ])
        .await;

        let goal = f.orchestrator.submit(goal_submission()).await.unwrap();
        f.orchestrator.drive_pending().await;
        complete_all_children(&f, &goal.id).await;
        f.orchestrator.drive_pending().await;

        let goal = f.orchestrator.get(&goal.id).await.unwrap();
        assert_eq!(goal.status, GoalStatus::Complete);
    }

    #[tokio::test]
    async fn failing_verification_revises_then_fails_terminally() {
        let f = fixture(vec![
            ScriptedTransport::text(r#"[{"description": "only task"}]"#),
            ScriptedTransport::text(r#"{"verdict": "fail", "reasoning": "widget is crooked"}"#),
            ScriptedTransport::text(r#"{"verdict": "fail", "reasoning": "still crooked"}"#),
        ])
        .await;

        let goal = f.orchestrator.submit(goal_submission()).await.unwrap();
        f.orchestrator.drive_pending().await;
        complete_all_children(&f, &goal.id).await;

        // First verification fails: goal revises and re-executes.
        f.orchestrator.drive_pending().await;
        let revised = f.orchestrator.get(&goal.id).await.unwrap();
        assert_eq!(revised.status, GoalStatus::Executing);
        assert_eq!(revised.attempts, 1);
        assert!(!revised.task_ids.is_empty());

        complete_all_children(&f, &goal.id).await;

        // Second failure is terminal.
        f.orchestrator.drive_pending().await;
        let failed = f.orchestrator.get(&goal.id).await.unwrap();
        assert_eq!(failed.status, GoalStatus::Failed);
        assert!(failed.failure_reason.unwrap().contains("still crooked"));
    }

    #[tokio::test]
    async fn unparseable_decomposition_fails_goal_without_crashing() {
        let f = fixture(vec![ScriptedTransport::text("I cannot answer in JSON")]).await;

        let goal = f.orchestrator.submit(goal_submission()).await.unwrap();
        f.orchestrator.drive_pending().await;

        let goal = f.orchestrator.get(&goal.id).await.unwrap();
        assert_eq!(goal.status, GoalStatus::Failed);
        assert_eq!(f.queue.dispatchable().await.len(), 0);
    }

    #[tokio::test]
    async fn decomposition_referencing_missing_files_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_testing(dir.path());
        config.goals.repo_roots = vec![dir.path().to_path_buf()];

        let mut store = Store::open(config.store.clone());
        let bus = EventBus::new();
        let queue = Arc::new(
            TaskQueue::load(store.table("tasks").unwrap(), bus.clone(), config.queue.clone()).await,
        );
        let orchestrator = GoalOrchestrator::new(
            store.table("goals").unwrap(),
            queue,
            Arc::new(ScriptedTransport::new(vec![ScriptedTransport::text(
                r#"[{"description": "edit", "files": ["src/does_not_exist.rs"]}]"#,
            )])),
            Arc::new(CostLedger::new(config.budgets.clone())),
            bus,
            config.goals,
        );

        let goal = orchestrator.submit(goal_submission()).await.unwrap();
        orchestrator.drive_pending().await;

        let goal = orchestrator.get(&goal.id).await.unwrap();
        assert_eq!(goal.status, GoalStatus::Failed);
        assert!(goal.failure_reason.unwrap().contains("does not exist"));
    }

    #[tokio::test]
    async fn proposal_document_is_escaped_xml() {
        let f = fixture(vec![ScriptedTransport::text("Use <channels> & retries")]).await;

        let path = f.orchestrator.write_proposal().await.unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("&lt;channels&gt; &amp; retries"));
        assert!(content.starts_with("<?xml"));
    }
}
