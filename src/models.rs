use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    fmt,
    str::FromStr,
};
use uuid::Uuid;

/// A unit of work routed to exactly one agent at a time
///
/// Tasks are the fundamental unit of work in the hub. Each task carries a
/// priority lane, a lifecycle status, and a generation counter that stamps
/// every (re)assignment so stale acknowledgments can be discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub submitted_by: String,
    /// Millisecond wall-clock timestamps throughout.
    pub submitted_at: i64,
    pub assigned_to: Option<String>,
    pub assigned_at: Option<i64>,
    pub updated_at: i64,
    /// Incremented on every (re)assignment; acks must echo it.
    pub generation: u64,
    pub needed_capabilities: HashSet<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub depends_on: HashSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity_tier: Option<ComplexityTier>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub verification_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// Task priority lanes, scheduled strictly highest first
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Urgent,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Lane index, highest priority first.
    pub fn lane(&self) -> usize {
        match self {
            Priority::Urgent => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            _ => Err(format!("Unknown priority: {s}")),
        }
    }
}

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Assigned,
    Working,
    Completed,
    Failed,
    DeadLetter,
}

impl TaskStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::DeadLetter
        )
    }

    /// Statuses under which a task is held by some agent.
    pub fn is_held(&self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Working)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Working => "working",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::DeadLetter => "dead_letter",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "assigned" => Ok(TaskStatus::Assigned),
            "working" => Ok(TaskStatus::Working),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "dead_letter" => Ok(TaskStatus::DeadLetter),
            _ => Err(format!("Unknown task status: {s}")),
        }
    }
}

/// Rough complexity classification attached by goal decomposition
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityTier {
    Trivial,
    Standard,
    Complex,
    Unknown,
}

/// Fields accepted on task submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub description: String,
    #[serde(default = "default_priority")]
    pub priority: Priority,
    pub submitted_by: String,
    #[serde(default)]
    pub needed_capabilities: HashSet<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub depends_on: HashSet<String>,
    #[serde(default)]
    pub goal_id: Option<String>,
    #[serde(default)]
    pub complexity_tier: Option<ComplexityTier>,
    #[serde(default)]
    pub verification_steps: Vec<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

fn default_priority() -> Priority {
    Priority::Normal
}

impl Task {
    /// Builds a freshly queued task from a validated submission.
    pub fn from_submission(sub: TaskSubmission, max_retries: u32) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4().to_string(),
            description: sub.description,
            priority: sub.priority,
            status: TaskStatus::Queued,
            submitted_by: sub.submitted_by,
            submitted_at: now,
            assigned_to: None,
            assigned_at: None,
            updated_at: now,
            generation: 0,
            needed_capabilities: normalize_capabilities_set(sub.needed_capabilities),
            retry_count: 0,
            max_retries: sub.max_retries.unwrap_or(max_retries),
            metadata: sub.metadata,
            depends_on: sub.depends_on,
            goal_id: sub.goal_id,
            complexity_tier: sub.complexity_tier,
            verification_steps: sub.verification_steps,
            result: None,
            failure_reason: None,
        }
    }
}

/// Work lifecycle state of a connected agent
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentFsmState {
    Offline,
    Idle,
    Assigned,
    Working,
    Blocked,
}

impl fmt::Display for AgentFsmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentFsmState::Offline => "offline",
            AgentFsmState::Idle => "idle",
            AgentFsmState::Assigned => "assigned",
            AgentFsmState::Working => "working",
            AgentFsmState::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

/// Public snapshot of one connected agent, published to the presence cache
/// on every state change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub name: String,
    pub capabilities: HashSet<String>,
    pub fsm_state: AgentFsmState,
    pub current_task_id: Option<String>,
    pub flags: HashSet<String>,
    pub connected_at: i64,
    pub last_seen: i64,
}

impl AgentSnapshot {
    pub fn is_idle(&self) -> bool {
        self.fsm_state == AgentFsmState::Idle
    }

    /// Empty `needed` matches any agent; otherwise superset compare.
    pub fn can_serve(&self, needed: &HashSet<String>) -> bool {
        needed.is_empty() || needed.is_subset(&self.capabilities)
    }
}

/// A higher-level objective decomposed into tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub title: String,
    pub description: String,
    pub success_criteria: String,
    pub priority: Priority,
    pub status: GoalStatus,
    pub submitted_at: i64,
    pub updated_at: i64,
    pub task_ids: Vec<String>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Submitted,
    Decomposing,
    Executing,
    Verifying,
    Complete,
    Failed,
}

impl GoalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, GoalStatus::Complete | GoalStatus::Failed)
    }
}

/// One capability as accepted on the wire: either a bare string or a
/// structured map carrying at least a name
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CapabilitySpec {
    Name(String),
    Structured { name: String },
}

/// Normalizes wire capabilities to the uniform lowercase-string form used
/// for all matching. Structured values keep only their name.
pub fn normalize_capabilities(specs: Vec<CapabilitySpec>) -> HashSet<String> {
    specs
        .into_iter()
        .map(|spec| match spec {
            CapabilitySpec::Name(name) => name,
            CapabilitySpec::Structured { name } => name,
        })
        .map(|name| name.trim().to_lowercase())
        .filter(|name| !name.is_empty())
        .collect()
}

fn normalize_capabilities_set(caps: HashSet<String>) -> HashSet<String> {
    caps.into_iter()
        .map(|c| c.trim().to_lowercase())
        .filter(|c| !c.is_empty())
        .collect()
}

/// Millisecond wall clock, the timestamp unit used across the hub.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
