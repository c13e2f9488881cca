//! System-wide default values.
//!
//! Everything here can be overridden through [`crate::config::Config`];
//! these are the values used when the environment supplies nothing.

// Store maintenance
/// Backups run once an hour unless configured otherwise.
pub const DEFAULT_BACKUP_INTERVAL_MS: u64 = 3_600_000;
/// Compaction considers each table every six hours.
pub const DEFAULT_COMPACTION_INTERVAL_MS: u64 = 21_600_000;
/// Tables below 10% fragmentation are left alone by the compactor.
pub const DEFAULT_COMPACTION_THRESHOLD: f64 = 0.10;
/// Number of timestamped backups retained per table.
pub const DEFAULT_BACKUP_RETENTION: usize = 3;
/// Durability barrier ceiling for table writes.
pub const DEFAULT_SYNC_INTERVAL_MS: u64 = 5_000;

// Agent lifecycle
/// An assigned agent must acknowledge within this window or the task is
/// reclaimed and the agent flagged unresponsive.
pub const DEFAULT_ACCEPTANCE_TIMEOUT_MS: u64 = 60_000;
/// Expected heartbeat cadence from connected agents.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 900_000;

// Scheduler
pub const DEFAULT_STUCK_SWEEP_INTERVAL_MS: u64 = 30_000;
/// Tasks assigned or working with no update for this long are reclaimed.
pub const DEFAULT_STUCK_THRESHOLD_MS: u64 = 300_000;

// Task queue
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Hard cap on queued tasks, protects the hub from unbounded submission.
pub const MAX_QUEUE_SIZE: usize = 1000;

// Mailbox
/// FIFO cap per recipient; oldest entries are evicted first.
pub const MAILBOX_CAP_PER_RECIPIENT: usize = 500;
/// Mailbox entries older than this are evicted on access.
pub const MAILBOX_TTL_MS: i64 = 86_400_000;

// Hub FSM
/// Bounded ring of recorded state transitions.
pub const FSM_HISTORY_LIMIT: usize = 100;
/// Predicates are evaluated at least this often.
pub const FSM_TICK_INTERVAL_MS: u64 = 1_000;
/// A healing cycle that has not completed by then is abandoned.
pub const HEALING_WATCHDOG_MS: u64 = 600_000;

// Goals
/// A goal gets one revision pass after a failed verification.
pub const MAX_GOAL_ATTEMPTS: u32 = 2;

// LLM transport
pub const DEFAULT_LLM_TIMEOUT_MS: u64 = 120_000;

// Rate limiting
pub const GENERAL_REQUESTS_PER_MINUTE: u32 = 60;
pub const TASK_REQUESTS_PER_MINUTE: u32 = 10;
/// Escalating connect cooldowns applied after repeated violations.
pub const COOLDOWN_STEPS_MS: [u64; 3] = [30_000, 60_000, 300_000];

// Validation bounds
pub const MAX_DESCRIPTION_LENGTH: usize = 10_000;
pub const MAX_AGENT_NAME_LENGTH: usize = 100;
pub const MAX_CAPABILITY_LENGTH: usize = 100;
pub const MAX_CAPABILITIES: usize = 32;
pub const MAX_METADATA_VALUE_LENGTH: usize = 4_000;
pub const MAX_RESULT_LENGTH: usize = 65_536;
