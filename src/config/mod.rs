use crate::{constants, HubError, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, env, path::PathBuf};

/// Top-level hub configuration, assembled from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub agent: AgentConfig,
    pub queue: QueueConfig,
    pub budgets: BudgetConfig,
    pub rate_limits: RateLimitConfig,
    pub llm: LlmConfig,
    pub api: ApiConfig,
    pub goals: GoalConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub backup_interval_ms: u64,
    pub backup_retention: usize,
    pub compaction_interval_ms: u64,
    /// Fragmentation ratio below which compaction is skipped.
    pub compaction_threshold: f64,
    pub sync_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub stuck_sweep_interval_ms: u64,
    pub stuck_threshold_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub acceptance_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub max_retries: u32,
    pub max_queue_size: usize,
}

/// Budget for one hub state, per rolling window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateBudget {
    pub max_invocations_per_window: Option<u64>,
    pub max_cost_per_window: Option<f64>,
    pub window_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Keyed by hub state name: executing, improving, contemplating.
    pub per_state: HashMap<String, StateBudget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitTier {
    pub per_minute: u32,
    pub burst: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub tiers: HashMap<String, RateLimitTier>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_ms: u64,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    /// Operator key gating the control surface; admin endpoints require it.
    pub admin_key: Option<String>,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalConfig {
    pub proposals_dir: PathBuf,
    /// Repo roots the improvement scan and decomposition validation walk.
    pub repo_roots: Vec<PathBuf>,
    pub improvement_tick_ms: u64,
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn load() -> Result<Self> {
        match dotenv() {
            Ok(path) => tracing::info!("Loaded .env file from: {:?}", path),
            Err(_) => tracing::debug!("No .env file found"),
        }

        let data_dir =
            PathBuf::from(env::var("AGENTCOM_DATA_DIR").unwrap_or_else(|_| "data".to_string()));
        let backup_dir = env::var("AGENTCOM_BACKUP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("backups"));

        let store = StoreConfig {
            data_dir,
            backup_dir,
            backup_interval_ms: env_u64(
                "AGENTCOM_BACKUP_INTERVAL_MS",
                constants::DEFAULT_BACKUP_INTERVAL_MS,
            ),
            backup_retention: env_usize(
                "AGENTCOM_BACKUP_RETENTION",
                constants::DEFAULT_BACKUP_RETENTION,
            ),
            compaction_interval_ms: env_u64(
                "AGENTCOM_COMPACTION_INTERVAL_MS",
                constants::DEFAULT_COMPACTION_INTERVAL_MS,
            ),
            compaction_threshold: env_f64(
                "AGENTCOM_COMPACTION_THRESHOLD",
                constants::DEFAULT_COMPACTION_THRESHOLD,
            ),
            sync_interval_ms: env_u64(
                "AGENTCOM_SYNC_INTERVAL_MS",
                constants::DEFAULT_SYNC_INTERVAL_MS,
            ),
        };

        if !(0.0..=1.0).contains(&store.compaction_threshold) {
            return Err(HubError::Configuration(
                "AGENTCOM_COMPACTION_THRESHOLD must be between 0.0 and 1.0".to_string(),
            ));
        }

        let scheduler = SchedulerConfig {
            stuck_sweep_interval_ms: env_u64(
                "AGENTCOM_STUCK_SWEEP_INTERVAL_MS",
                constants::DEFAULT_STUCK_SWEEP_INTERVAL_MS,
            ),
            stuck_threshold_ms: env_u64(
                "AGENTCOM_STUCK_THRESHOLD_MS",
                constants::DEFAULT_STUCK_THRESHOLD_MS,
            ),
        };

        let agent = AgentConfig {
            acceptance_timeout_ms: env_u64(
                "AGENTCOM_ACCEPTANCE_TIMEOUT_MS",
                constants::DEFAULT_ACCEPTANCE_TIMEOUT_MS,
            ),
            heartbeat_interval_ms: env_u64(
                "AGENTCOM_HEARTBEAT_INTERVAL_MS",
                constants::DEFAULT_HEARTBEAT_INTERVAL_MS,
            ),
        };

        let queue = QueueConfig {
            max_retries: env_u64("AGENTCOM_MAX_RETRIES", constants::DEFAULT_MAX_RETRIES as u64)
                as u32,
            max_queue_size: env_usize("AGENTCOM_MAX_QUEUE_SIZE", constants::MAX_QUEUE_SIZE),
        };

        let budgets = BudgetConfig {
            per_state: Self::default_budgets(),
        };

        let mut tiers = HashMap::new();
        tiers.insert(
            "general".to_string(),
            RateLimitTier {
                per_minute: env_u64(
                    "AGENTCOM_RATE_GENERAL_PER_MINUTE",
                    constants::GENERAL_REQUESTS_PER_MINUTE as u64,
                ) as u32,
                burst: 10,
            },
        );
        tiers.insert(
            "task_submit".to_string(),
            RateLimitTier {
                per_minute: env_u64(
                    "AGENTCOM_RATE_TASKS_PER_MINUTE",
                    constants::TASK_REQUESTS_PER_MINUTE as u64,
                ) as u32,
                burst: 5,
            },
        );
        let rate_limits = RateLimitConfig { tiers };

        let llm = LlmConfig {
            base_url: env::var("AGENTCOM_LLM_BASE_URL")
                .unwrap_or_else(|_| "https://api.anthropic.com".to_string()),
            api_key: env::var("AGENTCOM_LLM_API_KEY").ok(),
            model: env::var("AGENTCOM_LLM_MODEL")
                .unwrap_or_else(|_| "claude-3-5-sonnet-20241022".to_string()),
            timeout_ms: env_u64("AGENTCOM_LLM_TIMEOUT_MS", constants::DEFAULT_LLM_TIMEOUT_MS),
            max_tokens: env_u64("AGENTCOM_LLM_MAX_TOKENS", 4096) as u32,
        };

        let admin_key = env::var("AGENTCOM_ADMIN_KEY").ok();
        if let Some(key) = &admin_key {
            if key.len() < 32 {
                return Err(HubError::Configuration(
                    "AGENTCOM_ADMIN_KEY must be at least 32 characters".to_string(),
                ));
            }
        }

        let allowed_origins = env::var("AGENTCOM_ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let api = ApiConfig {
            host: env::var("AGENTCOM_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("AGENTCOM_PORT")
                .unwrap_or_else(|_| "7420".to_string())
                .parse()
                .map_err(|_| {
                    HubError::Configuration("AGENTCOM_PORT must be a valid port".to_string())
                })?,
            admin_key,
            allowed_origins,
        };

        let goals = GoalConfig {
            proposals_dir: env::var("AGENTCOM_PROPOSALS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| store.data_dir.join("proposals")),
            repo_roots: env::var("AGENTCOM_REPO_ROOTS")
                .unwrap_or_default()
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from)
                .collect(),
            improvement_tick_ms: env_u64("AGENTCOM_IMPROVEMENT_TICK_MS", 21_600_000),
        };

        Ok(Config {
            store,
            scheduler,
            agent,
            queue,
            budgets,
            rate_limits,
            llm,
            api,
            goals,
        })
    }

    fn default_budgets() -> HashMap<String, StateBudget> {
        let mut per_state = HashMap::new();
        per_state.insert(
            "executing".to_string(),
            StateBudget {
                max_invocations_per_window: Some(env_u64("AGENTCOM_BUDGET_EXECUTING_CALLS", 200)),
                max_cost_per_window: Some(env_f64("AGENTCOM_BUDGET_EXECUTING_COST", 20.0)),
                window_ms: 3_600_000,
            },
        );
        per_state.insert(
            "improving".to_string(),
            StateBudget {
                max_invocations_per_window: Some(env_u64("AGENTCOM_BUDGET_IMPROVING_CALLS", 50)),
                max_cost_per_window: Some(env_f64("AGENTCOM_BUDGET_IMPROVING_COST", 5.0)),
                window_ms: 3_600_000,
            },
        );
        per_state.insert(
            "contemplating".to_string(),
            StateBudget {
                max_invocations_per_window: Some(env_u64(
                    "AGENTCOM_BUDGET_CONTEMPLATING_CALLS",
                    20,
                )),
                max_cost_per_window: Some(env_f64("AGENTCOM_BUDGET_CONTEMPLATING_COST", 2.0)),
                window_ms: 3_600_000,
            },
        );
        per_state
    }

    /// Config for tests: everything under one temp directory, tight timers.
    pub fn for_testing(root: &std::path::Path) -> Self {
        Self {
            store: StoreConfig {
                data_dir: root.join("data"),
                backup_dir: root.join("backups"),
                backup_interval_ms: 3_600_000,
                backup_retention: 3,
                compaction_interval_ms: 21_600_000,
                compaction_threshold: 0.10,
                // Immediate durability keeps test assertions deterministic.
                sync_interval_ms: 0,
            },
            scheduler: SchedulerConfig {
                stuck_sweep_interval_ms: 100,
                stuck_threshold_ms: 1_500,
            },
            agent: AgentConfig {
                acceptance_timeout_ms: 60_000,
                heartbeat_interval_ms: 900_000,
            },
            queue: QueueConfig {
                max_retries: 3,
                max_queue_size: constants::MAX_QUEUE_SIZE,
            },
            budgets: BudgetConfig {
                per_state: Self::default_budgets(),
            },
            rate_limits: RateLimitConfig {
                tiers: HashMap::from([
                    (
                        "general".to_string(),
                        RateLimitTier {
                            per_minute: 600,
                            burst: 100,
                        },
                    ),
                    (
                        "task_submit".to_string(),
                        RateLimitTier {
                            per_minute: 600,
                            burst: 100,
                        },
                    ),
                ]),
            },
            llm: LlmConfig {
                base_url: "http://127.0.0.1:0".to_string(),
                api_key: None,
                model: "test-model".to_string(),
                timeout_ms: 1_000,
                max_tokens: 512,
            },
            api: ApiConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                admin_key: Some("test-admin-key-0123456789abcdef0123".to_string()),
                allowed_origins: vec![],
            },
            goals: GoalConfig {
                proposals_dir: root.join("proposals"),
                repo_roots: vec![],
                improvement_tick_ms: 21_600_000,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_has_all_default_budget_states() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_testing(dir.path());

        for state in ["executing", "improving", "contemplating"] {
            assert!(config.budgets.per_state.contains_key(state));
        }
    }

    #[test]
    fn compaction_threshold_default_is_ten_percent() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_testing(dir.path());
        assert!((config.store.compaction_threshold - 0.10).abs() < f64::EPSILON);
    }
}
