use thiserror::Error;

/// Convenience type alias for Results with HubError
pub type Result<T> = std::result::Result<T, HubError>;

/// Main error type for the AgentCom hub
///
/// Every fallible operation in the hub resolves to one of these variants.
/// Validation and authorization errors are rejected at the boundary; store
/// and transport errors carry enough context for recovery decisions.
#[derive(Error, Debug)]
pub enum HubError {
    #[error("Store error on table {table}: {message}")]
    Store { table: String, message: String },

    #[error("Table {0} is corrupted")]
    TableCorrupted(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Stale generation {generation} for task {task_id}")]
    StaleGeneration { task_id: String, generation: u64 },

    #[error("Task {task_id} is not in a state that permits {operation}")]
    InvalidTransition { task_id: String, operation: String },

    #[error("Queue is full")]
    QueueFull,

    #[error("Agent error: {message}")]
    Agent { message: String },

    #[error("Session closed")]
    SessionClosed,

    #[error("LLM transport error: {0}")]
    Llm(String),

    #[error("Budget exhausted for state {0}")]
    BudgetExhausted(String),

    #[error("Timeout: {message}")]
    Timeout { message: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl HubError {
    /// Whether the caller may retry the same operation after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HubError::RateLimited { .. }
                | HubError::QueueFull
                | HubError::Timeout { .. }
                | HubError::Http(_)
        )
    }
}
