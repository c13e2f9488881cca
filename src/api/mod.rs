//! HTTP control surface.
//!
//! Thin axum layer over the hub: operators submit tasks and goals, inspect
//! agents and healing history, and manage agent tokens. Every route sits
//! behind the operator key; token management additionally lives under
//! `/admin`. Validation failures map to 422, auth to 401, rate limits to
//! 429 with a retry-after header, missing records to 404.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use subtle::ConstantTimeEq;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::{ApiConfig, Config};
use crate::hub::Hub;
use crate::models::{Priority, TaskStatus, TaskSubmission};
use crate::queue::TaskFilter;
use crate::validation::validate_metadata;
use crate::{HubError, Result};

const ROUTE_TASKS: &str = "/tasks";
const ROUTE_TASK_BY_ID: &str = "/tasks/{task_id}";
const ROUTE_TASK_RETRY: &str = "/tasks/{task_id}/retry";
const ROUTE_AGENTS: &str = "/agents";
const ROUTE_AGENT_STATE: &str = "/agents/{agent_id}/state";
const ROUTE_AGENT_RESTART: &str = "/agents/{agent_id}/restart";
const ROUTE_GOALS: &str = "/goals";
const ROUTE_GOAL_BY_ID: &str = "/goals/{goal_id}";
const ROUTE_HEALING_HISTORY: &str = "/healing-history";
const ROUTE_SCHEMAS: &str = "/schemas";
const ROUTE_STATUS: &str = "/status";
const ROUTE_HUB_PAUSE: &str = "/hub/pause";
const ROUTE_HUB_RESUME: &str = "/hub/resume";
const ROUTE_ADMIN_TOKENS: &str = "/admin/tokens";
const ROUTE_ADMIN_TOKEN_BY_ID: &str = "/admin/tokens/{agent_id}";

#[derive(Clone)]
pub struct ApiServer {
    config: ApiConfig,
    hub: Arc<Hub>,
}

struct AuthState {
    admin_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub description: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub submitted_by: Option<String>,
    #[serde(default)]
    pub needed_capabilities: Vec<String>,
    #[serde(default)]
    pub metadata: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct TaskQueryParams {
    pub status: Option<String>,
    pub priority: Option<String>,
    pub assigned_to: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateGoalRequest {
    pub title: String,
    pub description: String,
    pub success_criteria: String,
    #[serde(default)]
    pub priority: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GenerateTokenRequest {
    pub agent_id: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub state: String,
    pub paused: bool,
    pub connected_agents: usize,
    pub queued_tasks: usize,
    pub open_goals: usize,
    pub scheduler_passes: u64,
    pub scheduler_assignments: u64,
    pub ledger: crate::ledger::LedgerSnapshot,
    pub transitions: Vec<crate::hub::Transition>,
}

impl ApiServer {
    pub fn new(config: Config, hub: Arc<Hub>) -> Self {
        Self {
            config: config.api,
            hub,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let app = self.build_router();
        let listener =
            tokio::net::TcpListener::bind(format!("{}:{}", self.config.host, self.config.port))
                .await?;
        info!(
            "control surface listening on {}:{}",
            self.config.host, self.config.port
        );
        axum::serve(listener, app)
            .await
            .map_err(|e| HubError::Internal(e.into()))?;
        Ok(())
    }

    pub fn build_router(&self) -> Router {
        let auth_state = Arc::new(AuthState {
            admin_key: self.config.admin_key.clone(),
        });

        let cors = CorsLayer::new()
            .allow_origin(
                self.config
                    .allowed_origins
                    .iter()
                    .filter_map(|origin| origin.parse().ok())
                    .collect::<Vec<_>>(),
            )
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::DELETE,
            ])
            .allow_headers([
                axum::http::header::CONTENT_TYPE,
                axum::http::header::AUTHORIZATION,
                axum::http::HeaderName::from_static("x-api-key"),
            ]);

        Router::new()
            .route(ROUTE_TASKS, post(create_task).get(list_tasks))
            .route(ROUTE_TASK_BY_ID, get(get_task))
            .route(ROUTE_TASK_RETRY, post(retry_task))
            .route(ROUTE_AGENTS, get(list_agents))
            .route(ROUTE_AGENT_STATE, get(agent_state))
            .route(ROUTE_AGENT_RESTART, post(restart_agent))
            .route(ROUTE_GOALS, post(create_goal).get(list_goals))
            .route(ROUTE_GOAL_BY_ID, get(get_goal))
            .route(ROUTE_HEALING_HISTORY, get(healing_history))
            .route(ROUTE_SCHEMAS, get(schemas))
            .route(ROUTE_STATUS, get(status))
            .route(ROUTE_HUB_PAUSE, post(pause_hub))
            .route(ROUTE_HUB_RESUME, post(resume_hub))
            .route(ROUTE_ADMIN_TOKENS, post(generate_token).get(list_tokens))
            .route(ROUTE_ADMIN_TOKEN_BY_ID, axum::routing::delete(revoke_token))
            .layer(middleware::from_fn_with_state(
                auth_state,
                operator_auth_middleware,
            ))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .with_state(self.hub.clone())
    }
}

/// Operator-key gate in front of every route. The compare is constant-time
/// and the failure response never says which part was wrong.
async fn operator_auth_middleware(
    State(auth): State<Arc<AuthState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> std::result::Result<Response, Response> {
    let Some(expected) = auth.admin_key.as_deref() else {
        warn!("control surface has no operator key configured");
        return Err(error_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            "server misconfigured",
        ));
    };

    let provided = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        });

    match provided {
        Some(key) if bool::from(key.as_bytes().ct_eq(expected.as_bytes())) => {
            Ok(next.run(request).await)
        }
        _ => {
            warn!(path = %request.uri().path(), "rejected unauthenticated request");
            Err(error_body(StatusCode::UNAUTHORIZED, "unauthorized"))
        }
    }
}

fn error_body(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Maps hub errors onto the documented status codes.
fn into_response(e: HubError) -> Response {
    match &e {
        HubError::Validation(msg) => error_body(StatusCode::UNPROCESSABLE_ENTITY, msg),
        HubError::Unauthorized => error_body(StatusCode::UNAUTHORIZED, "unauthorized"),
        HubError::NotFound(what) => error_body(StatusCode::NOT_FOUND, what),
        HubError::RateLimited { retry_after_ms } => {
            let mut response =
                error_body(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
            let seconds = (retry_after_ms / 1000).max(1);
            if let Ok(value) = axum::http::HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
            response
        }
        HubError::QueueFull => {
            error_body(StatusCode::TOO_MANY_REQUESTS, "queue is full, retry later")
        }
        HubError::InvalidTransition { .. } => {
            error_body(StatusCode::CONFLICT, &e.to_string())
        }
        _ => error_body(StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
    }
}

fn parse_priority(value: Option<&str>) -> Result<Priority> {
    match value {
        None => Ok(Priority::Normal),
        Some(raw) => {
            Priority::from_str(raw).map_err(HubError::Validation)
        }
    }
}

async fn create_task(
    State(hub): State<Arc<Hub>>,
    Json(request): Json<CreateTaskRequest>,
) -> Response {
    let submitter = request
        .submitted_by
        .unwrap_or_else(|| "operator".to_string());
    if let Err(e) = hub.gate.check(&submitter, "task_submit").await {
        return into_response(e);
    }
    if let Err(e) = validate_metadata(&request.metadata) {
        return into_response(e);
    }
    let priority = match parse_priority(request.priority.as_deref()) {
        Ok(priority) => priority,
        Err(e) => return into_response(e),
    };

    let submission = TaskSubmission {
        description: request.description,
        priority,
        submitted_by: submitter,
        needed_capabilities: request.needed_capabilities.into_iter().collect(),
        metadata: request.metadata,
        depends_on: request.depends_on.into_iter().collect(),
        goal_id: None,
        complexity_tier: None,
        verification_steps: vec![],
        max_retries: request.max_retries,
    };
    match hub.queue.submit(submission).await {
        Ok(task) => (StatusCode::CREATED, Json(task)).into_response(),
        Err(e) => into_response(e),
    }
}

async fn list_tasks(
    State(hub): State<Arc<Hub>>,
    Query(params): Query<TaskQueryParams>,
) -> Response {
    let status = match params.status.as_deref().map(TaskStatus::from_str).transpose() {
        Ok(status) => status,
        Err(e) => return into_response(HubError::Validation(e)),
    };
    let priority = match params.priority.as_deref().map(Priority::from_str).transpose() {
        Ok(priority) => priority,
        Err(e) => return into_response(HubError::Validation(e)),
    };

    let tasks = hub
        .queue
        .list(&TaskFilter {
            status,
            priority,
            assigned_to: params.assigned_to,
            goal_id: None,
        })
        .await;
    Json(tasks).into_response()
}

async fn get_task(State(hub): State<Arc<Hub>>, Path(task_id): Path<String>) -> Response {
    match hub.queue.get(&task_id).await {
        Some(task) => Json(task).into_response(),
        None => into_response(HubError::NotFound(format!("task {task_id}"))),
    }
}

async fn retry_task(State(hub): State<Arc<Hub>>, Path(task_id): Path<String>) -> Response {
    match hub.queue.dead_letter_retry(&task_id).await {
        Ok(task) => Json(task).into_response(),
        Err(e) => into_response(e),
    }
}

async fn list_agents(State(hub): State<Arc<Hub>>) -> Response {
    Json(hub.supervisor.list_all().await).into_response()
}

async fn agent_state(State(hub): State<Arc<Hub>>, Path(agent_id): Path<String>) -> Response {
    match hub.supervisor.snapshot(&agent_id).await {
        Some(snapshot) => Json(snapshot).into_response(),
        None => into_response(HubError::NotFound(format!("agent {agent_id}"))),
    }
}

async fn restart_agent(State(hub): State<Arc<Hub>>, Path(agent_id): Path<String>) -> Response {
    let Some(handle) = hub.supervisor.lookup(&agent_id).await else {
        return into_response(HubError::NotFound(format!("agent {agent_id}")));
    };
    // Sever the session and stop the actor; the agent's own supervisor is
    // expected to reconnect it with a fresh session.
    if let Some(session) = handle.session.upgrade() {
        session.close();
    }
    hub.supervisor.stop(&agent_id).await;
    (StatusCode::ACCEPTED, Json(json!({ "restarting": agent_id }))).into_response()
}

async fn create_goal(
    State(hub): State<Arc<Hub>>,
    Json(request): Json<CreateGoalRequest>,
) -> Response {
    let priority = match parse_priority(request.priority.as_deref()) {
        Ok(priority) => priority,
        Err(e) => return into_response(e),
    };
    let submission = crate::goals::GoalSubmission {
        title: request.title,
        description: request.description,
        success_criteria: request.success_criteria,
        priority,
    };
    match hub.goals.submit(submission).await {
        Ok(goal) => (StatusCode::CREATED, Json(goal)).into_response(),
        Err(e) => into_response(e),
    }
}

async fn list_goals(State(hub): State<Arc<Hub>>) -> Response {
    Json(hub.goals.list().await).into_response()
}

async fn get_goal(State(hub): State<Arc<Hub>>, Path(goal_id): Path<String>) -> Response {
    match hub.goals.get(&goal_id).await {
        Some(goal) => Json(goal).into_response(),
        None => into_response(HubError::NotFound(format!("goal {goal_id}"))),
    }
}

async fn healing_history(State(hub): State<Arc<Hub>>) -> Response {
    Json(json!({
        "healing": hub.health.healing_history().await,
        "store_recoveries": hub.recovery_history().await,
    }))
    .into_response()
}

async fn schemas(State(hub): State<Arc<Hub>>) -> Response {
    Json(hub.validator.schemas()).into_response()
}

async fn status(State(hub): State<Arc<Hub>>) -> Response {
    let (state, paused, transitions) = {
        let fsm = hub.fsm.lock().await;
        (fsm.state(), fsm.paused(), fsm.history())
    };
    let stats = hub.scheduler.stats();
    Json(StatusResponse {
        state: state.to_string(),
        paused,
        connected_agents: hub.presence.connected_count().await,
        queued_tasks: hub.queue.queued_count().await,
        open_goals: hub.goals.open_count().await,
        scheduler_passes: stats.passes.load(std::sync::atomic::Ordering::Relaxed),
        scheduler_assignments: stats
            .assignments
            .load(std::sync::atomic::Ordering::Relaxed),
        ledger: hub.ledger.snapshot().await,
        transitions,
    })
    .into_response()
}

async fn pause_hub(State(hub): State<Arc<Hub>>) -> Response {
    hub.pause().await;
    Json(json!({ "paused": true })).into_response()
}

async fn resume_hub(State(hub): State<Arc<Hub>>) -> Response {
    hub.resume().await;
    Json(json!({ "paused": false })).into_response()
}

async fn generate_token(
    State(hub): State<Arc<Hub>>,
    Json(request): Json<GenerateTokenRequest>,
) -> Response {
    if request.agent_id.trim().is_empty() {
        return into_response(HubError::Validation("agent_id is required".to_string()));
    }
    match hub.tokens.generate(&request.agent_id).await {
        Ok(token) => (
            StatusCode::CREATED,
            Json(json!({ "agent_id": request.agent_id, "token": token })),
        )
            .into_response(),
        Err(e) => into_response(e),
    }
}

async fn list_tokens(State(hub): State<Arc<Hub>>) -> Response {
    Json(hub.tokens.list().await).into_response()
}

async fn revoke_token(State(hub): State<Arc<Hub>>, Path(agent_id): Path<String>) -> Response {
    match hub.tokens.revoke(&agent_id).await {
        Ok(true) => Json(json!({ "revoked": agent_id })).into_response(),
        Ok(false) => into_response(HubError::NotFound(format!("token for {agent_id}"))),
        Err(e) => into_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::llm::testing::ScriptedTransport;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::util::ServiceExt;

    const TEST_KEY: &str = "test-admin-key-0123456789abcdef0123";

    async fn router() -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_testing(dir.path());
        let hub = Hub::new(
            config.clone(),
            Arc::new(ScriptedTransport::new(vec![])),
        )
        .await
        .unwrap();
        (ApiServer::new(config, hub).build_router(), dir)
    }

    fn request(method: &str, uri: &str, body: Option<serde_json::Value>) -> HttpRequest<Body> {
        let builder = HttpRequest::builder()
            .method(method)
            .uri(uri)
            .header("x-api-key", TEST_KEY)
            .header("content-type", "application/json");
        match body {
            Some(body) => builder.body(Body::from(body.to_string())).unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    #[tokio::test]
    async fn missing_key_is_unauthorized() {
        let (router, _dir) = router().await;
        let response = router
            .oneshot(
                HttpRequest::builder()
                    .uri("/tasks")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn task_submit_and_fetch_round_trip() {
        let (router, _dir) = router().await;

        let response = router
            .clone()
            .oneshot(request(
                "POST",
                "/tasks",
                Some(json!({ "description": "do it", "priority": "high" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let task: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let task_id = task["id"].as_str().unwrap();

        let response = router
            .oneshot(request("GET", &format!("/tasks/{task_id}"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn empty_description_is_unprocessable() {
        let (router, _dir) = router().await;
        let response = router
            .oneshot(request(
                "POST",
                "/tasks",
                Some(json!({ "description": "   " })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let (router, _dir) = router().await;
        let response = router
            .oneshot(request("GET", "/tasks/nope", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn token_lifecycle_over_admin_routes() {
        let (router, _dir) = router().await;

        let response = router
            .clone()
            .oneshot(request(
                "POST",
                "/admin/tokens",
                Some(json!({ "agent_id": "a1" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = router
            .clone()
            .oneshot(request("GET", "/admin/tokens", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .clone()
            .oneshot(request("DELETE", "/admin/tokens/a1", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(request("DELETE", "/admin/tokens/a1", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn schemas_and_status_are_served() {
        let (router, _dir) = router().await;

        let response = router
            .clone()
            .oneshot(request("GET", "/schemas", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router.oneshot(request("GET", "/status", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let status: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(status["state"], "resting");
    }
}
