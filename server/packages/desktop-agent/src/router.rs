use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use desktop_agent_error::{DesktopError, ErrorType, ProblemDetails};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info, Span};
use utoipa::{Modify, OpenApi, ToSchema};

use crate::relay::DisplayRelay;
use crate::session::{to_sse_stream, SessionManager, SessionStatus, SessionSummary, StartRequest};

#[derive(Debug)]
pub struct AppState {
    auth: AuthConfig,
    sessions: Arc<SessionManager>,
    relay: Arc<DisplayRelay>,
}

impl AppState {
    pub fn new(auth: AuthConfig, sessions: Arc<SessionManager>, relay: Arc<DisplayRelay>) -> Self {
        Self {
            auth,
            sessions,
            relay,
        }
    }

    pub fn sessions(&self) -> Arc<SessionManager> {
        self.sessions.clone()
    }

    fn sandbox_name(&self) -> &str {
        &self.sessions.config().sandbox_name
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub token: Option<String>,
}

impl AuthConfig {
    pub fn disabled() -> Self {
        Self { token: None }
    }

    pub fn with_token(token: String) -> Self {
        Self { token: Some(token) }
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let mut api_router = Router::new()
        .route("/start-container", post(start_container))
        .route("/run-agent", post(run_agent))
        .route("/logs/:session_id", get(get_logs_sse))
        .route("/cancel-agent/:session_id", post(cancel_agent))
        .route("/sessions", get(list_sessions))
        .with_state(shared.clone());

    if shared.auth.token.is_some() {
        api_router = api_router.layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_token,
        ));
    }

    let mut router = Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
        .with_state(shared.clone())
        .merge(api_router)
        .fallback(not_found);

    let http_logging = match std::env::var("DESKTOP_AGENT_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

/// Stops the relay, cancels running sessions and tears the sandbox down.
pub async fn shutdown(state: &Arc<AppState>) {
    info!("cleaning up resources");
    state.sessions.shutdown().await;
    state.relay.stop().await;
    state.sessions.sandboxes().shutdown().await;
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        start_container,
        run_agent,
        get_logs_sse,
        cancel_agent,
        list_sessions
    ),
    components(
        schemas(
            HealthResponse,
            StartContainerRequest,
            StartContainerResponse,
            RunAgentRequest,
            RunAgentResponse,
            CancelAgentResponse,
            SessionListResponse,
            SessionSummary,
            SessionStatus,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "sandbox", description = "Sandbox lifecycle"),
        (name = "agent", description = "Agent sessions")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:5000")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Desktop(#[from] DesktopError),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Desktop(DesktopError::Validation {
            message: rejection.body_text(),
        })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Desktop(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct HealthResponse {
    pub status: String,
    pub container_running: bool,
    pub novnc_port: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct StartContainerRequest {
    /// Host the noVNC viewer is reached on; only used in log lines.
    #[serde(default)]
    pub host: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartContainerResponse {
    pub logs: Vec<String>,
    pub novnc_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct RunAgentRequest {
    #[serde(default)]
    pub messages: String,
    #[serde(default)]
    pub auto_mode: bool,
    #[serde(default)]
    pub safety_acknowledged: bool,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct RunAgentResponse {
    pub session_id: String,
    #[serde(rename = "novncPort")]
    pub novnc_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct CancelAgentResponse {
    pub session_id: String,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionSummary>,
}

async fn require_token(
    State(state): State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let expected = match &state.auth.token {
        Some(token) => token.as_str(),
        None => return Ok(next.run(req).await),
    };

    let provided = extract_token(req.headers());
    if provided.as_deref() == Some(expected) {
        Ok(next.run(req).await)
    } else {
        Err(DesktopError::TokenInvalid {
            message: Some("missing or invalid token".to_string()),
        }
        .into())
    }
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, rest) = value.trim().split_once(' ')?;
    match scheme.to_ascii_lowercase().as_str() {
        "bearer" | "token" => Some(rest.trim().to_string()),
        _ => None,
    }
}

const SERVER_INFO: &str = "\
This is a desktop agent server. Available endpoints:\n\
  - GET  /                          - Server info\n\
  - GET  /health                    - Health check\n\
  - POST /start-container           - Start the sandbox and noVNC relay\n\
  - POST /run-agent                 - Start or resume an agent session\n\
  - GET  /logs/{session_id}         - Session progress (SSE)\n\
  - POST /cancel-agent/{session_id} - Cancel a session\n\
  - GET  /sessions                  - List sessions";

async fn get_root() -> &'static str {
    SERVER_INFO
}

async fn not_found() -> (StatusCode, String) {
    (
        StatusCode::NOT_FOUND,
        format!("404 Not Found\n\n{SERVER_INFO}"),
    )
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Server is healthy", body = HealthResponse)),
    tag = "meta"
)]
/// Health Check
///
/// Reports whether the sandbox container is running and the relay port.
async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let container_running = state
        .sessions
        .sandboxes()
        .is_running(state.sandbox_name())
        .await;
    Json(HealthResponse {
        status: "healthy".to_string(),
        container_running,
        novnc_port: state.relay.port().await,
    })
}

#[utoipa::path(
    post,
    path = "/start-container",
    request_body = StartContainerRequest,
    responses(
        (status = 200, description = "Startup logs; novncPort is null when startup failed", body = StartContainerResponse)
    ),
    tag = "sandbox"
)]
/// Start Container
///
/// Ensures the sandbox is running and the noVNC relay is listening.
async fn start_container(
    State(state): State<Arc<AppState>>,
    body: Option<Json<StartContainerRequest>>,
) -> Json<StartContainerResponse> {
    let host = body
        .and_then(|Json(request)| request.host)
        .unwrap_or_else(|| "localhost".to_string());
    let mut logs = Vec::new();
    let novnc_port = match start_display(&state, &host, &mut logs).await {
        Ok(port) => Some(port),
        Err(err) => {
            error!(error = %err, "failed to start container");
            logs.push(format!("Failed to start container: {err}"));
            None
        }
    };
    Json(StartContainerResponse { logs, novnc_port })
}

async fn start_display(
    state: &AppState,
    host: &str,
    logs: &mut Vec<String>,
) -> Result<u16, DesktopError> {
    let sandbox = state
        .sessions
        .sandboxes()
        .ensure_running(state.sandbox_name())
        .await?;
    logs.push(format!(
        "Container started: {} ({})",
        sandbox.name, sandbox.container_id
    ));

    let port = state.relay.start(sandbox.vnc_port).await?;
    logs.push(format!(
        "Started noVNC server on http://{host}:{port}/vnc.html with vnc_port {}",
        sandbox.vnc_port
    ));
    Ok(port)
}

#[utoipa::path(
    post,
    path = "/run-agent",
    request_body = RunAgentRequest,
    responses(
        (status = 200, description = "Agent run started", body = RunAgentResponse),
        (status = 400, description = "Invalid request", body = ProblemDetails),
        (status = 404, description = "Session not found", body = ProblemDetails),
        (status = 409, description = "Session running or sandbox busy", body = ProblemDetails),
        (status = 503, description = "Sandbox could not be provisioned", body = ProblemDetails)
    ),
    tag = "agent"
)]
/// Run Agent
///
/// Starts a new agent session, or resumes a suspended one when `session_id`
/// is given. Progress is streamed from `/logs/{session_id}`.
async fn run_agent(
    State(state): State<Arc<AppState>>,
    body: Result<Json<RunAgentRequest>, JsonRejection>,
) -> Result<Json<RunAgentResponse>, ApiError> {
    let Json(request) = body?;
    let started = state
        .sessions
        .start(StartRequest {
            messages: request.messages,
            auto_mode: request.auto_mode,
            safety_acknowledged: request.safety_acknowledged,
            session_id: request.session_id,
        })
        .await?;
    Ok(Json(RunAgentResponse {
        session_id: started.session_id,
        novnc_port: state.relay.port().await,
    }))
}

#[utoipa::path(
    get,
    path = "/logs/{session_id}",
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, description = "SSE stream of progress events"),
        (status = 404, description = "Session not found", body = ProblemDetails)
    ),
    tag = "agent"
)]
/// Stream Session Progress (SSE)
///
/// Replays the current run's events, then streams live ones until `complete`.
async fn get_logs_sse(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let events = state.sessions.attach(&session_id).await?;
    Ok(Sse::new(to_sse_stream(events)))
}

#[utoipa::path(
    post,
    path = "/cancel-agent/{session_id}",
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, description = "Session cancelled", body = CancelAgentResponse),
        (status = 404, description = "Session not found", body = ProblemDetails)
    ),
    tag = "agent"
)]
/// Cancel Agent
///
/// Cancels the session's run. Actions already in flight finish first.
async fn cancel_agent(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<CancelAgentResponse>, ApiError> {
    state.sessions.cancel(&session_id).await?;
    Ok(Json(CancelAgentResponse {
        session_id,
        status: SessionStatus::Cancelled,
    }))
}

#[utoipa::path(
    get,
    path = "/sessions",
    responses((status = 200, description = "Known sessions", body = SessionListResponse)),
    tag = "agent"
)]
/// List Sessions
async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<SessionListResponse> {
    Json(SessionListResponse {
        sessions: state.sessions.list().await,
    })
}
