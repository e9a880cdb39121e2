//! Command API served from inside the sandbox container.
//!
//! One route per action plus a generic `/action` dispatcher. Commands run
//! locally against the container's display.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use desktop_agent_error::DesktopError;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::actions::{Action, ActionResult, DEFAULT_WAIT_SECONDS};
use crate::executor::ActionExecutor;
use crate::router::ApiError;

const ACTION_TYPES: [&str; 9] = [
    "click",
    "double_click",
    "scroll",
    "keypress",
    "type",
    "wait",
    "screenshot",
    "goto",
    "navigate",
];

#[derive(Debug, Clone)]
pub struct SandboxApiState {
    executor: ActionExecutor,
}

impl SandboxApiState {
    pub fn new(executor: ActionExecutor) -> Self {
        Self { executor }
    }
}

pub fn build_sandbox_router(state: SandboxApiState) -> Router {
    Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
        .route("/click", post(post_click))
        .route("/scroll", post(post_scroll))
        .route("/keypress", post(post_keypress))
        .route("/type", post(post_type))
        .route("/wait", post(post_wait))
        .route("/screenshot", get(get_screenshot))
        .route("/action", post(post_action))
        .with_state(Arc::new(state))
        .layer(TraceLayer::new_for_http())
}

type ApiResult = Result<Json<ActionResult>, ApiError>;

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload.map(|Json(value)| value).map_err(ApiError::from)
}

async fn run(state: &SandboxApiState, action: Action) -> ApiResult {
    Ok(Json(state.executor.dispatch(&action).await?))
}

async fn get_root() -> Json<Value> {
    Json(json!({
        "name": "desktop-agent sandbox API",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": [
            "/health", "/click", "/scroll", "/keypress", "/type", "/wait", "/screenshot", "/action"
        ],
    }))
}

async fn get_health() -> Json<Value> {
    Json(json!({"status": "healthy"}))
}

#[derive(Debug, Deserialize)]
struct ClickRequest {
    x: i32,
    y: i32,
    #[serde(default)]
    button: Option<String>,
}

async fn post_click(
    State(state): State<Arc<SandboxApiState>>,
    payload: Result<Json<ClickRequest>, JsonRejection>,
) -> ApiResult {
    let request = body(payload)?;
    run(
        &state,
        Action::Click {
            x: request.x,
            y: request.y,
            button: request.button.unwrap_or_else(|| "left".to_string()),
        },
    )
    .await
}

#[derive(Debug, Deserialize)]
struct ScrollRequest {
    x: i32,
    y: i32,
    #[serde(default)]
    scroll_x: i32,
    #[serde(default)]
    scroll_y: i32,
}

async fn post_scroll(
    State(state): State<Arc<SandboxApiState>>,
    payload: Result<Json<ScrollRequest>, JsonRejection>,
) -> ApiResult {
    let request = body(payload)?;
    run(
        &state,
        Action::Scroll {
            x: request.x,
            y: request.y,
            scroll_x: request.scroll_x,
            scroll_y: request.scroll_y,
        },
    )
    .await
}

#[derive(Debug, Deserialize)]
struct KeypressRequest {
    keys: Vec<String>,
}

async fn post_keypress(
    State(state): State<Arc<SandboxApiState>>,
    payload: Result<Json<KeypressRequest>, JsonRejection>,
) -> ApiResult {
    let request = body(payload)?;
    run(&state, Action::Keypress { keys: request.keys }).await
}

#[derive(Debug, Deserialize)]
struct TypeRequest {
    text: String,
}

async fn post_type(
    State(state): State<Arc<SandboxApiState>>,
    payload: Result<Json<TypeRequest>, JsonRejection>,
) -> ApiResult {
    let request = body(payload)?;
    run(&state, Action::Type { text: request.text }).await
}

#[derive(Debug, Deserialize)]
struct WaitRequest {
    #[serde(default)]
    seconds: Option<f64>,
}

async fn post_wait(
    State(state): State<Arc<SandboxApiState>>,
    payload: Result<Json<WaitRequest>, JsonRejection>,
) -> ApiResult {
    let request = body(payload)?;
    run(
        &state,
        Action::Wait {
            seconds: request.seconds.unwrap_or(DEFAULT_WAIT_SECONDS),
        },
    )
    .await
}

async fn get_screenshot(State(state): State<Arc<SandboxApiState>>) -> Json<ActionResult> {
    Json(state.executor.screenshot().await)
}

/// Parses a tagged action body, reporting the missing piece on failure.
pub fn parse_action(value: Value) -> Result<Action, DesktopError> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| DesktopError::Validation {
            message: "action requires a type".to_string(),
        })?
        .to_string();
    if !ACTION_TYPES.contains(&kind.as_str()) {
        return Err(DesktopError::Validation {
            message: format!("Unknown action type: {kind}"),
        });
    }
    serde_json::from_value(value).map_err(|err| DesktopError::Validation {
        message: format!("{kind} action: {err}"),
    })
}

async fn post_action(
    State(state): State<Arc<SandboxApiState>>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let action = parse_action(body(payload)?)?;
    run(&state, action).await
}
