// Shared fakes and HTTP helpers for the desktop agent integration tests.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use desktop_agent::actions::Action;
use desktop_agent::decision::{
    Decision, DecisionRequest, DecisionResponse, DecisionService, DecisionServiceError,
    PendingCall, SafetyCheck,
};
use desktop_agent::executor::CommandOutput;
use desktop_agent::ports::PortAllocator;
use desktop_agent::relay::{DisplayRelay, RelayConfig};
use desktop_agent::router::{build_router_with_state, AppState, AuthConfig};
use desktop_agent::sandbox::{
    ContainerInfo, ContainerRuntime, ContainerSpec, RuntimeError, SandboxConfig, SandboxManager,
};
use desktop_agent::session::{SessionManager, SessionManagerConfig};

/// In-memory container engine. Exec calls are recorded as argv vectors.
#[derive(Default)]
struct FakeRuntime {
    containers: Mutex<HashMap<String, ContainerInfo>>,
    execs: Mutex<Vec<Vec<String>>>,
    creates: Mutex<usize>,
    pulls: Mutex<usize>,
    fail_pulls: Mutex<usize>,
    image_cached: Mutex<bool>,
    fail_tokens: Mutex<HashSet<String>>,
    slow_tokens: Mutex<HashMap<String, Duration>>,
}

impl FakeRuntime {
    fn new() -> Arc<Self> {
        let runtime = Self::default();
        *runtime.image_cached.lock().unwrap() = true;
        Arc::new(runtime)
    }

    fn creates(&self) -> usize {
        *self.creates.lock().unwrap()
    }

    fn pulls(&self) -> usize {
        *self.pulls.lock().unwrap()
    }

    /// The next `count` pulls fail.
    fn fail_next_pulls(&self, count: usize) {
        *self.fail_pulls.lock().unwrap() = count;
    }

    fn set_image_cached(&self, cached: bool) {
        *self.image_cached.lock().unwrap() = cached;
    }

    fn fail_on(&self, token: &str) {
        self.fail_tokens.lock().unwrap().insert(token.to_string());
    }

    /// Execs mentioning `token` take `delay` to finish.
    fn delay_on(&self, token: &str, delay: Duration) {
        self.slow_tokens
            .lock()
            .unwrap()
            .insert(token.to_string(), delay);
    }

    fn stop_container(&self, name: &str) {
        if let Some(info) = self.containers.lock().unwrap().get_mut(name) {
            info.running = false;
        }
    }

    fn insert_container(&self, name: &str, running: bool) {
        self.containers.lock().unwrap().insert(
            name.to_string(),
            ContainerInfo {
                id: format!("{name}-id"),
                running,
            },
        );
    }

    fn execs(&self) -> Vec<Vec<String>> {
        self.execs.lock().unwrap().clone()
    }

    fn execs_containing(&self, token: &str) -> usize {
        self.execs()
            .iter()
            .filter(|argv| argv.iter().any(|arg| arg == token))
            .count()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>, RuntimeError> {
        Ok(self.containers.lock().unwrap().get(name).cloned())
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        match self.containers.lock().unwrap().get_mut(name) {
            Some(info) => {
                info.running = true;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(name.to_string())),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        *self.pulls.lock().unwrap() += 1;
        let mut failures = self.fail_pulls.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(RuntimeError::Other(format!("registry unreachable for {image}")));
        }
        *self.image_cached.lock().unwrap() = true;
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        if !*self.image_cached.lock().unwrap() {
            return Err(RuntimeError::ImageNotFound(spec.image.clone()));
        }
        *self.creates.lock().unwrap() += 1;
        let id = format!("{}-id", spec.name);
        self.containers.lock().unwrap().insert(
            spec.name.clone(),
            ContainerInfo {
                id: id.clone(),
                running: false,
            },
        );
        Ok(id)
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        match self.containers.lock().unwrap().get_mut(name) {
            Some(info) => {
                info.running = false;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(name.to_string())),
        }
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        self.containers
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))
    }

    async fn exec(
        &self,
        _name: &str,
        argv: Vec<String>,
        _env: Vec<String>,
    ) -> Result<CommandOutput, RuntimeError> {
        let fails = {
            let tokens = self.fail_tokens.lock().unwrap();
            argv.iter().any(|arg| tokens.contains(arg))
        };
        let delay = {
            let slow = self.slow_tokens.lock().unwrap();
            argv.iter().find_map(|arg| slow.get(arg).copied())
        };
        let is_capture = argv.first().map(String::as_str) == Some("import");
        self.execs.lock().unwrap().push(argv);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fails {
            return Ok(CommandOutput {
                stdout: Vec::new(),
                stderr: b"command failed".to_vec(),
                exit_code: 1,
            });
        }
        Ok(CommandOutput {
            stdout: if is_capture { b"PNGDATA".to_vec() } else { Vec::new() },
            stderr: Vec::new(),
            exit_code: 0,
        })
    }
}

/// Replays scripted decisions. Once the script runs out, `decide` never
/// returns, which keeps a run busy until it is cancelled.
#[derive(Default)]
struct ScriptedDecisions {
    script: Mutex<VecDeque<Result<Decision, DecisionServiceError>>>,
    requests: Mutex<usize>,
}

impl ScriptedDecisions {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, decision: Decision) {
        self.script.lock().unwrap().push_back(Ok(decision));
    }

    fn push_error(&self, error: DecisionServiceError) {
        self.script.lock().unwrap().push_back(Err(error));
    }

    fn requests(&self) -> usize {
        *self.requests.lock().unwrap()
    }
}

#[async_trait]
impl DecisionService for ScriptedDecisions {
    async fn decide(
        &self,
        _request: DecisionRequest<'_>,
    ) -> Result<DecisionResponse, DecisionServiceError> {
        *self.requests.lock().unwrap() += 1;
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(result) => result.map(|decision| DecisionResponse {
                response_id: Some("resp_test".to_string()),
                decision,
            }),
            None => std::future::pending().await,
        }
    }
}

fn command(call_id: &str, action: Action) -> Decision {
    Decision::Command(PendingCall {
        call_id: call_id.to_string(),
        action,
        safety_checks: Vec::new(),
    })
}

fn gated_command(call_id: &str, action: Action) -> Decision {
    Decision::Command(PendingCall {
        call_id: call_id.to_string(),
        action,
        safety_checks: vec![SafetyCheck {
            id: "sc_1".to_string(),
            code: Some("sensitive_domain".to_string()),
            message: "Navigating to a sensitive domain".to_string(),
        }],
    })
}

fn final_answer(text: &str) -> Decision {
    Decision::Final {
        text: text.to_string(),
    }
}

struct TestApp {
    app: Router,
    runtime: Arc<FakeRuntime>,
    decisions: Arc<ScriptedDecisions>,
    sandboxes: Arc<SandboxManager>,
}

impl TestApp {
    fn new() -> Self {
        Self::with_options(AuthConfig::disabled(), SessionManagerConfig::default(), Duration::ZERO)
    }

    fn with_auth(auth: AuthConfig) -> Self {
        Self::with_options(auth, SessionManagerConfig::default(), Duration::ZERO)
    }

    fn with_sessions(config: SessionManagerConfig) -> Self {
        Self::with_options(AuthConfig::disabled(), config, Duration::ZERO)
    }

    /// Sandbox (re)starts wait `settle_delay` before the run may proceed.
    fn with_settle_delay(settle_delay: Duration) -> Self {
        Self::with_options(
            AuthConfig::disabled(),
            SessionManagerConfig::default(),
            settle_delay,
        )
    }

    fn with_options(
        auth: AuthConfig,
        sessions: SessionManagerConfig,
        settle_delay: Duration,
    ) -> Self {
        let runtime = FakeRuntime::new();
        let decisions = ScriptedDecisions::new();
        let sandboxes = Arc::new(SandboxManager::new(
            runtime.clone(),
            SandboxConfig {
                settle_delay,
                ..SandboxConfig::default()
            },
        ));
        let manager = SessionManager::new(sandboxes.clone(), decisions.clone(), sessions);
        let relay = Arc::new(DisplayRelay::new(
            RelayConfig {
                python: "/nonexistent/desktop-agent-test-python".to_string(),
                ..RelayConfig::default()
            },
            Arc::new(PortAllocator::with_probe(6080, 5, Arc::new(|_: u16| true))),
        ));
        let state = Arc::new(AppState::new(auth, manager, relay));
        let (app, _) = build_router_with_state(state);
        Self {
            app,
            runtime,
            decisions,
            sandboxes,
        }
    }

    async fn run_agent(&self, body: Value) -> (StatusCode, Value) {
        send_json(&self.app, Method::POST, "/run-agent", Some(body)).await
    }

    async fn start_task(&self, messages: &str, auto_mode: bool) -> String {
        let (status, payload) = self
            .run_agent(json!({"messages": messages, "auto_mode": auto_mode}))
            .await;
        assert_eq!(status, StatusCode::OK, "run-agent failed: {payload}");
        payload["session_id"]
            .as_str()
            .expect("session id")
            .to_string()
    }

    /// Progress events of the session's current run, heartbeats removed.
    async fn events(&self, session_id: &str) -> Vec<Value> {
        read_events(&self.app, session_id)
            .await
            .into_iter()
            .filter(|event| event["type"] != "heartbeat")
            .collect()
    }
}

async fn send_request(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request handled");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    (status, bytes.to_vec())
}

async fn send_json(app: &Router, method: Method, path: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    let body = if let Some(body) = body {
        builder = builder.header("content-type", "application/json");
        Body::from(body.to_string())
    } else {
        Body::empty()
    };
    let request = builder.body(body).expect("request");
    let (status, bytes) = send_request(app, request).await;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    (status, value)
}

fn parse_sse(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).expect("sse data is json"))
        .collect()
}

async fn read_events(app: &Router, session_id: &str) -> Vec<Value> {
    let request = Request::builder()
        .method(Method::GET)
        .uri(format!("/logs/{session_id}"))
        .body(Body::empty())
        .expect("request");
    let (status, bytes) = tokio::time::timeout(Duration::from_secs(10), send_request(app, request))
        .await
        .expect("event stream ended");
    assert_eq!(status, StatusCode::OK, "logs request failed");
    parse_sse(&String::from_utf8_lossy(&bytes))
}

fn event_types(events: &[Value]) -> Vec<String> {
    events
        .iter()
        .map(|event| event["type"].as_str().unwrap_or_default().to_string())
        .collect()
}
