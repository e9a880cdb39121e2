//! Session manager: runs agent loops in isolation per session id.
//!
//! Each run of a session's loop executes in its own tokio task and writes
//! [`ProgressEvent`]s to a per-run log plus a broadcast channel. Listeners
//! get the run's earlier events replayed, then live ones, until the run's
//! single `complete` event.

use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use desktop_agent_error::DesktopError;
use futures::stream::{self, Stream};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::actions::{Action, ActionResult};
use crate::agent_loop::{AgentLoop, LoopEvents, LoopOptions, TurnOutcome};
use crate::decision::DecisionService;
use crate::executor::ActionExecutor;
use crate::sandbox::SandboxManager;

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(60);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_CANCEL_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

pub const STARTED_MESSAGE: &str = "Performing desktop action...";
pub const CANCELLED_MESSAGE: &str = "Agent cancelled by user";

/// Operator instructions appended to every new task.
pub const DEFAULT_PROMPT_SUFFIX: &str = "

THESE ARE INSTRUCTIONS FOR COMPLETING THE ACTION SUCCESSFULLY. THEY ARE APPENDED AFTER EVERY MESSAGE AND ARE NOT USER PROVIDED.

# START INSTRUCTIONS #
You are a computer use agent that will complete a task for the user.

# INTERACTION INSTRUCTIONS #
Always try to go to a website directly or use Bing instead of going to Google first. This avoids the CAPTCHA on Google.
YOU SHOULD ONLY NEED TO SCROLL DOWN OR CLICK. NEVER DO ANYTHING ELSE.

# ROADBLOCKS #
If you encounter a CAPTCHA, ALWAYS ask the user to provide the CAPTCHA solution or take over manually via the VNC viewer.

# STOPPING CONDITION #
You are only done once you have finished the user's task. Ask questions if you need more information to complete the task.

# END INSTRUCTIONS #
";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Log { message: String },
    Result { data: Value },
    Heartbeat,
    Complete,
}

impl ProgressEvent {
    pub fn log(message: impl Into<String>) -> Self {
        ProgressEvent::Log {
            message: message.into(),
        }
    }

    pub fn result(data: Value) -> Self {
        ProgressEvent::Result { data }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    NeedsInput,
    NeedsSafetyCheck,
    Complete,
    Error,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Complete | SessionStatus::Error | SessionStatus::Cancelled
        )
    }

    pub fn is_suspended(&self) -> bool {
        matches!(
            self,
            SessionStatus::NeedsInput | SessionStatus::NeedsSafetyCheck
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub status: SessionStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub messages: String,
    pub auto_mode: bool,
    pub safety_acknowledged: bool,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedSession {
    pub session_id: String,
}

#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub sandbox_name: String,
    pub prompt_suffix: String,
    pub loop_options: LoopOptions,
    pub grace_period: Duration,
    pub heartbeat_interval: Duration,
    pub cancel_join_timeout: Duration,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            sandbox_name: crate::sandbox::DEFAULT_CONTAINER_NAME.to_string(),
            prompt_suffix: DEFAULT_PROMPT_SUFFIX.to_string(),
            loop_options: LoopOptions::default(),
            grace_period: DEFAULT_GRACE_PERIOD,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            cancel_join_timeout: DEFAULT_CANCEL_JOIN_TIMEOUT,
        }
    }
}

fn format_time(at: OffsetDateTime) -> String {
    at.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

struct RunState {
    status: SessionStatus,
    run: u64,
    events: Vec<ProgressEvent>,
    /// The current run already emitted `complete`.
    closed: bool,
    /// A start request is claiming the sandbox for the next run. Cleared by
    /// `cancel`, which makes that request stand down.
    starting: bool,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl RunState {
    fn emit(&mut self, broadcaster: &broadcast::Sender<ProgressEvent>, event: ProgressEvent) {
        if self.closed {
            debug!(?event, "dropping event emitted after complete");
            return;
        }
        if event == ProgressEvent::Complete {
            self.closed = true;
        }
        self.events.push(event.clone());
        let _ = broadcaster.send(event);
    }

    fn reset_run(&mut self) {
        self.run += 1;
        self.events.clear();
        self.closed = false;
        self.cancel = CancellationToken::new();
        self.updated_at = OffsetDateTime::now_utc();
    }
}

struct SessionHandle {
    id: String,
    sandbox: String,
    broadcaster: broadcast::Sender<ProgressEvent>,
    state: Mutex<RunState>,
    agent: Mutex<AgentLoop>,
}

impl SessionHandle {
    async fn emit(&self, event: ProgressEvent) {
        self.state.lock().await.emit(&self.broadcaster, event);
    }

    async fn summary(&self) -> SessionSummary {
        let state = self.state.lock().await;
        SessionSummary {
            session_id: self.id.clone(),
            status: state.status,
            created_at: format_time(state.created_at),
            updated_at: format_time(state.updated_at),
        }
    }
}

/// Forwards executed actions to the session's event log.
struct SessionEvents {
    handle: Arc<SessionHandle>,
}

#[async_trait]
impl LoopEvents for SessionEvents {
    async fn action_executed(&self, action: &Action, result: &ActionResult) {
        debug!(session_id = %self.handle.id, action = %action.describe(), "action executed");
        let mut data = result.to_value();
        // Screenshots go to the decision service, not to listeners.
        if let Some(object) = data.as_object_mut() {
            object.remove("screenshot");
        }
        self.handle.emit(ProgressEvent::result(data)).await;
    }
}

pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<SessionHandle>>>,
    sandboxes: Arc<SandboxManager>,
    decision: Arc<dyn DecisionService>,
    config: SessionManagerConfig,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.config)
            .finish()
    }
}

impl SessionManager {
    pub fn new(
        sandboxes: Arc<SandboxManager>,
        decision: Arc<dyn DecisionService>,
        config: SessionManagerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            sandboxes,
            decision,
            config,
        })
    }

    pub fn config(&self) -> &SessionManagerConfig {
        &self.config
    }

    pub fn sandboxes(&self) -> &Arc<SandboxManager> {
        &self.sandboxes
    }

    async fn lookup(&self, session_id: &str) -> Result<Arc<SessionHandle>, DesktopError> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| DesktopError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    /// Starts a new session or resumes a suspended one, returning as soon as
    /// the run is spawned.
    pub async fn start(self: &Arc<Self>, request: StartRequest) -> Result<StartedSession, DesktopError> {
        let (handle, resumed_from) = match request.session_id.as_deref() {
            Some(session_id) => {
                let (handle, status) = self.reserve_resume(session_id, &request).await?;
                (handle, Some(status))
            }
            None => (self.create_session(&request).await?, None),
        };
        let created = resumed_from.is_none();

        if let Err(err) = self.claim_sandbox(&handle).await {
            self.abandon_start(&handle, created).await;
            return Err(err);
        }

        // A run whose cancellation timed out still owns the loop.
        let Ok(mut agent) = handle.agent.try_lock() else {
            self.sandboxes.release(&handle.sandbox, &handle.id).await;
            self.abandon_start(&handle, created).await;
            warn!(session_id = %handle.id, "previous run still active, refusing resume");
            return Err(DesktopError::SessionBusy {
                session_id: handle.id.clone(),
            });
        };

        let (cancel, run) = {
            let mut state = handle.state.lock().await;
            if !state.starting {
                drop(state);
                drop(agent);
                self.sandboxes.release(&handle.sandbox, &handle.id).await;
                info!(session_id = %handle.id, "start superseded by cancellation");
                return Ok(StartedSession {
                    session_id: handle.id.clone(),
                });
            }
            if let Some(status) = resumed_from {
                apply_resume(&mut agent, status, &request);
            }
            state.starting = false;
            state.reset_run();
            state.status = SessionStatus::Running;
            (state.cancel.clone(), state.run)
        };
        drop(agent);

        let manager = self.clone();
        let driver_handle = handle.clone();
        let task = tokio::spawn(async move {
            manager.drive(driver_handle, cancel, run).await;
        });
        {
            let mut state = handle.state.lock().await;
            if state.run == run {
                state.task = Some(task);
            }
        }

        info!(session_id = %handle.id, run, auto_mode = request.auto_mode, "agent run started");
        Ok(StartedSession {
            session_id: handle.id.clone(),
        })
    }

    async fn abandon_start(&self, handle: &SessionHandle, created: bool) {
        if created {
            self.sessions.lock().await.remove(&handle.id);
        } else {
            handle.state.lock().await.starting = false;
        }
    }

    async fn claim_sandbox(&self, handle: &SessionHandle) -> Result<(), DesktopError> {
        self.sandboxes.ensure_running(&handle.sandbox).await?;
        self.sandboxes.acquire(&handle.sandbox, &handle.id).await
    }

    async fn create_session(&self, request: &StartRequest) -> Result<Arc<SessionHandle>, DesktopError> {
        let task = request.messages.trim();
        if task.is_empty() {
            return Err(DesktopError::Validation {
                message: "messages must not be empty".to_string(),
            });
        }

        let sandbox = self.config.sandbox_name.clone();
        let executor = ActionExecutor::with_display(
            self.sandboxes.channel(&sandbox),
            &self.sandboxes.config().display,
        );
        let mut agent = AgentLoop::new(
            self.decision.clone(),
            executor,
            LoopOptions {
                auto_mode: request.auto_mode,
                ..self.config.loop_options
            },
        );
        agent.provide_input(format!("{}{}", task, self.config.prompt_suffix));

        let id = uuid::Uuid::new_v4().to_string();
        let (broadcaster, _rx) = broadcast::channel(256);
        let now = OffsetDateTime::now_utc();
        let handle = Arc::new(SessionHandle {
            id: id.clone(),
            sandbox,
            broadcaster,
            // run 0 marks a session whose first run has not been spawned yet
            state: Mutex::new(RunState {
                status: SessionStatus::Running,
                run: 0,
                events: Vec::new(),
                closed: false,
                starting: true,
                cancel: CancellationToken::new(),
                task: None,
                created_at: now,
                updated_at: now,
            }),
            agent: Mutex::new(agent),
        });
        self.sessions.lock().await.insert(id.clone(), handle.clone());
        info!(session_id = %id, "session created");
        Ok(handle)
    }

    /// Validates a resume and marks the session as starting in the same
    /// critical section, so a second resume or a cancel sees it before the
    /// sandbox is claimed.
    async fn reserve_resume(
        &self,
        session_id: &str,
        request: &StartRequest,
    ) -> Result<(Arc<SessionHandle>, SessionStatus), DesktopError> {
        let handle = self.lookup(session_id).await?;
        let status = {
            let mut state = handle.state.lock().await;
            if state.status == SessionStatus::Running || state.starting {
                return Err(DesktopError::SessionBusy {
                    session_id: session_id.to_string(),
                });
            }
            if state.status == SessionStatus::NeedsInput && request.messages.trim().is_empty() {
                return Err(DesktopError::Validation {
                    message: "messages must answer the pending input request".to_string(),
                });
            }
            state.starting = true;
            state.status
        };
        info!(session_id, ?status, "resuming session");
        Ok((handle, status))
    }

    async fn drive(self: Arc<Self>, handle: Arc<SessionHandle>, cancel: CancellationToken, run: u64) {
        handle.emit(ProgressEvent::log(STARTED_MESSAGE)).await;

        let events = SessionEvents {
            handle: handle.clone(),
        };
        // Held until the lease is released so a resume cannot overlap this run.
        let mut agent = handle.agent.lock().await;
        let outcome = agent.step(&cancel, &events).await;

        let (status, terminal_events) = match outcome {
            TurnOutcome::Complete(text) => (
                SessionStatus::Complete,
                vec![ProgressEvent::result(json!({
                    "status": "complete",
                    "agentResponse": text,
                }))],
            ),
            TurnOutcome::NeedsInput(messages) => (
                SessionStatus::NeedsInput,
                vec![ProgressEvent::result(json!({
                    "needsInput": true,
                    "messages": messages,
                }))],
            ),
            TurnOutcome::NeedsSafetyCheck {
                checks,
                pending_call,
            } => (
                SessionStatus::NeedsSafetyCheck,
                vec![ProgressEvent::result(json!({
                    "pendingSafetyCheck": true,
                    "safetyChecks": checks,
                    "pendingCall": pending_call,
                }))],
            ),
            TurnOutcome::Error(message) => {
                warn!(session_id = %handle.id, error = %message, "agent run failed");
                (
                    SessionStatus::Error,
                    vec![
                        ProgressEvent::log(format!("Error in agent action: {message}")),
                        ProgressEvent::result(json!({"status": "error", "error": message})),
                    ],
                )
            }
            TurnOutcome::Cancelled => (SessionStatus::Cancelled, Vec::new()),
        };

        let current = {
            let mut state = handle.state.lock().await;
            if state.run == run {
                if state.status != SessionStatus::Cancelled {
                    state.status = status;
                }
                state.updated_at = OffsetDateTime::now_utc();
                for event in terminal_events {
                    state.emit(&handle.broadcaster, event);
                }
                state.emit(&handle.broadcaster, ProgressEvent::Complete);
            }
            state.run == run
        };

        // A superseded run must not drop the lease of the run that replaced it.
        if current {
            self.sandboxes.release(&handle.sandbox, &handle.id).await;
        }
        drop(agent);
        info!(session_id = %handle.id, run, ?status, "agent run finished");

        if current && status.is_terminal() {
            self.schedule_cleanup(&handle, run);
        }
    }

    fn schedule_cleanup(self: &Arc<Self>, handle: &Arc<SessionHandle>, run: u64) {
        let manager = Arc::downgrade(self);
        let handle = handle.clone();
        let grace = self.config.grace_period;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(manager) = manager.upgrade() else {
                return;
            };
            let expired = {
                let state = handle.state.lock().await;
                state.run == run && state.status.is_terminal()
            };
            if expired {
                manager.sessions.lock().await.remove(&handle.id);
                debug!(session_id = %handle.id, "session expired");
            }
        });
    }

    /// Stream of the current run's events, ending after `complete`.
    pub async fn attach(
        &self,
        session_id: &str,
    ) -> Result<impl Stream<Item = ProgressEvent> + Send + 'static, DesktopError> {
        let handle = self.lookup(session_id).await?;
        let (initial, receiver) = {
            let state = handle.state.lock().await;
            (
                state.events.iter().cloned().collect::<VecDeque<_>>(),
                handle.broadcaster.subscribe(),
            )
        };
        Ok(event_stream(initial, receiver, self.config.heartbeat_interval))
    }

    /// Signals the session's run to stop. Returns once the run has finished
    /// or the join timeout elapsed.
    pub async fn cancel(self: &Arc<Self>, session_id: &str) -> Result<(), DesktopError> {
        let handle = self.lookup(session_id).await?;
        let (task, run) = {
            let mut state = handle.state.lock().await;
            state.cancel.cancel();
            state.starting = false;
            if state.closed {
                // A finished or suspended run: cancellation gets its own log.
                state.reset_run();
                state.cancel.cancel();
            }
            state.status = SessionStatus::Cancelled;
            state.updated_at = OffsetDateTime::now_utc();
            state.emit(&handle.broadcaster, ProgressEvent::log(CANCELLED_MESSAGE));
            state.emit(
                &handle.broadcaster,
                ProgressEvent::result(json!({"status": "cancelled"})),
            );
            state.emit(&handle.broadcaster, ProgressEvent::Complete);
            (state.task.take(), state.run)
        };
        info!(session_id, "agent cancelled");

        if let Some(task) = task {
            if tokio::time::timeout(self.config.cancel_join_timeout, task)
                .await
                .is_err()
            {
                warn!(session_id, "agent run still active after cancellation");
            }
        }

        self.sandboxes.release(&handle.sandbox, &handle.id).await;
        self.schedule_cleanup(&handle, run);
        Ok(())
    }

    pub async fn get(&self, session_id: &str) -> Result<SessionSummary, DesktopError> {
        Ok(self.lookup(session_id).await?.summary().await)
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let handles: Vec<Arc<SessionHandle>> =
            self.sessions.lock().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            summaries.push(handle.summary().await);
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }

    /// Cancels every active run. Used on server shutdown.
    pub async fn shutdown(&self) {
        let handles: Vec<Arc<SessionHandle>> =
            self.sessions.lock().await.values().cloned().collect();
        for handle in handles {
            let state = handle.state.lock().await;
            if state.status == SessionStatus::Running {
                state.cancel.cancel();
            }
        }
    }
}

fn apply_resume(agent: &mut AgentLoop, status: SessionStatus, request: &StartRequest) {
    agent.set_auto_mode(request.auto_mode);
    if status == SessionStatus::NeedsSafetyCheck {
        agent.acknowledge(request.safety_acknowledged);
    }
    let reply = request.messages.trim();
    if !reply.is_empty() {
        agent.provide_input(reply);
    }
}

struct StreamState {
    initial: VecDeque<ProgressEvent>,
    receiver: broadcast::Receiver<ProgressEvent>,
    heartbeat: Duration,
    done: bool,
}

fn event_stream(
    initial: VecDeque<ProgressEvent>,
    receiver: broadcast::Receiver<ProgressEvent>,
    heartbeat: Duration,
) -> impl Stream<Item = ProgressEvent> + Send + 'static {
    let state = StreamState {
        initial,
        receiver,
        heartbeat,
        done: false,
    };
    stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }

        let event = if let Some(event) = state.initial.pop_front() {
            event
        } else {
            loop {
                match tokio::time::timeout(state.heartbeat, state.receiver.recv()).await {
                    Err(_) => break ProgressEvent::Heartbeat,
                    Ok(Ok(event)) => break event,
                    Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                        warn!(skipped, "progress listener lagged");
                        continue;
                    }
                    Ok(Err(broadcast::error::RecvError::Closed)) => return None,
                }
            }
        };

        if event == ProgressEvent::Complete {
            state.done = true;
        }
        Some((event, state))
    })
}

/// Adapts a progress stream for SSE, one JSON event per `data:` line.
pub fn to_sse_stream(
    events: impl Stream<Item = ProgressEvent> + Send + 'static,
) -> impl Stream<Item = Result<axum::response::sse::Event, Infallible>> + Send + 'static {
    use axum::response::sse::Event;
    use futures::StreamExt;

    events.map(|event| {
        Ok(Event::default()
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().data("{}")))
    })
}
