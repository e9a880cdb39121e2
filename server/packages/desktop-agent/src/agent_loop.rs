//! Turn-by-turn protocol between the decision service and the executor.
//!
//! [`AgentLoop::step`] runs until the loop either finishes or suspends and
//! reports the outcome as a single [`TurnOutcome`]. Suspended loops are
//! resumed by [`AgentLoop::provide_input`] or [`AgentLoop::acknowledge`]
//! followed by another `step`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::actions::{Action, ActionResult};
use crate::decision::{
    Conversation, Decision, DecisionRequest, DecisionService, DisplaySize, HistoryItem,
    PendingCall, SafetyCheck,
};
use crate::executor::ActionExecutor;

pub const DEFAULT_MAX_TURNS: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Complete(String),
    NeedsInput(Vec<String>),
    NeedsSafetyCheck {
        checks: Vec<SafetyCheck>,
        pending_call: PendingCall,
    },
    Error(String),
    Cancelled,
}

/// Receives the result of every action the loop executes.
#[async_trait]
pub trait LoopEvents: Send + Sync {
    async fn action_executed(&self, action: &Action, result: &ActionResult);
}

pub struct NoopEvents;

#[async_trait]
impl LoopEvents for NoopEvents {
    async fn action_executed(&self, _action: &Action, _result: &ActionResult) {}
}

#[derive(Debug, Clone, Copy)]
pub struct LoopOptions {
    /// Auto-acknowledge safety checks and treat input requests as errors.
    pub auto_mode: bool,
    pub max_turns: usize,
    pub display: DisplaySize,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            auto_mode: false,
            max_turns: DEFAULT_MAX_TURNS,
            display: DisplaySize::default(),
        }
    }
}

pub struct AgentLoop {
    decision: Arc<dyn DecisionService>,
    executor: ActionExecutor,
    options: LoopOptions,
    conversation: Conversation,
    pending_call: Option<PendingCall>,
    acknowledged: bool,
}

impl std::fmt::Debug for AgentLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentLoop")
            .field("options", &self.options)
            .field("pending_call", &self.pending_call)
            .finish()
    }
}

impl AgentLoop {
    pub fn new(
        decision: Arc<dyn DecisionService>,
        executor: ActionExecutor,
        options: LoopOptions,
    ) -> Self {
        Self {
            decision,
            executor,
            options,
            conversation: Conversation::new(),
            pending_call: None,
            acknowledged: false,
        }
    }

    pub fn options(&self) -> LoopOptions {
        self.options
    }

    pub fn set_auto_mode(&mut self, auto_mode: bool) {
        self.options.auto_mode = auto_mode;
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn pending_call(&self) -> Option<&PendingCall> {
        self.pending_call.as_ref()
    }

    /// Appends user text: the initial task or a reply to an input request.
    pub fn provide_input(&mut self, text: impl Into<String>) {
        self.conversation.push(HistoryItem::User { text: text.into() });
    }

    /// Acknowledges (or declines) the checks gating the pending call. Takes
    /// effect on the next `step`.
    pub fn acknowledge(&mut self, ack: bool) {
        self.acknowledged = ack;
    }

    pub async fn step(&mut self, cancel: &CancellationToken, events: &dyn LoopEvents) -> TurnOutcome {
        if cancel.is_cancelled() {
            return TurnOutcome::Cancelled;
        }

        if let Some(call) = self.pending_call.take() {
            if !std::mem::take(&mut self.acknowledged) {
                debug!(call_id = %call.call_id, "pending call still unacknowledged");
                return self.suspend_for_checks(call);
            }
            info!(call_id = %call.call_id, action = call.action.name(), "safety checks acknowledged");
            if let Some(outcome) = self.execute(call, true, cancel, events).await {
                return outcome;
            }
        }

        let mut turns = 0usize;
        loop {
            if cancel.is_cancelled() {
                return TurnOutcome::Cancelled;
            }
            if turns >= self.options.max_turns {
                warn!(max_turns = self.options.max_turns, "turn budget exhausted");
                return TurnOutcome::Error(format!(
                    "turn budget of {} decisions exhausted",
                    self.options.max_turns
                ));
            }
            turns += 1;

            let screenshot = self.executor.screenshot().await;
            if !screenshot.is_success() {
                warn!("continuing without a fresh screenshot");
            }
            if cancel.is_cancelled() {
                return TurnOutcome::Cancelled;
            }

            let request = DecisionRequest {
                conversation: &self.conversation,
                screenshot: screenshot.screenshot(),
                display: self.options.display,
            };
            let response = tokio::select! {
                response = self.decision.decide(request) => response,
                _ = cancel.cancelled() => return TurnOutcome::Cancelled,
            };
            let response = match response {
                Ok(response) => response,
                Err(err) => {
                    warn!(error = %err, "decision service failed");
                    return TurnOutcome::Error(err.to_string());
                }
            };
            self.conversation.mark_sent(response.response_id);

            match response.decision {
                Decision::Final { text } => {
                    info!(turns, "agent finished");
                    return TurnOutcome::Complete(text);
                }
                Decision::NeedsInput { messages } => {
                    if self.options.auto_mode {
                        return TurnOutcome::Error("input requested in auto mode".to_string());
                    }
                    return TurnOutcome::NeedsInput(messages);
                }
                Decision::Command(call) => {
                    let gated = !call.safety_checks.is_empty();
                    if gated && !self.options.auto_mode {
                        return self.suspend_for_checks(call);
                    }
                    if gated {
                        info!(call_id = %call.call_id, "auto-acknowledging safety checks");
                    }
                    if let Some(outcome) = self.execute(call, gated, cancel, events).await {
                        return outcome;
                    }
                }
            }
        }
    }

    fn suspend_for_checks(&mut self, call: PendingCall) -> TurnOutcome {
        let outcome = TurnOutcome::NeedsSafetyCheck {
            checks: call.safety_checks.clone(),
            pending_call: call.clone(),
        };
        self.pending_call = Some(call);
        outcome
    }

    /// Runs one call. `Some` means the step ends here.
    async fn execute(
        &mut self,
        call: PendingCall,
        acknowledged: bool,
        cancel: &CancellationToken,
        events: &dyn LoopEvents,
    ) -> Option<TurnOutcome> {
        if cancel.is_cancelled() {
            return Some(TurnOutcome::Cancelled);
        }

        let result = match &call.action {
            Action::Wait { .. } => tokio::select! {
                result = self.executor.dispatch(&call.action) => result,
                _ = cancel.cancelled() => return Some(TurnOutcome::Cancelled),
            },
            _ => self.executor.dispatch(&call.action).await,
        };
        let result = match result {
            Ok(result) => result,
            Err(err) => return Some(TurnOutcome::Error(err.to_string())),
        };

        events.action_executed(&call.action, &result).await;
        self.conversation.push(HistoryItem::ActionOutput {
            call_id: call.call_id,
            acknowledged_checks: if acknowledged {
                call.safety_checks
            } else {
                Vec::new()
            },
        });
        None
    }
}
