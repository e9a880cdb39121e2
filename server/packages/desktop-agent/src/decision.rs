//! Decision service client.
//!
//! The agent loop asks a [`DecisionService`] what to do next. The shipped
//! implementation talks to the OpenAI Responses API with the
//! `computer_use_preview` tool; the conversation is threaded server side via
//! `previous_response_id`, so each request only carries the items appended
//! since the last response.

use async_trait::async_trait;
use desktop_agent_error::DesktopError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};
use utoipa::ToSchema;

use crate::actions::{Action, DEFAULT_WAIT_SECONDS};

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "computer-use-preview";
pub const DEFAULT_DISPLAY_WIDTH: u32 = 1024;
pub const DEFAULT_DISPLAY_HEIGHT: u32 = 768;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecisionServiceError {
    #[error("request failed: {0}")]
    Http(String),
    #[error("status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("unsupported action `{0}`")]
    UnsupportedAction(String),
}

impl From<DecisionServiceError> for DesktopError {
    fn from(err: DecisionServiceError) -> Self {
        DesktopError::DecisionService {
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SafetyCheck {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

/// An action the decision service asked for, possibly gated on checks.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCall {
    pub call_id: String,
    pub action: Action,
    pub safety_checks: Vec<SafetyCheck>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Final { text: String },
    NeedsInput { messages: Vec<String> },
    Command(PendingCall),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionResponse {
    pub response_id: Option<String>,
    pub decision: Decision,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HistoryItem {
    User {
        text: String,
    },
    ActionOutput {
        call_id: String,
        acknowledged_checks: Vec<SafetyCheck>,
    },
}

/// Conversation history. Items before the cursor were already sent and are
/// referenced through `last_response_id`.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    items: Vec<HistoryItem>,
    sent: usize,
    last_response_id: Option<String>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: HistoryItem) {
        self.items.push(item);
    }

    pub fn items(&self) -> &[HistoryItem] {
        &self.items
    }

    pub fn pending(&self) -> &[HistoryItem] {
        &self.items[self.sent..]
    }

    pub fn last_response_id(&self) -> Option<&str> {
        self.last_response_id.as_deref()
    }

    /// Records a successful exchange: everything pending is now part of the
    /// server-side thread identified by `response_id`.
    pub fn mark_sent(&mut self, response_id: Option<String>) {
        self.sent = self.items.len();
        if response_id.is_some() {
            self.last_response_id = response_id;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplaySize {
    pub width: u32,
    pub height: u32,
}

impl Default for DisplaySize {
    fn default() -> Self {
        Self {
            width: DEFAULT_DISPLAY_WIDTH,
            height: DEFAULT_DISPLAY_HEIGHT,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DecisionRequest<'a> {
    pub conversation: &'a Conversation,
    /// Base64 PNG captured right before this request.
    pub screenshot: Option<&'a str>,
    pub display: DisplaySize,
}

#[async_trait]
pub trait DecisionService: Send + Sync {
    async fn decide(
        &self,
        request: DecisionRequest<'_>,
    ) -> Result<DecisionResponse, DecisionServiceError>;
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
        }
    }
}

pub struct OpenAiDecisionService {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl std::fmt::Debug for OpenAiDecisionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiDecisionService")
            .field("base_url", &self.config.base_url)
            .field("model", &self.config.model)
            .finish()
    }
}

impl OpenAiDecisionService {
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

fn image_url(screenshot: &str) -> String {
    format!("data:image/png;base64,{screenshot}")
}

/// Builds the Responses API request body.
pub fn build_request_body(model: &str, request: &DecisionRequest<'_>) -> Value {
    let mut input = Vec::new();
    let mut image_attached = false;

    for item in request.conversation.pending() {
        match item {
            HistoryItem::User { text } => {
                let mut content = vec![json!({"type": "input_text", "text": text})];
                if let (Some(screenshot), false) = (request.screenshot, image_attached) {
                    content.push(json!({
                        "type": "input_image",
                        "image_url": image_url(screenshot),
                    }));
                    image_attached = true;
                }
                input.push(json!({"role": "user", "content": content}));
            }
            HistoryItem::ActionOutput {
                call_id,
                acknowledged_checks,
            } => {
                let mut output = json!({"type": "computer_screenshot"});
                if let Some(screenshot) = request.screenshot {
                    output["image_url"] = Value::String(image_url(screenshot));
                }
                let mut item = json!({
                    "type": "computer_call_output",
                    "call_id": call_id,
                    "output": output,
                });
                if !acknowledged_checks.is_empty() {
                    item["acknowledged_safety_checks"] = json!(acknowledged_checks);
                }
                input.push(item);
            }
        }
    }

    let mut body = json!({
        "model": model,
        "tools": [{
            "type": "computer_use_preview",
            "display_width": request.display.width,
            "display_height": request.display.height,
            "environment": "linux",
        }],
        "input": input,
        "truncation": "auto",
    });
    if let Some(previous) = request.conversation.last_response_id() {
        body["previous_response_id"] = Value::String(previous.to_string());
    }
    body
}

fn field_i32(action: &Value, key: &str) -> i32 {
    action
        .get(key)
        .and_then(Value::as_f64)
        .map(|value| value.round() as i32)
        .unwrap_or(0)
}

fn field_str(action: &Value, key: &str) -> Result<String, DecisionServiceError> {
    action
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DecisionServiceError::Malformed(format!("action is missing `{key}`")))
}

/// Maps the decision service's action vocabulary onto [`Action`].
pub fn map_action(action: &Value) -> Result<Action, DecisionServiceError> {
    let kind = action
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| DecisionServiceError::Malformed("action without type".to_string()))?;

    let mapped = match kind {
        "click" => Action::Click {
            x: field_i32(action, "x"),
            y: field_i32(action, "y"),
            button: action
                .get("button")
                .and_then(Value::as_str)
                .unwrap_or("left")
                .to_string(),
        },
        "double_click" => Action::DoubleClick {
            x: field_i32(action, "x"),
            y: field_i32(action, "y"),
        },
        "scroll" => Action::Scroll {
            x: field_i32(action, "x"),
            y: field_i32(action, "y"),
            scroll_x: field_i32(action, "scroll_x"),
            scroll_y: field_i32(action, "scroll_y"),
        },
        "keypress" => Action::Keypress {
            keys: action
                .get("keys")
                .and_then(Value::as_array)
                .map(|keys| {
                    keys.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .ok_or_else(|| {
                    DecisionServiceError::Malformed("keypress is missing `keys`".to_string())
                })?,
        },
        "type" => Action::Type {
            text: field_str(action, "text")?,
        },
        "wait" => Action::Wait {
            seconds: action
                .get("seconds")
                .and_then(Value::as_f64)
                .unwrap_or(DEFAULT_WAIT_SECONDS),
        },
        "goto" | "navigate" => Action::Navigate {
            url: field_str(action, "url")?,
        },
        "screenshot" => Action::Screenshot,
        other => return Err(DecisionServiceError::UnsupportedAction(other.to_string())),
    };
    Ok(mapped)
}

fn message_texts(item: &Value) -> Vec<String> {
    item.get("content")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Input is requested when the last message reads as a question.
pub fn is_question(text: &str) -> bool {
    text.trim_end().ends_with('?')
}

/// Turns a Responses API body into a [`DecisionResponse`].
pub fn parse_response(body: &Value) -> Result<DecisionResponse, DecisionServiceError> {
    let response_id = body.get("id").and_then(Value::as_str).map(str::to_string);
    let output = body
        .get("output")
        .and_then(Value::as_array)
        .ok_or_else(|| DecisionServiceError::Malformed("response has no output".to_string()))?;

    if let Some(call) = output
        .iter()
        .find(|item| item.get("type").and_then(Value::as_str) == Some("computer_call"))
    {
        let call_id = call
            .get("call_id")
            .and_then(Value::as_str)
            .ok_or_else(|| DecisionServiceError::Malformed("computer_call without call_id".to_string()))?
            .to_string();
        let action = call
            .get("action")
            .ok_or_else(|| DecisionServiceError::Malformed("computer_call without action".to_string()))?;
        let safety_checks = match call.get("pending_safety_checks") {
            Some(Value::Null) | None => Vec::new(),
            Some(checks) => serde_json::from_value(checks.clone())
                .map_err(|err| DecisionServiceError::Malformed(format!("safety checks: {err}")))?,
        };
        return Ok(DecisionResponse {
            response_id,
            decision: Decision::Command(PendingCall {
                call_id,
                action: map_action(action)?,
                safety_checks,
            }),
        });
    }

    let messages: Vec<String> = output
        .iter()
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("message"))
        .flat_map(message_texts)
        .collect();

    let decision = match messages.last() {
        None => {
            return Err(DecisionServiceError::Malformed(
                "response has neither an action nor a message".to_string(),
            ))
        }
        Some(last) if is_question(last) => Decision::NeedsInput { messages },
        Some(_) => Decision::Final {
            text: messages.join("\n"),
        },
    };
    Ok(DecisionResponse {
        response_id,
        decision,
    })
}

#[async_trait]
impl DecisionService for OpenAiDecisionService {
    async fn decide(
        &self,
        request: DecisionRequest<'_>,
    ) -> Result<DecisionResponse, DecisionServiceError> {
        let body = build_request_body(&self.config.model, &request);
        let url = format!("{}/responses", self.config.base_url.trim_end_matches('/'));
        debug!(
            %url,
            items = request.conversation.pending().len(),
            previous_response_id = ?request.conversation.last_response_id(),
            "requesting decision"
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| DecisionServiceError::Http(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "decision service returned an error");
            return Err(DecisionServiceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let value: Value = response
            .json()
            .await
            .map_err(|err| DecisionServiceError::Malformed(err.to_string()))?;
        parse_response(&value)
    }
}
