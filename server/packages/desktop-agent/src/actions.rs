//! The closed vocabulary of desktop actions and their structured results.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

pub const DEFAULT_WAIT_SECONDS: f64 = 2.0;

fn default_button() -> String {
    "left".to_string()
}

fn default_wait_seconds() -> f64 {
    DEFAULT_WAIT_SECONDS
}

/// A single semantic action against the sandbox display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Click {
        x: i32,
        y: i32,
        #[serde(default = "default_button")]
        button: String,
    },
    DoubleClick {
        x: i32,
        y: i32,
    },
    Scroll {
        x: i32,
        y: i32,
        #[serde(default)]
        scroll_x: i32,
        #[serde(default)]
        scroll_y: i32,
    },
    Keypress {
        keys: Vec<String>,
    },
    Type {
        text: String,
    },
    Wait {
        #[serde(default = "default_wait_seconds")]
        seconds: f64,
    },
    #[serde(alias = "goto")]
    Navigate {
        url: String,
    },
    Screenshot,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Click { .. } => "click",
            Action::DoubleClick { .. } => "double_click",
            Action::Scroll { .. } => "scroll",
            Action::Keypress { .. } => "keypress",
            Action::Type { .. } => "type",
            Action::Wait { .. } => "wait",
            Action::Navigate { .. } => "navigate",
            Action::Screenshot => "screenshot",
        }
    }

    /// Short human-readable form used in progress logs.
    pub fn describe(&self) -> String {
        match self {
            Action::Click { x, y, button } => format!("click at ({x}, {y}) with {button} button"),
            Action::DoubleClick { x, y } => format!("double click at ({x}, {y})"),
            Action::Scroll {
                x,
                y,
                scroll_x,
                scroll_y,
            } => format!("scroll at ({x}, {y}) by ({scroll_x}, {scroll_y})"),
            Action::Keypress { keys } => format!("keypress {}", keys.join("+")),
            Action::Type { text } => format!("type {text:?}"),
            Action::Wait { seconds } => format!("wait {seconds}s"),
            Action::Navigate { url } => format!("navigate to {url}"),
            Action::Screenshot => "screenshot".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Success,
    Error,
}

/// `{status, action, ...echoed params}` as returned by every action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub status: ActionStatus,
    pub action: String,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl ActionResult {
    pub fn success(action: &str) -> Self {
        Self {
            status: ActionStatus::Success,
            action: action.to_string(),
            params: Map::new(),
        }
    }

    pub fn error(action: &str, message: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Error,
            action: action.to_string(),
            params: Map::new(),
        }
        .with("error", message.into())
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ActionStatus::Success
    }

    /// Base64 PNG payload of a successful screenshot.
    pub fn screenshot(&self) -> Option<&str> {
        if !self.is_success() {
            return None;
        }
        self.params.get("screenshot").and_then(Value::as_str)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }
}
