//! Error taxonomy shared by the desktop agent server and the in-sandbox
//! command API.
//!
//! Every error renders as an RFC 7807 problem document so HTTP callers get a
//! stable `type` URN, a title and the status code the error maps to.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

const ERROR_URN_PREFIX: &str = "urn:desktop-agent:error:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Provisioning,
    PortExhaustion,
    ActionExecution,
    DecisionService,
    Validation,
    SessionNotFound,
    SessionBusy,
    SandboxBusy,
    TokenInvalid,
    Internal,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Provisioning => "provisioning",
            ErrorType::PortExhaustion => "port_exhaustion",
            ErrorType::ActionExecution => "action_execution",
            ErrorType::DecisionService => "decision_service",
            ErrorType::Validation => "validation",
            ErrorType::SessionNotFound => "session_not_found",
            ErrorType::SessionBusy => "session_busy",
            ErrorType::SandboxBusy => "sandbox_busy",
            ErrorType::TokenInvalid => "token_invalid",
            ErrorType::Internal => "internal",
        }
    }

    pub fn urn(&self) -> String {
        format!("{ERROR_URN_PREFIX}{}", self.as_str())
    }

    pub fn title(&self) -> &'static str {
        match self {
            ErrorType::Provisioning => "Sandbox Provisioning Failed",
            ErrorType::PortExhaustion => "No Free Relay Port",
            ErrorType::ActionExecution => "Action Execution Failed",
            ErrorType::DecisionService => "Decision Service Failed",
            ErrorType::Validation => "Invalid Request",
            ErrorType::SessionNotFound => "Session Not Found",
            ErrorType::SessionBusy => "Session Busy",
            ErrorType::SandboxBusy => "Sandbox Busy",
            ErrorType::TokenInvalid => "Token Invalid",
            ErrorType::Internal => "Internal Error",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            ErrorType::Validation => 400,
            ErrorType::TokenInvalid => 401,
            ErrorType::SessionNotFound => 404,
            ErrorType::SessionBusy | ErrorType::SandboxBusy => 409,
            ErrorType::DecisionService => 502,
            ErrorType::Provisioning | ErrorType::PortExhaustion => 503,
            ErrorType::ActionExecution | ErrorType::Internal => 500,
        }
    }
}

/// Problem details body (RFC 7807) returned for every failed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.urn(),
            title: error_type.title().to_string(),
            status: error_type.status(),
            detail,
            instance: None,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum DesktopError {
    #[error("failed to provision sandbox {name}: {message}")]
    Provisioning { name: String, message: String },
    #[error("no free port in {attempts} attempts starting at {base_port}")]
    PortExhaustion { base_port: u16, attempts: u16 },
    #[error("{action} action failed: {message}")]
    ActionExecution { action: String, message: String },
    #[error("decision service error: {message}")]
    DecisionService { message: String },
    #[error("invalid request: {message}")]
    Validation { message: String },
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("session {session_id} already has a running agent loop")]
    SessionBusy { session_id: String },
    #[error("sandbox {name} is in use by session {session_id}")]
    SandboxBusy { name: String, session_id: String },
    #[error("token invalid")]
    TokenInvalid { message: Option<String> },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl DesktopError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            DesktopError::Provisioning { .. } => ErrorType::Provisioning,
            DesktopError::PortExhaustion { .. } => ErrorType::PortExhaustion,
            DesktopError::ActionExecution { .. } => ErrorType::ActionExecution,
            DesktopError::DecisionService { .. } => ErrorType::DecisionService,
            DesktopError::Validation { .. } => ErrorType::Validation,
            DesktopError::SessionNotFound { .. } => ErrorType::SessionNotFound,
            DesktopError::SessionBusy { .. } => ErrorType::SessionBusy,
            DesktopError::SandboxBusy { .. } => ErrorType::SandboxBusy,
            DesktopError::TokenInvalid { .. } => ErrorType::TokenInvalid,
            DesktopError::Internal { .. } => ErrorType::Internal,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let detail = match self {
            DesktopError::TokenInvalid { message } => message.clone(),
            DesktopError::ActionExecution { message, .. } => Some(message.clone()),
            DesktopError::Validation { message } => Some(message.clone()),
            other => Some(other.to_string()),
        };
        ProblemDetails::new(self.error_type(), detail)
    }
}
