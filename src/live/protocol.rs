//! Messages of the live run protocol. Every frame is a JSON object with a
//! `type` field.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::homescript::{ScriptValue, TraceEvent};
use crate::runner::StateActivity;

/// Close code sent when an address exceeds the authentication failure limit.
pub const RATE_LIMIT_CLOSE_CODE: u16 = 4429;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Auth {
        #[serde(default)]
        service_id: Option<String>,
        #[serde(default)]
        service_secret: Option<String>,
        /// Legacy `serviceId:secret`
        #[serde(default)]
        api_key: Option<String>,
    },
    Run {
        endpoint: String,
        #[serde(default)]
        variables: serde_json::Value,
        #[serde(default)]
        request_id: Option<String>,
    },
    Ping,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    AuthOk {
        service_id: String,
        name: String,
    },
    AuthError {
        message: String,
    },
    RunStarted {
        request_id: String,
        endpoint: String,
        timestamp: DateTime<Utc>,
    },
    RunEvent {
        request_id: String,
        event: TraceEvent,
        timestamp: DateTime<Utc>,
    },
    HaState {
        request_id: String,
        #[serde(flatten)]
        activity: StateActivity,
        timestamp: DateTime<Utc>,
    },
    RunComplete {
        request_id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        variables: Option<IndexMap<String, ScriptValue>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        line: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
        duration_ms: u64,
    },
    Pong,
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl ServerMessage {
    /// Failure completion for a run that never started.
    pub fn rejected(request_id: &str, message: impl Into<String>) -> Self {
        ServerMessage::RunComplete {
            request_id: request_id.to_string(),
            success: false,
            output: None,
            variables: None,
            error: Some(message.into()),
            line: None,
            status: None,
            duration_ms: 0,
        }
    }

    pub fn error(message: impl Into<String>, request_id: Option<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            request_id,
        }
    }
}

/// What the socket writer should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    Close { code: u16, reason: String },
}
