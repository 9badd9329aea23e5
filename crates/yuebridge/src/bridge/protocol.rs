//! Wire payloads exchanged with the checker worker.
//!
//! Outbound: [`CheckRequest`] carrying the full document text. Inbound:
//! [`CheckReply`] with the transpile result and a list of messages. Neither
//! direction carries a correlation id; the scheduler relies on strict FIFO
//! reply ordering.

use serde::{Deserialize, Serialize};

/// Request sent to the worker for one check round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRequest {
    pub source_code: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<CheckConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_save_event: Option<bool>,
}

impl CheckRequest {
    pub fn new(source_code: impl Into<String>) -> Self {
        Self {
            source_code: source_code.into(),
            config: None,
            is_save_event: None,
        }
    }

    pub fn with_config(mut self, config: CheckConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn on_save(mut self) -> Self {
        self.is_save_event = Some(true);
        self
    }
}

/// Project configuration forwarded to the worker alongside the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckConfig {
    pub content: String,
    pub dir: String,
}

/// Reply produced by the worker for one check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckReply {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transpiled_code: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<WorkerMessage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_dir: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<bool>,
}

/// One checker message, `[kind, text, line, col]` on the wire.
///
/// Lines and columns are 1-based inclusive as reported by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMessage(pub String, pub String, pub i64, pub i64);

impl WorkerMessage {
    pub fn new(kind: impl Into<String>, text: impl Into<String>, line: i64, col: i64) -> Self {
        Self(kind.into(), text.into(), line, col)
    }

    pub fn kind(&self) -> &str {
        &self.0
    }

    pub fn text(&self) -> &str {
        &self.1
    }

    pub fn line(&self) -> i64 {
        self.2
    }

    pub fn col(&self) -> i64 {
        self.3
    }
}
