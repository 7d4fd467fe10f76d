//! Uniform tool response envelope: `{ success, data?, error?, message }`.

use rmcp::model::{CallToolResult, Content};
use serde_json::{Map, Value};

use crate::memory::MemoryError;
use crate::store::StoreError;
use crate::transfer::TransferError;

/// Errors that can be reported to a caller as an envelope.
pub trait ErrorCode: std::fmt::Display {
    fn code(&self) -> &'static str;
}

impl ErrorCode for StoreError {
    fn code(&self) -> &'static str {
        StoreError::code(self)
    }
}

impl ErrorCode for MemoryError {
    fn code(&self) -> &'static str {
        MemoryError::code(self)
    }
}

impl ErrorCode for TransferError {
    fn code(&self) -> &'static str {
        TransferError::code(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolResponse {
    pub success: bool,
    pub data: Option<Value>,
    /// Error code, e.g. `UNKNOWN_ENTITY`
    pub error: Option<String>,
    pub message: String,
}

impl ToolResponse {
    pub fn ok(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            message: message.into(),
        }
    }

    pub fn failure(error: &impl ErrorCode) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.code().to_string()),
            message: error.to_string(),
        }
    }

    fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("success".into(), Value::Bool(self.success));
        if let Some(data) = &self.data {
            map.insert("data".into(), data.clone());
        }
        if let Some(error) = &self.error {
            map.insert("error".into(), Value::String(error.clone()));
        }
        map.insert("message".into(), Value::String(self.message.clone()));
        Value::Object(map)
    }

    /// Structured content plus the same JSON pretty-printed as text.
    pub fn into_call_result(self) -> CallToolResult {
        let value = self.to_value();
        let text = serde_json::to_string_pretty(&value).unwrap_or_else(|_| self.message.clone());
        CallToolResult {
            content: vec![Content::text(text)],
            structured_content: Some(value),
            is_error: Some(!self.success),
            meta: None,
        }
    }
}
