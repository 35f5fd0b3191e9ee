// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

#![allow(non_upper_case_globals, non_snake_case)]

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::provenance::Provenance;

pub const ItemTypeUserInput: &str = "user_input";
pub const ItemTypeAssistantTurn: &str = "assistant_turn";
pub const ItemTypeSystem: &str = "system";
pub const ItemTypeHandoff: &str = "handoff";
pub const ItemTypeAssistant: &str = "assistant";
pub const ItemTypeToolCall: &str = "tool_call";
pub const ItemTypeToolResult: &str = "tool_result";

pub const ItemStatusComplete: &str = "complete";
pub const ItemStatusPending: &str = "pending";

pub const SystemKindInfo: &str = "info";
pub const SystemKindWarning: &str = "warning";
pub const SystemKindError: &str = "error";

pub const ToolCallStatusPending: &str = "pending";
pub const ToolCallStatusComplete: &str = "complete";
pub const ToolCallStatusError: &str = "error";

/// Type id and version CXDB stores conversation items under, for use with
/// [`crate::AppendRequest::new`].
pub const TypeIDConversationItem: &str = "cxdb.ConversationItem";
pub const TypeVersionConversationItem: u32 = 3;

/// Current Unix time in milliseconds, Go-parity helper for `item.timestamp`.
pub fn Now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConversationItem {
    #[serde(rename = "1")]
    pub item_type: String,
    #[serde(rename = "2")]
    pub status: String,
    #[serde(rename = "3")]
    pub timestamp: i64,
    #[serde(rename = "4")]
    pub id: String,
    #[serde(rename = "5")]
    pub user_input: Option<UserInput>,
    #[serde(rename = "6")]
    pub turn: Option<AssistantTurn>,
    #[serde(rename = "7")]
    pub system: Option<SystemMessage>,
    #[serde(rename = "8")]
    pub handoff: Option<HandoffInfo>,
    #[serde(rename = "9")]
    pub assistant: Option<Assistant>,
    #[serde(rename = "10")]
    pub tool_call: Option<ToolCall>,
    #[serde(rename = "11")]
    pub tool_result: Option<ToolResult>,
    #[serde(rename = "12")]
    pub context_metadata: Option<ContextMetadata>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserInput {
    #[serde(rename = "1")]
    pub text: String,
    #[serde(rename = "2")]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AssistantTurn {
    #[serde(rename = "1")]
    pub text: String,
    #[serde(rename = "2")]
    pub tool_calls: Vec<ToolCallItem>,
    #[serde(rename = "3")]
    pub reasoning: String,
    #[serde(rename = "4")]
    pub metrics: Option<TurnMetrics>,
    #[serde(rename = "5")]
    pub agent: String,
    #[serde(rename = "6")]
    pub turn_number: i64,
    #[serde(rename = "7")]
    pub max_turns: i64,
    #[serde(rename = "8")]
    pub finish_reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TurnMetrics {
    #[serde(rename = "1")]
    pub input_tokens: i64,
    #[serde(rename = "2")]
    pub output_tokens: i64,
    #[serde(rename = "3")]
    pub total_tokens: i64,
    #[serde(rename = "4")]
    pub cached_tokens: Option<i64>,
    #[serde(rename = "5")]
    pub reasoning_tokens: Option<i64>,
    #[serde(rename = "6")]
    pub duration_ms: Option<i64>,
    #[serde(rename = "7")]
    pub model: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolCallItem {
    #[serde(rename = "1")]
    pub id: String,
    #[serde(rename = "2")]
    pub name: String,
    #[serde(rename = "3")]
    pub args: String,
    #[serde(rename = "4")]
    pub status: String,
    #[serde(rename = "5")]
    pub description: String,
    #[serde(rename = "6")]
    pub streaming_output: String,
    #[serde(rename = "7")]
    pub streaming_output_truncated: bool,
    #[serde(rename = "8")]
    pub result: Option<ToolCallResult>,
    #[serde(rename = "9")]
    pub error: Option<ToolCallError>,
    #[serde(rename = "10")]
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolCallResult {
    #[serde(rename = "1")]
    pub content: String,
    #[serde(rename = "2")]
    pub content_truncated: bool,
    #[serde(rename = "3")]
    pub success: bool,
    #[serde(rename = "4")]
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolCallError {
    #[serde(rename = "1")]
    pub code: String,
    #[serde(rename = "2")]
    pub message: String,
    #[serde(rename = "3")]
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HandoffInfo {
    #[serde(rename = "1")]
    pub from_agent: String,
    #[serde(rename = "2")]
    pub to_agent: String,
    #[serde(rename = "3")]
    pub tool_name: String,
    #[serde(rename = "4")]
    pub input: String,
    #[serde(rename = "5")]
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMessage {
    #[serde(rename = "1")]
    pub kind: String,
    #[serde(rename = "2")]
    pub title: String,
    #[serde(rename = "3")]
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Assistant {
    #[serde(rename = "1")]
    pub text: String,
    #[serde(rename = "2")]
    pub reasoning: String,
    #[serde(rename = "3")]
    pub model: String,
    #[serde(rename = "4")]
    pub input_tokens: i64,
    #[serde(rename = "5")]
    pub output_tokens: i64,
    #[serde(rename = "6")]
    pub stop_reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    #[serde(rename = "1")]
    pub call_id: String,
    #[serde(rename = "2")]
    pub name: String,
    #[serde(rename = "3")]
    pub args: String,
    #[serde(rename = "4")]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    #[serde(rename = "1")]
    pub call_id: String,
    #[serde(rename = "2")]
    pub content: String,
    #[serde(rename = "3")]
    pub is_error: bool,
    #[serde(rename = "4")]
    pub exit_code: Option<i64>,
    #[serde(rename = "5")]
    pub streaming_output: String,
    #[serde(rename = "6")]
    pub output_truncated: bool,
    #[serde(rename = "7")]
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContextMetadata {
    #[serde(rename = "1")]
    pub client_tag: String,
    #[serde(rename = "2")]
    pub title: String,
    #[serde(rename = "3")]
    pub labels: Vec<String>,
    #[serde(rename = "4")]
    pub custom: HashMap<String, String>,
    #[serde(rename = "5")]
    pub provenance: Option<Provenance>,
}
