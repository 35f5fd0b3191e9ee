//! Provider dispatch: model resolution order, failover chain, CLI argv
//! templating, and stream-JSON decoding. `forge-llm::provider::ProviderAdapter`
//! stays a stub, so the actual HTTP/CLI round trip is expressed here as a
//! `CodergenTransport` trait the codergen handler dispatches through.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no provider configured for node")]
    NoProvider,
    #[error("provider '{0}' not found in failover chain or config")]
    UnknownProvider(String),
    #[error("failover chain exhausted after providers: {0:?}")]
    FailoverExhausted(Vec<String>),
    #[error("transport error from provider '{provider}': {message}")]
    Transport { provider: String, message: String },
}

/// Resolution order, highest precedence first: stage-executor escalation
/// switch, then `force_models[provider]`, then the node's own `llm_model`.
pub fn resolve_model(
    escalation_model: Option<&str>,
    force_models: &BTreeMap<String, String>,
    provider: &str,
    node_llm_model: &str,
) -> String {
    if let Some(model) = escalation_model {
        return model.to_string();
    }
    if let Some(model) = force_models.get(provider) {
        return model.clone();
    }
    node_llm_model.to_string()
}

/// Minimal typed shape of a provider call's failure, enough to classify it
/// per `should_failover` without depending on the (stubbed) SDK error type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProviderErrorSignal {
    NotFound,
    ContentFilterBlocked,
    QuotaExceeded,
    TurnLimitExhausted,
    Retryable { status: Option<u16> },
    Deterministic,
}

/// Whether a failed call to the primary provider should advance to the next
/// provider in the failover chain.
pub fn should_failover(signal: &ProviderErrorSignal) -> bool {
    match signal {
        ProviderErrorSignal::NotFound => false,
        ProviderErrorSignal::ContentFilterBlocked => false,
        ProviderErrorSignal::QuotaExceeded => true,
        ProviderErrorSignal::TurnLimitExhausted => false,
        ProviderErrorSignal::Retryable { .. } => true,
        ProviderErrorSignal::Deterministic => false,
    }
}

#[derive(Clone, Debug, Default)]
pub struct ModelCatalogEntry {
    pub provider: String,
    pub model_id: String,
    pub is_variant: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ModelCatalog {
    entries: Vec<ModelCatalogEntry>,
}

impl ModelCatalog {
    pub fn new(entries: Vec<ModelCatalogEntry>) -> Self {
        Self { entries }
    }

    pub fn covers_provider(&self, provider: &str) -> bool {
        self.entries.iter().any(|entry| entry.provider == provider)
    }

    pub fn has_pair(&self, provider: &str, model_id: &str) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.provider == provider && entry.model_id == model_id)
    }

    fn first_non_variant_for(&self, provider: &str) -> Option<&str> {
        let mut ids: Vec<&str> = self
            .entries
            .iter()
            .filter(|entry| entry.provider == provider && !entry.is_variant)
            .map(|entry| entry.model_id.as_str())
            .collect();
        ids.sort_unstable();
        ids.into_iter().next()
    }
}

fn stable_default_for(target_provider: &str) -> Option<&'static str> {
    match target_provider {
        "zai" => Some("glm-4.7"),
        _ => None,
    }
}

fn strip_provider_prefix(model_id: &str) -> &str {
    model_id.split_once('/').map(|(_, rest)| rest).unwrap_or(model_id)
}

/// Chooses the model id to use after failing over to `target_provider`.
pub fn pick_failover_model(target_provider: &str, catalog: &ModelCatalog, primary_model: &str) -> String {
    let normalized = strip_provider_prefix(primary_model);
    if let Some(stable) = stable_default_for(target_provider) {
        return stable.to_string();
    }
    if let Some(candidate) = catalog.first_non_variant_for(target_provider) {
        return candidate.to_string();
    }
    normalized.to_string()
}

/// Walks a configured failover chain, calling `attempt` for each provider in
/// order until one succeeds or the chain is exhausted.
pub async fn run_with_failover<F, Fut, T>(
    chain: &[String],
    catalog: &ModelCatalog,
    primary_model: &str,
    mut attempt: F,
) -> Result<T, RouterError>
where
    F: FnMut(String, String) -> Fut,
    Fut: std::future::Future<Output = Result<T, ProviderErrorSignal>>,
{
    if chain.is_empty() {
        return Err(RouterError::NoProvider);
    }
    let mut tried = Vec::new();
    let mut current_model = primary_model.to_string();
    for (index, provider) in chain.iter().enumerate() {
        tried.push(provider.clone());
        let model = if index == 0 {
            current_model.clone()
        } else {
            pick_failover_model(provider, catalog, primary_model)
        };
        match attempt(provider.clone(), model.clone()).await {
            Ok(value) => return Ok(value),
            Err(signal) if should_failover(&signal) && index + 1 < chain.len() => {
                current_model = model;
                continue;
            }
            Err(signal) => {
                return Err(RouterError::Transport {
                    provider: provider.clone(),
                    message: format!("{signal:?}"),
                });
            }
        }
    }
    Err(RouterError::FailoverExhausted(tried))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CliProviderKind {
    Codex,
    Claude,
    Gemini,
}

impl CliProviderKind {
    pub fn from_provider_key(key: &str) -> Option<Self> {
        match key {
            "openai" | "codex" => Some(Self::Codex),
            "anthropic" | "claude" => Some(Self::Claude),
            "google" | "gemini" => Some(Self::Gemini),
            _ => None,
        }
    }
}

/// Substitutes `{{model}}`/`{{worktree}}`/`{{prompt}}` tokens in an
/// invocation template, then appends the provider-specific flags.
pub fn build_cli_argv(
    kind: CliProviderKind,
    invocation_template: &[String],
    model: &str,
    worktree: &str,
    prompt: &str,
    claude_verbose_supported: bool,
) -> Vec<String> {
    let substitute = |token: &str| -> String {
        token
            .replace("{{model}}", model)
            .replace("{{worktree}}", worktree)
            .replace("{{prompt}}", prompt)
    };
    let mut argv: Vec<String> = invocation_template.iter().map(|token| substitute(token)).collect();

    match kind {
        CliProviderKind::Codex => {
            argv.push("--json".to_string());
            argv.push("--sandbox".to_string());
            argv.push("workspace-write".to_string());
        }
        CliProviderKind::Claude => {
            argv.push("-p".to_string());
            argv.push("--output-format".to_string());
            argv.push("stream-json".to_string());
            if claude_verbose_supported {
                argv.push("--verbose".to_string());
            }
            argv.push("--dangerously-skip-permissions".to_string());
            let normalized_model = strip_provider_prefix(model).replace('.', "-");
            argv.push(normalized_model);
        }
        CliProviderKind::Gemini => {
            argv.push("-p".to_string());
            argv.push("--yolo".to_string());
            argv.push("--model".to_string());
            argv.push(model.to_string());
        }
    }
    argv
}

/// One decoded line of a CLI provider's NDJSON stream.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamJsonEvent {
    AssistantMessage { text: String },
    ToolCall { call_id: String, name: String, arguments: serde_json::Value },
    ToolResult { call_id: String, tool_name: Option<String>, output: serde_json::Value },
    Lifecycle { kind: String },
}

#[derive(Debug, Deserialize)]
struct RawStreamLine {
    #[serde(rename = "type")]
    line_type: String,
    #[serde(default)]
    message: Option<RawMessage>,
    #[serde(default)]
    content: Option<Vec<RawContentBlock>>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    content: Vec<RawContentBlock>,
}

#[derive(Debug, Deserialize)]
struct RawContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<serde_json::Value>,
    #[serde(default)]
    tool_use_id: Option<String>,
    #[serde(default)]
    output: Option<serde_json::Value>,
}

/// Tracks `call_id -> tool name` so a later `tool_result` line (which the
/// CLI does not echo the tool name on) can be labeled.
#[derive(Debug, Default)]
pub struct ToolCallNameMap {
    names: BTreeMap<String, String>,
}

impl ToolCallNameMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember(&mut self, call_id: &str, name: &str) {
        self.names.insert(call_id.to_string(), name.to_string());
    }

    pub fn lookup(&self, call_id: &str) -> Option<&str> {
        self.names.get(call_id).map(String::as_str)
    }
}

/// Decodes a single NDJSON line into zero or more stream events, recording
/// any `tool_use` blocks into `tool_names` so subsequent `tool_result` lines
/// resolve a name.
pub fn decode_stream_json_line(
    line: &str,
    tool_names: &mut ToolCallNameMap,
) -> Result<Vec<StreamJsonEvent>, serde_json::Error> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let raw: RawStreamLine = serde_json::from_str(trimmed)?;
    let mut events = Vec::new();
    match raw.line_type.as_str() {
        "assistant" => {
            let blocks = raw.message.map(|message| message.content).unwrap_or_default();
            let mut assistant_text = String::new();
            for block in blocks {
                match block.block_type.as_str() {
                    "text" => {
                        if let Some(text) = block.text {
                            assistant_text.push_str(&text);
                        }
                    }
                    "tool_use" => {
                        let call_id = block.id.unwrap_or_default();
                        let name = block.name.unwrap_or_default();
                        tool_names.remember(&call_id, &name);
                        events.push(StreamJsonEvent::ToolCall {
                            call_id,
                            name,
                            arguments: block.input.unwrap_or(serde_json::Value::Null),
                        });
                    }
                    _ => {}
                }
            }
            if !assistant_text.is_empty() {
                events.insert(0, StreamJsonEvent::AssistantMessage { text: assistant_text });
            }
        }
        "user" => {
            for block in raw.content.unwrap_or_default() {
                if block.block_type == "tool_result" {
                    let call_id = block.tool_use_id.unwrap_or_default();
                    let tool_name = tool_names.lookup(&call_id).map(str::to_string);
                    events.push(StreamJsonEvent::ToolResult {
                        tool_name,
                        output: block.output.unwrap_or(serde_json::Value::Null),
                        call_id,
                    });
                }
            }
        }
        "system" | "result" | "done" => {
            events.push(StreamJsonEvent::Lifecycle { kind: raw.line_type });
        }
        other => {
            events.push(StreamJsonEvent::Lifecycle { kind: other.to_string() });
        }
    }
    Ok(events)
}

#[derive(Clone, Debug, Serialize)]
pub struct CodergenRequest {
    pub provider: String,
    pub model: String,
    pub worktree: String,
    pub prompt: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CodergenResponse {
    pub text: String,
    pub events: Vec<String>,
}

/// Dispatch seam for the actual CLI subprocess / HTTP round trip. Production
/// wiring builds argv via [`build_cli_argv`] and decodes output with
/// [`decode_stream_json_line`]; tests substitute a canned transport.
#[async_trait]
pub trait CodergenTransport: Send + Sync {
    async fn dispatch(&self, request: &CodergenRequest) -> Result<CodergenResponse, RouterError>;
}
