use crate::{FailureClass, Graph, Node, NodeOutcome, NodeStatus};

#[derive(Clone, Debug, PartialEq)]
pub struct RetryBackoffConfig {
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryBackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 200,
            backoff_factor: 2.0,
            max_delay_ms: 60_000,
            jitter: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: RetryBackoffConfig,
}

pub fn build_retry_policy(node: &Node, graph: &Graph, backoff: RetryBackoffConfig) -> RetryPolicy {
    let max_retries = node
        .attrs
        .get("max_retries")
        .and_then(|value| value.as_i64())
        .or_else(|| {
            graph
                .attrs
                .get("default_max_retry")
                .and_then(|value| value.as_i64())
        })
        .unwrap_or(0)
        .max(0) as u32;

    RetryPolicy {
        max_attempts: max_retries + 1,
        backoff,
    }
}

/// Gated on `failure_class`: `transient_infra`, `budget_exhausted`, and
/// `compilation_loop` retry; `deterministic`, `canceled`, and outcomes with
/// no class attached do not.
pub fn should_retry_outcome(outcome: &NodeOutcome) -> bool {
    if !matches!(outcome.status, NodeStatus::Retry | NodeStatus::Fail) {
        return false;
    }
    match outcome.failure_class {
        Some(class) => class.is_retryable(),
        None => false,
    }
}

/// Tool nodes (non-empty `tool_command`) retry on fail/retry up to
/// `max_retries` regardless of failure class: a failing shell command has
/// no classifier attached by `handlers/tool.rs`, so the class-gated check
/// in [`should_retry_outcome`] would otherwise never retry them.
pub fn should_retry_for_node(node: &Node, outcome: &NodeOutcome) -> bool {
    if !matches!(outcome.status, NodeStatus::Retry | NodeStatus::Fail) {
        return false;
    }
    let is_tool_node = node
        .attrs
        .get_str("tool_command")
        .map(|cmd| !cmd.trim().is_empty())
        .unwrap_or(false);
    if is_tool_node {
        return true;
    }
    should_retry_outcome(outcome)
}

pub fn finalize_retry_exhausted(node: &Node) -> NodeOutcome {
    if node.attrs.get_bool("allow_partial") == Some(true) {
        return NodeOutcome {
            status: NodeStatus::PartialSuccess,
            notes: Some("retries exhausted, partial accepted".to_string()),
            ..NodeOutcome::success()
        };
    }

    NodeOutcome::failure_with_class("max retries exceeded", FailureClass::Deterministic)
}

pub fn delay_for_attempt_ms(attempt: u32, config: &RetryBackoffConfig, jitter_seed: u64) -> u64 {
    let exp = (attempt.saturating_sub(1)) as i32;
    let base = (config.initial_delay_ms as f64) * config.backoff_factor.powi(exp);
    let mut delay = base.min(config.max_delay_ms as f64);
    if config.jitter {
        let factor = jitter_factor(attempt, jitter_seed);
        delay *= factor;
    }
    delay.round().max(0.0) as u64
}

fn jitter_factor(attempt: u32, jitter_seed: u64) -> f64 {
    let mut x = jitter_seed ^ ((attempt as u64) << 32) ^ 0x9E3779B97F4A7C15;
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    let r = x.wrapping_mul(0x2545F4914F6CDD1D);
    let unit = (r as f64) / (u64::MAX as f64);
    0.5 + unit
}
