//! Failure classification and deterministic-failure-cycle signatures.
//!
//! Grounded on the shape of the teacher's `retry.rs`/`errors.rs`: a plain
//! status enum isn't enough to decide retry/loop-restart eligibility, so
//! every `fail`/`retry` outcome additionally carries a `FailureClass`.

use crate::NodeOutcome;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Deterministic,
    TransientInfra,
    BudgetExhausted,
    CompilationLoop,
    Canceled,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deterministic => "deterministic",
            Self::TransientInfra => "transient_infra",
            Self::BudgetExhausted => "budget_exhausted",
            Self::CompilationLoop => "compilation_loop",
            Self::Canceled => "canceled",
        }
    }

    pub fn from_str_loose(value: &str) -> Option<Self> {
        match value.trim() {
            "deterministic" => Some(Self::Deterministic),
            "transient_infra" => Some(Self::TransientInfra),
            "budget_exhausted" => Some(Self::BudgetExhausted),
            "compilation_loop" => Some(Self::CompilationLoop),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// `transient_infra`, `budget_exhausted`, `compilation_loop` retry;
    /// `deterministic`, `canceled`, and unknown classes do not.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::TransientInfra | Self::BudgetExhausted | Self::CompilationLoop
        )
    }

    /// A loop-restart is only permitted for `transient_infra` failures.
    pub fn allows_loop_restart(self) -> bool {
        matches!(self, Self::TransientInfra)
    }
}

/// `node_id|failure_class|sha1(failure_reason[:128])`-style signature used
/// by the deterministic-failure cycle breaker. `blake3` is used instead of
/// `sha1` since it is already a workspace dependency and the signature is
/// compared for equality only, never exposed as a canonical hash identity.
pub fn failure_signature(node_id: &str, class: FailureClass, reason: &str) -> String {
    let truncated: String = reason.chars().take(128).collect();
    let digest = blake3::hash(truncated.as_bytes()).to_hex();
    format!("{node_id}|{}|{}", class.as_str(), &digest.as_str()[..16])
}

pub fn failure_signature_for_outcome(node_id: &str, outcome: &NodeOutcome) -> Option<String> {
    let class = outcome.failure_class?;
    let reason = outcome.failure_reason.as_deref().unwrap_or_default();
    Some(failure_signature(node_id, class, reason))
}

/// Classify a raw provider/tool error string per the exec/help-probe/
/// timeout heuristics: `exec: not found` style errors and unsupported-flag
/// help probes are `deterministic`; timeouts, rate limits, and transport
/// resets are `transient_infra`; everything else falls back to
/// `deterministic` with an `unknown` signature.
pub fn classify_provider_error(provider: &str, message: &str) -> (FailureClass, String) {
    let lower = message.to_ascii_lowercase();
    if lower.contains("exec:") && lower.contains("not found") || lower.contains("no such file") {
        return (
            FailureClass::Deterministic,
            format!("provider_executable_missing|{provider}|not_found"),
        );
    }
    if lower.contains("stream disconnected") || lower.contains("stream closed before") {
        return (
            FailureClass::TransientInfra,
            format!("provider_stream_disconnect|{provider}"),
        );
    }
    if lower.contains("timed out") || lower.contains("timeout") {
        return (
            FailureClass::TransientInfra,
            format!("provider_timeout|{provider}"),
        );
    }
    if lower.contains("rate limit") || lower.contains("429") {
        return (
            FailureClass::TransientInfra,
            format!("provider_rate_limit|{provider}"),
        );
    }
    if lower.contains("connection reset")
        || lower.contains("connection refused")
        || lower.contains("broken pipe")
    {
        return (
            FailureClass::TransientInfra,
            format!("provider_transport|{provider}"),
        );
    }
    if lower.contains("unsupported option") || lower.contains("unrecognized option") {
        return (
            FailureClass::Deterministic,
            format!("provider_capability_missing|{provider}"),
        );
    }
    (
        FailureClass::Deterministic,
        format!("provider_failure|{provider}|unknown"),
    )
}
