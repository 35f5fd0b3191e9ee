use crate::storage::AttractorArtifactWriter;
use crate::{AttractorError, FailureClass, Graph, Node, RuntimeContext, handlers};
use async_trait::async_trait;
use forge_cxdb_runtime::CxdbTurnId as TurnId;
use serde_json::Value;
use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeStatus {
    Success,
    PartialSuccess,
    Skipped,
    Retry,
    Fail,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
            Self::Skipped => "skipped",
            Self::Retry => "retry",
            Self::Fail => "fail",
        }
    }

    pub fn from_str_loose(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "success" => Some(Self::Success),
            "partial_success" | "partial-success" => Some(Self::PartialSuccess),
            "skipped" | "skip" => Some(Self::Skipped),
            "retry" => Some(Self::Retry),
            "fail" | "failure" => Some(Self::Fail),
            _ => None,
        }
    }

    pub fn is_success_like(self) -> bool {
        matches!(self, Self::Success | Self::PartialSuccess | Self::Skipped)
    }

    pub fn requires_failure_reason(self) -> bool {
        matches!(self, Self::Fail | Self::Retry)
    }
}

/// Outcome of executing a single node. `failure_reason` is mandatory and
/// non-empty whenever `status` is `Fail` or `Retry`; the canonicalization
/// performed in `canonicalize` keeps `notes` and `failure_reason` mirrored
/// for handlers that only set one of the two.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeOutcome {
    pub status: NodeStatus,
    pub notes: Option<String>,
    pub failure_reason: Option<String>,
    pub failure_class: Option<FailureClass>,
    pub context_updates: RuntimeContext,
    pub preferred_label: Option<String>,
    pub suggested_next_ids: Vec<String>,
    pub meta: BTreeMap<String, Value>,
}

impl Default for NodeOutcome {
    fn default() -> Self {
        Self::success()
    }
}

impl NodeOutcome {
    pub fn success() -> Self {
        Self {
            status: NodeStatus::Success,
            notes: None,
            failure_reason: None,
            failure_class: None,
            context_updates: RuntimeContext::new(),
            preferred_label: None,
            suggested_next_ids: Vec::new(),
            meta: BTreeMap::new(),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: NodeStatus::Skipped,
            notes: Some(reason.into()),
            ..Self::success()
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            status: NodeStatus::Fail,
            notes: Some(reason.clone()),
            failure_reason: Some(reason),
            failure_class: Some(FailureClass::Deterministic),
            context_updates: RuntimeContext::new(),
            preferred_label: None,
            suggested_next_ids: Vec::new(),
            meta: BTreeMap::new(),
        }
    }

    pub fn failure_with_class(reason: impl Into<String>, class: FailureClass) -> Self {
        let mut outcome = Self::failure(reason);
        outcome.failure_class = Some(class);
        outcome
    }

    /// Mirrors `notes`/`failure_reason` onto each other and rejects an
    /// empty failure reason on `fail`/`retry` outcomes.
    pub fn canonicalize(mut self) -> Result<Self, AttractorError> {
        if self.status.requires_failure_reason() {
            let reason = self
                .failure_reason
                .clone()
                .or_else(|| self.notes.clone())
                .filter(|reason| !reason.trim().is_empty());
            let Some(reason) = reason else {
                return Err(AttractorError::Runtime(format!(
                    "outcome with status '{}' requires a non-empty failure_reason",
                    self.status.as_str()
                )));
            };
            self.failure_reason = Some(reason.clone());
            if self.notes.is_none() {
                self.notes = Some(reason);
            }
            if self.failure_class.is_none() {
                self.failure_class = Some(FailureClass::Deterministic);
            }
        }
        Ok(self)
    }
}

#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(
        &self,
        node: &Node,
        context: &RuntimeContext,
        graph: &Graph,
    ) -> Result<NodeOutcome, AttractorError>;
}

#[derive(Debug, Default)]
pub struct NoopNodeExecutor;

#[async_trait]
impl NodeExecutor for NoopNodeExecutor {
    async fn execute(
        &self,
        _node: &Node,
        _context: &RuntimeContext,
        _graph: &Graph,
    ) -> Result<NodeOutcome, AttractorError> {
        Ok(NodeOutcome::success())
    }
}

#[derive(Clone)]
pub struct RunConfig {
    pub run_id: Option<String>,
    pub base_turn_id: Option<TurnId>,
    pub storage: Option<crate::storage::SharedAttractorStorageWriter>,
    pub artifacts: Option<Arc<dyn AttractorArtifactWriter>>,
    pub cxdb_persistence: CxdbPersistenceMode,
    pub events: crate::RuntimeEventSink,
    pub executor: Arc<dyn NodeExecutor>,
    pub retry_backoff: crate::RetryBackoffConfig,
    pub logs_root: Option<PathBuf>,
    pub resume_from_checkpoint: Option<PathBuf>,
    pub max_loop_restarts: u32,
    pub preflight: crate::PreflightInputs,
    pub stall_watchdog: crate::StallWatchdogConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CxdbPersistenceMode {
    Off,
    Required,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_id: None,
            base_turn_id: None,
            storage: None,
            artifacts: None,
            cxdb_persistence: CxdbPersistenceMode::Off,
            events: crate::RuntimeEventSink::default(),
            executor: Arc::new(handlers::registry::RegistryNodeExecutor::new(
                handlers::core_registry(),
            )),
            retry_backoff: crate::RetryBackoffConfig::default(),
            logs_root: None,
            resume_from_checkpoint: None,
            max_loop_restarts: 16,
            preflight: crate::PreflightInputs::default(),
            stall_watchdog: crate::StallWatchdogConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineStatus {
    Success,
    Fail,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineRunResult {
    pub run_id: String,
    pub status: PipelineStatus,
    pub failure_reason: Option<String>,
    pub completed_nodes: Vec<String>,
    pub node_outcomes: BTreeMap<String, NodeOutcome>,
    pub context: RuntimeContext,
}
