use crate::{AttractorError, FailureClass, NodeOutcome, NodeStatus, PipelineStatus, RuntimeContext};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const CHECKPOINT_FILE_NAME: &str = "checkpoint.json";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub schema_version: u32,
    pub run_id: String,
    pub checkpoint_id: String,
    pub sequence_no: u64,
    pub timestamp: String,
    #[serde(default)]
    pub git_commit_sha: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointNodeOutcome {
    pub status: String,
    pub notes: Option<String>,
    pub preferred_label: Option<String>,
    pub suggested_next_ids: Vec<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub failure_class: Option<String>,
}

impl CheckpointNodeOutcome {
    pub fn from_runtime(outcome: &NodeOutcome) -> Self {
        Self {
            status: outcome.status.as_str().to_string(),
            notes: outcome.notes.clone(),
            preferred_label: outcome.preferred_label.clone(),
            suggested_next_ids: outcome.suggested_next_ids.clone(),
            failure_reason: outcome.failure_reason.clone(),
            failure_class: outcome.failure_class.map(FailureClass::as_str).map(str::to_string),
        }
    }

    pub fn to_runtime(&self) -> Result<NodeOutcome, AttractorError> {
        let status = NodeStatus::try_from(self.status.as_str())?;
        Ok(NodeOutcome {
            status,
            notes: self.notes.clone(),
            failure_reason: self.failure_reason.clone(),
            failure_class: self
                .failure_class
                .as_deref()
                .and_then(FailureClass::from_str_loose),
            context_updates: RuntimeContext::new(),
            preferred_label: self.preferred_label.clone(),
            suggested_next_ids: self.suggested_next_ids.clone(),
            meta: BTreeMap::new(),
        })
    }
}

/// Loop-restart and replay bookkeeping that does not belong on the stable,
/// schema-versioned checkpoint fields above.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointExtra {
    #[serde(default)]
    pub base_logs_root: Option<String>,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default)]
    pub restart_failure_signatures: Vec<String>,
    #[serde(default)]
    pub loop_failure_signatures: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub last_fidelity: Option<String>,
    #[serde(default)]
    pub last_thread_key: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub metadata: CheckpointMetadata,
    pub current_node: String,
    pub next_node: Option<String>,
    pub completed_nodes: Vec<String>,
    pub node_retries: BTreeMap<String, u32>,
    pub node_outcomes: BTreeMap<String, CheckpointNodeOutcome>,
    pub context_values: RuntimeContext,
    pub logs: Vec<String>,
    pub current_node_fidelity: Option<String>,
    pub terminal_status: Option<String>,
    pub terminal_failure_reason: Option<String>,
    #[serde(default)]
    pub graph_dot_source_hash: Option<String>,
    #[serde(default)]
    pub graph_dot_source_ref: Option<String>,
    #[serde(default)]
    pub graph_snapshot_hash: Option<String>,
    #[serde(default)]
    pub graph_snapshot_ref: Option<String>,
    #[serde(default)]
    pub extra: CheckpointExtra,
}

impl CheckpointState {
    pub fn save_to_path(&self, path: &Path) -> Result<(), AttractorError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|error| {
                AttractorError::Runtime(format!(
                    "failed to create checkpoint parent directory '{}': {}",
                    parent.display(),
                    error
                ))
            })?;
        }

        let bytes = serde_json::to_vec_pretty(self).map_err(|error| {
            AttractorError::Runtime(format!("failed to serialize checkpoint: {error}"))
        })?;

        fs::write(path, bytes).map_err(|error| {
            AttractorError::Runtime(format!(
                "failed writing checkpoint file '{}': {}",
                path.display(),
                error
            ))
        })
    }

    pub fn load_from_path(path: &Path) -> Result<Self, AttractorError> {
        let bytes = fs::read(path).map_err(|error| {
            AttractorError::Runtime(format!(
                "failed reading checkpoint file '{}': {}",
                path.display(),
                error
            ))
        })?;
        serde_json::from_slice(&bytes).map_err(|error| {
            AttractorError::Runtime(format!(
                "failed deserializing checkpoint file '{}': {}",
                path.display(),
                error
            ))
        })
    }

    pub fn terminal_pipeline_status(&self) -> Result<Option<PipelineStatus>, AttractorError> {
        match self.terminal_status.as_deref() {
            Some("success") => Ok(Some(PipelineStatus::Success)),
            Some("fail") => Ok(Some(PipelineStatus::Fail)),
            Some(other) => Err(AttractorError::Runtime(format!(
                "checkpoint has unknown terminal status '{other}'"
            ))),
            None => Ok(None),
        }
    }
}

pub fn checkpoint_file_path(logs_root: &Path) -> PathBuf {
    logs_root.join(CHECKPOINT_FILE_NAME)
}

impl TryFrom<&str> for NodeStatus {
    type Error = AttractorError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "success" => Ok(Self::Success),
            "partial_success" => Ok(Self::PartialSuccess),
            "skipped" => Ok(Self::Skipped),
            "retry" => Ok(Self::Retry),
            "fail" => Ok(Self::Fail),
            other => Err(AttractorError::Runtime(format!(
                "unknown node status '{other}' in checkpoint"
            ))),
        }
    }
}
