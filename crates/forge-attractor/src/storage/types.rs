use crate::storage::{BlobHash, ContextId, TurnId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ATTRACTOR_RUN_EVENT_TYPE_ID: &str = "forge.attractor.run_event";
pub const ATTRACTOR_STAGE_EVENT_TYPE_ID: &str = "forge.attractor.stage_event";
pub const ATTRACTOR_CHECKPOINT_EVENT_TYPE_ID: &str = "forge.attractor.checkpoint_event";
pub const ATTRACTOR_STAGE_TO_AGENT_LINK_TYPE_ID: &str = "forge.link.stage_to_agent";
pub const ATTRACTOR_DOT_SOURCE_TYPE_ID: &str = "forge.attractor.dot_source";
pub const ATTRACTOR_GRAPH_SNAPSHOT_TYPE_ID: &str = "forge.attractor.graph_snapshot";

/// Correlation envelope carried on every attractor turn. Ties a stored
/// event back to the run, the node/stage attempt that produced it (when
/// applicable), and the forge-agent session it is linked to (when any).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttractorCorrelation {
    pub run_id: String,
    pub pipeline_context_id: Option<ContextId>,
    pub node_id: Option<String>,
    pub stage_attempt_id: Option<String>,
    pub parent_turn_id: Option<TurnId>,
    pub sequence_no: u64,
    pub agent_session_id: Option<String>,
    pub agent_context_id: Option<ContextId>,
    pub agent_head_turn_id: Option<TurnId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunEventRecord {
    pub event_kind: String,
    pub timestamp: String,
    pub payload: Value,
    pub correlation: AttractorCorrelation,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageEventRecord {
    pub event_kind: String,
    pub timestamp: String,
    pub payload: Value,
    pub correlation: AttractorCorrelation,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEventRecord {
    pub checkpoint_id: String,
    pub timestamp: String,
    pub state_summary: Value,
    pub checkpoint_hash: Option<BlobHash>,
    pub correlation: AttractorCorrelation,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageToAgentLinkRecord {
    pub timestamp: String,
    pub run_id: String,
    pub pipeline_context_id: ContextId,
    pub node_id: String,
    pub stage_attempt_id: String,
    pub agent_session_id: String,
    pub agent_context_id: ContextId,
    pub agent_head_turn_id: Option<TurnId>,
    pub parent_turn_id: Option<TurnId>,
    pub sequence_no: u64,
    pub thread_key: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DotSourceRecord {
    pub timestamp: String,
    pub dot_source: String,
    pub content_hash: BlobHash,
    pub size_bytes: u64,
    pub correlation: AttractorCorrelation,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshotRecord {
    pub timestamp: String,
    pub graph_snapshot: Value,
    pub content_hash: BlobHash,
    pub size_bytes: u64,
    pub correlation: AttractorCorrelation,
}

// The turnstore envelope (`AppendTurnRequest`) already carries `type_id` and
// `type_version` out of band, so these records serialize as-is; the
// `*_envelope` functions exist so callers never depend on the record shape
// directly matching the wire payload.
pub fn run_event_envelope(record: RunEventRecord) -> RunEventRecord {
    record
}

pub fn stage_event_envelope(record: StageEventRecord) -> StageEventRecord {
    record
}

pub fn checkpoint_event_envelope(record: CheckpointEventRecord) -> CheckpointEventRecord {
    record
}

pub fn stage_to_agent_link_envelope(record: StageToAgentLinkRecord) -> StageToAgentLinkRecord {
    record
}

pub fn dot_source_envelope(record: DotSourceRecord) -> DotSourceRecord {
    record
}

pub fn graph_snapshot_envelope(record: GraphSnapshotRecord) -> GraphSnapshotRecord {
    record
}
