use crate::{
    AttractorError, FailureClass, Graph, Node, NodeExecutor, NodeOutcome, NodeStatus,
    RuntimeContext, handlers::NodeHandler,
};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

#[derive(Clone, Debug)]
struct BranchResult {
    branch_id: String,
    target_node: String,
    status: NodeStatus,
    score: f64,
    notes: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum JoinPolicy {
    AllSuccess,
    AnySuccess,
    Quorum,
    Ignore,
}

/// Fans out one real sub-run per outgoing edge, each executing its target
/// node's own handler against a context forked from the parallel node's
/// context (mirroring a new CXDB context per branch). Branches run
/// concurrently as `tokio::spawn` tasks, bounded by `max_parallel`.
pub struct ParallelHandler {
    branch_executor: Arc<dyn NodeExecutor>,
}

impl Default for ParallelHandler {
    fn default() -> Self {
        Self {
            branch_executor: Arc::new(crate::handlers::registry::RegistryNodeExecutor::new(
                crate::handlers::core_registry(),
            )),
        }
    }
}

impl std::fmt::Debug for ParallelHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelHandler").finish()
    }
}

impl ParallelHandler {
    pub fn new(branch_executor: Arc<dyn NodeExecutor>) -> Self {
        Self { branch_executor }
    }
}

#[async_trait]
impl NodeHandler for ParallelHandler {
    async fn execute(
        &self,
        node: &Node,
        context: &RuntimeContext,
        graph: &Graph,
    ) -> Result<NodeOutcome, AttractorError> {
        let branches: Vec<(String, String)> = graph
            .outgoing_edges(&node.id)
            .map(|edge| {
                (
                    edge.attrs
                        .get_str("label")
                        .filter(|label| !label.trim().is_empty())
                        .unwrap_or(edge.to.as_str())
                        .to_string(),
                    edge.to.clone(),
                )
            })
            .collect();

        if branches.is_empty() {
            return Ok(NodeOutcome::failure(format!(
                "parallel node '{}' has no outgoing branches",
                node.id
            )));
        }

        let join_policy = parse_join_policy(node);
        let max_parallel = parse_usize_attr(node, "max_parallel", 4).max(1);
        let quorum_needed = quorum_target_count(node, branches.len());

        let mut results =
            run_branch_batches(&self.branch_executor, graph, branches, context, max_parallel)
                .await?;
        results.sort_by(|left, right| left.branch_id.cmp(&right.branch_id));

        let success_count = results
            .iter()
            .filter(|result| result.status.is_success_like())
            .count();
        let fail_count = results
            .iter()
            .filter(|result| result.status == NodeStatus::Fail)
            .count();

        let (status, notes) = match join_policy {
            JoinPolicy::AllSuccess => {
                if fail_count == 0 {
                    (
                        NodeStatus::Success,
                        format!("all {} branches completed successfully", results.len()),
                    )
                } else {
                    (
                        NodeStatus::Fail,
                        format!(
                            "all_success policy failed: {} of {} branches failed",
                            fail_count,
                            results.len()
                        ),
                    )
                }
            }
            JoinPolicy::AnySuccess => {
                if success_count > 0 {
                    (
                        NodeStatus::Success,
                        format!(
                            "any_success policy satisfied: {} successful branches",
                            success_count
                        ),
                    )
                } else {
                    (
                        NodeStatus::Fail,
                        "any_success policy failed: no successful branch".to_string(),
                    )
                }
            }
            JoinPolicy::Quorum => {
                if success_count >= quorum_needed {
                    (
                        NodeStatus::Success,
                        format!(
                            "quorum policy satisfied: {} successful branches (required {})",
                            success_count, quorum_needed
                        ),
                    )
                } else {
                    (
                        NodeStatus::Fail,
                        format!(
                            "quorum policy failed: {} successful branches (required {})",
                            success_count, quorum_needed
                        ),
                    )
                }
            }
            JoinPolicy::Ignore => (
                NodeStatus::Success,
                format!(
                    "ignore policy: {} branches completed ({} failures ignored)",
                    results.len(),
                    fail_count
                ),
            ),
        };

        let mut updates = RuntimeContext::new();
        updates.insert(
            "parallel.results".to_string(),
            Value::Array(results.iter().map(branch_result_to_value).collect()),
        );
        updates.insert(
            "parallel.branch_count".to_string(),
            Value::Number((results.len() as u64).into()),
        );
        updates.insert(
            "parallel.success_count".to_string(),
            Value::Number((success_count as u64).into()),
        );
        updates.insert(
            "parallel.fail_count".to_string(),
            Value::Number((fail_count as u64).into()),
        );
        updates.insert(
            "parallel.join_policy".to_string(),
            Value::String(join_policy.as_str().to_string()),
        );
        let join_node = attr_str(node, &["join_node"])
            .map(str::to_string)
            .unwrap_or_else(|| node.id.clone());
        updates.insert("parallel.join_node".to_string(), Value::String(join_node));

        NodeOutcome {
            status,
            notes: Some(notes),
            context_updates: updates,
            failure_class: if status == NodeStatus::Fail {
                Some(FailureClass::Deterministic)
            } else {
                None
            },
            ..NodeOutcome::success()
        }
        .canonicalize()
    }
}

impl JoinPolicy {
    fn as_str(self) -> &'static str {
        match self {
            Self::AllSuccess => "all_success",
            Self::AnySuccess => "any_success",
            Self::Quorum => "quorum",
            Self::Ignore => "ignore",
        }
    }
}

async fn run_branch_batches(
    executor: &Arc<dyn NodeExecutor>,
    graph: &Graph,
    branches: Vec<(String, String)>,
    context: &RuntimeContext,
    max_parallel: usize,
) -> Result<Vec<BranchResult>, AttractorError> {
    let mut out = Vec::with_capacity(branches.len());
    for batch in branches.chunks(max_parallel) {
        let mut handles = Vec::with_capacity(batch.len());
        for (branch_id, target_node) in batch {
            let Some(node) = graph.nodes.get(target_node).cloned() else {
                out.push(BranchResult {
                    branch_id: branch_id.clone(),
                    target_node: target_node.clone(),
                    status: NodeStatus::Fail,
                    score: 0.0,
                    notes: Some(format!("branch target '{target_node}' not found in graph")),
                });
                continue;
            };
            let branch_context = fork_branch_context(context, branch_id, target_node);
            let branch_id = branch_id.clone();
            let target_node = target_node.clone();
            let executor = executor.clone();
            let graph_for_task = graph.clone();
            handles.push(tokio::spawn(async move {
                let outcome = executor
                    .execute(&node, &branch_context, &graph_for_task)
                    .await
                    .unwrap_or_else(|error| NodeOutcome::failure(error.to_string()));
                BranchResult {
                    score: branch_score(&outcome),
                    notes: outcome.notes.clone(),
                    status: outcome.status,
                    branch_id,
                    target_node,
                }
            }));
        }

        for handle in handles {
            let branch_result = handle.await.map_err(|error| {
                AttractorError::Runtime(format!("parallel branch task panicked: {error}"))
            })?;
            out.push(branch_result);
        }
    }

    Ok(out)
}

fn branch_score(outcome: &NodeOutcome) -> f64 {
    match outcome.status {
        NodeStatus::Success => 1.0,
        NodeStatus::PartialSuccess => 0.5,
        NodeStatus::Skipped => 0.25,
        NodeStatus::Retry | NodeStatus::Fail => 0.0,
    }
}

fn fork_branch_context(base: &RuntimeContext, branch_id: &str, target_node: &str) -> RuntimeContext {
    let mut forked = base.clone();
    forked.insert(
        "work.branch_id".to_string(),
        Value::String(branch_id.to_string()),
    );
    forked.insert(
        "work.branch_target".to_string(),
        Value::String(target_node.to_string()),
    );
    forked
}

fn parse_join_policy(node: &Node) -> JoinPolicy {
    let value = attr_str(node, &["join_policy"]).unwrap_or("all_success");
    match value.trim() {
        "any_success" => JoinPolicy::AnySuccess,
        "quorum" => JoinPolicy::Quorum,
        "ignore" => JoinPolicy::Ignore,
        _ => JoinPolicy::AllSuccess,
    }
}

fn parse_usize_attr(node: &Node, key: &str, default: usize) -> usize {
    for candidate in attr_key_variants(key) {
        let Some(value) = node.attrs.get(&candidate) else {
            continue;
        };
        return match value {
            crate::AttrValue::Integer(value) if *value >= 0 => *value as usize,
            crate::AttrValue::String(value) => value.parse::<usize>().unwrap_or(default),
            _ => default,
        };
    }
    default
}

fn parse_f64_attr(node: &Node, key: &str, default: f64) -> f64 {
    for candidate in attr_key_variants(key) {
        let Some(value) = node.attrs.get(&candidate) else {
            continue;
        };
        return match value {
            crate::AttrValue::Float(value) => *value,
            crate::AttrValue::Integer(value) => *value as f64,
            crate::AttrValue::String(value) => value.parse::<f64>().unwrap_or(default),
            _ => default,
        };
    }
    default
}

fn quorum_target_count(node: &Node, branch_count: usize) -> usize {
    for candidate in attr_key_variants("quorum_count") {
        if let Some(explicit) = node.attrs.get(&candidate).and_then(|value| match value {
            crate::AttrValue::Integer(value) if *value >= 1 => Some(*value as usize),
            crate::AttrValue::String(value) => value.parse::<usize>().ok(),
            _ => None,
        }) {
            return explicit.min(branch_count).max(1);
        }
    }

    let ratio = parse_f64_attr(node, "quorum_ratio", 0.5).clamp(0.0, 1.0);
    ((branch_count as f64) * ratio).ceil().max(1.0) as usize
}

fn attr_key_variants(key: &str) -> Vec<String> {
    vec![key.to_string(), key.replace('.', "_")]
}

fn attr_str<'a>(node: &'a Node, keys: &[&str]) -> Option<&'a str> {
    for key in keys {
        if let Some(value) = node.attrs.get_str(key) {
            return Some(value);
        }
        let underscored = key.replace('.', "_");
        if let Some(value) = node.attrs.get_str(&underscored) {
            return Some(value);
        }
    }
    None
}

fn branch_result_to_value(result: &BranchResult) -> Value {
    json!({
        "branch_id": result.branch_id,
        "target_node": result.target_node,
        "status": result.status.as_str(),
        "score": result.score,
        "notes": result.notes,
    })
}
