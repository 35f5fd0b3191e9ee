use crate::{
    AttractorError, FailureClass, Graph, Node, NodeOutcome, NodeStatus, RuntimeContext,
    handlers::NodeHandler,
};
use async_trait::async_trait;
use serde_json::Value;

/// Pass-through router: executes exactly once and echoes the prior stage's
/// outcome (status/preferred_label/failure_reason/failure_class) from the
/// running context rather than producing a new result of its own.
#[derive(Debug, Default)]
pub struct ConditionalHandler;

#[async_trait]
impl NodeHandler for ConditionalHandler {
    async fn execute(
        &self,
        _node: &Node,
        context: &RuntimeContext,
        _graph: &Graph,
    ) -> Result<NodeOutcome, AttractorError> {
        let status = context
            .get("outcome")
            .and_then(Value::as_str)
            .and_then(NodeStatus::from_str_loose)
            .unwrap_or(NodeStatus::Success);
        let preferred_label = context
            .get("preferred_label")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned);
        let failure_reason = context
            .get("failure_reason")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned);
        let failure_class = context
            .get("failure_class")
            .and_then(Value::as_str)
            .and_then(FailureClass::from_str_loose);

        let mut context_updates = RuntimeContext::new();
        if let Some(class) = failure_class {
            context_updates.insert(
                "failure_class".to_string(),
                Value::String(class.as_str().to_string()),
            );
        }

        NodeOutcome {
            status,
            notes: Some("conditional pass-through".to_string()),
            failure_reason,
            failure_class,
            context_updates,
            preferred_label,
            suggested_next_ids: Vec::new(),
            meta: Default::default(),
        }
        .canonicalize()
    }
}
