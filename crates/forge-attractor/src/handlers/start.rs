use crate::{AttractorError, Graph, Node, NodeOutcome, RuntimeContext, handlers::NodeHandler};
use async_trait::async_trait;
use serde_json::Value;

/// `Mdiamond` entry node. Stamps `previous_node`/`base_sha` bookkeeping into
/// the context and always succeeds; the run loop is responsible for picking
/// this node as the traversal's first stage.
#[derive(Debug, Default)]
pub struct StartHandler;

#[async_trait]
impl NodeHandler for StartHandler {
    async fn execute(
        &self,
        node: &Node,
        context: &RuntimeContext,
        _graph: &Graph,
    ) -> Result<NodeOutcome, AttractorError> {
        let mut updates = RuntimeContext::new();
        updates.insert("previous_node".to_string(), Value::Null);
        updates.insert("current_node".to_string(), Value::String(node.id.clone()));
        if let Some(base_sha) = node.attrs.get_str("base_sha").or_else(|| {
            context
                .get("base_sha")
                .and_then(Value::as_str)
        }) {
            updates.insert("base_sha".to_string(), Value::String(base_sha.to_string()));
        }

        Ok(NodeOutcome {
            notes: Some("pipeline started".to_string()),
            context_updates: updates,
            ..NodeOutcome::success()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_dot;

    #[tokio::test(flavor = "current_thread")]
    async fn start_handler_execute_expected_success_and_previous_node_null() {
        let graph = parse_dot("digraph G { s [shape=Mdiamond] }").expect("graph should parse");
        let node = graph.nodes.get("s").expect("node should exist");
        let outcome = StartHandler
            .execute(node, &RuntimeContext::new(), &graph)
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, crate::NodeStatus::Success);
        assert_eq!(
            outcome.context_updates.get("previous_node"),
            Some(&Value::Null)
        );
    }
}
