use crate::{AttractorError, Graph, Node, NodeOutcome, RuntimeContext, handlers::NodeHandler};
use async_trait::async_trait;
use serde_json::Value;

/// `Msquare` terminal node. The run loop treats reaching a node mapped to
/// this handler's shape as the end of traversal before this handler even
/// runs (see `runner::is_terminal_node`); this implementation exists for
/// graphs that route an exit node through the registry directly (e.g. as a
/// `parallel` branch target) rather than through the top-level loop.
#[derive(Debug, Default)]
pub struct ExitHandler;

#[async_trait]
impl NodeHandler for ExitHandler {
    async fn execute(
        &self,
        node: &Node,
        _context: &RuntimeContext,
        _graph: &Graph,
    ) -> Result<NodeOutcome, AttractorError> {
        let mut updates = RuntimeContext::new();
        updates.insert("current_node".to_string(), Value::String(node.id.clone()));

        Ok(NodeOutcome {
            notes: Some("pipeline exit reached".to_string()),
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
    async fn exit_handler_execute_expected_success() {
        let graph = parse_dot("digraph G { e [shape=Msquare] }").expect("graph should parse");
        let node = graph.nodes.get("e").expect("node should exist");
        let outcome = ExitHandler
            .execute(node, &RuntimeContext::new(), &graph)
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, crate::NodeStatus::Success);
    }
}
