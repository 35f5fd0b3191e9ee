use crate::failure::classify_provider_error;
use crate::provider_runtime::{CodergenRequest, CodergenTransport, RouterError};
use crate::{
    AttractorError, FailureClass, Graph, Node, NodeOutcome, NodeStatus, RuntimeContext,
    handlers::NodeHandler,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

pub enum CodergenBackendResult {
    Text(String),
    Outcome(NodeOutcome),
}

#[async_trait]
pub trait CodergenBackend: Send + Sync {
    async fn run(
        &self,
        node: &Node,
        prompt: &str,
        context: &RuntimeContext,
    ) -> Result<CodergenBackendResult, AttractorError>;
}

#[derive(Debug, Default)]
pub struct NoopCodergenBackend;

#[async_trait]
impl CodergenBackend for NoopCodergenBackend {
    async fn run(
        &self,
        _node: &Node,
        _prompt: &str,
        _context: &RuntimeContext,
    ) -> Result<CodergenBackendResult, AttractorError> {
        Ok(CodergenBackendResult::Text(String::new()))
    }
}

pub struct CodergenHandler {
    backend: Option<Arc<dyn CodergenBackend>>,
}

impl CodergenHandler {
    pub fn new(backend: Option<Arc<dyn CodergenBackend>>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl NodeHandler for CodergenHandler {
    async fn execute(
        &self,
        node: &Node,
        context: &RuntimeContext,
        graph: &Graph,
    ) -> Result<NodeOutcome, AttractorError> {
        let mut prompt = node.attrs.get_str("prompt").unwrap_or_default().to_string();
        if prompt.trim().is_empty() {
            prompt = node
                .attrs
                .get_str("label")
                .unwrap_or(node.id.as_str())
                .to_string();
        }
        if let Some(goal) = graph.attrs.get_str("goal") {
            prompt = prompt.replace("$goal", goal);
        }
        if let Some(base_sha) = context.get("base_sha").and_then(Value::as_str) {
            prompt = prompt.replace("$base_sha", base_sha);
        }

        if let Some(backend) = self.backend.as_ref() {
            match backend.run(node, &prompt, context).await {
                Ok(CodergenBackendResult::Outcome(outcome)) => return Ok(outcome),
                Ok(CodergenBackendResult::Text(response)) => {
                    return Ok(simulated_success(node, response));
                }
                Err(error) => return Ok(NodeOutcome::failure(error.to_string())),
            }
        }

        Ok(simulated_success(
            node,
            format!("[Simulated] Response for stage: {}", node.id),
        ))
    }
}

/// Dispatches through a [`CodergenTransport`] (CLI subprocess or HTTP
/// adapter), resolving the model via the escalation/force-model/node
/// precedence and classifying transport errors via
/// [`classify_provider_error`] rather than reporting every failure as
/// `transient_infra`.
pub struct TransportCodergenBackend {
    transport: Arc<dyn CodergenTransport>,
    provider: String,
    worktree: String,
    force_models: BTreeMap<String, String>,
}

impl TransportCodergenBackend {
    pub fn new(
        transport: Arc<dyn CodergenTransport>,
        provider: impl Into<String>,
        worktree: impl Into<String>,
        force_models: BTreeMap<String, String>,
    ) -> Self {
        Self {
            transport,
            provider: provider.into(),
            worktree: worktree.into(),
            force_models,
        }
    }
}

#[async_trait]
impl CodergenBackend for TransportCodergenBackend {
    async fn run(
        &self,
        node: &Node,
        prompt: &str,
        context: &RuntimeContext,
    ) -> Result<CodergenBackendResult, AttractorError> {
        let escalation_model = context.get("escalation_model").and_then(Value::as_str);
        let node_llm_model = node.attrs.get_str("llm_model").unwrap_or_default();
        let model = crate::provider_runtime::resolve_model(
            escalation_model,
            &self.force_models,
            &self.provider,
            node_llm_model,
        );
        let request = CodergenRequest {
            provider: self.provider.clone(),
            model,
            worktree: self.worktree.clone(),
            prompt: prompt.to_string(),
        };
        match self.transport.dispatch(&request).await {
            Ok(response) => Ok(CodergenBackendResult::Text(response.text)),
            Err(error) => {
                let (class, message) = classify_router_error(&error);
                Ok(CodergenBackendResult::Outcome(NodeOutcome::failure_with_class(
                    message, class,
                )))
            }
        }
    }
}

/// Maps a [`RouterError`] to its [`FailureClass`], deferring to
/// [`classify_provider_error`] wherever a provider+message pair is
/// available. `NoProvider`/`UnknownProvider` are configuration mistakes and
/// never resolve themselves on retry; `FailoverExhausted` only occurs after
/// every provider in the chain returned a retryable signal, so it is itself
/// transient.
fn classify_router_error(error: &RouterError) -> (FailureClass, String) {
    match error {
        RouterError::Transport { provider, message } => classify_provider_error(provider, message),
        RouterError::NoProvider => (FailureClass::Deterministic, error.to_string()),
        RouterError::UnknownProvider(_) => (FailureClass::Deterministic, error.to_string()),
        RouterError::FailoverExhausted(_) => (FailureClass::TransientInfra, error.to_string()),
    }
}

fn simulated_success(node: &Node, response_text: String) -> NodeOutcome {
    let mut updates = RuntimeContext::new();
    updates.insert("last_stage".to_string(), Value::String(node.id.clone()));
    updates.insert(
        "last_response".to_string(),
        Value::String(truncate(&response_text, 200)),
    );
    NodeOutcome {
        notes: Some(format!("Stage completed: {}", node.id)),
        context_updates: updates,
        ..NodeOutcome::success()
    }
}

fn truncate(input: &str, max_len: usize) -> String {
    input.chars().take(max_len).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_dot;
    use crate::provider_runtime::{CodergenResponse, RouterError};

    struct RecordingBackend;

    #[async_trait]
    impl CodergenBackend for RecordingBackend {
        async fn run(
            &self,
            _node: &Node,
            prompt: &str,
            _context: &RuntimeContext,
        ) -> Result<CodergenBackendResult, AttractorError> {
            Ok(CodergenBackendResult::Text(format!("reply::{prompt}")))
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn codergen_handler_expands_goal_and_returns_success() {
        let graph = parse_dot(
            r#"
            digraph G {
                graph [goal="ship"]
                n1 [shape=box, prompt="achieve $goal"]
            }
            "#,
        )
        .expect("graph should parse");
        let node = graph.nodes.get("n1").expect("node should exist");
        let handler = CodergenHandler::new(Some(Arc::new(RecordingBackend)));
        let outcome = handler
            .execute(node, &RuntimeContext::new(), &graph)
            .await
            .expect("execution should succeed");

        assert_eq!(outcome.status, NodeStatus::Success);
        assert_eq!(
            outcome.context_updates.get("last_stage"),
            Some(&Value::String("n1".to_string()))
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn codergen_handler_backend_outcome_expected_passthrough() {
        struct OutcomeBackend;
        #[async_trait]
        impl CodergenBackend for OutcomeBackend {
            async fn run(
                &self,
                _node: &Node,
                _prompt: &str,
                _context: &RuntimeContext,
            ) -> Result<CodergenBackendResult, AttractorError> {
                Ok(CodergenBackendResult::Outcome(NodeOutcome::failure(
                    "backend fail",
                )))
            }
        }

        let graph =
            parse_dot("digraph G { n1 [shape=box, label=\"x\"] }").expect("graph should parse");
        let node = graph.nodes.get("n1").expect("node should exist");
        let handler = CodergenHandler::new(Some(Arc::new(OutcomeBackend)));
        let outcome = handler
            .execute(node, &RuntimeContext::new(), &graph)
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, NodeStatus::Fail);
    }

    struct EchoTransport;

    #[async_trait]
    impl CodergenTransport for EchoTransport {
        async fn dispatch(
            &self,
            request: &crate::provider_runtime::CodergenRequest,
        ) -> Result<CodergenResponse, RouterError> {
            Ok(CodergenResponse {
                text: format!("{}::{}", request.provider, request.model),
                events: Vec::new(),
            })
        }
    }

    struct FailingTransport;

    #[async_trait]
    impl CodergenTransport for FailingTransport {
        async fn dispatch(
            &self,
            _request: &crate::provider_runtime::CodergenRequest,
        ) -> Result<CodergenResponse, RouterError> {
            Err(RouterError::Transport {
                provider: "anthropic".to_string(),
                message: "connection reset".to_string(),
            })
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn transport_backend_resolves_model_and_dispatches() {
        let graph = parse_dot(
            "digraph G { n1 [shape=box, llm_model=\"claude-haiku\", prompt=\"go\"] }",
        )
        .expect("graph should parse");
        let node = graph.nodes.get("n1").expect("node should exist");
        let backend = TransportCodergenBackend::new(
            Arc::new(EchoTransport),
            "anthropic",
            "/work/tree",
            BTreeMap::new(),
        );
        let handler = CodergenHandler::new(Some(Arc::new(backend)));
        let outcome = handler
            .execute(node, &RuntimeContext::new(), &graph)
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, NodeStatus::Success);
        assert_eq!(
            outcome.context_updates.get("last_response"),
            Some(&Value::String("anthropic::claude-haiku".to_string()))
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn transport_backend_connection_reset_classified_transient_infra() {
        let graph = parse_dot("digraph G { n1 [shape=box, llm_model=\"m\"] }")
            .expect("graph should parse");
        let node = graph.nodes.get("n1").expect("node should exist");
        let backend = TransportCodergenBackend::new(
            Arc::new(FailingTransport),
            "anthropic",
            "/work/tree",
            BTreeMap::new(),
        );
        let handler = CodergenHandler::new(Some(Arc::new(backend)));
        let outcome = handler
            .execute(node, &RuntimeContext::new(), &graph)
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, NodeStatus::Fail);
        assert_eq!(outcome.failure_class, Some(FailureClass::TransientInfra));
    }

    struct ExecNotFoundTransport;

    #[async_trait]
    impl CodergenTransport for ExecNotFoundTransport {
        async fn dispatch(
            &self,
            _request: &crate::provider_runtime::CodergenRequest,
        ) -> Result<CodergenResponse, RouterError> {
            Err(RouterError::Transport {
                provider: "anthropic".to_string(),
                message: "exec: \"claude\": executable file not found in $PATH".to_string(),
            })
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn transport_backend_exec_not_found_classified_deterministic() {
        let graph = parse_dot("digraph G { n1 [shape=box, llm_model=\"m\"] }")
            .expect("graph should parse");
        let node = graph.nodes.get("n1").expect("node should exist");
        let backend = TransportCodergenBackend::new(
            Arc::new(ExecNotFoundTransport),
            "anthropic",
            "/work/tree",
            BTreeMap::new(),
        );
        let handler = CodergenHandler::new(Some(Arc::new(backend)));
        let outcome = handler
            .execute(node, &RuntimeContext::new(), &graph)
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, NodeStatus::Fail);
        assert_eq!(outcome.failure_class, Some(FailureClass::Deterministic));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn transport_backend_unknown_provider_classified_deterministic() {
        let graph = parse_dot("digraph G { n1 [shape=box, llm_model=\"m\"] }")
            .expect("graph should parse");
        let node = graph.nodes.get("n1").expect("node should exist");
        struct UnknownProviderTransport;
        #[async_trait]
        impl CodergenTransport for UnknownProviderTransport {
            async fn dispatch(
                &self,
                _request: &crate::provider_runtime::CodergenRequest,
            ) -> Result<CodergenResponse, RouterError> {
                Err(RouterError::UnknownProvider("mistral".to_string()))
            }
        }
        let backend = TransportCodergenBackend::new(
            Arc::new(UnknownProviderTransport),
            "anthropic",
            "/work/tree",
            BTreeMap::new(),
        );
        let handler = CodergenHandler::new(Some(Arc::new(backend)));
        let outcome = handler
            .execute(node, &RuntimeContext::new(), &graph)
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, NodeStatus::Fail);
        assert_eq!(outcome.failure_class, Some(FailureClass::Deterministic));
    }
}
