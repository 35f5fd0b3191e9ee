use crate::interviewer::{HumanAnswer, HumanChoice, HumanQuestion, HumanQuestionType, Interviewer};
use crate::{
    AttractorError, FailureClass, Graph, Node, NodeOutcome, NodeStatus, RuntimeContext,
    handlers::NodeHandler,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

pub use crate::interviewer::AutoApproveInterviewer;
pub use crate::interviewer::CallbackInterviewer;
pub use crate::interviewer::ConsoleInterviewer;
pub use crate::interviewer::HumanAnswer;
pub use crate::interviewer::QueueInterviewer;
pub use crate::interviewer::RecordingInterviewer;

pub struct WaitHumanHandler {
    interviewer: Arc<dyn Interviewer>,
}

impl WaitHumanHandler {
    pub fn new(interviewer: Arc<dyn Interviewer>) -> Self {
        Self { interviewer }
    }
}

#[async_trait]
impl NodeHandler for WaitHumanHandler {
    async fn execute(
        &self,
        node: &Node,
        _context: &RuntimeContext,
        graph: &Graph,
    ) -> Result<NodeOutcome, AttractorError> {
        let choices = derive_choices(node, graph);
        if choices.is_empty() {
            return Ok(NodeOutcome::failure("No outgoing edges for human gate"));
        }

        let default_choice = node
            .attrs
            .get_str("human.default_choice")
            .and_then(|raw| find_choice(&choices, raw))
            .map(|choice| choice.key);

        let question = HumanQuestion {
            stage: node.id.clone(),
            text: node
                .attrs
                .get_str("label")
                .filter(|value| !value.trim().is_empty())
                .unwrap_or("Select an option:")
                .to_string(),
            question_type: HumanQuestionType::MultipleChoice,
            choices: choices.clone(),
            default_choice,
            timeout: None,
        };

        let answer = self.interviewer.ask(question).await;
        let selected = match answer {
            HumanAnswer::Selected(raw) => {
                find_choice(&choices, &raw).unwrap_or_else(|| choices[0].clone())
            }
            HumanAnswer::Yes => find_choice(&choices, "yes")
                .or_else(|| find_choice(&choices, "y"))
                .unwrap_or_else(|| choices[0].clone()),
            HumanAnswer::No => find_choice(&choices, "no")
                .or_else(|| find_choice(&choices, "n"))
                .unwrap_or_else(|| choices[choices.len() - 1].clone()),
            HumanAnswer::FreeText(_) => {
                return Ok(NodeOutcome::failure(
                    "human free-text answer not supported for selection gates",
                ));
            }
            HumanAnswer::Timeout => {
                let default_choice = node
                    .attrs
                    .get_str("human.default_choice")
                    .and_then(|raw| find_choice(&choices, raw));
                if let Some(choice) = default_choice {
                    choice
                } else {
                    return NodeOutcome {
                        status: NodeStatus::Retry,
                        failure_class: Some(FailureClass::TransientInfra),
                        ..NodeOutcome::failure("human gate timeout, no default")
                    }
                    .canonicalize();
                }
            }
            HumanAnswer::Skipped => return Ok(NodeOutcome::failure("human skipped interaction")),
        };

        let mut updates = RuntimeContext::new();
        updates.insert(
            "human.gate.selected".to_string(),
            Value::String(selected.key.clone()),
        );
        updates.insert(
            "human.gate.label".to_string(),
            Value::String(selected.label.clone()),
        );

        Ok(NodeOutcome {
            notes: Some(format!("human selected {}", selected.key)),
            context_updates: updates,
            preferred_label: Some(selected.label.clone()),
            suggested_next_ids: vec![selected.to_node.clone()],
            ..NodeOutcome::success()
        })
    }
}

fn derive_choices(node: &Node, graph: &Graph) -> Vec<HumanChoice> {
    graph
        .outgoing_edges(&node.id)
        .map(|edge| {
            let label = edge
                .attrs
                .get_str("label")
                .filter(|value| !value.trim().is_empty())
                .unwrap_or(&edge.to)
                .to_string();
            HumanChoice {
                key: parse_accelerator_key(&label),
                label,
                to_node: edge.to.clone(),
            }
        })
        .collect()
}

fn parse_accelerator_key(label: &str) -> String {
    let trimmed = label.trim();
    if let Some(inner) = trimmed
        .strip_prefix('[')
        .and_then(|raw| raw.split_once(']'))
    {
        let key = inner.0.trim();
        if !key.is_empty() {
            return key.to_ascii_uppercase();
        }
    }
    if let Some((left, _)) = trimmed.split_once(')') {
        let key = left.trim();
        if key.len() == 1 {
            return key.to_ascii_uppercase();
        }
    }
    if let Some((left, _)) = trimmed.split_once('-') {
        let key = left.trim();
        if key.len() == 1 {
            return key.to_ascii_uppercase();
        }
    }
    trimmed
        .chars()
        .next()
        .map(|ch| ch.to_ascii_uppercase().to_string())
        .unwrap_or_else(|| "X".to_string())
}

fn find_choice(choices: &[HumanChoice], raw: &str) -> Option<HumanChoice> {
    let needle = raw.trim().to_ascii_lowercase();
    choices
        .iter()
        .find(|choice| {
            choice.key.to_ascii_lowercase() == needle
                || choice.label.to_ascii_lowercase() == needle
                || choice.to_node.to_ascii_lowercase() == needle
        })
        .cloned()
}
