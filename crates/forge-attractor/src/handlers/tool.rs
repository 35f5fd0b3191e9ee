use crate::{
    AttractorError, AttrValue, FailureClass, Graph, Node, NodeOutcome, NodeStatus, RuntimeContext,
    handlers::NodeHandler,
};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::Duration;

const DEFAULT_TIMEOUT_MS: u64 = 10_000;
const OUTPUT_TRUNCATE_LIMIT: usize = 8_000;

/// `parallelogram` shell-tool node. Runs `tool_command` via `bash -c` in the
/// run's worktree, capturing stdout/stderr and truncating the merged output
/// that lands in `context_updates["tool.output"]`.
#[derive(Debug, Default)]
pub struct ToolHandler;

#[async_trait]
impl NodeHandler for ToolHandler {
    async fn execute(
        &self,
        node: &Node,
        context: &RuntimeContext,
        _graph: &Graph,
    ) -> Result<NodeOutcome, AttractorError> {
        let command = node
            .attrs
            .get_str("tool_command")
            .unwrap_or_default()
            .trim()
            .to_string();
        if command.is_empty() {
            return NodeOutcome::failure("No tool_command specified").canonicalize();
        }

        let timeout_ms = resolve_timeout_ms(node).max(1);
        let working_dir = context
            .get("worktree_path")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned);

        let invocation = json!({
            "argv": ["bash", "-c", command],
            "cwd": working_dir,
            "timeout_ms": timeout_ms,
            "env_mode": "scoped",
        });

        let started = Instant::now();
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(&command);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        if let Some(dir) = &working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|error| {
            AttractorError::Runtime(format!("failed to spawn tool_command '{command}': {error}"))
        })?;

        let stdout_task = tokio::spawn(read_pipe(child.stdout.take()));
        let stderr_task = tokio::spawn(read_pipe(child.stderr.take()));

        let mut timed_out = false;
        let status = match tokio::time::timeout(Duration::from_millis(timeout_ms), child.wait())
            .await
        {
            Ok(result) => result.map_err(|error| {
                AttractorError::Runtime(format!("failed to wait for tool_command: {error}"))
            })?,
            Err(_) => {
                timed_out = true;
                terminate_process_group(&mut child).await;
                child.wait().await.map_err(|error| {
                    AttractorError::Runtime(format!(
                        "failed to collect timed-out tool_command: {error}"
                    ))
                })?
            }
        };

        let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).to_string();
        let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).to_string();
        let duration_ms = started.elapsed().as_millis() as u64;
        let exit_code = status.code();

        let timing = json!({
            "duration_ms": duration_ms,
            "exit_code": exit_code,
            "timed_out": timed_out,
        });

        let call_id = call_id_for(duration_ms);
        let mut updates = RuntimeContext::new();
        updates.insert("tool.invocation".to_string(), invocation.clone());
        updates.insert("tool.timing".to_string(), timing.clone());
        updates.insert("tool.call_id".to_string(), Value::String(call_id));

        if timed_out {
            return NodeOutcome {
                status: NodeStatus::Fail,
                failure_class: Some(FailureClass::TransientInfra),
                context_updates: updates,
                ..NodeOutcome::failure(format!("tool_command timed out after {timeout_ms}ms"))
            }
            .canonicalize();
        }

        let combined = truncate_output(&format!("{stdout}{stderr}"), OUTPUT_TRUNCATE_LIMIT);
        updates.insert("tool.output".to_string(), Value::String(combined));

        let succeeded = status.success();
        let outcome = NodeOutcome {
            notes: Some(format!(
                "tool_command exited {} in {duration_ms}ms",
                exit_code.unwrap_or(-1)
            )),
            context_updates: updates,
            ..if succeeded {
                NodeOutcome::success()
            } else {
                NodeOutcome::failure(format!(
                    "tool_command exited with status {}",
                    exit_code.unwrap_or(-1)
                ))
            }
        };
        outcome.canonicalize()
    }
}

fn resolve_timeout_ms(node: &Node) -> u64 {
    match node.attrs.get("timeout") {
        Some(AttrValue::Duration(value)) => value.millis,
        Some(AttrValue::Integer(value)) if *value >= 0 => *value as u64,
        Some(AttrValue::String(value)) => parse_duration_text(value).unwrap_or(DEFAULT_TIMEOUT_MS),
        _ => DEFAULT_TIMEOUT_MS,
    }
}

fn parse_duration_text(value: &str) -> Option<u64> {
    let text = value.trim();
    if text.is_empty() {
        return None;
    }
    let split_at = text
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split_at);
    let amount = digits.parse::<u64>().ok()?;
    let multiplier = match unit {
        "" | "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        _ => return None,
    };
    Some(amount.saturating_mul(multiplier))
}

async fn read_pipe<R>(pipe: Option<R>) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    match pipe {
        Some(mut reader) => {
            let mut bytes = Vec::new();
            let _ = reader.read_to_end(&mut bytes).await;
            bytes
        }
        None => Vec::new(),
    }
}

#[cfg(unix)]
async fn terminate_process_group(child: &mut Child) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
    tokio::time::sleep(Duration::from_millis(250)).await;
    if child.try_wait().ok().flatten().is_none() {
        if let Some(pid) = child.id() {
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
async fn terminate_process_group(child: &mut Child) {
    let _ = child.kill().await;
}

fn truncate_output(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…[truncated]", &text[..cut])
}

fn call_id_for(seed: u64) -> String {
    format!("{:016x}{:08x}", seed, std::process::id())
}
