use futures::future::join_all;
use serde_json::{Value, json};
use tracing::{debug, error, warn};

use crate::llm::events::{ChatEvent, EventSender, emit};
use crate::llm::types::ToolCall;
use crate::tools::ToolRegistry;

/// Outcome of one tool call, paired back to the call by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    pub result: String,
}

pub(crate) fn parse_arguments(name: &str, raw: &str) -> Value {
    if raw.trim().is_empty() {
        debug!(tool = name, "tool call without arguments");
        return json!({});
    }
    match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(tool = name, error = %e, arguments = raw, "malformed tool arguments; using empty object");
            json!({})
        }
    }
}

/// Runs one call. Never fails: every problem becomes the result string.
pub async fn dispatch_tool_call(
    registry: &ToolRegistry,
    call: &ToolCall,
    events: Option<&EventSender>,
) -> ToolResult {
    let name = call.function.name.as_str();
    let args = parse_arguments(name, &call.function.arguments);

    let result = match registry.get(name) {
        None => {
            warn!(tool = name, id = %call.id, "function not found");
            format!("Function {name} not found")
        }
        Some(tool) => {
            emit(events, ChatEvent::ToolInvoked { name: name.to_string() });
            debug!(tool = name, id = %call.id, %args, "invoking tool");
            // Spawned so a panicking tool only fails its own call.
            let joined = tokio::spawn(async move { tool.invoke(args).await }).await;
            let result = match joined {
                Ok(Ok(out)) => {
                    debug!(tool = name, bytes = out.len(), "tool succeeded");
                    out
                }
                Ok(Err(e)) => {
                    error!(tool = name, error = %format!("{e:#}"), "tool execution failed");
                    format!("Error executing function {name}: {e:#}")
                }
                Err(join_err) => {
                    error!(tool = name, error = %join_err, "tool task aborted");
                    format!("Error executing function {name}: {join_err}")
                }
            };
            emit(
                events,
                ChatEvent::ToolCompleted {
                    name: name.to_string(),
                    result: result.clone(),
                },
            );
            result
        }
    };

    ToolResult {
        id: call.id.clone(),
        name: name.to_string(),
        result,
    }
}

/// Runs all calls of a round concurrently and waits for every one to settle.
/// Yields exactly one result per call.
pub async fn dispatch_round(
    registry: &ToolRegistry,
    calls: &[ToolCall],
    events: Option<&EventSender>,
) -> Vec<ToolResult> {
    join_all(
        calls
            .iter()
            .map(|call| dispatch_tool_call(registry, call, events)),
    )
    .await
}
