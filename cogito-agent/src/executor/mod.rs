use crate::clients::ToolCallRequest;
use crate::tools::{validate_arguments, ToolRegistry};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Categorized reason a tool call did not produce output.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum ToolFailure {
    #[error("invalid arguments: {message}")]
    Validation { message: String },
    #[error("tool '{name}' is not registered")]
    UnknownTool { name: String },
    #[error("tool call exceeded its {deadline_ms}ms deadline")]
    Timeout { deadline_ms: u64 },
    #[error("tool execution failed: {message}")]
    Execution { message: String },
}

/// Outcome of one coordinated tool call. Always produced, success or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub call_id: String,
    pub tool_name: String,
    pub success: bool,
    pub output: Option<Value>,
    pub failure: Option<ToolFailure>,
    pub elapsed: Duration,
}

impl ToolOutcome {
    fn succeeded(call: &ToolCallRequest, output: Value, elapsed: Duration) -> Self {
        Self {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            success: true,
            output: Some(output),
            failure: None,
            elapsed,
        }
    }

    fn failed(call: &ToolCallRequest, failure: ToolFailure, elapsed: Duration) -> Self {
        Self {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            success: false,
            output: None,
            failure: Some(failure),
            elapsed,
        }
    }
}

/// Runs named tools under a hard deadline and isolates their failures.
///
/// Stateless apart from the shared registry handle; one coordinator serves
/// any number of concurrent chains. No method here returns `Err`: every
/// failure mode (unknown tool, bad arguments, deadline, tool error) is
/// folded into the returned [`ToolOutcome`].
#[derive(Clone)]
pub struct ToolCoordinator {
    registry: Arc<ToolRegistry>,
}

impl ToolCoordinator {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Executes one call under `deadline`.
    pub async fn execute(&self, call: &ToolCallRequest, deadline: Duration) -> ToolOutcome {
        let started = Instant::now();

        let Some(tool) = self.registry.resolve(&call.name) else {
            warn!(tool = %call.name, call_id = %call.id, "unknown tool requested");
            return ToolOutcome::failed(
                call,
                ToolFailure::UnknownTool {
                    name: call.name.clone(),
                },
                started.elapsed(),
            );
        };

        if let Err(e) = validate_arguments(&tool.spec(), &call.arguments) {
            debug!(tool = %call.name, call_id = %call.id, error = %e, "argument validation failed");
            return ToolOutcome::failed(
                call,
                ToolFailure::Validation {
                    message: e.to_string(),
                },
                started.elapsed(),
            );
        }

        debug!(tool = %call.name, call_id = %call.id, "executing tool");

        let outcome = match tokio::time::timeout(deadline, tool.invoke(call.arguments.clone())).await
        {
            Ok(Ok(output)) => ToolOutcome::succeeded(call, output, started.elapsed()),
            Ok(Err(e)) => ToolOutcome::failed(
                call,
                ToolFailure::Execution {
                    message: e.to_string(),
                },
                started.elapsed(),
            ),
            // The in-flight invocation is abandoned, not awaited further.
            Err(_) => ToolOutcome::failed(
                call,
                ToolFailure::Timeout {
                    deadline_ms: deadline.as_millis() as u64,
                },
                started.elapsed(),
            ),
        };

        debug!(
            tool = %call.name,
            call_id = %call.id,
            success = outcome.success,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "tool call finished"
        );
        outcome
    }

    /// Fans out all calls of one turn concurrently under a shared deadline
    /// and joins them. Yields exactly one outcome per request, in request
    /// order; calls still outstanding at the deadline come back as timeout
    /// failures.
    pub async fn execute_all(
        &self,
        calls: &[ToolCallRequest],
        deadline: Duration,
    ) -> Vec<ToolOutcome> {
        let futures = calls.iter().map(|call| self.execute(call, deadline));
        join_all(futures).await
    }
}
