use crate::chain::{ReasoningChain, ReasoningConfig, StepKind, StepType, StopReason};
use serde_json::Value;
use std::time::Duration;

/// Pure stop-condition evaluation over a chain snapshot.
///
/// Conditions are checked in a fixed priority order so that a found answer
/// always wins over resource exhaustion, and resource exhaustion wins over an
/// error abort. Returns `None` when the loop should continue.
pub fn evaluate(
    chain: &ReasoningChain,
    config: &ReasoningConfig,
    elapsed: Duration,
) -> Option<StopReason> {
    if chain.has_answer() {
        return Some(StopReason::Completed);
    }

    if elapsed >= config.timeout {
        return Some(StopReason::Timeout);
    }

    if chain.count(StepType::Thought) >= config.max_iterations {
        return Some(StopReason::MaxIterations);
    }

    if chain.count(StepType::ToolCall) >= config.max_tool_calls {
        return Some(StopReason::MaxToolCalls);
    }

    if let Some(step) = chain.last_step() {
        let fatal = matches!(step.kind, StepKind::Error { .. })
            && !is_recoverable(step.metadata.get("recoverable"));
        if fatal {
            return Some(StopReason::Error);
        }
    }

    None
}

// Error steps default to recoverable; the engine marks fatal ones explicitly.
fn is_recoverable(flag: Option<&Value>) -> bool {
    flag.and_then(Value::as_bool).unwrap_or(true)
}
