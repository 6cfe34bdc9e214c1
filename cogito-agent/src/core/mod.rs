use crate::chain::{
    ChainError, ReasoningChain, ReasoningConfig, ReasoningResult, ReasoningStep, StepKind,
    StopReason,
};
use crate::clients::{LlmClient, Message, SamplingOptions, ToolCallRequest, ToolDefinition};
use crate::executor::ToolCoordinator;
use crate::memory::{ContextLimits, ConversationContext};
use crate::prompts::{build_system_prompt, extract_final_answer, format_tool_outcome};
use crate::stop;
use crate::tools::ToolRegistry;
use serde_json::json;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type StepCallback = Arc<dyn Fn(&ReasoningStep) + Send + Sync>;

/// ReAct orchestrator: drives think/act/observe turns against the reasoning
/// backend until an answer is found or a stop condition fires.
///
/// One engine serves many tasks; each `solve` call owns its own chain and
/// context window. The backend call is the critical path and is never
/// parallelized within a chain; tool calls emitted by one turn are the only
/// intra-chain concurrency.
pub struct ReasoningEngine {
    client: Arc<dyn LlmClient>,
    coordinator: ToolCoordinator,
    config: ReasoningConfig,
    step_callback: Option<StepCallback>,
}

impl ReasoningEngine {
    pub fn new(
        client: Box<dyn LlmClient>,
        registry: Arc<ToolRegistry>,
        config: ReasoningConfig,
    ) -> Self {
        Self {
            client: Arc::from(client),
            coordinator: ToolCoordinator::new(registry),
            config,
            step_callback: None,
        }
    }

    /// Registers a synchronous observer invoked after every step append.
    /// A slow callback delays the loop; a panicking one is isolated.
    pub fn set_step_callback(&mut self, callback: StepCallback) {
        self.step_callback = Some(callback);
    }

    pub fn config(&self) -> &ReasoningConfig {
        &self.config
    }

    pub async fn solve(&self, task: &str) -> ReasoningResult {
        self.solve_with_cancellation(task, CancellationToken::new())
            .await
    }

    /// As [`solve`](Self::solve), but honoring an external cancellation
    /// signal at every step boundary and racing it against in-flight
    /// backend calls.
    pub async fn solve_with_cancellation(
        &self,
        task: &str,
        cancel: CancellationToken,
    ) -> ReasoningResult {
        let started = Instant::now();
        let mut chain = ReasoningChain::new(task);
        let mut context = ConversationContext::new(ContextLimits {
            max_messages: self.config.context_max_messages,
            max_tokens: self.config.context_max_tokens,
        });

        let tool_definitions = self.coordinator.registry().definitions_for_model();
        context.append(Message::system(build_system_prompt(&tool_definitions)));
        context.append(Message::user(task));

        let sampling = SamplingOptions {
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        info!(chain_id = %chain.id, task_len = task.len(), "starting reasoning chain");

        let mut retries_left = self.config.backend_retries;
        let mut final_answer: Option<String> = None;
        let mut error_msg: Option<String> = None;

        let stop_reason = loop {
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if let Some(reason) = stop::evaluate(&chain, &self.config, started.elapsed()) {
                break reason;
            }

            if self.config.verbose {
                info!(
                    chain_id = %chain.id,
                    iteration = chain.count(crate::chain::StepType::Thought) + 1,
                    "reasoning iteration"
                );
            }

            let remaining = self.config.timeout.saturating_sub(started.elapsed());
            let messages = context.messages();
            debug!(
                chain_id = %chain.id,
                messages = messages.len(),
                estimated_tokens = context.estimated_tokens(),
                "requesting backend completion"
            );

            let response = tokio::select! {
                _ = cancel.cancelled() => break StopReason::Cancelled,
                outcome = tokio::time::timeout(
                    remaining,
                    self.client.complete(&messages, &tool_definitions, &sampling),
                ) => outcome,
            };

            let response = match response {
                Err(_) => {
                    warn!(chain_id = %chain.id, "backend call outlived the chain budget");
                    break StopReason::Timeout;
                }
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    let fatal = retries_left == 0;
                    error!(chain_id = %chain.id, error = %e, fatal, "backend invocation failed");
                    let step = ReasoningStep::new(StepKind::Error {
                        text: format!("backend invocation failed: {e}"),
                    })
                    .with_metadata("recoverable", json!(!fatal));
                    if let Err(e) = self.record(&mut chain, step) {
                        error_msg = Some(e.to_string());
                        break StopReason::Error;
                    }
                    if fatal {
                        error_msg = Some(e.to_string());
                        break StopReason::Error;
                    }
                    retries_left -= 1;
                    continue;
                }
            };

            // Exactly one thought per backend turn, so the iteration count
            // is well-defined even for turns that only request tools.
            let content = response.content.clone().unwrap_or_default();
            let thought = ReasoningStep::new(StepKind::Thought {
                text: content.clone(),
            });
            if let Err(e) = self.record(&mut chain, thought) {
                error_msg = Some(e.to_string());
                break StopReason::Error;
            }

            let answer = response
                .content
                .as_deref()
                .and_then(|c| extract_final_answer(c, &self.config.stop_phrases));

            if let Some(answer) = answer {
                let step = ReasoningStep::new(StepKind::Answer {
                    text: answer.clone(),
                });
                if let Err(e) = self.record(&mut chain, step) {
                    error_msg = Some(e.to_string());
                    break StopReason::Error;
                }
                final_answer = Some(answer);
                if response.tool_calls.is_empty() {
                    break StopReason::Completed;
                }
            }

            context.append(Message::assistant(content, response.tool_calls.clone()));

            if !response.tool_calls.is_empty() {
                if let Err(e) = self
                    .run_tool_turn(&mut chain, &mut context, &response.tool_calls, started)
                    .await
                {
                    error_msg = Some(e.to_string());
                    break StopReason::Error;
                }
                if cancel.is_cancelled() {
                    break StopReason::Cancelled;
                }
            }
        };

        let status = stop_reason.chain_status();
        if !chain.is_terminal() {
            if let Err(e) = chain.finalize(status, final_answer.clone()) {
                // Unreachable by construction; surfaced rather than swallowed.
                error!(chain_id = %chain.id, error = %e, "finalize rejected");
            }
        }

        if error_msg.is_none() {
            error_msg = describe_stop(stop_reason, &self.config);
        }

        info!(
            chain_id = %chain.id,
            stop_reason = ?stop_reason,
            steps = chain.steps().len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "reasoning chain finished"
        );

        ReasoningResult::from_chain(chain, stop_reason, error_msg)
    }

    /// Dispatches all calls of one turn concurrently, records a result step
    /// for every call, and feeds the outputs back into the context window.
    async fn run_tool_turn(
        &self,
        chain: &mut ReasoningChain,
        context: &mut ConversationContext,
        calls: &[ToolCallRequest],
        started: Instant,
    ) -> Result<(), ChainError> {
        for call in calls {
            let step = ReasoningStep::new(StepKind::ToolCall {
                tool_name: call.name.clone(),
                arguments: call.arguments.clone(),
                call_id: call.id.clone(),
            });
            self.record(chain, step)?;
        }

        let remaining = self.config.timeout.saturating_sub(started.elapsed());
        let deadline = remaining.min(self.config.tool_timeout);
        debug!(
            chain_id = %chain.id,
            calls = calls.len(),
            deadline_ms = deadline.as_millis() as u64,
            "dispatching tool calls"
        );

        let outcomes = self.coordinator.execute_all(calls, deadline).await;

        let mut failed = 0usize;
        for outcome in &outcomes {
            let step = ReasoningStep::new(StepKind::ToolResult {
                call_id: outcome.call_id.clone(),
                tool_name: outcome.tool_name.clone(),
                success: outcome.success,
                output: outcome.output.clone(),
                error: outcome.failure.as_ref().map(|f| f.to_string()),
                elapsed_ms: outcome.elapsed.as_millis() as u64,
            });
            self.record(chain, step)?;

            context.append(Message::tool(
                outcome.call_id.clone(),
                outcome.tool_name.clone(),
                format_tool_outcome(outcome),
            ));

            if !outcome.success {
                failed += 1;
            }
        }

        if failed > 0 && self.config.enable_reflection {
            let step = ReasoningStep::new(StepKind::Observation {
                text: format!(
                    "{failed} of {} tool calls failed; the errors were returned as observations",
                    outcomes.len()
                ),
            });
            self.record(chain, step)?;
        }

        Ok(())
    }

    fn record(&self, chain: &mut ReasoningChain, step: ReasoningStep) -> Result<(), ChainError> {
        chain.append(step)?;
        if let (Some(callback), Some(step)) = (&self.step_callback, chain.last_step()) {
            if catch_unwind(AssertUnwindSafe(|| callback(step))).is_err() {
                warn!(chain_id = %chain.id, "step callback panicked; continuing");
            }
        }
        Ok(())
    }
}

fn describe_stop(stop_reason: StopReason, config: &ReasoningConfig) -> Option<String> {
    match stop_reason {
        StopReason::Completed => None,
        StopReason::MaxIterations => Some(format!(
            "reached the maximum of {} reasoning iterations without an answer",
            config.max_iterations
        )),
        StopReason::MaxToolCalls => Some(format!(
            "reached the maximum of {} tool calls without an answer",
            config.max_tool_calls
        )),
        StopReason::Timeout => Some(format!(
            "exceeded the {}s chain budget",
            config.timeout.as_secs()
        )),
        StopReason::Cancelled => Some("cancelled by external signal".to_string()),
        StopReason::Error => Some("reasoning aborted by an unrecoverable error".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainStatus, StepType};
    use crate::clients::{LlmError, LlmResponse, ModelInfo};
    use crate::tools::{CalculatorTool, Tool, ToolFuture, ToolSpec};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted backend: yields responses in order, repeating the last one
    /// once the script is exhausted.
    struct ScriptedClient {
        script: Vec<Result<LlmResponse, String>>,
        next: Mutex<usize>,
        delay: Duration,
    }

    impl ScriptedClient {
        fn new(script: Vec<Result<LlmResponse, String>>) -> Self {
            Self {
                script,
                next: Mutex::new(0),
                delay: Duration::ZERO,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn complete(
            &self,
            _messages: &[Message],
            _tools: &[ToolDefinition],
            _sampling: &SamplingOptions,
        ) -> Result<LlmResponse, LlmError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let turn = {
                let mut next = self.next.lock().unwrap();
                let turn = *next;
                *next += 1;
                turn
            };
            let index = turn.min(self.script.len() - 1);
            let mut response = self.script[index]
                .clone()
                .map_err(LlmError::RequestFailed)?;
            // Replayed turns get fresh call ids, as a real backend would.
            if turn >= self.script.len() {
                for call in &mut response.tool_calls {
                    call.id = format!("{}-{turn}", call.id);
                }
            }
            Ok(response)
        }

        fn model_info(&self) -> ModelInfo {
            ModelInfo {
                name: "scripted".to_string(),
                max_tokens: None,
            }
        }
    }

    struct SleepTool;

    impl Tool for SleepTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "slow".to_string(),
                description: "sleeps".to_string(),
                parameters: serde_json::json!({"type": "object", "properties": {}}),
            }
        }

        fn invoke(&self, _arguments: Value) -> ToolFuture {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(serde_json::json!("slept"))
            })
        }
    }

    fn tool_call(id: &str, name: &str, arguments: Value) -> ToolCallRequest {
        ToolCallRequest {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }
    }

    fn thinks(content: &str, tool_calls: Vec<ToolCallRequest>) -> Result<LlmResponse, String> {
        Ok(LlmResponse {
            content: Some(content.to_string()),
            tool_calls,
        })
    }

    fn registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(CalculatorTool));
        registry.register(Box::new(SleepTool));
        Arc::new(registry)
    }

    fn engine(
        script: Vec<Result<LlmResponse, String>>,
        config: ReasoningConfig,
    ) -> ReasoningEngine {
        ReasoningEngine::new(Box::new(ScriptedClient::new(script)), registry(), config)
    }

    fn fast_config() -> ReasoningConfig {
        ReasoningConfig {
            timeout: Duration::from_secs(10),
            tool_timeout: Duration::from_secs(1),
            ..ReasoningConfig::default()
        }
    }

    #[tokio::test]
    async fn single_tool_call_then_answer() {
        let engine = engine(
            vec![
                thinks(
                    "I need to multiply.",
                    vec![tool_call("c1", "calculator", serde_json::json!({"expression": "12*12"}))],
                ),
                thinks("Final Answer: 144", vec![]),
            ],
            fast_config(),
        );

        let result = engine.solve("compute 12*12").await;

        assert!(result.success);
        assert_eq!(result.stop_reason, StopReason::Completed);
        assert!(result.final_answer.unwrap().contains("144"));
        assert_eq!(result.stats.tool_calls, 1);
        assert_eq!(result.chain.status(), ChainStatus::Completed);
        assert_eq!(result.chain.count(StepType::ToolResult), 1);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn endless_tool_requests_hit_max_iterations() {
        let config = ReasoningConfig {
            max_iterations: 3,
            ..fast_config()
        };
        let engine = engine(
            vec![thinks(
                "one more lookup",
                vec![tool_call("c", "calculator", serde_json::json!({"expression": "1+1"}))],
            )],
            config,
        );

        let result = engine.solve("never answers").await;

        assert!(!result.success);
        assert_eq!(result.stop_reason, StopReason::MaxIterations);
        assert_eq!(result.stats.iterations, 3);
        assert_eq!(result.chain.status(), ChainStatus::Failed);
        assert!(result.error.unwrap().contains("3"));
    }

    #[tokio::test]
    async fn tool_deadline_does_not_abort_the_chain() {
        let config = ReasoningConfig {
            tool_timeout: Duration::from_millis(20),
            ..fast_config()
        };
        let engine = engine(
            vec![
                thinks("let me wait", vec![tool_call("c1", "slow", serde_json::json!({}))]),
                thinks("Final Answer: done without the tool", vec![]),
            ],
            config,
        );

        let result = engine.solve("patience test").await;

        assert!(result.success);
        let timed_out = result
            .chain
            .steps()
            .iter()
            .find_map(|s| match &s.kind {
                StepKind::ToolResult { success, error, .. } => Some((*success, error.clone())),
                _ => None,
            })
            .unwrap();
        assert!(!timed_out.0);
        assert!(timed_out.1.unwrap().contains("deadline"));
    }

    #[tokio::test]
    async fn backend_failure_without_retry_budget_fails_the_chain() {
        let engine = engine(vec![Err("connection refused".to_string())], fast_config());

        let result = engine.solve("doomed").await;

        assert!(!result.success);
        assert_eq!(result.stop_reason, StopReason::Error);
        assert_eq!(result.chain.status(), ChainStatus::Failed);
        assert_eq!(result.chain.count(StepType::Error), 1);
        assert!(result.error.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn retry_budget_allows_recovery() {
        let config = ReasoningConfig {
            backend_retries: 1,
            ..fast_config()
        };
        let engine = engine(
            vec![
                Err("transient".to_string()),
                thinks("Final Answer: recovered", vec![]),
            ],
            config,
        );

        let result = engine.solve("flaky backend").await;

        assert!(result.success);
        assert_eq!(result.final_answer.as_deref(), Some("recovered"));
        // The transient failure is still on the record.
        assert_eq!(result.chain.count(StepType::Error), 1);
    }

    #[tokio::test]
    async fn chain_budget_bounds_the_backend_call() {
        let config = ReasoningConfig {
            timeout: Duration::from_millis(50),
            ..ReasoningConfig::default()
        };
        let client = ScriptedClient::new(vec![thinks("Final Answer: late", vec![])])
            .with_delay(Duration::from_millis(300));
        let engine = ReasoningEngine::new(Box::new(client), registry(), config);

        let result = engine.solve("slow model").await;

        assert!(!result.success);
        assert_eq!(result.stop_reason, StopReason::Timeout);
    }

    #[tokio::test]
    async fn max_tool_calls_is_enforced() {
        let config = ReasoningConfig {
            max_iterations: 100,
            max_tool_calls: 2,
            ..fast_config()
        };
        let engine = engine(
            vec![thinks(
                "again",
                vec![tool_call("c", "calculator", serde_json::json!({"expression": "2*2"}))],
            )],
            config,
        );

        let result = engine.solve("tool happy").await;

        assert_eq!(result.stop_reason, StopReason::MaxToolCalls);
        assert_eq!(result.stats.tool_calls, 2);
    }

    #[tokio::test]
    async fn cancellation_is_honored_at_step_boundaries() {
        let engine = engine(vec![thinks("Final Answer: too late", vec![])], fast_config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = engine.solve_with_cancellation("interrupted", cancel).await;

        assert!(!result.success);
        assert_eq!(result.stop_reason, StopReason::Cancelled);
        assert_eq!(result.chain.status(), ChainStatus::Failed);
    }

    #[tokio::test]
    async fn validation_failure_is_surfaced_not_fatal() {
        let engine = engine(
            vec![
                // Missing the required 'expression' argument.
                thinks("try this", vec![tool_call("c1", "calculator", serde_json::json!({}))]),
                thinks("Final Answer: adapted", vec![]),
            ],
            fast_config(),
        );

        let result = engine.solve("bad args").await;

        assert!(result.success);
        let failure = result
            .chain
            .steps()
            .iter()
            .find_map(|s| match &s.kind {
                StepKind::ToolResult { success: false, error, .. } => error.clone(),
                _ => None,
            })
            .unwrap();
        assert!(failure.contains("invalid arguments"));
        // Reflection turned the failure into an observation as well.
        assert_eq!(result.chain.count(StepType::Observation), 1);
    }

    #[tokio::test]
    async fn step_callback_sees_every_step_and_may_panic() {
        let seen: Arc<Mutex<Vec<StepType>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_by_callback = Arc::clone(&seen);

        let mut engine = engine(
            vec![
                thinks(
                    "multiplying",
                    vec![tool_call("c1", "calculator", serde_json::json!({"expression": "3*3"}))],
                ),
                thinks("Final Answer: 9", vec![]),
            ],
            fast_config(),
        );
        engine.set_step_callback(Arc::new(move |step| {
            seen_by_callback.lock().unwrap().push(step.step_type());
            if step.step_type() == StepType::ToolResult {
                panic!("observer bug");
            }
        }));

        let result = engine.solve("callback test").await;

        assert!(result.success, "panicking observer must not abort the loop");
        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                StepType::Thought,
                StepType::ToolCall,
                StepType::ToolResult,
                StepType::Thought,
                StepType::Answer,
            ]
        );
    }

    #[tokio::test]
    async fn tool_outputs_reach_the_next_turn_as_tool_messages() {
        // The scripted client cannot inspect messages, so check the chain:
        // a successful calculator result step must precede the answer.
        let engine = engine(
            vec![
                thinks(
                    "computing",
                    vec![tool_call("c1", "calculator", serde_json::json!({"expression": "6*7"}))],
                ),
                thinks("Final Answer: 42", vec![]),
            ],
            fast_config(),
        );

        let result = engine.solve("compute 6*7").await;
        let steps = result.chain.steps();
        let result_idx = steps
            .iter()
            .position(|s| s.step_type() == StepType::ToolResult)
            .unwrap();
        let answer_idx = steps
            .iter()
            .position(|s| s.step_type() == StepType::Answer)
            .unwrap();
        assert!(result_idx < answer_idx);
        match &steps[result_idx].kind {
            StepKind::ToolResult { success, output, .. } => {
                assert!(*success);
                assert_eq!(output.as_ref().unwrap()["result"], serde_json::json!("42"));
            }
            other => panic!("unexpected step {other:?}"),
        }
    }
}
