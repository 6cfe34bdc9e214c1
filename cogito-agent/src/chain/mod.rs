use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Contract violations on a chain. These are programming errors on the
/// caller's side, not recoverable runtime conditions.
#[derive(Debug, Error, PartialEq)]
pub enum ChainError {
    #[error("chain {0} is finalized and no longer accepts steps")]
    Finalized(String),
    #[error("chain {0} was already finalized")]
    AlreadyFinalized(String),
    #[error("finalize requires a terminal status")]
    NonTerminalStatus,
    #[error("tool result references unknown call id '{0}'")]
    UnknownCallId(String),
    #[error("tool call id '{0}' already has a result")]
    DuplicateResult(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Running,
    Completed,
    Failed,
}

impl ChainStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChainStatus::Completed | ChainStatus::Failed)
    }
}

/// Terminal classification of why a chain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    MaxIterations,
    MaxToolCalls,
    Timeout,
    Error,
    Cancelled,
}

impl StopReason {
    pub fn chain_status(self) -> ChainStatus {
        match self {
            StopReason::Completed => ChainStatus::Completed,
            _ => ChainStatus::Failed,
        }
    }
}

/// Fieldless mirror of [`StepKind`] for counting and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Thought,
    ToolCall,
    ToolResult,
    Observation,
    Answer,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Thought {
        text: String,
    },
    ToolCall {
        tool_name: String,
        arguments: Value,
        call_id: String,
    },
    ToolResult {
        call_id: String,
        tool_name: String,
        success: bool,
        output: Option<Value>,
        error: Option<String>,
        elapsed_ms: u64,
    },
    Observation {
        text: String,
    },
    Answer {
        text: String,
    },
    Error {
        text: String,
    },
}

impl StepKind {
    pub fn step_type(&self) -> StepType {
        match self {
            StepKind::Thought { .. } => StepType::Thought,
            StepKind::ToolCall { .. } => StepType::ToolCall,
            StepKind::ToolResult { .. } => StepType::ToolResult,
            StepKind::Observation { .. } => StepType::Observation,
            StepKind::Answer { .. } => StepType::Answer,
            StepKind::Error { .. } => StepType::Error,
        }
    }
}

/// One atomic event in a reasoning chain. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(flatten)]
    pub kind: StepKind,
}

impl ReasoningStep {
    pub fn new(kind: StepKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
            kind,
        }
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn step_type(&self) -> StepType {
        self.kind.step_type()
    }
}

/// Append-only record of one task-solving attempt.
///
/// The chain doubles as its own store: `append` enforces immutability after
/// finalization and referential integrity between tool results and their
/// originating calls. Unlike the conversation context, the chain is never
/// trimmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningChain {
    pub id: String,
    pub task: String,
    steps: Vec<ReasoningStep>,
    status: ChainStatus,
    pub final_answer: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl ReasoningChain {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task: task.into(),
            steps: Vec::new(),
            status: ChainStatus::Running,
            final_answer: None,
            started_at: Utc::now(),
            completed_at: None,
            metadata: HashMap::new(),
        }
    }

    pub fn status(&self) -> ChainStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn steps(&self) -> &[ReasoningStep] {
        &self.steps
    }

    /// Appends a step, enforcing the chain invariants.
    pub fn append(&mut self, step: ReasoningStep) -> Result<(), ChainError> {
        if self.status.is_terminal() {
            return Err(ChainError::Finalized(self.id.clone()));
        }

        if let StepKind::ToolResult { call_id, .. } = &step.kind {
            let matching_call = self.steps.iter().any(|s| {
                matches!(&s.kind, StepKind::ToolCall { call_id: id, .. } if id == call_id)
            });
            if !matching_call {
                return Err(ChainError::UnknownCallId(call_id.clone()));
            }
            let already_resolved = self.steps.iter().any(|s| {
                matches!(&s.kind, StepKind::ToolResult { call_id: id, .. } if id == call_id)
            });
            if already_resolved {
                return Err(ChainError::DuplicateResult(call_id.clone()));
            }
        }

        self.steps.push(step);
        Ok(())
    }

    /// Moves the chain to a terminal status exactly once.
    pub fn finalize(
        &mut self,
        status: ChainStatus,
        answer: Option<String>,
    ) -> Result<(), ChainError> {
        if self.status.is_terminal() {
            return Err(ChainError::AlreadyFinalized(self.id.clone()));
        }
        if !status.is_terminal() {
            return Err(ChainError::NonTerminalStatus);
        }

        self.status = status;
        self.final_answer = answer;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn count(&self, step_type: StepType) -> usize {
        self.steps
            .iter()
            .filter(|s| s.step_type() == step_type)
            .count()
    }

    pub fn last_steps(&self, n: usize) -> &[ReasoningStep] {
        let start = self.steps.len().saturating_sub(n);
        &self.steps[start..]
    }

    pub fn last_step(&self) -> Option<&ReasoningStep> {
        self.steps.last()
    }

    pub fn has_answer(&self) -> bool {
        self.count(StepType::Answer) > 0
    }

    pub fn elapsed(&self) -> Duration {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - self.started_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Immutable configuration snapshot for one engine. A new run with different
/// limits requires constructing a new config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningConfig {
    pub max_iterations: usize,
    pub max_tool_calls: usize,
    pub timeout: Duration,
    pub tool_timeout: Duration,
    pub backend_retries: u32,
    pub enable_reflection: bool,
    pub verbose: bool,
    pub stop_phrases: Vec<String>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub context_max_messages: usize,
    pub context_max_tokens: usize,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_tool_calls: 20,
            timeout: Duration::from_secs(300),
            tool_timeout: Duration::from_secs(30),
            backend_retries: 0,
            enable_reflection: true,
            verbose: false,
            stop_phrases: vec!["Final Answer:".to_string(), "FINAL ANSWER:".to_string()],
            temperature: 0.7,
            max_tokens: Some(2000),
            context_max_messages: 40,
            context_max_tokens: 8000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub iterations: usize,
    pub tool_calls: usize,
    pub total_steps: usize,
    pub elapsed: Duration,
}

/// Outcome of one `solve` invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningResult {
    pub success: bool,
    pub final_answer: Option<String>,
    pub chain: ReasoningChain,
    pub stop_reason: StopReason,
    pub error: Option<String>,
    pub stats: RunStats,
}

impl ReasoningResult {
    pub fn from_chain(
        chain: ReasoningChain,
        stop_reason: StopReason,
        error: Option<String>,
    ) -> Self {
        let stats = RunStats {
            iterations: chain.count(StepType::Thought),
            tool_calls: chain.count(StepType::ToolCall),
            total_steps: chain.steps().len(),
            elapsed: chain.elapsed(),
        };

        Self {
            success: stop_reason == StopReason::Completed && error.is_none(),
            final_answer: chain.final_answer.clone(),
            chain,
            stop_reason,
            error,
            stats,
        }
    }
}
