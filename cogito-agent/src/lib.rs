pub mod chain;
pub mod clients;
pub mod core;
pub mod executor;
pub mod memory;
pub mod prompts;
pub mod stop;
pub mod tools;

pub use chain::{
    ChainError, ChainStatus, ReasoningChain, ReasoningConfig, ReasoningResult, ReasoningStep,
    RunStats, StepKind, StepType, StopReason,
};
pub use clients::{
    create_llm_client, LlmClient, LlmError, LlmResponse, Message, MessageRole, OpenAIClient,
    SamplingOptions, ToolCallRequest, ToolDefinition,
};
pub use self::core::{ReasoningEngine, StepCallback};
pub use executor::{ToolCoordinator, ToolFailure, ToolOutcome};
pub use memory::{ContextLimits, ConversationContext};
pub use tools::{default_tools, Tool, ToolError, ToolRegistry, ToolSpec};
