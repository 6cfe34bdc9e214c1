use crate::clients::{Message, MessageRole};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::VecDeque;

const DEFAULT_MAX_MESSAGES: usize = 40;
const DEFAULT_MAX_TOKENS: usize = 8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextLimits {
    pub max_messages: usize,
    pub max_tokens: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_MAX_MESSAGES,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSummary {
    pub total_messages: usize,
    pub by_role: HashMap<String, usize>,
    pub estimated_tokens: usize,
}

/// Bounded message history for the reasoning backend.
///
/// Trimming is destructive and runs after every append: oldest non-system
/// messages are dropped until both the message cap and the token budget
/// hold. System messages are always retained. The full untrimmed record of a
/// run lives in the reasoning chain, not here.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    messages: VecDeque<Message>,
    limits: ContextLimits,
}

impl ConversationContext {
    pub fn new(limits: ContextLimits) -> Self {
        Self {
            messages: VecDeque::new(),
            limits,
        }
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push_back(message);
        self.trim();
    }

    /// Read-only snapshot in insertion order.
    pub fn messages(&self) -> Vec<Message> {
        self.messages.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn summary(&self) -> ContextSummary {
        let mut by_role: HashMap<String, usize> = HashMap::new();
        for msg in &self.messages {
            *by_role.entry(msg.role.as_str().to_string()).or_insert(0) += 1;
        }

        ContextSummary {
            total_messages: self.messages.len(),
            by_role,
            estimated_tokens: self.estimated_tokens(),
        }
    }

    /// Cheap token estimate over the whole window: content bytes plus
    /// tool-call name/argument bytes, at 4 bytes per token. Deterministic and
    /// monotonic in message size; not a real tokenizer.
    pub fn estimated_tokens(&self) -> usize {
        self.messages.iter().map(estimate_message).sum()
    }

    fn trim(&mut self) {
        while self.non_system_count() > self.limits.max_messages {
            if !self.drop_oldest_non_system() {
                break;
            }
        }

        while self.estimated_tokens() > self.limits.max_tokens && self.non_system_count() > 1 {
            if !self.drop_oldest_non_system() {
                break;
            }
        }
    }

    fn non_system_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .count()
    }

    fn drop_oldest_non_system(&mut self) -> bool {
        let idx = self
            .messages
            .iter()
            .position(|m| m.role != MessageRole::System);
        match idx {
            Some(idx) => {
                self.messages.remove(idx);
                true
            }
            None => false,
        }
    }
}

fn estimate_message(msg: &Message) -> usize {
    let mut chars = msg.content.len();
    if let Some(tool_calls) = &msg.tool_calls {
        for tc in tool_calls {
            chars += tc.name.len();
            chars += tc.arguments.to_string().len();
        }
    }
    chars / 4
}
