//! Token-budgeted conversation history for multi-turn chats.

use crate::providers::{ChatMessage, Usage};
use serde::{Deserialize, Serialize};

/// Rough token estimate: Latin-1 characters count a fifth of a token,
/// everything else (CJK in practice) two tokens.
pub fn estimate_token_count(text: &str) -> usize {
    let tenths: usize = text
        .chars()
        .map(|ch| if u32::from(ch) <= 255 { 2 } else { 20 })
        .sum();
    tenths.div_ceil(10)
}

/// One stored turn with its token cost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: String,
    pub content: String,
    pub token_count: usize,
}

impl HistoryTurn {
    pub fn new(role: &str, content: impl Into<String>, token_count: usize) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            token_count,
        }
    }

    /// Turn whose cost is estimated from its text.
    pub fn estimated(role: &str, content: impl Into<String>) -> Self {
        let content = content.into();
        let token_count = estimate_token_count(&content);
        Self::new(role, content, token_count)
    }
}

impl From<&HistoryTurn> for ChatMessage {
    fn from(turn: &HistoryTurn) -> Self {
        ChatMessage {
            role: turn.role.clone(),
            content: turn.content.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryBudget {
    pub max_tokens: usize,
    pub min_response_tokens: usize,
    pub max_turns: usize,
}

/// Turns selected for one upstream request; the last turn is the new prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledHistory {
    pub turns: Vec<HistoryTurn>,
}

impl AssembledHistory {
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.turns.iter().map(ChatMessage::from).collect()
    }

    /// Appends the answer, replacing estimates with reported usage.
    ///
    /// The prompt turn absorbs the difference between the reported prompt
    /// size and the costs already recorded for the earlier turns.
    pub fn record_answer(&mut self, answer: &str, usage: Option<&Usage>) {
        let completion_tokens = match usage {
            Some(usage) => {
                if let Some((prompt, earlier)) = self.turns.split_last_mut() {
                    let earlier_tokens: usize = earlier.iter().map(|turn| turn.token_count).sum();
                    if usage.prompt_tokens > earlier_tokens {
                        prompt.token_count = usage.prompt_tokens - earlier_tokens;
                    }
                }
                usage.completion_tokens
            }
            None => estimate_token_count(answer),
        };
        self.turns
            .push(HistoryTurn::new("assistant", answer, completion_tokens));
    }
}

/// Trims stored history to fit the request budget.
pub struct HistoryAssembler {
    budget: HistoryBudget,
    preamble: HistoryTurn,
}

impl HistoryAssembler {
    pub fn new(budget: HistoryBudget, preamble: HistoryTurn) -> Self {
        Self { budget, preamble }
    }

    /// Builds the turn list for `new_turn`.
    ///
    /// `last_turn_tokens` is the cost of the previous prompt and answer;
    /// `None` means there is no ongoing conversation, so only a fresh
    /// preamble is sent. A stored history always starts with its preamble,
    /// which is kept regardless of budget.
    pub fn assemble(
        &self,
        stored: &[HistoryTurn],
        new_turn: HistoryTurn,
        last_turn_tokens: Option<usize>,
    ) -> AssembledHistory {
        let Some(last_turn_tokens) = last_turn_tokens else {
            return self.preamble_only(new_turn);
        };
        let Some((preamble, past)) = stored.split_first() else {
            return self.preamble_only(new_turn);
        };

        let mut remaining = self.budget.max_tokens as i64
            - self.budget.min_response_tokens as i64
            - self.preamble.token_count as i64
            - new_turn.token_count as i64
            - last_turn_tokens as i64;
        tracing::debug!("history token budget {remaining}");

        let window = &past[past.len().saturating_sub(self.budget.max_turns)..];
        let mut kept = Vec::new();
        for turn in window.iter().rev() {
            if remaining <= 0 || remaining < turn.token_count as i64 {
                break;
            }
            remaining -= turn.token_count as i64;
            kept.push(turn.clone());
        }
        kept.reverse();

        let mut turns = Vec::with_capacity(kept.len() + 2);
        turns.push(preamble.clone());
        turns.extend(kept);
        turns.push(new_turn);
        AssembledHistory { turns }
    }

    fn preamble_only(&self, new_turn: HistoryTurn) -> AssembledHistory {
        AssembledHistory {
            turns: vec![self.preamble.clone(), new_turn],
        }
    }
}
