//! Conversation memory for one chat session.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => f.write_str("User"),
            Role::Assistant => f.write_str("Assistant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// Ordered log of turns. When bounded, the oldest question/answer pair is
/// evicted once more than `max_exchanges` pairs are held.
#[derive(Debug, Clone, Default)]
pub struct ConversationMemory {
    turns: VecDeque<Turn>,
    max_exchanges: Option<usize>,
}

impl ConversationMemory {
    /// Unbounded memory: grows for the whole session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps at most `max_exchanges` user/assistant pairs. `0` means unbounded.
    pub fn bounded(max_exchanges: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            max_exchanges: (max_exchanges > 0).then_some(max_exchanges),
        }
    }

    pub fn append(&mut self, turn: Turn) {
        self.turns.push_back(turn);
        if let Some(max) = self.max_exchanges {
            while self.turns.len() > max * 2 {
                self.turns.pop_front();
            }
        }
    }

    /// Appends one question and its answer.
    pub fn record_exchange(&mut self, question: impl Into<String>, answer: impl Into<String>) {
        self.append(Turn::user(question));
        self.append(Turn::assistant(answer));
    }

    /// Turns in chronological order.
    pub fn history(&self) -> impl Iterator<Item = &Turn> + '_ {
        self.turns.iter()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// History as prompt text: one `Role: text` block per turn.
    pub fn render(&self) -> String {
        self.turns
            .iter()
            .map(|t| format!("{}: {}", t.role, t.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_exchanges_in_order() {
        let mut m = ConversationMemory::new();
        for i in 0..4 {
            m.record_exchange(format!("q{i}"), format!("a{i}"));
        }
        let turns: Vec<_> = m.history().cloned().collect();
        assert_eq!(turns.len(), 8);
        for (i, pair) in turns.chunks(2).enumerate() {
            assert_eq!(pair[0], Turn::user(format!("q{i}")));
            assert_eq!(pair[1], Turn::assistant(format!("a{i}")));
        }
    }

    #[test]
    fn bounded_memory_evicts_oldest_pair() {
        let mut m = ConversationMemory::bounded(2);
        for i in 0..3 {
            m.record_exchange(format!("q{i}"), format!("a{i}"));
        }
        assert_eq!(m.len(), 4);
        assert_eq!(m.history().next(), Some(&Turn::user("q1")));
    }

    #[test]
    fn zero_bound_means_unbounded() {
        let mut m = ConversationMemory::bounded(0);
        for i in 0..50 {
            m.record_exchange(format!("q{i}"), "a");
        }
        assert_eq!(m.len(), 100);
    }

    #[test]
    fn renders_and_clears() {
        let mut m = ConversationMemory::new();
        assert_eq!(m.render(), "");
        m.record_exchange("gift for mom?", "How old is she?");
        assert_eq!(m.render(), "User: gift for mom?\nAssistant: How old is she?");
        m.clear();
        assert!(m.is_empty());
    }
}
