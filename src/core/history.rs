//! Conversation history: an append-only, bounded sequence of turns.
//!
//! The history is owned exclusively by the engine; worker tasks hand tool
//! results back over a channel and the owning loop appends them. When the
//! history grows past its cap, the oldest turns collapse into a single
//! synthetic summary turn so prompt size stays bounded while recent
//! context survives verbatim.

use chrono::{DateTime, Utc};
use serde_json::Value;

pub const SUMMARY_MARKER: &str = "Conversation Summary (Auto-Generated)";
/// Most recent turns kept verbatim when collapsing.
const MIN_RECENT_TURNS_TO_KEEP: usize = 4;

// === Types ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// One conversation turn. Immutable once appended.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    /// Structured tool-call or tool-result payload, when the turn carries one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub timestamp: DateTime<Utc>,
    /// True for synthetic summary turns produced by collapsing.
    #[serde(default)]
    pub summary: bool,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool(content: impl Into<String>, payload: Value) -> Self {
        let mut turn = Self::new(Role::Tool, content);
        turn.payload = Some(payload);
        turn
    }

    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            payload: None,
            timestamp: Utc::now(),
            summary: false,
        }
    }
}

/// Insertion-ordered turn sequence, bounded by collapsing.
#[derive(Debug)]
pub struct ConversationHistory {
    turns: Vec<ConversationTurn>,
    max_turns: usize,
    collapsed_total: usize,
}

impl ConversationHistory {
    #[must_use]
    pub fn new(max_turns: usize) -> Self {
        Self {
            turns: Vec::new(),
            max_turns: max_turns.max(MIN_RECENT_TURNS_TO_KEEP + 1),
            collapsed_total: 0,
        }
    }

    pub fn push(&mut self, turn: ConversationTurn) {
        self.turns.push(turn);
        self.enforce_bound();
    }

    #[must_use]
    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Total original turns collapsed into summaries so far.
    #[must_use]
    pub fn collapsed_total(&self) -> usize {
        self.collapsed_total
    }

    fn enforce_bound(&mut self) {
        if self.turns.len() <= self.max_turns {
            return;
        }

        // Collapse down to half capacity so the next few appends don't
        // immediately trigger another collapse.
        let keep_recent = (self.max_turns / 2).max(MIN_RECENT_TURNS_TO_KEEP);
        let collapse_count = self.turns.len() - keep_recent;
        let collapsed: Vec<ConversationTurn> = self.turns.drain(..collapse_count).collect();

        let fresh: Vec<&ConversationTurn> = collapsed.iter().filter(|t| !t.summary).collect();
        self.collapsed_total += fresh.len();

        let mut lines = Vec::with_capacity(fresh.len());
        for turn in &fresh {
            let first_line = turn.content.lines().next().unwrap_or("");
            let snippet: String = first_line.chars().take(80).collect();
            lines.push(format!("- {:?}: {snippet}", turn.role));
        }
        let content = format!(
            "{SUMMARY_MARKER}\n{} earlier turn(s) collapsed to bound history length.\n{}",
            self.collapsed_total,
            lines.join("\n")
        );

        let mut summary = ConversationTurn::assistant(content);
        summary.summary = true;
        self.turns.insert(0, summary);
    }
}
