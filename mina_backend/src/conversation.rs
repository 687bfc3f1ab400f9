//! Rolling dialogue window and the raw-line buffer that feeds consolidation.
//!
//! The window always keeps the system preamble at index 0. Eviction drops the
//! oldest non-preamble turns; the preamble itself is rewritten in place.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One utterance, tagged with its speaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationWindow {
    turns: Vec<Turn>,
    max_context: usize,
}

impl ConversationWindow {
    pub fn new(max_context: usize, preamble: impl Into<String>) -> Self {
        Self {
            turns: vec![Turn::system(preamble)],
            max_context: max_context.max(crate::config::MIN_CONTEXT_LIMIT),
        }
    }

    /// Rebuild a window from persisted turns.
    ///
    /// A history that does not start with a system turn gets a fresh preamble
    /// slot; stray system turns after index 0 are dropped.
    pub fn restore(turns: Vec<Turn>, max_context: usize, preamble: impl Into<String>) -> Self {
        let mut window = Self::new(max_context, preamble);
        let mut iter = turns.into_iter().peekable();
        if iter.peek().map(|turn| turn.role) == Some(Role::System) {
            iter.next();
        }
        for turn in iter {
            if turn.role == Role::System {
                tracing::debug!("Dropping stray system turn from restored history");
                continue;
            }
            window.append(turn);
        }
        window.enforce_capacity();
        window
    }

    /// Adds a turn to the end. Empty turns and extra system turns are refused.
    pub fn append(&mut self, turn: Turn) -> bool {
        if turn.content.trim().is_empty() || turn.role == Role::System {
            return false;
        }
        self.turns.push(turn);
        true
    }

    /// Keep the preamble plus the most recent `max_context - 1` turns.
    /// Returns how many turns were evicted.
    pub fn enforce_capacity(&mut self) -> usize {
        if self.turns.len() <= self.max_context {
            return 0;
        }
        let excess = self.turns.len() - self.max_context;
        self.turns.drain(1..1 + excess);
        excess
    }

    pub fn set_preamble(&mut self, text: impl Into<String>) {
        self.turns[0].content = text.into();
    }

    pub fn preamble(&self) -> &str {
        &self.turns[0].content
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// The preamble slot is always present, so a window is never empty.
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn max_context(&self) -> usize {
        self.max_context
    }
}

/// Raw "Speaker: text" lines accumulated since the last dispatched consolidation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsolidationBuffer {
    lines: Vec<String>,
}

impl ConsolidationBuffer {
    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    pub fn push_exchange(&mut self, user_text: &str, assistant_label: &str, reply: &str) {
        self.push(format!("User: {}", user_text));
        self.push(format!("{}: {}", assistant_label, reply));
    }

    /// Snapshot and clear in one step.
    pub fn take(&mut self) -> Vec<String> {
        std::mem::take(&mut self.lines)
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
