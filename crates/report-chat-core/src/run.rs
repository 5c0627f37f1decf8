//! Per-query run state machine.
//!
//! ```text
//! Received ─▶ Rewriting ─▶ Retrieving ─▶ Synthesizing ─▶ Streaming ─▶ Done
//!     └──────────────────────▲
//!          (no history)
//! any non-terminal state ─▶ Error
//! ```

use std::fmt;

use anyhow::{bail, Result};
use serde::Serialize;
use uuid::Uuid;

/// Lifecycle state of a [`Run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Received,
    Rewriting,
    Retrieving,
    Synthesizing,
    Streaming,
    Done,
    Error,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Error)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (s, Error) => !s.is_terminal(),
            (Received, Rewriting) | (Received, Retrieving) => true,
            (Rewriting, Retrieving) => true,
            (Retrieving, Synthesizing) => true,
            (Synthesizing, Streaming) => true,
            (Streaming, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Received => "received",
            RunState::Rewriting => "rewriting",
            RunState::Retrieving => "retrieving",
            RunState::Synthesizing => "synthesizing",
            RunState::Streaming => "streaming",
            RunState::Done => "done",
            RunState::Error => "error",
        };
        f.write_str(s)
    }
}

/// One execution of the retrieval and synthesis pipeline.
#[derive(Debug, Clone)]
pub struct Run {
    pub id: Uuid,
    pub conversation_id: Option<String>,
    state: RunState,
    error: Option<String>,
}

impl Run {
    pub fn new(conversation_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            state: RunState::Received,
            error: None,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Move to `next`, rejecting transitions the state machine does not allow.
    pub fn advance(&mut self, next: RunState) -> Result<()> {
        if next == RunState::Error {
            bail!("use Run::fail to enter the error state");
        }
        if !self.state.can_transition_to(next) {
            bail!("invalid run transition {} -> {}", self.state, next);
        }
        self.state = next;
        Ok(())
    }

    /// Enter the terminal error state. No-op once terminal.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }
        self.state = RunState::Error;
        self.error = Some(reason.into());
    }
}
