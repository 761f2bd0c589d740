//! Cognitive state machine: WAKEUP -> WORK -> {PLAY, SOLITUDE, DREAM} -> ... -> SHUTDOWN.

use serde::{Deserialize, Serialize};

use crate::error::StateMachineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CognitiveState {
    Wakeup,
    Work,
    Play,
    Solitude,
    Dream,
    Shutdown,
}

impl std::fmt::Display for CognitiveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CognitiveState::Wakeup => "WAKEUP",
            CognitiveState::Work => "WORK",
            CognitiveState::Play => "PLAY",
            CognitiveState::Solitude => "SOLITUDE",
            CognitiveState::Dream => "DREAM",
            CognitiveState::Shutdown => "SHUTDOWN",
        };
        write!(f, "{s}")
    }
}

impl CognitiveState {
    fn allowed_next(self) -> &'static [CognitiveState] {
        use CognitiveState::*;
        match self {
            Wakeup => &[Work, Shutdown],
            Work => &[Play, Solitude, Dream, Shutdown],
            Play => &[Work, Solitude, Shutdown],
            Solitude => &[Work, Dream, Shutdown],
            Dream => &[Work, Shutdown],
            Shutdown => &[],
        }
    }
}

/// A single logged state transition, recorded to the audit chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: CognitiveState,
    pub to: CognitiveState,
    pub at: chrono::DateTime<chrono::Utc>,
    pub reason: String,
}

/// Drives the active cognitive state and rejects illegal transitions.
pub struct StateMachine {
    current: CognitiveState,
    history: Vec<StateTransition>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: CognitiveState::Wakeup,
            history: Vec::new(),
        }
    }

    pub fn current(&self) -> CognitiveState {
        self.current
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    /// Attempt a transition. `active_tasks` gates entry into DREAM (spec
    /// §4.8: cannot enter DREAM while tasks are active).
    pub fn transition(
        &mut self,
        to: CognitiveState,
        active_tasks: usize,
        now: chrono::DateTime<chrono::Utc>,
        reason: impl Into<String>,
    ) -> Result<(), StateMachineError> {
        if !self.current.allowed_next().contains(&to) {
            return Err(StateMachineError::IllegalTransition {
                from: self.current.to_string(),
                to: to.to_string(),
            });
        }
        if to == CognitiveState::Dream && active_tasks > 0 {
            return Err(StateMachineError::DreamBlocked { active_tasks });
        }
        self.history.push(StateTransition {
            from: self.current,
            to,
            at: now,
            reason: reason.into(),
        });
        self.current = to;
        Ok(())
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
