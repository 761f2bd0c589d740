//! Decision-making algorithm cascade: PDMA + CSDMA + DSDMA evaluate a
//! thought in parallel, then ASPDMA selects one of the 10 action verbs.
//!
//! Generalizes the teacher's `ReasonerRegistry`/`Bid`/`Problem` bid-based
//! dispatch (`dispatch/mod.rs`) from "many reasoners bid, pick the best
//! bid" into "three DMAs evaluate, ASPDMA decides" — same shape (parallel
//! evaluators feeding a single selector), different selection contract.

pub mod cascade;
pub mod conscience;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DmaError;
use crate::task::Task;
use crate::thought::Thought;

/// One of the 10 actions the dispatcher can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionVerb {
    Speak,
    Tool,
    Observe,
    Memorize,
    Recall,
    Forget,
    Ponder,
    Defer,
    Reject,
    TaskComplete,
}

impl ActionVerb {
    /// Whether this verb terminates the task (no follow-up thought).
    pub fn is_terminal(self) -> bool {
        matches!(self, ActionVerb::Defer | ActionVerb::Reject | ActionVerb::TaskComplete)
    }

    /// The five verbs the conscience never evaluates (spec §4.6): they
    /// cannot produce harm by construction.
    pub fn bypasses_conscience(self) -> bool {
        matches!(
            self,
            ActionVerb::Recall | ActionVerb::Observe | ActionVerb::Defer | ActionVerb::Reject | ActionVerb::TaskComplete
        )
    }
}

impl std::fmt::Display for ActionVerb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionVerb::Speak => "SPEAK",
            ActionVerb::Tool => "TOOL",
            ActionVerb::Observe => "OBSERVE",
            ActionVerb::Memorize => "MEMORIZE",
            ActionVerb::Recall => "RECALL",
            ActionVerb::Forget => "FORGET",
            ActionVerb::Ponder => "PONDER",
            ActionVerb::Defer => "DEFER",
            ActionVerb::Reject => "REJECT",
            ActionVerb::TaskComplete => "TASK_COMPLETE",
        };
        write!(f, "{s}")
    }
}

/// Structured output of one of PDMA/CSDMA/DSDMA: numeric scores plus notes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DmaEvaluation {
    pub alignment: f64,
    pub plausibility: f64,
    pub domain_fit: f64,
    pub notes: String,
}

/// The combined evaluation of one cascade pass, always assembled in
/// deterministic order (PDMA, CSDMA, DSDMA) regardless of which finished
/// its parallel evaluation first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DmaResults {
    pub pdma: DmaEvaluation,
    pub csdma: DmaEvaluation,
    pub dsdma: DmaEvaluation,
    /// Number of recursive ASPDMA re-invocations already performed for
    /// this thought (spec §4.6 recursion tracking).
    pub recursion_count: u32,
}

/// ASPDMA's chosen action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSelection {
    pub selected_action: ActionVerb,
    pub action_parameters: Value,
    pub rationale: String,
}

/// Principled DMA.
#[async_trait]
pub trait Pdma: Send + Sync {
    async fn evaluate(&self, task: &Task, thought: &Thought) -> Result<DmaEvaluation, DmaError>;
}

/// Common-Sense DMA.
#[async_trait]
pub trait Csdma: Send + Sync {
    async fn evaluate(&self, task: &Task, thought: &Thought) -> Result<DmaEvaluation, DmaError>;
}

/// Domain-Specific DMA.
#[async_trait]
pub trait Dsdma: Send + Sync {
    async fn evaluate(&self, task: &Task, thought: &Thought) -> Result<DmaEvaluation, DmaError>;
}

/// Action-Selection PDMA: chooses one of the 10 verbs given the three DMA
/// outputs, optionally re-invoked with appended conscience feedback.
#[async_trait]
pub trait Aspdma: Send + Sync {
    async fn select(
        &self,
        task: &Task,
        thought: &Thought,
        results: &DmaResults,
        conscience_feedback: &[String],
    ) -> Result<ActionSelection, DmaError>;
}
