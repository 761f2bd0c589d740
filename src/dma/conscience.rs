//! Post-selection conscience guard: four epistemic faculties plus two
//! always-on structural checks, evaluated in a fixed priority order.

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::dma::ActionSelection;
use crate::task::Task;
use crate::thought::Thought;

/// One faculty or structural check's verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacultyVerdict {
    pub faculty: String,
    pub passed: bool,
    pub reason: Option<String>,
}

/// Outcome of running the full conscience over one ASPDMA selection.
#[derive(Clone)]
pub enum ConscienceOutcome {
    /// All faculties and structural checks passed.
    Approved,
    /// A faculty failed; `feedback` is appended to the next ASPDMA prompt
    /// for a recursive re-invocation.
    Failed { faculty: String, feedback: String },
    /// A structural check forced an unconditional override to DEFER —
    /// never retried.
    ForcedDefer { reason: String },
}

fn entropy_score(selection: &ActionSelection) -> f64 {
    selection
        .action_parameters
        .get("entropy")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0)
}

fn coherence_score(selection: &ActionSelection) -> f64 {
    selection
        .action_parameters
        .get("coherence")
        .and_then(|v| v.as_f64())
        .unwrap_or(1.0)
}

fn optimization_veto(selection: &ActionSelection) -> Option<String> {
    selection
        .action_parameters
        .get("over_optimized")
        .and_then(|v| v.as_bool())
        .filter(|b| *b)
        .map(|_| "proposed action erodes human agency through over-optimization".to_string())
}

fn epistemic_humility(selection: &ActionSelection) -> Option<String> {
    selection
        .action_parameters
        .get("overconfident")
        .and_then(|v| v.as_bool())
        .filter(|b| *b)
        .map(|_| "proposed action asserts unwarranted certainty".to_string())
}

/// Run the four faculties plus the two structural checks, in priority
/// order (depth, updated-info, entropy, coherence, optimization_veto,
/// epistemic_humility). The first failing check determines the outcome;
/// updated-info is checked ahead of the bypass-verb short-circuit so it
/// can still override a terminal selection (spec Scenario S4). Returns
/// the outcome alongside a verdict for every check actually run, in
/// order, for the complete trace record (spec §4.9).
pub fn evaluate(config: &Config, task: &Task, thought: &Thought, selection: &ActionSelection) -> (ConscienceOutcome, Vec<FacultyVerdict>) {
    let mut verdicts = Vec::new();

    if thought.is_at_max_depth(config.max_depth) {
        let reason = format!("thought depth {} reached max_depth {}", thought.depth, config.max_depth);
        verdicts.push(FacultyVerdict { faculty: "depth".to_string(), passed: false, reason: Some(reason.clone()) });
        return (ConscienceOutcome::ForcedDefer { reason }, verdicts);
    }
    verdicts.push(FacultyVerdict { faculty: "depth".to_string(), passed: true, reason: None });

    if task.updated_info_available && selection.selected_action.is_terminal() {
        let feedback = "new information arrived on this task's channel; re-evaluate before concluding".to_string();
        verdicts.push(FacultyVerdict { faculty: "updated_info".to_string(), passed: false, reason: Some(feedback.clone()) });
        return (ConscienceOutcome::Failed { faculty: "updated_info".to_string(), feedback }, verdicts);
    }
    verdicts.push(FacultyVerdict { faculty: "updated_info".to_string(), passed: true, reason: None });

    if selection.selected_action.bypasses_conscience() {
        return (ConscienceOutcome::Approved, verdicts);
    }

    let entropy = entropy_score(selection);
    if entropy > config.entropy_threshold {
        let feedback = format!("entropy {entropy:.2} exceeds threshold {:.2}; simplify and reduce chaos", config.entropy_threshold);
        verdicts.push(FacultyVerdict { faculty: "entropy".to_string(), passed: false, reason: Some(feedback.clone()) });
        return (ConscienceOutcome::Failed { faculty: "entropy".to_string(), feedback }, verdicts);
    }
    verdicts.push(FacultyVerdict { faculty: "entropy".to_string(), passed: true, reason: None });

    let coherence = coherence_score(selection);
    if coherence < config.coherence_threshold {
        let feedback = format!(
            "coherence {coherence:.2} below threshold {:.2}; be explicit about limits and align with identity",
            config.coherence_threshold
        );
        verdicts.push(FacultyVerdict { faculty: "coherence".to_string(), passed: false, reason: Some(feedback.clone()) });
        return (ConscienceOutcome::Failed { faculty: "coherence".to_string(), feedback }, verdicts);
    }
    verdicts.push(FacultyVerdict { faculty: "coherence".to_string(), passed: true, reason: None });

    if let Some(reason) = optimization_veto(selection) {
        verdicts.push(FacultyVerdict { faculty: "optimization_veto".to_string(), passed: false, reason: Some(reason.clone()) });
        return (ConscienceOutcome::Failed { faculty: "optimization_veto".to_string(), feedback: reason }, verdicts);
    }
    verdicts.push(FacultyVerdict { faculty: "optimization_veto".to_string(), passed: true, reason: None });

    if let Some(reason) = epistemic_humility(selection) {
        verdicts.push(FacultyVerdict { faculty: "epistemic_humility".to_string(), passed: false, reason: Some(reason.clone()) });
        return (ConscienceOutcome::Failed { faculty: "epistemic_humility".to_string(), feedback: reason }, verdicts);
    }
    verdicts.push(FacultyVerdict { faculty: "epistemic_humility".to_string(), passed: true, reason: None });

    (ConscienceOutcome::Approved, verdicts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{TaskId, ThoughtId};
    use crate::dma::ActionVerb;
    use crate::task::ChannelRef;
    use chrono::Utc;
    use serde_json::json;

    fn task() -> Task {
        Task::new(TaskId("t1".into()), "occ-a", ChannelRef("api:c1".into()), Utc::now())
    }

    fn thought(depth: u32) -> Thought {
        let mut t = Thought::initial(ThoughtId("th1".into()), TaskId("t1".into()), "hi", Utc::now());
        t.depth = depth;
        t
    }

    fn selection(verb: ActionVerb, params: serde_json::Value) -> ActionSelection {
        ActionSelection {
            selected_action: verb,
            action_parameters: params,
            rationale: "because".to_string(),
        }
    }

    #[test]
    fn depth_at_max_forces_defer_even_for_bypass_verbs() {
        let cfg = Config::default();
        let t = thought(cfg.max_depth);
        let sel = selection(ActionVerb::TaskComplete, json!({}));
        let (outcome, verdicts) = evaluate(&cfg, &task(), &t, &sel);
        assert!(matches!(outcome, ConscienceOutcome::ForcedDefer { .. }));
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].faculty, "depth");
        assert!(!verdicts[0].passed);
    }

    #[test]
    fn bypass_verbs_skip_entropy_and_coherence() {
        let cfg = Config::default();
        let sel = selection(ActionVerb::Recall, json!({"entropy": 0.9, "coherence": 0.1}));
        let (outcome, verdicts) = evaluate(&cfg, &task(), &thought(0), &sel);
        assert!(matches!(outcome, ConscienceOutcome::Approved));
        assert!(verdicts.iter().all(|v| v.passed));
        assert!(verdicts.iter().any(|v| v.faculty == "depth"));
        assert!(!verdicts.iter().any(|v| v.faculty == "entropy"));
    }

    #[test]
    fn high_entropy_fails_first() {
        let cfg = Config::default();
        let sel = selection(ActionVerb::Speak, json!({"entropy": 0.9, "coherence": 0.1}));
        match evaluate(&cfg, &task(), &thought(0), &sel).0 {
            ConscienceOutcome::Failed { faculty, .. } => assert_eq!(faculty, "entropy"),
            other => panic!("expected entropy failure, got {other:?}"),
        }
    }

    #[test]
    fn low_coherence_fails_when_entropy_ok() {
        let cfg = Config::default();
        let sel = selection(ActionVerb::Speak, json!({"entropy": 0.07, "coherence": 0.2}));
        match evaluate(&cfg, &task(), &thought(0), &sel).0 {
            ConscienceOutcome::Failed { faculty, .. } => assert_eq!(faculty, "coherence"),
            other => panic!("expected coherence failure, got {other:?}"),
        }
    }

    #[test]
    fn passes_with_good_scores() {
        let cfg = Config::default();
        let sel = selection(ActionVerb::Speak, json!({"entropy": 0.07, "coherence": 0.85}));
        let (outcome, verdicts) = evaluate(&cfg, &task(), &thought(0), &sel);
        assert!(matches!(outcome, ConscienceOutcome::Approved));
        assert_eq!(verdicts.len(), 6);
        assert!(verdicts.iter().all(|v| v.passed));
    }

    #[test]
    fn updated_info_overrides_terminal_selection() {
        let cfg = Config::default();
        let mut tk = task();
        tk.updated_info_available = true;
        let sel = selection(ActionVerb::TaskComplete, json!({}));
        match evaluate(&cfg, &tk, &thought(0), &sel).0 {
            ConscienceOutcome::Failed { faculty, feedback } => {
                assert_eq!(faculty, "updated_info");
                assert!(feedback.contains("new information"));
            }
            other => panic!("expected updated_info override, got {other:?}"),
        }
    }
}

impl std::fmt::Debug for ConscienceOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConscienceOutcome::Approved => write!(f, "Approved"),
            ConscienceOutcome::Failed { faculty, feedback } => {
                write!(f, "Failed {{ faculty: {faculty:?}, feedback: {feedback:?} }}")
            }
            ConscienceOutcome::ForcedDefer { reason } => write!(f, "ForcedDefer {{ reason: {reason:?} }}"),
        }
    }
}
