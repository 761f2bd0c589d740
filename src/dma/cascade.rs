//! Cascade orchestration: run PDMA/CSDMA/DSDMA in parallel, feed ASPDMA,
//! then loop ASPDMA <-> conscience up to `conscience_retry_limit` times.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::Config;
use crate::dma::conscience::{self, ConscienceOutcome, FacultyVerdict};
use crate::dma::{ActionSelection, Aspdma, Csdma, DmaResults, Dsdma, Pdma};
use crate::error::{ConscienceError, DmaError};
use crate::task::Task;
use crate::thought::Thought;

/// The full outcome of pushing one thought through the cascade.
pub struct CascadeOutcome {
    pub results: DmaResults,
    pub selection: ActionSelection,
    /// All conscience feedback strings accumulated across recursive
    /// ASPDMA re-invocations, in order.
    pub conscience_trail: Vec<String>,
    /// Every faculty/structural-check verdict from every conscience pass,
    /// across all recursive ASPDMA re-invocations, in order — the source
    /// for the trace's `conscience` component (spec §4.9).
    pub faculty_verdicts: Vec<FacultyVerdict>,
    /// Whether the thought was force-overridden to DEFER by conscience,
    /// rather than choosing DEFER on its own via ASPDMA.
    pub forced_defer: bool,
}

/// Run PDMA, CSDMA, DSDMA concurrently with a shared timeout and per-DMA
/// retry up to `dma_retry_limit`. Results are assembled in the
/// deterministic order (PDMA, CSDMA, DSDMA) regardless of completion order.
pub async fn run_dmas(
    config: &Config,
    pdma: &dyn Pdma,
    csdma: &dyn Csdma,
    dsdma: &dyn Dsdma,
    task: &Task,
    thought: &Thought,
) -> Result<DmaResults, DmaError> {
    let timeout = Duration::from_secs_f64(config.dma_timeout_seconds);

    async fn with_retry<F, Fut, T>(name: &str, limit: u32, timeout: Duration, mut f: F) -> Result<T, DmaError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, DmaError>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match tokio::time::timeout(timeout, f()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if attempts < limit => {
                    warn!(dma = name, attempt = attempts, error = %e, "dma evaluation failed, retrying");
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) if attempts < limit => {
                    warn!(dma = name, attempt = attempts, "dma evaluation timed out, retrying");
                    continue;
                }
                Err(_) => {
                    return Err(DmaError::Timeout {
                        dma: name.to_string(),
                        timeout_secs: timeout.as_secs_f64(),
                    })
                }
            }
        }
    }

    let (pdma_res, csdma_res, dsdma_res) = tokio::join!(
        with_retry("pdma", config.dma_retry_limit, timeout, || pdma.evaluate(task, thought)),
        with_retry("csdma", config.dma_retry_limit, timeout, || csdma.evaluate(task, thought)),
        with_retry("dsdma", config.dma_retry_limit, timeout, || dsdma.evaluate(task, thought)),
    );

    Ok(DmaResults {
        pdma: pdma_res?,
        csdma: csdma_res?,
        dsdma: dsdma_res?,
        recursion_count: 0,
    })
}

/// Run the full cascade for one thought: DMAs -> ASPDMA -> conscience,
/// recursively re-invoking ASPDMA with accumulated feedback up to
/// `conscience_retry_limit` times before forcing DEFER.
pub async fn run_cascade(
    config: &Config,
    aspdma: &dyn Aspdma,
    task: &Task,
    thought: &Thought,
    mut results: DmaResults,
) -> Result<CascadeOutcome, ConscienceError> {
    let mut feedback_trail = Vec::new();
    let mut all_verdicts = Vec::new();
    let mut attempt = 0u32;

    loop {
        let selection = aspdma
            .select(task, thought, &results, &feedback_trail)
            .await
            .map_err(|e| ConscienceError::Violation {
                faculty: "aspdma".to_string(),
                reason: e.to_string(),
            })?;

        info!(
            thought_id = %thought.thought_id,
            action = %selection.selected_action,
            attempt,
            "aspdma selection"
        );

        let (outcome, verdicts) = conscience::evaluate(config, task, thought, &selection);
        all_verdicts.extend(verdicts);

        match outcome {
            ConscienceOutcome::Approved => {
                return Ok(CascadeOutcome {
                    results,
                    selection,
                    conscience_trail: feedback_trail,
                    faculty_verdicts: all_verdicts,
                    forced_defer: false,
                });
            }
            ConscienceOutcome::ForcedDefer { reason } => {
                feedback_trail.push(reason.clone());
                return Ok(CascadeOutcome {
                    results,
                    selection: crate::dma::ActionSelection {
                        selected_action: crate::dma::ActionVerb::Defer,
                        action_parameters: serde_json::json!({ "reason": reason }),
                        rationale: "structural override".to_string(),
                    },
                    conscience_trail: feedback_trail,
                    faculty_verdicts: all_verdicts,
                    forced_defer: true,
                });
            }
            ConscienceOutcome::Failed { faculty, feedback } => {
                feedback_trail.push(format!("[{faculty}] {feedback}"));
                attempt += 1;
                results.recursion_count = attempt;
                if attempt > config.conscience_retry_limit {
                    return Err(ConscienceError::RetryExhausted {
                        thought_id: thought.thought_id.to_string(),
                        limit: config.conscience_retry_limit,
                    });
                }
                // loop: recursive ASPDMA re-invocation with appended feedback
            }
        }
    }
}

/// Convenience wrapper bundling the three DMA trait objects, used by the
/// runtime so call sites don't juggle three separate `Arc`s.
pub struct DmaProviders {
    pub pdma: Arc<dyn Pdma>,
    pub csdma: Arc<dyn Csdma>,
    pub dsdma: Arc<dyn Dsdma>,
    pub aspdma: Arc<dyn Aspdma>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{TaskId, ThoughtId};
    use crate::dma::{ActionVerb, DmaEvaluation};
    use crate::task::ChannelRef;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn task() -> Task {
        Task::new(TaskId("t1".into()), "occ-a", ChannelRef("api:c1".into()), Utc::now())
    }

    fn thought() -> Thought {
        Thought::initial(ThoughtId("th1".into()), TaskId("t1".into()), "hello", Utc::now())
    }

    fn eval() -> DmaEvaluation {
        DmaEvaluation {
            alignment: 0.9,
            plausibility: 0.9,
            domain_fit: 0.9,
            notes: "ok".to_string(),
        }
    }

    struct OkPdma;
    #[async_trait]
    impl Pdma for OkPdma {
        async fn evaluate(&self, _t: &Task, _th: &Thought) -> Result<DmaEvaluation, DmaError> {
            Ok(eval())
        }
    }
    struct OkCsdma;
    #[async_trait]
    impl Csdma for OkCsdma {
        async fn evaluate(&self, _t: &Task, _th: &Thought) -> Result<DmaEvaluation, DmaError> {
            Ok(eval())
        }
    }
    struct OkDsdma;
    #[async_trait]
    impl Dsdma for OkDsdma {
        async fn evaluate(&self, _t: &Task, _th: &Thought) -> Result<DmaEvaluation, DmaError> {
            Ok(eval())
        }
    }

    /// Fails coherence on the first call, passes on the second — exercises
    /// scenario S2 (first-bounce retry).
    struct OneBounceAspdma {
        calls: AtomicU32,
    }
    #[async_trait]
    impl Aspdma for OneBounceAspdma {
        async fn select(
            &self,
            _task: &Task,
            _thought: &Thought,
            _results: &DmaResults,
            feedback: &[String],
        ) -> Result<ActionSelection, DmaError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if feedback.is_empty() {
                Ok(ActionSelection {
                    selected_action: ActionVerb::Speak,
                    action_parameters: json!({"entropy": 0.07, "coherence": 0.2}),
                    rationale: "first attempt".to_string(),
                })
            } else {
                Ok(ActionSelection {
                    selected_action: ActionVerb::Speak,
                    action_parameters: json!({"entropy": 0.07, "coherence": 0.85}),
                    rationale: "revised after feedback".to_string(),
                })
            }
        }
    }

    #[tokio::test]
    async fn dmas_run_and_assemble_in_deterministic_order() {
        let config = Config::default();
        let results = run_dmas(&config, &OkPdma, &OkCsdma, &OkDsdma, &task(), &thought()).await.unwrap();
        assert!((results.pdma.alignment - 0.9).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn one_recursive_aspdma_attempt_then_approved() {
        let config = Config::default();
        let aspdma = OneBounceAspdma { calls: AtomicU32::new(0) };
        let results = run_dmas(&config, &OkPdma, &OkCsdma, &OkDsdma, &task(), &thought()).await.unwrap();
        let outcome = run_cascade(&config, &aspdma, &task(), &thought(), results).await.unwrap();
        assert!(!outcome.forced_defer);
        assert_eq!(aspdma.calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.conscience_trail.len(), 1);
    }

    struct AlwaysBadAspdma;
    #[async_trait]
    impl Aspdma for AlwaysBadAspdma {
        async fn select(
            &self,
            _task: &Task,
            _thought: &Thought,
            _results: &DmaResults,
            _feedback: &[String],
        ) -> Result<ActionSelection, DmaError> {
            Ok(ActionSelection {
                selected_action: ActionVerb::Speak,
                action_parameters: json!({"entropy": 0.9, "coherence": 0.1}),
                rationale: "bad".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn exhausting_retry_limit_defers() {
        let config = Config::default();
        let results = run_dmas(&config, &OkPdma, &OkCsdma, &OkDsdma, &task(), &thought()).await.unwrap();
        let outcome = run_cascade(&config, &AlwaysBadAspdma, &task(), &thought(), results).await;
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn depth_at_max_force_defers_without_retry() {
        let config = Config::default();
        let mut th = thought();
        th.depth = config.max_depth;
        let results = run_dmas(&config, &OkPdma, &OkCsdma, &OkDsdma, &task(), &th).await.unwrap();
        let outcome = run_cascade(&config, &AlwaysBadAspdma, &task(), &th, results).await.unwrap();
        assert!(outcome.forced_defer);
        assert_eq!(outcome.selection.selected_action, ActionVerb::Defer);
    }
}
