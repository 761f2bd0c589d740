//! Top-level runtime facade: wires the registry, six buses, graph store,
//! task/thought queues, DMA cascade, dispatcher, state machines, and audit
//! chain into one process-wide container (spec §9's "interface abstraction
//! replacing the source's module-level singletons").
//!
//! One [`RuntimeContext`] can drive many occurrences concurrently — each
//! occurrence gets its own [`TaskQueue`] and [`StateMachine`] behind the
//! shared service fabric, matching the teacher's single-daemon-many-symbols
//! shape generalized to single-runtime-many-occurrences.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use ed25519_dalek::SigningKey;
use tokio::sync::Mutex;
use tracing::info;

use crate::audit::{AuditChain, AuthorityRegistry, CompleteTrace, TraceComponents};
use crate::bus::communication::CommunicationBus;
use crate::bus::llm::LlmBus;
use crate::bus::memory::MemoryBus;
use crate::bus::runtime_control::RuntimeControlBus;
use crate::bus::tool::ToolBus;
use crate::bus::wisdom::WisdomBus;
use crate::clock::{Clock, TaskId, ThoughtId, TraceId};
use crate::config::{Config, ConfigService};
use crate::dispatch::{Dispatcher, HandlerStatus};
use crate::dma::cascade::{run_cascade, run_dmas, DmaProviders};
use crate::error::{CirisError, DispatchError};
use crate::graph::store::{GraphStore, LocalMemoryProvider};
use crate::queue::TaskQueue;
use crate::registry::ServiceRegistry;
use crate::state_machine::StateMachine;
use crate::task::{ChannelRef, Task, TaskStatus};
use crate::telemetry::TelemetryAggregator;
use crate::thought::Thought;

/// Everything produced by processing one thought through the cascade.
pub struct ProcessedThought {
    pub task_id: TaskId,
    pub trace: CompleteTrace,
}

/// The process-wide container: one instance owns every subsystem and is
/// shared behind an `Arc` by the CLI entry point and any external adapters.
pub struct RuntimeContext {
    pub config: Arc<ConfigService>,
    pub clock: Clock,
    pub registry: Arc<ServiceRegistry>,
    pub memory_bus: Arc<MemoryBus>,
    pub llm_bus: Arc<LlmBus>,
    pub wisdom_bus: Arc<WisdomBus>,
    pub tool_bus: Arc<ToolBus>,
    pub communication_bus: Arc<CommunicationBus>,
    pub runtime_control_bus: Arc<RuntimeControlBus>,
    pub graph: Arc<GraphStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub dma: DmaProviders,
    pub audit: Arc<AuditChain>,
    pub authorities: std::sync::RwLock<AuthorityRegistry>,
    pub telemetry: Arc<TelemetryAggregator>,
    queues: DashMap<String, Mutex<TaskQueue>>,
    states: DashMap<String, Mutex<StateMachine>>,
}

impl RuntimeContext {
    /// Assemble a runtime from a validated config, an audit signing key,
    /// and the four DMA providers. The in-process graph store is always
    /// registered as the default (lowest-priority-number) memory provider;
    /// callers add further providers to any bus after construction.
    pub fn new(config: Config, signing_key: SigningKey, dma: DmaProviders, graph: Arc<GraphStore>) -> Result<Arc<Self>, CirisError> {
        config.validate()?;
        let clock = Clock::new();
        let registry = Arc::new(ServiceRegistry::new(
            config.breaker_failure_threshold,
            Duration::from_secs(config.breaker_cooldown_seconds),
        ));
        let bus_timeout = Duration::from_secs_f64(config.dma_timeout_seconds);

        let memory_bus = Arc::new(MemoryBus::new(registry.clone(), bus_timeout));
        memory_bus.register(
            Arc::new(LocalMemoryProvider {
                provider_id: "local-graph-store".to_string(),
                store: graph.clone(),
            }),
            0,
        );
        let llm_bus = Arc::new(LlmBus::new(registry.clone(), bus_timeout));
        let wisdom_bus = Arc::new(WisdomBus::new(registry.clone(), bus_timeout));
        let tool_bus = Arc::new(ToolBus::new(registry.clone(), bus_timeout));
        let communication_bus = Arc::new(CommunicationBus::new(registry.clone(), bus_timeout));
        let runtime_control_bus = Arc::new(RuntimeControlBus::new(registry.clone(), bus_timeout));

        let dispatcher = Arc::new(Dispatcher::new(
            memory_bus.clone(),
            wisdom_bus.clone(),
            tool_bus.clone(),
            communication_bus.clone(),
            clock.clone(),
        ));

        let audit = Arc::new(AuditChain::new(signing_key));
        let telemetry = Arc::new(TelemetryAggregator::new(Duration::from_secs_f64(config.conscience_timeout_seconds)));

        Ok(Arc::new(Self {
            config: Arc::new(ConfigService::new(config)),
            clock,
            registry,
            memory_bus,
            llm_bus,
            wisdom_bus,
            tool_bus,
            communication_bus,
            runtime_control_bus,
            graph,
            dispatcher,
            dma,
            audit,
            authorities: std::sync::RwLock::new(AuthorityRegistry::new()),
            telemetry,
            queues: DashMap::new(),
            states: DashMap::new(),
        }))
    }

    fn queue_for(&self, occurrence_id: &str) -> dashmap::mapref::one::RefMut<'_, String, Mutex<TaskQueue>> {
        let config = self.config.get();
        self.queues
            .entry(occurrence_id.to_string())
            .or_insert_with(|| Mutex::new(TaskQueue::new(occurrence_id, config.max_active_tasks, config.max_active_thoughts)))
    }

    pub fn state_for(&self, occurrence_id: &str) -> dashmap::mapref::one::RefMut<'_, String, Mutex<StateMachine>> {
        self.states
            .entry(occurrence_id.to_string())
            .or_insert_with(|| Mutex::new(StateMachine::new()))
    }

    /// Submit a new external observation, coalescing into an already-active
    /// task on the same channel (spec §4.5).
    pub async fn submit_observation(&self, occurrence_id: &str, channel: ChannelRef, text: impl Into<String>) -> Result<TaskId, DispatchError> {
        let now = self.clock.now();
        let task_id = TaskId(self.clock.new_id("task"));
        let thought_id = ThoughtId(self.clock.new_id("th"));
        let task = Task::new(task_id.clone(), occurrence_id, channel, now);
        let thought = Thought::initial(thought_id, task_id, text, now);

        let queue = self.queue_for(occurrence_id);
        let mut guard = queue.value().lock().await;
        guard.submit(task, thought)
    }

    /// Pop one round of pending thoughts for `occurrence_id` and drive each
    /// through the DMA cascade, conscience, and dispatcher, appending a
    /// [`CompleteTrace`] to the audit chain for every thought processed.
    pub async fn process_round(&self, occurrence_id: &str) -> Result<Vec<ProcessedThought>, CirisError> {
        let config = self.config.get();
        let queue = self.queue_for(occurrence_id);
        let mut guard = queue.value().lock().await;
        let batch = guard.next_round();
        let mut processed = Vec::new();

        for thought in batch {
            let task_id = thought.task_id.clone();
            let Some(task) = guard.task_mut(&task_id) else {
                continue;
            };
            if task.status == TaskStatus::Pending {
                task.transition(TaskStatus::Active, self.clock.now())?;
            }
            let mut task_snapshot = task.clone();

            let dma_results = run_dmas(
                &config,
                self.dma.pdma.as_ref(),
                self.dma.csdma.as_ref(),
                self.dma.dsdma.as_ref(),
                &task_snapshot,
                &thought,
            )
            .await?;

            let outcome = run_cascade(&config, self.dma.aspdma.as_ref(), &task_snapshot, &thought, dma_results).await?;

            let handler_result = self.dispatcher.dispatch(&outcome.selection, &mut task_snapshot, &thought).await?;

            if let Some(task) = guard.task_mut(&task_id) {
                *task = task_snapshot.clone();
            }

            let trace = CompleteTrace {
                trace_id: TraceId(self.clock.new_id("trace")),
                thought_id: thought.thought_id.clone(),
                task_id: task_id.clone(),
                occurrence_id: occurrence_id.to_string(),
                components: TraceComponents {
                    observation: thought.content.clone(),
                    context: serde_json::to_string(&task_snapshot.context).unwrap_or_default(),
                    dma_results: outcome.results.clone(),
                    action: outcome.selection.clone(),
                    conscience: outcome.faculty_verdicts.clone(),
                    outcome: format!("{:?}", handler_result.status),
                },
                recorded_at: self.clock.now(),
            };
            self.audit.append(&trace)?;

            match handler_result.status {
                HandlerStatus::Continued => {
                    if let Some(follow_up) = handler_result.follow_up_thought {
                        guard.push_thought(&task_id, follow_up);
                    }
                }
                HandlerStatus::Deferred | HandlerStatus::Rejected | HandlerStatus::Completed => {
                    guard.retire_if_terminal(&task_id);
                }
            }

            info!(occurrence_id, %task_id, action = %outcome.selection.selected_action, "thought processed");
            processed.push(ProcessedThought { task_id, trace });
        }

        Ok(processed)
    }

    pub fn active_task_count(&self, occurrence_id: &str) -> usize {
        let queue = self.queue_for(occurrence_id);
        queue.value().try_lock().map(|q| q.active_task_count()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::{ActionSelection, ActionVerb, Aspdma, Csdma, DmaEvaluation, DmaResults, Dsdma, Pdma};
    use crate::error::DmaError;
    use crate::graph::{NodeFilter, NodeType};
    use async_trait::async_trait;
    use rand::rngs::OsRng;
    use serde_json::json;

    struct OkEval;
    #[async_trait]
    impl Pdma for OkEval {
        async fn evaluate(&self, _t: &Task, _th: &Thought) -> Result<DmaEvaluation, DmaError> {
            Ok(DmaEvaluation { alignment: 0.9, plausibility: 0.9, domain_fit: 0.9, notes: "ok".into() })
        }
    }
    #[async_trait]
    impl Csdma for OkEval {
        async fn evaluate(&self, _t: &Task, _th: &Thought) -> Result<DmaEvaluation, DmaError> {
            Ok(DmaEvaluation { alignment: 0.9, plausibility: 0.9, domain_fit: 0.9, notes: "ok".into() })
        }
    }
    #[async_trait]
    impl Dsdma for OkEval {
        async fn evaluate(&self, _t: &Task, _th: &Thought) -> Result<DmaEvaluation, DmaError> {
            Ok(DmaEvaluation { alignment: 0.9, plausibility: 0.9, domain_fit: 0.9, notes: "ok".into() })
        }
    }

    struct SpeakThenComplete;
    #[async_trait]
    impl Aspdma for SpeakThenComplete {
        async fn select(
            &self,
            _task: &Task,
            thought: &Thought,
            _results: &DmaResults,
            _feedback: &[String],
        ) -> Result<ActionSelection, DmaError> {
            if thought.depth == 0 {
                Ok(ActionSelection {
                    selected_action: ActionVerb::Speak,
                    action_parameters: json!({"text": "hello", "entropy": 0.05, "coherence": 0.9}),
                    rationale: "greet".to_string(),
                })
            } else {
                Ok(ActionSelection {
                    selected_action: ActionVerb::TaskComplete,
                    action_parameters: json!({}),
                    rationale: "done".to_string(),
                })
            }
        }
    }

    fn dma_providers() -> DmaProviders {
        DmaProviders {
            pdma: Arc::new(OkEval),
            csdma: Arc::new(OkEval),
            dsdma: Arc::new(OkEval),
            aspdma: Arc::new(SpeakThenComplete),
        }
    }

    struct NullComms;
    impl crate::registry::ServiceProvider for NullComms {
        fn provider_id(&self) -> &str {
            "null-comms"
        }
        fn capabilities(&self) -> &[String] {
            &[]
        }
    }
    #[async_trait]
    impl crate::bus::communication::CommunicationProvider for NullComms {
        async fn send_message(&self, _message: crate::bus::communication::OutgoingMessage) -> Result<(), String> {
            Ok(())
        }
        async fn fetch_messages(&self, _channel: &ChannelRef, _limit: usize) -> Result<Vec<crate::bus::communication::InboundMessage>, String> {
            Ok(vec![])
        }
    }

    struct NullWisdom;
    impl crate::registry::ServiceProvider for NullWisdom {
        fn provider_id(&self) -> &str {
            "null-wisdom"
        }
        fn capabilities(&self) -> &[String] {
            &[]
        }
    }
    #[async_trait]
    impl crate::bus::wisdom::WisdomProvider for NullWisdom {
        async fn submit_deferral(&self, _s: crate::bus::wisdom::DeferralSubmission) -> Result<(), String> {
            Ok(())
        }
        async fn poll_deferral(&self, deferral_id: &crate::clock::DeferralId) -> Result<crate::bus::wisdom::DeferralStatus, String> {
            Ok(crate::bus::wisdom::DeferralStatus {
                deferral_id: deferral_id.clone(),
                resolved: false,
                approved: None,
                guidance: None,
            })
        }
        async fn guidance(&self, capability: &str) -> Result<crate::bus::wisdom::WisdomAdvice, String> {
            Ok(crate::bus::wisdom::WisdomAdvice {
                capability: capability.to_string(),
                provider_type: "null".to_string(),
                confidence: 0.0,
                disclaimer: "none".to_string(),
            })
        }
    }

    struct NullTool;
    impl crate::registry::ServiceProvider for NullTool {
        fn provider_id(&self) -> &str {
            "null-tool"
        }
        fn capabilities(&self) -> &[String] {
            &[]
        }
    }
    #[async_trait]
    impl crate::bus::tool::ToolProvider for NullTool {
        async fn invoke(&self, _invocation: crate::bus::tool::ToolInvocation) -> Result<crate::bus::tool::ToolResult, String> {
            Ok(crate::bus::tool::ToolResult { output: json!({}), succeeded: true })
        }
    }

    fn runtime() -> Arc<RuntimeContext> {
        let clock = Clock::new();
        let graph = Arc::new(GraphStore::memory_only(clock));
        let key = SigningKey::generate(&mut OsRng);
        let runtime = RuntimeContext::new(Config::default(), key, dma_providers(), graph).unwrap();
        runtime.communication_bus.register(Arc::new(NullComms), 1);
        runtime.wisdom_bus.register(Arc::new(NullWisdom), 1);
        runtime.tool_bus.register(Arc::new(NullTool), 1);
        runtime
    }

    #[tokio::test]
    async fn happy_path_speak_then_complete_is_audited() {
        let runtime = runtime();
        runtime
            .submit_observation("occA", ChannelRef("api:c1".into()), "hi there")
            .await
            .unwrap();

        let first = runtime.process_round("occA").await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].trace.components.action.selected_action, ActionVerb::Speak);

        let second = runtime.process_round("occA").await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].trace.components.action.selected_action, ActionVerb::TaskComplete);

        assert_eq!(runtime.audit.len(), 2);
        assert!(runtime.audit.verify().is_ok());
        assert_eq!(runtime.active_task_count("occA"), 0);
    }

    #[tokio::test]
    async fn occurrences_progress_independently() {
        let runtime = runtime();
        runtime.submit_observation("occA", ChannelRef("api:c1".into()), "a").await.unwrap();
        runtime.submit_observation("occB", ChannelRef("api:c1".into()), "b").await.unwrap();

        // Drive occA all the way to completion without ever touching occB.
        runtime.process_round("occA").await.unwrap();
        runtime.process_round("occA").await.unwrap();
        assert_eq!(runtime.active_task_count("occA"), 0);

        // occB has never been processed: still active, mid-cascade.
        assert_eq!(runtime.active_task_count("occB"), 1);
        let processed_b = runtime.process_round("occB").await.unwrap();
        assert_eq!(processed_b.len(), 1);
        assert_eq!(processed_b[0].trace.occurrence_id, "occB");
        assert_eq!(processed_b[0].trace.components.action.selected_action, ActionVerb::Speak);

        let results_a = runtime.memory_bus.search("occA", NodeFilter::default()).await.unwrap();
        let results_b = runtime.memory_bus.search("occB", NodeFilter::default()).await.unwrap();
        assert!(results_a.iter().all(|n| n.occurrence_id == "occA"));
        assert!(results_b.iter().all(|n| n.occurrence_id == "occB"));
    }
}
