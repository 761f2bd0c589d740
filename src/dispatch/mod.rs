//! Action dispatcher: one handler per verb, sharing a common contract
//! (spec §4.7). Structural analog of the teacher's `ReasonerRegistry` bid
//! dispatch (`dispatch/mod.rs`) — there, many reasoners bid and the
//! highest bid wins; here, ASPDMA has already chosen the verb and this
//! module only routes to its handler.

use std::sync::Arc;

use dashmap::DashSet;
use serde_json::json;
use tracing::info;

use crate::bus::communication::{CommunicationBus, OutgoingMessage};
use crate::bus::memory::MemoryBus;
use crate::bus::tool::{ToolBus, ToolInvocation};
use crate::bus::wisdom::{DeferralSubmission, WisdomBus};
use crate::clock::{Clock, DeferralId, ThoughtId};
use crate::dma::{ActionSelection, ActionVerb};
use crate::error::DispatchError;
use crate::graph::{GraphNode, NodeAttributes, NodeFilter, NodeType, Scope};
use crate::task::{Task, TaskStatus};
use crate::thought::Thought;

/// Outcome of one verb's handler (spec §4.7 common contract).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerStatus {
    /// Non-terminal: a follow-up thought was (or will be) enqueued.
    Continued,
    Deferred,
    Rejected,
    Completed,
}

#[derive(Debug, Clone)]
pub struct HandlerResult {
    pub status: HandlerStatus,
    pub follow_up_thought: Option<Thought>,
    pub side_effects: Vec<String>,
}

/// Routes an [`ActionSelection`] to its verb handler and applies the
/// resulting task-status transition.
pub struct Dispatcher {
    memory: Arc<MemoryBus>,
    wisdom: Arc<WisdomBus>,
    tool: Arc<ToolBus>,
    communication: Arc<CommunicationBus>,
    clock: Clock,
    /// Correlation ids already executed, for crash-recovery idempotency
    /// (spec §4.7: handlers must skip side effects already logged).
    completed_correlations: DashSet<String>,
}

impl Dispatcher {
    pub fn new(
        memory: Arc<MemoryBus>,
        wisdom: Arc<WisdomBus>,
        tool: Arc<ToolBus>,
        communication: Arc<CommunicationBus>,
        clock: Clock,
    ) -> Self {
        Self {
            memory,
            wisdom,
            tool,
            communication,
            clock,
            completed_correlations: DashSet::new(),
        }
    }

    fn correlation_id(&self, thought: &Thought) -> String {
        format!("{}-{}", thought.thought_id, thought.depth)
    }

    pub async fn dispatch(
        &self,
        selection: &ActionSelection,
        task: &mut Task,
        thought: &Thought,
    ) -> Result<HandlerResult, DispatchError> {
        let correlation_id = self.correlation_id(thought);
        if self.completed_correlations.contains(&correlation_id) {
            info!(correlation_id, "skipping already-completed handler (crash-recovery idempotency)");
            return Ok(HandlerResult {
                status: HandlerStatus::Continued,
                follow_up_thought: None,
                side_effects: vec!["skipped: already completed".to_string()],
            });
        }

        let now = self.clock.now();
        let result = match selection.selected_action {
            ActionVerb::Speak => self.handle_speak(selection, task, thought).await,
            ActionVerb::Tool => self.handle_tool(selection, task, thought).await,
            ActionVerb::Observe => self.handle_observe(selection, task, thought).await,
            ActionVerb::Memorize => self.handle_memorize(selection, task, thought).await,
            ActionVerb::Recall => self.handle_recall(selection, task, thought).await,
            ActionVerb::Forget => self.handle_forget(selection, task, thought).await,
            ActionVerb::Ponder => self.handle_ponder(selection, task, thought),
            ActionVerb::Defer => self.handle_defer(selection, task, thought, now).await,
            ActionVerb::Reject => self.handle_reject(selection, task, now),
            ActionVerb::TaskComplete => self.handle_task_complete(task, now),
        }?;

        self.completed_correlations.insert(correlation_id);
        Ok(result)
    }

    async fn handle_speak(
        &self,
        selection: &ActionSelection,
        task: &mut Task,
        thought: &Thought,
    ) -> Result<HandlerResult, DispatchError> {
        let text = selection
            .action_parameters
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        self.communication
            .send_message(OutgoingMessage {
                channel: task.channel.clone(),
                text: text.clone(),
                correlation_id: self.correlation_id(thought),
            })
            .await
            .map_err(|e| DispatchError::HandlerFailed {
                verb: "SPEAK".to_string(),
                message: e.to_string(),
            })?;
        let follow_up = thought.follow_up(
            ThoughtId(self.clock.new_id("th")),
            format!("SPEAK_SUCCESSFUL: {text}"),
            self.clock.now(),
        );
        Ok(HandlerResult {
            status: HandlerStatus::Continued,
            follow_up_thought: Some(follow_up),
            side_effects: vec![format!("sent message to {}", task.channel)],
        })
    }

    async fn handle_tool(
        &self,
        selection: &ActionSelection,
        _task: &mut Task,
        thought: &Thought,
    ) -> Result<HandlerResult, DispatchError> {
        let tool_name = selection
            .action_parameters
            .get("tool_name")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let result = self
            .tool
            .invoke(ToolInvocation {
                tool_name: tool_name.clone(),
                parameters: selection.action_parameters.clone(),
                correlation_id: self.correlation_id(thought),
            })
            .await
            .map_err(|e| DispatchError::HandlerFailed {
                verb: "TOOL".to_string(),
                message: e.to_string(),
            })?;
        let follow_up = thought.follow_up(
            ThoughtId(self.clock.new_id("th")),
            format!("TOOL_RESULT[{tool_name}]: {}", result.output),
            self.clock.now(),
        );
        Ok(HandlerResult {
            status: HandlerStatus::Continued,
            follow_up_thought: Some(follow_up),
            side_effects: vec![format!("invoked tool {tool_name}")],
        })
    }

    async fn handle_observe(
        &self,
        _selection: &ActionSelection,
        task: &mut Task,
        thought: &Thought,
    ) -> Result<HandlerResult, DispatchError> {
        let messages = self
            .communication
            .fetch_messages(&task.channel, 20)
            .await
            .map_err(|e| DispatchError::HandlerFailed {
                verb: "OBSERVE".to_string(),
                message: e.to_string(),
            })?;
        let follow_up = thought.follow_up(
            ThoughtId(self.clock.new_id("th")),
            format!("OBSERVED {} message(s)", messages.len()),
            self.clock.now(),
        );
        Ok(HandlerResult {
            status: HandlerStatus::Continued,
            follow_up_thought: Some(follow_up),
            side_effects: vec![format!("fetched {} messages", messages.len())],
        })
    }

    async fn handle_memorize(
        &self,
        selection: &ActionSelection,
        task: &mut Task,
        thought: &Thought,
    ) -> Result<HandlerResult, DispatchError> {
        let node_id = self.clock.new_id("memorize");
        let mut attrs = NodeAttributes {
            task_id: Some(task.task_id.to_string()),
            thought_id: Some(thought.thought_id.to_string()),
            ..Default::default()
        };
        attrs.text = selection
            .action_parameters
            .get("text")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .or(Some(String::new()));
        let node = GraphNode::new(node_id.clone(), NodeType::Context, Scope::Local, attrs, self.clock.now(), task.occurrence_id.clone());
        self.memory.put(node).await.map_err(|e| DispatchError::HandlerFailed {
            verb: "MEMORIZE".to_string(),
            message: e.to_string(),
        })?;
        let follow_up = thought.follow_up(ThoughtId(self.clock.new_id("th")), format!("MEMORIZED {node_id}"), self.clock.now());
        Ok(HandlerResult {
            status: HandlerStatus::Continued,
            follow_up_thought: Some(follow_up),
            side_effects: vec![format!("memorized node {node_id}")],
        })
    }

    async fn handle_recall(
        &self,
        selection: &ActionSelection,
        task: &mut Task,
        thought: &Thought,
    ) -> Result<HandlerResult, DispatchError> {
        let prefix = selection.action_parameters.get("id_prefix").and_then(|v| v.as_str()).map(|s| s.to_string());
        let filter = NodeFilter {
            id_prefix: prefix,
            limit: Some(20),
            ..Default::default()
        };
        let results = self
            .memory
            .search(&task.occurrence_id, filter)
            .await
            .map_err(|e| DispatchError::HandlerFailed {
                verb: "RECALL".to_string(),
                message: e.to_string(),
            })?;
        let follow_up = thought.follow_up(
            ThoughtId(self.clock.new_id("th")),
            format!("RECALLED {} node(s)", results.len()),
            self.clock.now(),
        );
        Ok(HandlerResult {
            status: HandlerStatus::Continued,
            follow_up_thought: Some(follow_up),
            side_effects: vec![format!("recalled {} nodes", results.len())],
        })
    }

    async fn handle_forget(
        &self,
        selection: &ActionSelection,
        task: &mut Task,
        thought: &Thought,
    ) -> Result<HandlerResult, DispatchError> {
        let node_id = selection
            .action_parameters
            .get("node_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DispatchError::Validation {
                message: "FORGET requires action_parameters.node_id".to_string(),
            })?
            .to_string();
        if let Some(existing) = self.memory.get(&task.occurrence_id, &node_id).await.map_err(|e| {
            DispatchError::HandlerFailed {
                verb: "FORGET".to_string(),
                message: e.to_string(),
            }
        })? {
            let mut attrs = existing.attributes.clone();
            attrs.extra = json!({ "forgotten": true });
            self.memory
                .put(GraphNode {
                    node_id: format!("{node_id}-forgotten-{}", self.clock.tick()),
                    node_type: NodeType::Audit,
                    scope: existing.scope,
                    attributes: attrs,
                    created_at: self.clock.now(),
                    updated_at: self.clock.now(),
                    version: 1,
                    occurrence_id: task.occurrence_id.clone(),
                })
                .await
                .map_err(|e| DispatchError::HandlerFailed {
                    verb: "FORGET".to_string(),
                    message: e.to_string(),
                })?;
        }
        let follow_up = thought.follow_up(ThoughtId(self.clock.new_id("th")), format!("FORGOT {node_id}"), self.clock.now());
        Ok(HandlerResult {
            status: HandlerStatus::Continued,
            follow_up_thought: Some(follow_up),
            side_effects: vec![format!("forgot node {node_id}")],
        })
    }

    fn handle_ponder(
        &self,
        selection: &ActionSelection,
        _task: &mut Task,
        thought: &Thought,
    ) -> Result<HandlerResult, DispatchError> {
        let questions: Vec<String> = selection
            .action_parameters
            .get("questions")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|q| q.as_str().map(str::to_string)).collect())
            .unwrap_or_else(|| vec!["what additional context would clarify this?".to_string()]);
        let mut follow_up = thought.follow_up(
            ThoughtId(self.clock.new_id("th")),
            format!("PONDER: {}", questions.join(" | ")),
            self.clock.now(),
        );
        follow_up.ponder_notes = questions.clone();
        Ok(HandlerResult {
            status: HandlerStatus::Continued,
            follow_up_thought: Some(follow_up),
            side_effects: vec![format!("raised {} clarifying question(s)", questions.len())],
        })
    }

    async fn handle_defer(
        &self,
        selection: &ActionSelection,
        task: &mut Task,
        thought: &Thought,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<HandlerResult, DispatchError> {
        let reason = selection
            .action_parameters
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("deferred for authority review")
            .to_string();
        self.wisdom
            .submit_deferral(DeferralSubmission {
                deferral_id: DeferralId(self.clock.new_id("deferral")),
                task_id: task.task_id.to_string(),
                thought_id: thought.thought_id.to_string(),
                reason: reason.clone(),
            })
            .await
            .map_err(|e| DispatchError::HandlerFailed {
                verb: "DEFER".to_string(),
                message: e.to_string(),
            })?;
        task.transition(TaskStatus::Deferred, now)
            .map_err(|e| DispatchError::Validation { message: e.to_string() })?;
        Ok(HandlerResult {
            status: HandlerStatus::Deferred,
            follow_up_thought: None,
            side_effects: vec![format!("deferred: {reason}")],
        })
    }

    fn handle_reject(&self, selection: &ActionSelection, task: &mut Task, now: chrono::DateTime<chrono::Utc>) -> Result<HandlerResult, DispatchError> {
        let reason = selection
            .action_parameters
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("request rejected")
            .to_string();
        task.transition(TaskStatus::Rejected, now)
            .map_err(|e| DispatchError::Validation { message: e.to_string() })?;
        Ok(HandlerResult {
            status: HandlerStatus::Rejected,
            follow_up_thought: None,
            side_effects: vec![format!("rejected: {reason}")],
        })
    }

    fn handle_task_complete(&self, task: &mut Task, now: chrono::DateTime<chrono::Utc>) -> Result<HandlerResult, DispatchError> {
        task.transition(TaskStatus::Completed, now)
            .map_err(|e| DispatchError::Validation { message: e.to_string() })?;
        Ok(HandlerResult {
            status: HandlerStatus::Completed,
            follow_up_thought: None,
            side_effects: vec!["task completed".to_string()],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::communication::InboundMessage;
    use crate::bus::memory::MemoryProvider;
    use crate::bus::tool::ToolResult;
    use crate::bus::wisdom::{DeferralStatus, WisdomAdvice};
    use crate::clock::TaskId;
    use crate::graph::NodeFilter as Filter;
    use crate::registry::{ServiceProvider, ServiceRegistry};
    use crate::task::ChannelRef;
    use async_trait::async_trait;
    use std::time::Duration;

    struct StubMemory;
    impl ServiceProvider for StubMemory {
        fn provider_id(&self) -> &str {
            "stub-memory"
        }
        fn capabilities(&self) -> &[String] {
            &[]
        }
    }
    #[async_trait]
    impl MemoryProvider for StubMemory {
        async fn put(&self, _node: GraphNode) -> Result<(), String> {
            Ok(())
        }
        async fn get(&self, _occ: &str, _id: &str) -> Result<Option<GraphNode>, String> {
            Ok(None)
        }
        async fn search(&self, _occ: &str, _filter: Filter) -> Result<Vec<GraphNode>, String> {
            Ok(vec![])
        }
        async fn link(&self, _edge: crate::graph::GraphEdge) -> Result<(), String> {
            Ok(())
        }
    }

    struct StubCommunication;
    impl ServiceProvider for StubCommunication {
        fn provider_id(&self) -> &str {
            "stub-comm"
        }
        fn capabilities(&self) -> &[String] {
            &[]
        }
    }
    #[async_trait]
    impl crate::bus::communication::CommunicationProvider for StubCommunication {
        async fn send_message(&self, _message: OutgoingMessage) -> Result<(), String> {
            Ok(())
        }
        async fn fetch_messages(&self, _channel: &ChannelRef, _limit: usize) -> Result<Vec<InboundMessage>, String> {
            Ok(vec![])
        }
    }

    struct StubWisdom;
    impl ServiceProvider for StubWisdom {
        fn provider_id(&self) -> &str {
            "stub-wisdom"
        }
        fn capabilities(&self) -> &[String] {
            &[]
        }
    }
    #[async_trait]
    impl crate::bus::wisdom::WisdomProvider for StubWisdom {
        async fn submit_deferral(&self, _s: DeferralSubmission) -> Result<(), String> {
            Ok(())
        }
        async fn poll_deferral(&self, deferral_id: &DeferralId) -> Result<DeferralStatus, String> {
            Ok(DeferralStatus {
                deferral_id: deferral_id.clone(),
                resolved: false,
                approved: None,
                guidance: None,
            })
        }
        async fn guidance(&self, capability: &str) -> Result<WisdomAdvice, String> {
            Ok(WisdomAdvice {
                capability: capability.to_string(),
                provider_type: "stub".to_string(),
                confidence: 0.5,
                disclaimer: "stub guidance".to_string(),
            })
        }
    }

    struct StubTool;
    impl ServiceProvider for StubTool {
        fn provider_id(&self) -> &str {
            "stub-tool"
        }
        fn capabilities(&self) -> &[String] {
            &[]
        }
    }
    #[async_trait]
    impl crate::bus::tool::ToolProvider for StubTool {
        async fn invoke(&self, _invocation: crate::bus::tool::ToolInvocation) -> Result<ToolResult, String> {
            Ok(ToolResult {
                output: json!({"ok": true}),
                succeeded: true,
            })
        }
    }

    fn dispatcher() -> Dispatcher {
        let timeout = Duration::from_secs(5);
        let memory = Arc::new(MemoryBus::new(Arc::new(ServiceRegistry::new(3, Duration::from_secs(60))), timeout));
        memory.register(Arc::new(StubMemory), 1);
        let wisdom = Arc::new(WisdomBus::new(Arc::new(ServiceRegistry::new(3, Duration::from_secs(60))), timeout));
        wisdom.register(Arc::new(StubWisdom), 1);
        let tool = Arc::new(ToolBus::new(Arc::new(ServiceRegistry::new(3, Duration::from_secs(60))), timeout));
        tool.register(Arc::new(StubTool), 1);
        let communication = Arc::new(CommunicationBus::new(Arc::new(ServiceRegistry::new(3, Duration::from_secs(60))), timeout));
        communication.register(Arc::new(StubCommunication), 1);
        Dispatcher::new(memory, wisdom, tool, communication, Clock::new())
    }

    fn task() -> Task {
        Task::new(TaskId("t1".into()), "occ-a", ChannelRef("api:c1".into()), chrono::Utc::now())
    }

    fn thought() -> Thought {
        Thought::initial(ThoughtId("th1".into()), TaskId("t1".into()), "hi", chrono::Utc::now())
    }

    #[tokio::test]
    async fn speak_produces_follow_up_thought_at_depth_plus_one() {
        let d = dispatcher();
        let mut t = task();
        let selection = ActionSelection {
            selected_action: ActionVerb::Speak,
            action_parameters: json!({"text": "hi there"}),
            rationale: "r".to_string(),
        };
        let result = d.dispatch(&selection, &mut t, &thought()).await.unwrap();
        assert_eq!(result.status, HandlerStatus::Continued);
        assert_eq!(result.follow_up_thought.unwrap().depth, 1);
    }

    #[tokio::test]
    async fn task_complete_transitions_task_and_has_no_follow_up() {
        let d = dispatcher();
        let mut t = task();
        t.transition(TaskStatus::Active, chrono::Utc::now()).unwrap();
        let selection = ActionSelection {
            selected_action: ActionVerb::TaskComplete,
            action_parameters: json!({}),
            rationale: "done".to_string(),
        };
        let result = d.dispatch(&selection, &mut t, &thought()).await.unwrap();
        assert_eq!(result.status, HandlerStatus::Completed);
        assert!(result.follow_up_thought.is_none());
        assert_eq!(t.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn defer_creates_no_follow_up_and_marks_task_deferred() {
        let d = dispatcher();
        let mut t = task();
        t.transition(TaskStatus::Active, chrono::Utc::now()).unwrap();
        let selection = ActionSelection {
            selected_action: ActionVerb::Defer,
            action_parameters: json!({"reason": "needs authority"}),
            rationale: "r".to_string(),
        };
        let result = d.dispatch(&selection, &mut t, &thought()).await.unwrap();
        assert_eq!(result.status, HandlerStatus::Deferred);
        assert_eq!(t.status, TaskStatus::Deferred);
    }

    #[tokio::test]
    async fn repeated_correlation_id_is_skipped_idempotently() {
        let d = dispatcher();
        let mut t = task();
        let th = thought();
        let selection = ActionSelection {
            selected_action: ActionVerb::Ponder,
            action_parameters: json!({"questions": ["why?"]}),
            rationale: "r".to_string(),
        };
        let first = d.dispatch(&selection, &mut t, &th).await.unwrap();
        let second = d.dispatch(&selection, &mut t, &th).await.unwrap();
        assert!(first.follow_up_thought.is_some());
        assert!(second.side_effects[0].contains("already completed"));
    }
}
