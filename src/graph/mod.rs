//! Typed graph memory substrate.
//!
//! Identity-is-the-graph: thought, message, context, action, metric, audit,
//! config, incident, and summary records are all typed [`GraphNode`]s linked
//! by typed [`GraphEdge`]s. The in-memory index lives in [`store`]; both use
//! the same node/edge data model so a durable backend can be swapped in
//! without touching call sites (the durable collaborator itself is external
//! per spec — see `store::GraphStore::persist`/`restore` for the redb tier).

pub mod store;

use serde::{Deserialize, Serialize};

/// Classification of a graph node's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    Thought,
    Message,
    Context,
    Action,
    Metric,
    Audit,
    Config,
    Incident,
    Summary,
    Problem,
    Insight,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeType::Thought => "thought",
            NodeType::Message => "message",
            NodeType::Context => "context",
            NodeType::Action => "action",
            NodeType::Metric => "metric",
            NodeType::Audit => "audit",
            NodeType::Config => "config",
            NodeType::Incident => "incident",
            NodeType::Summary => "summary",
            NodeType::Problem => "problem",
            NodeType::Insight => "insight",
        };
        write!(f, "{s}")
    }
}

/// Visibility/authority tier of a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    Local,
    Environment,
    Identity,
}

/// Typed attribute payload for a node — never a free-form bag.
///
/// Each [`NodeType`] is expected to populate the subset of fields that make
/// sense for it; [`store::GraphStore::put`] validates this mapping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeAttributes {
    pub text: Option<String>,
    pub task_id: Option<String>,
    pub thought_id: Option<String>,
    pub numeric_value: Option<f64>,
    pub labels: Vec<String>,
    pub extra: serde_json::Value,
}

/// A node in the typed graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub node_id: String,
    pub node_type: NodeType,
    pub scope: Scope,
    pub attributes: NodeAttributes,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub version: u64,
    pub occurrence_id: String,
}

impl GraphNode {
    pub fn new(
        node_id: impl Into<String>,
        node_type: NodeType,
        scope: Scope,
        attributes: NodeAttributes,
        now: chrono::DateTime<chrono::Utc>,
        occurrence_id: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            node_type,
            scope,
            attributes,
            created_at: now,
            updated_at: now,
            version: 1,
            occurrence_id: occurrence_id.into(),
        }
    }
}

/// The relationship a [`GraphEdge`] encodes between two nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeType {
    Follows,
    RespondsTo,
    TriggeredBy,
    RelatedTo,
    MeasuredBy,
    TemporalNext,
    TemporalPrev,
    Summarizes,
}

impl std::fmt::Display for EdgeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EdgeType::Follows => "FOLLOWS",
            EdgeType::RespondsTo => "RESPONDS_TO",
            EdgeType::TriggeredBy => "TRIGGERED_BY",
            EdgeType::RelatedTo => "RELATED_TO",
            EdgeType::MeasuredBy => "MEASURED_BY",
            EdgeType::TemporalNext => "TEMPORAL_NEXT",
            EdgeType::TemporalPrev => "TEMPORAL_PREV",
            EdgeType::Summarizes => "SUMMARIZES",
        };
        write!(f, "{s}")
    }
}

/// An edge in the typed graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source_id: String,
    pub target_id: String,
    pub edge_type: EdgeType,
    pub attributes: serde_json::Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub occurrence_id: String,
}

/// Query filter for [`store::GraphStore::search`].
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub node_type: Option<NodeType>,
    pub scope: Option<Scope>,
    pub created_after: Option<chrono::DateTime<chrono::Utc>>,
    pub id_prefix: Option<String>,
    pub limit: Option<usize>,
}
