//! In-memory typed graph store with optional redb-backed durability.
//!
//! Mirrors the teacher engine's tiered-store shape (hot `DashMap` index,
//! optional durable tier) but the unit of storage is a typed [`GraphNode`] /
//! [`GraphEdge`] pair rather than opaque bytes keyed by symbol id.

use std::collections::BTreeSet;
use std::sync::RwLock;

use dashmap::DashMap;
use redb::{Database, ReadableTable, TableDefinition};

use crate::clock::Clock;
use crate::error::GraphError;

use super::{EdgeType, GraphEdge, GraphNode, NodeAttributes, NodeFilter, NodeType, Scope};

pub type GraphResult<T> = std::result::Result<T, GraphError>;

const NODE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");
const EDGE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("edges");

/// Validate that a node's attributes match the schema expected for its type.
///
/// This is intentionally conservative: it only checks the minimal shape each
/// node_type needs to be useful downstream, not a full JSON-schema engine.
fn validate_schema(node_type: NodeType, attrs: &NodeAttributes) -> Result<(), String> {
    match node_type {
        NodeType::Thought | NodeType::Message | NodeType::Context | NodeType::Action => {
            if attrs.text.is_none() {
                return Err(format!("{node_type} nodes require attributes.text"));
            }
        }
        NodeType::Metric => {
            if attrs.numeric_value.is_none() {
                return Err("metric nodes require attributes.numeric_value".to_string());
            }
        }
        NodeType::Audit | NodeType::Config | NodeType::Incident | NodeType::Summary
        | NodeType::Problem | NodeType::Insight => {}
    }
    Ok(())
}

/// A directed edge key: (source, target, edge_type).
type EdgeKey = (String, String, EdgeType);

/// The typed graph store.
///
/// All read operations take an `occurrence_id` and only ever return records
/// stamped with that occurrence — this is what keeps multiple runtime
/// instances sharing one store from seeing each other's work (spec §5).
pub struct GraphStore {
    nodes: DashMap<String, GraphNode>,
    edges: DashMap<EdgeKey, GraphEdge>,
    /// Sorted node ids, used for prefix scans and `previous_in_chain`.
    sorted_ids: RwLock<BTreeSet<String>>,
    durable: Option<Database>,
    clock: Clock,
}

impl GraphStore {
    /// Create an in-memory-only store.
    pub fn memory_only(clock: Clock) -> Self {
        Self {
            nodes: DashMap::new(),
            edges: DashMap::new(),
            sorted_ids: RwLock::new(BTreeSet::new()),
            durable: None,
            clock,
        }
    }

    /// Open (or create) a store backed by a redb file for durability, then
    /// restore any previously persisted nodes/edges into the hot tier.
    pub fn with_persistence(clock: Clock, data_dir: &std::path::Path) -> GraphResult<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| GraphError::Io {
            message: e.to_string(),
        })?;
        let db_path = data_dir.join("ciris-graph.redb");
        let db = Database::create(&db_path).map_err(|e| GraphError::Io {
            message: format!("failed to open redb at {}: {e}", db_path.display()),
        })?;
        let store = Self {
            nodes: DashMap::new(),
            edges: DashMap::new(),
            sorted_ids: RwLock::new(BTreeSet::new()),
            durable: Some(db),
            clock,
        };
        store.restore()?;
        Ok(store)
    }

    fn restore(&self) -> GraphResult<()> {
        let Some(db) = &self.durable else {
            return Ok(());
        };
        let txn = db.begin_read().map_err(|e| GraphError::Io {
            message: e.to_string(),
        })?;
        if let Ok(table) = txn.open_table(NODE_TABLE) {
            for entry in table.iter().map_err(|e| GraphError::Io { message: e.to_string() })? {
                let (_, value) = entry.map_err(|e| GraphError::Io { message: e.to_string() })?;
                let node: GraphNode = bincode::deserialize(value.value()).map_err(|e| {
                    GraphError::Serialization { message: e.to_string() }
                })?;
                self.sorted_ids.write().expect("lock poisoned").insert(node.node_id.clone());
                self.nodes.insert(node.node_id.clone(), node);
            }
        }
        if let Ok(table) = txn.open_table(EDGE_TABLE) {
            for entry in table.iter().map_err(|e| GraphError::Io { message: e.to_string() })? {
                let (_, value) = entry.map_err(|e| GraphError::Io { message: e.to_string() })?;
                let edge: GraphEdge = bincode::deserialize(value.value()).map_err(|e| {
                    GraphError::Serialization { message: e.to_string() }
                })?;
                let key = (edge.source_id.clone(), edge.target_id.clone(), edge.edge_type);
                self.edges.insert(key, edge);
            }
        }
        Ok(())
    }

    fn persist_node(&self, node: &GraphNode) -> GraphResult<()> {
        let Some(db) = &self.durable else {
            return Ok(());
        };
        let encoded = bincode::serialize(node).map_err(|e| GraphError::Serialization {
            message: e.to_string(),
        })?;
        let txn = db.begin_write().map_err(|e| GraphError::Io {
            message: e.to_string(),
        })?;
        {
            let mut table = txn.open_table(NODE_TABLE).map_err(|e| GraphError::Io {
                message: e.to_string(),
            })?;
            table
                .insert(node.node_id.as_str(), encoded.as_slice())
                .map_err(|e| GraphError::Io {
                    message: e.to_string(),
                })?;
        }
        txn.commit().map_err(|e| GraphError::Io {
            message: e.to_string(),
        })
    }

    fn persist_edge(&self, edge: &GraphEdge) -> GraphResult<()> {
        let Some(db) = &self.durable else {
            return Ok(());
        };
        let key = format!("{}\0{}\0{}", edge.source_id, edge.target_id, edge.edge_type);
        let encoded = bincode::serialize(edge).map_err(|e| GraphError::Serialization {
            message: e.to_string(),
        })?;
        let txn = db.begin_write().map_err(|e| GraphError::Io {
            message: e.to_string(),
        })?;
        {
            let mut table = txn.open_table(EDGE_TABLE).map_err(|e| GraphError::Io {
                message: e.to_string(),
            })?;
            table
                .insert(key.as_str(), encoded.as_slice())
                .map_err(|e| GraphError::Io {
                    message: e.to_string(),
                })?;
        }
        txn.commit().map_err(|e| GraphError::Io {
            message: e.to_string(),
        })
    }

    /// Insert a brand-new node. Errors if `node_id` is already taken.
    pub fn put(&self, node: GraphNode) -> GraphResult<()> {
        if self.nodes.contains_key(&node.node_id) {
            return Err(GraphError::DuplicateNode {
                node_id: node.node_id.clone(),
            });
        }
        validate_schema(node.node_type, &node.attributes).map_err(|message| {
            GraphError::SchemaViolation {
                node_type: node.node_type.to_string(),
                message,
            }
        })?;
        self.persist_node(&node)?;
        self.sorted_ids
            .write()
            .expect("lock poisoned")
            .insert(node.node_id.clone());
        self.nodes.insert(node.node_id.clone(), node);
        Ok(())
    }

    /// Update an existing node's attributes under optimistic-version control.
    ///
    /// `expected_version` must match the node's current version; on success
    /// the version is bumped by one and `updated_at` refreshed. This is the
    /// single-writer-per-node-id guarantee from spec §5.
    pub fn update(
        &self,
        node_id: &str,
        expected_version: u64,
        attributes: NodeAttributes,
    ) -> GraphResult<GraphNode> {
        let mut entry = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| GraphError::NodeNotFound {
                node_id: node_id.to_string(),
            })?;
        if entry.version != expected_version {
            return Err(GraphError::VersionConflict {
                node_id: node_id.to_string(),
                expected: expected_version,
                found: entry.version,
            });
        }
        validate_schema(entry.node_type, &attributes).map_err(|message| {
            GraphError::SchemaViolation {
                node_type: entry.node_type.to_string(),
                message,
            }
        })?;
        entry.attributes = attributes;
        entry.version += 1;
        entry.updated_at = self.clock.now();
        let updated = entry.clone();
        drop(entry);
        self.persist_node(&updated)?;
        Ok(updated)
    }

    /// Fetch a node by id, scoped to `occurrence_id`.
    pub fn get(&self, occurrence_id: &str, node_id: &str) -> Option<GraphNode> {
        self.nodes.get(node_id).and_then(|n| {
            if n.occurrence_id == occurrence_id {
                Some(n.clone())
            } else {
                None
            }
        })
    }

    /// Search nodes matching a filter, scoped to `occurrence_id`.
    pub fn search(&self, occurrence_id: &str, filter: &NodeFilter) -> Vec<GraphNode> {
        let mut out: Vec<GraphNode> = self
            .nodes
            .iter()
            .filter(|entry| entry.occurrence_id == occurrence_id)
            .map(|entry| entry.value().clone())
            .filter(|n| filter.node_type.is_none_or(|t| n.node_type == t))
            .filter(|n| filter.scope.is_none_or(|s| n.scope == s))
            .filter(|n| {
                filter
                    .created_after
                    .is_none_or(|after| n.created_at > after)
            })
            .filter(|n| {
                filter
                    .id_prefix
                    .as_ref()
                    .is_none_or(|p| n.node_id.starts_with(p.as_str()))
            })
            .collect();
        out.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        out
    }

    /// Link two existing nodes with a typed edge.
    ///
    /// Endpoints must already exist and share `edge.occurrence_id`; duplicate
    /// (source, target, edge_type) edges are rejected.
    pub fn link(&self, edge: GraphEdge) -> GraphResult<()> {
        let source = self.nodes.get(&edge.source_id).ok_or_else(|| GraphError::MissingEndpoint {
            endpoint: "source".to_string(),
            source_id: edge.source_id.clone(),
            target: edge.target_id.clone(),
        })?;
        let target = self.nodes.get(&edge.target_id).ok_or_else(|| GraphError::MissingEndpoint {
            endpoint: "target".to_string(),
            source_id: edge.source_id.clone(),
            target: edge.target_id.clone(),
        })?;
        debug_assert_eq!(source.occurrence_id, target.occurrence_id);
        drop(source);
        drop(target);

        let key = (edge.source_id.clone(), edge.target_id.clone(), edge.edge_type);
        if self.edges.contains_key(&key) {
            return Err(GraphError::DuplicateEdge {
                source_id: edge.source_id,
                target: edge.target_id,
                edge_type: edge.edge_type.to_string(),
            });
        }
        self.persist_edge(&edge)?;
        self.edges.insert(key, edge);
        Ok(())
    }

    /// Return whether an edge of this exact shape already exists.
    pub fn has_edge(&self, source_id: &str, target_id: &str, edge_type: EdgeType) -> bool {
        self.edges
            .contains_key(&(source_id.to_string(), target_id.to_string(), edge_type))
    }

    /// Critical correctness point: given a prefix `P` and current id `N`,
    /// return the greatest id satisfying `id LIKE P%` AND `id < N`, scoped to
    /// `occurrence_id`. Does not assume fixed sampling intervals — gaps in
    /// the lineage are normal (spec's S6 chain-gap scenario).
    pub fn previous_in_chain(&self, occurrence_id: &str, prefix: &str, current_id: &str) -> Option<String> {
        let ids = self.sorted_ids.read().expect("lock poisoned");
        ids.range(..current_id.to_string())
            .rev()
            .find(|id| {
                id.starts_with(prefix)
                    && self
                        .nodes
                        .get(*id)
                        .is_some_and(|n| n.occurrence_id == occurrence_id)
            })
            .cloned()
    }

    /// Summarize all nodes of `node_type` created within
    /// `[window_start, window_start + window)` into one `Summary` node,
    /// linked via `SUMMARIZES` to every constituent and `TEMPORAL_PREV` /
    /// `TEMPORAL_NEXT` to the previous summary of the same lineage prefix.
    ///
    /// Idempotent: the summary id is deterministic from
    /// `(occurrence_id, lineage_prefix, window_start)`, so re-running over
    /// the same window produces the same summary id and no duplicate edges.
    pub fn consolidate(
        &self,
        occurrence_id: &str,
        lineage_prefix: &str,
        source_node_type: NodeType,
        window_start: chrono::DateTime<chrono::Utc>,
        window: chrono::Duration,
    ) -> GraphResult<String> {
        let window_end = window_start + window;
        let constituents: Vec<GraphNode> = self
            .nodes
            .iter()
            .filter(|e| {
                e.occurrence_id == occurrence_id
                    && e.node_type == source_node_type
                    && e.created_at >= window_start
                    && e.created_at < window_end
            })
            .map(|e| e.value().clone())
            .collect();

        let summary_id = format!(
            "{lineage_prefix}-summary-{}",
            window_start.timestamp()
        );

        if !self.nodes.contains_key(&summary_id) {
            let mut attrs = NodeAttributes::default();
            attrs.text = Some(format!(
                "consolidated {} {} node(s) in window starting {}",
                constituents.len(),
                source_node_type,
                window_start
            ));
            let summary = GraphNode::new(
                summary_id.clone(),
                NodeType::Summary,
                Scope::Environment,
                attrs,
                self.clock.now(),
                occurrence_id,
            );
            self.put(summary)?;
        }

        for constituent in &constituents {
            if !self.has_edge(&summary_id, &constituent.node_id, EdgeType::Summarizes) {
                self.link(GraphEdge {
                    source_id: summary_id.clone(),
                    target_id: constituent.node_id.clone(),
                    edge_type: EdgeType::Summarizes,
                    attributes: serde_json::Value::Null,
                    created_at: self.clock.now(),
                    occurrence_id: occurrence_id.to_string(),
                })?;
            }
        }

        if let Some(prev_id) = self.previous_in_chain(occurrence_id, lineage_prefix, &summary_id) {
            if !self.has_edge(&summary_id, &prev_id, EdgeType::TemporalPrev) {
                self.link(GraphEdge {
                    source_id: summary_id.clone(),
                    target_id: prev_id.clone(),
                    edge_type: EdgeType::TemporalPrev,
                    attributes: serde_json::Value::Null,
                    created_at: self.clock.now(),
                    occurrence_id: occurrence_id.to_string(),
                })?;
            }
            if !self.has_edge(&prev_id, &summary_id, EdgeType::TemporalNext) {
                self.link(GraphEdge {
                    source_id: prev_id,
                    target_id: summary_id.clone(),
                    edge_type: EdgeType::TemporalNext,
                    attributes: serde_json::Value::Null,
                    created_at: self.clock.now(),
                    occurrence_id: occurrence_id.to_string(),
                })?;
            }
        }

        Ok(summary_id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}

/// The in-process default memory provider: adapts [`GraphStore`]'s sync API
/// to the async [`crate::bus::memory::MemoryProvider`] contract so it can be
/// registered on the memory bus like any external provider.
pub struct LocalMemoryProvider {
    pub provider_id: String,
    pub store: std::sync::Arc<GraphStore>,
}

impl crate::registry::ServiceProvider for LocalMemoryProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }
    fn capabilities(&self) -> &[String] {
        &[]
    }
    fn healthy(&self) -> bool {
        true
    }
}

#[async_trait::async_trait]
impl crate::bus::memory::MemoryProvider for LocalMemoryProvider {
    async fn put(&self, node: GraphNode) -> Result<(), String> {
        self.store.put(node).map_err(|e| e.to_string())
    }

    async fn get(&self, occurrence_id: &str, node_id: &str) -> Result<Option<GraphNode>, String> {
        Ok(self.store.get(occurrence_id, node_id))
    }

    async fn search(&self, occurrence_id: &str, filter: NodeFilter) -> Result<Vec<GraphNode>, String> {
        Ok(self.store.search(occurrence_id, &filter))
    }

    async fn link(&self, edge: GraphEdge) -> Result<(), String> {
        self.store.link(edge).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn node(id: &str, t: NodeType, occ: &str, clock: &Clock) -> GraphNode {
        let mut attrs = NodeAttributes::default();
        attrs.text = Some("x".to_string());
        GraphNode::new(id, t, Scope::Local, attrs, clock.now(), occ)
    }

    #[test]
    fn put_rejects_duplicate_id() {
        let clock = Clock::new();
        let store = GraphStore::memory_only(clock.clone());
        store.put(node("n1", NodeType::Thought, "occA", &clock)).unwrap();
        let err = store.put(node("n1", NodeType::Thought, "occA", &clock));
        assert!(matches!(err, Err(GraphError::DuplicateNode { .. })));
    }

    #[test]
    fn search_scopes_by_prefix() {
        let clock = Clock::new();
        let store = GraphStore::memory_only(clock.clone());
        store.put(node("thought-1", NodeType::Thought, "occA", &clock)).unwrap();
        store.put(node("message-1", NodeType::Message, "occA", &clock)).unwrap();
        let filter = NodeFilter {
            id_prefix: Some("thought-".to_string()),
            ..Default::default()
        };
        let results = store.search("occA", &filter);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].node_id, "thought-1");
    }

    #[test]
    fn occurrence_isolation() {
        let clock = Clock::new();
        let store = GraphStore::memory_only(clock.clone());
        store.put(node("n1", NodeType::Thought, "occA", &clock)).unwrap();
        store.put(node("n2", NodeType::Thought, "occB", &clock)).unwrap();
        let results = store.search("occA", &NodeFilter::default());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].node_id, "n1");
        assert!(store.get("occB", "n1").is_none());
    }

    #[test]
    fn previous_in_chain_skips_gaps() {
        let clock = Clock::new();
        let store = GraphStore::memory_only(clock.clone());
        for day in ["d1", "d3", "d9"] {
            store
                .put(node(&format!("summary-{day}"), NodeType::Summary, "occA", &clock))
                .unwrap();
        }
        let prev = store.previous_in_chain("occA", "summary-", "summary-d17");
        assert_eq!(prev, Some("summary-d9".to_string()));
    }

    #[test]
    fn previous_in_chain_respects_occurrence() {
        let clock = Clock::new();
        let store = GraphStore::memory_only(clock.clone());
        store.put(node("summary-d1", NodeType::Summary, "occA", &clock)).unwrap();
        store.put(node("summary-d2", NodeType::Summary, "occB", &clock)).unwrap();
        let prev = store.previous_in_chain("occA", "summary-", "summary-d9");
        assert_eq!(prev, Some("summary-d1".to_string()));
    }

    #[test]
    fn link_rejects_missing_endpoint() {
        let clock = Clock::new();
        let store = GraphStore::memory_only(clock.clone());
        store.put(node("n1", NodeType::Thought, "occA", &clock)).unwrap();
        let err = store.link(GraphEdge {
            source_id: "n1".to_string(),
            target_id: "missing".to_string(),
            edge_type: EdgeType::Follows,
            attributes: serde_json::Value::Null,
            created_at: clock.now(),
            occurrence_id: "occA".to_string(),
        });
        assert!(matches!(err, Err(GraphError::MissingEndpoint { .. })));
    }

    #[test]
    fn link_rejects_duplicate_edge() {
        let clock = Clock::new();
        let store = GraphStore::memory_only(clock.clone());
        store.put(node("n1", NodeType::Thought, "occA", &clock)).unwrap();
        store.put(node("n2", NodeType::Thought, "occA", &clock)).unwrap();
        let edge = GraphEdge {
            source_id: "n1".to_string(),
            target_id: "n2".to_string(),
            edge_type: EdgeType::Follows,
            attributes: serde_json::Value::Null,
            created_at: clock.now(),
            occurrence_id: "occA".to_string(),
        };
        store.link(edge.clone()).unwrap();
        let err = store.link(edge);
        assert!(matches!(err, Err(GraphError::DuplicateEdge { .. })));
    }

    #[test]
    fn consolidate_is_idempotent() {
        let clock = Clock::new();
        let store = GraphStore::memory_only(clock.clone());
        let window_start = clock.now() - ChronoDuration::hours(1);
        store.put(node("thought-1", NodeType::Thought, "occA", &clock)).unwrap();
        store.put(node("thought-2", NodeType::Thought, "occA", &clock)).unwrap();

        let window = ChronoDuration::hours(2);
        let first = store
            .consolidate("occA", "summary-", NodeType::Thought, window_start, window)
            .unwrap();
        let nodes_after_first = store.node_count();
        let edges_after_first = store.edge_count();

        let second = store
            .consolidate("occA", "summary-", NodeType::Thought, window_start, window)
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(store.node_count(), nodes_after_first);
        assert_eq!(store.edge_count(), edges_after_first);
    }

    #[test]
    fn update_requires_matching_version() {
        let clock = Clock::new();
        let store = GraphStore::memory_only(clock.clone());
        store.put(node("n1", NodeType::Thought, "occA", &clock)).unwrap();
        let mut attrs = NodeAttributes::default();
        attrs.text = Some("updated".to_string());
        let err = store.update("n1", 99, attrs.clone());
        assert!(matches!(err, Err(GraphError::VersionConflict { .. })));
        let updated = store.update("n1", 1, attrs).unwrap();
        assert_eq!(updated.version, 2);
    }

    #[test]
    fn schema_violation_rejected() {
        let clock = Clock::new();
        let store = GraphStore::memory_only(clock.clone());
        let bad = GraphNode::new(
            "n1",
            NodeType::Thought,
            Scope::Local,
            NodeAttributes::default(),
            clock.now(),
            "occA",
        );
        let err = store.put(bad);
        assert!(matches!(err, Err(GraphError::SchemaViolation { .. })));
    }
}
