//! Dream-cycle incident analysis: group incident nodes by similarity,
//! source component, and time bucket; emit problem + insight nodes for
//! groups that cross the configured thresholds.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::clock::Clock;
use crate::error::GraphError;
use crate::graph::store::GraphStore;
use crate::graph::{GraphNode, NodeAttributes, NodeFilter, NodeType, Scope};

const SIMILARITY_THRESHOLD: usize = 3;
const COMPONENT_THRESHOLD: usize = 5;
const TIME_BUCKET_THRESHOLD: usize = 5;
const TIME_BUCKET_MINUTES: i64 = 5;

/// First 3 whitespace tokens of an incident's text, used as a cheap
/// similarity key (spec §4.8 groups "by similarity of first tokens").
fn similarity_key(text: &str) -> String {
    text.split_whitespace().take(3).collect::<Vec<_>>().join(" ")
}

fn time_bucket(at: DateTime<Utc>) -> i64 {
    at.timestamp() / (TIME_BUCKET_MINUTES * 60)
}

struct Incident {
    node_id: String,
    component: String,
    text: String,
    occurred_at: DateTime<Utc>,
}

fn load_incidents(store: &GraphStore, occurrence_id: &str, window_start: DateTime<Utc>) -> Vec<Incident> {
    let filter = NodeFilter {
        node_type: Some(NodeType::Incident),
        created_after: Some(window_start),
        ..Default::default()
    };
    store
        .search(occurrence_id, &filter)
        .into_iter()
        .map(|n| Incident {
            node_id: n.node_id,
            component: n.attributes.labels.first().cloned().unwrap_or_else(|| "unknown".to_string()),
            text: n.attributes.text.unwrap_or_default(),
            occurred_at: n.created_at,
        })
        .collect()
}

fn group_by<K, F>(incidents: &[Incident], key_fn: F) -> HashMap<K, Vec<&Incident>>
where
    K: std::hash::Hash + Eq,
    F: Fn(&Incident) -> K,
{
    let mut groups: HashMap<K, Vec<&Incident>> = HashMap::new();
    for incident in incidents {
        groups.entry(key_fn(incident)).or_default().push(incident);
    }
    groups
}

/// Run incident analysis over `[now - window, now)`, writing typed
/// `problem`/`insight` [`GraphNode`]s for every group crossing its
/// threshold. Returns the ids of the problem nodes created.
pub fn analyze(
    store: &GraphStore,
    clock: &Clock,
    occurrence_id: &str,
    window: Duration,
) -> Result<Vec<String>, GraphError> {
    let now = clock.now();
    let window_start = now - window;
    let incidents = load_incidents(store, occurrence_id, window_start);
    let mut problem_ids = Vec::new();

    let by_similarity = group_by(&incidents, |i| similarity_key(&i.text));
    for (key, group) in by_similarity {
        if group.len() >= SIMILARITY_THRESHOLD {
            problem_ids.push(emit_problem_and_insight(
                store,
                clock,
                occurrence_id,
                "similarity",
                &key,
                &group,
            )?);
        }
    }

    let by_component = group_by(&incidents, |i| i.component.clone());
    for (key, group) in by_component {
        if group.len() >= COMPONENT_THRESHOLD {
            problem_ids.push(emit_problem_and_insight(
                store,
                clock,
                occurrence_id,
                "component",
                &key,
                &group,
            )?);
        }
    }

    let by_time_bucket = group_by(&incidents, |i| time_bucket(i.occurred_at));
    for (key, group) in by_time_bucket {
        if group.len() >= TIME_BUCKET_THRESHOLD {
            problem_ids.push(emit_problem_and_insight(
                store,
                clock,
                occurrence_id,
                "time_bucket",
                &key.to_string(),
                &group,
            )?);
        }
    }

    Ok(problem_ids)
}

fn emit_problem_and_insight(
    store: &GraphStore,
    clock: &Clock,
    occurrence_id: &str,
    grouping: &str,
    key: &str,
    group: &[&Incident],
) -> Result<String, GraphError> {
    let problem_id = clock.new_id("problem");
    let mut attrs = NodeAttributes {
        text: Some(format!(
            "{} incident(s) grouped by {grouping} ({key})",
            group.len()
        )),
        labels: vec![grouping.to_string()],
        ..Default::default()
    };
    attrs.numeric_value = Some(group.len() as f64);
    let problem = GraphNode::new(problem_id.clone(), NodeType::Problem, Scope::Environment, attrs, clock.now(), occurrence_id);
    store.put(problem)?;

    for incident in group {
        if !store.has_edge(&problem_id, &incident.node_id, crate::graph::EdgeType::RelatedTo) {
            store.link(crate::graph::GraphEdge {
                source_id: problem_id.clone(),
                target_id: incident.node_id.clone(),
                edge_type: crate::graph::EdgeType::RelatedTo,
                attributes: serde_json::Value::Null,
                created_at: clock.now(),
                occurrence_id: occurrence_id.to_string(),
            })?;
        }
    }

    let insight_id = clock.new_id("insight");
    let insight_attrs = NodeAttributes {
        text: Some(format!(
            "recommend investigating recurring {grouping} pattern ({key}); {} occurrence(s) in window",
            group.len()
        )),
        labels: vec![grouping.to_string()],
        ..Default::default()
    };
    let insight = GraphNode::new(insight_id.clone(), NodeType::Insight, Scope::Environment, insight_attrs, clock.now(), occurrence_id);
    store.put(insight)?;
    if !store.has_edge(&insight_id, &problem_id, crate::graph::EdgeType::TriggeredBy) {
        store.link(crate::graph::GraphEdge {
            source_id: insight_id,
            target_id: problem_id.clone(),
            edge_type: crate::graph::EdgeType::TriggeredBy,
            attributes: serde_json::Value::Null,
            created_at: clock.now(),
            occurrence_id: occurrence_id.to_string(),
        })?;
    }

    Ok(problem_id)
}
