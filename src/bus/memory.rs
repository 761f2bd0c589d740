//! Memory bus: typed graph operations routed to one of many memory
//! providers (in-process [`crate::graph::store::GraphStore`] being the
//! default, but any conforming provider may be registered).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::bus::invoke_with_fallback;
use crate::error::BusError;
use crate::graph::{GraphEdge, GraphNode, NodeFilter};
use crate::registry::{ServiceKind, ServiceProvider, ServiceRegistry};

/// Contract a memory provider must implement, on top of [`ServiceProvider`].
#[async_trait]
pub trait MemoryProvider: ServiceProvider {
    async fn put(&self, node: GraphNode) -> Result<(), String>;
    async fn get(&self, occurrence_id: &str, node_id: &str) -> Result<Option<GraphNode>, String>;
    async fn search(&self, occurrence_id: &str, filter: NodeFilter) -> Result<Vec<GraphNode>, String>;
    async fn link(&self, edge: GraphEdge) -> Result<(), String>;
}

pub struct MemoryBus {
    registry: Arc<ServiceRegistry>,
    providers: DashMap<String, Arc<dyn MemoryProvider>>,
    timeout: Duration,
}

impl MemoryBus {
    pub fn new(registry: Arc<ServiceRegistry>, timeout: Duration) -> Self {
        Self {
            registry,
            providers: DashMap::new(),
            timeout,
        }
    }

    pub fn register(&self, provider: Arc<dyn MemoryProvider>, priority: u32) {
        self.registry
            .register(ServiceKind::Memory, provider.clone() as Arc<dyn ServiceProvider>, priority);
        self.providers.insert(provider.provider_id().to_string(), provider);
    }

    fn resolve(&self, handle: Arc<dyn ServiceProvider>) -> Option<Arc<dyn MemoryProvider>> {
        self.providers.get(handle.provider_id()).map(|p| p.clone())
    }

    pub async fn put(&self, node: GraphNode) -> Result<(), BusError> {
        invoke_with_fallback(&self.registry, ServiceKind::Memory, None, self.timeout, |handle| {
            let node = node.clone();
            let provider = self.resolve(handle);
            async move {
                match provider {
                    Some(p) => p.put(node).await,
                    None => Err("provider not resolvable".to_string()),
                }
            }
        })
        .await
    }

    pub async fn get(&self, occurrence_id: &str, node_id: &str) -> Result<Option<GraphNode>, BusError> {
        invoke_with_fallback(&self.registry, ServiceKind::Memory, None, self.timeout, |handle| {
            let provider = self.resolve(handle);
            async move {
                match provider {
                    Some(p) => p.get(occurrence_id, node_id).await,
                    None => Err("provider not resolvable".to_string()),
                }
            }
        })
        .await
    }

    pub async fn search(&self, occurrence_id: &str, filter: NodeFilter) -> Result<Vec<GraphNode>, BusError> {
        invoke_with_fallback(&self.registry, ServiceKind::Memory, None, self.timeout, |handle| {
            let provider = self.resolve(handle);
            let filter = filter.clone();
            async move {
                match provider {
                    Some(p) => p.search(occurrence_id, filter).await,
                    None => Err("provider not resolvable".to_string()),
                }
            }
        })
        .await
    }

    pub async fn link(&self, edge: GraphEdge) -> Result<(), BusError> {
        invoke_with_fallback(&self.registry, ServiceKind::Memory, None, self.timeout, |handle| {
            let edge = edge.clone();
            let provider = self.resolve(handle);
            async move {
                match provider {
                    Some(p) => p.link(edge).await,
                    None => Err("provider not resolvable".to_string()),
                }
            }
        })
        .await
    }
}
