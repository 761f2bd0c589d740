//! Tool bus: invoke an external tool by name with typed parameters.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::invoke_with_fallback;
use crate::error::BusError;
use crate::registry::{ServiceKind, ServiceProvider, ServiceRegistry};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_name: String,
    pub parameters: Value,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub output: Value,
    pub succeeded: bool,
}

#[async_trait]
pub trait ToolProvider: ServiceProvider {
    async fn invoke(&self, invocation: ToolInvocation) -> Result<ToolResult, String>;
}

pub struct ToolBus {
    registry: Arc<ServiceRegistry>,
    providers: DashMap<String, Arc<dyn ToolProvider>>,
    timeout: Duration,
}

impl ToolBus {
    pub fn new(registry: Arc<ServiceRegistry>, timeout: Duration) -> Self {
        Self {
            registry,
            providers: DashMap::new(),
            timeout,
        }
    }

    pub fn register(&self, provider: Arc<dyn ToolProvider>, priority: u32) {
        self.registry
            .register(ServiceKind::Tool, provider.clone() as Arc<dyn ServiceProvider>, priority);
        self.providers.insert(provider.provider_id().to_string(), provider);
    }

    pub async fn invoke(&self, invocation: ToolInvocation) -> Result<ToolResult, BusError> {
        let capability = invocation.tool_name.clone();
        invoke_with_fallback(&self.registry, ServiceKind::Tool, Some(&capability), self.timeout, |handle| {
            let invocation = invocation.clone();
            let provider = self.providers.get(handle.provider_id()).map(|p| p.clone());
            async move {
                match provider {
                    Some(p) => p.invoke(invocation).await,
                    None => Err("provider not resolvable".to_string()),
                }
            }
        })
        .await
    }
}
