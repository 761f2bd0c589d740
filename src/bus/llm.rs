//! Language-model bus: structured completion requests, never a raw string
//! round-trip — every provider returns a typed [`Completion`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::bus::invoke_with_fallback;
use crate::error::BusError;
use crate::registry::{ServiceKind, ServiceProvider, ServiceRegistry};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub provider_id: String,
}

#[async_trait]
pub trait LanguageModelProvider: ServiceProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, String>;
}

pub struct LlmBus {
    registry: Arc<ServiceRegistry>,
    providers: DashMap<String, Arc<dyn LanguageModelProvider>>,
    timeout: Duration,
}

impl LlmBus {
    pub fn new(registry: Arc<ServiceRegistry>, timeout: Duration) -> Self {
        Self {
            registry,
            providers: DashMap::new(),
            timeout,
        }
    }

    pub fn register(&self, provider: Arc<dyn LanguageModelProvider>, priority: u32) {
        self.registry
            .register(ServiceKind::LanguageModel, provider.clone() as Arc<dyn ServiceProvider>, priority);
        self.providers.insert(provider.provider_id().to_string(), provider);
    }

    pub async fn complete(&self, request: CompletionRequest) -> Result<Completion, BusError> {
        invoke_with_fallback(&self.registry, ServiceKind::LanguageModel, None, self.timeout, |handle| {
            let request = request.clone();
            let provider = self.providers.get(handle.provider_id()).map(|p| p.clone());
            async move {
                match provider {
                    Some(p) => p.complete(request).await,
                    None => Err("provider not resolvable".to_string()),
                }
            }
        })
        .await
    }
}
