//! Wisdom bus: deferral submission/polling and multi-authority guidance
//! broadcast. The only bus where `broadcast` fan-out is a first-class
//! operation rather than an internal fallback detail.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::bus::invoke_with_fallback;
use crate::clock::DeferralId;
use crate::error::BusError;
use crate::registry::{ServiceKind, ServiceProvider, ServiceRegistry};

/// One authority's response to a `broadcast_guidance` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WisdomAdvice {
    pub capability: String,
    pub provider_type: String,
    pub confidence: f64,
    pub disclaimer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferralSubmission {
    pub deferral_id: DeferralId,
    pub task_id: String,
    pub thought_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferralStatus {
    pub deferral_id: DeferralId,
    pub resolved: bool,
    pub approved: Option<bool>,
    pub guidance: Option<String>,
}

#[async_trait]
pub trait WisdomProvider: ServiceProvider {
    async fn submit_deferral(&self, submission: DeferralSubmission) -> Result<(), String>;
    async fn poll_deferral(&self, deferral_id: &DeferralId) -> Result<DeferralStatus, String>;
    async fn guidance(&self, capability: &str) -> Result<WisdomAdvice, String>;
}

pub struct WisdomBus {
    registry: Arc<ServiceRegistry>,
    providers: DashMap<String, Arc<dyn WisdomProvider>>,
    timeout: Duration,
}

impl WisdomBus {
    pub fn new(registry: Arc<ServiceRegistry>, timeout: Duration) -> Self {
        Self {
            registry,
            providers: DashMap::new(),
            timeout,
        }
    }

    pub fn register(&self, provider: Arc<dyn WisdomProvider>, priority: u32) {
        self.registry
            .register(ServiceKind::Wisdom, provider.clone() as Arc<dyn ServiceProvider>, priority);
        self.providers.insert(provider.provider_id().to_string(), provider);
    }

    pub async fn submit_deferral(&self, submission: DeferralSubmission) -> Result<(), BusError> {
        invoke_with_fallback(&self.registry, ServiceKind::Wisdom, None, self.timeout, |handle| {
            let submission = submission.clone();
            let provider = self.providers.get(handle.provider_id()).map(|p| p.clone());
            async move {
                match provider {
                    Some(p) => p.submit_deferral(submission).await,
                    None => Err("provider not resolvable".to_string()),
                }
            }
        })
        .await
    }

    pub async fn poll_deferral(&self, deferral_id: &DeferralId) -> Result<DeferralStatus, BusError> {
        invoke_with_fallback(&self.registry, ServiceKind::Wisdom, None, self.timeout, |handle| {
            let provider = self.providers.get(handle.provider_id()).map(|p| p.clone());
            let deferral_id = deferral_id.clone();
            async move {
                match provider {
                    Some(p) => p.poll_deferral(&deferral_id).await,
                    None => Err("provider not resolvable".to_string()),
                }
            }
        })
        .await
    }

    /// Fan out to every registered authority provider in parallel and
    /// collect their typed advice, tolerating individual failures.
    pub async fn broadcast_guidance(&self, capability: &str) -> Result<Vec<WisdomAdvice>, BusError> {
        let providers = self.registry.broadcast(ServiceKind::Wisdom, None)?;
        let timeout = self.timeout;
        let mut futures = Vec::new();
        for handle in providers {
            if let Some(provider) = self.providers.get(handle.provider_id()).map(|p| p.clone()) {
                let capability = capability.to_string();
                let provider_id = handle.provider_id().to_string();
                let registry = self.registry.clone();
                futures.push(async move {
                    match tokio::time::timeout(timeout, provider.guidance(&capability)).await {
                        Ok(Ok(advice)) => {
                            registry.record_success(ServiceKind::Wisdom, &provider_id);
                            Some(advice)
                        }
                        _ => {
                            registry.record_failure(ServiceKind::Wisdom, &provider_id);
                            None
                        }
                    }
                });
            }
        }
        let results = futures_util::future::join_all(futures).await;
        Ok(results.into_iter().flatten().collect())
    }
}
