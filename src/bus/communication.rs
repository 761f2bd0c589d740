//! Communication bus: send/fetch messages against adapter-facing channels.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::bus::invoke_with_fallback;
use crate::error::BusError;
use crate::registry::{ServiceKind, ServiceProvider, ServiceRegistry};
use crate::task::ChannelRef;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub channel: ChannelRef,
    pub text: String,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: ChannelRef,
    pub text: String,
    pub received_at: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
pub trait CommunicationProvider: ServiceProvider {
    async fn send_message(&self, message: OutgoingMessage) -> Result<(), String>;
    async fn fetch_messages(&self, channel: &ChannelRef, limit: usize) -> Result<Vec<InboundMessage>, String>;
}

pub struct CommunicationBus {
    registry: Arc<ServiceRegistry>,
    providers: DashMap<String, Arc<dyn CommunicationProvider>>,
    timeout: Duration,
}

impl CommunicationBus {
    pub fn new(registry: Arc<ServiceRegistry>, timeout: Duration) -> Self {
        Self {
            registry,
            providers: DashMap::new(),
            timeout,
        }
    }

    pub fn register(&self, provider: Arc<dyn CommunicationProvider>, priority: u32) {
        self.registry
            .register(ServiceKind::Communication, provider.clone() as Arc<dyn ServiceProvider>, priority);
        self.providers.insert(provider.provider_id().to_string(), provider);
    }

    pub async fn send_message(&self, message: OutgoingMessage) -> Result<(), BusError> {
        invoke_with_fallback(&self.registry, ServiceKind::Communication, None, self.timeout, |handle| {
            let message = message.clone();
            let provider = self.providers.get(handle.provider_id()).map(|p| p.clone());
            async move {
                match provider {
                    Some(p) => p.send_message(message).await,
                    None => Err("provider not resolvable".to_string()),
                }
            }
        })
        .await
    }

    pub async fn fetch_messages(&self, channel: &ChannelRef, limit: usize) -> Result<Vec<InboundMessage>, BusError> {
        invoke_with_fallback(&self.registry, ServiceKind::Communication, None, self.timeout, |handle| {
            let provider = self.providers.get(handle.provider_id()).map(|p| p.clone());
            let channel = channel.clone();
            async move {
                match provider {
                    Some(p) => p.fetch_messages(&channel, limit).await,
                    None => Err("provider not resolvable".to_string()),
                }
            }
        })
        .await
    }
}
