//! Runtime-control bus: the channel through which signed emergency
//! commands (SHUTDOWN_NOW / FREEZE / SAFE_MODE) and telemetry-pull
//! requests reach registered control providers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::bus::invoke_with_fallback;
use crate::error::BusError;
use crate::registry::{ServiceKind, ServiceProvider, ServiceRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlCommandType {
    ShutdownNow,
    Freeze,
    SafeMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlCommand {
    pub command_type: ControlCommandType,
    pub issued_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
pub trait RuntimeControlProvider: ServiceProvider {
    async fn execute(&self, command: ControlCommand) -> Result<(), String>;
}

pub struct RuntimeControlBus {
    registry: Arc<ServiceRegistry>,
    providers: DashMap<String, Arc<dyn RuntimeControlProvider>>,
    timeout: Duration,
}

impl RuntimeControlBus {
    pub fn new(registry: Arc<ServiceRegistry>, timeout: Duration) -> Self {
        Self {
            registry,
            providers: DashMap::new(),
            timeout,
        }
    }

    pub fn register(&self, provider: Arc<dyn RuntimeControlProvider>, priority: u32) {
        self.registry
            .register(ServiceKind::RuntimeControl, provider.clone() as Arc<dyn ServiceProvider>, priority);
        self.providers.insert(provider.provider_id().to_string(), provider);
    }

    pub async fn execute(&self, command: ControlCommand) -> Result<(), BusError> {
        invoke_with_fallback(&self.registry, ServiceKind::RuntimeControl, None, self.timeout, |handle| {
            let command = command.clone();
            let provider = self.providers.get(handle.provider_id()).map(|p| p.clone());
            async move {
                match provider {
                    Some(p) => p.execute(command).await,
                    None => Err("provider not resolvable".to_string()),
                }
            }
        })
        .await
    }
}
