//! The six message buses: thin coordinators over the [`crate::registry`]
//! for one service kind each, adding timeout + fallback policy on top of
//! provider selection.

pub mod communication;
pub mod llm;
pub mod memory;
pub mod runtime_control;
pub mod tool;
pub mod wisdom;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::error::BusError;
use crate::registry::{SelectionStrategy, ServiceKind, ServiceProvider, ServiceRegistry};

/// Invoke `op` against providers of `kind`/`capability` in priority order,
/// retrying the next healthy provider on failure until the list is
/// exhausted (spec §4.4 bus fallback policy).
pub async fn invoke_with_fallback<F, Fut, T>(
    registry: &ServiceRegistry,
    kind: ServiceKind,
    capability: Option<&str>,
    timeout: Duration,
    mut op: F,
) -> Result<T, BusError>
where
    F: FnMut(Arc<dyn ServiceProvider>) -> Fut,
    Fut: Future<Output = Result<T, String>>,
{
    let candidates = registry.broadcast(kind, capability)?;
    if candidates.is_empty() {
        return Err(BusError::Registry(crate::error::RegistryError::AllCircuitsOpen {
            kind: kind.to_string(),
        }));
    }

    // Prefer the registry's own priority/strategy choice first, then fall
    // back through the rest of the broadcast set on failure.
    let first_choice = registry.get(kind, capability, SelectionStrategy::First).ok();
    let mut ordered: Vec<Arc<dyn ServiceProvider>> = Vec::new();
    if let Some(first) = first_choice {
        ordered.push(first.clone());
        ordered.extend(candidates.into_iter().filter(|p| p.provider_id() != first.provider_id()));
    } else {
        ordered = candidates;
    }

    let mut last_err = None;
    for provider in ordered {
        let provider_id = provider.provider_id().to_string();
        match tokio::time::timeout(timeout, op(provider)).await {
            Ok(Ok(value)) => {
                registry.record_success(kind, &provider_id);
                return Ok(value);
            }
            Ok(Err(message)) => {
                warn!(kind = %kind, provider = %provider_id, %message, "bus provider failed");
                registry.record_failure(kind, &provider_id);
                last_err = Some(BusError::ProviderError { provider_id, message });
            }
            Err(_) => {
                warn!(kind = %kind, provider = %provider_id, "bus provider timed out");
                registry.record_failure(kind, &provider_id);
                last_err = Some(BusError::Timeout {
                    kind: kind.to_string(),
                    timeout_secs: timeout.as_secs_f64(),
                });
            }
        }
    }

    Err(last_err.unwrap_or(BusError::Exhausted { kind: kind.to_string() }))
}
