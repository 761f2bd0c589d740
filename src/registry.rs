//! Service registry: register/discover providers by kind and capability,
//! with circuit-breaker health tracking and priority/strategy selection.
//!
//! Generalizes the teacher's `SymbolRegistry` (bidirectional label/id
//! lookup behind `DashMap`s) into a multi-provider-per-kind registry: many
//! providers can serve the same [`ServiceKind`], and [`get`](ServiceRegistry::get)
//! picks one while [`broadcast`](ServiceRegistry::broadcast) fans out to all
//! healthy ones.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

/// The six message-bus service kinds the runtime multiplexes over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceKind {
    Memory,
    LanguageModel,
    Wisdom,
    Tool,
    Communication,
    RuntimeControl,
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceKind::Memory => "memory",
            ServiceKind::LanguageModel => "language-model",
            ServiceKind::Wisdom => "wisdom",
            ServiceKind::Tool => "tool",
            ServiceKind::Communication => "communication",
            ServiceKind::RuntimeControl => "runtime-control",
        };
        write!(f, "{s}")
    }
}

/// A provider's circuit-breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

impl From<u8> for CircuitState {
    fn from(v: u8) -> Self {
        match v {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl From<CircuitState> for u8 {
    fn from(v: CircuitState) -> Self {
        match v {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

/// Atomic circuit breaker: failure count + state transition via CAS.
///
/// Opens after `failure_threshold` consecutive failures, half-opens after
/// `cooldown`, and fully closes on the first success observed while
/// half-open.
pub struct CircuitBreaker {
    state: AtomicU8,
    failure_count: AtomicU32,
    last_failure_millis: AtomicI64,
    failure_threshold: u32,
    cooldown: Duration,
    start: Instant,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed.into()),
            failure_count: AtomicU32::new(0),
            last_failure_millis: AtomicI64::new(0),
            failure_threshold,
            cooldown,
            start: Instant::now(),
        }
    }

    fn now_millis(&self) -> i64 {
        self.start.elapsed().as_millis() as i64
    }

    /// Current state, accounting for cool-down elapse (open -> half-open).
    pub fn state(&self) -> CircuitState {
        let current: CircuitState = self.state.load(Ordering::SeqCst).into();
        if current == CircuitState::Open {
            let elapsed = self.now_millis() - self.last_failure_millis.load(Ordering::SeqCst);
            if elapsed >= self.cooldown.as_millis() as i64 {
                // Transition open -> half_open exactly once via CAS.
                let _ = self.state.compare_exchange(
                    CircuitState::Open.into(),
                    CircuitState::HalfOpen.into(),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                return CircuitState::HalfOpen;
            }
        }
        current
    }

    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::SeqCst);
        self.state.store(CircuitState::Closed.into(), Ordering::SeqCst);
    }

    pub fn record_failure(&self) {
        let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.last_failure_millis.store(self.now_millis(), Ordering::SeqCst);
        if count >= self.failure_threshold {
            self.state.store(CircuitState::Open.into(), Ordering::SeqCst);
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::SeqCst)
    }
}

/// Provider selection strategy when multiple candidates tie on priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    First,
    RoundRobin,
    LeastLoaded,
}

/// Contract every registered service provider implements (spec §9:
/// interface abstraction replacing the source's base-class inheritance
/// tree). Buses only ever talk to this trait, never a concrete provider type.
pub trait ServiceProvider: Send + Sync {
    fn provider_id(&self) -> &str;
    fn capabilities(&self) -> &[String];
    fn healthy(&self) -> bool {
        true
    }
    /// Current in-flight load, used by the `LeastLoaded` strategy.
    fn load(&self) -> u32 {
        0
    }
}

struct Registration {
    provider: Arc<dyn ServiceProvider>,
    priority: u32,
    breaker: Arc<CircuitBreaker>,
    round_robin_counter: AtomicU32,
}

/// Maps `(ServiceKind)` to an ordered list of provider registrations.
pub struct ServiceRegistry {
    providers: DashMap<ServiceKind, Vec<Registration>>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl ServiceRegistry {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            providers: DashMap::new(),
            failure_threshold,
            cooldown,
        }
    }

    /// Register a provider for a service kind with the given priority tier
    /// (lower = preferred) and capability tags.
    pub fn register(&self, kind: ServiceKind, provider: Arc<dyn ServiceProvider>, priority: u32) {
        let breaker = Arc::new(CircuitBreaker::new(self.failure_threshold, self.cooldown));
        self.providers.entry(kind).or_default().push(Registration {
            provider,
            priority,
            breaker,
            round_robin_counter: AtomicU32::new(0),
        });
    }

    pub fn unregister(&self, kind: ServiceKind, provider_id: &str) -> RegistryResult<()> {
        let mut list = self
            .providers
            .get_mut(&kind)
            .ok_or_else(|| RegistryError::UnknownProvider {
                provider_id: provider_id.to_string(),
            })?;
        let before = list.len();
        list.retain(|r| r.provider.provider_id() != provider_id);
        if list.len() == before {
            return Err(RegistryError::UnknownProvider {
                provider_id: provider_id.to_string(),
            });
        }
        Ok(())
    }

    fn candidates(
        &self,
        kind: ServiceKind,
        capability: Option<&str>,
    ) -> RegistryResult<Vec<(Arc<dyn ServiceProvider>, Arc<CircuitBreaker>)>> {
        let list = self
            .providers
            .get(&kind)
            .ok_or_else(|| RegistryError::NoProvider { kind: kind.to_string() })?;
        if list.is_empty() {
            return Err(RegistryError::NoProvider { kind: kind.to_string() });
        }
        let matches: Vec<_> = list
            .iter()
            .filter(|r| {
                capability.is_none_or(|c| r.provider.capabilities().iter().any(|cap| cap == c))
            })
            .map(|r| (r.provider.clone(), r.breaker.clone()))
            .collect();
        Ok(matches)
    }

    /// Select one healthy provider: filter by capability, drop open-circuit
    /// providers, sort by priority ascending, then apply `strategy` among ties.
    pub fn get(
        &self,
        kind: ServiceKind,
        capability: Option<&str>,
        strategy: SelectionStrategy,
    ) -> RegistryResult<Arc<dyn ServiceProvider>> {
        let list = self
            .providers
            .get(&kind)
            .ok_or_else(|| RegistryError::NoProvider { kind: kind.to_string() })?;

        let mut healthy: Vec<&Registration> = list
            .iter()
            .filter(|r| {
                capability.is_none_or(|c| r.provider.capabilities().iter().any(|cap| cap == c))
            })
            .filter(|r| r.breaker.state() != CircuitState::Open)
            .collect();

        if healthy.is_empty() {
            return Err(RegistryError::AllCircuitsOpen { kind: kind.to_string() });
        }

        healthy.sort_by_key(|r| r.priority);
        let best_priority = healthy[0].priority;
        let tied: Vec<&&Registration> = healthy
            .iter()
            .filter(|r| r.priority == best_priority)
            .collect();

        let chosen = match strategy {
            SelectionStrategy::First => tied[0],
            SelectionStrategy::RoundRobin => {
                let idx = tied[0]
                    .round_robin_counter
                    .fetch_add(1, Ordering::SeqCst) as usize
                    % tied.len();
                tied[idx]
            }
            SelectionStrategy::LeastLoaded => tied
                .iter()
                .min_by_key(|r| r.provider.load())
                .copied()
                .unwrap(),
        };

        Ok(chosen.provider.clone())
    }

    /// Fan out to every healthy provider matching `capability` for `kind`.
    pub fn broadcast(
        &self,
        kind: ServiceKind,
        capability: Option<&str>,
    ) -> RegistryResult<Vec<Arc<dyn ServiceProvider>>> {
        let all = self.candidates(kind, capability)?;
        Ok(all
            .into_iter()
            .filter(|(_, breaker)| breaker.state() != CircuitState::Open)
            .map(|(p, _)| p)
            .collect())
    }

    /// Report a successful invocation of `provider_id`, closing its breaker.
    pub fn record_success(&self, kind: ServiceKind, provider_id: &str) {
        if let Some(list) = self.providers.get(&kind) {
            if let Some(r) = list.iter().find(|r| r.provider.provider_id() == provider_id) {
                r.breaker.record_success();
            }
        }
    }

    /// Report a failed invocation of `provider_id`, incrementing its breaker.
    pub fn record_failure(&self, kind: ServiceKind, provider_id: &str) {
        if let Some(list) = self.providers.get(&kind) {
            if let Some(r) = list.iter().find(|r| r.provider.provider_id() == provider_id) {
                r.breaker.record_failure();
            }
        }
    }

    pub fn breaker_state(&self, kind: ServiceKind, provider_id: &str) -> Option<CircuitState> {
        self.providers.get(&kind).and_then(|list| {
            list.iter()
                .find(|r| r.provider.provider_id() == provider_id)
                .map(|r| r.breaker.state())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubProvider {
        id: String,
        caps: Vec<String>,
    }

    impl ServiceProvider for StubProvider {
        fn provider_id(&self) -> &str {
            &self.id
        }
        fn capabilities(&self) -> &[String] {
            &self.caps
        }
    }

    fn provider(id: &str) -> Arc<dyn ServiceProvider> {
        Arc::new(StubProvider {
            id: id.to_string(),
            caps: vec!["general".to_string()],
        })
    }

    #[test]
    fn get_picks_lowest_priority() {
        let registry = ServiceRegistry::new(3, Duration::from_secs(60));
        registry.register(ServiceKind::Tool, provider("b"), 2);
        registry.register(ServiceKind::Tool, provider("a"), 1);
        let chosen = registry.get(ServiceKind::Tool, None, SelectionStrategy::First).unwrap();
        assert_eq!(chosen.provider_id(), "a");
    }

    #[test]
    fn breaker_opens_after_threshold_and_half_opens_after_cooldown() {
        let registry = ServiceRegistry::new(3, Duration::from_millis(20));
        registry.register(ServiceKind::Tool, provider("a"), 1);
        for _ in 0..3 {
            registry.record_failure(ServiceKind::Tool, "a");
        }
        assert_eq!(registry.breaker_state(ServiceKind::Tool, "a"), Some(CircuitState::Open));
        assert!(registry.get(ServiceKind::Tool, None, SelectionStrategy::First).is_err());

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(registry.breaker_state(ServiceKind::Tool, "a"), Some(CircuitState::HalfOpen));

        registry.record_success(ServiceKind::Tool, "a");
        assert_eq!(registry.breaker_state(ServiceKind::Tool, "a"), Some(CircuitState::Closed));
        assert!(registry.get(ServiceKind::Tool, None, SelectionStrategy::First).is_ok());
    }

    #[test]
    fn broadcast_excludes_open_breakers() {
        let registry = ServiceRegistry::new(1, Duration::from_secs(60));
        registry.register(ServiceKind::Wisdom, provider("a"), 1);
        registry.register(ServiceKind::Wisdom, provider("b"), 1);
        registry.record_failure(ServiceKind::Wisdom, "a");
        let results = registry.broadcast(ServiceKind::Wisdom, None).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].provider_id(), "b");
    }

    #[test]
    fn capability_filter_excludes_non_matching() {
        let registry = ServiceRegistry::new(3, Duration::from_secs(60));
        registry.register(
            ServiceKind::Memory,
            Arc::new(StubProvider {
                id: "a".to_string(),
                caps: vec!["vector".to_string()],
            }),
            1,
        );
        let err = registry.get(ServiceKind::Memory, Some("graph"), SelectionStrategy::First);
        assert!(err.is_err());
    }

    #[test]
    fn no_provider_registered_errors() {
        let registry = ServiceRegistry::new(3, Duration::from_secs(60));
        let err = registry.get(ServiceKind::Communication, None, SelectionStrategy::First);
        assert!(matches!(err, Err(RegistryError::NoProvider { .. })));
    }
}
