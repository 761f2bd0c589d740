//! Pull-model telemetry aggregator: each bus reports its own [`Metrics`]
//! snapshot on demand rather than pushing to a central sink, mirroring the
//! registry's broadcast-and-tolerate-failures fan-out in `bus::mod`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};

use crate::registry::ServiceKind;

/// A single component's self-reported health snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    pub component: String,
    pub uptime_seconds: f64,
    pub request_count: u64,
    pub error_count: u64,
    pub healthy: bool,
    /// Bus-specific extension fields (active_subscriptions, queue_depth,
    /// average_latency_ms, ...), opaque to the aggregator.
    pub extra: serde_json::Value,
}

impl Metrics {
    pub fn error_rate(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.request_count as f64
        }
    }
}

/// Per-component request/error counters, cheap to share behind an `Arc`
/// and read without locking.
pub struct MetricsCounter {
    component: String,
    started_at: Instant,
    requests: AtomicU64,
    errors: AtomicU64,
}

impl MetricsCounter {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            started_at: Instant::now(),
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, healthy: bool, extra: serde_json::Value) -> Metrics {
        Metrics {
            component: self.component.clone(),
            uptime_seconds: self.started_at.elapsed().as_secs_f64(),
            request_count: self.requests.load(Ordering::Relaxed),
            error_count: self.errors.load(Ordering::Relaxed),
            healthy,
            extra,
        }
    }
}

/// A collector function pulled on demand by the aggregator. Each bus
/// registers one that reads its own `MetricsCounter` plus any
/// bus-specific gauges.
pub type Collector = std::sync::Arc<dyn Fn() -> Metrics + Send + Sync + 'static>;

/// A complete telemetry pull across every registered component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub taken_at: chrono::DateTime<chrono::Utc>,
    pub components: Vec<Metrics>,
}

impl std::fmt::Display for TelemetrySnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "telemetry snapshot @ {}", self.taken_at)?;
        for metric in &self.components {
            writeln!(
                f,
                "  {:<20} healthy={:<5} requests={:<6} errors={:<4} error_rate={:.3} uptime={:.1}s",
                metric.component,
                metric.healthy,
                metric.request_count,
                metric.error_count,
                metric.error_rate(),
                metric.uptime_seconds
            )?;
        }
        Ok(())
    }
}

/// Pulls [`Metrics`] from every registered collector in parallel,
/// tolerating a collector that panics or hangs past `timeout` by
/// recording it unhealthy instead of failing the whole snapshot.
pub struct TelemetryAggregator {
    collectors: Vec<(String, Collector)>,
    timeout: Duration,
}

impl TelemetryAggregator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            collectors: Vec::new(),
            timeout,
        }
    }

    pub fn register(&mut self, name: impl Into<String>, collector: Collector) {
        self.collectors.push((name.into(), collector));
    }

    pub async fn snapshot(&self, now: chrono::DateTime<chrono::Utc>) -> TelemetrySnapshot {
        let futures = self.collectors.iter().map(|(name, collector)| {
            let name = name.clone();
            let collector = collector.clone();
            async move {
                let pull = tokio::task::spawn_blocking(move || collector());
                match tokio::time::timeout(self.timeout, pull).await {
                    Ok(Ok(metrics)) => metrics,
                    Ok(Err(_)) | Err(_) => Metrics {
                        component: name,
                        uptime_seconds: 0.0,
                        request_count: 0,
                        error_count: 0,
                        healthy: false,
                        extra: serde_json::json!({"timed_out": true}),
                    },
                }
            }
        });
        let components = join_all(futures).await;
        TelemetrySnapshot { taken_at: now, components }
    }
}

pub fn bus_component_name(kind: ServiceKind) -> String {
    format!("bus.{kind}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn aggregates_multiple_collectors() {
        let mut aggregator = TelemetryAggregator::new(Duration::from_secs(1));
        let counter = Arc::new(MetricsCounter::new("bus.memory"));
        counter.record_request();
        counter.record_request();
        counter.record_error();
        let counter2 = counter.clone();
        aggregator.register("bus.memory", Arc::new(move || counter2.snapshot(true, serde_json::json!({"queue_depth": 0}))));

        let snapshot = aggregator.snapshot(chrono::Utc::now()).await;
        assert_eq!(snapshot.components.len(), 1);
        assert_eq!(snapshot.components[0].request_count, 2);
        assert_eq!(snapshot.components[0].error_count, 1);
        assert!((snapshot.components[0].error_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn slow_collector_times_out_as_unhealthy() {
        let mut aggregator = TelemetryAggregator::new(Duration::from_millis(5));
        aggregator.register(
            "bus.tool",
            Arc::new(|| {
                std::thread::sleep(Duration::from_millis(50));
                Metrics {
                    component: "bus.tool".to_string(),
                    uptime_seconds: 0.0,
                    request_count: 0,
                    error_count: 0,
                    healthy: true,
                    extra: serde_json::Value::Null,
                }
            }),
        );
        let snapshot = aggregator.snapshot(chrono::Utc::now()).await;
        assert!(!snapshot.components[0].healthy);
    }

    #[test]
    fn error_rate_is_zero_with_no_requests() {
        let counter = MetricsCounter::new("bus.llm");
        let metrics = counter.snapshot(true, serde_json::Value::Null);
        assert_eq!(metrics.error_rate(), 0.0);
    }
}
