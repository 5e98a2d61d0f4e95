use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;

pub const DEFAULT_HISTOGRAM_CAPACITY: usize = 10_000;
pub const DEFAULT_P99_TARGET_MS: f64 = 10.0;
pub const DEFAULT_SLOW_THRESHOLD_MS: f64 = 25.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsConfig {
    pub histogram_capacity: usize,
    pub p99_target_ms: f64,
    pub slow_threshold_ms: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            histogram_capacity: DEFAULT_HISTOGRAM_CAPACITY,
            p99_target_ms: DEFAULT_P99_TARGET_MS,
            slow_threshold_ms: DEFAULT_SLOW_THRESHOLD_MS,
        }
    }
}

#[derive(Debug, Default)]
struct Window {
    latencies: VecDeque<f64>,
    total: u64,
    hits: u64,
    misses: u64,
    errors: u64,
    slow: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_evaluations: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub errors: u64,
    pub slow_evaluations: u64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub p99_target_ms: f64,
    pub slow_threshold_ms: f64,
    pub within_target: bool,
}

/// Process-wide evaluation metrics over a bounded window of recent latencies.
///
/// Counters and the window sit behind one lock so `reset` and `snapshot`
/// never observe a half-updated state.
#[derive(Debug)]
pub struct AuthzMetrics {
    config: MetricsConfig,
    window: Mutex<Window>,
}

impl AuthzMetrics {
    pub fn new() -> Self {
        Self::with_config(MetricsConfig::default())
    }

    pub fn with_config(config: MetricsConfig) -> Self {
        let capacity = config.histogram_capacity.max(1);
        Self {
            config: MetricsConfig {
                histogram_capacity: capacity,
                ..config
            },
            window: Mutex::new(Window {
                latencies: VecDeque::with_capacity(capacity),
                ..Window::default()
            }),
        }
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    pub fn record(&self, latency_ms: f64, cache_hit: bool) {
        let latency_ms = if latency_ms.is_finite() {
            latency_ms.max(0.0)
        } else {
            0.0
        };

        let mut window = self.window.lock().unwrap();
        if window.latencies.len() == self.config.histogram_capacity {
            window.latencies.pop_front();
        }
        window.latencies.push_back(latency_ms);

        window.total += 1;
        if cache_hit {
            window.hits += 1;
        } else {
            window.misses += 1;
        }
        if latency_ms > self.config.slow_threshold_ms {
            window.slow += 1;
        }
    }

    pub fn record_duration(&self, elapsed: Duration, cache_hit: bool) {
        self.record(elapsed.as_secs_f64() * 1000.0, cache_hit);
    }

    pub fn record_error(&self) {
        self.window.lock().unwrap().errors += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (mut sorted, total, hits, misses, errors, slow) = {
            let window = self.window.lock().unwrap();
            (
                window.latencies.iter().copied().collect::<Vec<_>>(),
                window.total,
                window.hits,
                window.misses,
                window.errors,
                window.slow,
            )
        };
        sorted.sort_by(f64::total_cmp);

        let p99 = percentile(&sorted, 99);
        MetricsSnapshot {
            total_evaluations: total,
            cache_hits: hits,
            cache_misses: misses,
            errors,
            slow_evaluations: slow,
            p50: percentile(&sorted, 50),
            p95: percentile(&sorted, 95),
            p99,
            p99_target_ms: self.config.p99_target_ms,
            slow_threshold_ms: self.config.slow_threshold_ms,
            within_target: p99 <= self.config.p99_target_ms,
        }
    }

    pub fn reset(&self) {
        let mut window = self.window.lock().unwrap();
        window.latencies.clear();
        window.total = 0;
        window.hits = 0;
        window.misses = 0;
        window.errors = 0;
        window.slow = 0;
    }

    pub fn render_prometheus(&self) -> String {
        let snap = self.snapshot();
        let mut output = String::new();

        let counters = [
            (
                "tenantgate_authz_evaluations_total",
                "Total authorization evaluations.",
                snap.total_evaluations,
            ),
            (
                "tenantgate_authz_cache_hits_total",
                "Evaluations served from cache.",
                snap.cache_hits,
            ),
            (
                "tenantgate_authz_cache_misses_total",
                "Evaluations that required the resolver.",
                snap.cache_misses,
            ),
            (
                "tenantgate_authz_errors_total",
                "Authorization errors.",
                snap.errors,
            ),
            (
                "tenantgate_authz_slow_evaluations_total",
                "Evaluations slower than the slow-path threshold.",
                snap.slow_evaluations,
            ),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(output, "# HELP {name} {help}");
            let _ = writeln!(output, "# TYPE {name} counter");
            let _ = writeln!(output, "{name} {value}");
        }

        let _ = writeln!(
            output,
            "# HELP tenantgate_authz_latency_ms Evaluation latency percentiles over the recent window."
        );
        let _ = writeln!(output, "# TYPE tenantgate_authz_latency_ms gauge");
        for (quantile, value) in [("0.5", snap.p50), ("0.95", snap.p95), ("0.99", snap.p99)] {
            let _ = writeln!(
                output,
                "tenantgate_authz_latency_ms{{quantile=\"{quantile}\"}} {value}"
            );
        }

        let _ = writeln!(
            output,
            "# HELP tenantgate_authz_p99_within_target Whether p99 latency meets the target."
        );
        let _ = writeln!(output, "# TYPE tenantgate_authz_p99_within_target gauge");
        let _ = writeln!(
            output,
            "tenantgate_authz_p99_within_target {}",
            u8::from(snap.within_target)
        );
        output
    }
}

impl Default for AuthzMetrics {
    fn default() -> Self {
        Self::new()
    }
}

// Ceiling-rank selection over an ascending slice; empty yields zero.
fn percentile(sorted: &[f64], pct: usize) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (pct * sorted.len()).div_ceil(100);
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

pub async fn metrics_handler(State(metrics): State<Arc<AuthzMetrics>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        metrics.render_prometheus(),
    )
}
