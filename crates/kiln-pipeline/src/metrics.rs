use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Trait for metrics backends. Implementations can forward to Prometheus,
/// StatsD, or simply log metrics.
pub trait MetricsBackend: Send + Sync {
    fn record_counter(&self, name: &str, value: u64);
    fn record_gauge(&self, name: &str, value: f64);
    fn record_histogram(&self, name: &str, value: f64);
}

/// Atomic counters for library builds, script compiles and executions.
/// Shared across managers through an `Arc`.
pub struct PipelineMetrics {
    pub builds_started: AtomicU64,
    pub builds_completed: AtomicU64,
    pub builds_failed: AtomicU64,
    pub library_cache_hits: AtomicU64,
    pub library_cache_misses: AtomicU64,
    pub scripts_compiled: AtomicU64,
    pub executions_succeeded: AtomicU64,
    pub executions_failed: AtomicU64,
    pub hot_reloads: AtomicU64,
    backend: Option<Arc<dyn MetricsBackend>>,
}

impl std::fmt::Debug for PipelineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineMetrics")
            .field("snapshot", &self.snapshot())
            .field("backend", &self.backend.is_some())
            .finish()
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            builds_started: AtomicU64::new(0),
            builds_completed: AtomicU64::new(0),
            builds_failed: AtomicU64::new(0),
            library_cache_hits: AtomicU64::new(0),
            library_cache_misses: AtomicU64::new(0),
            scripts_compiled: AtomicU64::new(0),
            executions_succeeded: AtomicU64::new(0),
            executions_failed: AtomicU64::new(0),
            hot_reloads: AtomicU64::new(0),
            backend: None,
        }
    }

    pub fn with_backend(backend: Arc<dyn MetricsBackend>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::new()
        }
    }

    fn bump(&self, counter: &AtomicU64, name: &str) {
        let val = counter.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(backend) = &self.backend {
            backend.record_counter(name, val);
        }
    }

    pub fn record_build_started(&self) {
        self.bump(&self.builds_started, "kiln.pipeline.builds_started");
    }

    pub fn record_build_completed(&self, duration: Duration) {
        self.bump(&self.builds_completed, "kiln.pipeline.builds_completed");
        if let Some(backend) = &self.backend {
            backend.record_histogram(
                "kiln.pipeline.build_duration_ms",
                duration.as_millis() as f64,
            );
        }
    }

    pub fn record_build_failed(&self) {
        self.bump(&self.builds_failed, "kiln.pipeline.builds_failed");
    }

    pub fn record_cache_hit(&self) {
        self.bump(&self.library_cache_hits, "kiln.pipeline.library_cache_hits");
    }

    pub fn record_cache_miss(&self) {
        self.bump(&self.library_cache_misses, "kiln.pipeline.library_cache_misses");
    }

    pub fn record_script_compiled(&self) {
        self.bump(&self.scripts_compiled, "kiln.pipeline.scripts_compiled");
    }

    pub fn record_execution(&self, success: bool) {
        if success {
            self.bump(&self.executions_succeeded, "kiln.runtime.executions_succeeded");
        } else {
            self.bump(&self.executions_failed, "kiln.runtime.executions_failed");
        }
    }

    pub fn record_hot_reload(&self) {
        self.bump(&self.hot_reloads, "kiln.runtime.hot_reloads");
    }

    pub fn record_cache_size(&self, bytes: u64) {
        if let Some(backend) = &self.backend {
            backend.record_gauge("kiln.cache.size_bytes", bytes as f64);
        }
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            builds_started: self.builds_started.load(Ordering::Relaxed),
            builds_completed: self.builds_completed.load(Ordering::Relaxed),
            builds_failed: self.builds_failed.load(Ordering::Relaxed),
            library_cache_hits: self.library_cache_hits.load(Ordering::Relaxed),
            library_cache_misses: self.library_cache_misses.load(Ordering::Relaxed),
            scripts_compiled: self.scripts_compiled.load(Ordering::Relaxed),
            executions_succeeded: self.executions_succeeded.load(Ordering::Relaxed),
            executions_failed: self.executions_failed.load(Ordering::Relaxed),
            hot_reloads: self.hot_reloads.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of pipeline metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    pub builds_started: u64,
    pub builds_completed: u64,
    pub builds_failed: u64,
    pub library_cache_hits: u64,
    pub library_cache_misses: u64,
    pub scripts_compiled: u64,
    pub executions_succeeded: u64,
    pub executions_failed: u64,
    pub hot_reloads: u64,
}

/// Logging-based metrics backend. Emits metrics as structured log events.
pub struct LoggingMetricsBackend;

impl MetricsBackend for LoggingMetricsBackend {
    fn record_counter(&self, name: &str, value: u64) {
        tracing::info!(metric = name, value = value, kind = "counter", "metric");
    }

    fn record_gauge(&self, name: &str, value: f64) {
        tracing::info!(metric = name, value = value, kind = "gauge", "metric");
    }

    fn record_histogram(&self, name: &str, value: f64) {
        tracing::info!(metric = name, value = value, kind = "histogram", "metric");
    }
}
