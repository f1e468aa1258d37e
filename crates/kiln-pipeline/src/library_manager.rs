use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use kiln_core::{ContentFingerprint, TreeFilter};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, Semaphore, broadcast};
use tokio::task::JoinSet;

use crate::build_tool::{LibraryBuilder, fingerprint_sources};
use crate::cache::CacheManager;
use crate::config::KilnConfig;
use crate::error::PipelineError;
use crate::metrics::PipelineMetrics;
use crate::task::BackgroundTask;
use crate::types::{DependencyGraph, LibraryArtifact, LibraryDescriptor};

const STATUS_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BuildStatus {
    InProgress,
    Completed { success: bool },
}

/// One status transition of a library build, keyed by library identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildEvent {
    pub library: String,
    pub status: BuildStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct LibraryBuildReport {
    /// Successful artifacts in descriptor order.
    pub artifacts: Vec<LibraryArtifact>,
    /// `(library name, message)` for every failed build.
    pub failures: Vec<(String, String)>,
    pub compiled_from_source: usize,
    pub compiled_from_cache: usize,
    pub duration: Duration,
}

impl LibraryBuildReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// The report, or [`PipelineError::LibraryBuild`] listing every failure.
    pub fn into_result(self) -> Result<Self, PipelineError> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(PipelineError::LibraryBuild {
                failures: self.failures,
            })
        }
    }
}

/// Hot-reload bookkeeping for one watched library.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEntry {
    pub identity: String,
    pub last_fingerprint: ContentFingerprint,
    pub last_reload: Option<DateTime<Utc>>,
}

/// Called with the fresh artifact after a hot-reload rebuild.
pub type LibraryReloadCallback = Arc<dyn Fn(&LibraryArtifact) + Send + Sync>;

/// Everything a build task needs, cheap to clone into spawned tasks.
#[derive(Clone)]
struct BuildContext {
    builder: Arc<dyn LibraryBuilder>,
    cache: Arc<CacheManager>,
    metrics: Arc<PipelineMetrics>,
    permits: Arc<Semaphore>,
    events: broadcast::Sender<BuildEvent>,
    statuses: Arc<RwLock<HashMap<String, BuildStatus>>>,
}

impl BuildContext {
    async fn publish(&self, library: &str, status: BuildStatus) {
        self.statuses
            .write()
            .await
            .insert(library.to_string(), status);
        // no subscribers is fine
        let _ = self.events.send(BuildEvent {
            library: library.to_string(),
            status,
            at: Utc::now(),
        });
    }

    /// Build under a concurrency permit and write the result through to the
    /// cache. `InProgress` is published after the permit is acquired and
    /// `Completed` before it is released.
    async fn build_gated(
        &self,
        descriptor: &LibraryDescriptor,
    ) -> Result<LibraryArtifact, PipelineError> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::Cancelled)?;

        let identity = descriptor.identity();
        self.publish(&identity, BuildStatus::InProgress).await;
        self.metrics.record_build_started();

        let result = self.builder.build(descriptor).await;
        match &result {
            Ok(artifact) => {
                self.metrics.record_build_completed(Duration::from_millis(
                    artifact.compilation_duration_ms,
                ));
                self.cache.cache_library(artifact).await;
                self.metrics
                    .record_cache_size(self.cache.total_size_bytes().await);
            }
            Err(e) => {
                self.metrics.record_build_failed();
                tracing::warn!(library = %identity, error = %e, "Library build failed");
            }
        }

        self.publish(
            &identity,
            BuildStatus::Completed {
                success: result.is_ok(),
            },
        )
        .await;
        result
    }
}

/// Schedules library builds: cache first, then the builder behind a
/// counting semaphore. Also owns the library hot-reload pollers.
pub struct LibraryManager {
    ctx: BuildContext,
    filter: TreeFilter,
    max_concurrent: usize,
    poll_interval: Duration,
    watches: Arc<RwLock<HashMap<String, WatchEntry>>>,
    pollers: Mutex<HashMap<String, BackgroundTask>>,
}

impl LibraryManager {
    pub fn new(
        builder: Arc<dyn LibraryBuilder>,
        cache: Arc<CacheManager>,
        config: &KilnConfig,
    ) -> Self {
        let max_concurrent = config.build.build_slots();
        let (events, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            filter: cache.tree_filter().clone(),
            ctx: BuildContext {
                builder,
                cache,
                metrics: Arc::new(PipelineMetrics::new()),
                permits: Arc::new(Semaphore::new(max_concurrent)),
                events,
                statuses: Arc::new(RwLock::new(HashMap::new())),
            },
            max_concurrent,
            poll_interval: config.hot_reload.library_interval(),
            watches: Arc::new(RwLock::new(HashMap::new())),
            pollers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.ctx.metrics = metrics;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.ctx.cache
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.ctx.metrics
    }

    /// Stream of build status transitions from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.ctx.events.subscribe()
    }

    /// Latest status of a library, by identity.
    pub async fn build_status(&self, identity: &str) -> Option<BuildStatus> {
        self.ctx.statuses.read().await.get(identity).copied()
    }

    /// Obtain every library, from the cache where valid and by building the
    /// rest concurrently, in resolved build order. Failures are collected,
    /// never short-circuited.
    pub async fn build_libraries(&self, descriptors: &[LibraryDescriptor]) -> LibraryBuildReport {
        let started = Instant::now();
        let ordered = if descriptors.is_empty() {
            Vec::new()
        } else {
            self.resolve_build_order(descriptors).await
        };
        let descriptors = ordered.as_slice();
        let mut results: Vec<Option<Result<LibraryArtifact, String>>> =
            (0..descriptors.len()).map(|_| None).collect();
        let mut compiled_from_cache = 0;

        let mut misses = Vec::new();
        for (index, descriptor) in descriptors.iter().enumerate() {
            match self.ctx.cache.get_cached_library(descriptor).await {
                Some(artifact) => {
                    self.ctx.metrics.record_cache_hit();
                    compiled_from_cache += 1;
                    results[index] = Some(Ok(artifact));
                }
                None => {
                    self.ctx.metrics.record_cache_miss();
                    misses.push(index);
                }
            }
        }

        let compiled_from_source = misses.len();
        let mut join_set: JoinSet<(usize, Result<LibraryArtifact, PipelineError>)> =
            JoinSet::new();
        let mut tasks: HashMap<tokio::task::Id, usize> = HashMap::new();
        for index in misses {
            let ctx = self.ctx.clone();
            let descriptor = descriptors[index].clone();
            let handle =
                join_set.spawn(async move { (index, ctx.build_gated(&descriptor).await) });
            tasks.insert(handle.id(), index);
        }
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result.map_err(|e| e.to_string())),
                Err(e) => {
                    let Some(&index) = tasks.get(&e.id()) else {
                        tracing::error!(error = %e, "Unknown library build task failed");
                        continue;
                    };
                    let identity = descriptors[index].identity();
                    tracing::error!(library = %identity, error = %e, "Library build task panicked");
                    self.ctx.metrics.record_build_failed();
                    self.ctx
                        .publish(&identity, BuildStatus::Completed { success: false })
                        .await;
                    results[index] = Some(Err(format!("build task failed: {e}")));
                }
            }
        }

        let mut artifacts = Vec::new();
        let mut failures = Vec::new();
        for (descriptor, result) in descriptors.iter().zip(results) {
            match result {
                Some(Ok(artifact)) => artifacts.push(artifact),
                Some(Err(message)) => failures.push((descriptor.name.clone(), message)),
                None => failures.push((descriptor.name.clone(), "build did not finish".into())),
            }
        }

        let report = LibraryBuildReport {
            artifacts,
            failures,
            compiled_from_source,
            compiled_from_cache,
            duration: started.elapsed(),
        };
        tracing::info!(
            libraries = descriptors.len(),
            slots = self.max_concurrent,
            from_source = report.compiled_from_source,
            from_cache = report.compiled_from_cache,
            failed = report.failures.len(),
            duration_ms = report.duration.as_millis() as u64,
            "Library build pass finished"
        );
        report
    }

    /// Dependency edges between the libraries. No analysis is performed yet:
    /// every library is independent. The graph is memoized in the cache.
    pub async fn analyze_dependencies(&self, descriptors: &[LibraryDescriptor]) -> DependencyGraph {
        let identities: Vec<String> =
            descriptors.iter().map(LibraryDescriptor::identity).collect();
        if let Some(graph) = self.ctx.cache.get_cached_dependency_graph(&identities).await {
            return graph;
        }

        let graph = DependencyGraph {
            order: identities.clone(),
            edges: identities.iter().map(|id| (id.clone(), Vec::new())).collect(),
        };
        self.ctx.cache.cache_dependency_graph(&identities, &graph).await;
        graph
    }

    /// Build order for `descriptors`. Libraries are independent, so this is
    /// the input order.
    pub async fn resolve_build_order(
        &self,
        descriptors: &[LibraryDescriptor],
    ) -> Vec<LibraryDescriptor> {
        let graph = self.analyze_dependencies(descriptors).await;
        tracing::debug!(libraries = graph.edges.len(), "Build order resolved");
        descriptors.to_vec()
    }

    // -- hot reload --

    /// Poll the library sources and rebuild on change. Re-enabling an
    /// already watched library replaces its poller.
    pub async fn enable_hot_reload(
        &self,
        descriptor: LibraryDescriptor,
        callback: LibraryReloadCallback,
    ) -> Result<(), PipelineError> {
        let identity = descriptor.identity();
        let fingerprint =
            fingerprint_sources(descriptor.source_path.clone(), self.filter.clone()).await?;

        self.watches.write().await.insert(
            identity.clone(),
            WatchEntry {
                identity: identity.clone(),
                last_fingerprint: fingerprint,
                last_reload: None,
            },
        );

        let ctx = self.ctx.clone();
        let filter = self.filter.clone();
        let watches = Arc::clone(&self.watches);
        let descriptor = Arc::new(descriptor);
        let watched = identity.clone();

        let task = BackgroundTask::spawn_periodic(
            format!("library-reload:{identity}"),
            self.poll_interval,
            move || {
                let ctx = ctx.clone();
                let filter = filter.clone();
                let watches = Arc::clone(&watches);
                let descriptor = Arc::clone(&descriptor);
                let callback = Arc::clone(&callback);
                let identity = watched.clone();
                async move {
                    poll_library(&ctx, &filter, &watches, &descriptor, &identity, &callback).await;
                    true
                }
            },
        );

        let previous = self.pollers.lock().await.insert(identity.clone(), task);
        if let Some(previous) = previous {
            previous.stop().await;
        }
        tracing::info!(
            library = %identity,
            interval_ms = self.poll_interval.as_millis() as u64,
            "Library hot reload enabled"
        );
        Ok(())
    }

    /// Stop watching a library. Returns whether it was watched.
    pub async fn disable_hot_reload(&self, identity: &str) -> bool {
        let task = self.pollers.lock().await.remove(identity);
        self.watches.write().await.remove(identity);
        match task {
            Some(task) => {
                task.stop().await;
                tracing::info!(library = %identity, "Library hot reload disabled");
                true
            }
            None => false,
        }
    }

    pub async fn watch_entry(&self, identity: &str) -> Option<WatchEntry> {
        self.watches.read().await.get(identity).cloned()
    }

    /// Stop every poller.
    pub async fn shutdown(&self) {
        let tasks: Vec<BackgroundTask> =
            self.pollers.lock().await.drain().map(|(_, t)| t).collect();
        for task in tasks {
            task.stop().await;
        }
        self.watches.write().await.clear();
    }
}

/// One hot-reload poll. Errors are logged and the watch stays active.
async fn poll_library(
    ctx: &BuildContext,
    filter: &TreeFilter,
    watches: &RwLock<HashMap<String, WatchEntry>>,
    descriptor: &LibraryDescriptor,
    identity: &str,
    callback: &LibraryReloadCallback,
) {
    let current = match fingerprint_sources(descriptor.source_path.clone(), filter.clone()).await {
        Ok(fp) => fp,
        Err(e) => {
            tracing::warn!(library = %identity, error = %e, "Hot reload poll failed");
            return;
        }
    };

    let changed = watches
        .read()
        .await
        .get(identity)
        .is_some_and(|entry| entry.last_fingerprint != current);
    if !changed {
        return;
    }

    tracing::info!(library = %identity, "Library sources changed, rebuilding");
    let result = ctx.build_gated(descriptor).await;

    // record the new fingerprint even on failure; the next edit retries
    if let Some(entry) = watches.write().await.get_mut(identity) {
        entry.last_fingerprint = current;
        if result.is_ok() {
            entry.last_reload = Some(Utc::now());
        }
    }

    match result {
        Ok(artifact) => {
            ctx.metrics.record_hot_reload();
            (**callback)(&artifact);
        }
        Err(e) => tracing::warn!(library = %identity, error = %e, "Hot reload rebuild failed"),
    }
}
