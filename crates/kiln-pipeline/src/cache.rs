use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kiln_core::{
    ArtifactCache, CacheEntry, CacheKey, CacheKind, CacheStats, ContentHasher, Invalidation, Lookup,
    TreeFilter,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::build_tool::fingerprint_sources;
use crate::config::{CacheConfig, KilnConfig};
use crate::error::PipelineError;
use crate::task::BackgroundTask;
use crate::types::{DependencyGraph, LibraryArtifact, LibraryDescriptor, ScriptArtifact};

/// Eviction starts once the total size passes this share of the limit.
const PRESSURE_PERCENT: u64 = 80;
/// Share of script and library entries removed by one LRU pass.
const EVICTION_PERCENT: usize = 20;
/// Entries listed in [`CacheAnalysis::most_accessed`].
const ANALYSIS_TOP_ENTRIES: usize = 10;

/// The three artifact caches behind one service.
///
/// In-memory entries are authoritative. Each insert also writes a JSON record
/// under the cache root for inspection:
/// ```text
/// root/
///   scripts/       -- one record per script slot (source + imports)
///   libraries/     -- LibraryArtifact manifests
///   dependencies/  -- DependencyGraph records
/// ```
pub struct CacheManager {
    root: PathBuf,
    max_size_bytes: u64,
    cleanup_interval: Duration,
    filter: TreeFilter,
    scripts: ArtifactCache<ScriptArtifact>,
    libraries: ArtifactCache<LibraryArtifact>,
    dependencies: ArtifactCache<DependencyGraph>,
    sweeper: Mutex<Option<BackgroundTask>>,
}

impl CacheManager {
    pub fn new(config: &CacheConfig, filter: TreeFilter) -> Self {
        let max_age = config.max_age();
        Self {
            root: config.root.clone(),
            max_size_bytes: config.max_size_bytes,
            cleanup_interval: config.cleanup_interval(),
            filter,
            scripts: ArtifactCache::new(CacheKind::Script, max_age),
            libraries: ArtifactCache::new(CacheKind::Library, max_age),
            dependencies: ArtifactCache::new(CacheKind::DependencyGraph, max_age),
            sweeper: Mutex::new(None),
        }
    }

    pub fn from_config(config: &KilnConfig) -> Self {
        Self::new(&config.cache, config.build.tree_filter())
    }

    /// Replace the entry lifetime. Existing entries are dropped, so call this
    /// before anything is stored.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.scripts = ArtifactCache::new(CacheKind::Script, max_age);
        self.libraries = ArtifactCache::new(CacheKind::Library, max_age);
        self.dependencies = ArtifactCache::new(CacheKind::DependencyGraph, max_age);
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn tree_filter(&self) -> &TreeFilter {
        &self.filter
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }

    pub fn max_age(&self) -> Duration {
        self.scripts.max_age()
    }

    /// Create the on-disk layout.
    pub async fn init(&self) -> Result<(), PipelineError> {
        for kind in [CacheKind::Script, CacheKind::Library, CacheKind::DependencyGraph] {
            tokio::fs::create_dir_all(self.root.join(kind.dir_name())).await?;
        }
        Ok(())
    }

    // -- scripts --

    /// Store a compiled script. A failed record write is logged; the entry
    /// stays cached and the size limit is still enforced.
    pub async fn cache_script<S: AsRef<str>>(&self, artifact: &ScriptArtifact, dependencies: &[S]) {
        let key = CacheKey::script(&artifact.name, dependencies);
        let mut stored = artifact.clone();
        stored.from_cache = false;
        self.scripts
            .put(key.clone(), stored, artifact.fingerprint().clone())
            .await;

        let record = serde_json::json!({
            "name": artifact.name,
            "fingerprint": artifact.fingerprint(),
            "imports": artifact.active_imports,
            "provided_imports": artifact.provided_imports,
            "dependencies": dependencies.iter().map(AsRef::as_ref).collect::<Vec<&str>>(),
            "source": artifact.source_content,
        });
        self.persist_record(&key, &record).await;

        tracing::debug!(
            script = %artifact.name,
            fingerprint = %artifact.fingerprint().short(),
            "Script cached"
        );
        self.enforce_size_limit().await;
    }

    /// Cached unit for `name`, valid only while `content` still matches.
    /// The import set it was compiled against is not checked; see
    /// [`CacheManager::get_cached_script_with_imports`].
    pub async fn get_cached_script<S: AsRef<str>>(
        &self,
        content: &str,
        name: &str,
        dependencies: &[S],
    ) -> Option<ScriptArtifact> {
        let key = CacheKey::script(name, dependencies);
        let current = ContentHasher::fingerprint_str(content);
        let lookup = self.scripts.get(&key, &current).await;
        self.finish_script_lookup(&key, lookup).await
    }

    /// Like [`CacheManager::get_cached_script`], but the unit must also have
    /// been compiled against exactly `imports`.
    pub async fn get_cached_script_with_imports<S: AsRef<str>>(
        &self,
        content: &str,
        name: &str,
        dependencies: &[S],
        imports: &[String],
    ) -> Option<ScriptArtifact> {
        let key = CacheKey::script(name, dependencies);
        let current = ContentHasher::fingerprint_str(content);
        let lookup = self
            .scripts
            .get_if(&key, |entry| {
                if entry.fingerprint != current || entry.value.provided_imports != imports {
                    Err(Invalidation::FingerprintMismatch)
                } else {
                    Ok(())
                }
            })
            .await;
        self.finish_script_lookup(&key, lookup).await
    }

    async fn finish_script_lookup(
        &self,
        key: &CacheKey,
        lookup: Lookup<ScriptArtifact>,
    ) -> Option<ScriptArtifact> {
        self.finish_lookup(key, lookup).await.map(|mut artifact| {
            artifact.from_cache = true;
            artifact
        })
    }

    /// Remove a script slot. Returns whether one was present.
    pub async fn invalidate_script<S: AsRef<str>>(&self, name: &str, dependencies: &[S]) -> bool {
        let key = CacheKey::script(name, dependencies);
        let removed = self.scripts.remove(&key).await.is_some();
        self.discard_record(&key).await;
        removed
    }

    // -- libraries --

    /// Store a built library. Record failures are logged as for scripts.
    pub async fn cache_library(&self, artifact: &LibraryArtifact) {
        let key = artifact.descriptor.cache_key();
        let mut stored = artifact.clone();
        stored.from_cache = false;
        self.libraries
            .put(key.clone(), stored.clone(), artifact.source_fingerprint.clone())
            .await;
        self.persist_record(&key, &stored).await;

        tracing::debug!(
            library = %artifact.descriptor.name,
            archive = %artifact.archive_file.display(),
            "Library cached"
        );
        self.enforce_size_limit().await;
    }

    /// Cached artifact for `descriptor`.
    ///
    /// Valid only while the source tree fingerprint is unchanged and the
    /// archive file still exists. An unreadable source tree counts as changed.
    pub async fn get_cached_library(
        &self,
        descriptor: &LibraryDescriptor,
    ) -> Option<LibraryArtifact> {
        let key = descriptor.cache_key();
        let (current, archive_present) = match self.libraries.peek(&key).await {
            Some(entry) => {
                let current =
                    fingerprint_sources(descriptor.source_path.clone(), self.filter.clone())
                        .await
                        .ok();
                let archive_present = tokio::fs::metadata(&entry.value.archive_file)
                    .await
                    .is_ok_and(|m| m.is_file());
                (current, archive_present)
            }
            None => (None, false),
        };

        let lookup = self
            .libraries
            .get_if(&key, |entry| {
                match &current {
                    Some(fingerprint) if *fingerprint == entry.fingerprint => {}
                    _ => return Err(Invalidation::FingerprintMismatch),
                }
                if archive_present {
                    Ok(())
                } else {
                    Err(Invalidation::ArtifactMissing)
                }
            })
            .await;

        self.finish_lookup(&key, lookup).await.map(|mut artifact| {
            artifact.from_cache = true;
            artifact
        })
    }

    pub async fn invalidate_library(&self, descriptor: &LibraryDescriptor) -> bool {
        let key = descriptor.cache_key();
        let removed = self.libraries.remove(&key).await.is_some();
        self.discard_record(&key).await;
        removed
    }

    // -- dependency graphs --

    pub async fn cache_dependency_graph<S: AsRef<str>>(
        &self,
        identities: &[S],
        graph: &DependencyGraph,
    ) {
        let key = CacheKey::dependency_graph(identities);
        let fingerprint = key.primary.clone();
        self.dependencies.put(key.clone(), graph.clone(), fingerprint).await;
        self.persist_record(&key, graph).await;
    }

    pub async fn get_cached_dependency_graph<S: AsRef<str>>(
        &self,
        identities: &[S],
    ) -> Option<DependencyGraph> {
        let key = CacheKey::dependency_graph(identities);
        let lookup = self.dependencies.get(&key, &key.primary).await;
        self.finish_lookup(&key, lookup).await
    }

    async fn finish_lookup<T>(&self, key: &CacheKey, lookup: Lookup<T>) -> Option<T> {
        match lookup {
            Lookup::Hit(entry) => Some(entry.value),
            Lookup::Miss => None,
            Lookup::Stale(reason) => {
                tracing::debug!(key = %key, ?reason, "Cache entry invalidated");
                self.discard_record(key).await;
                None
            }
        }
    }

    // -- size, eviction, expiry --

    /// Script bytes plus library archive sizes, measured now.
    pub async fn total_size_bytes(&self) -> u64 {
        let scripts: u64 = self
            .scripts
            .entries()
            .await
            .iter()
            .map(|(_, entry)| entry.value.source_content.len() as u64)
            .sum();

        scripts + self.archive_bytes().await
    }

    async fn archive_bytes(&self) -> u64 {
        let mut total = 0;
        for (_, entry) in self.libraries.entries().await {
            total += entry.value.archive_size().await;
        }
        total
    }

    async fn enforce_size_limit(&self) {
        let total = self.total_size_bytes().await;
        if total.saturating_mul(100) > self.max_size_bytes.saturating_mul(PRESSURE_PERCENT) {
            let evicted = self.evict_lru().await;
            tracing::info!(
                total_bytes = total,
                max_bytes = self.max_size_bytes,
                evicted,
                "Cache over size threshold"
            );
        }
    }

    /// Evict the least recently used fifth of script and library entries,
    /// ranked jointly across both caches. Returns the number evicted.
    pub async fn evict_lru(&self) -> usize {
        let mut candidates: Vec<_> = self
            .scripts
            .entries()
            .await
            .into_iter()
            .map(|(key, entry)| (entry.recency(), key))
            .collect();
        candidates.extend(
            self.libraries
                .entries()
                .await
                .into_iter()
                .map(|(key, entry)| (entry.recency(), key)),
        );
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        let count = candidates.len() * EVICTION_PERCENT / 100;
        let mut evicted = 0;
        for (_, key) in candidates.into_iter().take(count) {
            let removed = match key.kind {
                CacheKind::Script => self.scripts.evict(&key).await,
                CacheKind::Library => self.libraries.evict(&key).await,
                CacheKind::DependencyGraph => false,
            };
            if removed {
                self.discard_record(&key).await;
                evicted += 1;
            }
        }
        evicted
    }

    /// Remove expired entries from all three caches and their records.
    /// Record removal failures are logged; the first one is returned after
    /// every entry has been processed.
    pub async fn sweep_expired(&self) -> Result<usize, PipelineError> {
        let mut expired = self.scripts.sweep_expired().await;
        expired.extend(self.libraries.sweep_expired().await);
        expired.extend(self.dependencies.sweep_expired().await);

        let mut first_error = None;
        for key in &expired {
            if let Err(e) = self.remove_record(key).await {
                tracing::warn!(key = %key, error = %e, "Failed to remove cache record");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(expired.len()),
        }
    }

    /// One maintenance pass: expiry sweep, then size enforcement.
    pub async fn run_maintenance(&self) {
        match self.sweep_expired().await {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "Expired cache entries removed"),
            Err(e) => tracing::warn!(error = %e, "Cache sweep failed"),
        }
        self.enforce_size_limit().await;
    }

    /// Drop every entry and record, and reset all counters.
    pub async fn clear(&self) -> Result<(), PipelineError> {
        self.scripts.clear().await;
        self.libraries.clear().await;
        self.dependencies.clear().await;

        for kind in [CacheKind::Script, CacheKind::Library, CacheKind::DependencyGraph] {
            let dir = self.root.join(kind.dir_name());
            if tokio::fs::try_exists(&dir).await? {
                tokio::fs::remove_dir_all(&dir).await?;
                tokio::fs::create_dir_all(&dir).await?;
            }
        }
        tracing::info!(root = %self.root.display(), "Cache cleared");
        Ok(())
    }

    // -- reporting --

    pub async fn statistics(&self) -> CacheStatistics {
        let scripts = self
            .scripts
            .stats_with(|artifact| artifact.source_content.len() as u64)
            .await;
        let mut libraries = self.libraries.stats_with(|_| 0).await;
        libraries.size_bytes = self.archive_bytes().await;
        let dependency_graphs = self.dependencies.stats_with(|_| 0).await;

        let hits = scripts.hits + libraries.hits + dependency_graphs.hits;
        let lookups = hits + scripts.misses + libraries.misses + dependency_graphs.misses;

        CacheStatistics {
            total_entries: scripts.entries + libraries.entries + dependency_graphs.entries,
            total_size_bytes: scripts.size_bytes + libraries.size_bytes,
            max_size_bytes: self.max_size_bytes,
            hit_ratio: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            generated_at: Utc::now(),
            scripts,
            libraries,
            dependency_graphs,
        }
    }

    /// Statistics plus the most used entries and tuning recommendations.
    pub async fn export_analysis(&self) -> CacheAnalysis {
        let statistics = self.statistics().await;

        let mut usage: Vec<EntryUsage> = Vec::new();
        usage.extend(self.scripts.entries().await.iter().map(|(k, e)| EntryUsage::of(k, e)));
        usage.extend(self.libraries.entries().await.iter().map(|(k, e)| EntryUsage::of(k, e)));
        usage.extend(self.dependencies.entries().await.iter().map(|(k, e)| EntryUsage::of(k, e)));
        usage.sort_by(|a, b| b.access_count.cmp(&a.access_count).then_with(|| a.key.cmp(&b.key)));
        usage.truncate(ANALYSIS_TOP_ENTRIES);

        let recommendations = recommendations_for(&statistics);
        CacheAnalysis {
            statistics,
            most_accessed: usage,
            recommendations,
        }
    }

    // -- background sweep --

    /// Start the periodic maintenance loop. A second call is a no-op.
    ///
    /// The loop holds only a weak reference, so it also ends once the manager
    /// is dropped.
    pub async fn start_background_sweep(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock().await;
        if sweeper.is_some() {
            return;
        }
        let manager = Arc::downgrade(self);
        *sweeper = Some(BackgroundTask::spawn_periodic(
            "cache-sweep",
            self.cleanup_interval,
            move || {
                let manager = manager.clone();
                async move {
                    let Some(manager) = manager.upgrade() else {
                        return false;
                    };
                    manager.run_maintenance().await;
                    true
                }
            },
        ));
    }

    /// Stop the maintenance loop and wait for it.
    pub async fn shutdown(&self) {
        let task = self.sweeper.lock().await.take();
        if let Some(task) = task {
            task.stop().await;
            tracing::debug!("Cache sweeper stopped");
        }
    }

    // -- records --

    fn record_path(&self, key: &CacheKey) -> PathBuf {
        let stem: String = key
            .name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || "-_.@".contains(c) {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(key.kind.dir_name()).join(format!(
            "{stem}-{}-{}.json",
            key.primary.short(),
            key.aux.short()
        ))
    }

    async fn write_record<T: Serialize + ?Sized>(
        &self,
        key: &CacheKey,
        record: &T,
    ) -> Result<(), PipelineError> {
        let path = self.record_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(record)?;
        tokio::fs::write(&path, json).await?;
        Ok(())
    }

    async fn persist_record<T: Serialize + ?Sized>(&self, key: &CacheKey, record: &T) {
        if let Err(e) = self.write_record(key, record).await {
            tracing::warn!(key = %key, error = %e, "Failed to write cache record");
        }
    }

    async fn remove_record(&self, key: &CacheKey) -> Result<(), PipelineError> {
        match tokio::fs::remove_file(self.record_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn discard_record(&self, key: &CacheKey) {
        if let Err(e) = self.remove_record(key).await {
            tracing::warn!(key = %key, error = %e, "Failed to remove cache record");
        }
    }
}

/// Snapshot of all three caches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStatistics {
    pub scripts: CacheStats,
    pub libraries: CacheStats,
    pub dependency_graphs: CacheStats,
    pub total_entries: usize,
    pub total_size_bytes: u64,
    pub max_size_bytes: u64,
    pub hit_ratio: f64,
    pub generated_at: DateTime<Utc>,
}

impl CacheStatistics {
    pub fn total_hits(&self) -> u64 {
        self.scripts.hits + self.libraries.hits + self.dependency_graphs.hits
    }

    pub fn total_misses(&self) -> u64 {
        self.scripts.misses + self.libraries.misses + self.dependency_graphs.misses
    }

    pub fn total_evictions(&self) -> u64 {
        self.scripts.evictions + self.libraries.evictions + self.dependency_graphs.evictions
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryUsage {
    pub kind: CacheKind,
    pub key: String,
    pub name: String,
    pub access_count: u64,
    pub cached_at: DateTime<Utc>,
    pub idle_secs: u64,
}

impl EntryUsage {
    fn of<T>(key: &CacheKey, entry: &CacheEntry<T>) -> Self {
        Self {
            kind: key.kind,
            key: key.to_string(),
            name: key.name.clone(),
            access_count: entry.access_count,
            cached_at: entry.cached_at,
            idle_secs: entry.idle().as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheAnalysis {
    pub statistics: CacheStatistics,
    pub most_accessed: Vec<EntryUsage>,
    pub recommendations: Vec<String>,
}

impl CacheAnalysis {
    /// Write the analysis as pretty-printed JSON.
    pub async fn write_to(&self, path: &Path) -> Result<(), PipelineError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;
        tracing::info!(path = %path.display(), "Cache analysis written");
        Ok(())
    }
}

fn recommendations_for(stats: &CacheStatistics) -> Vec<String> {
    let mut out = Vec::new();
    let lookups = stats.total_hits() + stats.total_misses();

    if lookups >= 10 && stats.hit_ratio < 0.5 {
        out.push(format!(
            "Hit ratio is {:.0}% over {lookups} lookups; consider a longer max_age",
            stats.hit_ratio * 100.0
        ));
    }
    let limit = stats.max_size_bytes.saturating_mul(PRESSURE_PERCENT);
    if stats.total_size_bytes.saturating_mul(100) > limit {
        out.push(format!(
            "Cache holds {} of {} bytes; raise max_size_bytes to avoid LRU churn",
            stats.total_size_bytes, stats.max_size_bytes
        ));
    }
    if stats.total_evictions() > stats.total_hits() && stats.total_evictions() > 0 {
        out.push(format!(
            "{} evictions against {} hits; entries are replaced before they are reused",
            stats.total_evictions(),
            stats.total_hits()
        ));
    }
    out
}
