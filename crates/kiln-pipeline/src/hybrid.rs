use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::CacheManager;
use crate::error::PipelineError;
use crate::library_manager::LibraryManager;
use crate::script_compiler::ScriptCompiler;
use crate::types::{
    CompilationMetrics, HybridCompilation, LibraryDescriptor, LoadingEnvironment, ScriptArtifact,
};

/// Fuses a script with the libraries it needs.
///
/// Library work goes through the [`LibraryManager`] (cache first, bounded
/// parallel builds); the script goes through the script cache and then the
/// [`ScriptCompiler`].
pub struct HybridCompiler {
    libraries: Arc<LibraryManager>,
    scripts: Arc<ScriptCompiler>,
    compile_timeout: Option<Duration>,
}

impl HybridCompiler {
    pub fn new(libraries: Arc<LibraryManager>, scripts: Arc<ScriptCompiler>) -> Self {
        Self {
            libraries,
            scripts,
            compile_timeout: None,
        }
    }

    pub fn with_compile_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.compile_timeout = timeout;
        self
    }

    pub fn library_manager(&self) -> &Arc<LibraryManager> {
        &self.libraries
    }

    pub fn script_compiler(&self) -> &Arc<ScriptCompiler> {
        &self.scripts
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        self.libraries.cache()
    }

    pub async fn compile_with_libraries(
        &self,
        content: &str,
        name: &str,
        libraries: &[LibraryDescriptor],
    ) -> Result<HybridCompilation, PipelineError> {
        let started = Instant::now();

        let report = self.libraries.build_libraries(libraries).await.into_result()?;
        let cache_hits = report.compiled_from_cache;

        // library-derived imports are not extracted; the base set applies
        let dependencies: Vec<String> = libraries.iter().map(LibraryDescriptor::identity).collect();
        let script_started = Instant::now();
        let script = self.compile_script(content, name, &dependencies).await?;
        let script_duration = script_started.elapsed();

        let loading_environment = LoadingEnvironment::combined(&script, &report.artifacts);
        let libraries: BTreeMap<_, _> = report
            .artifacts
            .into_iter()
            .map(|artifact| (artifact.descriptor.name.clone(), artifact))
            .collect();

        let metrics = CompilationMetrics {
            total_duration: started.elapsed(),
            script_duration,
            library_count: libraries.len(),
            cache_hits,
        };

        tracing::info!(
            script = %name,
            libraries = metrics.library_count,
            cache_hits,
            script_from_cache = script.from_cache,
            duration_ms = metrics.total_duration.as_millis() as u64,
            "Hybrid compilation finished"
        );

        Ok(HybridCompilation {
            script,
            libraries,
            loading_environment,
            metrics,
        })
    }

    /// Script cache first; a fresh compile is written through. A cached unit
    /// is only reused while the compiler still supplies the same imports.
    pub async fn compile_script(
        &self,
        content: &str,
        name: &str,
        dependencies: &[String],
    ) -> Result<ScriptArtifact, PipelineError> {
        let cache = self.cache();
        let imports = self.scripts.active_imports(&[]);
        if let Some(hit) = cache
            .get_cached_script_with_imports(content, name, dependencies, &imports)
            .await
        {
            tracing::debug!(script = %name, "Script served from cache");
            return Ok(hit);
        }

        let compile = self.scripts.compile(content, name);
        let artifact = match self.compile_timeout {
            Some(limit) => tokio::time::timeout(limit, compile)
                .await
                .map_err(|_| PipelineError::timeout(format!("compile of {name}"), limit))??,
            None => compile.await?,
        };
        self.libraries.metrics().record_script_compiled();

        cache.cache_script(&artifact, dependencies).await;
        Ok(artifact)
    }
}
