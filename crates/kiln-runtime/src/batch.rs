use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kiln_pipeline::LibraryDescriptor;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::RuntimeError;
use crate::integration::{ExecutionResult, RuntimeIntegration};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    /// Concurrent, bounded by `max_concurrency`. Every script runs.
    #[default]
    Parallel,
    /// Input order, one at a time.
    Sequential,
    /// Sequential over the resolved script order. The dependency graph of
    /// every library in the batch is resolved first.
    DependencyOrdered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchExecutionConfig {
    #[serde(default)]
    pub mode: BatchMode,
    /// Honoured by the sequential modes only.
    #[serde(default)]
    pub stop_on_first_failure: bool,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_max_concurrency() -> usize {
    4
}

impl Default for BatchExecutionConfig {
    fn default() -> Self {
        Self {
            mode: BatchMode::default(),
            stop_on_first_failure: false,
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl BatchExecutionConfig {
    pub fn sequential(stop_on_first_failure: bool) -> Self {
        Self {
            mode: BatchMode::Sequential,
            stop_on_first_failure,
            ..Self::default()
        }
    }

    pub fn parallel(max_concurrency: usize) -> Self {
        Self {
            mode: BatchMode::Parallel,
            max_concurrency,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchScript {
    pub name: String,
    pub content: String,
    pub libraries: Vec<LibraryDescriptor>,
}

impl BatchScript {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            libraries: Vec::new(),
        }
    }

    pub fn with_libraries(mut self, libraries: Vec<LibraryDescriptor>) -> Self {
        self.libraries = libraries;
        self
    }
}

/// Results keyed by script name; a later script with the same name replaces
/// an earlier one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchResult {
    pub execution_results: BTreeMap<String, ExecutionResult>,
    pub total_duration: Duration,
    pub success_count: usize,
    pub failure_count: usize,
}

impl BatchResult {
    fn record(&mut self, result: ExecutionResult) {
        if result.is_success() {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        self.execution_results.insert(result.script.clone(), result);
    }
}

/// The batch itself could not be driven to completion. Script failures are
/// not batch failures; they are counted in [`BatchResult`].
#[derive(Debug, Error)]
#[error("batch execution failed: {message}")]
pub struct BatchFailure {
    pub message: String,
    /// Whatever finished before the failure.
    pub partial: BatchResult,
    #[source]
    pub cause: Option<RuntimeError>,
}

impl RuntimeIntegration {
    pub async fn execute_batch(
        self: &Arc<Self>,
        scripts: Vec<BatchScript>,
        config: &BatchExecutionConfig,
    ) -> Result<BatchResult, BatchFailure> {
        let started = Instant::now();
        tracing::info!(scripts = scripts.len(), mode = ?config.mode, "Batch execution started");

        let mut result = match config.mode {
            BatchMode::Parallel => self.run_parallel(scripts, config.max_concurrency).await?,
            BatchMode::Sequential => {
                self.run_sequential(scripts, config.stop_on_first_failure)
                    .await
            }
            BatchMode::DependencyOrdered => {
                let ordered = self.resolve_script_order(scripts).await;
                self.run_sequential(ordered, config.stop_on_first_failure)
                    .await
            }
        };
        result.total_duration = started.elapsed();

        tracing::info!(
            succeeded = result.success_count,
            failed = result.failure_count,
            duration_ms = result.total_duration.as_millis() as u64,
            "Batch execution finished"
        );
        Ok(result)
    }

    /// Scripts declare no dependencies on each other yet, so the order is the
    /// input order. The libraries they share are resolved in one graph.
    async fn resolve_script_order(&self, scripts: Vec<BatchScript>) -> Vec<BatchScript> {
        let mut libraries: Vec<LibraryDescriptor> = Vec::new();
        for library in scripts.iter().flat_map(|s| &s.libraries) {
            if !libraries.iter().any(|l| l.identity() == library.identity()) {
                libraries.push(library.clone());
            }
        }
        if !libraries.is_empty() {
            let order = self
                .compiler
                .library_manager()
                .resolve_build_order(&libraries)
                .await;
            tracing::debug!(libraries = order.len(), "Batch library order resolved");
        }
        scripts
    }

    async fn run_sequential(
        &self,
        scripts: Vec<BatchScript>,
        stop_on_first_failure: bool,
    ) -> BatchResult {
        let mut result = BatchResult::default();
        for script in scripts {
            let execution = self
                .execute_script(&script.name, &script.content, &script.libraries)
                .await;
            let failed = !execution.is_success();
            result.record(execution);
            if failed && stop_on_first_failure {
                tracing::info!(script = %script.name, "Stopping batch after first failure");
                break;
            }
        }
        result
    }

    async fn run_parallel(
        self: &Arc<Self>,
        scripts: Vec<BatchScript>,
        max_concurrency: usize,
    ) -> Result<BatchResult, BatchFailure> {
        let permits = Arc::new(Semaphore::new(max_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for script in scripts {
            let runtime = Arc::clone(self);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| RuntimeError::Unexpected(anyhow::Error::new(e)))?;
                Ok::<_, RuntimeError>(
                    runtime
                        .execute_script(&script.name, &script.content, &script.libraries)
                        .await,
                )
            });
        }

        let mut result = BatchResult::default();
        let mut failure: Option<(String, RuntimeError)> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(execution)) => result.record(execution),
                Ok(Err(e)) => {
                    failure.get_or_insert(("batch slot unavailable".to_string(), e));
                }
                Err(e) => {
                    let cause = RuntimeError::Unexpected(
                        anyhow::Error::new(e).context("batch task failed"),
                    );
                    failure.get_or_insert(("batch task failed".to_string(), cause));
                }
            }
        }

        match failure {
            Some((message, cause)) => Err(BatchFailure {
                message,
                partial: result,
                cause: Some(cause),
            }),
            None => Ok(result),
        }
    }
}
