use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use kiln_pipeline::build_tool::BuildToolInvoker;
use kiln_pipeline::cache::{CacheAnalysis, CacheManager, CacheStatistics};
use kiln_pipeline::task::BackgroundTask;
use kiln_pipeline::{
    CompilationMetrics, Diagnostic, HybridCompilation, HybridCompiler, KilnConfig,
    LibraryDescriptor, LibraryManager, LoadingEnvironment, PipelineError, PipelineMetrics,
    ScriptArtifact, ScriptCompiler,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, broadcast};

use crate::error::RuntimeError;
use crate::hot_reload::ScriptWatch;

/// Executions whose timelines are kept for [`RuntimeIntegration::execution_status`].
const STATUS_HISTORY: usize = 1024;
const STATUS_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Compiling,
    Executing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub execution_id: String,
    pub script: String,
    pub status: ExecutionStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success {
        output: serde_json::Value,
    },
    /// The script or one of its libraries did not compile.
    CompilationFailed {
        message: String,
        diagnostics: Vec<Diagnostic>,
    },
    RuntimeFailed {
        message: String,
        cause: Option<String>,
    },
    /// Compilation or execution ran past its configured limit.
    TimedOut {
        operation: String,
        after: Duration,
    },
}

impl ExecutionOutcome {
    fn timed_out(error: &PipelineError) -> Option<Self> {
        match error {
            PipelineError::Timeout { operation, after } => Some(Self::TimedOut {
                operation: operation.clone(),
                after: *after,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub script: String,
    pub outcome: ExecutionOutcome,
    pub metrics: Option<CompilationMetrics>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub isolated: bool,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ExecutionOutcome::Success { .. })
    }

    pub fn output(&self) -> Option<&serde_json::Value> {
        match &self.outcome {
            ExecutionOutcome::Success { output } => Some(output),
            _ => None,
        }
    }
}

#[derive(Default)]
struct StatusBoard {
    timelines: HashMap<String, Vec<StatusUpdate>>,
    order: VecDeque<String>,
}

/// The kiln runtime facade.
///
/// `RuntimeIntegration` compiles scripts with their libraries through the
/// [`HybridCompiler`], executes them, and tracks a status timeline per
/// execution. It also owns the script hot-reload pollers and, through the
/// compiler, the library manager and the cache.
///
/// # Threading
///
/// `RuntimeIntegration` is `Send + Sync` and is typically wrapped in `Arc`;
/// batch execution and hot reload require it.
pub struct RuntimeIntegration {
    pub(crate) compiler: Arc<HybridCompiler>,
    pub(crate) execution_timeout: Option<Duration>,
    pub(crate) script_poll_interval: Duration,
    statuses: RwLock<StatusBoard>,
    events: broadcast::Sender<StatusUpdate>,
    pub(crate) script_watches: Arc<RwLock<HashMap<String, ScriptWatch>>>,
    pub(crate) script_pollers: Mutex<HashMap<String, BackgroundTask>>,
}

impl RuntimeIntegration {
    /// Wire the full stack from configuration: cache, build tool, library
    /// manager, script compiler and hybrid compiler.
    pub fn new(config: &KilnConfig) -> Self {
        let metrics = Arc::new(PipelineMetrics::new());
        let cache = Arc::new(CacheManager::from_config(config));
        let builder = Arc::new(BuildToolInvoker::new(&config.build));
        let libraries =
            Arc::new(LibraryManager::new(builder, cache, config).with_metrics(metrics));
        let scripts = Arc::new(ScriptCompiler::new(&config.script));
        let compiler = HybridCompiler::new(libraries, scripts)
            .with_compile_timeout(config.script.compile_timeout());
        Self::with_compiler(Arc::new(compiler), config)
    }

    /// Use an already assembled compiler, e.g. one with a plugin registry or
    /// a custom library builder.
    pub fn with_compiler(compiler: Arc<HybridCompiler>, config: &KilnConfig) -> Self {
        let (events, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            compiler,
            execution_timeout: config.script.execution_timeout(),
            script_poll_interval: config.hot_reload.script_interval(),
            statuses: RwLock::new(StatusBoard::default()),
            events,
            script_watches: Arc::new(RwLock::new(HashMap::new())),
            script_pollers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    pub fn with_script_poll_interval(mut self, interval: Duration) -> Self {
        self.script_poll_interval = interval;
        self
    }

    pub fn compiler(&self) -> &Arc<HybridCompiler> {
        &self.compiler
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        self.compiler.cache()
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        self.compiler.library_manager().metrics()
    }

    /// Create the cache layout and start the cache maintenance loop.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        self.cache().init().await?;
        self.cache().start_background_sweep().await;
        tracing::info!(root = %self.cache().root().display(), "Runtime started");
        Ok(())
    }

    /// Compile `content` with its libraries and run it.
    ///
    /// Never fails: every error is reported in the returned outcome.
    pub async fn execute_script(
        &self,
        name: &str,
        content: &str,
        libraries: &[LibraryDescriptor],
    ) -> ExecutionResult {
        let run = Run::begin(self, name).await;
        match self.compile(&run, content, libraries).await {
            Ok(compilation) => {
                self.finish_execution(run, &compilation, &compilation.loading_environment)
                    .await
            }
            Err(result) => *result,
        }
    }

    /// Compile phase of an execution; a failure is already a finished result.
    pub(crate) async fn compile(
        &self,
        run: &Run,
        content: &str,
        libraries: &[LibraryDescriptor],
    ) -> Result<HybridCompilation, Box<ExecutionResult>> {
        match self
            .compiler
            .compile_with_libraries(content, &run.script, libraries)
            .await
        {
            Ok(compilation) => Ok(compilation),
            Err(e) => {
                tracing::info!(
                    execution = %run.id,
                    script = %run.script,
                    error = %e,
                    "Compilation failed"
                );
                let outcome = ExecutionOutcome::timed_out(&e).unwrap_or_else(|| {
                    ExecutionOutcome::CompilationFailed {
                        message: e.to_string(),
                        diagnostics: e.diagnostics().to_vec(),
                    }
                });
                Err(Box::new(self.finish(run.clone(), outcome, None, false).await))
            }
        }
    }

    /// Execute phase against `environment`, then record the result.
    pub(crate) async fn finish_execution(
        &self,
        run: Run,
        compilation: &HybridCompilation,
        environment: &LoadingEnvironment,
    ) -> ExecutionResult {
        self.publish(&run, ExecutionStatus::Executing).await;
        let outcome = match self.run_script(&compilation.script, environment).await {
            Ok(output) => ExecutionOutcome::Success { output },
            Err(e) => Self::runtime_failure(&e),
        };
        self.finish(run, outcome, Some(compilation.metrics), environment.isolated)
            .await
    }

    pub(crate) fn runtime_failure(error: &PipelineError) -> ExecutionOutcome {
        if let Some(outcome) = ExecutionOutcome::timed_out(error) {
            return outcome;
        }
        let message = match error {
            PipelineError::ScriptExecution(message) => message.clone(),
            other => other.to_string(),
        };
        ExecutionOutcome::RuntimeFailed {
            message,
            cause: std::error::Error::source(error).map(ToString::to_string),
        }
    }

    async fn run_script(
        &self,
        script: &ScriptArtifact,
        environment: &LoadingEnvironment,
    ) -> Result<serde_json::Value, PipelineError> {
        let execution = self.compiler.script_compiler().execute(script, environment);
        match self.execution_timeout {
            Some(limit) => tokio::time::timeout(limit, execution).await.map_err(|_| {
                PipelineError::timeout(format!("execution of {}", script.name), limit)
            })?,
            None => execution.await,
        }
    }

    pub(crate) async fn finish(
        &self,
        run: Run,
        outcome: ExecutionOutcome,
        metrics: Option<CompilationMetrics>,
        isolated: bool,
    ) -> ExecutionResult {
        let success = matches!(outcome, ExecutionOutcome::Success { .. });
        let status = if success {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };
        self.publish(&run, status).await;
        self.metrics().record_execution(success);

        let result = ExecutionResult {
            execution_id: run.id,
            script: run.script,
            outcome,
            metrics,
            started_at: run.started_at,
            duration: run.started.elapsed(),
            isolated,
        };
        tracing::info!(
            execution = %result.execution_id,
            script = %result.script,
            success,
            duration_ms = result.duration.as_millis() as u64,
            "Execution finished"
        );
        result
    }

    pub(crate) async fn publish(&self, run: &Run, status: ExecutionStatus) {
        let update = StatusUpdate {
            execution_id: run.id.clone(),
            script: run.script.clone(),
            status,
            at: Utc::now(),
        };
        {
            let mut board = self.statuses.write().await;
            if !board.timelines.contains_key(&run.id) {
                board.order.push_back(run.id.clone());
                while board.order.len() > STATUS_HISTORY {
                    if let Some(oldest) = board.order.pop_front() {
                        board.timelines.remove(&oldest);
                    }
                }
            }
            board
                .timelines
                .entry(run.id.clone())
                .or_default()
                .push(update.clone());
        }
        let _ = self.events.send(update);
    }

    /// Latest status of an execution.
    pub async fn execution_status(&self, execution_id: &str) -> Option<ExecutionStatus> {
        self.statuses
            .read()
            .await
            .timelines
            .get(execution_id)
            .and_then(|timeline| timeline.last())
            .map(|update| update.status)
    }

    /// Every status an execution went through, oldest first.
    pub async fn execution_timeline(&self, execution_id: &str) -> Vec<StatusUpdate> {
        self.statuses
            .read()
            .await
            .timelines
            .get(execution_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.events.subscribe()
    }

    pub async fn cache_statistics(&self) -> CacheStatistics {
        self.cache().statistics().await
    }

    /// Cache analysis, also written as JSON to `path` when given.
    pub async fn export_cache_analysis(
        &self,
        path: Option<&Path>,
    ) -> Result<CacheAnalysis, RuntimeError> {
        let analysis = self.cache().export_analysis().await;
        if let Some(path) = path {
            analysis.write_to(path).await?;
        }
        Ok(analysis)
    }

    /// Stop every background task: script pollers, library pollers and the
    /// cache sweeper.
    pub async fn shutdown(&self) {
        let pollers: Vec<BackgroundTask> = self
            .script_pollers
            .lock()
            .await
            .drain()
            .map(|(_, task)| task)
            .collect();
        for task in pollers {
            task.stop().await;
        }
        self.script_watches.write().await.clear();

        self.compiler.library_manager().shutdown().await;
        self.cache().shutdown().await;
        tracing::info!("Runtime shut down");
    }
}

/// Identity and clock of one execution.
#[derive(Debug, Clone)]
pub(crate) struct Run {
    pub(crate) id: String,
    pub(crate) script: String,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl Run {
    pub(crate) async fn begin(runtime: &RuntimeIntegration, script: &str) -> Self {
        let run = Self {
            id: format!("exec_{}", uuid::Uuid::new_v4().simple()),
            script: script.to_string(),
            started_at: Utc::now(),
            started: Instant::now(),
        };
        runtime.publish(&run, ExecutionStatus::Compiling).await;
        run
    }
}
