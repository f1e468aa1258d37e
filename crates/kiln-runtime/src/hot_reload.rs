use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use kiln_core::{ContentFingerprint, ContentHasher};
use kiln_pipeline::LibraryDescriptor;
use kiln_pipeline::task::BackgroundTask;

use crate::error::RuntimeError;
use crate::integration::{ExecutionResult, RuntimeIntegration};

/// Invoked with the result of every re-execution triggered by a change.
pub type ScriptReloadCallback = Arc<dyn Fn(&ExecutionResult) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ScriptWatch {
    pub name: String,
    pub path: PathBuf,
    pub last_fingerprint: ContentFingerprint,
    pub last_reload: Option<DateTime<Utc>>,
}

impl RuntimeIntegration {
    /// Watch `script_path` and re-run the script whenever its content
    /// changes. Re-enabling a watched script replaces its poller.
    pub async fn enable_hot_reload(
        self: &Arc<Self>,
        name: &str,
        script_path: impl AsRef<Path>,
        libraries: Vec<LibraryDescriptor>,
        callback: ScriptReloadCallback,
    ) -> Result<(), RuntimeError> {
        let path = script_path.as_ref().to_path_buf();
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| RuntimeError::HotReload {
                script: name.to_string(),
                message: format!("cannot read {}: {e}", path.display()),
            })?;

        self.script_watches.write().await.insert(
            name.to_string(),
            ScriptWatch {
                name: name.to_string(),
                path: path.clone(),
                last_fingerprint: ContentHasher::fingerprint_str(&content),
                last_reload: None,
            },
        );

        let runtime = Arc::downgrade(self);
        let libraries = Arc::new(libraries);
        let watched = name.to_string();
        let task = BackgroundTask::spawn_periodic(
            format!("script-reload:{name}"),
            self.script_poll_interval,
            move || {
                let runtime = Weak::clone(&runtime);
                let libraries = Arc::clone(&libraries);
                let callback = Arc::clone(&callback);
                let name = watched.clone();
                async move {
                    let Some(runtime) = runtime.upgrade() else {
                        return false;
                    };
                    runtime.poll_script(&name, &libraries, &callback).await;
                    true
                }
            },
        );

        let previous = self.script_pollers.lock().await.insert(name.to_string(), task);
        if let Some(previous) = previous {
            previous.stop().await;
        }
        tracing::info!(
            script = %name,
            path = %path.display(),
            interval_ms = self.script_poll_interval.as_millis() as u64,
            "Script hot reload enabled"
        );
        Ok(())
    }

    /// Stop watching a script. Returns whether it was watched.
    pub async fn disable_hot_reload(&self, name: &str) -> bool {
        let task = self.script_pollers.lock().await.remove(name);
        self.script_watches.write().await.remove(name);
        match task {
            Some(task) => {
                task.stop().await;
                tracing::info!(script = %name, "Script hot reload disabled");
                true
            }
            None => false,
        }
    }

    pub async fn script_watch(&self, name: &str) -> Option<ScriptWatch> {
        self.script_watches.read().await.get(name).cloned()
    }

    async fn poll_script(
        &self,
        name: &str,
        libraries: &[LibraryDescriptor],
        callback: &ScriptReloadCallback,
    ) {
        let Some(path) = self.script_watches.read().await.get(name).map(|w| w.path.clone()) else {
            return;
        };
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(
                    script = %name,
                    path = %path.display(),
                    error = %e,
                    "Hot reload poll failed"
                );
                return;
            }
        };

        let current = ContentHasher::fingerprint_str(&content);
        {
            let mut watches = self.script_watches.write().await;
            let Some(watch) = watches.get_mut(name) else {
                return;
            };
            if watch.last_fingerprint == current {
                return;
            }
            watch.last_fingerprint = current;
        }

        tracing::info!(script = %name, "Script changed, re-executing");
        let result = self.execute_script(name, &content, libraries).await;
        if let Some(watch) = self.script_watches.write().await.get_mut(name) {
            watch.last_reload = Some(Utc::now());
        }
        self.metrics().record_hot_reload();
        if !result.is_success() {
            tracing::warn!(
                script = %name,
                execution = %result.execution_id,
                "Hot reload execution failed"
            );
        }
        (**callback)(&result);
    }
}
