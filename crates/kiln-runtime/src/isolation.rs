use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kiln_pipeline::{LibraryDescriptor, LoadingEnvironment};
use tempfile::TempDir;

use crate::error::RuntimeError;
use crate::integration::{ExecutionOutcome, ExecutionResult, Run, RuntimeIntegration};

const SCRATCH_PREFIX: &str = "kiln-isolated-";

/// A loading environment whose archives live in a private scratch directory.
///
/// The scratch directory holds copies of exactly the libraries resolved for
/// one execution and disappears on [`teardown`](Self::teardown) (or on drop).
pub struct IsolatedEnvironment {
    scratch: Option<TempDir>,
    environment: LoadingEnvironment,
}

impl IsolatedEnvironment {
    /// Copy every archive of `source` into `<scratch>/<library>/<file>`.
    pub async fn stage(source: &LoadingEnvironment) -> Result<Self, RuntimeError> {
        let libraries = source.libraries.clone();
        let (scratch, staged) = tokio::task::spawn_blocking(move || stage_archives(&libraries))
            .await
            .map_err(|e| RuntimeError::Isolation(format!("staging task failed: {e}")))??;

        let mut environment = LoadingEnvironment::empty();
        environment.libraries = staged;
        environment.script = source.script.clone();
        environment.isolated = true;

        tracing::debug!(
            environment = %environment.id,
            scratch = %scratch.path().display(),
            libraries = environment.libraries.len(),
            "Isolated environment staged"
        );
        Ok(Self {
            scratch: Some(scratch),
            environment,
        })
    }

    pub fn environment(&self) -> &LoadingEnvironment {
        &self.environment
    }

    pub fn scratch_dir(&self) -> Option<&Path> {
        self.scratch.as_ref().map(TempDir::path)
    }

    /// Remove the scratch directory. Failures are logged only.
    pub async fn teardown(mut self) {
        let Some(scratch) = self.scratch.take() else {
            return;
        };
        let id = self.environment.id.clone();
        match tokio::task::spawn_blocking(move || scratch.close()).await {
            Ok(Ok(())) => tracing::debug!(environment = %id, "Isolated environment removed"),
            Ok(Err(e)) => tracing::warn!(
                environment = %id,
                error = %e,
                "Failed to remove isolated environment"
            ),
            Err(e) => {
                tracing::warn!(environment = %id, error = %e, "Isolated teardown task failed")
            }
        }
    }
}

fn stage_archives(
    libraries: &BTreeMap<String, PathBuf>,
) -> Result<(TempDir, BTreeMap<String, PathBuf>), RuntimeError> {
    let scratch = tempfile::Builder::new().prefix(SCRATCH_PREFIX).tempdir()?;
    let mut staged = BTreeMap::new();
    for (name, archive) in libraries {
        let file_name = archive.file_name().ok_or_else(|| {
            RuntimeError::Isolation(format!(
                "archive of {name} has no file name: {}",
                archive.display()
            ))
        })?;
        let dir = scratch.path().join(name);
        std::fs::create_dir_all(&dir)?;
        let target = dir.join(file_name);
        std::fs::copy(archive, &target)?;
        staged.insert(name.clone(), target);
    }
    Ok((scratch, staged))
}

impl RuntimeIntegration {
    /// Like [`execute_script`](Self::execute_script), but the script only
    /// sees copies of its resolved libraries staged into a private scratch
    /// directory. The scratch directory is always torn down.
    pub async fn execute_in_isolated_environment(
        &self,
        name: &str,
        content: &str,
        libraries: &[LibraryDescriptor],
    ) -> ExecutionResult {
        let run = Run::begin(self, name).await;
        let compilation = match self.compile(&run, content, libraries).await {
            Ok(compilation) => compilation,
            Err(result) => return *result,
        };

        let isolated = match IsolatedEnvironment::stage(&compilation.loading_environment).await {
            Ok(isolated) => isolated,
            Err(e) => {
                tracing::warn!(
                    execution = %run.id,
                    script = %name,
                    error = %e,
                    "Failed to stage isolated environment"
                );
                let outcome = ExecutionOutcome::RuntimeFailed {
                    message: format!("failed to stage isolated environment: {e}"),
                    cause: std::error::Error::source(&e).map(ToString::to_string),
                };
                return self.finish(run, outcome, Some(compilation.metrics), true).await;
            }
        };

        let result = self
            .finish_execution(run, &compilation, isolated.environment())
            .await;
        isolated.teardown().await;
        result
    }
}
