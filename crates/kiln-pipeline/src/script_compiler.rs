use std::collections::HashMap;
use std::sync::Arc;

use kiln_core::{ContentFingerprint, ContentHasher};
use tokio::sync::RwLock;

use crate::config::ScriptConfig;
use crate::error::PipelineError;
use crate::plugins::PluginRegistry;
use crate::script;
use crate::types::{LoadingEnvironment, ScriptArtifact};

/// Last compilation of one script name.
struct CompileSlot {
    fingerprint: ContentFingerprint,
    imports: Vec<String>,
    artifact: ScriptArtifact,
}

/// Compiles pipeline scripts into executable units and runs them.
///
/// Keeps one compile slot per script name: recompiling identical content
/// with an identical import set returns the previous unit.
pub struct ScriptCompiler {
    base_imports: Vec<String>,
    plugins: Option<Arc<dyn PluginRegistry>>,
    slots: RwLock<HashMap<String, CompileSlot>>,
}

impl ScriptCompiler {
    pub fn new(config: &ScriptConfig) -> Self {
        Self {
            base_imports: config.auto_imports.clone(),
            plugins: None,
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_plugins(mut self, registry: Arc<dyn PluginRegistry>) -> Self {
        self.plugins = Some(registry);
        self
    }

    pub fn base_imports(&self) -> &[String] {
        &self.base_imports
    }

    /// Base auto-imports, then plugin imports, then `extra`, de-duplicated.
    pub fn active_imports(&self, extra: &[String]) -> Vec<String> {
        let plugin_imports = self
            .plugins
            .as_ref()
            .map(|p| p.all_imports())
            .unwrap_or_default();

        let mut imports: Vec<String> = Vec::new();
        for import in self.base_imports.iter().chain(&plugin_imports).chain(extra) {
            if !imports.contains(import) {
                imports.push(import.clone());
            }
        }
        imports
    }

    pub async fn compile(
        &self,
        content: &str,
        name: &str,
    ) -> Result<ScriptArtifact, PipelineError> {
        self.compile_with_imports(content, name, &[]).await
    }

    pub async fn compile_with_imports(
        &self,
        content: &str,
        name: &str,
        extra_imports: &[String],
    ) -> Result<ScriptArtifact, PipelineError> {
        let fingerprint = ContentHasher::fingerprint_str(content);
        let imports = self.active_imports(extra_imports);

        {
            let slots = self.slots.read().await;
            if let Some(slot) = slots.get(name)
                && slot.fingerprint == fingerprint
                && slot.imports == imports
            {
                tracing::debug!(script = %name, "Reusing compiled unit");
                return Ok(slot.artifact.clone());
            }
        }

        let compiled = script::compile(content, name, &imports).map_err(|diagnostics| {
            tracing::info!(script = %name, errors = diagnostics.len(), "Script compilation failed");
            PipelineError::ScriptCompilation(diagnostics)
        })?;

        let artifact = ScriptArtifact {
            name: name.to_string(),
            source_content: content.to_string(),
            active_imports: compiled.imports.clone(),
            provided_imports: imports.clone(),
            executable_unit: Arc::new(compiled),
            from_cache: false,
        };

        tracing::debug!(script = %name, fingerprint = %fingerprint.short(), "Script compiled");

        let mut slots = self.slots.write().await;
        slots.insert(
            name.to_string(),
            CompileSlot {
                fingerprint,
                imports,
                artifact: artifact.clone(),
            },
        );
        Ok(artifact)
    }

    /// Execute a compiled script. Every failure is reported as
    /// [`PipelineError::ScriptExecution`].
    pub async fn execute(
        &self,
        artifact: &ScriptArtifact,
        environment: &LoadingEnvironment,
    ) -> Result<serde_json::Value, PipelineError> {
        tracing::debug!(script = %artifact.name, environment = %environment.id, "Executing script");
        script::execute(&artifact.executable_unit, environment)
            .await
            .map_err(PipelineError::ScriptExecution)
    }
}
