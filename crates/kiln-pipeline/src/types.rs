use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kiln_core::{CacheKey, CacheKind, ContentFingerprint, ContentHasher};
use serde::{Deserialize, Serialize};

use crate::script::CompiledScript;

/// An externally built library requested by a script.
///
/// `name`, `version` and the source path together form its cache identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryDescriptor {
    pub name: String,
    pub source_path: PathBuf,
    pub version: String,
    #[serde(default)]
    pub build_args: Vec<String>,
    /// Preferred archive file stem when the build emits several archives.
    #[serde(default)]
    pub archive_name: Option<String>,
}

impl LibraryDescriptor {
    pub fn new(
        name: impl Into<String>,
        source_path: impl Into<PathBuf>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source_path: source_path.into(),
            version: version.into(),
            build_args: Vec::new(),
            archive_name: None,
        }
    }

    pub fn with_build_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.build_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_archive_name(mut self, name: impl Into<String>) -> Self {
        self.archive_name = Some(name.into());
        self
    }

    fn source_path_fingerprint(&self) -> ContentFingerprint {
        ContentHasher::fingerprint_str(&self.source_path.to_string_lossy())
    }

    /// `name@version#<source path digest>`, stable across runs.
    pub fn identity(&self) -> String {
        format!(
            "{}@{}#{}",
            self.name,
            self.version,
            self.source_path_fingerprint().short()
        )
    }

    pub fn cache_key(&self) -> CacheKey {
        let mut aux: Vec<String> = self.build_args.clone();
        if let Some(archive) = &self.archive_name {
            aux.push(format!("archive={archive}"));
        }
        CacheKey::new(
            CacheKind::Library,
            format!("{}@{}", self.name, self.version),
            self.source_path_fingerprint(),
            ContentHasher::fingerprint_unordered(aux),
        )
    }
}

/// A successfully built library archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryArtifact {
    pub descriptor: LibraryDescriptor,
    pub archive_file: PathBuf,
    pub compiled_at: DateTime<Utc>,
    pub source_fingerprint: ContentFingerprint,
    pub compilation_duration_ms: u64,
    #[serde(default)]
    pub from_cache: bool,
}

impl LibraryArtifact {
    /// Archive size on disk right now; zero when the file has gone missing.
    pub async fn archive_size(&self) -> u64 {
        tokio::fs::metadata(&self.archive_file)
            .await
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

/// A compiled script, ready to execute.
#[derive(Debug, Clone)]
pub struct ScriptArtifact {
    pub name: String,
    pub source_content: String,
    pub executable_unit: Arc<CompiledScript>,
    /// Every import the unit resolved against, its own `import` lines included.
    pub active_imports: Vec<String>,
    /// The imports the compiler supplied: base, plugin and caller extras.
    pub provided_imports: Vec<String>,
    pub from_cache: bool,
}

impl ScriptArtifact {
    pub fn fingerprint(&self) -> &ContentFingerprint {
        &self.executable_unit.fingerprint
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptRef {
    pub name: String,
    pub fingerprint: ContentFingerprint,
}

/// Where a script's symbols resolve from at execution time: the archives of
/// its libraries plus the script unit itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadingEnvironment {
    pub id: String,
    pub libraries: BTreeMap<String, PathBuf>,
    pub script: Option<ScriptRef>,
    /// True when the archives were staged into a private directory for one
    /// execution.
    pub isolated: bool,
}

impl LoadingEnvironment {
    pub fn empty() -> Self {
        Self {
            id: format!("env_{}", uuid::Uuid::new_v4().simple()),
            libraries: BTreeMap::new(),
            script: None,
            isolated: false,
        }
    }

    /// Combined environment over a script and its built libraries.
    pub fn combined<'a, I>(script: &ScriptArtifact, libraries: I) -> Self
    where
        I: IntoIterator<Item = &'a LibraryArtifact>,
    {
        let mut env = Self::empty();
        for artifact in libraries {
            env.libraries
                .insert(artifact.descriptor.name.clone(), artifact.archive_file.clone());
        }
        env.script = Some(ScriptRef {
            name: script.name.clone(),
            fingerprint: script.fingerprint().clone(),
        });
        env
    }

    pub fn resolve(&self, library: &str) -> Option<&Path> {
        self.libraries.get(library).map(PathBuf::as_path)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CompilationMetrics {
    pub total_duration: Duration,
    pub script_duration: Duration,
    pub library_count: usize,
    pub cache_hits: usize,
}

impl CompilationMetrics {
    pub fn cache_hit_ratio(&self) -> f64 {
        if self.library_count == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.library_count as f64
        }
    }
}

/// A script fused with its libraries.
#[derive(Debug, Clone)]
pub struct HybridCompilation {
    pub script: ScriptArtifact,
    pub libraries: BTreeMap<String, LibraryArtifact>,
    pub loading_environment: LoadingEnvironment,
    pub metrics: CompilationMetrics,
}

/// Build order and dependency edges over a set of libraries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyGraph {
    /// Library identities in build order.
    pub order: Vec<String>,
    /// identity -> identities it depends on
    pub edges: BTreeMap<String, Vec<String>>,
}
