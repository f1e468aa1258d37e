use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::PipelineError;

/// Top-level kiln configuration, usually read from `kiln.toml`.
///
/// Every section and field is optional; omitted values fall back to the
/// defaults below. The core treats the result as immutable after
/// construction.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KilnConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub script: ScriptConfig,
    #[serde(default)]
    pub hot_reload: HotReloadConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_root")]
    pub root: PathBuf,
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_cache_root() -> PathBuf {
    dirs_path().join("cache")
}
fn default_max_size_bytes() -> u64 {
    512 * 1024 * 1024
}
fn default_max_age_secs() -> u64 {
    24 * 60 * 60
}
fn default_cleanup_interval_secs() -> u64 {
    30 * 60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: default_cache_root(),
            max_size_bytes: default_max_size_bytes(),
            max_age_secs: default_max_age_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl CacheConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfig {
    /// External build tool binary.
    #[serde(default = "default_program")]
    pub program: String,
    /// Arguments used when a descriptor carries none of its own.
    #[serde(default = "default_args")]
    pub default_args: Vec<String>,
    /// Files whose presence at the project root marks a buildable project.
    #[serde(default = "default_descriptor_files")]
    pub descriptor_files: Vec<String>,
    #[serde(default = "default_source_extensions")]
    pub source_extensions: Vec<String>,
    /// Output directory, relative to the project root.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_archive_extensions")]
    pub archive_extensions: Vec<String>,
    /// Build slots. Zero means "available parallelism".
    #[serde(default)]
    pub max_concurrent_builds: usize,
    #[serde(default)]
    pub build_timeout_secs: Option<u64>,
}

fn default_program() -> String {
    "cargo".into()
}
fn default_args() -> Vec<String> {
    vec!["build".into(), "--release".into()]
}
fn default_descriptor_files() -> Vec<String> {
    vec!["Cargo.toml".into()]
}
fn default_source_extensions() -> Vec<String> {
    vec!["rs".into(), "toml".into()]
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("target").join("release")
}
fn default_archive_extensions() -> Vec<String> {
    ["rlib", "a", "so", "dylib", "wasm"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            default_args: default_args(),
            descriptor_files: default_descriptor_files(),
            source_extensions: default_source_extensions(),
            output_dir: default_output_dir(),
            archive_extensions: default_archive_extensions(),
            max_concurrent_builds: 0,
            build_timeout_secs: None,
        }
    }
}

impl BuildConfig {
    pub fn build_slots(&self) -> usize {
        if self.max_concurrent_builds > 0 {
            return self.max_concurrent_builds;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }

    pub fn build_timeout(&self) -> Option<Duration> {
        self.build_timeout_secs.map(Duration::from_secs)
    }

    /// Tree filter used to fingerprint library sources.
    pub fn tree_filter(&self) -> kiln_core::TreeFilter {
        let mut skip_dirs = vec!["target".to_string()];
        if let Some(first) = self
            .output_dir
            .components()
            .next()
            .and_then(|c| c.as_os_str().to_str())
            && !skip_dirs.iter().any(|d| d == first)
        {
            skip_dirs.push(first.to_string());
        }
        kiln_core::TreeFilter {
            descriptor_files: self.descriptor_files.clone(),
            extensions: self.source_extensions.clone(),
            skip_dirs,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptConfig {
    #[serde(default = "default_auto_imports")]
    pub auto_imports: Vec<String>,
    #[serde(default)]
    pub compile_timeout_secs: Option<u64>,
    #[serde(default)]
    pub execution_timeout_secs: Option<u64>,
}

/// Symbols every pipeline script can use without importing them.
pub fn default_auto_imports() -> Vec<String> {
    [
        "pipeline.steps.sh",
        "pipeline.steps.echo",
        "pipeline.steps.checkout",
        "pipeline.steps.archive",
        "pipeline.steps.retry",
        "pipeline.dsl.stage",
        "pipeline.dsl.parallel",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            auto_imports: default_auto_imports(),
            compile_timeout_secs: None,
            execution_timeout_secs: None,
        }
    }
}

impl ScriptConfig {
    pub fn compile_timeout(&self) -> Option<Duration> {
        self.compile_timeout_secs.map(Duration::from_secs)
    }

    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HotReloadConfig {
    #[serde(default = "default_library_interval_ms")]
    pub library_interval_ms: u64,
    #[serde(default = "default_script_interval_ms")]
    pub script_interval_ms: u64,
}

fn default_library_interval_ms() -> u64 {
    2_000
}
fn default_script_interval_ms() -> u64 {
    1_000
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            library_interval_ms: default_library_interval_ms(),
            script_interval_ms: default_script_interval_ms(),
        }
    }
}

impl HotReloadConfig {
    pub fn library_interval(&self) -> Duration {
        Duration::from_millis(self.library_interval_ms)
    }

    pub fn script_interval(&self) -> Duration {
        Duration::from_millis(self.script_interval_ms)
    }
}

impl KilnConfig {
    pub fn from_file(path: &Path) -> Result<Self, PipelineError> {
        let content = std::fs::read_to_string(path).map_err(PipelineError::IoError)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, PipelineError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| PipelineError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the background loops cannot run with.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let intervals = [
            ("cache.cleanup_interval_secs", self.cache.cleanup_interval_secs),
            ("hot_reload.library_interval_ms", self.hot_reload.library_interval_ms),
            ("hot_reload.script_interval_ms", self.hot_reload.script_interval_ms),
        ];
        for (field, value) in intervals {
            if value == 0 {
                return Err(PipelineError::Config(format!("{field} must be greater than zero")));
            }
        }
        Ok(())
    }

    /// Default config location: ~/.kiln/kiln.toml
    pub fn default_path() -> PathBuf {
        dirs_path().join("kiln.toml")
    }
}

fn dirs_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kiln")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = KilnConfig::from_toml("").unwrap();
        assert_eq!(config.cache.max_age_secs, 24 * 60 * 60);
        assert_eq!(config.cache.cleanup_interval(), Duration::from_secs(1800));
        assert_eq!(config.build.program, "cargo");
        assert_eq!(config.build.default_args, vec!["build", "--release"]);
        assert_eq!(config.hot_reload.library_interval(), Duration::from_secs(2));
        assert!(config.script.auto_imports.contains(&"pipeline.steps.sh".to_string()));
        assert!(config.cache.root.ends_with(".kiln/cache"));
    }

    #[test]
    fn parses_full_config() {
        let toml_str = r#"
[cache]
root = "/var/cache/kiln"
max_size_bytes = 1048576
max_age_secs = 60
cleanup_interval_secs = 5

[build]
program = "gradle"
default_args = ["jar"]
descriptor_files = ["build.gradle", "build.gradle.kts"]
source_extensions = ["kt", "java"]
output_dir = "build/libs"
archive_extensions = ["jar"]
max_concurrent_builds = 2
build_timeout_secs = 600

[script]
auto_imports = ["pipeline.steps.sh"]
execution_timeout_secs = 30

[hot_reload]
library_interval_ms = 250
"#;
        let config = KilnConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.cache.root, PathBuf::from("/var/cache/kiln"));
        assert_eq!(config.cache.max_size_bytes, 1_048_576);
        assert_eq!(config.build.program, "gradle");
        assert_eq!(config.build.build_slots(), 2);
        assert_eq!(config.build.build_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(config.script.auto_imports, vec!["pipeline.steps.sh"]);
        assert_eq!(config.script.execution_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.hot_reload.library_interval_ms, 250);
        assert_eq!(config.hot_reload.script_interval_ms, 1_000);

        let filter = config.build.tree_filter();
        assert!(filter.skip_dirs.contains(&"build".to_string()));
    }

    #[test]
    fn zero_build_slots_means_available_parallelism() {
        let config = BuildConfig::default();
        assert!(config.build_slots() >= 1);
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let err = KilnConfig::from_toml("[hot_reload]\nscript_interval_ms = 0").unwrap_err();
        match err {
            PipelineError::Config(message) => {
                assert_eq!(message, "hot_reload.script_interval_ms must be greater than zero")
            }
            other => panic!("unexpected error {other:?}"),
        }

        let mut config = KilnConfig::default();
        assert!(config.validate().is_ok());
        config.cache.cleanup_interval_secs = 0;
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn malformed_config_is_a_config_error() {
        let err = KilnConfig::from_toml("[cache]\nmax_size_bytes = \"big\"").unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }
}
