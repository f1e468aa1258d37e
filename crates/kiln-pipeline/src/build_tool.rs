use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;
use kiln_core::{ContentFingerprint, ContentHasher, TreeFilter};

use crate::config::BuildConfig;
use crate::error::PipelineError;
use crate::types::{LibraryArtifact, LibraryDescriptor};

/// Environment variable carrying a descriptor's archive-name override to the
/// build tool.
pub const ARCHIVE_NAME_ENV: &str = "KILN_ARCHIVE_NAME";

/// Archive stems with these suffixes are side artifacts, never the library.
const SIDE_ARTIFACT_SUFFIXES: &[&str] = &["-sources", "-docs", "-doc", "-javadoc"];

/// Anything that can turn a library descriptor into a built artifact.
///
/// [`BuildToolInvoker`] is the production implementation; tests substitute
/// their own to observe scheduling.
pub trait LibraryBuilder: Send + Sync {
    fn build<'a>(
        &'a self,
        descriptor: &'a LibraryDescriptor,
    ) -> Pin<Box<dyn Future<Output = Result<LibraryArtifact, PipelineError>> + Send + 'a>>;
}

/// Drives an external build tool (cargo by default) over a library source
/// tree and picks up the archive it produces.
pub struct BuildToolInvoker {
    program: String,
    default_args: Vec<String>,
    descriptor_files: Vec<String>,
    output_dir: PathBuf,
    archive_extensions: Vec<String>,
    filter: TreeFilter,
    timeout: Option<Duration>,
}

impl BuildToolInvoker {
    pub fn new(config: &BuildConfig) -> Self {
        Self {
            program: config.program.clone(),
            default_args: config.default_args.clone(),
            descriptor_files: config.descriptor_files.clone(),
            output_dir: config.output_dir.clone(),
            archive_extensions: config.archive_extensions.clone(),
            filter: config.tree_filter(),
            timeout: config.build_timeout(),
        }
    }

    /// Override the build tool binary.
    /// Useful when the tool is not on PATH (common in daemon contexts).
    pub fn with_bin(mut self, path: impl Into<String>) -> Self {
        self.program = path.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn tree_filter(&self) -> &TreeFilter {
        &self.filter
    }

    /// Absolute, normalized project directory that carries a build descriptor.
    pub async fn resolve_project(&self, source_path: &Path) -> Result<PathBuf, PipelineError> {
        let absolute = std::path::absolute(source_path)
            .map_err(|_| PipelineError::SourceNotFound(source_path.to_path_buf()))?;
        if !tokio::fs::try_exists(&absolute).await.unwrap_or(false) {
            return Err(PipelineError::SourceNotFound(absolute));
        }
        let project_dir = tokio::fs::canonicalize(&absolute).await?;

        let mut has_descriptor = false;
        if project_dir.is_dir() {
            for descriptor in &self.descriptor_files {
                if tokio::fs::try_exists(project_dir.join(descriptor))
                    .await
                    .unwrap_or(false)
                {
                    has_descriptor = true;
                    break;
                }
            }
        }
        if !has_descriptor {
            return Err(PipelineError::InvalidProjectShape {
                path: project_dir,
                expected: self.descriptor_files.join(", "),
            });
        }
        Ok(project_dir)
    }

    /// Fingerprint of the library sources under `project_dir`.
    pub async fn source_fingerprint(
        &self,
        project_dir: &Path,
    ) -> Result<ContentFingerprint, PipelineError> {
        fingerprint_sources(project_dir.to_path_buf(), self.filter.clone()).await
    }

    pub async fn build(
        &self,
        descriptor: &LibraryDescriptor,
    ) -> Result<LibraryArtifact, PipelineError> {
        let started = Instant::now();
        let project_dir = self.resolve_project(&descriptor.source_path).await?;
        let source_fingerprint = self.source_fingerprint(&project_dir).await?;

        let args: &[String] = if descriptor.build_args.is_empty() {
            &self.default_args
        } else {
            &descriptor.build_args
        };

        tracing::info!(
            library = %descriptor.name,
            version = %descriptor.version,
            project = %project_dir.display(),
            tool = %self.program,
            "Building library"
        );

        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(args)
            .current_dir(&project_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(archive_name) = &descriptor.archive_name {
            command.env(ARCHIVE_NAME_ENV, archive_name);
        }

        let run = command.output();
        let result = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, run).await.map_err(|_| {
                PipelineError::timeout(format!("build of {}", descriptor.name), limit)
            })?,
            None => run.await,
        };
        let output = result.map_err(|e| PipelineError::BuildToolFailure {
            message: format!("failed to run {}: {e}. Is it installed?", self.program),
            cause: Some(e),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Err(PipelineError::build_failed(format!(
                "{} exited with {}:\nstdout: {}\nstderr: {}",
                self.program,
                output.status,
                stdout.trim_end(),
                stderr.trim_end()
            )));
        }

        let archive_file = self
            .locate_archive(&project_dir, descriptor.archive_name.as_deref())
            .await?;
        let elapsed = started.elapsed();

        tracing::info!(
            library = %descriptor.name,
            archive = %archive_file.display(),
            duration_ms = elapsed.as_millis() as u64,
            "Library built"
        );

        Ok(LibraryArtifact {
            descriptor: descriptor.clone(),
            archive_file,
            compiled_at: Utc::now(),
            source_fingerprint,
            compilation_duration_ms: elapsed.as_millis() as u64,
            from_cache: false,
        })
    }

    /// Newest archive in the output directory, skipping sources/docs
    /// archives. An archive whose stem matches `preferred` wins outright.
    pub async fn locate_archive(
        &self,
        project_dir: &Path,
        preferred: Option<&str>,
    ) -> Result<PathBuf, PipelineError> {
        let output_dir = project_dir.join(&self.output_dir);
        if !output_dir.is_dir() {
            return Err(PipelineError::ArtifactNotFound(output_dir));
        }

        let mut newest: Option<(SystemTime, PathBuf)> = None;
        let mut entries = tokio::fs::read_dir(&output_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !self.is_library_archive(&path) {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }

            if let Some(preferred) = preferred
                && path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .is_some_and(|stem| stem == preferred || stem == format!("lib{preferred}"))
            {
                return Ok(path);
            }

            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            if newest.as_ref().is_none_or(|(best, _)| modified > *best) {
                newest = Some((modified, path));
            }
        }

        newest
            .map(|(_, path)| path)
            .ok_or(PipelineError::ArtifactNotFound(output_dir))
    }

    fn is_library_archive(&self, path: &Path) -> bool {
        let has_extension = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.archive_extensions.iter().any(|a| a == ext));
        let side_artifact = path
            .file_stem()
            .and_then(|s| s.to_str())
            .is_some_and(|stem| SIDE_ARTIFACT_SUFFIXES.iter().any(|suffix| stem.ends_with(suffix)));
        has_extension && !side_artifact
    }
}

impl Default for BuildToolInvoker {
    fn default() -> Self {
        Self::new(&BuildConfig::default())
    }
}

impl LibraryBuilder for BuildToolInvoker {
    fn build<'a>(
        &'a self,
        descriptor: &'a LibraryDescriptor,
    ) -> Pin<Box<dyn Future<Output = Result<LibraryArtifact, PipelineError>> + Send + 'a>> {
        Box::pin(BuildToolInvoker::build(self, descriptor))
    }
}

/// Fingerprint a source tree on the blocking pool.
pub async fn fingerprint_sources(
    root: PathBuf,
    filter: TreeFilter,
) -> Result<ContentFingerprint, PipelineError> {
    tokio::task::spawn_blocking(move || ContentHasher::fingerprint_tree(&root, &filter))
        .await
        .map_err(|e| PipelineError::Unknown(format!("fingerprint task failed: {e}")))?
        .map_err(PipelineError::from)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh_invoker() -> BuildToolInvoker {
        BuildToolInvoker::default().with_bin("sh")
    }

    fn scaffold(root: &Path) {
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join("Cargo.toml"), "[package]\nname = \"demo\"\n").unwrap();
        std::fs::write(root.join("src/lib.rs"), "pub fn demo() {}\n").unwrap();
    }

    fn descriptor(root: &Path, script: &str) -> LibraryDescriptor {
        LibraryDescriptor::new("demo", root, "0.1.0").with_build_args(["-c", script])
    }

    const PRODUCE_RLIB: &str =
        "mkdir -p target/release && printf archive > target/release/libdemo.rlib";

    #[tokio::test]
    async fn missing_source_directory_fails_with_not_found() {
        let invoker = sh_invoker();
        let err = invoker
            .build(&LibraryDescriptor::new("x", "/does/not/exist", "1.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::SourceNotFound(_)));
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn directory_without_descriptor_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let err = sh_invoker()
            .build(&descriptor(tmp.path(), PRODUCE_RLIB))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidProjectShape { .. }));
        assert!(err.to_string().contains("not a valid build project"));
    }

    #[tokio::test]
    async fn builds_and_locates_archive() {
        let tmp = TempDir::new().unwrap();
        scaffold(tmp.path());

        let invoker = sh_invoker();
        let artifact = invoker.build(&descriptor(tmp.path(), PRODUCE_RLIB)).await.unwrap();

        assert!(artifact.archive_file.ends_with("target/release/libdemo.rlib"));
        assert!(!artifact.from_cache);
        let expected = ContentHasher::fingerprint_tree(
            &std::fs::canonicalize(tmp.path()).unwrap(),
            invoker.tree_filter(),
        )
        .unwrap();
        assert_eq!(artifact.source_fingerprint, expected);
    }

    #[tokio::test]
    async fn failing_tool_is_a_build_failure() {
        let tmp = TempDir::new().unwrap();
        scaffold(tmp.path());
        let err = sh_invoker()
            .build(&descriptor(tmp.path(), "echo broken >&2; exit 3"))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("build failed"));
        assert!(msg.contains("broken"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_build_failure_with_cause() {
        let tmp = TempDir::new().unwrap();
        scaffold(tmp.path());
        let err = BuildToolInvoker::default()
            .with_bin("kiln-definitely-not-a-real-tool")
            .build(&LibraryDescriptor::new("demo", tmp.path(), "0.1.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::BuildToolFailure { cause: Some(_), .. }));
    }

    #[tokio::test]
    async fn successful_build_without_archive_is_artifact_not_found() {
        let tmp = TempDir::new().unwrap();
        scaffold(tmp.path());
        let err = sh_invoker()
            .build(&descriptor(tmp.path(), "mkdir -p target/release"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ArtifactNotFound(_)));
    }

    #[tokio::test]
    async fn locate_prefers_newest_and_skips_side_artifacts() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("target/release");
        std::fs::create_dir_all(&out).unwrap();

        let old = SystemTime::now() - Duration::from_secs(3600);
        let new = SystemTime::now();
        for (name, mtime) in [
            ("libold.rlib", old),
            ("libnew.rlib", new - Duration::from_secs(60)),
            ("libnew-sources.rlib", new),
            ("notes.txt", new),
        ] {
            let file = std::fs::File::create(out.join(name)).unwrap();
            file.set_modified(mtime).unwrap();
        }

        let invoker = sh_invoker();
        let found = invoker.locate_archive(tmp.path(), None).await.unwrap();
        assert!(found.ends_with("libnew.rlib"));

        let preferred = invoker.locate_archive(tmp.path(), Some("old")).await.unwrap();
        assert!(preferred.ends_with("libold.rlib"));
    }

    #[tokio::test]
    async fn archive_name_override_reaches_the_tool() {
        let tmp = TempDir::new().unwrap();
        scaffold(tmp.path());
        let desc = descriptor(
            tmp.path(),
            "mkdir -p target/release && touch target/release/libother.rlib \
             && printf x > target/release/$KILN_ARCHIVE_NAME.rlib",
        )
        .with_archive_name("custom");

        let artifact = sh_invoker().build(&desc).await.unwrap();
        assert!(artifact.archive_file.ends_with("custom.rlib"));
    }

    #[tokio::test]
    async fn slow_builds_time_out() {
        let tmp = TempDir::new().unwrap();
        scaffold(tmp.path());
        let err = sh_invoker()
            .with_timeout(Duration::from_millis(100))
            .build(&descriptor(tmp.path(), "sleep 5"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Timeout { .. }));
    }
}
