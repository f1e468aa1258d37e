use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One compile-time problem in a script, 1-based line and column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            message: message.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.column, self.message)
    }
}

fn render_diagnostics(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn render_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(name, message)| format!("{name}: {message}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source directory not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("not a valid build project: {} (expected one of {expected})", .path.display())]
    InvalidProjectShape { path: PathBuf, expected: String },

    #[error("build failed: {message}")]
    BuildToolFailure {
        message: String,
        #[source]
        cause: Option<std::io::Error>,
    },

    #[error("artifact not found in {}", .0.display())]
    ArtifactNotFound(PathBuf),

    #[error("{} library build(s) failed: {}", .failures.len(), render_failures(.failures))]
    LibraryBuild { failures: Vec<(String, String)> },

    #[error("script compilation failed: {}", render_diagnostics(.0))]
    ScriptCompilation(Vec<Diagnostic>),

    #[error("script execution failed: {0}")]
    ScriptExecution(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("operation cancelled")]
    Cancelled,

    #[error("unexpected error: {0}")]
    Unknown(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn build_failed(message: impl Into<String>) -> Self {
        PipelineError::BuildToolFailure {
            message: message.into(),
            cause: None,
        }
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        PipelineError::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Diagnostics carried by a compilation failure, empty otherwise.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            PipelineError::ScriptCompilation(diagnostics) => diagnostics,
            _ => &[],
        }
    }
}

impl From<kiln_core::CacheError> for PipelineError {
    fn from(err: kiln_core::CacheError) -> Self {
        match err {
            kiln_core::CacheError::TreeNotFound(path) => PipelineError::SourceNotFound(path),
            kiln_core::CacheError::Io { source, .. } => PipelineError::IoError(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_not_found_mentions_not_found() {
        let err = PipelineError::SourceNotFound(PathBuf::from("/does/not/exist"));
        let msg = err.to_string();
        assert!(msg.contains("not found"));
        assert!(msg.contains("/does/not/exist"));
    }

    #[test]
    fn library_failures_are_aggregated() {
        let err = PipelineError::LibraryBuild {
            failures: vec![
                ("core".into(), "build failed: exit 1".into()),
                ("utils".into(), "artifact not found in /x".into()),
            ],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("2 library build(s) failed"));
        assert!(msg.contains("core: build failed"));
        assert!(msg.contains("utils: artifact not found"));
    }

    #[test]
    fn compilation_keeps_every_diagnostic() {
        let err = PipelineError::ScriptCompilation(vec![
            Diagnostic::new("unknown statement 'ech'", 1, 1),
            Diagnostic::new("undefined variable 'x'", 3, 6),
        ]);
        assert_eq!(err.diagnostics().len(), 2);
        assert!(err.to_string().contains("3:6: undefined variable 'x'"));
    }
}
