use kiln_pipeline::PipelineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Hot reload failed for {script}: {message}")]
    HotReload { script: String, message: String },

    #[error("Isolated environment error: {0}")]
    Isolation(String),

    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
