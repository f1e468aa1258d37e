//! Script execution on top of kiln's hybrid compiler.
//!
//! [`RuntimeIntegration`] is the single entry point: it compiles a script
//! together with its libraries, runs it, and reports the outcome as an
//! [`ExecutionResult`] while publishing status updates per execution.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use kiln_pipeline::KilnConfig;
//! use kiln_runtime::{BatchExecutionConfig, BatchScript, RuntimeIntegration};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = Arc::new(RuntimeIntegration::new(&KilnConfig::default()));
//! runtime.start().await?;
//!
//! let result = runtime.execute_script("hello", "echo hi", &[]).await;
//! assert!(result.is_success());
//!
//! let batch = runtime
//!     .execute_batch(
//!         vec![BatchScript::new("a", "echo a"), BatchScript::new("b", "echo b")],
//!         &BatchExecutionConfig::sequential(true),
//!     )
//!     .await?;
//! assert_eq!(batch.success_count, 2);
//!
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod error;
pub mod hot_reload;
pub mod integration;
pub mod isolation;

pub use batch::{BatchExecutionConfig, BatchFailure, BatchMode, BatchResult, BatchScript};
pub use error::RuntimeError;
pub use hot_reload::{ScriptReloadCallback, ScriptWatch};
pub use integration::{
    ExecutionOutcome, ExecutionResult, ExecutionStatus, RuntimeIntegration, StatusUpdate,
};
pub use isolation::IsolatedEnvironment;
