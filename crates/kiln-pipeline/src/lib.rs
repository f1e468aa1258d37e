//! Hybrid compilation for kiln pipelines.
//!
//! Libraries are built by an external tool ([`build_tool`]), scripts by the
//! embedded compiler ([`script_compiler`]); [`hybrid::HybridCompiler`] fuses
//! both into one loading environment, and [`cache::CacheManager`] keeps every
//! artifact keyed by its content fingerprint.

pub mod build_tool;
pub mod cache;
pub mod config;
pub mod error;
pub mod hybrid;
pub mod library_manager;
pub mod metrics;
pub mod plugins;
pub mod script;
pub mod script_compiler;
pub mod task;
pub mod types;

pub use build_tool::{BuildToolInvoker, LibraryBuilder};
pub use cache::{CacheAnalysis, CacheManager, CacheStatistics};
pub use config::KilnConfig;
pub use error::{Diagnostic, PipelineError};
pub use hybrid::HybridCompiler;
pub use library_manager::{BuildStatus, LibraryBuildReport, LibraryManager};
pub use metrics::PipelineMetrics;
pub use script_compiler::ScriptCompiler;
pub use types::{
    CompilationMetrics, DependencyGraph, HybridCompilation, LibraryArtifact, LibraryDescriptor,
    LoadingEnvironment, ScriptArtifact,
};
