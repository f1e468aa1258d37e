//! The pipeline script language.
//!
//! Scripts are line oriented. Blank lines and lines starting with `#` are
//! ignored; every other line is one statement:
//!
//! ```text
//! import plugins.docker.*          # extend the import set
//! require deploy-utils             # library must be in the loading environment
//! set target = staging
//! echo deploying to ${target}
//! invoke sh ./deploy.sh ${target}  # record a step for the step engine
//! sleep 250                        # milliseconds
//! fail unreachable                 # abort with a message
//! ```
//!
//! Compilation resolves every `invoke` symbol against the active imports and
//! checks that interpolated variables are bound before use, collecting all
//! problems as [`Diagnostic`](crate::error::Diagnostic)s.

mod interpreter;
mod parser;

use std::time::Duration;

use kiln_core::ContentFingerprint;

pub use interpreter::execute;
pub use parser::{compile, resolve_symbol};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Variable(String),
}

/// Text with `${name}` placeholders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Template {
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Echo(Template),
    Set { name: String, value: Template },
    Require(String),
    Invoke { symbol: String, args: Vec<Template> },
    Sleep(Duration),
    Fail(Template),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub number: usize,
    pub statement: Statement,
}

/// Executable unit produced by [`compile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledScript {
    pub name: String,
    pub fingerprint: ContentFingerprint,
    pub lines: Vec<Line>,
    /// Imports in effect: configured imports followed by the script's own.
    pub imports: Vec<String>,
    /// Libraries named by `require`, in first-use order.
    pub required_libraries: Vec<String>,
}
