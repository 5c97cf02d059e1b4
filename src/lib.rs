//! Aqueduct is a pipeline runtime for declarative scientific workflows.
//!
//! Pipelines are written in the mro language: stages are leaf computations
//! with typed inputs and outputs backed by external code, and pipelines wire
//! stages (and other pipelines) together. The [`mro`] module holds the
//! semantic checker, include resolver and canonical formatter for compiled
//! sources; the [`engine`] module materializes a compiled invocation into a
//! pipestance on disk and drives it to a terminal state.

pub mod engine;
pub mod mro;

use miette::Diagnostic;
use thiserror::Error;

/// An error produced by aqueduct
#[derive(Debug, Error, Diagnostic)]
pub enum AqueductError {
    /// We failed to compile the source.
    #[error("compile error")]
    Compile {
        /// The accumulated compile errors
        #[related]
        errors: Vec<mro::CompileError>,
    },

    /// Something failed at runtime.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Runtime(#[from] engine::RuntimeError),
}

impl From<Vec<mro::CompileError>> for AqueductError {
    fn from(errors: Vec<mro::CompileError>) -> Self {
        Self::Compile { errors }
    }
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
