//! Implementation of the mro pipeline language.
//!
//! An mro source declares file types, stages and pipelines, and optionally a
//! top-level call invoking one of them:
//!
//! ```mro
//! filetype json;
//!
//! stage SUM_SQUARES(
//!     in  float[] values,
//!     out float   sum,
//!     src py      "stages/sum_squares",
//! )
//!
//! pipeline SUM_SQUARE_PIPELINE(
//!     in  float[] values,
//!     out float   sum,
//! )
//! {
//!     call SUM_SQUARES(
//!         values = self.values,
//!     )
//!     return (
//!         sum = SUM_SQUARES.sum,
//!     )
//! }
//! ```
//!
//! The concrete grammar and lexer live in a front end behind the
//! [`SourceParser`] trait; this module owns everything after that seam: the
//! include resolver, the semantic checker's six passes, and the canonical
//! formatter.

pub mod ast;
pub mod check;
pub mod format;
pub mod include;
pub mod intern;
pub mod json;
pub mod loc;
pub mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;

use crate::mro::ast::Ast;
use crate::mro::intern::Interner;
use crate::mro::loc::{SourceFile, SourceLoc};

/// An error found while resolving includes or checking a source tree.
#[derive(Debug, Error, Diagnostic)]
pub enum CompileError {
    /// The front end could not make sense of the source text.
    #[error("{loc}: syntax error: {message}")]
    #[diagnostic(code(mro::syntax))]
    Syntax {
        /// What the front end reported.
        message: String,
        /// Where the front end gave up.
        loc: SourceLoc,
    },

    /// A type name was declared more than once.
    #[error("{loc}: type '{id}' is already declared")]
    #[diagnostic(code(mro::duplicate_type))]
    DuplicateType {
        /// The re-declared name.
        id: Arc<str>,
        /// The offending declaration.
        loc: SourceLoc,
    },

    /// A type name did not resolve.
    #[error("{loc}: unknown type '{name}'")]
    #[diagnostic(code(mro::unknown_type))]
    UnknownType {
        /// The unresolved name.
        name: String,
        /// Where it was used.
        loc: SourceLoc,
    },

    /// A stage or pipeline identifier was declared more than once.
    #[error("{loc}: callable '{id}' is already declared")]
    #[diagnostic(code(mro::duplicate_callable))]
    DuplicateCallable {
        /// The re-declared identifier.
        id: Arc<str>,
        /// The offending declaration.
        loc: SourceLoc,
    },

    /// A parameter name repeats within one parameter list.
    #[error("{loc}: parameter '{id}' is already declared")]
    #[diagnostic(code(mro::duplicate_param))]
    DuplicateParam {
        /// The repeated name.
        id: Arc<str>,
        /// The offending declaration.
        loc: SourceLoc,
    },

    /// A stage source clause used an unsupported language tag.
    #[error("{loc}: stage '{stage}' uses unsupported source language '{tag}'")]
    #[diagnostic(code(mro::invalid_language))]
    InvalidLanguage {
        /// The unsupported tag.
        tag: Arc<str>,
        /// The declaring stage.
        stage: Arc<str>,
        /// The source clause.
        loc: SourceLoc,
    },

    /// A retain clause named something that is not an output.
    #[error("{loc}: retained value '{id}' is not an output of '{owner}'")]
    #[diagnostic(code(mro::unknown_retain))]
    UnknownRetain {
        /// The name that did not resolve.
        id: Arc<str>,
        /// The declaring stage or pipeline.
        owner: Arc<str>,
        /// The retain clause.
        loc: SourceLoc,
    },

    /// A call statement named an undeclared callable.
    #[error("{loc}: '{id}' is not a declared stage or pipeline")]
    #[diagnostic(code(mro::unknown_callable))]
    UnknownCallable {
        /// The unresolved identifier.
        id: Arc<str>,
        /// The call site.
        loc: SourceLoc,
    },

    /// Two calls in one pipeline share an instance identifier.
    #[error("{loc}: call '{id}' is already declared in this pipeline")]
    #[diagnostic(code(mro::duplicate_call))]
    DuplicateCall {
        /// The repeated instance identifier.
        id: Arc<str>,
        /// The second call site.
        loc: SourceLoc,
    },

    /// The call graph contains a cycle.
    #[error("{loc}: pipeline '{id}' transitively calls itself")]
    #[diagnostic(code(mro::call_cycle))]
    CallCycle {
        /// The pipeline on the cycle.
        id: Arc<str>,
        /// Its declaration site.
        loc: SourceLoc,
    },

    /// A binding named a parameter the callee does not declare.
    #[error("{loc}: '{callee}' has no parameter '{id}'")]
    #[diagnostic(code(mro::unknown_param))]
    UnknownParam {
        /// The callee.
        callee: Arc<str>,
        /// The unknown parameter name.
        id: Arc<str>,
        /// The binding site.
        loc: SourceLoc,
    },

    /// One parameter was bound twice in the same call.
    #[error("{loc}: parameter '{id}' is bound more than once")]
    #[diagnostic(code(mro::duplicate_binding))]
    DuplicateBinding {
        /// The twice-bound name.
        id: Arc<str>,
        /// The second binding site.
        loc: SourceLoc,
    },

    /// A callee input was left unbound.
    #[error("{loc}: no binding for parameter '{id}' of '{callee}'")]
    #[diagnostic(code(mro::missing_binding))]
    MissingBinding {
        /// The callee.
        callee: Arc<str>,
        /// The unbound parameter.
        id: Arc<str>,
        /// The call site.
        loc: SourceLoc,
    },

    /// A reference pointed at a call later in the pipeline.
    #[error("{loc}: reference to '{id}' before it is called")]
    #[diagnostic(code(mro::forward_reference))]
    ForwardReference {
        /// The referenced call.
        id: Arc<str>,
        /// The reference site.
        loc: SourceLoc,
    },

    /// A reference pointed at nothing in scope.
    #[error("{loc}: reference to unknown {kind} '{id}'")]
    #[diagnostic(code(mro::unknown_reference))]
    UnknownReference {
        /// "call" or "pipeline input".
        kind: &'static str,
        /// The dangling identifier.
        id: Arc<str>,
        /// The reference site.
        loc: SourceLoc,
    },

    /// A reference named an output the producer does not declare.
    #[error("{loc}: '{call}' has no output '{output}'")]
    #[diagnostic(code(mro::unknown_output))]
    UnknownOutput {
        /// The producing call.
        call: Arc<str>,
        /// The unknown output.
        output: Arc<str>,
        /// The reference site.
        loc: SourceLoc,
    },

    /// A bound expression's type disagrees with the declared parameter type.
    #[error("{loc}: expected '{expected}' but got '{got}'")]
    #[diagnostic(code(mro::type_mismatch))]
    TypeMismatch {
        /// The declared parameter type.
        expected: String,
        /// The bound expression's type.
        got: String,
        /// The binding site.
        loc: SourceLoc,
    },

    /// An include directive did not resolve on the search paths.
    #[error("{loc}: include '{name}' not found")]
    #[diagnostic(code(mro::include_not_found))]
    IncludeNotFound {
        /// The included name.
        name: String,
        /// The directive.
        loc: SourceLoc,
    },

    /// Following an include directive would re-enter a file.
    #[error("{loc}: include cycle through '{}'", file.display())]
    #[diagnostic(code(mro::include_cycle))]
    IncludeCycle {
        /// The file that would be re-entered.
        file: PathBuf,
        /// The directive closing the cycle.
        loc: SourceLoc,
    },

    /// One file included the same target twice.
    #[error("{loc}: '{name}' included multiple times")]
    #[diagnostic(code(mro::duplicate_include))]
    DuplicateInclude {
        /// The doubly-included name.
        name: String,
        /// The second directive.
        loc: SourceLoc,
    },

    /// A source file could not be read.
    #[error("{loc}: failed to read '{}': {inner}", file.display())]
    #[diagnostic(code(mro::file_reading))]
    FileReading {
        /// The unreadable file.
        file: PathBuf,
        /// The underlying io error.
        inner: std::io::Error,
        /// The directive or argument that named the file.
        loc: SourceLoc,
    },

    /// A stage's source path was not found on the search paths.
    #[error("{loc}: searched ({searched}) but stage source path not found '{path}'")]
    #[diagnostic(code(mro::source_path))]
    SourcePathNotFound {
        /// The searched paths, comma separated.
        searched: String,
        /// The missing path.
        path: String,
        /// The stage's source clause.
        loc: SourceLoc,
    },

    /// Unhandled internal error.
    #[error("INTERNAL ERROR - this is a bug, please report it.\n{0}")]
    #[diagnostic(code(mro::internal_error))]
    InternalError(String),
}

/// The front end that turns source text into an unchecked [`Ast`].
///
/// The include resolver hands every file it loads to this trait; front ends
/// must intern identifiers through the provided [`Interner`] so the rest of
/// the compiler can compare them cheaply.
pub trait SourceParser {
    /// Parse one file's text into an unchecked ast.
    fn parse(
        &self,
        src: &str,
        file: &Arc<SourceFile>,
        intern: &mut Interner,
    ) -> Result<Ast, Vec<CompileError>>;
}

/// The artifacts of a successful compilation.
pub struct CompileResult {
    /// The fully resolved, checked ast.
    pub ast: Ast,
    /// A canonical rendering of the combined source.
    pub formatted: String,
    /// The names of every include pulled in by the entry file.
    pub include_names: Vec<String>,
    /// The interner the ast's identifiers live in.
    pub intern: Interner,
}

/// Compile source text: resolve includes, run the checker's passes, and
/// render the canonical formatting.
///
/// `src_path` is where `src` came from, used for error attribution and as
/// the first include search root. `mro_paths` is the ordered list of extra
/// search paths. When `check_src` is set, stage source paths are verified
/// to exist on the search paths or `$PATH`.
pub fn compile_source(
    parser: &dyn SourceParser,
    src: &str,
    src_path: &Path,
    mro_paths: &[PathBuf],
    check_src: bool,
) -> Result<CompileResult, Vec<CompileError>> {
    let mut intern = Interner::new();
    let mut ast = include::parse_source(parser, src, src_path, mro_paths, &mut intern)?;
    let include_names = ast
        .includes
        .iter()
        .map(|inc| inc.value.clone())
        .collect::<Vec<_>>();
    check::compile(&mut ast, &mut intern)?;
    if check_src {
        check::check_src_paths(&ast, mro_paths)?;
    }
    let formatted = format::format_ast(&ast);
    Ok(CompileResult {
        ast,
        formatted,
        include_names,
        intern,
    })
}

/// Compile an mro file from disk. See [`compile_source`].
pub fn compile_file(
    parser: &dyn SourceParser,
    path: &Path,
    mro_paths: &[PathBuf],
    check_src: bool,
) -> Result<CompileResult, Vec<CompileError>> {
    let src = std::fs::read_to_string(path).map_err(|inner| {
        vec![CompileError::FileReading {
            file: path.to_owned(),
            inner,
            loc: SourceLoc::synthetic(),
        }]
    })?;
    compile_source(parser, &src, path, mro_paths, check_src)
}
