//! The abstract syntax tree of a compilation: top-level declarations, call
//! statements, and binding expressions.
//!
//! The concrete grammar lives in a front end behind the
//! [`SourceParser`](crate::mro::SourceParser) seam; this module is the data
//! model that front end produces and the semantic checker annotates.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::mro::loc::{SourceFile, SourceLoc};

/// A rooted collection of top-level declarations.
///
/// Mutable while the include resolver merges files and the checker runs its
/// passes; immutable afterwards.
#[derive(Default)]
pub struct Ast {
    /// `@include` directives of the entry file, in order.
    pub includes: Vec<Include>,
    /// Declared user types and file types, in declaration order.
    pub type_decls: Vec<TypeDecl>,
    /// Declared stages, in declaration order.
    pub stages: Vec<Stage>,
    /// Declared pipelines, in declaration order.
    pub pipelines: Vec<Pipeline>,
    /// The top-level call, if this source carries an invocation.
    pub call: Option<CallStm>,
    /// Every file that participated in the compilation, by absolute path.
    pub files: HashMap<PathBuf, Arc<SourceFile>>,
    /// Callable lookup table; built by the checker's callables pass.
    pub callables: Callables,
    /// Declared type table; built by the checker's types pass.
    pub type_table: crate::mro::types::TypeTable,
}

impl Ast {
    /// Merge `earlier` into this ast, placing its declarations first.
    ///
    /// Included files sort ahead of the file that included them, so later
    /// passes see declarations before their uses in the common case.
    pub fn merge(&mut self, mut earlier: Ast) {
        fn prepend<T>(dst: &mut Vec<T>, mut src: Vec<T>) {
            std::mem::swap(dst, &mut src);
            dst.append(&mut src);
        }
        prepend(&mut self.type_decls, std::mem::take(&mut earlier.type_decls));
        prepend(&mut self.stages, std::mem::take(&mut earlier.stages));
        prepend(&mut self.pipelines, std::mem::take(&mut earlier.pipelines));
        if self.call.is_none() {
            self.call = earlier.call.take();
        }
        self.files.extend(earlier.files.drain());
    }

    /// Look up a callable declaration by id.
    #[must_use]
    pub fn callable(&self, id: &str) -> Option<CallableRef<'_>> {
        match self.callables.table.get(id)? {
            CallableId::Stage(index) => self.stages.get(*index).map(CallableRef::Stage),
            CallableId::Pipeline(index) => self.pipelines.get(*index).map(CallableRef::Pipeline),
        }
    }
}

/// An `@include` directive.
#[derive(Debug, Clone)]
pub struct Include {
    /// The file name as written in the directive.
    pub value: String,
    /// Where the directive appeared.
    pub loc: SourceLoc,
}

/// A top-level type declaration.
#[derive(Debug, Clone)]
pub enum TypeDecl {
    /// A named alias of an existing type.
    UserType {
        /// The declared name.
        id: Arc<str>,
        /// The aliased type, which must itself resolve.
        target: TypeName,
        /// Declaration site.
        loc: SourceLoc,
    },
    /// A file type carrying an extension tag.
    FileType {
        /// The declared name, also used as the extension tag.
        id: Arc<str>,
        /// Declaration site.
        loc: SourceLoc,
    },
}

impl TypeDecl {
    /// The declared name.
    #[must_use]
    pub fn id(&self) -> &Arc<str> {
        match self {
            Self::UserType { id, .. } | Self::FileType { id, .. } => id,
        }
    }

    /// The declaration site.
    #[must_use]
    pub fn loc(&self) -> &SourceLoc {
        match self {
            Self::UserType { loc, .. } | Self::FileType { loc, .. } => loc,
        }
    }
}

/// A type as written: a base name plus an array dimensionality.
///
/// `int[][]` is `TypeName { name: "int", array_dim: 2 }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeName {
    /// The base type name.
    pub name: Arc<str>,
    /// How many array levels wrap the base type.
    pub array_dim: u8,
}

impl TypeName {
    /// A scalar (non-array) type name.
    #[must_use]
    pub fn scalar(name: Arc<str>) -> Self {
        Self { name, array_dim: 0 }
    }

    /// The same base type with one fewer array level, if any.
    #[must_use]
    pub fn element(&self) -> Option<Self> {
        self.array_dim.checked_sub(1).map(|dim| Self {
            name: Arc::clone(&self.name),
            array_dim: dim,
        })
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}", self.name)?;
        for _ in 0..self.array_dim {
            write!(fmt, "[]")?;
        }
        Ok(())
    }
}

/// One declared input or output parameter.
#[derive(Debug, Clone)]
pub struct Param {
    /// The parameter name, unique within its list.
    pub id: Arc<str>,
    /// The declared type.
    pub ty: TypeName,
    /// Declaration site.
    pub loc: SourceLoc,
}

/// An ordered parameter list with a name lookup table.
#[derive(Debug, Clone, Default)]
pub struct Params {
    /// Parameters in declaration order.
    pub list: Vec<Param>,
    /// Name to index into `list`; built by the checker.
    pub table: HashMap<Arc<str>, usize>,
}

impl Params {
    /// Look up a parameter by name.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Param> {
        self.table.get(id).and_then(|index| self.list.get(*index))
    }
}

/// The language a stage's external code is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageLang {
    /// Driven through the python adapter.
    Python,
    /// A self-contained executable.
    Exec,
    /// A compiled binary linked against the runtime adapter.
    Compiled,
}

impl StageLang {
    /// Parse a language tag as written in a source clause.
    #[must_use]
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "py" | "python" => Some(Self::Python),
            "exec" => Some(Self::Exec),
            "comp" => Some(Self::Compiled),
            _ => None,
        }
    }

    /// The canonical tag used when formatting.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::Python => "py",
            Self::Exec => "exec",
            Self::Compiled => "comp",
        }
    }

    /// Whether the source path is expected to exist on the search paths.
    ///
    /// `exec` and `comp` stages resolve through `$PATH` at run time, so they
    /// are exempt from compile-time source checking.
    #[must_use]
    pub fn check_path(self) -> bool {
        matches!(self, Self::Python)
    }
}

/// A stage's reference to its external code.
#[derive(Debug, Clone)]
pub struct SrcDescriptor {
    /// The language tag as written; validated by the stages pass.
    pub lang_tag: Arc<str>,
    /// The parsed language; filled in by the stages pass.
    pub lang: Option<StageLang>,
    /// Path to the code, resolved against the search paths.
    pub path: String,
    /// Extra arguments passed to the code.
    pub args: Vec<String>,
    /// Declaration site.
    pub loc: SourceLoc,
}

/// Resource hints a stage declares for its jobs.
#[derive(Debug, Clone, Default)]
pub struct ResourceHints {
    /// Threads per job.
    pub threads: Option<usize>,
    /// Memory per job, in GB.
    pub mem_gb: Option<usize>,
    /// Scheduler-special tag, passed through to cluster templates.
    pub special: Option<String>,
    /// Apply the volatile-deletion policy per fork as soon as that fork's
    /// consumers finish, rather than when the whole stage is consumed.
    pub strict_volatile: bool,
}

/// A stage declaration: a leaf computation with typed inputs and outputs.
#[derive(Debug, Clone)]
pub struct Stage {
    /// The unique declaration identifier.
    pub id: Arc<str>,
    /// Input parameters.
    pub in_params: Params,
    /// Output parameters.
    pub out_params: Params,
    /// Reference to the external code.
    pub src: SrcDescriptor,
    /// Whether the stage splits into dynamically-counted chunks.
    pub split: bool,
    /// Resource hints, if declared.
    pub resources: Option<ResourceHints>,
    /// Outputs that must survive volatile deletion.
    pub retain: Vec<Arc<str>>,
    /// Declaration site.
    pub loc: SourceLoc,
}

/// A pipeline declaration: a composition of calls plus a return binding.
#[derive(Debug, Clone)]
pub struct Pipeline {
    /// The unique declaration identifier.
    pub id: Arc<str>,
    /// Input parameters.
    pub in_params: Params,
    /// Output parameters.
    pub out_params: Params,
    /// Call statements in source order.
    pub calls: Vec<CallStm>,
    /// Instance identifier to index into `calls`; built by the checker.
    pub call_table: HashMap<Arc<str>, usize>,
    /// Binds each pipeline output to an expression.
    pub ret: Bindings,
    /// References whose outputs must survive volatile deletion.
    pub retain: Vec<RefExpr>,
    /// Declaration site.
    pub loc: SourceLoc,
}

/// Modifiers attached to a call statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Modifiers {
    /// Outputs are eligible for deletion once all consumers complete.
    pub volatile: bool,
    /// Run on the controlling host even in cluster mode.
    pub local: bool,
    /// Gate every non-preflight sibling in the enclosing pipeline.
    pub preflight: bool,
    /// Never run; downstream consumers see the call as disabled.
    pub disabled: bool,
}

/// A call statement: an invocation of a stage or pipeline.
#[derive(Debug, Clone)]
pub struct CallStm {
    /// The instance identifier, unique within the enclosing pipeline.
    pub id: Arc<str>,
    /// The callee's declaration identifier.
    pub dec_id: Arc<str>,
    /// Modifier set.
    pub modifiers: Modifiers,
    /// Bindings from callee parameter names to expressions.
    pub bindings: Bindings,
    /// Call site.
    pub loc: SourceLoc,
}

/// An ordered binding list with a name lookup table.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    /// Bindings in source order.
    pub list: Vec<BindStm>,
    /// Bound name to index into `list`; built by the checker.
    pub table: HashMap<Arc<str>, usize>,
}

impl Bindings {
    /// Look up a binding by the parameter name it binds.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&BindStm> {
        self.table.get(id).and_then(|index| self.list.get(*index))
    }
}

/// One binding of a parameter to an expression.
#[derive(Debug, Clone)]
pub struct BindStm {
    /// The bound parameter name.
    pub id: Arc<str>,
    /// The bound expression.
    pub expr: Expr,
    /// The resolved type of `expr`; filled in by the arguments pass.
    pub tname: Option<TypeName>,
    /// Binding site.
    pub loc: SourceLoc,
}

/// An expression bound to a parameter.
#[derive(Debug, Clone)]
pub enum Expr {
    /// A literal value.
    Literal {
        /// The value.
        value: LiteralValue,
        /// Where the literal appeared.
        loc: SourceLoc,
    },
    /// A reference to a producer.
    Ref(RefExpr),
    /// A sweep over a collection of values; each element materializes a fork.
    Sweep {
        /// The swept values.
        values: Vec<Expr>,
        /// Where the sweep appeared.
        loc: SourceLoc,
    },
}

impl Expr {
    /// The site of the expression, for error attribution.
    #[must_use]
    pub fn loc(&self) -> &SourceLoc {
        match self {
            Self::Literal { loc, .. } | Self::Sweep { loc, .. } => loc,
            Self::Ref(reference) => &reference.loc,
        }
    }
}

/// A literal value as written in a binding.
#[derive(Debug, Clone, PartialEq)]
pub enum LiteralValue {
    /// An integer.
    Int(i64),
    /// A float.
    Float(f64),
    /// A string.
    Str(String),
    /// A boolean.
    Bool(bool),
    /// The null value, assignable to any type.
    Null,
    /// A homogeneous array.
    Array(Vec<LiteralValue>),
    /// A free-form map.
    Map(serde_json::Map<String, serde_json::Value>),
}

impl LiteralValue {
    /// Convert to the JSON value written into a job's argument record.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Int(value) => serde_json::Value::from(*value),
            Self::Float(value) => serde_json::Value::from(*value),
            Self::Str(value) => serde_json::Value::from(value.as_str()),
            Self::Bool(value) => serde_json::Value::from(*value),
            Self::Null => serde_json::Value::Null,
            Self::Array(values) => {
                serde_json::Value::Array(values.iter().map(Self::to_json).collect())
            }
            Self::Map(map) => serde_json::Value::Object(map.clone()),
        }
    }
}

/// What a reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    /// An output of a preceding call in the same pipeline.
    Call,
    /// An input of the enclosing pipeline.
    SelfRef,
}

/// A reference expression.
#[derive(Debug, Clone)]
pub struct RefExpr {
    /// Whether this points at a call output or a pipeline input.
    pub kind: RefKind,
    /// The call instance id (for `Call`) or the input name (for `SelfRef`).
    pub id: Arc<str>,
    /// The referenced output name; empty for `SelfRef`.
    pub output_id: Arc<str>,
    /// Reference site.
    pub loc: SourceLoc,
}

/// Identifies a callable by kind and declaration index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallableId {
    /// Index into [`Ast::stages`].
    Stage(usize),
    /// Index into [`Ast::pipelines`].
    Pipeline(usize),
}

/// A borrowed view of a callable declaration.
#[derive(Clone, Copy)]
pub enum CallableRef<'ast> {
    /// A stage declaration.
    Stage(&'ast Stage),
    /// A pipeline declaration.
    Pipeline(&'ast Pipeline),
}

impl CallableRef<'_> {
    /// The callable's declared inputs.
    #[must_use]
    pub fn in_params(&self) -> &Params {
        match self {
            Self::Stage(stage) => &stage.in_params,
            Self::Pipeline(pipeline) => &pipeline.in_params,
        }
    }

    /// The callable's declared outputs.
    #[must_use]
    pub fn out_params(&self) -> &Params {
        match self {
            Self::Stage(stage) => &stage.out_params,
            Self::Pipeline(pipeline) => &pipeline.out_params,
        }
    }

    /// The declaration identifier.
    #[must_use]
    pub fn id(&self) -> &Arc<str> {
        match self {
            Self::Stage(stage) => &stage.id,
            Self::Pipeline(pipeline) => &pipeline.id,
        }
    }
}

/// The file-level callable table, keyed by declaration identifier.
#[derive(Debug, Default)]
pub struct Callables {
    /// Declaration identifiers in declaration order, stages and pipelines
    /// interleaved the way they appeared.
    pub order: Vec<Arc<str>>,
    /// Identifier to callable.
    pub table: HashMap<Arc<str>, CallableId>,
}
