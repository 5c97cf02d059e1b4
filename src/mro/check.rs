//! The semantic checker: six passes over a merged ast, each accumulating
//! errors and failing before the next pass runs.
//!
//! Pass order is fixed: types, callables, stages, pipeline declarations,
//! pipeline arguments, and finally the top-level call. Later passes rely on
//! the tables earlier passes build, which is why a pass with errors stops
//! the run.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use crate::mro::CompileError;
use crate::mro::ast::{
    Ast,
    BindStm,
    Bindings,
    CallableId,
    CallableRef,
    Callables,
    Expr,
    Params,
    Pipeline,
    RefExpr,
    RefKind,
    StageLang,
    TypeDecl,
    TypeName,
};
use crate::mro::intern::Interner;
use crate::mro::loc::SourceLoc;
use crate::mro::types::{TypeDef, literal_type};

/// Accumulates compile errors across a pass.
#[derive(Default)]
pub struct ErrorList {
    /// The errors collected so far.
    errors: Vec<CompileError>,
}

impl ErrorList {
    /// Create an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one error.
    pub fn push(&mut self, error: CompileError) {
        self.errors.push(error);
    }

    /// Record every error of a failed sub-check.
    pub fn absorb<T>(&mut self, result: Result<T, Vec<CompileError>>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(errors) => {
                self.errors.extend(errors);
                None
            }
        }
    }

    /// Return the collected errors, or `Ok` when none were recorded.
    ///
    /// Keeping the empty case an `Ok` preserves the no-error fast path for
    /// callers chaining passes with `?`.
    pub fn if_any(self) -> Result<(), Vec<CompileError>> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors)
        }
    }
}

/// Run all six passes over `ast`. On success the ast's tables are populated
/// and it is treated as immutable from then on.
pub fn compile(ast: &mut Ast, intern: &mut Interner) -> Result<(), Vec<CompileError>> {
    compile_types(ast)?;
    compile_callables(ast)?;
    compile_stages(ast)?;
    compile_pipeline_decs(ast)?;
    compile_pipeline_args(ast, intern)?;
    compile_call(ast, intern)
}

/// Pass 1: build the type table.
///
/// File types and aliases are registered in declaration order; an alias
/// target must already be declared (or builtin) when the alias appears,
/// which also rules out alias cycles.
fn compile_types(ast: &mut Ast) -> Result<(), Vec<CompileError>> {
    let mut errors = ErrorList::new();
    for decl in &ast.type_decls {
        match decl {
            TypeDecl::FileType { id, loc } => {
                if ast
                    .type_table
                    .declare(Arc::clone(id), TypeDef::FileType, loc.clone())
                    .is_some()
                {
                    errors.push(CompileError::DuplicateType {
                        id: Arc::clone(id),
                        loc: loc.clone(),
                    });
                }
            }
            TypeDecl::UserType { id, target, loc } => {
                if !ast.type_table.exists(&target.name) {
                    errors.push(CompileError::UnknownType {
                        name: target.to_string(),
                        loc: loc.clone(),
                    });
                    continue;
                }
                if ast
                    .type_table
                    .declare(
                        Arc::clone(id),
                        TypeDef::UserType {
                            target: target.clone(),
                        },
                        loc.clone(),
                    )
                    .is_some()
                {
                    errors.push(CompileError::DuplicateType {
                        id: Arc::clone(id),
                        loc: loc.clone(),
                    });
                }
            }
        }
    }
    errors.if_any()
}

/// Pass 2: collect stages and pipelines into one table, rejecting duplicate
/// identifiers and recording declaration order.
fn compile_callables(ast: &mut Ast) -> Result<(), Vec<CompileError>> {
    let mut errors = ErrorList::new();
    let mut callables = Callables::default();
    let stage_ids = ast
        .stages
        .iter()
        .enumerate()
        .map(|(index, stage)| (Arc::clone(&stage.id), CallableId::Stage(index), stage.loc.clone()));
    let pipeline_ids = ast.pipelines.iter().enumerate().map(|(index, pipeline)| {
        (
            Arc::clone(&pipeline.id),
            CallableId::Pipeline(index),
            pipeline.loc.clone(),
        )
    });
    for (id, callable, loc) in stage_ids.chain(pipeline_ids) {
        if callables.table.contains_key(&id) {
            errors.push(CompileError::DuplicateCallable { id, loc });
        } else {
            callables.order.push(Arc::clone(&id));
            callables.table.insert(id, callable);
        }
    }
    ast.callables = callables;
    errors.if_any()
}

/// Pass 3: check every stage's parameter lists, source descriptor, and
/// retain list.
fn compile_stages(ast: &mut Ast) -> Result<(), Vec<CompileError>> {
    let mut errors = ErrorList::new();
    let Ast {
        stages, type_table, ..
    } = ast;
    for stage in stages.iter_mut() {
        build_params(&mut stage.in_params, type_table, &mut errors);
        build_params(&mut stage.out_params, type_table, &mut errors);
        match StageLang::parse(&stage.src.lang_tag) {
            Some(lang) => stage.src.lang = Some(lang),
            None => errors.push(CompileError::InvalidLanguage {
                tag: Arc::clone(&stage.src.lang_tag),
                stage: Arc::clone(&stage.id),
                loc: stage.src.loc.clone(),
            }),
        }
        for retained in &stage.retain {
            if !stage.out_params.table.contains_key(retained) {
                errors.push(CompileError::UnknownRetain {
                    id: Arc::clone(retained),
                    owner: Arc::clone(&stage.id),
                    loc: stage.loc.clone(),
                });
            }
        }
    }
    errors.if_any()
}

/// Build a parameter list's lookup table, rejecting duplicate names and
/// unknown types.
fn build_params(
    params: &mut Params,
    type_table: &crate::mro::types::TypeTable,
    errors: &mut ErrorList,
) {
    params.table.clear();
    for (index, param) in params.list.iter().enumerate() {
        if !type_table.exists(&param.ty.name) {
            errors.push(CompileError::UnknownType {
                name: param.ty.to_string(),
                loc: param.loc.clone(),
            });
        }
        if params
            .table
            .insert(Arc::clone(&param.id), index)
            .is_some()
        {
            errors.push(CompileError::DuplicateParam {
                id: Arc::clone(&param.id),
                loc: param.loc.clone(),
            });
        }
    }
}

/// Pass 4: resolve each pipeline's callees, build its call table, and reject
/// call-graph cycles.
fn compile_pipeline_decs(ast: &mut Ast) -> Result<(), Vec<CompileError>> {
    let mut errors = ErrorList::new();
    let Ast {
        pipelines,
        callables,
        type_table,
        ..
    } = ast;
    for pipeline in pipelines.iter_mut() {
        build_params(&mut pipeline.in_params, type_table, &mut errors);
        build_params(&mut pipeline.out_params, type_table, &mut errors);
        pipeline.call_table.clear();
        for (index, call) in pipeline.calls.iter().enumerate() {
            if !callables.table.contains_key(&call.dec_id) {
                errors.push(CompileError::UnknownCallable {
                    id: Arc::clone(&call.dec_id),
                    loc: call.loc.clone(),
                });
            }
            if pipeline
                .call_table
                .insert(Arc::clone(&call.id), index)
                .is_some()
            {
                errors.push(CompileError::DuplicateCall {
                    id: Arc::clone(&call.id),
                    loc: call.loc.clone(),
                });
            }
        }
    }
    check_call_cycles(pipelines, callables, &mut errors);
    errors.if_any()
}

/// Depth-first search for cycles in the pipeline call graph.
fn check_call_cycles(pipelines: &[Pipeline], callables: &Callables, errors: &mut ErrorList) {
    fn visit(
        index: usize,
        pipelines: &[Pipeline],
        callables: &Callables,
        visiting: &mut Vec<usize>,
        done: &mut HashSet<usize>,
    ) -> bool {
        if done.contains(&index) {
            return false;
        }
        if visiting.contains(&index) {
            return true;
        }
        visiting.push(index);
        let mut cyclic = false;
        if let Some(pipeline) = pipelines.get(index) {
            for call in &pipeline.calls {
                if let Some(CallableId::Pipeline(callee)) = callables.table.get(&call.dec_id) {
                    cyclic = cyclic || visit(*callee, pipelines, callables, visiting, done);
                }
            }
        }
        visiting.pop();
        done.insert(index);
        cyclic
    }

    let mut done = HashSet::new();
    for index in 0..pipelines.len() {
        let mut visiting = Vec::new();
        if visit(index, pipelines, callables, &mut visiting, &mut done)
            && let Some(pipeline) = pipelines.get(index)
        {
            errors.push(CompileError::CallCycle {
                id: Arc::clone(&pipeline.id),
                loc: pipeline.loc.clone(),
            });
        }
    }
}

/// Pass 5: type-check every call binding, the return bindings, and the
/// retain references of every pipeline.
fn compile_pipeline_args(ast: &mut Ast, intern: &mut Interner) -> Result<(), Vec<CompileError>> {
    let mut errors = ErrorList::new();
    // Each pipeline is swapped out while it is checked so the rest of the
    // ast stays borrowable for callee lookups. A pipeline cannot resolve
    // itself here: self-calls are cycles and pass 4 already rejected them.
    for index in 0..ast.pipelines.len() {
        let mut pipeline = std::mem::replace(&mut ast.pipelines[index], empty_pipeline());
        check_pipeline_args(&mut pipeline, ast, intern, &mut errors);
        ast.pipelines[index] = pipeline;
    }
    errors.if_any()
}

/// Check one pipeline's calls, return bindings, and retain list.
fn check_pipeline_args(
    pipeline: &mut Pipeline,
    ast: &Ast,
    intern: &mut Interner,
    errors: &mut ErrorList,
) {
    for call_index in 0..pipeline.calls.len() {
        let mut bindings = std::mem::take(&mut pipeline.calls[call_index].bindings);
        let call_id = Arc::clone(&pipeline.calls[call_index].id);
        let dec_id = Arc::clone(&pipeline.calls[call_index].dec_id);
        let call_loc = pipeline.calls[call_index].loc.clone();
        let Some(callee) = ast.callable(&dec_id) else {
            // Unresolvable callees were reported by pass 4.
            pipeline.calls[call_index].bindings = bindings;
            continue;
        };
        check_bindings(
            &mut bindings,
            &callee,
            BindingScope {
                pipeline,
                visible_calls: call_index,
            },
            ast,
            intern,
            errors,
        );
        for param in &callee.in_params().list {
            if bindings.get(&param.id).is_none() {
                errors.push(CompileError::MissingBinding {
                    callee: Arc::clone(&dec_id),
                    id: Arc::clone(&param.id),
                    loc: call_loc.clone(),
                });
            }
        }
        log::trace!("checked bindings of call '{call_id}' in '{}'", pipeline.id);
        pipeline.calls[call_index].bindings = bindings;
    }

    // Return bindings see every call in the pipeline.
    let mut ret = std::mem::take(&mut pipeline.ret);
    let scope = BindingScope {
        pipeline,
        visible_calls: pipeline.calls.len(),
    };
    check_return_bindings(&mut ret, scope, ast, intern, errors);
    pipeline.ret = ret;

    for retained in &pipeline.retain {
        let scope = BindingScope {
            pipeline,
            visible_calls: pipeline.calls.len(),
        };
        let _ = resolve_ref(retained, scope, ast, errors);
    }
}

/// What a binding expression may refer to: the enclosing pipeline's inputs
/// and the calls preceding the binding site.
#[derive(Clone, Copy)]
struct BindingScope<'a> {
    /// The enclosing pipeline.
    pipeline: &'a Pipeline,
    /// How many calls (by index) are visible to references.
    visible_calls: usize,
}

/// Check each binding in `bindings` against the callee's declared inputs.
fn check_bindings(
    bindings: &mut Bindings,
    callee: &CallableRef<'_>,
    scope: BindingScope<'_>,
    ast: &Ast,
    intern: &mut Interner,
    errors: &mut ErrorList,
) {
    bindings.table.clear();
    for (index, bind) in bindings.list.iter_mut().enumerate() {
        let Some(param) = callee.in_params().get(&bind.id) else {
            errors.push(CompileError::UnknownParam {
                callee: Arc::clone(callee.id()),
                id: Arc::clone(&bind.id),
                loc: bind.loc.clone(),
            });
            continue;
        };
        let expected = param.ty.clone();
        check_bound_expr(bind, &expected, scope, ast, intern, errors);
        if bindings.table.insert(Arc::clone(&bind.id), index).is_some() {
            errors.push(CompileError::DuplicateBinding {
                id: Arc::clone(&bind.id),
                loc: bind.loc.clone(),
            });
        }
    }
}

/// Check a pipeline's return bindings against its declared outputs.
fn check_return_bindings(
    ret: &mut Bindings,
    scope: BindingScope<'_>,
    ast: &Ast,
    intern: &mut Interner,
    errors: &mut ErrorList,
) {
    ret.table.clear();
    let pipeline = scope.pipeline;
    for (index, bind) in ret.list.iter_mut().enumerate() {
        let Some(param) = pipeline.out_params.get(&bind.id) else {
            errors.push(CompileError::UnknownParam {
                callee: Arc::clone(&pipeline.id),
                id: Arc::clone(&bind.id),
                loc: bind.loc.clone(),
            });
            continue;
        };
        let expected = param.ty.clone();
        check_bound_expr(bind, &expected, scope, ast, intern, errors);
        if ret.table.insert(Arc::clone(&bind.id), index).is_some() {
            errors.push(CompileError::DuplicateBinding {
                id: Arc::clone(&bind.id),
                loc: bind.loc.clone(),
            });
        }
    }
    for param in &pipeline.out_params.list {
        if ret.get(&param.id).is_none() {
            errors.push(CompileError::MissingBinding {
                callee: Arc::clone(&pipeline.id),
                id: Arc::clone(&param.id),
                loc: pipeline.loc.clone(),
            });
        }
    }
}

/// Type-check one bound expression against the declared parameter type,
/// applying the sweep-lifting rule, and record the resolved type.
fn check_bound_expr(
    bind: &mut BindStm,
    expected: &TypeName,
    scope: BindingScope<'_>,
    ast: &Ast,
    intern: &mut Interner,
    errors: &mut ErrorList,
) {
    match &bind.expr {
        Expr::Sweep { values, .. } => {
            // A sweep over T binds T; every swept element must fit.
            for value in values {
                if let Expr::Sweep { loc, .. } = value {
                    errors.push(CompileError::TypeMismatch {
                        expected: expected.to_string(),
                        got: "sweep".to_owned(),
                        loc: loc.clone(),
                    });
                    continue;
                }
                check_expr_against(value, expected, scope, ast, intern, errors);
            }
        }
        expr @ (Expr::Literal { .. } | Expr::Ref(_)) => {
            check_expr_against(expr, expected, scope, ast, intern, errors);
        }
    }
    bind.tname = Some(expected.clone());
}

/// Check a non-sweep expression against an expected type.
fn check_expr_against(
    expr: &Expr,
    expected: &TypeName,
    scope: BindingScope<'_>,
    ast: &Ast,
    intern: &mut Interner,
    errors: &mut ErrorList,
) {
    let Some(got) = expr_type(expr, scope, ast, intern, errors) else {
        // Untyped (null, empty array, or unresolvable reference already
        // reported): treat as matching.
        return;
    };
    if !ast.type_table.is_assignable(&got, expected) {
        errors.push(CompileError::TypeMismatch {
            expected: expected.to_string(),
            got: got.to_string(),
            loc: expr.loc().clone(),
        });
    }
}

/// Resolve the type of an expression, reporting dangling references.
fn expr_type(
    expr: &Expr,
    scope: BindingScope<'_>,
    ast: &Ast,
    intern: &mut Interner,
    errors: &mut ErrorList,
) -> Option<TypeName> {
    match expr {
        Expr::Literal { value, .. } => literal_type(value, |name| intern.intern(name)),
        Expr::Ref(reference) => resolve_ref(reference, scope, ast, errors),
        Expr::Sweep { .. } => None,
    }
}

/// Resolve a reference to its producer's declared type.
fn resolve_ref(
    reference: &RefExpr,
    scope: BindingScope<'_>,
    ast: &Ast,
    errors: &mut ErrorList,
) -> Option<TypeName> {
    match reference.kind {
        RefKind::SelfRef => match scope.pipeline.in_params.get(&reference.id) {
            Some(param) => Some(param.ty.clone()),
            None => {
                errors.push(CompileError::UnknownReference {
                    kind: "pipeline input",
                    id: Arc::clone(&reference.id),
                    loc: reference.loc.clone(),
                });
                None
            }
        },
        RefKind::Call => {
            let Some(call_index) = scope.pipeline.call_table.get(&reference.id) else {
                errors.push(CompileError::UnknownReference {
                    kind: "call",
                    id: Arc::clone(&reference.id),
                    loc: reference.loc.clone(),
                });
                return None;
            };
            if *call_index >= scope.visible_calls {
                errors.push(CompileError::ForwardReference {
                    id: Arc::clone(&reference.id),
                    loc: reference.loc.clone(),
                });
                return None;
            }
            let call = scope.pipeline.calls.get(*call_index)?;
            let callee = ast.callable(&call.dec_id)?;
            match callee.out_params().get(&reference.output_id) {
                Some(param) => Some(param.ty.clone()),
                None => {
                    errors.push(CompileError::UnknownOutput {
                        call: Arc::clone(&reference.id),
                        output: Arc::clone(&reference.output_id),
                        loc: reference.loc.clone(),
                    });
                    None
                }
            }
        }
    }
}

/// Pass 6: resolve the top-level call's callee and type-check its bindings.
///
/// Invocation bindings are value-only; references have no producer at the
/// top level and are reported as dangling.
fn compile_call(ast: &mut Ast, intern: &mut Interner) -> Result<(), Vec<CompileError>> {
    let mut errors = ErrorList::new();
    let Some(mut call) = ast.call.take() else {
        return Ok(());
    };
    let Some(callee) = ast.callable(&call.dec_id) else {
        errors.push(CompileError::UnknownCallable {
            id: Arc::clone(&call.dec_id),
            loc: call.loc.clone(),
        });
        ast.call = Some(call);
        return errors.if_any();
    };

    call.bindings.table.clear();
    for (index, bind) in call.bindings.list.iter_mut().enumerate() {
        let Some(param) = callee.in_params().get(&bind.id) else {
            errors.push(CompileError::UnknownParam {
                callee: Arc::clone(&call.dec_id),
                id: Arc::clone(&bind.id),
                loc: bind.loc.clone(),
            });
            continue;
        };
        let expected = param.ty.clone();
        check_invocation_expr(&bind.expr, &expected, ast, intern, &mut errors);
        bind.tname = Some(expected);
        if call
            .bindings
            .table
            .insert(Arc::clone(&bind.id), index)
            .is_some()
        {
            errors.push(CompileError::DuplicateBinding {
                id: Arc::clone(&bind.id),
                loc: bind.loc.clone(),
            });
        }
    }
    for param in &callee.in_params().list {
        if call.bindings.get(&param.id).is_none() {
            errors.push(CompileError::MissingBinding {
                callee: Arc::clone(&call.dec_id),
                id: Arc::clone(&param.id),
                loc: call.loc.clone(),
            });
        }
    }
    ast.call = Some(call);
    errors.if_any()
}

/// Check one top-level binding expression against the declared input type.
fn check_invocation_expr(
    expr: &Expr,
    expected: &TypeName,
    ast: &Ast,
    intern: &mut Interner,
    errors: &mut ErrorList,
) {
    match expr {
        Expr::Literal { value, loc } => {
            if let Some(got) = literal_type(value, |name| intern.intern(name))
                && !ast.type_table.is_assignable(&got, expected)
            {
                errors.push(CompileError::TypeMismatch {
                    expected: expected.to_string(),
                    got: got.to_string(),
                    loc: loc.clone(),
                });
            }
        }
        Expr::Ref(reference) => {
            errors.push(CompileError::UnknownReference {
                kind: "call",
                id: Arc::clone(&reference.id),
                loc: reference.loc.clone(),
            });
        }
        Expr::Sweep { values, .. } => {
            for value in values {
                check_invocation_expr(value, expected, ast, intern, errors);
            }
        }
    }
}

/// Verify every python stage's source path exists on the search paths.
///
/// The searched set is the configured paths, the directory of every source
/// file, and `$PATH`. Stages resolved through the shell at run time (`exec`
/// and `comp`) are exempt.
pub fn check_src_paths(ast: &Ast, mro_paths: &[PathBuf]) -> Result<(), Vec<CompileError>> {
    let mut errors = ErrorList::new();
    let mut searched: Vec<PathBuf> = mro_paths.to_vec();
    let mut seen: HashSet<PathBuf> = searched.iter().cloned().collect();
    for file in ast.files.keys() {
        if let Some(dir) = file.parent()
            && seen.insert(dir.to_owned())
        {
            searched.push(dir.to_owned());
        }
    }
    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            if seen.insert(dir.clone()) {
                searched.push(dir);
            }
        }
    }

    for stage in &ast.stages {
        let checked = stage.src.lang.is_some_and(StageLang::check_path);
        if checked && crate::mro::include::search_paths(&stage.src.path, &searched).is_none() {
            errors.push(CompileError::SourcePathNotFound {
                searched: searched
                    .iter()
                    .map(|path| path.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
                path: stage.src.path.clone(),
                loc: stage.src.loc.clone(),
            });
        }
    }
    errors.if_any()
}

/// A placeholder pipeline used while the real one is checked out of the ast.
fn empty_pipeline() -> Pipeline {
    Pipeline {
        id: Arc::from(""),
        in_params: Params::default(),
        out_params: Params::default(),
        calls: Vec::new(),
        call_table: HashMap::new(),
        ret: Bindings::default(),
        retain: Vec::new(),
        loc: SourceLoc::synthetic(),
    }
}

#[cfg(test)]
#[expect(clippy::expect_used, reason = "tests")]
mod tests {
    use super::*;
    use crate::mro::ast::{CallStm, LiteralValue, Modifiers, Param, SrcDescriptor, Stage};

    fn loc() -> SourceLoc {
        SourceLoc::synthetic()
    }

    fn ty(name: &str) -> TypeName {
        TypeName::scalar(Arc::from(name))
    }

    fn param(id: &str, type_name: &str) -> Param {
        Param {
            id: Arc::from(id),
            ty: ty(type_name),
            loc: loc(),
        }
    }

    fn stage(id: &str, ins: &[(&str, &str)], outs: &[(&str, &str)]) -> Stage {
        Stage {
            id: Arc::from(id),
            in_params: Params {
                list: ins.iter().map(|(id, ty)| param(id, ty)).collect(),
                table: HashMap::new(),
            },
            out_params: Params {
                list: outs.iter().map(|(id, ty)| param(id, ty)).collect(),
                table: HashMap::new(),
            },
            src: SrcDescriptor {
                lang_tag: Arc::from("exec"),
                lang: None,
                path: "bin/stage".to_owned(),
                args: Vec::new(),
                loc: loc(),
            },
            split: false,
            resources: None,
            retain: Vec::new(),
            loc: loc(),
        }
    }

    fn bind_literal(id: &str, value: LiteralValue) -> BindStm {
        BindStm {
            id: Arc::from(id),
            expr: Expr::Literal { value, loc: loc() },
            tname: None,
            loc: loc(),
        }
    }

    fn bind_self(id: &str, input: &str) -> BindStm {
        BindStm {
            id: Arc::from(id),
            expr: Expr::Ref(RefExpr {
                kind: RefKind::SelfRef,
                id: Arc::from(input),
                output_id: Arc::from(""),
                loc: loc(),
            }),
            tname: None,
            loc: loc(),
        }
    }

    fn bind_call(id: &str, call: &str, output: &str) -> BindStm {
        BindStm {
            id: Arc::from(id),
            expr: Expr::Ref(RefExpr {
                kind: RefKind::Call,
                id: Arc::from(call),
                output_id: Arc::from(output),
                loc: loc(),
            }),
            tname: None,
            loc: loc(),
        }
    }

    fn call(id: &str, dec_id: &str, bindings: Vec<BindStm>) -> CallStm {
        CallStm {
            id: Arc::from(id),
            dec_id: Arc::from(dec_id),
            modifiers: Modifiers::default(),
            bindings: Bindings {
                list: bindings,
                table: HashMap::new(),
            },
            loc: loc(),
        }
    }

    fn pipeline(
        id: &str,
        ins: &[(&str, &str)],
        outs: &[(&str, &str)],
        calls: Vec<CallStm>,
        ret: Vec<BindStm>,
    ) -> Pipeline {
        Pipeline {
            id: Arc::from(id),
            in_params: Params {
                list: ins.iter().map(|(id, ty)| param(id, ty)).collect(),
                table: HashMap::new(),
            },
            out_params: Params {
                list: outs.iter().map(|(id, ty)| param(id, ty)).collect(),
                table: HashMap::new(),
            },
            calls,
            call_table: HashMap::new(),
            ret: Bindings {
                list: ret,
                table: HashMap::new(),
            },
            retain: Vec::new(),
            loc: loc(),
        }
    }

    /// A minimal well-formed ast: one stage wrapped by one pipeline.
    fn simple_ast() -> Ast {
        let mut ast = Ast::default();
        ast.stages.push(stage(
            "STAGE_A",
            &[("value", "int")],
            &[("result", "string")],
        ));
        ast.pipelines.push(pipeline(
            "PIPE",
            &[("value", "int")],
            &[("result", "string")],
            vec![call(
                "STAGE_A",
                "STAGE_A",
                vec![bind_self("value", "value")],
            )],
            vec![bind_call("result", "STAGE_A", "result")],
        ));
        ast
    }

    #[test]
    fn simple_ast_compiles() {
        let mut ast = simple_ast();
        let mut intern = Interner::new();
        compile(&mut ast, &mut intern).expect("well-formed ast should compile");
        assert!(ast.callable("PIPE").is_some());
        assert!(ast.callable("STAGE_A").is_some());
    }

    #[test]
    fn compiling_twice_is_deterministic() {
        let mut first = simple_ast();
        let mut second = simple_ast();
        let mut intern = Interner::new();
        compile(&mut first, &mut intern).expect("compile");
        compile(&mut second, &mut intern).expect("compile");
        assert_eq!(first.callables.order, second.callables.order);
        assert_eq!(
            crate::mro::format::format_ast(&first),
            crate::mro::format::format_ast(&second),
        );
    }

    #[test]
    fn duplicate_callable_is_rejected() {
        let mut ast = simple_ast();
        ast.stages
            .push(stage("PIPE", &[], &[("result", "string")]));
        let mut intern = Interner::new();
        let errors = compile(&mut ast, &mut intern).expect_err("duplicate should fail");
        assert!(
            errors
                .iter()
                .any(|error| matches!(error, CompileError::DuplicateCallable { .. })),
            "{errors:?}"
        );
    }

    #[test]
    fn type_mismatch_is_located_at_the_binding() {
        let mut ast = simple_ast();
        // Bind a string literal to the int parameter.
        ast.pipelines[0].calls[0].bindings.list[0] =
            bind_literal("value", LiteralValue::Str("oops".to_owned()));
        let mut intern = Interner::new();
        let errors = compile(&mut ast, &mut intern).expect_err("mismatch should fail");
        assert_eq!(errors.len(), 1, "{errors:?}");
        assert!(matches!(errors[0], CompileError::TypeMismatch { .. }));
    }

    #[test]
    fn sweep_lifting_binds_elements() {
        let mut ast = simple_ast();
        ast.pipelines[0].calls[0].bindings.list[0] = BindStm {
            id: Arc::from("value"),
            expr: Expr::Sweep {
                values: vec![
                    Expr::Literal {
                        value: LiteralValue::Int(1),
                        loc: loc(),
                    },
                    Expr::Literal {
                        value: LiteralValue::Int(2),
                        loc: loc(),
                    },
                ],
                loc: loc(),
            },
            tname: None,
            loc: loc(),
        };
        let mut intern = Interner::new();
        compile(&mut ast, &mut intern).expect("sweep over int binds int");
    }

    #[test]
    fn sweep_with_wrong_element_type_fails() {
        let mut ast = simple_ast();
        ast.pipelines[0].calls[0].bindings.list[0] = BindStm {
            id: Arc::from("value"),
            expr: Expr::Sweep {
                values: vec![Expr::Literal {
                    value: LiteralValue::Str("oops".to_owned()),
                    loc: loc(),
                }],
                loc: loc(),
            },
            tname: None,
            loc: loc(),
        };
        let mut intern = Interner::new();
        let errors = compile(&mut ast, &mut intern).expect_err("sweep mismatch should fail");
        assert!(matches!(errors[0], CompileError::TypeMismatch { .. }));
    }

    #[test]
    fn forward_references_are_rejected() {
        let mut ast = Ast::default();
        ast.stages.push(stage("A", &[("x", "string")], &[("y", "string")]));
        ast.stages.push(stage("B", &[], &[("y", "string")]));
        ast.pipelines.push(pipeline(
            "PIPE",
            &[],
            &[("y", "string")],
            vec![
                call("A", "A", vec![bind_call("x", "B", "y")]),
                call("B", "B", vec![]),
            ],
            vec![bind_call("y", "B", "y")],
        ));
        let mut intern = Interner::new();
        let errors = compile(&mut ast, &mut intern).expect_err("forward ref should fail");
        assert!(
            errors
                .iter()
                .any(|error| matches!(error, CompileError::ForwardReference { .. })),
            "{errors:?}"
        );
    }

    #[test]
    fn missing_binding_is_reported() {
        let mut ast = simple_ast();
        ast.pipelines[0].calls[0].bindings.list.clear();
        let mut intern = Interner::new();
        let errors = compile(&mut ast, &mut intern).expect_err("unbound param should fail");
        assert!(matches!(errors[0], CompileError::MissingBinding { .. }));
    }

    #[test]
    fn call_cycles_are_rejected() {
        let mut ast = Ast::default();
        ast.pipelines.push(pipeline(
            "LOOP_A",
            &[],
            &[],
            vec![call("LOOP_B", "LOOP_B", vec![])],
            vec![],
        ));
        ast.pipelines.push(pipeline(
            "LOOP_B",
            &[],
            &[],
            vec![call("LOOP_A", "LOOP_A", vec![])],
            vec![],
        ));
        let mut intern = Interner::new();
        let errors = compile(&mut ast, &mut intern).expect_err("cycle should fail");
        assert!(
            errors
                .iter()
                .any(|error| matches!(error, CompileError::CallCycle { .. })),
            "{errors:?}"
        );
    }

    #[test]
    fn top_level_call_checks_against_pipeline_inputs() {
        let mut ast = simple_ast();
        ast.call = Some(call(
            "PIPE",
            "PIPE",
            vec![bind_literal("value", LiteralValue::Str("oops".to_owned()))],
        ));
        let mut intern = Interner::new();
        let errors = compile(&mut ast, &mut intern).expect_err("bad invocation should fail");
        assert!(matches!(errors[0], CompileError::TypeMismatch { .. }));
    }

    #[test]
    fn if_any_preserves_the_empty_fast_path() {
        assert!(ErrorList::new().if_any().is_ok());
        let mut list = ErrorList::new();
        list.push(CompileError::InternalError("x".into()));
        assert_eq!(list.if_any().expect_err("non-empty").len(), 1);
    }
}
