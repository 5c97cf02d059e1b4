//! A serde-based front end for the [`SourceParser`] seam.
//!
//! Concrete mro grammar lives outside this crate; tooling that already has
//! an ast (editors, generators, the test suite) hands it to the compiler as
//! a JSON document. Each declaration carries the line it came from so
//! semantic errors still point somewhere useful.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::mro::ast::{
    Ast,
    BindStm,
    Bindings,
    CallStm,
    Expr,
    Include,
    LiteralValue,
    Modifiers,
    Param,
    Params,
    Pipeline,
    RefExpr,
    RefKind,
    ResourceHints,
    SrcDescriptor,
    Stage,
    TypeDecl,
    TypeName,
};
use crate::mro::intern::Interner;
use crate::mro::loc::{SourceFile, SourceLoc};
use crate::mro::{CompileError, SourceParser};

/// Parses JSON ast documents.
pub struct JsonAstParser;

impl SourceParser for JsonAstParser {
    fn parse(
        &self,
        src: &str,
        file: &Arc<SourceFile>,
        intern: &mut Interner,
    ) -> Result<Ast, Vec<CompileError>> {
        let doc: AstDoc = serde_json::from_str(src).map_err(|error| {
            vec![CompileError::Syntax {
                message: error.to_string(),
                loc: SourceLoc::new(file, error.line()),
            }]
        })?;
        Ok(doc.into_ast(file, intern))
    }
}

/// One source file as a JSON document.
#[derive(Deserialize)]
struct AstDoc {
    #[serde(default)]
    includes: Vec<IncludeDoc>,
    #[serde(default)]
    filetypes: Vec<FileTypeDoc>,
    #[serde(default)]
    usertypes: Vec<UserTypeDoc>,
    #[serde(default)]
    stages: Vec<StageDoc>,
    #[serde(default)]
    pipelines: Vec<PipelineDoc>,
    #[serde(default)]
    call: Option<CallDoc>,
}

#[derive(Deserialize)]
struct IncludeDoc {
    name: String,
    #[serde(default)]
    line: usize,
}

#[derive(Deserialize)]
struct FileTypeDoc {
    id: String,
    #[serde(default)]
    line: usize,
}

#[derive(Deserialize)]
struct UserTypeDoc {
    id: String,
    target: String,
    #[serde(default)]
    line: usize,
}

#[derive(Deserialize)]
struct ParamDoc {
    id: String,
    #[serde(rename = "type")]
    ty: String,
}

#[derive(Deserialize)]
struct SrcDoc {
    lang: String,
    path: String,
    #[serde(default)]
    args: Vec<String>,
}

#[derive(Deserialize)]
struct ResourcesDoc {
    #[serde(default)]
    threads: Option<usize>,
    #[serde(default)]
    mem_gb: Option<usize>,
    #[serde(default)]
    special: Option<String>,
    #[serde(default)]
    strict_volatile: bool,
}

#[derive(Deserialize)]
struct StageDoc {
    id: String,
    #[serde(default, rename = "in")]
    in_params: Vec<ParamDoc>,
    #[serde(default, rename = "out")]
    out_params: Vec<ParamDoc>,
    src: SrcDoc,
    #[serde(default)]
    split: bool,
    #[serde(default)]
    resources: Option<ResourcesDoc>,
    #[serde(default)]
    retain: Vec<String>,
    #[serde(default)]
    line: usize,
}

#[derive(Deserialize)]
struct PipelineDoc {
    id: String,
    #[serde(default, rename = "in")]
    in_params: Vec<ParamDoc>,
    #[serde(default, rename = "out")]
    out_params: Vec<ParamDoc>,
    #[serde(default)]
    calls: Vec<CallDoc>,
    #[serde(default, rename = "return")]
    ret: Vec<BindDoc>,
    #[serde(default)]
    retain: Vec<RefDoc>,
    #[serde(default)]
    line: usize,
}

#[derive(Deserialize)]
struct CallDoc {
    /// Instance id; defaults to the callee name.
    #[serde(default)]
    id: Option<String>,
    callee: String,
    #[serde(default)]
    modifiers: Vec<String>,
    #[serde(default)]
    bindings: Vec<BindDoc>,
    #[serde(default)]
    line: usize,
}

#[derive(Deserialize)]
struct BindDoc {
    id: String,
    expr: ExprDoc,
    #[serde(default)]
    line: usize,
}

#[derive(Deserialize)]
struct RefDoc {
    id: String,
    #[serde(default)]
    output: String,
    #[serde(default)]
    line: usize,
}

/// An expression document: a plain JSON value, a reference, or a sweep.
#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ExprDoc {
    /// A literal carried as a raw JSON value.
    Value {
        value: serde_json::Value,
        #[serde(default)]
        line: usize,
    },
    /// A reference to a pipeline input.
    SelfRef {
        id: String,
        #[serde(default)]
        line: usize,
    },
    /// A reference to a preceding call's output.
    Call {
        id: String,
        output: String,
        #[serde(default)]
        line: usize,
    },
    /// A sweep over values.
    Sweep {
        values: Vec<ExprDoc>,
        #[serde(default)]
        line: usize,
    },
}

impl AstDoc {
    fn into_ast(self, file: &Arc<SourceFile>, intern: &mut Interner) -> Ast {
        let loc = |line| SourceLoc::new(file, line);
        let mut ast = Ast::default();
        for include in self.includes {
            ast.includes.push(Include {
                value: include.name,
                loc: loc(include.line),
            });
        }
        for filetype in self.filetypes {
            ast.type_decls.push(TypeDecl::FileType {
                id: intern.intern(&filetype.id),
                loc: loc(filetype.line),
            });
        }
        for usertype in self.usertypes {
            ast.type_decls.push(TypeDecl::UserType {
                id: intern.intern(&usertype.id),
                target: parse_type_name(&usertype.target, intern),
                loc: loc(usertype.line),
            });
        }
        for stage in self.stages {
            ast.stages.push(Stage {
                id: intern.intern(&stage.id),
                in_params: params(stage.in_params, file, stage.line, intern),
                out_params: params(stage.out_params, file, stage.line, intern),
                src: SrcDescriptor {
                    lang_tag: intern.intern(&stage.src.lang),
                    lang: None,
                    path: stage.src.path,
                    args: stage.src.args,
                    loc: loc(stage.line),
                },
                split: stage.split,
                resources: stage.resources.map(|res| ResourceHints {
                    threads: res.threads,
                    mem_gb: res.mem_gb,
                    special: res.special,
                    strict_volatile: res.strict_volatile,
                }),
                retain: stage.retain.iter().map(|id| intern.intern(id)).collect(),
                loc: loc(stage.line),
            });
        }
        for pipeline in self.pipelines {
            let line = pipeline.line;
            ast.pipelines.push(Pipeline {
                id: intern.intern(&pipeline.id),
                in_params: params(pipeline.in_params, file, line, intern),
                out_params: params(pipeline.out_params, file, line, intern),
                calls: pipeline
                    .calls
                    .into_iter()
                    .map(|call| call_stm(call, file, intern))
                    .collect(),
                call_table: HashMap::new(),
                ret: bindings(pipeline.ret, file, intern),
                retain: pipeline
                    .retain
                    .into_iter()
                    .map(|reference| RefExpr {
                        kind: RefKind::Call,
                        id: intern.intern(&reference.id),
                        output_id: intern.intern(&reference.output),
                        loc: loc(reference.line),
                    })
                    .collect(),
                loc: loc(line),
            });
        }
        ast.call = self.call.map(|call| call_stm(call, file, intern));
        ast
    }
}

fn params(
    docs: Vec<ParamDoc>,
    file: &Arc<SourceFile>,
    line: usize,
    intern: &mut Interner,
) -> Params {
    Params {
        list: docs
            .into_iter()
            .map(|doc| Param {
                id: intern.intern(&doc.id),
                ty: parse_type_name(&doc.ty, intern),
                loc: SourceLoc::new(file, line),
            })
            .collect(),
        table: HashMap::new(),
    }
}

/// Parse `name[]...` into a base name and array dimensionality.
fn parse_type_name(text: &str, intern: &mut Interner) -> TypeName {
    let mut base = text;
    let mut array_dim = 0_u8;
    while let Some(stripped) = base.strip_suffix("[]") {
        base = stripped;
        array_dim = array_dim.saturating_add(1);
    }
    TypeName {
        name: intern.intern(base),
        array_dim,
    }
}

fn call_stm(doc: CallDoc, file: &Arc<SourceFile>, intern: &mut Interner) -> CallStm {
    let mut modifiers = Modifiers::default();
    for modifier in &doc.modifiers {
        match modifier.as_str() {
            "volatile" => modifiers.volatile = true,
            "local" => modifiers.local = true,
            "preflight" => modifiers.preflight = true,
            "disabled" => modifiers.disabled = true,
            other => log::warn!("ignoring unknown call modifier '{other}'"),
        }
    }
    let dec_id = intern.intern(&doc.callee);
    CallStm {
        id: doc
            .id
            .map_or_else(|| Arc::clone(&dec_id), |id| intern.intern(&id)),
        dec_id,
        modifiers,
        bindings: bindings(doc.bindings, file, intern),
        loc: SourceLoc::new(file, doc.line),
    }
}

fn bindings(docs: Vec<BindDoc>, file: &Arc<SourceFile>, intern: &mut Interner) -> Bindings {
    Bindings {
        list: docs
            .into_iter()
            .map(|doc| BindStm {
                id: intern.intern(&doc.id),
                expr: expr(doc.expr, file, intern),
                tname: None,
                loc: SourceLoc::new(file, doc.line),
            })
            .collect(),
        table: HashMap::new(),
    }
}

fn expr(doc: ExprDoc, file: &Arc<SourceFile>, intern: &mut Interner) -> Expr {
    match doc {
        ExprDoc::Value { value, line } => Expr::Literal {
            value: literal(value),
            loc: SourceLoc::new(file, line),
        },
        ExprDoc::SelfRef { id, line } => Expr::Ref(RefExpr {
            kind: RefKind::SelfRef,
            id: intern.intern(&id),
            output_id: intern.intern(""),
            loc: SourceLoc::new(file, line),
        }),
        ExprDoc::Call { id, output, line } => Expr::Ref(RefExpr {
            kind: RefKind::Call,
            id: intern.intern(&id),
            output_id: intern.intern(&output),
            loc: SourceLoc::new(file, line),
        }),
        ExprDoc::Sweep { values, line } => Expr::Sweep {
            values: values
                .into_iter()
                .map(|value| expr(value, file, intern))
                .collect(),
            loc: SourceLoc::new(file, line),
        },
    }
}

/// Map a raw JSON value onto the literal universe.
fn literal(value: serde_json::Value) -> LiteralValue {
    match value {
        serde_json::Value::Null => LiteralValue::Null,
        serde_json::Value::Bool(value) => LiteralValue::Bool(value),
        serde_json::Value::Number(number) => number.as_i64().map_or_else(
            || LiteralValue::Float(number.as_f64().unwrap_or(f64::NAN)),
            LiteralValue::Int,
        ),
        serde_json::Value::String(value) => LiteralValue::Str(value),
        serde_json::Value::Array(values) => {
            LiteralValue::Array(values.into_iter().map(literal).collect())
        }
        serde_json::Value::Object(map) => LiteralValue::Map(map),
    }
}

#[cfg(test)]
#[expect(clippy::expect_used, reason = "tests")]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::mro::compile_source;

    const SINGLE_STAGE: &str = r#"{
        "stages": [{
            "id": "STAGE_A",
            "in": [{"id": "value", "type": "int"}],
            "out": [{"id": "result", "type": "string"}],
            "src": {"lang": "exec", "path": "bin/stage_a"},
            "line": 2
        }],
        "pipelines": [{
            "id": "PIPE",
            "in": [{"id": "value", "type": "int"}],
            "out": [{"id": "result", "type": "string"}],
            "calls": [{
                "callee": "STAGE_A",
                "bindings": [{"id": "value", "expr": {"kind": "self_ref", "id": "value", "line": 14}, "line": 14}],
                "line": 13
            }],
            "return": [{"id": "result", "expr": {"kind": "call", "id": "STAGE_A", "output": "result", "line": 17}, "line": 17}],
            "line": 9
        }],
        "call": {
            "callee": "PIPE",
            "bindings": [{"id": "value", "expr": {"kind": "value", "value": 42, "line": 21}, "line": 21}],
            "line": 20
        }
    }"#;

    #[test]
    fn single_stage_pipeline_compiles() {
        let result = compile_source(
            &JsonAstParser,
            SINGLE_STAGE,
            Path::new("single.mro"),
            &[],
            false,
        )
        .expect("document should compile");
        assert!(result.ast.callable("PIPE").is_some());
        let call = result.ast.call.as_ref().expect("top-level call");
        assert_eq!(&*call.dec_id, "PIPE");
        assert!(result.formatted.contains("stage STAGE_A("));
    }

    #[test]
    fn recompiling_yields_identical_formatting() {
        let first = compile_source(&JsonAstParser, SINGLE_STAGE, Path::new("a.mro"), &[], false)
            .expect("compile");
        let second = compile_source(&JsonAstParser, SINGLE_STAGE, Path::new("a.mro"), &[], false)
            .expect("compile");
        assert_eq!(first.formatted, second.formatted);
        // format -> compile -> format is a fixed point over the ast.
        assert_eq!(first.formatted, crate::mro::format::format_ast(&second.ast));
    }

    #[test]
    fn type_mismatch_points_at_the_binding_line() {
        let doc = SINGLE_STAGE.replace(
            r#"{"kind": "value", "value": 42, "line": 21}"#,
            r#"{"kind": "value", "value": "forty-two", "line": 21}"#,
        );
        let errors = compile_source(&JsonAstParser, &doc, Path::new("bad.mro"), &[], false)
            .expect_err("mismatch should fail");
        assert_eq!(errors.len(), 1);
        let CompileError::TypeMismatch { loc, .. } = &errors[0] else {
            panic!("wrong error kind: {errors:?}");
        };
        assert_eq!(loc.line, 21);
    }

    #[test]
    fn malformed_json_is_a_syntax_error() {
        let errors = compile_source(&JsonAstParser, "{not json", Path::new("bad.mro"), &[], false)
            .expect_err("bad json should fail");
        assert!(matches!(errors[0], CompileError::Syntax { .. }));
    }
}
