//! Canonical rendering of a checked ast.
//!
//! The compiler is also the formatter: the combined source of a compilation
//! is re-rendered from the ast in one fixed style, so formatting the same
//! ast twice is byte-identical.

use std::fmt::Write as _;

use crate::mro::ast::{
    Ast,
    Bindings,
    CallStm,
    Expr,
    LiteralValue,
    Params,
    Pipeline,
    RefExpr,
    RefKind,
    Stage,
    TypeDecl,
};

/// Render the canonical formatting of `ast`.
#[must_use]
pub fn format_ast(ast: &Ast) -> String {
    let mut out = String::new();
    for include in &ast.includes {
        let _ = writeln!(out, "@include \"{}\"", include.value);
    }
    if !ast.includes.is_empty() {
        out.push('\n');
    }

    for decl in &ast.type_decls {
        match decl {
            TypeDecl::FileType { id, .. } => {
                let _ = writeln!(out, "filetype {id};");
            }
            TypeDecl::UserType { id, target, .. } => {
                let _ = writeln!(out, "usertype {id} = {target};");
            }
        }
    }
    if !ast.type_decls.is_empty() {
        out.push('\n');
    }

    for stage in &ast.stages {
        format_stage(&mut out, stage);
        out.push('\n');
    }
    for pipeline in &ast.pipelines {
        format_pipeline(&mut out, pipeline);
        out.push('\n');
    }
    if let Some(call) = &ast.call {
        format_call(&mut out, call, "");
    }
    out
}

/// Width of the widest type column in a parameter block, including the
/// stage source row when present.
fn type_width(params: &[&Params], src_tag: Option<&str>) -> usize {
    params
        .iter()
        .flat_map(|block| block.list.iter())
        .map(|param| param.ty.to_string().len())
        .chain(src_tag.map(str::len))
        .max()
        .unwrap_or(0)
}

fn format_stage(out: &mut String, stage: &Stage) {
    let _ = writeln!(out, "stage {}(", stage.id);
    let src_tag = stage.src.lang.map_or_else(
        || stage.src.lang_tag.to_string(),
        |lang| lang.tag().to_owned(),
    );
    let width = type_width(&[&stage.in_params, &stage.out_params], Some(&src_tag));
    for param in &stage.in_params.list {
        let _ = writeln!(out, "    in  {:width$} {},", param.ty.to_string(), param.id);
    }
    for param in &stage.out_params.list {
        let _ = writeln!(out, "    out {:width$} {},", param.ty.to_string(), param.id);
    }
    let mut src_line = format!("\"{}\"", stage.src.path);
    for arg in &stage.src.args {
        let _ = write!(src_line, " \"{arg}\"");
    }
    let _ = writeln!(out, "    src {src_tag:width$} {src_line},");
    out.push(')');

    if stage.split {
        out.push_str(" split using (\n)");
    }
    if let Some(resources) = &stage.resources {
        out.push_str(" using (\n");
        if let Some(threads) = resources.threads {
            let _ = writeln!(out, "    threads  = {threads},");
        }
        if let Some(mem_gb) = resources.mem_gb {
            let _ = writeln!(out, "    mem_gb   = {mem_gb},");
        }
        if let Some(special) = &resources.special {
            let _ = writeln!(out, "    special  = \"{special}\",");
        }
        if resources.strict_volatile {
            out.push_str("    volatile = strict,\n");
        }
        out.push(')');
    }
    if !stage.retain.is_empty() {
        out.push_str(" retain (\n");
        for retained in &stage.retain {
            let _ = writeln!(out, "    {retained},");
        }
        out.push(')');
    }
    out.push('\n');
}

fn format_pipeline(out: &mut String, pipeline: &Pipeline) {
    let _ = writeln!(out, "pipeline {}(", pipeline.id);
    let width = type_width(&[&pipeline.in_params, &pipeline.out_params], None);
    for param in &pipeline.in_params.list {
        let _ = writeln!(out, "    in  {:width$} {},", param.ty.to_string(), param.id);
    }
    for param in &pipeline.out_params.list {
        let _ = writeln!(out, "    out {:width$} {},", param.ty.to_string(), param.id);
    }
    out.push_str(")\n{\n");
    for call in &pipeline.calls {
        format_call(out, call, "    ");
    }
    out.push_str("    return (\n");
    format_bindings(out, &pipeline.ret, "        ");
    out.push_str("    )\n");
    if !pipeline.retain.is_empty() {
        out.push_str("\n    retain (\n");
        for reference in &pipeline.retain {
            let _ = writeln!(out, "        {},", format_ref(reference));
        }
        out.push_str("    )\n");
    }
    out.push_str("}\n");
}

fn format_call(out: &mut String, call: &CallStm, indent: &str) {
    let mut modifiers = String::new();
    if call.modifiers.local {
        modifiers.push_str("local ");
    }
    if call.modifiers.preflight {
        modifiers.push_str("preflight ");
    }
    if call.modifiers.volatile {
        modifiers.push_str("volatile ");
    }
    if call.modifiers.disabled {
        modifiers.push_str("disabled ");
    }
    if call.id == call.dec_id {
        let _ = writeln!(out, "{indent}call {modifiers}{}(", call.dec_id);
    } else {
        let _ = writeln!(out, "{indent}call {modifiers}{} as {}(", call.dec_id, call.id);
    }
    let inner = format!("{indent}    ");
    format_bindings(out, &call.bindings, &inner);
    let _ = writeln!(out, "{indent})");
}

/// Render a binding block, one `name = expr,` row per binding with the
/// names left-aligned.
fn format_bindings(out: &mut String, bindings: &Bindings, indent: &str) {
    let width = bindings
        .list
        .iter()
        .map(|bind| bind.id.len())
        .max()
        .unwrap_or(0);
    for bind in &bindings.list {
        let _ = writeln!(
            out,
            "{indent}{:width$} = {},",
            bind.id,
            format_expr(&bind.expr)
        );
    }
}

fn format_expr(expr: &Expr) -> String {
    match expr {
        Expr::Literal { value, .. } => format_literal(value),
        Expr::Ref(reference) => format_ref(reference),
        Expr::Sweep { values, .. } => {
            let rendered: Vec<String> = values.iter().map(format_expr).collect();
            format!("sweep({})", rendered.join(", "))
        }
    }
}

fn format_ref(reference: &RefExpr) -> String {
    match reference.kind {
        RefKind::SelfRef => format!("self.{}", reference.id),
        RefKind::Call => {
            if reference.output_id.is_empty() {
                reference.id.to_string()
            } else {
                format!("{}.{}", reference.id, reference.output_id)
            }
        }
    }
}

fn format_literal(value: &LiteralValue) -> String {
    match value {
        LiteralValue::Int(value) => value.to_string(),
        LiteralValue::Float(value) => {
            // Keep a trailing .0 so the value re-reads as a float.
            if value.fract() == 0.0 && value.is_finite() {
                format!("{value:.1}")
            } else {
                value.to_string()
            }
        }
        LiteralValue::Str(value) => format!("{value:?}"),
        LiteralValue::Bool(value) => value.to_string(),
        LiteralValue::Null => "null".to_owned(),
        LiteralValue::Array(values) => {
            let rendered: Vec<String> = values.iter().map(format_literal).collect();
            format!("[{}]", rendered.join(", "))
        }
        LiteralValue::Map(map) => {
            serde_json::to_string(&serde_json::Value::Object(map.clone()))
                .unwrap_or_else(|_| "{}".to_owned())
        }
    }
}

#[cfg(test)]
#[expect(clippy::expect_used, reason = "tests")]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;
    use crate::mro::ast::{BindStm, Modifiers, Param, SrcDescriptor, TypeName};
    use crate::mro::intern::Interner;
    use crate::mro::loc::SourceLoc;

    fn sample_ast() -> Ast {
        let mut ast = Ast::default();
        ast.stages.push(Stage {
            id: Arc::from("SUM_SQUARES"),
            in_params: Params {
                list: vec![Param {
                    id: Arc::from("values"),
                    ty: TypeName {
                        name: Arc::from("float"),
                        array_dim: 1,
                    },
                    loc: SourceLoc::synthetic(),
                }],
                table: HashMap::new(),
            },
            out_params: Params {
                list: vec![Param {
                    id: Arc::from("sum"),
                    ty: TypeName::scalar(Arc::from("float")),
                    loc: SourceLoc::synthetic(),
                }],
                table: HashMap::new(),
            },
            src: SrcDescriptor {
                lang_tag: Arc::from("py"),
                lang: None,
                path: "stages/sum_squares".to_owned(),
                args: Vec::new(),
                loc: SourceLoc::synthetic(),
            },
            split: true,
            resources: None,
            retain: Vec::new(),
            loc: SourceLoc::synthetic(),
        });
        ast.call = Some(CallStm {
            id: Arc::from("SUM_SQUARES"),
            dec_id: Arc::from("SUM_SQUARES"),
            modifiers: Modifiers::default(),
            bindings: Bindings {
                list: vec![BindStm {
                    id: Arc::from("values"),
                    expr: Expr::Literal {
                        value: LiteralValue::Array(vec![
                            LiteralValue::Float(1.0),
                            LiteralValue::Float(2.5),
                        ]),
                        loc: SourceLoc::synthetic(),
                    },
                    tname: None,
                    loc: SourceLoc::synthetic(),
                }],
                table: HashMap::new(),
            },
            loc: SourceLoc::synthetic(),
        });
        ast
    }

    #[test]
    fn formatting_is_idempotent_over_the_ast() {
        let ast = sample_ast();
        let first = format_ast(&ast);
        let second = format_ast(&ast);
        assert_eq!(first, second);
    }

    #[test]
    fn formats_a_split_stage_and_invocation() {
        let rendered = format_ast(&sample_ast());
        let expected = "\
stage SUM_SQUARES(
    in  float[] values,
    out float   sum,
    src py      \"stages/sum_squares\",
) split using (
)

call SUM_SQUARES(
    values = [1.0, 2.5],
)
";
        assert_eq!(rendered, expected);
    }

    #[test]
    fn formatting_survives_a_compile() {
        let mut ast = sample_ast();
        // The checker fills lookup tables but must not perturb rendering.
        let before = format_ast(&ast);
        let mut intern = Interner::new();
        crate::mro::check::compile(&mut ast, &mut intern).expect("compile");
        assert_eq!(before, format_ast(&ast));
    }
}
