//! Recursive include resolution.
//!
//! Includes are resolved relative to the including file's directory first,
//! then along the configured search paths. Each included file is parsed
//! through the [`SourceParser`] seam and merged ahead of the file that
//! included it; files reached twice along one path and include cycles are
//! reported with the offending directive's location.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::mro::ast::{Ast, Include};
use crate::mro::intern::Interner;
use crate::mro::loc::{SourceFile, SourceLoc};
use crate::mro::{CompileError, SourceParser};

/// Locate `name` on the ordered search paths.
///
/// Absolute names resolve directly; relative names are tried against each
/// path in order and the first hit wins.
#[must_use]
pub fn search_paths(name: &str, paths: &[PathBuf]) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.is_absolute() {
        return candidate.exists().then(|| candidate.to_owned());
    }
    paths
        .iter()
        .map(|dir| dir.join(candidate))
        .find(|joined| joined.exists())
}

/// Parse `src` and every file it transitively includes into one merged ast.
pub fn parse_source(
    parser: &dyn SourceParser,
    src: &str,
    src_path: &Path,
    inc_paths: &[PathBuf],
    intern: &mut Interner,
) -> Result<Ast, Vec<CompileError>> {
    let file_name = src_path
        .file_name()
        .map_or_else(|| src_path.display().to_string(), |name| name.to_string_lossy().into_owned());
    let full_path = absolutize(src_path);
    let src_file = SourceFile::new(file_name, full_path.clone());
    let mut processed = HashMap::from([(full_path, Arc::clone(&src_file))]);
    parse_with_includes(parser, src, &src_file, inc_paths, &mut processed, intern)
}

/// Parse one file and recurse into its includes.
fn parse_with_includes(
    parser: &dyn SourceParser,
    src: &str,
    src_file: &Arc<SourceFile>,
    inc_paths: &[PathBuf],
    processed: &mut HashMap<PathBuf, Arc<SourceFile>>,
    intern: &mut Interner,
) -> Result<Ast, Vec<CompileError>> {
    // The file's own folder heads the search list for both includes and
    // stage source paths.
    let mut paths = Vec::with_capacity(inc_paths.len().saturating_add(1));
    if let Some(dir) = src_file.full_path.parent() {
        paths.push(dir.to_owned());
    }
    paths.extend(inc_paths.iter().cloned());

    let mut ast = parser.parse(src, src_file, intern)?;
    ast.files
        .insert(src_file.full_path.clone(), Arc::clone(src_file));

    let includes = ast.includes.clone();
    let merged = resolve_includes(parser, src_file, &includes, &paths, processed, intern)?;
    if let Some(included) = merged {
        ast.merge(included);
    }
    Ok(ast)
}

/// Resolve and parse each include of `src_file`, returning the merged ast of
/// everything pulled in.
fn resolve_includes(
    parser: &dyn SourceParser,
    src_file: &Arc<SourceFile>,
    includes: &[Include],
    paths: &[PathBuf],
    processed: &mut HashMap<PathBuf, Arc<SourceFile>>,
    intern: &mut Interner,
) -> Result<Option<Ast>, Vec<CompileError>> {
    let mut errors = Vec::new();
    let mut merged: Option<Ast> = None;
    let mut seen: HashSet<PathBuf> = HashSet::with_capacity(includes.len());
    for inc in includes {
        let Some(found) = search_paths(&inc.value, paths) else {
            errors.push(CompileError::IncludeNotFound {
                name: inc.value.clone(),
                loc: inc.loc.clone(),
            });
            continue;
        };
        let full_path = absolutize(&found);
        if !seen.insert(full_path.clone()) {
            errors.push(CompileError::DuplicateInclude {
                name: inc.value.clone(),
                loc: inc.loc.clone(),
            });
        }

        if full_path == src_file.full_path {
            errors.push(CompileError::IncludeCycle {
                file: src_file.full_path.clone(),
                loc: inc.loc.clone(),
            });
        } else if let Some(existing) = processed.get(&full_path) {
            // Already parsed along another path: record the new origin and
            // make sure following it would not close a cycle.
            existing
                .included_from
                .lock().unwrap()
                .push(SourceLoc::new(src_file, inc.loc.line));
            if let Err(cycle_errors) = src_file.check_includes(&full_path, &inc.loc) {
                errors.extend(cycle_errors);
            }
        } else {
            let included_file = SourceFile::new(inc.value.clone(), full_path.clone());
            included_file
                .included_from
                .lock().unwrap()
                .push(SourceLoc::new(src_file, inc.loc.line));
            processed.insert(full_path.clone(), Arc::clone(&included_file));
            let text = match std::fs::read_to_string(&full_path) {
                Ok(text) => text,
                Err(inner) => {
                    errors.push(CompileError::FileReading {
                        file: full_path,
                        inner,
                        loc: inc.loc.clone(),
                    });
                    continue;
                }
            };
            // The including file's own directory does not propagate to
            // nested includes; only the configured paths do.
            let nested_paths = paths.get(1..).unwrap_or(&[]);
            match parse_with_includes(
                parser,
                &text,
                &included_file,
                nested_paths,
                processed,
                intern,
            ) {
                Ok(mut included_ast) => {
                    // Earlier includes sort before later ones.
                    if let Some(accumulated) = merged.take() {
                        included_ast.merge(accumulated);
                    }
                    merged = Some(included_ast);
                }
                Err(nested_errors) => errors.extend(nested_errors),
            }
        }
    }
    if errors.is_empty() {
        Ok(merged)
    } else {
        Err(errors)
    }
}

/// Best-effort absolute form of `path`; falls back to the path as written
/// when the filesystem cannot resolve it.
fn absolutize(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| {
        if path.is_absolute() {
            path.to_owned()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_owned())
        }
    })
}

#[cfg(test)]
#[expect(clippy::expect_used, reason = "tests")]
mod tests {
    use super::*;

    /// A toy front end: `@include <name>` directives and `decl <id>` stage
    /// declarations, one per line.
    struct LineParser;

    impl SourceParser for LineParser {
        fn parse(
            &self,
            src: &str,
            file: &Arc<SourceFile>,
            intern: &mut Interner,
        ) -> Result<Ast, Vec<CompileError>> {
            let mut ast = Ast::default();
            for (index, line) in src.lines().enumerate() {
                let loc = SourceLoc::new(file, index.saturating_add(1));
                if let Some(name) = line.strip_prefix("@include ") {
                    ast.includes.push(Include {
                        value: name.trim_matches('"').to_owned(),
                        loc,
                    });
                } else if let Some(id) = line.strip_prefix("decl ") {
                    ast.stages.push(crate::mro::ast::Stage {
                        id: intern.intern(id.trim()),
                        in_params: Default::default(),
                        out_params: Default::default(),
                        src: crate::mro::ast::SrcDescriptor {
                            lang_tag: intern.intern("exec"),
                            lang: None,
                            path: "bin/true".to_owned(),
                            args: Vec::new(),
                            loc: loc.clone(),
                        },
                        split: false,
                        resources: None,
                        retain: Vec::new(),
                        loc,
                    });
                }
            }
            Ok(ast)
        }
    }

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).expect("write fixture");
        path
    }

    #[test]
    fn missing_include_reports_name_and_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let main = write(dir.path(), "main.mro", "@include \"no_such.mro\"\n");
        let mut intern = Interner::new();
        let errors = parse_source(&LineParser, "@include \"no_such.mro\"\n", &main, &[], &mut intern)
            .expect_err("missing include should fail");
        assert_eq!(errors.len(), 1);
        let CompileError::IncludeNotFound { name, loc } = &errors[0] else {
            panic!("wrong error kind: {errors:?}");
        };
        assert_eq!(name, "no_such.mro");
        assert_eq!(loc.line, 1);
        assert_eq!(loc.file.file_name, "main.mro");
    }

    #[test]
    fn includes_merge_ahead_of_the_including_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "lib.mro", "decl FROM_LIB\n");
        let main = write(dir.path(), "main.mro", "@include \"lib.mro\"\ndecl FROM_MAIN\n");
        let mut intern = Interner::new();
        let ast = parse_source(
            &LineParser,
            "@include \"lib.mro\"\ndecl FROM_MAIN\n",
            &main,
            &[],
            &mut intern,
        )
        .expect("include should resolve");
        let ids: Vec<&str> = ast.stages.iter().map(|stage| &*stage.id).collect();
        assert_eq!(ids, ["FROM_LIB", "FROM_MAIN"]);
        assert_eq!(ast.files.len(), 2);
    }

    #[test]
    fn duplicate_include_is_reported_once_per_duplicate() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "lib.mro", "decl FROM_LIB\n");
        let src = "@include \"lib.mro\"\n@include \"lib.mro\"\n";
        let main = write(dir.path(), "main.mro", src);
        let mut intern = Interner::new();
        let errors = parse_source(&LineParser, src, &main, &[], &mut intern)
            .expect_err("duplicate include should fail");
        let duplicates = errors
            .iter()
            .filter(|error| matches!(error, CompileError::DuplicateInclude { .. }))
            .count();
        assert_eq!(duplicates, 1, "{errors:?}");
    }

    #[test]
    fn include_cycles_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "a.mro", "@include \"b.mro\"\n");
        write(dir.path(), "b.mro", "@include \"a.mro\"\n");
        let main = write(dir.path(), "main.mro", "@include \"a.mro\"\n");
        let mut intern = Interner::new();
        let errors = parse_source(&LineParser, "@include \"a.mro\"\n", &main, &[], &mut intern)
            .expect_err("cycle should fail");
        assert!(
            errors
                .iter()
                .any(|error| matches!(error, CompileError::IncludeCycle { .. })),
            "{errors:?}"
        );
    }

    #[test]
    fn self_include_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let main = write(dir.path(), "main.mro", "@include \"main.mro\"\n");
        let mut intern = Interner::new();
        let errors = parse_source(&LineParser, "@include \"main.mro\"\n", &main, &[], &mut intern)
            .expect_err("self include should fail");
        assert!(matches!(errors[0], CompileError::IncludeCycle { .. }));
    }

    #[test]
    fn search_paths_prefer_earlier_entries() {
        let first = tempfile::tempdir().expect("tempdir");
        let second = tempfile::tempdir().expect("tempdir");
        write(first.path(), "x.mro", "decl A\n");
        write(second.path(), "x.mro", "decl B\n");
        let found = search_paths(
            "x.mro",
            &[first.path().to_owned(), second.path().to_owned()],
        )
        .expect("x.mro should be found");
        assert!(found.starts_with(first.path()));
    }
}
