//! Source files and locations for error attribution.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::mro::CompileError;

/// A source file participating in a compilation.
///
/// Files are shared between the ast nodes that came from them; the include
/// resolver records every location a file was included from so that include
/// cycles can be reported with their full chain.
#[derive(Debug)]
pub struct SourceFile {
    /// The name the file was referred to by (usually relative).
    pub file_name: String,
    /// The absolute path the file was resolved to.
    pub full_path: PathBuf,
    /// Locations of the `@include` directives that pulled this file in.
    ///
    /// Empty for the entry-point file. Mutated only by the include resolver
    /// while parsing is in progress.
    pub included_from: Mutex<Vec<SourceLoc>>,
}

impl SourceFile {
    /// Create a source file record for the given name and resolved path.
    #[must_use]
    pub fn new(file_name: impl Into<String>, full_path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            file_name: file_name.into(),
            full_path,
            included_from: Mutex::new(Vec::new()),
        })
    }

    /// Check whether including `full_path` from this file would close a cycle.
    ///
    /// Walks the `included_from` chain upwards; `inc` is the location of the
    /// offending include directive, used for error attribution.
    pub fn check_includes(&self, full_path: &Path, inc: &SourceLoc) -> Result<(), Vec<CompileError>> {
        let mut errors = Vec::new();
        if *full_path == self.full_path {
            errors.push(CompileError::IncludeCycle {
                file: self.full_path.clone(),
                loc: inc.clone(),
            });
        } else {
            for parent in self.included_from.lock().unwrap().iter() {
                if let Err(parent_errors) = parent.file.check_includes(full_path, inc) {
                    errors.extend(parent_errors);
                }
            }
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// A location in a source file.
#[derive(Debug, Clone)]
pub struct SourceLoc {
    /// The file the location is in.
    pub file: Arc<SourceFile>,
    /// 1-based line number.
    pub line: usize,
}

impl SourceLoc {
    /// Create a location in `file` at `line`.
    #[must_use]
    pub fn new(file: &Arc<SourceFile>, line: usize) -> Self {
        Self {
            file: Arc::clone(file),
            line,
        }
    }

    /// A location for compiler-generated entities with no source of their own.
    #[must_use]
    pub fn synthetic() -> Self {
        Self {
            file: SourceFile::new("<generated>", PathBuf::from("<generated>")),
            line: 0,
        }
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}:{}", self.file.file_name, self.line)?;
        // Render the include chain so errors in included files are traceable
        // back to the entry point.
        let included_from = self.file.included_from.lock().unwrap();
        if let Some(origin) = included_from.first() {
            write!(
                fmt,
                " (included from {}:{})",
                origin.file.file_name, origin.line
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_origin() {
        let root = SourceFile::new("main.mro", PathBuf::from("/p/main.mro"));
        let inc = SourceFile::new("lib.mro", PathBuf::from("/p/lib.mro"));
        inc.included_from
            .lock()
            .unwrap()
            .push(SourceLoc::new(&root, 3));
        let loc = SourceLoc::new(&inc, 7);
        assert_eq!(loc.to_string(), "lib.mro:7 (included from main.mro:3)");
    }

    #[test]
    fn self_include_is_a_cycle() {
        let file = SourceFile::new("main.mro", PathBuf::from("/p/main.mro"));
        let loc = SourceLoc::new(&file, 1);
        let result = file.check_includes(&PathBuf::from("/p/main.mro"), &loc);
        assert!(result.is_err());
    }

    #[test]
    fn unrelated_include_is_not_a_cycle() {
        let file = SourceFile::new("main.mro", PathBuf::from("/p/main.mro"));
        let loc = SourceLoc::new(&file, 1);
        assert!(file.check_includes(&PathBuf::from("/p/other.mro"), &loc).is_ok());
    }
}
