//! Canonical storage for identifier strings.
//!
//! Every identifier in an [`Ast`](crate::mro::ast::Ast) is an `Arc<str>`
//! handed out by a single [`Interner`], so equal identifiers share storage
//! and comparisons can short-circuit on pointer identity.

use std::collections::HashSet;
use std::sync::Arc;

/// Interns identifier strings during parsing.
///
/// The interner is single-owner while sources are being parsed and checked.
/// After compilation the `Arc<str>` handles it produced live on inside the
/// ast, shared immutably; the interner itself can be dropped.
#[derive(Default)]
pub struct Interner {
    /// The canonical strings handed out so far.
    strings: HashSet<Arc<str>>,
}

impl Interner {
    /// Create an empty interner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the canonical handle for `value`, allocating it on first use.
    pub fn intern(&mut self, value: &str) -> Arc<str> {
        if let Some(existing) = self.strings.get(value) {
            Arc::clone(existing)
        } else {
            let canonical: Arc<str> = Arc::from(value);
            self.strings.insert(Arc::clone(&canonical));
            canonical
        }
    }

    /// Number of distinct strings interned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// Whether nothing has been interned yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

/// Compare two interned strings, short-circuiting on pointer identity.
#[must_use]
pub fn same_ident(a: &Arc<str>, b: &Arc<str>) -> bool {
    Arc::ptr_eq(a, b) || a == b
}
