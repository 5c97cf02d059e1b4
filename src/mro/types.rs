//! The type universe: builtins, declared user/file types, and the
//! assignability rules used when checking bindings.

use std::collections::HashMap;
use std::sync::Arc;

use crate::mro::ast::{LiteralValue, TypeName};
use crate::mro::loc::SourceLoc;

/// The built-in primitive types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinType {
    /// 64-bit signed integer.
    Int,
    /// 64-bit float.
    Float,
    /// A string.
    Str,
    /// A boolean.
    Bool,
    /// A filesystem path; interchangeable with string and file types.
    Path,
    /// A free-form key/value map.
    Map,
}

impl BuiltinType {
    /// Look up a builtin by its source name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "int" => Some(Self::Int),
            "float" => Some(Self::Float),
            "string" => Some(Self::Str),
            "bool" => Some(Self::Bool),
            "path" => Some(Self::Path),
            "map" => Some(Self::Map),
            _ => None,
        }
    }

    /// Whether this builtin names file-like data.
    #[must_use]
    fn is_file_like(self) -> bool {
        matches!(self, Self::Path | Self::Str)
    }
}

/// A resolved type definition.
#[derive(Debug, Clone)]
pub enum TypeDef {
    /// One of the primitives.
    Builtin(BuiltinType),
    /// A declared alias of another type.
    UserType {
        /// The aliased type.
        target: TypeName,
    },
    /// A declared file type; its name doubles as the extension tag.
    FileType,
}

/// The table of declared types, built by the checker's types pass.
#[derive(Debug, Default)]
pub struct TypeTable {
    /// Declared name to definition and declaration site.
    table: HashMap<Arc<str>, (TypeDef, SourceLoc)>,
}

impl TypeTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a declared type. Returns the previous declaration site if the
    /// name was already taken.
    pub fn declare(&mut self, id: Arc<str>, def: TypeDef, loc: SourceLoc) -> Option<SourceLoc> {
        if BuiltinType::parse(&id).is_some() {
            // Builtins are implicitly declared everywhere.
            return Some(SourceLoc::synthetic());
        }
        match self.table.insert(id, (def, loc)) {
            Some((_, previous)) => Some(previous),
            None => None,
        }
    }

    /// Whether `name` resolves to a declared or builtin type.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        BuiltinType::parse(name).is_some() || self.table.contains_key(name)
    }

    /// Resolve a base name to its underlying shape, expanding aliases.
    ///
    /// Returns `None` for undeclared names. Alias chains are expanded until a
    /// builtin or file type is reached; cycles are impossible because the
    /// types pass validates every alias target before bindings are checked.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<ResolvedType> {
        let mut current = name;
        let mut array_dim = 0_u8;
        loop {
            if let Some(builtin) = BuiltinType::parse(current) {
                return Some(ResolvedType::Builtin(builtin, array_dim));
            }
            match self.table.get(current)? {
                (TypeDef::Builtin(builtin), _) => {
                    return Some(ResolvedType::Builtin(*builtin, array_dim));
                }
                (TypeDef::FileType, _) => return Some(ResolvedType::File(array_dim)),
                (TypeDef::UserType { target }, _) => {
                    array_dim = array_dim.saturating_add(target.array_dim);
                    current = &target.name;
                }
            }
        }
    }

    /// Whether a value of type `from` may be bound where `to` is declared.
    ///
    /// Exact matches are assignable, aliases are expanded first, int widens
    /// to float, and file types, paths and strings are interchangeable (the
    /// runtime treats all three as names of on-disk data).
    #[must_use]
    pub fn is_assignable(&self, from: &TypeName, to: &TypeName) -> bool {
        let Some(from_resolved) = self.resolve_name(from) else {
            return false;
        };
        let Some(to_resolved) = self.resolve_name(to) else {
            return false;
        };
        if from_resolved.array_dim() != to_resolved.array_dim() {
            return false;
        }
        match (&from_resolved, &to_resolved) {
            (ResolvedType::Builtin(from_base, _), ResolvedType::Builtin(to_base, _)) => {
                from_base == to_base
                    || (*from_base == BuiltinType::Int && *to_base == BuiltinType::Float)
                    || (from_base.is_file_like() && to_base.is_file_like())
            }
            (ResolvedType::File(_), ResolvedType::File(_)) => true,
            (ResolvedType::File(_), ResolvedType::Builtin(base, _))
            | (ResolvedType::Builtin(base, _), ResolvedType::File(_)) => base.is_file_like(),
        }
    }

    /// Resolve a full type name, folding the written array dimension into the
    /// resolved shape.
    fn resolve_name(&self, name: &TypeName) -> Option<ResolvedType> {
        self.resolve(&name.name).map(|resolved| match resolved {
            ResolvedType::Builtin(base, dim) => {
                ResolvedType::Builtin(base, dim.saturating_add(name.array_dim))
            }
            ResolvedType::File(dim) => ResolvedType::File(dim.saturating_add(name.array_dim)),
        })
    }
}

/// The shape a type name resolves to after alias expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedType {
    /// A builtin, with total array dimensionality.
    Builtin(BuiltinType, u8),
    /// A file type, with total array dimensionality.
    File(u8),
}

impl ResolvedType {
    /// Total array dimensionality.
    #[must_use]
    fn array_dim(&self) -> u8 {
        match self {
            Self::Builtin(_, dim) | Self::File(dim) => *dim,
        }
    }
}

/// Infer the type of a literal value.
///
/// Arrays take the type of their first element lifted one level; empty
/// arrays and nulls have no inherent type and are assignable anywhere, which
/// the caller expresses by treating `None` as "matches".
#[must_use]
pub fn literal_type(value: &LiteralValue, intern: impl FnOnce(&str) -> Arc<str>) -> Option<TypeName> {
    let name = match value {
        LiteralValue::Int(_) => "int",
        LiteralValue::Float(_) => "float",
        LiteralValue::Str(_) => "string",
        LiteralValue::Bool(_) => "bool",
        LiteralValue::Map(_) => "map",
        LiteralValue::Null => return None,
        LiteralValue::Array(values) => {
            let element = values.first()?;
            let element_ty = literal_type(element, intern)?;
            return Some(TypeName {
                name: element_ty.name,
                array_dim: element_ty.array_dim.saturating_add(1),
            });
        }
    };
    Some(TypeName::scalar(intern(name)))
}
