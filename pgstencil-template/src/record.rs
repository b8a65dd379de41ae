//! Record types and their declared fields.
//!
//! A [`Record`] is a type rows can be decoded into. Its [`FieldDecl`] list
//! names the SQL-facing columns the type expects, in declaration order; the
//! list is resolved once per type by [`fields`] and then cached.
//!
//! Implementations are normally generated with `#[derive(Record)]`, which
//! reads `#[serde(rename)]`, `#[serde(flatten)]` and `#[serde(skip)]` so the
//! field list always agrees with what deserialization expects.

use std::any::{TypeId, type_name};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::error::{TemplateError, TemplateResult};

/// A type that query rows can be decoded into.
pub trait Record: DeserializeOwned + Send + 'static {
    /// The type's field declarations, in declaration order.
    fn declared_fields() -> Vec<FieldDecl>;
}

/// One entry in a record's field declarations.
#[derive(Debug, Clone, Copy)]
pub enum FieldDecl {
    /// A column, optionally exposed to SQL under an alias.
    Column {
        name: &'static str,
        alias: Option<&'static str>,
        /// Decoding succeeds when the column is absent.
        optional: bool,
    },
    /// An embedded record whose fields are spliced in at this position.
    Base {
        type_name: &'static str,
        fields: fn() -> Vec<FieldDecl>,
    },
}

impl FieldDecl {
    /// A column exposed under its own name.
    pub const fn column(name: &'static str) -> Self {
        Self::Column {
            name,
            alias: None,
            optional: false,
        }
    }

    /// A column exposed to SQL as `alias`.
    pub const fn aliased(name: &'static str, alias: &'static str) -> Self {
        Self::Column {
            name,
            alias: Some(alias),
            optional: false,
        }
    }

    /// Mark a column as allowed to be missing (an `Option` or a
    /// `#[serde(default)]` field). Bases are returned unchanged.
    pub const fn optional(self) -> Self {
        match self {
            Self::Column { name, alias, .. } => Self::Column {
                name,
                alias,
                optional: true,
            },
            base => base,
        }
    }

    /// An embedded base record.
    pub fn base<T: Record>() -> Self {
        Self::Base {
            type_name: type_name::<T>(),
            fields: T::declared_fields,
        }
    }

    /// The SQL-facing name of a column declaration.
    pub fn sql_name(&self) -> Option<&'static str> {
        match self {
            Self::Column { name, alias, .. } => Some(alias.unwrap_or(*name)),
            Self::Base { .. } => None,
        }
    }
}

static FIELD_CACHE: LazyLock<RwLock<HashMap<TypeId, Arc<[String]>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// The SQL-facing field names of `T`, de-duplicated, in declaration order.
///
/// Bases are expanded in place. When a name appears more than once the first
/// occurrence keeps its position and the rest are dropped.
///
/// A row carries each column once and deserialization hands it to a single
/// field: one declared directly on `T` if there is one, otherwise the first
/// base declaring it. Every other base field with that name is left without a
/// value, so it must be optional or resolution fails with
/// [`TemplateError::ShadowedField`].
pub fn fields<T: Record>() -> TemplateResult<Arc<[String]>> {
    let key = TypeId::of::<T>();

    if let Some(cached) = FIELD_CACHE.read().get(&key) {
        return Ok(Arc::clone(cached));
    }

    let mut columns = Vec::new();
    collect(&T::declared_fields(), &mut columns, 0);

    if columns.is_empty() {
        return Err(TemplateError::NotARecordType {
            type_name: type_name::<T>().to_string(),
        });
    }

    let resolved = resolve::<T>(&columns)?;
    trace!(record = type_name::<T>(), fields = resolved.len(), "resolved record fields");

    let resolved: Arc<[String]> = resolved.into();
    let mut cache = FIELD_CACHE.write();
    Ok(Arc::clone(cache.entry(key).or_insert(resolved)))
}

/// The field names of `T` joined with `", "`.
pub fn field_list<T: Record>() -> TemplateResult<String> {
    Ok(fields::<T>()?.join(", "))
}

/// Recursion limit for bases; guards against a record embedding itself.
const MAX_BASE_DEPTH: usize = 32;

/// A column occurrence after base expansion. Depth 0 is the record itself.
struct Occurrence {
    name: &'static str,
    depth: usize,
    optional: bool,
}

fn collect(decls: &[FieldDecl], out: &mut Vec<Occurrence>, depth: usize) {
    for decl in decls {
        match *decl {
            FieldDecl::Column { optional, .. } => {
                if let Some(name) = decl.sql_name() {
                    out.push(Occurrence {
                        name,
                        depth,
                        optional,
                    });
                }
            }
            FieldDecl::Base { fields, .. } => {
                if depth < MAX_BASE_DEPTH {
                    collect(&fields(), out, depth + 1);
                }
            }
        }
    }
}

fn resolve<T: Record>(columns: &[Occurrence]) -> TemplateResult<Vec<String>> {
    let mut first_seen: HashMap<&'static str, usize> = HashMap::new();
    let mut order = Vec::new();
    for (index, column) in columns.iter().enumerate() {
        first_seen.entry(column.name).or_insert_with(|| {
            order.push(column.name);
            index
        });
    }

    for (index, column) in columns.iter().enumerate() {
        if column.depth == 0 || column.optional {
            continue;
        }
        let fed = columns
            .iter()
            .position(|c| c.name == column.name && c.depth == 0)
            .or_else(|| first_seen.get(column.name).copied());
        if fed != Some(index) {
            return Err(TemplateError::ShadowedField {
                type_name: type_name::<T>().to_string(),
                field: column.name.to_string(),
            });
        }
    }

    Ok(order.into_iter().map(str::to_string).collect())
}
