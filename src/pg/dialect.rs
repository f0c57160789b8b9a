//! PostgreSQL dialect rules and the query build policy.
//!
//! SQL generation itself belongs to an external query builder, seen here
//! only through the `Query` trait. The connection supplies the dialect rules
//! and applies the one policy it owns: appending `RETURNING ... AS id` to
//! inserts that want their generated key.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use super::params::Params;
use super::types::PgValue;
use crate::error::{DriverError, Result};

pub const SUFFIX_CONFLICT: &str = "Suffix for query already set, could not add Returning suffix";

/// Portable function and type names the builder asks the dialect to spell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Substitution {
    Ucase,
    Lcase,
    Len,
    Double,
    Uuid,
}

/// Spelling rules of one SQL dialect.
#[derive(Debug, Clone)]
pub struct Dialect {
    /// Character used to quote identifiers
    pub identifier_quote: char,
    /// Prefix of numbered placeholders (`$1`, `$2`, ...)
    pub numbered_parameter_prefix: &'static str,
    /// Prefix of named placeholders; empty when the dialect has none
    pub named_parameter_prefix: &'static str,
    /// DELETE with joined tables takes `USING`
    pub delete_requires_using: bool,
    /// UPDATE with joined tables takes `FROM`
    pub update_requires_from: bool,
    substitutions: HashMap<Substitution, &'static str>,
    auto_increment: HashMap<&'static str, &'static str>,
}

static POSTGRES: Lazy<Dialect> = Lazy::new(|| Dialect {
    identifier_quote: '"',
    numbered_parameter_prefix: "$",
    named_parameter_prefix: "",
    delete_requires_using: true,
    update_requires_from: true,
    substitutions: HashMap::from([
        (Substitution::Ucase, "UPPER"),
        (Substitution::Lcase, "LOWER"),
        (Substitution::Len, "LENGTH"),
        (Substitution::Double, "double precision"),
        (Substitution::Uuid, "uuid"),
    ]),
    auto_increment: HashMap::from([
        ("smallint", "smallserial"),
        ("integer", "serial"),
        ("bigint", "bigserial"),
    ]),
});

impl Dialect {
    pub fn postgres() -> &'static Dialect {
        &POSTGRES
    }

    /// Quote an identifier, doubling embedded quote characters.
    pub fn quote_identifier(&self, identifier: &str) -> String {
        let q = self.identifier_quote;
        let mut out = String::with_capacity(identifier.len() + 2);
        out.push(q);
        for c in identifier.chars() {
            if c == q {
                out.push(q);
            }
            out.push(c);
        }
        out.push(q);
        out
    }

    /// The placeholder for the 1-based parameter `index`.
    pub fn numbered_parameter(&self, index: usize) -> String {
        format!("{}{}", self.numbered_parameter_prefix, index)
    }

    pub fn substitute(&self, what: Substitution) -> &'static str {
        self.substitutions.get(&what).copied().unwrap_or("")
    }

    /// The auto-incrementing column type for `sql_type`, if it has one.
    pub fn auto_increment_type(&self, sql_type: &str) -> Option<&'static str> {
        self.auto_increment
            .get(sql_type.to_ascii_lowercase().as_str())
            .copied()
    }
}

/// An insert that wants its generated key returned.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReturningId {
    /// Auto-incrementing primary key columns of the target table
    pub autoincrement_keys: Vec<String>,
}

/// A structured query the external builder can turn into command text.
pub trait Query: Send + Sync {
    fn build(&self, dialect: &Dialect) -> std::result::Result<String, String>;

    /// Clause appended by the caller after the built text, if any.
    fn suffix(&self) -> Option<&str> {
        None
    }

    fn returning_id(&self) -> Option<ReturningId> {
        None
    }

    /// Named placeholders in the order they appear in the built text.
    fn named_parameters(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Build `query` for `dialect`, applying the returning-id policy.
pub fn build_query(query: &dyn Query, dialect: &Dialect) -> Result<String> {
    let mut text = query.build(dialect).map_err(DriverError::SyntaxError)?;

    if let Some(returning) = query.returning_id() {
        if query.suffix().is_some() {
            return Err(DriverError::SyntaxError(SUFFIX_CONFLICT.to_string()));
        }
        if let [key] = returning.autoincrement_keys.as_slice() {
            text.push_str(" RETURNING ");
            text.push_str(&dialect.quote_identifier(key));
            text.push_str(" AS id");
        }
    }

    Ok(text)
}

/// Resolve the parameters of a built query into positional order.
pub fn bind_parameters(query: &dyn Query, params: Params) -> Result<Vec<Option<PgValue>>> {
    match params {
        Params::None => Ok(Vec::new()),
        Params::Positional(values) => Ok(values),
        Params::Named(values) => query
            .named_parameters()
            .iter()
            .map(|name| {
                values
                    .iter()
                    .find(|(k, _)| k == name)
                    .map(|(_, v)| v.clone())
                    .ok_or_else(|| {
                        DriverError::SyntaxError(format!("Missing value for parameter {}", name))
                    })
            })
            .collect(),
    }
}
