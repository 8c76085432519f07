//! Feature map for SQL dialects.
//!
//! The general principle is to target the generic dialect and add
//! per-backend overrides only where the generic form is not supported
//! (placeholder style, LIMIT-less OFFSET, array aggregation, string repeat).

use core::fmt::Debug;

use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};

use crate::error::{Error, ErrorKind, Result};
use crate::types::{Ty, TyKind};

/// SQL dialect.
///
/// This only changes the output for a relatively small subset of features.
#[derive(
    Debug,
    PartialEq,
    Eq,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
    strum::EnumString,
    strum::EnumVariantNames,
)]
#[strum(serialize_all = "lowercase")]
pub enum Dialect {
    Generic,
    SQLite,
    Postgres,
    MySql,
}

impl Dialect {
    pub(super) fn handler(&self) -> Box<dyn DialectHandler> {
        match self {
            Dialect::SQLite => Box::new(SQLiteDialect),
            Dialect::Postgres => Box::new(PostgresDialect),
            Dialect::MySql => Box::new(MySqlDialect),
            Dialect::Generic => Box::new(GenericDialect),
        }
    }
}

impl Default for Dialect {
    fn default() -> Self {
        Dialect::Generic
    }
}

#[derive(Debug)]
pub struct GenericDialect;
#[derive(Debug)]
pub struct SQLiteDialect;
#[derive(Debug)]
pub struct PostgresDialect;
#[derive(Debug)]
pub struct MySqlDialect;

pub(super) trait DialectHandler: Any + Debug {
    fn ident_quote(&self) -> char {
        '"'
    }

    /// The placeholder for the 1-based `index`-th positional parameter.
    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    /// The LIMIT value to emit when a query has an OFFSET but no LIMIT.
    /// `None` when the dialect accepts a bare OFFSET.
    fn limit_for_offset_only(&self) -> Option<&'static str> {
        None
    }

    fn last_row_id(&self) -> &'static str {
        "last_insert_rowid()"
    }

    /// Column definition for the implicit integer primary key.
    fn id_column_def(&self) -> &'static str {
        "INTEGER PRIMARY KEY"
    }

    fn type_name(&self, ty: &Ty) -> Result<&'static str, Error> {
        Ok(match ty.kind {
            TyKind::Int => "INTEGER",
            TyKind::Float => "REAL",
            TyKind::Bool => "BOOLEAN",
            TyKind::String => "TEXT",
            _ => {
                return Err(Error::new(
                    ErrorKind::NotImplemented,
                    format!("no column type for {ty} in this dialect"),
                ))
            }
        })
    }

    /// Aggregate a grouped element into an array value.
    fn make_array(&self, inner: &str) -> String {
        format!("group_concat({inner})")
    }

    fn concat(&self, left: &str, right: &str) -> String {
        format!("{left} || {right}")
    }

    fn floor_div(&self, left: &str, right: &str) -> String {
        format!("CAST({left} / {right} AS INTEGER)")
    }

    fn function(&self, name: &str, args: &[String]) -> Result<String, Error> {
        Ok(format!("{}({})", name, args.join(", ")))
    }
}

impl dyn DialectHandler {
    #[inline]
    pub fn is<T: DialectHandler + 'static>(&self) -> bool {
        TypeId::of::<T>() == self.type_id()
    }
}

impl DialectHandler for GenericDialect {}

impl DialectHandler for SQLiteDialect {
    fn limit_for_offset_only(&self) -> Option<&'static str> {
        Some("-1")
    }

    fn function(&self, name: &str, args: &[String]) -> Result<String, Error> {
        // SQLite has no repeat(); zeroblob expansion is the standard idiom.
        if name == "repeat" {
            let [s, n] = args else {
                return Err(Error::new(
                    ErrorKind::Compile,
                    "repeat expects two arguments",
                ));
            };
            return Ok(format!("replace(hex(zeroblob({n})), '00', {s})"));
        }
        Ok(format!("{}({})", name, args.join(", ")))
    }
}

impl DialectHandler for PostgresDialect {
    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }

    fn last_row_id(&self) -> &'static str {
        "lastval()"
    }

    fn id_column_def(&self) -> &'static str {
        "SERIAL PRIMARY KEY"
    }

    fn type_name(&self, ty: &Ty) -> Result<&'static str, Error> {
        if ty.kind == TyKind::Float {
            return Ok("DOUBLE PRECISION");
        }
        GenericDialect.type_name(ty)
    }

    fn make_array(&self, inner: &str) -> String {
        format!("array_agg({inner})")
    }
}

impl DialectHandler for MySqlDialect {
    fn ident_quote(&self) -> char {
        '`'
    }

    fn limit_for_offset_only(&self) -> Option<&'static str> {
        // https://dev.mysql.com/doc/refman/8.0/en/select.html
        Some("18446744073709551615")
    }

    fn last_row_id(&self) -> &'static str {
        "LAST_INSERT_ID()"
    }

    fn id_column_def(&self) -> &'static str {
        "INTEGER PRIMARY KEY AUTO_INCREMENT"
    }

    fn type_name(&self, ty: &Ty) -> Result<&'static str, Error> {
        if ty.kind == TyKind::Float {
            return Ok("DOUBLE");
        }
        GenericDialect.type_name(ty)
    }

    fn concat(&self, left: &str, right: &str) -> String {
        format!("CONCAT({left}, {right})")
    }

    fn floor_div(&self, left: &str, right: &str) -> String {
        format!("{left} DIV {right}")
    }
}

#[cfg(test)]
mod tests {
    use super::Dialect;
    use insta::assert_debug_snapshot;
    use std::str::FromStr;

    #[test]
    fn test_dialect_from_str() {
        assert_debug_snapshot!(Dialect::from_str("postgres"), @r###"
        Ok(
            Postgres,
        )
        "###);

        assert_debug_snapshot!(Dialect::from_str("foo"), @r###"
        Err(
            VariantNotFound,
        )
        "###);
    }
}
