//! Interpreter for relq, a small statically-typed relational scripting
//! language that pushes its table expressions down to a SQL backend.
//!
//! The pipeline:
//! ```ascii
//!   source ──(external parser)──► AST statements
//!                                      │
//!                                  (execute)
//!                                      │
//!            evaluator: AST ──► typed Instance (type + SQL IR + subqueries)
//!                                      │
//!                                  (localize)
//!                                      │
//!            renderer: SQL IR ──► (sql_text, params) ──► database ──► rows
//! ```
//!
//! Table-shaped expressions stay lazy: they accumulate IR and only hit the
//! database when a concrete value is required (`print`, `if`, `for`, reading
//! a row id after an insert). [interpreter::Interpreter] is the entry point:
//!
//! ```
//! use relq::ast::{ColumnDef, Expr, Stmt, StmtKind};
//! use relq::interpreter::Interpreter;
//!
//! let mut interp = Interpreter::in_memory().unwrap();
//! interp
//!     .execute(&Stmt::new(StmtKind::TableDef {
//!         name: "points".to_string(),
//!         columns: vec![ColumnDef {
//!             name: "x".to_string(),
//!             type_expr: Expr::name("int"),
//!         }],
//!     }))
//!     .unwrap();
//! ```

// The error type is large because it carries a message, a span, a help text
// and a stack; boxing it everywhere isn't worth the churn.
#![allow(clippy::result_large_err)]

pub mod ast;
pub mod db;
mod error;
pub mod interpreter;
pub mod sql;
#[cfg(test)]
mod test;
pub mod types;
mod utils;

pub use error::{
    downcast, Error, ErrorKind, ErrorMessage, ErrorMessages, Result, SourceLocation, Span,
    WithErrorInfo,
};
pub use interpreter::{Interpreter, LocalValue, Object, Options};
pub use utils::IntoOnly;

use ast::Stmt;
use db::Database;

/// Runs statements against a database URI and returns the value of the last
/// one, with errors folded into displayable messages.
pub fn execute(db_uri: &str, stmts: &[Stmt]) -> Result<Object, ErrorMessages> {
    let db = Database::open(db_uri, false).map_err(|e| downcast(e.into()))?;
    let mut interp = Interpreter::new(db, Options::default());
    interp.execute_stmts(stmts).map_err(downcast)
}
