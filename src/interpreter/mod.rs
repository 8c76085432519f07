//! The interpreter: a namespace seeded with the built-in module, a database
//! handle, and the statement loop.
//!
//! One interpreter owns one evaluation context; evaluation is single-threaded
//! and side-effect-ordered with respect to the database.

pub mod builtins;
mod eval;
mod exec;
mod object;
mod state;

pub use eval::{evaluate, localize, LocalValue};
pub use exec::{execute, Flow};
pub use object::{
    match_params, BoundArg, BuiltinFunction, Function, Instance, InstanceKind, Module, Object,
    UserFunction,
};
pub use state::{AccessLevel, Options, Scope, State};

use crate::ast::{NamedField, Stmt};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::sql::SqlExpr;
use crate::types::Ty;

pub struct Interpreter {
    state: State,
}

impl Interpreter {
    pub fn new(db: Database, options: Options) -> Interpreter {
        let mut state = State::new(db, options);
        state.install_builtins(builtins::default_module());
        Interpreter { state }
    }

    /// An interpreter over a fresh in-memory SQLite database.
    pub fn in_memory() -> Result<Interpreter, Error> {
        Ok(Interpreter::new(Database::memory()?, Options::default()))
    }

    /// Executes statements in order; the value of the last statement is the
    /// result. A top-level `return` is a CodeError.
    pub fn execute_stmts(&mut self, stmts: &[Stmt]) -> Result<Object> {
        exec::execute_many(&mut self.state, stmts)
    }

    pub fn execute(&mut self, stmt: &Stmt) -> Result<Object> {
        exec::execute(&mut self.state, stmt)?
            .into_value()
            .map_err(|e| e.with_span(stmt.span).into())
    }

    pub fn evaluate(&mut self, expr: &crate::ast::Expr) -> Result<Object> {
        eval::evaluate(&mut self.state, expr)
    }

    /// Materializes an object into host values, submitting its SQL.
    pub fn localize(&mut self, object: &Object) -> Result<LocalValue> {
        eval::localize(&mut self.state, object)
    }

    pub fn call_func(&mut self, name: &str, args: Vec<NamedField>) -> Result<Object> {
        exec::call_func_by_name(&mut self.state, name, args)
    }

    pub fn set_var<S: Into<String>>(&mut self, name: S, value: Object) {
        self.state.set_var(name, value);
    }

    pub fn get_var(&self, name: &str) -> Result<Object, Error> {
        self.state.get_var(name)
    }

    pub fn has_var(&self, name: &str) -> bool {
        self.state.get_var(name).is_ok()
    }

    /// Registers the statements of an importable module; `import name` runs
    /// them and binds the resulting namespace.
    pub fn register_module<S: Into<String>>(&mut self, name: S, stmts: Vec<Stmt>) {
        self.state.register_module(name, stmts);
    }

    /// Introspects the backend and binds every existing table that doesn't
    /// collide with a current name.
    pub fn load_all_tables(&mut self) -> Result<()> {
        let types = self.state.db.import_table_types()?;
        for (_namespace, name, table) in types {
            if self.has_var(&name) {
                continue;
            }
            let ty = Ty::table(table);
            let inst = Instance::table(SqlExpr::TableName(ty.clone(), name.clone()), ty, &[]);
            self.state.set_var(name, Object::Instance(inst));
        }
        Ok(())
    }

    /// Output collected by `print` when [Options::capture_output] is set.
    pub fn take_output(&mut self) -> Vec<String> {
        self.state.take_output()
    }

    pub fn state_mut(&mut self) -> &mut State {
        &mut self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, Literal};
    use crate::error::ErrorKind;

    #[test]
    fn builtin_names_resolve_through_the_base_scope() {
        let interp = Interpreter::in_memory().unwrap();
        assert!(interp.get_var("int").unwrap().as_type().is_some());
        assert!(interp.get_var("count").unwrap().as_function().is_some());
        assert!(interp.get_var("ValueError").unwrap().as_type().is_some());
        assert_eq!(
            interp.get_var("no_such_thing").unwrap_err().kind,
            ErrorKind::NameNotFound
        );
    }

    #[test]
    fn user_bindings_shadow_builtins() {
        let mut interp = Interpreter::in_memory().unwrap();
        interp.set_var("count", Object::from_literal(Literal::Int(7)));
        let object = interp.evaluate(&Expr::name("count")).unwrap();
        assert_eq!(
            object.as_instance().unwrap().kind.as_value(),
            Some(&Literal::Int(7))
        );
    }
}
