//! Evaluation state: the scope stack, the access-level gate, and the alias
//! tick.

use log::info;
use std::collections::HashMap;

use super::object::{Module, Object};
use crate::ast::Stmt;
use crate::db::Database;
use crate::error::{Error, ErrorKind, Result};

/// An ordered capability bound on what an evaluation may do. Parameter
/// compilation runs at `Compile`; queries need `ReadDb`; mutations `WriteDb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessLevel {
    Compile,
    Evaluate,
    ReadDb,
    WriteDb,
}

#[derive(Debug, Clone)]
pub struct Options {
    /// Echo every submitted statement at info level instead of debug.
    pub print_sql: bool,
    /// Fold operations on locally-known constants instead of emitting SQL.
    pub fold_constants: bool,
    /// Collect `print` output instead of writing it to stdout.
    pub capture_output: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            print_sql: false,
            fold_constants: true,
            capture_output: false,
        }
    }
}

pub type Scope = HashMap<String, Object>;

pub struct State {
    pub db: Database,
    pub options: Options,
    pub access_level: AccessLevel,
    /// Call sites of user functions currently executing, innermost last.
    pub stacktrace: Vec<String>,
    ns: Namespace,
    tick: usize,
    modules: HashMap<String, Vec<Stmt>>,
    cache: HashMap<String, Object>,
    captured: Vec<String>,
}

impl State {
    pub fn new(db: Database, options: Options) -> State {
        info!("interpreter state created for {} backend", db.dialect());
        State {
            db,
            options,
            access_level: AccessLevel::WriteDb,
            stacktrace: Vec::new(),
            ns: Namespace::default(),
            tick: 0,
            modules: HashMap::new(),
            cache: HashMap::new(),
            captured: Vec::new(),
        }
    }

    /// Looks `name` up through the scope stack, falling back to attributes
    /// of the built-in module.
    pub fn get_var(&self, name: &str) -> Result<Object, Error> {
        for scope in self.ns.scopes.iter().rev() {
            if let Some(object) = scope.get(name) {
                return Ok(object.clone());
            }
        }
        if let Some(Object::Module(builtins)) = self.builtins() {
            if let Some(object) = builtins.namespace.get(name) {
                return Ok(object.clone());
            }
        }
        Err(Error::new(
            ErrorKind::NameNotFound,
            format!("name not found: '{name}'"),
        ))
    }

    fn builtins(&self) -> Option<&Object> {
        self.ns.scopes.first()?.get(super::builtins::BUILTINS_NAME)
    }

    pub fn set_var<S: Into<String>>(&mut self, name: S, value: Object) {
        self.ns
            .scopes
            .last_mut()
            .expect("the namespace always has a scope")
            .insert(name.into(), value);
    }

    /// Runs `f` with `scope` pushed; the scope pops on every exit path.
    pub fn scoped<R>(
        &mut self,
        scope: Scope,
        f: impl FnOnce(&mut State) -> Result<R>,
    ) -> Result<R> {
        self.ns.scopes.push(scope);
        let depth = self.ns.scopes.len();
        let result = f(self);
        debug_assert_eq!(depth, self.ns.scopes.len(), "unbalanced scope stack");
        self.ns.scopes.pop();
        result
    }

    /// Like [State::scoped], but also hands back the scope contents; used
    /// for module imports.
    pub fn scoped_capture<R>(
        &mut self,
        scope: Scope,
        f: impl FnOnce(&mut State) -> Result<R>,
    ) -> Result<(R, Scope)> {
        self.ns.scopes.push(scope);
        let result = f(self);
        let scope = self.ns.scopes.pop().expect("scope pushed above");
        result.map(|r| (r, scope))
    }

    pub fn scope_depth(&self) -> usize {
        self.ns.scopes.len()
    }

    /// Mints a globally-unique alias with the given prefix.
    pub fn unique_name(&mut self, prefix: &str) -> String {
        self.tick += 1;
        format!("{}{}", prefix, self.tick)
    }

    pub fn require_access(&self, level: AccessLevel) -> Result<(), Error> {
        if self.access_level < level {
            return Err(Error::new(
                ErrorKind::InsufficientAccess,
                format!("operation requires {level:?} access"),
            ));
        }
        Ok(())
    }

    /// Runs `f` with the access ceiling lowered to at most `level`; the
    /// previous ceiling is restored on every exit path.
    pub fn with_access<R>(
        &mut self,
        level: AccessLevel,
        f: impl FnOnce(&mut State) -> Result<R>,
    ) -> Result<R> {
        let previous = self.access_level;
        self.access_level = self.access_level.min(level);
        let result = f(self);
        self.access_level = previous;
        result
    }

    pub fn register_module<S: Into<String>>(&mut self, name: S, stmts: Vec<Stmt>) {
        let name = name.into();
        self.cache.remove(&format!("module:{name}"));
        self.modules.insert(name, stmts);
    }

    pub fn module_stmts(&self, name: &str) -> Option<Vec<Stmt>> {
        self.modules.get(name).cloned()
    }

    /// Memoized sub-results, keyed by a caller-chosen string. Imported
    /// modules land here so a second `import` doesn't re-execute them.
    pub fn cached(&self, key: &str) -> Option<Object> {
        self.cache.get(key).cloned()
    }

    pub fn memoize<S: Into<String>>(&mut self, key: S, value: Object) {
        self.cache.insert(key.into(), value);
    }

    pub fn install_builtins(&mut self, builtins: Module) {
        debug_assert_eq!(self.ns.scopes.len(), 1);
        self.ns.scopes[0].insert(
            super::builtins::BUILTINS_NAME.to_string(),
            Object::Module(builtins),
        );
    }

    pub fn emit(&mut self, line: String) {
        if self.options.capture_output {
            self.captured.push(line);
        } else {
            println!("{line}");
        }
    }

    pub fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.captured)
    }
}

#[derive(Debug)]
struct Namespace {
    scopes: Vec<Scope>,
}

impl Default for Namespace {
    fn default() -> Self {
        // The base scope holds the built-in module and top-level bindings.
        Namespace {
            scopes: vec![Scope::new()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Literal;
    use crate::interpreter::Instance;

    fn state() -> State {
        State::new(Database::memory().unwrap(), Options::default())
    }

    #[test]
    fn lookup_walks_scopes_top_down() {
        let mut state = state();
        state.set_var("x", Object::from_literal(Literal::Int(1)));
        let result = state
            .scoped(Scope::new(), |state| {
                state.set_var("x", Object::from_literal(Literal::Int(2)));
                Ok(state.get_var("x")?)
            })
            .unwrap();
        let inst = result.as_instance().unwrap();
        assert_eq!(inst.kind.as_value(), Some(&Literal::Int(2)));
        // inner binding is gone after the scope pops
        let outer = state.get_var("x").unwrap();
        assert_eq!(
            outer.as_instance().unwrap().kind.as_value(),
            Some(&Literal::Int(1))
        );
    }

    #[test]
    fn scopes_pop_on_error_paths() {
        let mut state = state();
        let depth = state.scope_depth();
        let result: Result<()> = state.scoped(Scope::new(), |state| {
            state.set_var("t", Object::Instance(Instance::value(Literal::Null)));
            Err(Error::new(ErrorKind::Value, "boom").into())
        });
        assert!(result.is_err());
        assert_eq!(state.scope_depth(), depth);
        assert!(state.get_var("t").is_err());
    }

    #[test]
    fn access_ceiling_restores_on_exit() {
        let mut state = state();
        assert!(state.require_access(AccessLevel::WriteDb).is_ok());
        state
            .with_access(AccessLevel::Compile, |state| {
                assert!(state.require_access(AccessLevel::ReadDb).is_err());
                Ok(())
            })
            .unwrap();
        assert!(state.require_access(AccessLevel::WriteDb).is_ok());
    }

    #[test]
    fn unique_names_never_repeat() {
        let mut state = state();
        let a = state.unique_name("proj");
        let b = state.unique_name("proj");
        let c = state.unique_name("list_");
        assert_ne!(a, b);
        assert!(!c.ends_with(&a));
    }
}
