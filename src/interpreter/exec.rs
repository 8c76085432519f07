//! The statement executor: control flow, definitions, and mutation.
//!
//! `return` travels as [Flow::Return], an explicit bail value, not an error;
//! the function-call boundary converts it back into a value and the
//! interpreter's top level rejects it with a CodeError.

use super::eval::{eval_instance, evaluate, localize, stored_table_of, LocalValue};
use super::object::{Function, Instance, InstanceKind, Module, Object, UserFunction};
use super::state::{AccessLevel, Scope, State};
use crate::ast::{ColumnDef, Expr, ExprKind, Literal, Stmt, StmtKind};
use crate::error::{with_span_fallback, Error, ErrorKind, Result, Span};
use crate::sql::{Select, SqlExpr};
use crate::types::{TableTy, Ty, TyKind};

/// The outcome of a statement: a value, or a `return` unwinding to the
/// nearest call boundary.
#[derive(Debug)]
pub enum Flow {
    Normal(Object),
    Return(Object),
}

impl Flow {
    pub fn into_value(self) -> Result<Object, Error> {
        match self {
            Flow::Normal(value) => Ok(value),
            Flow::Return(_) => Err(Error::new(
                ErrorKind::Code,
                "'return' outside of function",
            )),
        }
    }
}

pub fn execute(state: &mut State, stmt: &Stmt) -> Result<Flow> {
    exec_stmt(state, stmt).map_err(|e| with_span_fallback(e, stmt.span))
}

fn err(kind: ErrorKind, reason: String, span: Option<Span>) -> anyhow::Error {
    Error::new(kind, reason).with_span(span).into()
}

fn exec_stmt(state: &mut State, stmt: &Stmt) -> Result<Flow> {
    let span = stmt.span;
    match &stmt.kind {
        StmtKind::Expr(expr) => Ok(Flow::Normal(evaluate(state, expr)?)),

        StmtKind::SetValue { target, value } => {
            let name = match &target.kind {
                ExprKind::Name(name) => name.clone(),
                ExprKind::Attr { .. } => {
                    return Err(err(
                        ErrorKind::NotImplemented,
                        "assignment to attributes".to_string(),
                        target.span,
                    ))
                }
                _ => {
                    return Err(err(
                        ErrorKind::Syntax,
                        "L-value must be a name".to_string(),
                        target.span,
                    ))
                }
            };
            let value = evaluate(state, value)?;
            state.set_var(name, value);
            Ok(Flow::Normal(Object::null()))
        }

        StmtKind::InsertRows { target, value } => exec_insert_rows(state, target, value),

        StmtKind::CodeBlock(stmts) => {
            let mut last = Object::null();
            for stmt in stmts {
                match execute(state, stmt)? {
                    Flow::Normal(value) => last = value,
                    flow @ Flow::Return(_) => return Ok(flow),
                }
            }
            Ok(Flow::Normal(last))
        }

        StmtKind::If { cond, then, else_ } => {
            let cond = evaluate(state, cond)?;
            if localize(state, &cond)?.is_truthy() {
                execute(state, then)
            } else if let Some(else_) = else_ {
                execute(state, else_)
            } else {
                Ok(Flow::Normal(Object::null()))
            }
        }

        StmtKind::While { cond, body } => {
            loop {
                let cond = evaluate(state, cond)?;
                if !localize(state, &cond)?.is_truthy() {
                    break;
                }
                if let flow @ Flow::Return(_) = execute(state, body)? {
                    return Ok(flow);
                }
            }
            Ok(Flow::Normal(Object::null()))
        }

        StmtKind::For {
            var,
            iterable,
            body,
        } => exec_for(state, var, iterable, body),

        StmtKind::Try {
            block,
            catch_name,
            catch_expr,
            handler,
        } => exec_try(state, block, catch_name.as_deref(), catch_expr, handler),

        StmtKind::Throw { value } => {
            let inst = eval_instance(state, value)?;
            match (&inst.ty.kind, &inst.kind) {
                (TyKind::Exception(Some(kind)), InstanceKind::Value(message)) => {
                    let message = match message {
                        Literal::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    Err(err(*kind, message, span))
                }
                _ => Err(err(
                    ErrorKind::Type,
                    format!("can only throw error values, got {}", inst.ty),
                    value.span,
                )),
            }
        }

        StmtKind::Return { value } => {
            let value = evaluate(state, value)?;
            Ok(Flow::Return(value))
        }

        StmtKind::Print { values } => {
            let mut parts = Vec::with_capacity(values.len());
            for value in values {
                let object = evaluate(state, value)?;
                parts.push(match &object {
                    Object::Instance(_) => localize(state, &object)?.to_string(),
                    other => other.to_string(),
                });
            }
            let line = parts.join(" ");
            state.emit(line);
            Ok(Flow::Normal(Object::null()))
        }

        StmtKind::Assert { cond } => {
            let object = evaluate(state, cond)?;
            if !localize(state, &object)?.is_truthy() {
                return Err(err(
                    ErrorKind::Value,
                    "assertion failed".to_string(),
                    cond.span,
                ));
            }
            Ok(Flow::Normal(Object::null()))
        }

        StmtKind::TableDef { name, columns } => exec_table_def(state, name, columns, span),

        StmtKind::StructDef { name, members } => {
            let mut fields = Vec::with_capacity(members.len());
            for (member, type_expr) in members {
                let ty = resolve_type(state, type_expr)?;
                fields.push((member.clone(), ty));
            }
            state.set_var(name.clone(), Object::Type(Ty::new(TyKind::Struct(fields))));
            Ok(Flow::Normal(Object::null()))
        }

        StmtKind::FuncDef(def) => {
            state.set_var(
                def.name.clone(),
                Object::Function(Function::User(UserFunction { def: def.clone() })),
            );
            Ok(Flow::Normal(Object::null()))
        }

        StmtKind::Import { module, as_name } => {
            let bound_name = as_name.clone().unwrap_or_else(|| module.clone());
            let cache_key = format!("module:{module}");
            if let Some(cached) = state.cached(&cache_key) {
                state.set_var(bound_name, cached);
                return Ok(Flow::Normal(Object::null()));
            }

            let stmts = state.module_stmts(module).ok_or_else(|| {
                err(
                    ErrorKind::NameNotFound,
                    format!("module not found: '{module}'"),
                    span,
                )
            })?;
            let ((), namespace) = state.scoped_capture(Scope::new(), |state| {
                for stmt in &stmts {
                    execute(state, stmt)?.into_value()?;
                }
                Ok(())
            })?;
            let imported = Object::Module(Module {
                name: module.clone(),
                namespace,
            });
            state.memoize(cache_key, imported.clone());
            state.set_var(bound_name, imported);
            Ok(Flow::Normal(Object::null()))
        }
    }
}

fn exec_for(state: &mut State, var: &str, iterable: &Expr, body: &Stmt) -> Result<Flow> {
    let inst = eval_instance(state, iterable)?;
    let table_ty = inst.ty.kind.as_table().cloned();
    let local = localize(state, &Object::Instance(inst))?;

    match local {
        LocalValue::Values(values) => {
            for value in values {
                let scope: Scope = [(var.to_string(), Object::from_literal(value))].into();
                if let flow @ Flow::Return(_) =
                    state.scoped(scope, |state| execute(state, body))?
                {
                    return Ok(flow);
                }
            }
        }
        LocalValue::Rows(rows) => {
            let table_ty = table_ty.unwrap_or_else(|| TableTy::anonymous(vec![]));
            for row in rows {
                let fields = row
                    .into_iter()
                    .map(|(name, value)| {
                        let ty = table_ty
                            .column(&name)
                            .cloned()
                            .unwrap_or_else(|| Instance::value(value.clone()).ty);
                        (name, Instance::value_typed(value, ty))
                    })
                    .collect();
                let row_inst = Instance::row(table_ty.clone(), fields);
                let scope: Scope =
                    [(var.to_string(), Object::Instance(row_inst))].into();
                if let flow @ Flow::Return(_) =
                    state.scoped(scope, |state| execute(state, body))?
                {
                    return Ok(flow);
                }
            }
        }
        other => {
            return Err(err(
                ErrorKind::Type,
                format!("'for' expected a collection, got {other}"),
                iterable.span,
            ))
        }
    }
    Ok(Flow::Normal(Object::null()))
}

fn exec_try(
    state: &mut State,
    block: &Stmt,
    catch_name: Option<&str>,
    catch_expr: &Expr,
    handler: &Stmt,
) -> Result<Flow> {
    let raised = match execute(state, block) {
        Ok(flow) => return Ok(flow),
        Err(error) => error,
    };
    let (raised_kind, raised_reason) = match raised.downcast_ref::<Error>() {
        Some(our) => (our.kind, our.reason.clone()),
        None => return Err(raised),
    };

    let caught_kind = match evaluate(state, catch_expr)? {
        Object::Type(Ty {
            kind: TyKind::Exception(kind),
            ..
        }) => kind,
        other => {
            return Err(err(
                ErrorKind::Type,
                format!("catch expected an error type, got {other}"),
                catch_expr.span,
            ))
        }
    };

    let raised_ty = Ty::exception(Some(raised_kind));
    if !raised_ty.is_subtype_of(&Ty::exception(caught_kind)) {
        return Err(raised);
    }

    let mut scope = Scope::new();
    if let Some(name) = catch_name {
        let error_inst = Instance {
            code: SqlExpr::Null,
            ty: raised_ty,
            subqueries: vec![],
            kind: InstanceKind::Value(Literal::String(raised_reason)),
        };
        scope.insert(name.to_string(), Object::Instance(error_inst));
    }
    state.scoped(scope, |state| execute(state, handler))
}

fn exec_insert_rows(state: &mut State, target: &Expr, value: &Expr) -> Result<Flow> {
    let ExprKind::Name(name) = &target.kind else {
        return Err(err(
            ErrorKind::Syntax,
            "L-value must be a table name".to_string(),
            target.span,
        ));
    };

    let source = eval_instance(state, value)?;
    if source.is_empty_list() {
        return Ok(Flow::Normal(Object::null()));
    }

    let target_obj = state.get_var(name).map_err(|e| e.with_span(target.span))?;
    let table = stored_table_of(&target_obj, target.span)?;
    let table_name = table.name.clone().ok_or_else(|| {
        err(
            ErrorKind::Value,
            "insert expected a stored table, got a query".to_string(),
            target.span,
        )
    })?;
    state.require_access(AccessLevel::WriteDb)?;

    let columns: Vec<(String, Ty)> = table.value_columns().cloned().collect();

    // Project the source onto the target's value columns, dropping primary
    // keys; the database assigns fresh ids.
    let source_select: SqlExpr = match &source.ty.kind {
        TyKind::Table(src) => {
            for (column, _) in &columns {
                if src.column(column).is_none() {
                    return Err(err(
                        ErrorKind::Type,
                        format!("missing column '{column}' in the inserted rows"),
                        value.span,
                    ));
                }
            }
            let mut select = Select::from_source(source.ty.clone(), source.code.clone());
            select.fields = columns
                .iter()
                .map(|(column, ty)| SqlExpr::ColumnAlias {
                    value: Box::new(SqlExpr::Name(ty.clone(), column.clone())),
                    alias: column.clone(),
                })
                .collect();
            select.into()
        }
        TyKind::List(elem) => {
            let [(column, _)] = columns.as_slice() else {
                return Err(err(
                    ErrorKind::Type,
                    format!("cannot insert a list into the {}-column table '{table_name}'",
                        columns.len()),
                    value.span,
                ));
            };
            let mut select = Select::from_source(source.ty.clone(), source.code.clone());
            select.fields = vec![SqlExpr::ColumnAlias {
                value: Box::new(SqlExpr::Name((**elem).clone(), "value".to_string())),
                alias: column.clone(),
            }];
            select.into()
        }
        _ => {
            return Err(err(
                ErrorKind::Type,
                format!("insert expected a collection, got {}", source.ty),
                value.span,
            ))
        }
    };

    let code = SqlExpr::Insert {
        table: table_name,
        columns: columns.into_iter().map(|(n, _)| n).collect(),
        source: Box::new(source_select),
    };
    state.db.query(&code, &source.subqueries)?;
    Ok(Flow::Normal(Object::null()))
}

fn resolve_type(state: &mut State, type_expr: &Expr) -> Result<Ty> {
    match evaluate(state, type_expr)? {
        Object::Type(ty) => Ok(ty),
        other => Err(err(
            ErrorKind::Type,
            format!("expected a type, instead got '{other}'"),
            type_expr.span,
        )),
    }
}

fn exec_table_def(
    state: &mut State,
    name: &str,
    column_defs: &[ColumnDef],
    span: Option<Span>,
) -> Result<Flow> {
    let mut columns = vec![("id".to_string(), Ty::int())];
    for def in column_defs {
        let ty = resolve_type(state, &def.type_expr)?;
        if !ty.is_subtype_of(&Ty::primitive()) {
            return Err(err(
                ErrorKind::NotImplemented,
                format!("column '{}' must have a primitive type, got {ty}", def.name),
                span,
            ));
        }
        if columns.iter().any(|(n, _)| n == &def.name) {
            return Err(err(
                ErrorKind::Type,
                format!("duplicate column '{}' in table '{name}'", def.name),
                span,
            ));
        }
        columns.push((def.name.clone(), ty));
    }

    let table = TableTy::stored(name, columns);
    state.require_access(AccessLevel::WriteDb)?;
    let code = SqlExpr::CreateTable {
        table: name.to_string(),
        columns: table.columns.clone(),
        primary_key: table.primary_key.clone(),
    };
    state.db.query(&code, &vec![])?;

    let ty = Ty::table(table);
    let inst = Instance::table(SqlExpr::TableName(ty.clone(), name.to_string()), ty, &[]);
    state.set_var(name.to_string(), Object::Instance(inst));
    Ok(Flow::Normal(Object::null()))
}

/// Executes statements in order, yielding the value of the last one.
pub fn execute_many(state: &mut State, stmts: &[Stmt]) -> Result<Object> {
    let mut last = Object::null();
    for stmt in stmts {
        last = execute(state, stmt)?
            .into_value()
            .map_err(|e| -> anyhow::Error { e.with_span(stmt.span).into() })?;
    }
    Ok(last)
}

/// Calls a user-visible function by name with pre-built argument nodes.
pub fn call_func_by_name(
    state: &mut State,
    name: &str,
    args: Vec<crate::ast::NamedField>,
) -> Result<Object> {
    let object = state.get_var(name)?;
    let Object::Function(function) = object else {
        return Err(Error::new(
            ErrorKind::Type,
            format!("object of type '{}' is not callable", object.ty()),
        )
        .into());
    };
    super::eval::call_function(state, &function, &args, None)
}
