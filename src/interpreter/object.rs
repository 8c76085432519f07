//! Runtime objects: everything a name can be bound to.

use enum_as_inner::EnumAsInner;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

use crate::ast::{Expr, FuncDef, Literal, NamedField, ParamDef};
use crate::error::{Error, ErrorKind, Result};
use crate::sql::{merge_subqueries, SqlExpr, Subqueries};
use crate::types::{TableTy, Ty, TyKind};

#[derive(Debug, Clone, EnumAsInner)]
pub enum Object {
    Instance(Instance),
    Type(Ty),
    Function(Function),
    Module(Module),
}

impl Object {
    pub fn null() -> Object {
        Object::Instance(Instance::value(Literal::Null))
    }

    pub fn from_literal(value: Literal) -> Object {
        Object::Instance(Instance::value(value))
    }

    /// The type this object has when used in an expression.
    pub fn ty(&self) -> Ty {
        match self {
            Object::Instance(inst) => inst.ty.clone(),
            Object::Type(_) => Ty::new(TyKind::TypeValue),
            Object::Function(_) => Ty::new(TyKind::Function),
            Object::Module(_) => Ty::object(),
        }
    }

    pub fn get_attr(&self, name: &str) -> Result<Object, Error> {
        match self {
            Object::Module(module) => module.namespace.get(name).cloned().ok_or_else(|| {
                Error::new(
                    ErrorKind::Attribute,
                    format!("module '{}' has no attribute '{}'", module.name, name),
                )
            }),
            Object::Instance(inst) => inst.get_attr(name),
            _ => Err(Error::new(
                ErrorKind::Attribute,
                format!("{self} has no attribute '{name}'"),
            )),
        }
    }
}

impl Display for Object {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Object::Instance(inst) => match &inst.kind {
                InstanceKind::Value(value) => write!(f, "{value}"),
                _ => write!(f, "<{}>", inst.ty),
            },
            Object::Type(ty) => write!(f, "{ty}"),
            Object::Function(func) => write!(f, "<function {}>", func.name()),
            Object::Module(module) => write!(f, "<module {}>", module.name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub namespace: HashMap<String, Object>,
}

/// The runtime value of an expression: a SQL fragment, its type, and the
/// named subqueries it depends on.
#[derive(Debug, Clone)]
pub struct Instance {
    pub code: SqlExpr,
    pub ty: Ty,
    pub subqueries: Subqueries,
    pub kind: InstanceKind,
}

#[derive(Debug, Clone, EnumAsInner)]
pub enum InstanceKind {
    Plain,
    /// Also carries the value locally; enables constant folding.
    Value(Literal),
    Table,
    List,
    /// A materialized single row.
    Row(Vec<(String, Instance)>),
    Struct(Vec<(String, Instance)>),
}

impl Instance {
    pub fn make(code: SqlExpr, ty: Ty, inputs: &[&Instance]) -> Instance {
        Instance {
            code,
            ty,
            subqueries: merge_inputs(inputs),
            kind: InstanceKind::Plain,
        }
    }

    pub fn table(code: SqlExpr, ty: Ty, inputs: &[&Instance]) -> Instance {
        Instance {
            code,
            ty,
            subqueries: merge_inputs(inputs),
            kind: InstanceKind::Table,
        }
    }

    pub fn list(code: SqlExpr, ty: Ty, inputs: &[&Instance]) -> Instance {
        Instance {
            code,
            ty,
            subqueries: merge_inputs(inputs),
            kind: InstanceKind::List,
        }
    }

    pub fn value(value: Literal) -> Instance {
        let ty = match &value {
            Literal::Null => Ty::null(),
            Literal::Int(_) => Ty::int(),
            Literal::Float(_) => Ty::float(),
            Literal::Bool(_) => Ty::bool(),
            Literal::String(_) => Ty::string(),
        };
        Instance::value_typed(value, ty)
    }

    pub fn value_typed(value: Literal, ty: Ty) -> Instance {
        Instance {
            code: SqlExpr::Literal(ty.clone(), value.clone()),
            ty,
            subqueries: vec![],
            kind: InstanceKind::Value(value),
        }
    }

    pub fn row(table: TableTy, fields: Vec<(String, Instance)>) -> Instance {
        Instance {
            code: SqlExpr::Null,
            ty: Ty::row(table),
            subqueries: vec![],
            kind: InstanceKind::Row(fields),
        }
    }

    pub fn strukt(fields: Vec<(String, Instance)>) -> Instance {
        let ty = Ty::new(TyKind::Struct(
            fields
                .iter()
                .map(|(n, i)| (n.clone(), i.ty.clone()))
                .collect(),
        ));
        Instance {
            code: SqlExpr::Null,
            ty,
            subqueries: vec![],
            kind: InstanceKind::Struct(fields),
        }
    }

    /// The empty list literal; a universal donor for inserts and projections.
    pub fn empty_list() -> Instance {
        Instance {
            code: SqlExpr::Null,
            ty: Ty::list(Ty::object()),
            subqueries: vec![],
            kind: InstanceKind::List,
        }
    }

    pub fn is_empty_list(&self) -> bool {
        matches!(self.kind, InstanceKind::List) && self.code == SqlExpr::Null
    }

    /// The attributes this instance exposes as lexical bindings: columns of
    /// a table, fields of a row or struct.
    pub fn all_attrs(&self) -> Vec<(String, Object)> {
        match &self.kind {
            InstanceKind::Row(fields) | InstanceKind::Struct(fields) => fields
                .iter()
                .map(|(n, i)| (n.clone(), Object::Instance(i.clone())))
                .collect(),
            _ => self
                .ty
                .elems()
                .into_iter()
                .map(|(name, ty)| {
                    let code = SqlExpr::Name(ty.clone(), name.clone());
                    (name, Object::Instance(Instance::make(code, ty, &[])))
                })
                .collect(),
        }
    }

    pub fn get_attr(&self, name: &str) -> Result<Object, Error> {
        self.all_attrs()
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, o)| o)
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::Attribute,
                    format!("{} has no attribute '{}'", self.ty, name),
                )
            })
    }

    /// The primary-key field of a row, used for row comparisons.
    pub fn primary_key(&self) -> Result<Instance, Error> {
        let table = match &self.ty.kind {
            TyKind::Row(t) => t,
            _ => {
                return Err(Error::new(
                    ErrorKind::Type,
                    format!("{} has no primary key", self.ty),
                ))
            }
        };
        let key = table
            .primary_key
            .first()
            .map(String::as_str)
            .unwrap_or("id");
        match self.get_attr(key)? {
            Object::Instance(inst) => Ok(inst),
            _ => unreachable!("row attributes are instances"),
        }
    }

    /// The same instance viewed as its aggregate element.
    pub fn aggregate_elem(&self) -> Instance {
        let mut elem = self.clone();
        elem.ty = self.ty.collapsed();
        elem
    }

    /// Structured instances contribute one code per leaf field.
    pub fn flatten_code(&self) -> Vec<SqlExpr> {
        match &self.kind {
            InstanceKind::Row(fields) | InstanceKind::Struct(fields) => fields
                .iter()
                .flat_map(|(_, i)| i.flatten_code())
                .collect(),
            _ => vec![self.code.clone()],
        }
    }
}

fn merge_inputs(inputs: &[&Instance]) -> Subqueries {
    let maps: Vec<&Subqueries> = inputs.iter().map(|i| &i.subqueries).collect();
    merge_subqueries(&maps)
}

#[derive(Debug, Clone, EnumAsInner)]
pub enum Function {
    User(UserFunction),
    Builtin(BuiltinFunction),
}

#[derive(Debug, Clone)]
pub struct UserFunction {
    pub def: FuncDef,
}

pub type BuiltinImpl = fn(&mut super::State, Vec<Object>) -> Result<Object>;

#[derive(Debug, Clone)]
pub struct BuiltinFunction {
    pub name: &'static str,
    pub params: Vec<ParamDef>,
    pub param_collector: Option<ParamDef>,
    pub func: BuiltinImpl,
}

/// What a parameter was bound to during matching; evaluation happens at the
/// call site, in the caller's scope.
#[derive(Debug, Clone)]
pub enum BoundArg {
    Expr(Expr),
    /// Leftover keyword arguments absorbed by a variadic collector.
    Collected(Vec<(String, Expr)>),
}

impl Function {
    pub fn name(&self) -> &str {
        match self {
            Function::User(f) => &f.def.name,
            Function::Builtin(f) => f.name,
        }
    }

    pub fn params(&self) -> &[ParamDef] {
        match self {
            Function::User(f) => &f.def.params,
            Function::Builtin(f) => &f.params,
        }
    }

    pub fn param_collector(&self) -> Option<&ParamDef> {
        match self {
            Function::User(f) => f.def.param_collector.as_ref(),
            Function::Builtin(f) => f.param_collector.as_ref(),
        }
    }

    pub fn match_params(&self, args: &[NamedField]) -> Result<Vec<(ParamDef, BoundArg)>, Error> {
        match_params(self.name(), self.params(), self.param_collector(), args)
    }
}

/// Binds call arguments to parameters.
///
/// Arguments split at the first keyword argument; the positional prefix binds
/// the leading parameters one to one, the rest bind by name, fall back to
/// their default, or are absorbed by the collector.
pub fn match_params(
    name: &str,
    params: &[ParamDef],
    collector: Option<&ParamDef>,
    args: &[NamedField],
) -> Result<Vec<(ParamDef, BoundArg)>, Error> {
    let split = args
        .iter()
        .position(|a| a.name.is_some())
        .unwrap_or(args.len());
    let (pos_args, named_args) = args.split_at(split);

    if let Some(misplaced) = named_args.iter().find(|a| a.name.is_none()) {
        return Err(Error::new(
            ErrorKind::Type,
            format!(
                "function '{}' received a positional argument after a keyword argument",
                name
            ),
        )
        .with_span(misplaced.value.span));
    }

    if pos_args.len() > params.len() {
        return Err(Error::new(
            ErrorKind::Type,
            format!(
                "function '{}' takes {} parameters but received {} arguments",
                name,
                params.len(),
                pos_args.len()
            ),
        ));
    }
    let (pos_params, named_params) = params.split_at(pos_args.len());

    let mut matched: Vec<(ParamDef, BoundArg)> = pos_params
        .iter()
        .zip(pos_args)
        .map(|(p, a)| (p.clone(), BoundArg::Expr(a.value.clone())))
        .collect();

    let mut leftover: Vec<(String, Expr)> = Vec::new();
    for arg in named_args {
        let arg_name = arg.name.clone().unwrap();
        if leftover.iter().any(|(n, _)| *n == arg_name)
            || matched.iter().any(|(p, _)| p.name == arg_name)
        {
            return Err(Error::new(
                ErrorKind::Type,
                format!("function '{}' received '{}' more than once", name, arg_name),
            )
            .with_span(arg.value.span));
        }
        leftover.push((arg_name, arg.value.clone()));
    }

    for param in named_params {
        if let Some(i) = leftover.iter().position(|(n, _)| *n == param.name) {
            let (_, value) = leftover.remove(i);
            matched.push((param.clone(), BoundArg::Expr(value)));
        } else if let Some(default) = &param.default {
            matched.push((param.clone(), BoundArg::Expr(default.clone())));
        } else {
            return Err(Error::new(
                ErrorKind::Type,
                format!("parameter wasn't assigned: '{}'", param.name),
            ));
        }
    }

    if !leftover.is_empty() {
        match collector {
            Some(collector) => matched.push((collector.clone(), BoundArg::Collected(leftover))),
            None => {
                return Err(Error::new(
                    ErrorKind::Type,
                    format!(
                        "function '{}' doesn't accept arguments named: {}",
                        name,
                        leftover
                            .iter()
                            .map(|(n, _)| format!("'{n}'"))
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                ))
            }
        }
    }

    Ok(matched)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(names: &[&str]) -> Vec<ParamDef> {
        names.iter().map(|n| ParamDef::new(*n)).collect()
    }

    #[test]
    fn positional_binding() {
        let matched = match_params(
            "f",
            &params(&["x", "y"]),
            None,
            &[
                NamedField::unnamed(Expr::int(1)),
                NamedField::unnamed(Expr::int(2)),
            ],
        )
        .unwrap();
        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0].0.name, "x");
        assert_eq!(matched[1].0.name, "y");
    }

    #[test]
    fn named_args_bind_remaining_params() {
        let matched = match_params(
            "f",
            &params(&["x", "y"]),
            None,
            &[
                NamedField::unnamed(Expr::int(1)),
                NamedField::named("y", Expr::int(2)),
            ],
        )
        .unwrap();
        assert_eq!(matched[1].0.name, "y");
    }

    #[test]
    fn missing_param_names_the_offender() {
        let err = match_params(
            "f",
            &params(&["x", "y"]),
            None,
            &[NamedField::unnamed(Expr::int(1))],
        )
        .unwrap_err();
        assert!(err.reason.contains("'y'"), "got: {}", err.reason);
    }

    #[test]
    fn unknown_named_arg_is_rejected_without_collector() {
        let err = match_params(
            "f",
            &params(&["x"]),
            None,
            &[
                NamedField::unnamed(Expr::int(1)),
                NamedField::named("z", Expr::int(2)),
            ],
        )
        .unwrap_err();
        assert!(err.reason.contains("'z'"));
    }

    #[test]
    fn collector_absorbs_unknown_named_args() {
        let collector = ParamDef::new("rest");
        let matched = match_params(
            "f",
            &params(&["x"]),
            Some(&collector),
            &[
                NamedField::unnamed(Expr::int(1)),
                NamedField::named("z", Expr::int(2)),
                NamedField::named("w", Expr::int(3)),
            ],
        )
        .unwrap();
        assert_eq!(matched.len(), 2);
        match &matched[1].1 {
            BoundArg::Collected(rest) => {
                assert_eq!(rest.len(), 2);
                assert_eq!(rest[0].0, "z");
            }
            _ => panic!("expected collected args"),
        }
    }

    #[test]
    fn default_fills_missing_named_param() {
        let mut ps = params(&["x"]);
        ps.push(ParamDef {
            name: "y".to_string(),
            ty: None,
            default: Some(Expr::null()),
        });
        let matched = match_params("f", &ps, None, &[NamedField::unnamed(Expr::int(1))]).unwrap();
        assert_eq!(matched.len(), 2);
    }

    #[test]
    fn subquery_merge_is_disjoint_union() {
        use crate::sql::SqlExpr;
        let mut a = Instance::value(Literal::Int(1));
        a.subqueries = vec![("x".to_string(), SqlExpr::Null)];
        let mut b = Instance::value(Literal::Int(2));
        b.subqueries = vec![
            ("x".to_string(), SqlExpr::Null),
            ("y".to_string(), SqlExpr::Null),
        ];
        let merged = Instance::make(SqlExpr::Null, crate::types::Ty::int(), &[&a, &b]);
        let names: Vec<&str> = merged.subqueries.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["x", "y"]);
    }
}
