//! The built-in function library, installed as the sentinel base module of
//! every namespace.
//!
//! Name lookup falls back here after the scope chain, so user bindings can
//! shadow any of these.

use once_cell::sync::Lazy;
use std::collections::HashMap;

use strum::IntoEnumIterator;

use super::eval::{cast_to_list, join_tables, make_list_instance};
use super::object::{BuiltinFunction, Function, Instance, InstanceKind, Module, Object};
use super::state::State;
use crate::ast::{Expr, Literal, ParamDef};
use crate::error::{Error, ErrorKind, Result};
use crate::sql::{ArithOp, JoinKind, Select, SetOp, SqlExpr};
use crate::types::{TableTy, Ty, TyKind};

pub const BUILTINS_NAME: &str = "__builtins__";

/// The module bound as `__builtins__` in a fresh namespace: primitive and
/// container type names, error types, and the function library.
pub fn default_module() -> Module {
    let mut ns: HashMap<String, Object> = HashMap::new();

    let types = [
        ("object", Ty::object()),
        ("primitive", Ty::primitive()),
        ("number", Ty::number()),
        ("collection", Ty::collection()),
        ("int", Ty::int()),
        ("float", Ty::float()),
        ("bool", Ty::bool()),
        ("string", Ty::string()),
        ("null", Ty::null()),
        ("type", Ty::new(TyKind::TypeValue)),
        ("struct", Ty::new(TyKind::AnyStruct)),
        ("table", Ty::new(TyKind::AnyTable)),
        ("list", Ty::new(TyKind::AnyList)),
        ("set", Ty::new(TyKind::AnySet)),
        ("row", Ty::new(TyKind::AnyRow)),
        ("aggregate", Ty::new(TyKind::AnyAggregate)),
    ];
    for (name, ty) in types {
        ns.insert(name.to_string(), Object::Type(ty));
    }

    ns.insert("Error".to_string(), Object::Type(Ty::exception(None)));
    for kind in ErrorKind::iter() {
        ns.insert(kind.to_string(), Object::Type(Ty::exception(Some(kind))));
    }

    for builtin in FUNCTIONS.iter() {
        ns.insert(
            builtin.name.to_string(),
            Object::Function(Function::Builtin(builtin.clone())),
        );
    }

    Module {
        name: BUILTINS_NAME.to_string(),
        namespace: ns,
    }
}

/// Invokes a built-in directly with evaluated arguments; used by operator
/// dispatch (`string * int` lowers to `repeat`, collection arithmetic to the
/// set operations).
pub fn call(state: &mut State, name: &str, args: Vec<Object>) -> Result<Object> {
    let builtin = FUNCTIONS
        .iter()
        .find(|b| b.name == name)
        .ok_or_else(|| Error::new(ErrorKind::Compile, format!("no builtin named '{name}'")))?;
    (builtin.func)(state, args)
}

static FUNCTIONS: Lazy<Vec<BuiltinFunction>> = Lazy::new(|| {
    fn param(name: &str) -> ParamDef {
        ParamDef::new(name)
    }
    fn optional(name: &str) -> ParamDef {
        ParamDef {
            name: name.to_string(),
            ty: None,
            default: Some(Expr::null()),
        }
    }
    fn f(name: &'static str, params: Vec<ParamDef>, func: super::object::BuiltinImpl) -> BuiltinFunction {
        BuiltinFunction {
            name,
            params,
            param_collector: None,
            func,
        }
    }

    vec![
        f("count", vec![optional("obj")], fn_count),
        f("sum", vec![param("obj")], fn_sum),
        f("avg", vec![param("obj")], fn_avg),
        f("min", vec![param("obj")], fn_min),
        f("max", vec![param("obj")], fn_max),
        f("limit", vec![param("table"), param("n")], fn_limit),
        f("distinct", vec![param("table")], fn_distinct),
        f("concat", vec![param("a"), param("b")], fn_concat),
        f("intersect", vec![param("a"), param("b")], fn_intersect),
        f("union", vec![param("a"), param("b")], fn_union),
        f("subtract", vec![param("a"), param("b")], fn_subtract),
        f("length", vec![param("s")], fn_length),
        f("lower", vec![param("s")], fn_lower),
        f("upper", vec![param("s")], fn_upper),
        f("repeat", vec![param("s"), param("n")], fn_repeat),
        f("str_contains", vec![param("substr"), param("s")], fn_str_contains),
        f("str_notcontains", vec![param("substr"), param("s")], fn_str_notcontains),
        f("list", vec![param("obj")], fn_list),
        f("columns", vec![param("table")], fn_columns),
        f("type", vec![param("obj")], fn_type),
        f("join", vec![param("a"), param("b")], fn_join),
        f("leftjoin", vec![param("a"), param("b")], fn_leftjoin),
    ]
});

fn instance(object: Object, what: &str) -> Result<Instance, Error> {
    match object {
        Object::Instance(inst) => Ok(inst),
        other => Err(Error::new(
            ErrorKind::Type,
            format!("{what} expected a value, instead got {other}"),
        )),
    }
}

fn two(mut args: Vec<Object>) -> (Object, Object) {
    let b = args.pop().expect("arity checked by match_params");
    let a = args.pop().expect("arity checked by match_params");
    (a, b)
}

fn one_arg(mut args: Vec<Object>) -> Object {
    args.pop().expect("arity checked by match_params")
}

// --- aggregates ------------------------------------------------------------

fn fn_count(_state: &mut State, args: Vec<Object>) -> Result<Object> {
    let inst = instance(one_arg(args), "count")?;

    // Bare count() counts the rows of the enclosing group.
    if matches!(inst.kind, InstanceKind::Value(Literal::Null)) {
        let code = SqlExpr::FuncCall {
            name: "count".to_string(),
            args: vec![SqlExpr::All],
        };
        return Ok(Object::Instance(Instance::make(code, Ty::int(), &[])));
    }

    if inst.ty.kind.is_aggregate() {
        let elem = inst.aggregate_elem();
        let code = SqlExpr::FuncCall {
            name: "count".to_string(),
            args: vec![elem.code.clone()],
        };
        return Ok(Object::Instance(Instance::make(code, Ty::int(), &[&elem])));
    }

    if inst.ty.is_subtype_of(&Ty::collection()) {
        let mut select = Select::from_source(Ty::int(), inst.code.clone());
        select.fields = vec![SqlExpr::ColumnAlias {
            value: Box::new(SqlExpr::FuncCall {
                name: "count".to_string(),
                args: vec![SqlExpr::All],
            }),
            alias: "count".to_string(),
        }];
        return Ok(Object::Instance(Instance::make(
            select.into(),
            Ty::int(),
            &[&inst],
        )));
    }

    Err(Error::new(
        ErrorKind::Type,
        format!("count expected a collection or an aggregate, got {}", inst.ty),
    )
    .into())
}

fn aggregate_fn(
    name: &'static str,
    args: Vec<Object>,
    result_ty: fn(&Ty) -> Ty,
) -> Result<Object> {
    let inst = instance(one_arg(args), name)?;

    if inst.ty.kind.is_aggregate() {
        let elem = inst.aggregate_elem();
        let ty = result_ty(&elem.ty);
        let code = SqlExpr::FuncCall {
            name: name.to_string(),
            args: vec![elem.code.clone()],
        };
        return Ok(Object::Instance(Instance::make(code, ty, &[&elem])));
    }

    if inst.ty.is_subtype_of(&Ty::collection()) {
        let list = cast_to_list(&inst, None)?;
        let elem_ty = match &list.ty.kind {
            TyKind::List(elem) => (**elem).clone(),
            _ => unreachable!("cast_to_list returns a list"),
        };
        let ty = result_ty(&elem_ty);
        let mut select = Select::from_source(ty.clone(), list.code.clone());
        select.fields = vec![SqlExpr::ColumnAlias {
            value: Box::new(SqlExpr::FuncCall {
                name: name.to_string(),
                args: vec![SqlExpr::Name(elem_ty, "value".to_string())],
            }),
            alias: name.to_string(),
        }];
        return Ok(Object::Instance(Instance::make(select.into(), ty, &[&list])));
    }

    Err(Error::new(
        ErrorKind::Type,
        format!("{name} expected a collection or an aggregate, got {}", inst.ty),
    )
    .into())
}

fn fn_sum(_state: &mut State, args: Vec<Object>) -> Result<Object> {
    aggregate_fn("sum", args, Ty::clone)
}

fn fn_avg(_state: &mut State, args: Vec<Object>) -> Result<Object> {
    aggregate_fn("avg", args, |_| Ty::float())
}

fn fn_min(_state: &mut State, args: Vec<Object>) -> Result<Object> {
    aggregate_fn("min", args, Ty::clone)
}

fn fn_max(_state: &mut State, args: Vec<Object>) -> Result<Object> {
    aggregate_fn("max", args, Ty::clone)
}

// --- table shaping ---------------------------------------------------------

fn fn_limit(_state: &mut State, args: Vec<Object>) -> Result<Object> {
    let (a, b) = two(args);
    let table = instance(a, "limit")?;
    let n = instance(b, "limit")?;
    if !table.ty.is_subtype_of(&Ty::collection()) {
        return Err(Error::new(
            ErrorKind::Type,
            format!("limit expected a collection, got {}", table.ty),
        )
        .into());
    }
    if !n.ty.is_subtype_of(&Ty::int()) {
        return Err(Error::new(
            ErrorKind::Type,
            format!("limit expected an int, got {}", n.ty),
        )
        .into());
    }
    let code = crate::sql::table_slice(
        table.ty.clone(),
        table.code.clone(),
        Some(n.code.clone()),
        None,
    );
    let mut out = Instance::table(code, table.ty.clone(), &[&table, &n]);
    out.kind = table.kind.clone();
    Ok(Object::Instance(out))
}

fn fn_distinct(_state: &mut State, args: Vec<Object>) -> Result<Object> {
    let table = instance(one_arg(args), "distinct")?;
    if !table.ty.is_subtype_of(&Ty::collection()) {
        return Err(Error::new(
            ErrorKind::Type,
            format!("distinct expected a collection, got {}", table.ty),
        )
        .into());
    }
    let mut select = Select::from_source(table.ty.clone(), table.code.clone());
    select.distinct = true;
    let mut out = Instance::table(select.into(), table.ty.clone(), &[&table]);
    out.kind = table.kind.clone();
    Ok(Object::Instance(out))
}

fn set_op(op: SetOp, args: Vec<Object>) -> Result<Object> {
    let (a, b) = two(args);
    let a = instance(a, "set operation")?;
    let b = instance(b, "set operation")?;
    for side in [&a, &b] {
        if !side.ty.is_subtype_of(&Ty::collection()) {
            return Err(Error::new(
                ErrorKind::Type,
                format!("{op} expected a collection, got {}", side.ty),
            )
            .into());
        }
    }
    if a.is_empty_list() {
        return Ok(Object::Instance(b));
    }
    if b.is_empty_list() {
        return Ok(Object::Instance(a));
    }
    if a.ty.flatten().len() != b.ty.flatten().len() {
        return Err(Error::new(
            ErrorKind::Type,
            format!("cannot {op} tables with mismatched columns: {} vs {}", a.ty, b.ty),
        )
        .into());
    }

    // Results of set operations are anonymous; they no longer address a
    // stored table.
    let ty = match &a.ty.kind {
        TyKind::Table(t) => Ty::table(TableTy::anonymous(t.columns.clone())),
        _ => a.ty.clone(),
    };
    let code = SqlExpr::TableOp {
        op,
        left: Box::new(a.code.clone()),
        right: Box::new(b.code.clone()),
    };
    let mut out = Instance::table(code, ty, &[&a, &b]);
    out.kind = a.kind.clone();
    Ok(Object::Instance(out))
}

fn fn_concat(_state: &mut State, args: Vec<Object>) -> Result<Object> {
    set_op(SetOp::UnionAll, args)
}

fn fn_intersect(_state: &mut State, args: Vec<Object>) -> Result<Object> {
    set_op(SetOp::Intersect, args)
}

fn fn_union(_state: &mut State, args: Vec<Object>) -> Result<Object> {
    set_op(SetOp::Union, args)
}

fn fn_subtract(_state: &mut State, args: Vec<Object>) -> Result<Object> {
    set_op(SetOp::Except, args)
}

// --- strings ---------------------------------------------------------------

fn string_arg(object: Object, who: &str) -> Result<Instance, Error> {
    let inst = instance(object, who)?;
    if !inst.ty.is_subtype_of(&Ty::string()) {
        return Err(Error::new(
            ErrorKind::Type,
            format!("{who} expected a string, got {}", inst.ty),
        ));
    }
    Ok(inst)
}

fn fn_length(state: &mut State, args: Vec<Object>) -> Result<Object> {
    let s = string_arg(one_arg(args), "length")?;
    if state.options.fold_constants {
        if let InstanceKind::Value(Literal::String(v)) = &s.kind {
            return Ok(Object::from_literal(Literal::Int(v.chars().count() as i64)));
        }
    }
    let code = SqlExpr::FuncCall {
        name: "length".to_string(),
        args: vec![s.code.clone()],
    };
    Ok(Object::Instance(Instance::make(code, Ty::int(), &[&s])))
}

fn string_fn(name: &'static str, args: Vec<Object>) -> Result<Object> {
    let s = string_arg(one_arg(args), name)?;
    let code = SqlExpr::FuncCall {
        name: name.to_string(),
        args: vec![s.code.clone()],
    };
    Ok(Object::Instance(Instance::make(code, Ty::string(), &[&s])))
}

fn fn_lower(_state: &mut State, args: Vec<Object>) -> Result<Object> {
    string_fn("lower", args)
}

fn fn_upper(_state: &mut State, args: Vec<Object>) -> Result<Object> {
    string_fn("upper", args)
}

fn fn_repeat(state: &mut State, args: Vec<Object>) -> Result<Object> {
    let (a, b) = two(args);
    let s = string_arg(a, "repeat")?;
    let n = instance(b, "repeat")?;
    if !n.ty.is_subtype_of(&Ty::int()) {
        return Err(Error::new(
            ErrorKind::Type,
            format!("repeat expected an int, got {}", n.ty),
        )
        .into());
    }
    if state.options.fold_constants {
        if let (InstanceKind::Value(Literal::String(v)), InstanceKind::Value(Literal::Int(times))) =
            (&s.kind, &n.kind)
        {
            let times = (*times).max(0) as usize;
            return Ok(Object::from_literal(Literal::String(v.repeat(times))));
        }
    }
    let code = SqlExpr::FuncCall {
        name: "repeat".to_string(),
        args: vec![s.code.clone(), n.code.clone()],
    };
    Ok(Object::Instance(Instance::make(code, Ty::string(), &[&s, &n])))
}

fn str_contains(args: Vec<Object>, negated: bool) -> Result<Object> {
    let (a, b) = two(args);
    let needle = string_arg(a, "str_contains")?;
    let haystack = string_arg(b, "str_contains")?;

    let percent = SqlExpr::Literal(Ty::string(), Literal::String("%".to_string()));
    let pattern = SqlExpr::Arith {
        ty: Ty::string(),
        op: ArithOp::Concat,
        left: Box::new(SqlExpr::Arith {
            ty: Ty::string(),
            op: ArithOp::Concat,
            left: Box::new(percent.clone()),
            right: Box::new(needle.code.clone()),
        }),
        right: Box::new(percent),
    };
    let like = SqlExpr::Like {
        expr: Box::new(haystack.code.clone()),
        pattern: Box::new(pattern),
    };
    let code = if negated {
        SqlExpr::Not(Box::new(like))
    } else {
        like
    };
    Ok(Object::Instance(Instance::make(
        code,
        Ty::bool(),
        &[&needle, &haystack],
    )))
}

fn fn_str_contains(_state: &mut State, args: Vec<Object>) -> Result<Object> {
    str_contains(args, false)
}

fn fn_str_notcontains(_state: &mut State, args: Vec<Object>) -> Result<Object> {
    str_contains(args, true)
}

// --- casts and reflection --------------------------------------------------

fn fn_list(_state: &mut State, args: Vec<Object>) -> Result<Object> {
    let inst = instance(one_arg(args), "list")?;
    Ok(Object::Instance(cast_to_list(&inst, None)?))
}

fn fn_columns(state: &mut State, args: Vec<Object>) -> Result<Object> {
    let inst = instance(one_arg(args), "columns")?;
    if !inst.ty.is_subtype_of(&Ty::collection()) {
        return Err(Error::new(
            ErrorKind::Type,
            format!("columns expected a collection, got {}", inst.ty),
        )
        .into());
    }
    let names = inst
        .ty
        .elems()
        .into_iter()
        .map(|(name, _)| Literal::String(name))
        .collect();
    Ok(Object::Instance(make_list_instance(
        state,
        Ty::string(),
        names,
    )))
}

fn fn_type(_state: &mut State, args: Vec<Object>) -> Result<Object> {
    let object = one_arg(args);
    Ok(Object::Type(match object {
        Object::Instance(inst) => inst.ty,
        other => other.ty(),
    }))
}

// --- joins -----------------------------------------------------------------

fn join_fn(kind: JoinKind, args: Vec<Object>) -> Result<Object> {
    let (a, b) = two(args);
    let a = instance(a, "join")?;
    let b = instance(b, "join")?;
    Ok(Object::Instance(join_tables(kind, &a, &b, None)?))
}

fn fn_join(_state: &mut State, args: Vec<Object>) -> Result<Object> {
    join_fn(JoinKind::Inner, args)
}

fn fn_leftjoin(_state: &mut State, args: Vec<Object>) -> Result<Object> {
    join_fn(JoinKind::Left, args)
}
