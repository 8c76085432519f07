//! The expression evaluator.
//!
//! Walks AST nodes and lowers them into typed [Instance]s carrying SQL
//! fragments. Operator resolution is a match on the pair of operand types,
//! with a default arm raising a TypeError; every supported pair is listed in
//! [eval_arith], [eval_compare] and [eval_contains].

use std::collections::HashSet;
use std::fmt::{self, Display, Formatter};

use itertools::Itertools;

use super::builtins;
use super::exec::{execute, Flow};
use super::object::{match_params, BoundArg, Function, Instance, InstanceKind, Object};
use super::state::{AccessLevel, Scope, State};
use crate::ast::{BinOp, CompareOp, Expr, ExprKind, FuncBody, Literal, NamedField, ParamDef};
use crate::error::{Error, ErrorKind, Result, Span};
use crate::sql::{
    self, create_list, table_order, table_selection, table_slice, ArithOp, JoinKind, Select,
    SqlExpr,
};
use crate::types::{TableTy, Ty, TyKind};
use crate::utils::IntoOnly;

/// A value materialized out of the database, in host terms.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalValue {
    Value(Literal),
    Row(Vec<(String, Literal)>),
    Rows(Vec<Vec<(String, Literal)>>),
    Values(Vec<Literal>),
}

impl LocalValue {
    pub fn is_truthy(&self) -> bool {
        match self {
            LocalValue::Value(value) => match value {
                Literal::Null => false,
                Literal::Bool(b) => *b,
                Literal::Int(i) => *i != 0,
                Literal::Float(f) => *f != 0.0,
                Literal::String(s) => !s.is_empty(),
            },
            LocalValue::Row(_) => true,
            LocalValue::Rows(rows) => !rows.is_empty(),
            LocalValue::Values(values) => !values.is_empty(),
        }
    }
}

impl Display for LocalValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fn row(f: &mut Formatter<'_>, fields: &[(String, Literal)]) -> fmt::Result {
            write!(f, "{{")?;
            for (i, (name, value)) in fields.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{name}: {value}")?;
            }
            write!(f, "}}")
        }

        match self {
            LocalValue::Value(Literal::String(s)) => write!(f, "{s}"),
            LocalValue::Value(value) => write!(f, "{value}"),
            LocalValue::Row(fields) => row(f, fields),
            LocalValue::Rows(rows) => {
                write!(f, "[")?;
                for (i, r) in rows.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    row(f, r)?;
                }
                write!(f, "]")
            }
            LocalValue::Values(values) => {
                write!(f, "[")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
        }
    }
}

fn err(kind: ErrorKind, reason: String, span: Option<Span>) -> anyhow::Error {
    Error::new(kind, reason).with_span(span).into()
}

fn type_err(reason: String, span: Option<Span>) -> anyhow::Error {
    err(ErrorKind::Type, reason, span)
}

fn assert_type(ty: &Ty, bound: &Ty, what: &str, span: Option<Span>) -> Result<()> {
    if !ty.is_subtype_of(bound) {
        return Err(type_err(
            format!("{what} expected an object of type {bound}, instead got '{ty}'"),
            span,
        ));
    }
    Ok(())
}

/// Submits an instance's SQL and returns host values.
///
/// The only place queries are executed to fetch rows; everything else in the
/// evaluator just accumulates IR.
pub fn localize(state: &mut State, object: &Object) -> Result<LocalValue> {
    let inst = match object {
        Object::Instance(inst) => inst,
        other => {
            return Err(type_err(format!("cannot localize {other}"), None));
        }
    };

    match &inst.kind {
        InstanceKind::Value(value) => Ok(LocalValue::Value(value.clone())),
        InstanceKind::Row(fields) | InstanceKind::Struct(fields) => {
            let mut out = Vec::with_capacity(fields.len());
            for (name, field) in fields {
                match localize(state, &Object::Instance(field.clone()))? {
                    LocalValue::Value(value) => out.push((name.clone(), value)),
                    other => {
                        return Err(type_err(
                            format!("row field '{name}' localized to {other}"),
                            None,
                        ))
                    }
                }
            }
            Ok(LocalValue::Row(out))
        }
        InstanceKind::List => {
            if inst.is_empty_list() {
                return Ok(LocalValue::Values(vec![]));
            }
            state.require_access(AccessLevel::ReadDb)?;
            let rows = state.db.query(&inst.code, &inst.subqueries)?;
            Ok(LocalValue::Values(
                rows.into_iter()
                    .filter_map(|row| row.into_iter().next().map(|(_, v)| v))
                    .collect(),
            ))
        }
        InstanceKind::Table => {
            state.require_access(AccessLevel::ReadDb)?;
            let rows = state.db.query(&inst.code, &inst.subqueries)?;
            Ok(LocalValue::Rows(rows))
        }
        InstanceKind::Plain => {
            state.require_access(AccessLevel::ReadDb)?;
            if inst.ty.is_subtype_of(&Ty::collection()) {
                let rows = state.db.query(&inst.code, &inst.subqueries)?;
                return Ok(LocalValue::Rows(rows));
            }
            let rows = state.db.query(&inst.code, &inst.subqueries)?;
            let value = rows
                .into_iter()
                .next()
                .and_then(|row| row.into_iter().next().map(|(_, v)| v))
                .unwrap_or(Literal::Null);
            Ok(LocalValue::Value(value))
        }
    }
}

pub fn test_nonzero(state: &mut State, object: &Object) -> Result<bool> {
    Ok(localize(state, object)?.is_truthy())
}

/// Single evaluation entry: rewrites an AST node into a runtime object.
pub fn evaluate(state: &mut State, expr: &Expr) -> Result<Object> {
    let span = expr.span;
    match &expr.kind {
        ExprKind::Name(name) => state
            .get_var(name)
            .map_err(|e| e.with_span(span).into()),
        ExprKind::Const(value) => Ok(Object::from_literal(value.clone())),
        ExprKind::Attr { expr: base, name } => {
            let object = evaluate(state, base)?;
            object.get_attr(name).map_err(|e| e.with_span(span).into())
        }
        ExprKind::Parameter { name, ty } => {
            if state.access_level == AccessLevel::Compile {
                Ok(Object::Instance(Instance::make(
                    SqlExpr::Parameter(ty.clone(), name.clone()),
                    ty.clone(),
                    &[],
                )))
            } else {
                state.get_var(name).map_err(|e| e.with_span(span).into())
            }
        }
        ExprKind::FuncCall { func, args } => eval_func_call(state, func, args, span),
        ExprKind::BinOp { op, left, right } => {
            let a = eval_instance(state, left)?;
            let b = eval_instance(state, right)?;
            eval_arith(state, *op, a, b, span)
        }
        ExprKind::Compare { op, left, right } => {
            let a = evaluate(state, left)?;
            let b = evaluate(state, right)?;
            if op.is_containment() {
                let a = into_instance(a, span)?;
                let b = into_instance(b, span)?;
                eval_contains(state, *op, a, b, span)
            } else {
                eval_compare(state, *op, a, b, span)
            }
        }
        ExprKind::Like { expr: s, pattern } => {
            let s = eval_instance(state, s)?;
            let p = eval_instance(state, pattern)?;
            if !s.ty.is_subtype_of(&Ty::string()) || !p.ty.is_subtype_of(&Ty::string()) {
                return Err(type_err(
                    "like (~) operator expects two strings".to_string(),
                    span,
                ));
            }
            let code = SqlExpr::Like {
                expr: Box::new(s.code.clone()),
                pattern: Box::new(p.code.clone()),
            };
            Ok(Object::Instance(Instance::make(code, Ty::bool(), &[&s, &p])))
        }
        ExprKind::Not(inner) => {
            let inst = eval_instance(state, inner)?;
            assert_type(&inst.ty, &Ty::bool(), "'not'", span)?;
            if let (true, InstanceKind::Value(Literal::Bool(b))) =
                (state.options.fold_constants, &inst.kind)
            {
                return Ok(Object::from_literal(Literal::Bool(!b)));
            }
            let code = SqlExpr::Not(Box::new(inst.code.clone()));
            Ok(Object::Instance(Instance::make(code, Ty::bool(), &[&inst])))
        }
        ExprKind::Neg(inner) => {
            let inst = eval_instance(state, inner)?;
            assert_type(&inst.ty, &Ty::number(), "negation", span)?;
            if state.options.fold_constants {
                match &inst.kind {
                    InstanceKind::Value(Literal::Int(i)) => {
                        return Ok(Object::from_literal(Literal::Int(-i)))
                    }
                    InstanceKind::Value(Literal::Float(f)) => {
                        return Ok(Object::from_literal(Literal::Float(-f)))
                    }
                    _ => {}
                }
            }
            let code = SqlExpr::Neg(Box::new(inst.code.clone()));
            Ok(Object::Instance(Instance::make(
                code,
                inst.ty.clone(),
                &[&inst],
            )))
        }
        ExprKind::And(args) => {
            let mut last = Object::null();
            for arg in args {
                let object = evaluate(state, arg)?;
                if !test_nonzero(state, &object)? {
                    return Ok(object);
                }
                last = object;
            }
            Ok(last)
        }
        ExprKind::Or(args) => {
            // Returns the last inspected operand when every one is falsy.
            let mut last = Object::null();
            for arg in args {
                let object = evaluate(state, arg)?;
                if test_nonzero(state, &object)? {
                    return Ok(object);
                }
                last = object;
            }
            Ok(last)
        }
        ExprKind::List(elems) => eval_list(state, elems, span),
        ExprKind::Dict(elems) => eval_dict(state, elems),
        ExprKind::Ellipsis { .. } => Err(err(
            ErrorKind::Syntax,
            "ellipsis not allowed here".to_string(),
            span,
        )),
        ExprKind::Projection {
            table,
            fields,
            groupby,
            agg_fields,
        } => eval_projection(state, table, fields, *groupby, agg_fields, span),
        ExprKind::Selection { table, conds } => eval_selection(state, table, conds, span),
        ExprKind::Order { table, fields } => eval_order(state, table, fields, span),
        ExprKind::Desc(inner) => {
            let inst = eval_instance(state, inner)?;
            let mut out = inst.clone();
            out.code = SqlExpr::Desc(Box::new(inst.code));
            Ok(Object::Instance(out))
        }
        ExprKind::Slice { expr: obj, start, stop } => eval_slice(state, obj, start, stop, span),
        ExprKind::Update { table, fields } => eval_update(state, table, fields, span),
        ExprKind::Delete { table, conds } => eval_delete(state, table, conds, span),
        ExprKind::New { type_name, args } => eval_new(state, type_name, args, span),
        ExprKind::NewRows { type_name, args } => eval_new_rows(state, type_name, args, span),
        ExprKind::One { expr: inner, nullable } => eval_one(state, inner, *nullable, span),
    }
}

pub(super) fn eval_instance(state: &mut State, expr: &Expr) -> Result<Instance> {
    let object = evaluate(state, expr)?;
    into_instance(object, expr.span)
}

fn into_instance(object: Object, span: Option<Span>) -> Result<Instance> {
    match object {
        Object::Instance(inst) => Ok(inst),
        other => Err(type_err(
            format!("expected a value, instead got {other}"),
            span,
        )),
    }
}

fn attrs_scope(inst: &Instance) -> Scope {
    inst.all_attrs().into_iter().collect()
}

// ---------------------------------------------------------------------------
// Projection

fn guess_field_name(expr: &Expr) -> String {
    match &expr.kind {
        ExprKind::Name(name) => name.clone(),
        ExprKind::Attr { name, .. } => name.clone(),
        ExprKind::FuncCall { func, .. } => guess_field_name(func),
        ExprKind::Projection { table, .. } => guess_field_name(table),
        _ => "_".to_string(),
    }
}

fn expand_ellipsis(table: &Instance, fields: &[NamedField]) -> Result<Vec<NamedField>> {
    let direct_names: HashSet<&str> = fields
        .iter()
        .filter_map(|f| f.value.kind.as_name().map(String::as_str))
        .collect();

    let mut out = Vec::with_capacity(fields.len());
    for field in fields {
        match &field.value.kind {
            ExprKind::Ellipsis { exclude } => {
                if field.name.is_some() {
                    return Err(err(
                        ErrorKind::Syntax,
                        "cannot use a name for ellipsis (inlining doesn't accept a name)"
                            .to_string(),
                        field.value.span,
                    ));
                }
                for (name, _) in table.ty.elems() {
                    if direct_names.contains(name.as_str()) || exclude.contains(&name) {
                        continue;
                    }
                    out.push(NamedField::named(name.clone(), Expr::name(name)));
                }
            }
            _ => out.push(field.clone()),
        }
    }
    Ok(out)
}

/// Evaluates projection fields in the current scope; aggregates that stay
/// uncollapsed by their operator are collapsed into array literals.
fn process_fields(state: &mut State, fields: &[NamedField]) -> Result<Vec<(String, Instance)>> {
    let mut out = Vec::with_capacity(fields.len());
    for field in fields {
        let name = field
            .name
            .clone()
            .unwrap_or_else(|| guess_field_name(&field.value));
        let object = evaluate(state, &field.value)?;
        let inst = into_instance(object, field.value.span)?;
        let inst = if inst.ty.kind.is_aggregate() {
            let elem = inst.aggregate_elem();
            Instance::make(
                SqlExpr::MakeArray {
                    ty: elem.ty.clone(),
                    expr: Box::new(elem.code.clone()),
                },
                elem.ty.clone(),
                &[&elem],
            )
        } else {
            inst
        };
        out.push((name, inst));
    }
    Ok(out)
}

fn find_duplicate_name(fields: &[&NamedField]) -> Option<String> {
    let mut seen = HashSet::new();
    for field in fields {
        if let Some(name) = &field.name {
            if !seen.insert(name.clone()) {
                return Some(name.clone());
            }
        }
    }
    None
}

fn eval_projection(
    state: &mut State,
    table: &Expr,
    fields: &[NamedField],
    groupby: bool,
    agg_fields: &[NamedField],
    span: Option<Span>,
) -> Result<Object> {
    let table_inst = eval_instance(state, table)?;

    // The empty list projects to itself.
    if table_inst.is_empty_list() {
        return Ok(Object::Instance(table_inst));
    }

    let projectable = Ty::union(vec![Ty::collection(), Ty::new(TyKind::AnyStruct)]);
    if !table_inst.ty.is_subtype_of(&projectable) {
        return Err(type_err(
            format!("cannot project objects of type {}", table_inst.ty),
            span,
        ));
    }

    let fields = expand_ellipsis(&table_inst, fields)?;

    let named: Vec<&NamedField> = fields.iter().chain(agg_fields).collect();
    if let Some(dup) = find_duplicate_name(&named) {
        return Err(type_err(
            format!("field '{dup}' was already used in this projection"),
            span,
        ));
    }

    let attrs = attrs_scope(&table_inst);
    let processed = state.scoped(attrs.clone(), |state| process_fields(state, &fields))?;

    let is_struct = matches!(
        table_inst.kind,
        InstanceKind::Struct(_) | InstanceKind::Row(_)
    );
    if is_struct {
        if groupby {
            return Err(type_err("cannot group a struct".to_string(), span));
        }
        return Ok(Object::Instance(Instance::strukt(processed)));
    }

    let agg_processed = if !agg_fields.is_empty() {
        let agg_scope: Scope = attrs
            .into_iter()
            .map(|(name, object)| {
                let object = match object {
                    Object::Instance(mut inst) => {
                        inst.ty = Ty::aggregate(inst.ty);
                        Object::Instance(inst)
                    }
                    other => other,
                };
                (name, object)
            })
            .collect();
        state.scoped(agg_scope, |state| process_fields(state, agg_fields))?
    } else {
        vec![]
    };

    let projectable_field = Ty::union(vec![
        Ty::primitive(),
        Ty::new(TyKind::AnyStruct),
        Ty::null(),
    ]);
    for (name, inst) in processed.iter().chain(&agg_processed) {
        if !inst.ty.is_subtype_of(&projectable_field) {
            return Err(type_err(
                format!("cannot project field '{}' of type: {}", name, inst.ty),
                span,
            ));
        }
    }

    // New anonymous table type; later fields take a numeric suffix on
    // collision so an earlier (user) name keeps its spelling.
    let mut elems: Vec<(String, Ty)> = Vec::new();
    for (base, inst) in processed.iter().chain(&agg_processed) {
        let mut name = base.clone();
        let mut i = 1;
        while elems.iter().any(|(n, _)| *n == name) {
            name = format!("{base}{i}");
            i += 1;
        }
        elems.push((name, inst.ty.clone()));
    }
    let new_table_ty = Ty::table(TableTy::anonymous(elems));

    let flat_codes: Vec<SqlExpr> = processed
        .iter()
        .chain(&agg_processed)
        .flat_map(|(_, inst)| inst.flatten_code())
        .collect();
    let flat_names = new_table_ty.flatten();
    if flat_codes.len() != flat_names.len() {
        return Err(err(
            ErrorKind::Compile,
            "projection fields and flattened type went out of step".to_string(),
            span,
        ));
    }
    let sql_fields: Vec<SqlExpr> = flat_codes
        .into_iter()
        .zip(flat_names)
        .map(|(code, (alias, _))| SqlExpr::ColumnAlias {
            value: Box::new(code),
            alias,
        })
        .collect();

    let non_agg_count = processed
        .iter()
        .flat_map(|(_, inst)| inst.flatten_code())
        .count();
    let (group_by, limit) = if groupby {
        if non_agg_count > 0 {
            // Positional references avoid per-dialect expression quirks.
            let keys = (1..=non_agg_count)
                .map(|i| SqlExpr::Primitive(Ty::int(), i.to_string()))
                .collect();
            (keys, None)
        } else {
            // GROUP BY over nothing isn't portable; one global group.
            (vec![], Some(SqlExpr::Primitive(Ty::int(), "1".to_string())))
        }
    } else {
        (vec![], None)
    };

    let code: SqlExpr = Select {
        ty: new_table_ty.clone(),
        source: Some(Box::new(table_inst.code.clone())),
        fields: sql_fields,
        conds: vec![],
        group_by,
        order_by: vec![],
        limit,
        offset: None,
        distinct: false,
    }
    .into();

    let mut inputs: Vec<&Instance> = vec![&table_inst];
    inputs.extend(processed.iter().map(|(_, inst)| inst));
    inputs.extend(agg_processed.iter().map(|(_, inst)| inst));
    Ok(Object::Instance(Instance::table(
        code,
        new_table_ty,
        &inputs,
    )))
}

// ---------------------------------------------------------------------------
// Selection / order / slice

fn eval_selection(
    state: &mut State,
    table: &Expr,
    conds: &[Expr],
    span: Option<Span>,
) -> Result<Object> {
    let table_obj = evaluate(state, table)?;

    // On a type, the "conditions" are generic arguments: `list[int]`.
    if let Object::Type(generic) = table_obj {
        return apply_type_generics(state, &generic, conds, span);
    }

    let table_inst = into_instance(table_obj, table.span)?;
    assert_type(&table_inst.ty, &Ty::collection(), "selection", span)?;

    let cond_insts: Vec<Instance> = state.scoped(attrs_scope(&table_inst), |state| {
        conds.iter().map(|c| eval_instance(state, c)).try_collect()
    })?;

    for (cond, inst) in conds.iter().zip(&cond_insts) {
        if !inst.ty.is_subtype_of(&Ty::bool()) {
            return Err(type_err(
                format!("selection expected boolean, got {}", inst.ty),
                cond.span,
            ));
        }
    }

    let code = table_selection(
        table_inst.ty.clone(),
        table_inst.code.clone(),
        cond_insts.iter().map(|c| c.code.clone()).collect(),
    );
    let mut inputs: Vec<&Instance> = vec![&table_inst];
    inputs.extend(cond_insts.iter());
    Ok(Object::Instance(Instance::table(
        code,
        table_inst.ty.clone(),
        &inputs,
    )))
}

fn apply_type_generics(
    state: &mut State,
    generic: &Ty,
    args: &[Expr],
    span: Option<Span>,
) -> Result<Object> {
    let mut types = Vec::with_capacity(args.len());
    for arg in args {
        match evaluate(state, arg)? {
            Object::Type(ty) => types.push(ty),
            other => {
                return Err(type_err(
                    format!("generics expression expected a type, got '{other}'"),
                    arg.span,
                ))
            }
        }
    }
    match types.len() {
        0 => Err(type_err(
            "generics expression expected a type, got nothing".to_string(),
            span,
        )),
        1 => {
            let applied = generic
                .apply(types.into_iter().next().unwrap())
                .map_err(|e| e.with_span(span))?;
            Ok(Object::Type(applied))
        }
        _ => Err(type_err("union types not yet supported".to_string(), span)),
    }
}

fn eval_order(
    state: &mut State,
    table: &Expr,
    fields: &[Expr],
    span: Option<Span>,
) -> Result<Object> {
    let table_inst = eval_instance(state, table)?;
    assert_type(&table_inst.ty, &Ty::collection(), "'order'", span)?;

    let field_insts: Vec<Instance> = state.scoped(attrs_scope(&table_inst), |state| {
        fields.iter().map(|f| eval_instance(state, f)).try_collect()
    })?;

    let code = table_order(
        table_inst.ty.clone(),
        table_inst.code.clone(),
        field_insts.iter().map(|f| f.code.clone()).collect(),
    );
    let mut inputs: Vec<&Instance> = vec![&table_inst];
    inputs.extend(field_insts.iter());
    Ok(Object::Instance(Instance::table(
        code,
        table_inst.ty.clone(),
        &inputs,
    )))
}

fn eval_slice(
    state: &mut State,
    obj: &Expr,
    start: &Option<Box<Expr>>,
    stop: &Option<Box<Expr>>,
    span: Option<Span>,
) -> Result<Object> {
    let inst = eval_instance(state, obj)?;
    let sliceable = Ty::union(vec![Ty::string(), Ty::collection()]);
    assert_type(&inst.ty, &sliceable, "slice", span)?;

    let start_inst = match start {
        Some(start) => {
            let s = eval_instance(state, start)?;
            assert_type(&s.ty, &Ty::int(), "slice bound", start.span)?;
            s
        }
        None => Instance::value(Literal::Int(0)),
    };
    let stop_inst = match stop {
        Some(stop) => {
            let s = eval_instance(state, stop)?;
            assert_type(&s.ty, &Ty::int(), "slice bound", stop.span)?;
            Some(s)
        }
        None => None,
    };

    let mut inputs: Vec<&Instance> = vec![&inst, &start_inst];
    if let Some(stop_inst) = &stop_inst {
        inputs.push(stop_inst);
    }

    let code = if inst.ty.is_subtype_of(&Ty::string()) {
        SqlExpr::StringSlice {
            expr: Box::new(inst.code.clone()),
            start: Box::new(start_inst.code.clone()),
            stop: stop_inst.as_ref().map(|s| Box::new(s.code.clone())),
        }
    } else {
        let limit = match &stop_inst {
            Some(stop_inst) => Some(length_of_slice(state, stop_inst, &start_inst)?),
            None => None,
        };
        let offset = match &start_inst.kind {
            InstanceKind::Value(Literal::Int(0)) => None,
            _ => Some(start_inst.code.clone()),
        };
        table_slice(inst.ty.clone(), inst.code.clone(), limit, offset)
    };

    // A slice keeps the shape of its input; strings become plain values.
    let kind = match inst.kind {
        InstanceKind::Table => InstanceKind::Table,
        InstanceKind::List => InstanceKind::List,
        _ => InstanceKind::Plain,
    };
    let ty = inst.ty.clone();
    Ok(Object::Instance(Instance {
        kind,
        ..Instance::make(code, ty, &inputs)
    }))
}

/// `stop - start`, folded when both bounds are local.
fn length_of_slice(state: &State, stop: &Instance, start: &Instance) -> Result<SqlExpr> {
    if state.options.fold_constants {
        if let (InstanceKind::Value(Literal::Int(a)), InstanceKind::Value(Literal::Int(b))) =
            (&stop.kind, &start.kind)
        {
            return Ok(SqlExpr::Literal(Ty::int(), Literal::Int(a - b)));
        }
    }
    Ok(SqlExpr::Arith {
        ty: Ty::int(),
        op: ArithOp::Sub,
        left: Box::new(stop.code.clone()),
        right: Box::new(start.code.clone()),
    })
}

// ---------------------------------------------------------------------------
// Operator dispatch

fn bin_to_arith(op: BinOp) -> Option<ArithOp> {
    match op {
        BinOp::Add => Some(ArithOp::Add),
        BinOp::Sub => Some(ArithOp::Sub),
        BinOp::Mul => Some(ArithOp::Mul),
        BinOp::Div => Some(ArithOp::Div),
        BinOp::FloorDiv => Some(ArithOp::FloorDiv),
        BinOp::Intersect | BinOp::Union => None,
    }
}

fn fold_arith(op: BinOp, a: &Literal, b: &Literal) -> Option<Literal> {
    use Literal::*;
    match (a, b) {
        (Int(x), Int(y)) => match op {
            BinOp::Add => Some(Int(x + y)),
            BinOp::Sub => Some(Int(x - y)),
            BinOp::Mul => Some(Int(x * y)),
            BinOp::Div if *y != 0 => Some(Float(*x as f64 / *y as f64)),
            BinOp::FloorDiv if *y != 0 => Some(Int(x.div_euclid(*y))),
            _ => None,
        },
        (Float(x), Float(y)) => fold_float(op, *x, *y),
        (Int(x), Float(y)) => fold_float(op, *x as f64, *y),
        (Float(x), Int(y)) => fold_float(op, *x, *y as f64),
        _ => None,
    }
}

fn fold_float(op: BinOp, x: f64, y: f64) -> Option<Literal> {
    match op {
        BinOp::Add => Some(Literal::Float(x + y)),
        BinOp::Sub => Some(Literal::Float(x - y)),
        BinOp::Mul => Some(Literal::Float(x * y)),
        BinOp::Div => Some(Literal::Float(x / y)),
        BinOp::FloorDiv => Some(Literal::Float((x / y).floor())),
        _ => None,
    }
}

/// Binary dispatch on `(op, type(a), type(b))`.
fn eval_arith(
    state: &mut State,
    op: BinOp,
    a: Instance,
    b: Instance,
    span: Option<Span>,
) -> Result<Object> {
    // Aggregates recurse on their element and re-wrap.
    if a.ty.kind.is_aggregate() || b.ty.kind.is_aggregate() {
        let result = eval_arith(state, op, a.aggregate_elem(), b.aggregate_elem(), span)?;
        return Ok(match result {
            Object::Instance(mut inst) => {
                inst.ty = Ty::aggregate(inst.ty);
                Object::Instance(inst)
            }
            other => other,
        });
    }

    let string = Ty::string();
    let number = Ty::number();
    let collection = Ty::collection();

    // string * int lowers to the repeat builtin
    if a.ty.is_subtype_of(&string) && b.ty.is_subtype_of(&Ty::int()) {
        if op != BinOp::Mul {
            return Err(type_err(
                format!("operator '{op}' not supported between string and integer"),
                span,
            ));
        }
        return builtins::call(state, "repeat", vec![Object::Instance(a), Object::Instance(b)]);
    }

    if a.ty.is_subtype_of(&string) && b.ty.is_subtype_of(&string) {
        if op != BinOp::Add {
            return Err(type_err(
                format!("operator '{op}' not supported for strings"),
                span,
            ));
        }
        if state.options.fold_constants {
            if let (InstanceKind::Value(Literal::String(x)), InstanceKind::Value(Literal::String(y))) =
                (&a.kind, &b.kind)
            {
                return Ok(Object::from_literal(Literal::String(format!("{x}{y}"))));
            }
        }
        let code = SqlExpr::Arith {
            ty: string.clone(),
            op: ArithOp::Concat,
            left: Box::new(a.code.clone()),
            right: Box::new(b.code.clone()),
        };
        return Ok(Object::Instance(Instance::make(code, string, &[&a, &b])));
    }

    if a.ty.is_subtype_of(&number) && b.ty.is_subtype_of(&number) {
        let float = Ty::float();
        let res_ty = if op == BinOp::Div
            || a.ty.is_subtype_of(&float)
            || b.ty.is_subtype_of(&float)
        {
            float
        } else {
            Ty::int()
        };

        if state.options.fold_constants {
            if let (InstanceKind::Value(x), InstanceKind::Value(y)) = (&a.kind, &b.kind) {
                if let Some(folded) = fold_arith(op, x, y) {
                    return Ok(Object::from_literal(folded));
                }
            }
        }

        let arith_op = bin_to_arith(op).ok_or_else(|| {
            type_err(format!("operator '{op}' not supported for numbers"), span)
        })?;
        let code = SqlExpr::Arith {
            ty: res_ty.clone(),
            op: arith_op,
            left: Box::new(a.code.clone()),
            right: Box::new(b.code.clone()),
        };
        return Ok(Object::Instance(Instance::make(code, res_ty, &[&a, &b])));
    }

    if a.ty.is_subtype_of(&collection) && b.ty.is_subtype_of(&collection) {
        let func = match op {
            BinOp::Add => "concat",
            BinOp::Sub => "subtract",
            BinOp::Intersect => "intersect",
            BinOp::Union => "union",
            _ => {
                return Err(type_err(
                    format!("operation '{op}' not supported for tables"),
                    span,
                ))
            }
        };
        return builtins::call(state, func, vec![Object::Instance(a), Object::Instance(b)]);
    }

    Err(type_err(
        format!("operator '{op}' not implemented for {} and {}", a.ty, b.ty),
        span,
    ))
}

fn fold_compare(op: CompareOp, a: &Literal, b: &Literal) -> Option<bool> {
    use std::cmp::Ordering;
    let ord = match (a, b) {
        (Literal::Int(x), Literal::Int(y)) => x.partial_cmp(y),
        (Literal::Float(x), Literal::Float(y)) => x.partial_cmp(y),
        (Literal::Int(x), Literal::Float(y)) => (*x as f64).partial_cmp(y),
        (Literal::Float(x), Literal::Int(y)) => x.partial_cmp(&(*y as f64)),
        (Literal::String(x), Literal::String(y)) => Some(x.cmp(y)),
        (Literal::Bool(x), Literal::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }?;
    Some(match op {
        CompareOp::Eq => ord == Ordering::Equal,
        CompareOp::Ne => ord != Ordering::Equal,
        CompareOp::Lt => ord == Ordering::Less,
        CompareOp::Le => ord != Ordering::Greater,
        CompareOp::Gt => ord == Ordering::Greater,
        CompareOp::Ge => ord != Ordering::Less,
        CompareOp::In | CompareOp::NotIn => return None,
    })
}

fn eval_compare(
    state: &mut State,
    op: CompareOp,
    a: Object,
    b: Object,
    span: Option<Span>,
) -> Result<Object> {
    // Types compare by structural equality.
    if let (Object::Type(x), Object::Type(y)) = (&a, &b) {
        let equal = x == y;
        return match op {
            CompareOp::Eq => Ok(Object::from_literal(Literal::Bool(equal))),
            CompareOp::Ne => Ok(Object::from_literal(Literal::Bool(!equal))),
            _ => Err(type_err("types have no ordering".to_string(), span)),
        };
    }

    let a = into_instance(a, span)?;
    let b = into_instance(b, span)?;

    if a.ty.kind.is_aggregate() || b.ty.kind.is_aggregate() {
        let result = eval_compare(
            state,
            op,
            Object::Instance(a.aggregate_elem()),
            Object::Instance(b.aggregate_elem()),
            span,
        )?;
        return Ok(match result {
            Object::Instance(mut inst) => {
                inst.ty = Ty::aggregate(inst.ty);
                Object::Instance(inst)
            }
            other => other,
        });
    }

    let a_null = a.ty.kind.is_null();
    let b_null = b.ty.kind.is_null();
    if a_null || b_null {
        if !matches!(op, CompareOp::Eq | CompareOp::Ne) {
            return Err(type_err(
                format!("compare not implemented for {} and {}", a.ty, b.ty),
                span,
            ));
        }
        if a_null && b_null {
            return Ok(Object::from_literal(Literal::Bool(op == CompareOp::Eq)));
        }
        let other = if a_null { &b } else { &a };
        let other = if other.ty.is_subtype_of(&Ty::new(TyKind::AnyStruct)) {
            other.primary_key().map_err(|e| e.with_span(span))?
        } else {
            other.clone()
        };
        let code = SqlExpr::IsNull {
            expr: Box::new(other.code.clone()),
            negated: op == CompareOp::Ne,
        };
        return Ok(Object::Instance(Instance::make(
            code,
            Ty::bool(),
            &[&other],
        )));
    }

    // Rows compare by primary key; a bare number is compared against it.
    let a_row = a.ty.kind.is_row();
    let b_row = b.ty.kind.is_row();
    if a_row || b_row {
        let left = if a_row {
            a.primary_key().map_err(|e| e.with_span(span))?
        } else {
            a.clone()
        };
        let right = if b_row {
            b.primary_key().map_err(|e| e.with_span(span))?
        } else {
            b.clone()
        };
        return eval_compare(
            state,
            op,
            Object::Instance(left),
            Object::Instance(right),
            span,
        );
    }

    if a.ty.is_subtype_of(&Ty::primitive()) && b.ty.is_subtype_of(&Ty::primitive()) {
        if state.options.fold_constants {
            if let (InstanceKind::Value(x), InstanceKind::Value(y)) = (&a.kind, &b.kind) {
                if let Some(result) = fold_compare(op, x, y) {
                    return Ok(Object::from_literal(Literal::Bool(result)));
                }
            }
        }
        let code = SqlExpr::Compare {
            op,
            left: Box::new(a.code.clone()),
            right: Box::new(b.code.clone()),
        };
        return Ok(Object::Instance(Instance::make(code, Ty::bool(), &[&a, &b])));
    }

    Err(type_err(
        format!("compare not implemented for {} and {}", a.ty, b.ty),
        span,
    ))
}

fn eval_contains(
    state: &mut State,
    op: CompareOp,
    a: Instance,
    b: Instance,
    span: Option<Span>,
) -> Result<Object> {
    let string = Ty::string();
    if a.ty.is_subtype_of(&string) && b.ty.is_subtype_of(&string) {
        let func = match op {
            CompareOp::In => "str_contains",
            _ => "str_notcontains",
        };
        return builtins::call(state, func, vec![Object::Instance(a), Object::Instance(b)]);
    }

    if a.ty.is_subtype_of(&Ty::primitive()) && b.ty.is_subtype_of(&Ty::collection()) {
        let list = cast_to_list(&b, span)?;
        let elem_ty = match &list.ty.kind {
            TyKind::List(elem) => (**elem).clone(),
            _ => unreachable!("cast_to_list returns a list"),
        };
        if !a.ty.is_subtype_of(&elem_ty) {
            return Err(type_err(
                format!("mismatch between {} and {}", a.ty, b.ty),
                span,
            ));
        }
        let code = SqlExpr::Contains {
            negated: op == CompareOp::NotIn,
            elem: Box::new(a.code.clone()),
            list: Box::new(list.code.clone()),
        };
        return Ok(Object::Instance(Instance::make(
            code,
            Ty::bool(),
            &[&a, &list],
        )));
    }

    Err(type_err(
        format!("contains not implemented for {} and {}", a.ty, b.ty),
        span,
    ))
}

/// Views a one-value-column collection as a list.
pub(super) fn cast_to_list(inst: &Instance, span: Option<Span>) -> Result<Instance> {
    match &inst.ty.kind {
        TyKind::List(_) => Ok(inst.clone()),
        TyKind::Table(table) => {
            let value_columns: Vec<&(String, Ty)> = table.value_columns().collect();
            let (name, elem_ty) = match value_columns.as_slice() {
                [only] => (*only).clone(),
                _ => {
                    return Err(type_err(
                        format!("cannot cast {} to a list: expected a single column", inst.ty),
                        span,
                    ))
                }
            };
            let list_ty = Ty::list(elem_ty.clone());
            let mut select = Select::from_source(list_ty.clone(), inst.code.clone());
            select.fields = vec![SqlExpr::ColumnAlias {
                value: Box::new(SqlExpr::Name(elem_ty, name)),
                alias: "value".to_string(),
            }];
            Ok(Instance::list(select.into(), list_ty, &[inst]))
        }
        _ => Err(type_err(format!("cannot cast {} to a list", inst.ty), span)),
    }
}

// ---------------------------------------------------------------------------
// Function calls and casts

fn eval_func_call(
    state: &mut State,
    func: &Expr,
    args: &[NamedField],
    span: Option<Span>,
) -> Result<Object> {
    let callee = evaluate(state, func)?;
    match callee {
        Object::Function(function) => call_function(state, &function, args, span),
        Object::Type(target) => {
            // Calling a type casts: `int(x)`.
            let matched = match_params("cast", &[ParamDef::new("value")], None, args)
                .map_err(|e| e.with_span(span))?;
            let (_, bound) = matched.into_only()?;
            let value = eval_bound(state, &bound)?;
            let inst = into_instance(value, span)?;
            cast_to(state, &inst, &target, span)
        }
        other => Err(type_err(
            format!("object of type '{}' is not callable", other.ty()),
            func.span,
        )),
    }
}

pub(super) fn call_function(
    state: &mut State,
    function: &Function,
    args: &[NamedField],
    span: Option<Span>,
) -> Result<Object> {
    let matched = function.match_params(args).map_err(|e| e.with_span(span))?;

    // Arguments evaluate in the caller's scope.
    let mut bound = Vec::with_capacity(matched.len());
    for (param, arg) in matched {
        bound.push((param, eval_bound(state, &arg)?));
    }

    match function {
        Function::Builtin(builtin) => {
            (builtin.func)(state, bound.into_iter().map(|(_, v)| v).collect())
                .map_err(|e| crate::error::with_span_fallback(e, span))
        }
        Function::User(user) => {
            let scope: Scope = bound
                .into_iter()
                .map(|(param, value)| (param.name, value))
                .collect();
            state.stacktrace.push(user.def.name.clone());
            let result = state.scoped(scope, |state| match &user.def.body {
                FuncBody::Expr(expr) => evaluate(state, expr),
                FuncBody::Block(stmts) => {
                    for stmt in stmts {
                        if let Flow::Return(value) = execute(state, stmt)? {
                            return Ok(value);
                        }
                    }
                    Ok(Object::null())
                }
            });
            state.stacktrace.pop();
            result.map_err(|e| push_frame(e, &user.def.name))
        }
    }
}

fn push_frame(error: anyhow::Error, name: &str) -> anyhow::Error {
    match error.downcast::<Error>() {
        Ok(mut e) => {
            e.stack.push(name.to_string());
            e.into()
        }
        Err(e) => e,
    }
}

pub(super) fn eval_bound(state: &mut State, arg: &BoundArg) -> Result<Object> {
    match arg {
        BoundArg::Expr(expr) => evaluate(state, expr),
        BoundArg::Collected(pairs) => {
            let mut fields = Vec::with_capacity(pairs.len());
            for (name, expr) in pairs {
                let inst = eval_instance(state, expr)?;
                fields.push((name.clone(), inst));
            }
            Ok(Object::Instance(Instance::strukt(fields)))
        }
    }
}

fn cast_to(
    state: &mut State,
    inst: &Instance,
    target: &Ty,
    span: Option<Span>,
) -> Result<Object> {
    if inst.ty == *target {
        return Ok(Object::Instance(inst.clone()));
    }

    match &target.kind {
        TyKind::Int | TyKind::Float | TyKind::String => {
            if state.options.fold_constants {
                if let InstanceKind::Value(value) = &inst.kind {
                    return Ok(Object::from_literal(cast_literal(value, target, span)?));
                }
            }
            if !inst.ty.is_subtype_of(&Ty::primitive()) {
                return Err(type_err(
                    format!("cannot cast {} to {}", inst.ty, target),
                    span,
                ));
            }
            let code = SqlExpr::Cast {
                ty: target.clone(),
                expr: Box::new(inst.code.clone()),
            };
            Ok(Object::Instance(Instance::make(
                code,
                target.clone(),
                &[inst],
            )))
        }
        TyKind::AnyList => Ok(Object::Instance(cast_to_list(inst, span)?)),
        _ => Err(type_err(
            format!("cannot cast {} to {}", inst.ty, target),
            span,
        )),
    }
}

fn cast_literal(value: &Literal, target: &Ty, span: Option<Span>) -> Result<Literal> {
    Ok(match (&target.kind, value) {
        (_, Literal::Null) => Literal::Null,
        (TyKind::Int, Literal::Int(i)) => Literal::Int(*i),
        (TyKind::Int, Literal::Float(f)) => Literal::Int(*f as i64),
        (TyKind::Int, Literal::Bool(b)) => Literal::Int(i64::from(*b)),
        (TyKind::Int, Literal::String(s)) => Literal::Int(s.trim().parse().map_err(|_| {
            err(
                ErrorKind::Value,
                format!("cannot cast string to int: \"{s}\""),
                span,
            )
        })?),
        (TyKind::Float, Literal::Int(i)) => Literal::Float(*i as f64),
        (TyKind::Float, Literal::Float(f)) => Literal::Float(*f),
        (TyKind::Float, Literal::String(s)) => Literal::Float(s.trim().parse().map_err(|_| {
            err(
                ErrorKind::Value,
                format!("cannot cast string to float: \"{s}\""),
                span,
            )
        })?),
        (TyKind::String, v) => Literal::String(match v {
            Literal::String(s) => s.clone(),
            other => other.to_string(),
        }),
        _ => {
            return Err(type_err(
                format!("cannot cast {value} to {target}"),
                span,
            ))
        }
    })
}

// ---------------------------------------------------------------------------
// Lists, dicts, one

fn eval_list(state: &mut State, elems: &[Expr], span: Option<Span>) -> Result<Object> {
    if elems.is_empty() {
        return Ok(Object::Instance(Instance::empty_list()));
    }

    let insts: Vec<Instance> = elems
        .iter()
        .map(|e| eval_instance(state, e))
        .try_collect()?;

    let mut elem_ty: Option<Ty> = None;
    for inst in &insts {
        match &elem_ty {
            None => elem_ty = Some(inst.ty.clone()),
            Some(ty) if *ty == inst.ty => {}
            Some(ty) => {
                return Err(type_err(
                    format!("cannot create a list of mixed types: {} and {}", ty, inst.ty),
                    span,
                ))
            }
        }
    }
    let elem_ty = elem_ty.unwrap();
    if !elem_ty.is_subtype_of(&Ty::primitive()) {
        return Err(type_err(
            format!("cannot create lists of type {elem_ty}"),
            span,
        ));
    }

    let list_ty = Ty::list(elem_ty);
    let name = state.unique_name("list_");
    let body = create_list(
        list_ty.clone(),
        insts.iter().map(|i| i.code.clone()).collect(),
    );

    let inputs: Vec<&Instance> = insts.iter().collect();
    let mut inst = Instance::list(
        SqlExpr::TableName(list_ty.clone(), name.clone()),
        list_ty,
        &inputs,
    );
    inst.subqueries.push((name, body));
    Ok(Object::Instance(inst))
}

pub(super) fn make_list_instance(
    state: &mut State,
    elem_ty: Ty,
    values: Vec<Literal>,
) -> Instance {
    if values.is_empty() {
        return Instance::empty_list();
    }
    let list_ty = Ty::list(elem_ty.clone());
    let name = state.unique_name("list_");
    let body = create_list(
        list_ty.clone(),
        values
            .into_iter()
            .map(|v| SqlExpr::Literal(elem_ty.clone(), v))
            .collect(),
    );
    let mut inst = Instance::list(
        SqlExpr::TableName(list_ty.clone(), name.clone()),
        list_ty,
        &[],
    );
    inst.subqueries.push((name, body));
    inst
}

fn eval_dict(state: &mut State, elems: &[(Option<String>, Expr)]) -> Result<Object> {
    let mut fields = Vec::with_capacity(elems.len());
    for (name, expr) in elems {
        let name = name.clone().unwrap_or_else(|| guess_field_name(expr));
        let inst = eval_instance(state, expr)?;
        fields.push((name, inst));
    }
    let table = TableTy::anonymous(
        fields
            .iter()
            .map(|(n, i)| (n.clone(), i.ty.clone()))
            .collect(),
    );
    Ok(Object::Instance(Instance::row(table, fields)))
}

fn eval_one(
    state: &mut State,
    expr: &Expr,
    nullable: bool,
    span: Option<Span>,
) -> Result<Object> {
    let inst = eval_instance(state, expr)?;
    assert_type(&inst.ty, &Ty::collection(), "'one'", span)?;
    state.require_access(AccessLevel::ReadDb)?;

    let code = table_slice(
        inst.ty.clone(),
        inst.code.clone(),
        Some(SqlExpr::Primitive(Ty::int(), "2".to_string())),
        None,
    );
    let rows = state.db.query(&code, &inst.subqueries)?;

    match rows.len() {
        0 => {
            if nullable {
                Ok(Object::null())
            } else {
                Err(err(
                    ErrorKind::Value,
                    "'one' expected a single row, got an empty table".to_string(),
                    span,
                ))
            }
        }
        1 => {
            let row = rows.into_iter().next().unwrap();
            match &inst.ty.kind {
                TyKind::List(_) => {
                    let value = row.into_iter().next().map(|(_, v)| v).unwrap_or(Literal::Null);
                    Ok(Object::from_literal(value))
                }
                TyKind::Table(table) => {
                    let fields = row
                        .into_iter()
                        .map(|(name, value)| {
                            let ty = table
                                .column(&name)
                                .cloned()
                                .unwrap_or_else(|| Instance::value(value.clone()).ty);
                            (name, Instance::value_typed(value, ty))
                        })
                        .collect();
                    Ok(Object::Instance(Instance::row(table.clone(), fields)))
                }
                _ => Err(type_err(
                    format!("'one' not supported for {}", inst.ty),
                    span,
                )),
            }
        }
        _ => Err(err(
            ErrorKind::Value,
            "'one' expected a single row, got more".to_string(),
            span,
        )),
    }
}

// ---------------------------------------------------------------------------
// Row construction and mutation

pub(super) fn stored_table_of(object: &Object, span: Option<Span>) -> Result<TableTy> {
    let ty = match object {
        Object::Instance(inst) => &inst.ty,
        Object::Type(ty) => ty,
        other => {
            return Err(type_err(
                format!("'new' expected an object of type 'table', instead got '{other}'"),
                span,
            ))
        }
    };
    match &ty.kind {
        TyKind::Table(table) => Ok(table.clone()),
        _ => Err(type_err(
            format!("'new' expected an object of type 'table', instead got '{ty}'"),
            span,
        )),
    }
}

fn eval_new(
    state: &mut State,
    type_name: &str,
    args: &[NamedField],
    span: Option<Span>,
) -> Result<Object> {
    let object = state.get_var(type_name).map_err(|e| e.with_span(span))?;

    // `new ValueError("...")` constructs a throwable error value.
    if let Object::Type(ty) = &object {
        if let TyKind::Exception(kind) = &ty.kind {
            let matched = match_params(type_name, &[ParamDef::new("message")], None, args)
                .map_err(|e| e.with_span(span))?;
            let (_, bound) = matched.into_only()?;
            let message = eval_bound(state, &bound)?;
            let message = match localize(state, &message)? {
                LocalValue::Value(Literal::String(s)) => s,
                LocalValue::Value(other) => other.to_string(),
                other => {
                    return Err(type_err(
                        format!("error message must be a value, got {other}"),
                        span,
                    ))
                }
            };
            return Ok(Object::Instance(Instance {
                code: SqlExpr::Null,
                ty: Ty::exception(*kind),
                subqueries: vec![],
                kind: InstanceKind::Value(Literal::String(message)),
            }));
        }
    }

    let table = stored_table_of(&object, span)?;
    let table_name = table.name.clone().ok_or_else(|| {
        err(
            ErrorKind::Value,
            "'new' expected a stored table, got a query".to_string(),
            span,
        )
    })?;
    state.require_access(AccessLevel::WriteDb)?;

    let params: Vec<ParamDef> = table
        .value_columns()
        .map(|(name, _)| ParamDef::new(name.clone()))
        .collect();
    let matched =
        match_params(&table_name, &params, None, args).map_err(|e| e.with_span(span))?;

    let mut names = Vec::with_capacity(matched.len());
    let mut literals = Vec::with_capacity(matched.len());
    for (param, bound) in matched {
        let object = eval_bound(state, &bound)?;
        let value = match localize(state, &object)? {
            LocalValue::Value(value) => value,
            other => {
                return Err(type_err(
                    format!("parameter '{}' received a bad value: {other}", param.name),
                    span,
                ))
            }
        };
        check_column_value(&table, &param.name, &value, span)?;
        names.push(param.name);
        literals.push(value);
    }

    let id = insert_row(state, &table, &table_name, &names, &literals)?;

    let mut fields = vec![(
        "id".to_string(),
        Instance::value_typed(Literal::Int(id), Ty::int()),
    )];
    for (name, value) in names.into_iter().zip(literals) {
        let ty = table
            .column(&name)
            .cloned()
            .unwrap_or_else(|| Instance::value(value.clone()).ty);
        fields.push((name, Instance::value_typed(value, ty)));
    }
    Ok(Object::Instance(Instance::row(table, fields)))
}

fn check_column_value(
    table: &TableTy,
    column: &str,
    value: &Literal,
    span: Option<Span>,
) -> Result<()> {
    let Some(column_ty) = table.column(column) else {
        return Ok(());
    };
    if matches!(value, Literal::Null) {
        return Ok(());
    }
    let value_ty = Instance::value(value.clone()).ty;
    let numeric = value_ty.is_subtype_of(&Ty::number()) && column_ty.is_subtype_of(&Ty::number());
    if !numeric && !value_ty.is_subtype_of(column_ty) {
        return Err(type_err(
            format!("column '{column}' expected {column_ty}, got {value_ty}"),
            span,
        ));
    }
    Ok(())
}

fn insert_row(
    state: &mut State,
    table: &TableTy,
    table_name: &str,
    names: &[String],
    values: &[Literal],
) -> Result<i64> {
    let row: Vec<SqlExpr> = names
        .iter()
        .zip(values)
        .map(|(name, value)| {
            let ty = table
                .column(name)
                .cloned()
                .unwrap_or_else(|| Instance::value(value.clone()).ty);
            SqlExpr::Literal(ty, value.clone())
        })
        .collect();
    let code = SqlExpr::InsertValues {
        table: table_name.to_string(),
        columns: names.to_vec(),
        values: vec![row],
    };
    state.db.query(&code, &vec![])?;
    state.db.last_row_id()
}

fn eval_new_rows(
    state: &mut State,
    type_name: &str,
    args: &[NamedField],
    span: Option<Span>,
) -> Result<Object> {
    if args.len() != 1 {
        return Err(err(
            ErrorKind::NotImplemented,
            "column-wise construction requires column-wise table concat".to_string(),
            span,
        ));
    }

    let object = state.get_var(type_name).map_err(|e| e.with_span(span))?;
    let table = stored_table_of(&object, span)?;
    let table_name = table.name.clone().ok_or_else(|| {
        err(
            ErrorKind::Value,
            "'new' expected a stored table, got a query".to_string(),
            span,
        )
    })?;
    state.require_access(AccessLevel::WriteDb)?;

    let source = eval_instance(state, &args[0].value)?;
    if source.is_empty_list() {
        return Ok(Object::Instance(Instance::empty_list()));
    }
    assert_type(&source.ty, &Ty::collection(), "'new'", span)?;

    let params: Vec<String> = table
        .value_columns()
        .map(|(name, _)| name.clone())
        .collect();

    let rows = match localize(state, &Object::Instance(source))? {
        LocalValue::Rows(rows) => rows,
        LocalValue::Values(values) => {
            let column = params
                .first()
                .cloned()
                .unwrap_or_else(|| "value".to_string());
            values
                .into_iter()
                .map(|v| vec![(column.clone(), v)])
                .collect()
        }
        other => {
            return Err(type_err(
                format!("'new' expected a table of rows, got {other}"),
                span,
            ))
        }
    };

    let mut ids = Vec::with_capacity(rows.len());
    for row in rows {
        // Skip a leading id column when the source carries one.
        let values: Vec<Literal> = if row.len() == params.len() + 1
            && row.first().map(|(n, _)| n.as_str()) == Some("id")
        {
            row.into_iter().skip(1).map(|(_, v)| v).collect()
        } else {
            row.into_iter().map(|(_, v)| v).collect()
        };
        if values.len() != params.len() {
            return Err(type_err(
                format!(
                    "'{}' takes {} columns but the row has {}",
                    table_name,
                    params.len(),
                    values.len()
                ),
                span,
            ));
        }
        for (name, value) in params.iter().zip(&values) {
            check_column_value(&table, name, value, span)?;
        }
        let id = insert_row(state, &table, &table_name, &params, &values)?;
        ids.push(Literal::Int(id));
    }

    Ok(Object::Instance(make_list_instance(state, Ty::int(), ids)))
}

fn eval_update(
    state: &mut State,
    table: &Expr,
    fields: &[NamedField],
    span: Option<Span>,
) -> Result<Object> {
    state.require_access(AccessLevel::WriteDb)?;
    let table_inst = eval_instance(state, table)?;
    let table_ty = match &table_inst.ty.kind {
        TyKind::Table(t) => t.clone(),
        _ => {
            return Err(type_err(
                format!("update expected a table, got {}", table_inst.ty),
                span,
            ))
        }
    };
    let table_name = table_ty.name.clone().ok_or_else(|| {
        err(
            ErrorKind::Value,
            "update expected a stored table, got a query".to_string(),
            span,
        )
    })?;

    for field in fields {
        if field.name.is_none() {
            return Err(err(
                ErrorKind::Value,
                "update fields must be named".to_string(),
                field.value.span,
            ));
        }
    }

    let assignments: Vec<(String, Instance)> =
        state.scoped(attrs_scope(&table_inst), |state| {
            fields
                .iter()
                .map(|f| {
                    let inst = eval_instance(state, &f.value)?;
                    Ok((f.name.clone().unwrap(), inst))
                })
                .try_collect()
        })?;

    for (name, _) in &assignments {
        if table_ty.column(name).is_none() {
            return Err(err(
                ErrorKind::Value,
                format!("update error: column '{name}' does not exist in '{table_name}'"),
                span,
            ));
        }
    }

    let rows = match localize(state, &Object::Instance(table_inst.clone()))? {
        LocalValue::Rows(rows) => rows,
        other => {
            return Err(type_err(
                format!("update expected rows, got {other}"),
                span,
            ))
        }
    };

    for row in rows {
        let id = row
            .iter()
            .find(|(n, _)| n == "id")
            .map(|(_, v)| v.clone())
            .ok_or_else(|| {
                err(
                    ErrorKind::Value,
                    "update error: table does not contain id".to_string(),
                    span,
                )
            })?;
        let code = SqlExpr::Update {
            table: table_name.clone(),
            assignments: assignments
                .iter()
                .map(|(n, i)| (n.clone(), i.code.clone()))
                .collect(),
            conds: vec![id_cond(id)],
        };
        let mut maps = vec![&table_inst.subqueries];
        maps.extend(assignments.iter().map(|(_, i)| &i.subqueries));
        let subqueries = sql::merge_subqueries(&maps);
        state.db.query(&code, &subqueries)?;
    }

    Ok(Object::Instance(table_inst))
}

fn eval_delete(
    state: &mut State,
    table: &Expr,
    conds: &[Expr],
    span: Option<Span>,
) -> Result<Object> {
    state.require_access(AccessLevel::WriteDb)?;

    let selected = eval_selection(state, table, conds, span)?;
    let selected = into_instance(selected, span)?;
    let table_ty = match &selected.ty.kind {
        TyKind::Table(t) => t.clone(),
        _ => {
            return Err(type_err(
                format!("delete expected a table, got {}", selected.ty),
                span,
            ))
        }
    };
    let table_name = table_ty.name.clone().ok_or_else(|| {
        err(
            ErrorKind::Value,
            "delete expected a stored table, got a query".to_string(),
            span,
        )
    })?;

    let rows = match localize(state, &Object::Instance(selected))? {
        LocalValue::Rows(rows) => rows,
        other => {
            return Err(type_err(
                format!("delete expected rows, got {other}"),
                span,
            ))
        }
    };

    for row in rows {
        let id = row
            .iter()
            .find(|(n, _)| n == "id")
            .map(|(_, v)| v.clone())
            .ok_or_else(|| {
                err(
                    ErrorKind::Value,
                    "delete error: table does not contain id".to_string(),
                    span,
                )
            })?;
        let code = SqlExpr::Delete {
            table: table_name.clone(),
            conds: vec![id_cond(id)],
        };
        state.db.query(&code, &vec![])?;
    }

    // The surviving rows, re-read.
    evaluate(state, table)
}

fn id_cond(id: Literal) -> SqlExpr {
    SqlExpr::Compare {
        op: CompareOp::Eq,
        left: Box::new(SqlExpr::Name(Ty::int(), "id".to_string())),
        right: Box::new(SqlExpr::Literal(Ty::int(), id)),
    }
}

/// A JOIN of two tables on their single shared column, merged with USING so
/// the join column appears once.
///
/// Each side is first projected onto its value columns: primary keys are
/// per-table identities and don't survive into the joined relation.
pub(super) fn join_tables(
    kind: JoinKind,
    a: &Instance,
    b: &Instance,
    span: Option<Span>,
) -> Result<Instance> {
    if !a.ty.kind.is_table() || !b.ty.kind.is_table() {
        return Err(err(
            ErrorKind::Join,
            format!("join expected two tables, got {} and {}", a.ty, b.ty),
            span,
        ));
    }
    let (a_cols, a_code) = join_side(a);
    let (b_cols, b_code) = join_side(b);

    let shared: Vec<&String> = a_cols
        .iter()
        .map(|(n, _)| n)
        .filter(|n| b_cols.iter().any(|(bn, _)| bn == *n))
        .collect();
    let using = match shared.as_slice() {
        [only] => (*only).clone(),
        [] => {
            return Err(err(
                ErrorKind::Join,
                "cannot determine a join column: the tables share none".to_string(),
                span,
            ))
        }
        many => {
            return Err(err(
                ErrorKind::Join,
                format!(
                    "ambiguous join: tables share columns {}",
                    many.iter().map(|n| format!("'{n}'")).join(", ")
                ),
                span,
            ))
        }
    };

    let mut columns: Vec<(String, Ty)> = a_cols;
    for (name, ty) in b_cols {
        if name != using {
            columns.push((name, ty));
        }
    }
    let joined_ty = Ty::table(TableTy::anonymous(columns));

    let code: SqlExpr = Select::from_source(
        joined_ty.clone(),
        SqlExpr::Join {
            kind,
            left: Box::new(a_code),
            right: Box::new(b_code),
            using,
        },
    )
    .into();

    Ok(Instance::table(code, joined_ty, &[a, b]))
}

/// The column set and source code of one join operand, with primary keys
/// projected away.
fn join_side(inst: &Instance) -> (Vec<(String, Ty)>, SqlExpr) {
    let table = match &inst.ty.kind {
        TyKind::Table(t) => t,
        _ => unreachable!("checked by join_tables"),
    };
    if table.primary_key.is_empty() {
        return (table.columns.clone(), inst.code.clone());
    }
    let columns: Vec<(String, Ty)> = table.value_columns().cloned().collect();
    let mut select = Select::from_source(inst.ty.clone(), inst.code.clone());
    select.fields = columns
        .iter()
        .map(|(name, ty)| SqlExpr::ColumnAlias {
            value: Box::new(SqlExpr::Name(ty.clone(), name.clone())),
            alias: name.clone(),
        })
        .collect();
    (columns, select.into())
}
