//! Simple tests for "this AST compiles to this SQL" go here.

use insta::assert_snapshot;

use crate::ast::{BinOp, ColumnDef, CompareOp, Expr, NamedField, Stmt, StmtKind};
use crate::interpreter::Interpreter;
use crate::sql::{self, Dialect};

/// An interpreter with `table P { name: string, age: int }` defined.
fn interp_with_p() -> Interpreter {
    let mut interp = Interpreter::in_memory().unwrap();
    interp
        .execute(&Stmt::new(StmtKind::TableDef {
            name: "P".to_string(),
            columns: vec![
                ColumnDef {
                    name: "name".to_string(),
                    type_expr: Expr::name("string"),
                },
                ColumnDef {
                    name: "age".to_string(),
                    type_expr: Expr::name("int"),
                },
            ],
        }))
        .unwrap();
    interp
}

fn compile(interp: &mut Interpreter, expr: &Expr) -> String {
    let object = interp.evaluate(expr).unwrap();
    let inst = object.as_instance().expect("expression should be a value");
    sql::compile(&inst.code, &inst.subqueries, Dialect::SQLite)
        .unwrap()
        .text
}

#[test]
fn projection_aliases_every_field() {
    let mut interp = interp_with_p();
    let expr = Expr::name("P").project(vec![NamedField::unnamed(Expr::name("name"))]);
    assert_snapshot!(
        compile(&mut interp, &expr),
        @r###"SELECT "name" AS "name" FROM "P""###
    );
}

#[test]
fn selection_then_projection_nests_the_source() {
    let mut interp = interp_with_p();
    let expr = Expr::name("P")
        .select(vec![Expr::name("age").compare(CompareOp::Gt, Expr::int(18))])
        .project(vec![
            NamedField::unnamed(Expr::name("name")),
            NamedField::unnamed(Expr::name("age").binop(BinOp::Mul, Expr::int(2))),
        ]);
    assert_snapshot!(
        compile(&mut interp, &expr),
        @r###"SELECT "name" AS "name", "age" * ? AS "_" FROM (SELECT * FROM "P" WHERE "age" > ?) AS "t0""###
    );
}

#[test]
fn groupby_uses_positional_keys() {
    let mut interp = interp_with_p();
    let expr = Expr::name("P").group(
        vec![NamedField::unnamed(Expr::name("age"))],
        vec![NamedField::unnamed(Expr::name("count").call(vec![]))],
    );
    assert_snapshot!(
        compile(&mut interp, &expr),
        @r###"SELECT "age" AS "age", count(*) AS "count" FROM "P" GROUP BY 1"###
    );
}

#[test]
fn groupby_without_keys_limits_to_one_group() {
    let mut interp = interp_with_p();
    let expr = Expr::name("P").group(
        vec![],
        vec![NamedField::unnamed(Expr::name("count").call(vec![]))],
    );
    assert_snapshot!(
        compile(&mut interp, &expr),
        @r###"SELECT count(*) AS "count" FROM "P" LIMIT 1"###
    );
}

#[test]
fn uncollapsed_aggregate_becomes_an_array() {
    let mut interp = interp_with_p();
    let expr = Expr::name("P").group(
        vec![NamedField::unnamed(Expr::name("age"))],
        vec![NamedField::unnamed(Expr::name("name"))],
    );
    assert_snapshot!(
        compile(&mut interp, &expr),
        @r###"SELECT "age" AS "age", group_concat("name") AS "name" FROM "P" GROUP BY 1"###
    );
}

#[test]
fn order_descending() {
    let mut interp = interp_with_p();
    let expr = Expr::name("P").order(vec![Expr::new(crate::ast::ExprKind::Desc(Box::new(
        Expr::name("age"),
    )))]);
    assert_snapshot!(
        compile(&mut interp, &expr),
        @r###"SELECT * FROM "P" ORDER BY "age" DESC"###
    );
}

#[test]
fn list_slice_hoists_the_list_and_folds_bounds() {
    let mut interp = interp_with_p();
    let expr = Expr::list(vec![
        Expr::int(1),
        Expr::int(2),
        Expr::int(3),
        Expr::int(4),
        Expr::int(5),
    ])
    .slice(Some(Expr::int(2)), Some(Expr::int(4)));
    assert_snapshot!(
        compile(&mut interp, &expr),
        @r###"WITH "list_1" AS (SELECT ? AS "value" UNION ALL SELECT ? AS "value" UNION ALL SELECT ? AS "value" UNION ALL SELECT ? AS "value" UNION ALL SELECT ? AS "value") SELECT * FROM "list_1" LIMIT ? OFFSET ?"###
    );
}

#[test]
fn contains_lowers_to_in_over_the_list() {
    let mut interp = interp_with_p();
    let expr = Expr::int(3).compare(
        CompareOp::In,
        Expr::list(vec![Expr::int(1), Expr::int(2), Expr::int(3)]),
    );
    assert_snapshot!(
        compile(&mut interp, &expr),
        @r###"WITH "list_1" AS (SELECT ? AS "value" UNION ALL SELECT ? AS "value" UNION ALL SELECT ? AS "value") SELECT ? IN (SELECT * FROM "list_1")"###
    );
}

#[test]
fn null_comparison_is_is_null() {
    let mut interp = interp_with_p();
    let expr = Expr::name("P").select(vec![
        Expr::name("name").compare(CompareOp::Ne, Expr::null())
    ]);
    assert_snapshot!(
        compile(&mut interp, &expr),
        @r###"SELECT * FROM "P" WHERE "name" IS NOT NULL"###
    );
}

#[test]
fn string_concat_and_division_stay_typed() {
    let mut interp = interp_with_p();
    let expr = Expr::name("P").project(vec![NamedField::named(
        "half",
        Expr::name("age").binop(BinOp::Div, Expr::int(2)),
    )]);
    assert_snapshot!(
        compile(&mut interp, &expr),
        @r###"SELECT "age" * 1.0 / ? AS "half" FROM "P""###
    );
}

#[test]
fn ellipsis_expands_remaining_columns_in_order() {
    let mut interp = interp_with_p();
    let expr = Expr::name("P").project(vec![
        NamedField::unnamed(Expr::name("age")),
        NamedField::unnamed(Expr::new(crate::ast::ExprKind::Ellipsis { exclude: vec![] })),
    ]);
    assert_snapshot!(
        compile(&mut interp, &expr),
        @r###"SELECT "age" AS "age", "id" AS "id", "name" AS "name" FROM "P""###
    );
}

#[test]
fn join_merges_on_the_shared_column() {
    let mut interp = interp_with_p();
    interp
        .execute(&Stmt::new(StmtKind::TableDef {
            name: "Q".to_string(),
            columns: vec![
                ColumnDef {
                    name: "age".to_string(),
                    type_expr: Expr::name("int"),
                },
                ColumnDef {
                    name: "city".to_string(),
                    type_expr: Expr::name("string"),
                },
            ],
        }))
        .unwrap();
    let expr = Expr::name("join").call(vec![
        NamedField::named("a", Expr::name("P")),
        NamedField::named("b", Expr::name("Q")),
    ]);
    assert_snapshot!(
        compile(&mut interp, &expr),
        @r###"SELECT * FROM (SELECT "name" AS "name", "age" AS "age" FROM "P") AS "t0" JOIN (SELECT "age" AS "age", "city" AS "city" FROM "Q") AS "t1" USING ("age")"###
    );
}

#[test]
fn projection_field_collision_takes_a_suffix() {
    let mut interp = interp_with_p();
    // An automatic name colliding with an earlier user name: the later
    // field is renamed, never the first.
    let expr = Expr::name("P").project(vec![
        NamedField::named("name", Expr::name("age")),
        NamedField::unnamed(Expr::name("name")),
    ]);
    assert_snapshot!(
        compile(&mut interp, &expr),
        @r###"SELECT "age" AS "name", "name" AS "name1" FROM "P""###
    );
}

#[test]
fn projection_of_true_selection_is_observationally_identity() {
    let mut interp = interp_with_p();
    let expr = Expr::name("P").select(vec![Expr::bool(true)]);
    assert_snapshot!(
        compile(&mut interp, &expr),
        @r###"SELECT * FROM "P" WHERE ?"###
    );
}

#[test]
fn duplicate_projection_field_is_a_type_error() {
    let mut interp = interp_with_p();
    let expr = Expr::name("P").project(vec![
        NamedField::named("x", Expr::name("name")),
        NamedField::named("x", Expr::name("age")),
    ]);
    let error = crate::error::downcast(interp.evaluate(&expr).unwrap_err());
    assert_eq!(error.inner[0].kind, crate::ErrorKind::Type);
    assert_snapshot!(
        error.inner[0].reason,
        @"field 'x' was already used in this projection"
    );
}

#[test]
fn projecting_a_function_is_a_type_error() {
    let mut interp = interp_with_p();
    let expr = Expr::name("count").project(vec![NamedField::unnamed(Expr::name("x"))]);
    let error = crate::error::downcast(interp.evaluate(&expr).unwrap_err());
    assert_eq!(error.inner[0].kind, crate::ErrorKind::Type);
}

#[test]
fn repeat_renders_with_the_sqlite_idiom() {
    let mut interp = interp_with_p();
    let expr = Expr::name("P").project(vec![NamedField::named(
        "banner",
        Expr::name("name").binop(BinOp::Mul, Expr::int(3)),
    )]);
    assert_snapshot!(
        compile(&mut interp, &expr),
        @r###"SELECT replace(hex(zeroblob(?)), '00', "name") AS "banner" FROM "P""###
    );
}

#[test]
fn alias_names_in_a_query_are_distinct() {
    let mut interp = interp_with_p();
    // Two lists in one expression get distinct hoisted aliases.
    let lhs = Expr::list(vec![Expr::int(1)]);
    let rhs = Expr::list(vec![Expr::int(2)]);
    let expr = lhs.binop(BinOp::Add, rhs);
    let object = interp.evaluate(&expr).unwrap();
    let inst = object.as_instance().unwrap();
    let names: Vec<&str> = inst.subqueries.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names.len(), 2);
    assert_ne!(names[0], names[1]);
}
