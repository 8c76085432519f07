//! End-to-end scenarios against an in-memory SQLite database.
//!
//! These drive the whole pipeline: AST -> evaluator -> SQL IR -> renderer ->
//! rusqlite -> localized host values.

use relq::ast::{
    BinOp, ColumnDef, CompareOp, Expr, ExprKind, FuncBody, FuncDef, Literal, NamedField, ParamDef,
    Stmt, StmtKind,
};
use relq::interpreter::Interpreter;
use relq::{ErrorKind, LocalValue, Object};

fn table_def(name: &str, columns: &[(&str, &str)]) -> Stmt {
    Stmt::new(StmtKind::TableDef {
        name: name.to_string(),
        columns: columns
            .iter()
            .map(|(n, ty)| ColumnDef {
                name: n.to_string(),
                type_expr: Expr::name(*ty),
            })
            .collect(),
    })
}

fn new_row(table: &str, args: Vec<Expr>) -> Expr {
    Expr::new(ExprKind::New {
        type_name: table.to_string(),
        args: args.into_iter().map(NamedField::unnamed).collect(),
    })
}

/// `table P { name: string, age: int }` with Ada (40) and Al (12) inserted.
fn people() -> Interpreter {
    let mut interp = Interpreter::in_memory().unwrap();
    interp
        .execute(&table_def("P", &[("name", "string"), ("age", "int")]))
        .unwrap();
    interp
        .execute(&Stmt::expr(new_row(
            "P",
            vec![Expr::string("Ada"), Expr::int(40)],
        )))
        .unwrap();
    interp
        .execute(&Stmt::expr(new_row(
            "P",
            vec![Expr::string("Al"), Expr::int(12)],
        )))
        .unwrap();
    interp
}

fn rows_of(interp: &mut Interpreter, expr: &Expr) -> Vec<Vec<(String, Literal)>> {
    let object = interp.evaluate(expr).unwrap();
    match interp.localize(&object).unwrap() {
        LocalValue::Rows(rows) => rows,
        other => panic!("expected rows, got {other}"),
    }
}

fn values_of(interp: &mut Interpreter, expr: &Expr) -> Vec<Literal> {
    let object = interp.evaluate(expr).unwrap();
    match interp.localize(&object).unwrap() {
        LocalValue::Values(values) => values,
        other => panic!("expected a list, got {other}"),
    }
}

fn value_of(interp: &mut Interpreter, expr: &Expr) -> Literal {
    let object = interp.evaluate(expr).unwrap();
    match interp.localize(&object).unwrap() {
        LocalValue::Value(value) => value,
        other => panic!("expected a value, got {other}"),
    }
}

#[test]
fn scenario_insert_order_project() {
    let mut interp = people();
    // P order{age} {name}
    let expr = Expr::name("P")
        .order(vec![Expr::name("age")])
        .project(vec![NamedField::unnamed(Expr::name("name"))]);
    let rows = rows_of(&mut interp, &expr);
    assert_eq!(
        rows,
        vec![
            vec![("name".to_string(), Literal::String("Al".to_string()))],
            vec![("name".to_string(), Literal::String("Ada".to_string()))],
        ]
    );
}

#[test]
fn scenario_list_slice() {
    let mut interp = Interpreter::in_memory().unwrap();
    let expr = Expr::list(vec![
        Expr::int(1),
        Expr::int(2),
        Expr::int(3),
        Expr::int(4),
        Expr::int(5),
    ])
    .slice(Some(Expr::int(2)), Some(Expr::int(4)));
    assert_eq!(
        values_of(&mut interp, &expr),
        vec![Literal::Int(3), Literal::Int(4)]
    );
}

#[test]
fn scenario_selection_with_computed_field() {
    let mut interp = people();
    // P[age > 18] { name, age*2 }
    let expr = Expr::name("P")
        .select(vec![Expr::name("age").compare(CompareOp::Gt, Expr::int(18))])
        .project(vec![
            NamedField::unnamed(Expr::name("name")),
            NamedField::unnamed(Expr::name("age").binop(BinOp::Mul, Expr::int(2))),
        ]);
    let rows = rows_of(&mut interp, &expr);
    assert_eq!(
        rows,
        vec![vec![
            ("name".to_string(), Literal::String("Ada".to_string())),
            ("_".to_string(), Literal::Int(80)),
        ]]
    );
}

#[test]
fn scenario_group_by_with_count() {
    let mut interp = people();
    // P { age => count() }
    let expr = Expr::name("P").group(
        vec![NamedField::unnamed(Expr::name("age"))],
        vec![NamedField::unnamed(Expr::name("count").call(vec![]))],
    );
    let mut rows = rows_of(&mut interp, &expr);
    rows.sort_by_key(|row| match &row[0].1 {
        Literal::Int(age) => *age,
        _ => 0,
    });
    assert_eq!(
        rows,
        vec![
            vec![
                ("age".to_string(), Literal::Int(12)),
                ("count".to_string(), Literal::Int(1)),
            ],
            vec![
                ("age".to_string(), Literal::Int(40)),
                ("count".to_string(), Literal::Int(1)),
            ],
        ]
    );
}

#[test]
fn scenario_function_call_and_call_site_type_error() {
    let mut interp = Interpreter::in_memory().unwrap();
    // func f(x: int) = x + 1
    interp
        .execute(&Stmt::new(StmtKind::FuncDef(FuncDef {
            name: "f".to_string(),
            params: vec![ParamDef::new("x")],
            param_collector: None,
            body: FuncBody::Expr(Box::new(Expr::name("x").binop(BinOp::Add, Expr::int(1)))),
        })))
        .unwrap();

    let call = Expr::name("f").call(vec![NamedField::unnamed(Expr::int(41))]);
    assert_eq!(value_of(&mut interp, &call), Literal::Int(42));

    let bad = Expr::name("f").call(vec![NamedField::unnamed(Expr::string("x"))]);
    let error = relq::downcast(interp.evaluate(&bad).unwrap_err());
    assert_eq!(error.inner[0].kind, ErrorKind::Type);
    assert!(
        error.inner[0].reason.contains("'+'") && error.inner[0].reason.contains("string"),
        "unexpected reason: {}",
        error.inner[0].reason
    );
    // The frame of the failing call survives to the message.
    assert_eq!(error.inner[0].stack, vec!["f".to_string()]);
}

#[test]
fn scenario_try_catches_matching_kind() {
    let mut interp = Interpreter::in_memory().unwrap();
    interp.state_mut().options.capture_output = true;

    let throw = Stmt::new(StmtKind::Throw {
        value: Expr::new(ExprKind::New {
            type_name: "ValueError".to_string(),
            args: vec![NamedField::unnamed(Expr::string("bad"))],
        }),
    });
    let stmt = Stmt::new(StmtKind::Try {
        block: Box::new(throw.clone()),
        catch_name: Some("e".to_string()),
        catch_expr: Expr::name("ValueError"),
        handler: Box::new(Stmt::new(StmtKind::Print {
            values: vec![Expr::string("caught")],
        })),
    });
    interp.execute(&stmt).unwrap();
    assert_eq!(interp.take_output(), vec!["caught".to_string()]);

    // A non-matching catch type re-raises.
    let stmt = Stmt::new(StmtKind::Try {
        block: Box::new(throw),
        catch_name: None,
        catch_expr: Expr::name("TypeError"),
        handler: Box::new(Stmt::new(StmtKind::Print {
            values: vec![Expr::string("caught")],
        })),
    });
    let error = relq::downcast(interp.execute(&stmt).unwrap_err());
    assert_eq!(error.inner[0].kind, ErrorKind::Value);
    assert_eq!(error.inner[0].reason, "bad");
}

#[test]
fn insert_n_rows_increases_count_by_n() {
    let mut interp = people();
    let count = Expr::name("count").call(vec![NamedField::unnamed(Expr::name("P"))]);
    assert_eq!(value_of(&mut interp, &count), Literal::Int(2));

    for (name, age) in [("Grace", 36), ("Alan", 41), ("Edsger", 72)] {
        interp
            .execute(&Stmt::expr(new_row(
                "P",
                vec![Expr::string(name), Expr::int(age)],
            )))
            .unwrap();
    }
    assert_eq!(value_of(&mut interp, &count), Literal::Int(5));
}

#[test]
fn new_returns_the_fresh_row() {
    let mut interp = people();
    let row = new_row("P", vec![Expr::string("Barbara"), Expr::int(28)]);
    let object = interp.evaluate(&row).unwrap();
    match interp.localize(&object).unwrap() {
        LocalValue::Row(fields) => {
            assert_eq!(fields[0].0, "id");
            assert_eq!(fields[0].1, Literal::Int(3));
            assert_eq!(fields[1].1, Literal::String("Barbara".to_string()));
        }
        other => panic!("expected a row, got {other}"),
    }
}

#[test]
fn select_true_is_observationally_identity() {
    let mut interp = people();
    let plain = rows_of(&mut interp, &Expr::name("P"));
    let selected = rows_of(&mut interp, &Expr::name("P").select(vec![Expr::bool(true)]));
    assert_eq!(plain, selected);
}

#[test]
fn identity_projection_is_idempotent() {
    let mut interp = people();
    let once = Expr::name("P").project(vec![
        NamedField::unnamed(Expr::name("name")),
        NamedField::unnamed(Expr::name("age")),
    ]);
    let twice = once.clone().project(vec![
        NamedField::unnamed(Expr::name("name")),
        NamedField::unnamed(Expr::name("age")),
    ]);
    similar_asserts::assert_eq!(rows_of(&mut interp, &once), rows_of(&mut interp, &twice));
}

#[test]
fn update_rewrites_matching_rows() {
    let mut interp = people();
    // P[name = "Al"] update { age: age + 1 }
    let expr = Expr::new(ExprKind::Update {
        table: Box::new(
            Expr::name("P").select(vec![
                Expr::name("name").compare(CompareOp::Eq, Expr::string("Al"))
            ]),
        ),
        fields: vec![NamedField::named(
            "age",
            Expr::name("age").binop(BinOp::Add, Expr::int(1)),
        )],
    });
    interp.evaluate(&expr).unwrap();

    let ages = rows_of(
        &mut interp,
        &Expr::name("P")
            .select(vec![
                Expr::name("name").compare(CompareOp::Eq, Expr::string("Al"))
            ])
            .project(vec![NamedField::unnamed(Expr::name("age"))]),
    );
    assert_eq!(ages, vec![vec![("age".to_string(), Literal::Int(13))]]);
}

#[test]
fn delete_returns_the_survivors() {
    let mut interp = people();
    let expr = Expr::new(ExprKind::Delete {
        table: Box::new(Expr::name("P")),
        conds: vec![Expr::name("age").compare(CompareOp::Lt, Expr::int(18))],
    });
    let survivors = interp.evaluate(&expr).unwrap();
    match interp.localize(&survivors).unwrap() {
        LocalValue::Rows(rows) => {
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0][1].1, Literal::String("Ada".to_string()));
        }
        other => panic!("expected rows, got {other}"),
    }
}

#[test]
fn insert_rows_statement_copies_a_query() {
    let mut interp = people();
    interp
        .execute(&table_def("Adults", &[("name", "string"), ("age", "int")]))
        .unwrap();
    // Adults += P[age >= 18]
    interp
        .execute(&Stmt::new(StmtKind::InsertRows {
            target: Expr::name("Adults"),
            value: Expr::name("P")
                .select(vec![Expr::name("age").compare(CompareOp::Ge, Expr::int(18))]),
        }))
        .unwrap();
    let count = Expr::name("count").call(vec![NamedField::unnamed(Expr::name("Adults"))]);
    assert_eq!(value_of(&mut interp, &count), Literal::Int(1));

    // Inserted rows got fresh ids in the target table.
    let rows = rows_of(&mut interp, &Expr::name("Adults"));
    assert_eq!(rows[0][0], ("id".to_string(), Literal::Int(1)));
}

#[test]
fn for_loop_iterates_localized_values() {
    let mut interp = Interpreter::in_memory().unwrap();
    interp.state_mut().options.capture_output = true;
    let stmt = Stmt::new(StmtKind::For {
        var: "x".to_string(),
        iterable: Expr::list(vec![Expr::int(1), Expr::int(2), Expr::int(3)]),
        body: Box::new(Stmt::new(StmtKind::Print {
            values: vec![Expr::name("x")],
        })),
    });
    interp.execute(&stmt).unwrap();
    assert_eq!(interp.take_output(), vec!["1", "2", "3"]);
}

#[test]
fn while_loop_and_assignment_terminate() {
    let mut interp = Interpreter::in_memory().unwrap();
    interp.set_var("n", Object::from_literal(Literal::Int(0)));
    let stmt = Stmt::new(StmtKind::While {
        cond: Expr::name("n").compare(CompareOp::Lt, Expr::int(4)),
        body: Box::new(Stmt::set(
            "n",
            Expr::name("n").binop(BinOp::Add, Expr::int(1)),
        )),
    });
    interp.execute(&stmt).unwrap();
    assert_eq!(value_of(&mut interp, &Expr::name("n")), Literal::Int(4));
}

#[test]
fn scopes_balance_across_failing_statements() {
    let mut interp = people();
    let depth = interp.state_mut().scope_depth();
    // Projection of an unknown column fails mid-scope.
    let bad = Expr::name("P").project(vec![NamedField::unnamed(Expr::name("salary"))]);
    let error = relq::downcast(interp.evaluate(&bad).unwrap_err());
    assert_eq!(error.inner[0].kind, ErrorKind::NameNotFound);
    assert_eq!(interp.state_mut().scope_depth(), depth);

    // The interpreter still works afterwards.
    let count = Expr::name("count").call(vec![NamedField::unnamed(Expr::name("P"))]);
    assert_eq!(value_of(&mut interp, &count), Literal::Int(2));
}

#[test]
fn set_operations_combine_lists() {
    let mut interp = Interpreter::in_memory().unwrap();
    let a = Expr::list(vec![Expr::int(1), Expr::int(2)]);
    let b = Expr::list(vec![Expr::int(2), Expr::int(3)]);

    let concat = a.clone().binop(BinOp::Add, b.clone());
    assert_eq!(
        values_of(&mut interp, &concat),
        vec![
            Literal::Int(1),
            Literal::Int(2),
            Literal::Int(2),
            Literal::Int(3)
        ]
    );

    let intersect = a.clone().binop(BinOp::Intersect, b.clone());
    assert_eq!(values_of(&mut interp, &intersect), vec![Literal::Int(2)]);

    let subtract = a.binop(BinOp::Sub, b);
    assert_eq!(values_of(&mut interp, &subtract), vec![Literal::Int(1)]);
}

#[test]
fn join_combines_tables_on_shared_column() {
    let mut interp = people();
    interp
        .execute(&table_def("Homes", &[("name", "string"), ("city", "string")]))
        .unwrap();
    interp
        .execute(&Stmt::expr(new_row(
            "Homes",
            vec![Expr::string("Ada"), Expr::string("London")],
        )))
        .unwrap();

    let expr = Expr::name("join").call(vec![
        NamedField::named("a", Expr::name("P")),
        NamedField::named("b", Expr::name("Homes")),
    ]);
    let rows = rows_of(&mut interp, &expr);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][0].1, Literal::String("Ada".to_string()));
    assert_eq!(rows[0][2].1, Literal::String("London".to_string()));
}

#[test]
fn one_materializes_a_single_row() {
    let mut interp = people();
    let one = Expr::new(ExprKind::One {
        expr: Box::new(
            Expr::name("P").select(vec![
                Expr::name("name").compare(CompareOp::Eq, Expr::string("Ada"))
            ]),
        ),
        nullable: false,
    });
    let object = interp.evaluate(&one).unwrap();
    let row = object.as_instance().unwrap();
    // Row attributes are addressable.
    let age = row.get_attr("age").unwrap();
    match interp.localize(&age).unwrap() {
        LocalValue::Value(v) => assert_eq!(v, Literal::Int(40)),
        other => panic!("expected a value, got {other}"),
    }

    // Zero rows is a ValueError unless nullable.
    let none = Expr::new(ExprKind::One {
        expr: Box::new(
            Expr::name("P").select(vec![
                Expr::name("name").compare(CompareOp::Eq, Expr::string("Nobody"))
            ]),
        ),
        nullable: false,
    });
    let error = relq::downcast(interp.evaluate(&none).unwrap_err());
    assert_eq!(error.inner[0].kind, ErrorKind::Value);
}

#[test]
fn import_binds_a_module_namespace() {
    let mut interp = Interpreter::in_memory().unwrap();
    interp.register_module(
        "mathlib",
        vec![Stmt::set("answer", Expr::int(42))],
    );
    interp
        .execute(&Stmt::new(StmtKind::Import {
            module: "mathlib".to_string(),
            as_name: None,
        }))
        .unwrap();
    let attr = Expr::name("mathlib").attr("answer");
    assert_eq!(value_of(&mut interp, &attr), Literal::Int(42));
}

#[test]
fn load_all_tables_binds_preexisting_schema() {
    use relq::db::Database;
    use relq::Options;

    let path = std::env::temp_dir().join(format!(
        "relq_load_tables_{}.db",
        std::process::id()
    ));
    let _ = std::fs::remove_file(&path);
    let uri = format!("sqlite://{}", path.display());

    {
        let db = Database::open(&uri, false).unwrap();
        let mut interp = Interpreter::new(db, Options::default());
        interp
            .execute(&table_def("books", &[("title", "string")]))
            .unwrap();
        interp
            .execute(&Stmt::expr(new_row("books", vec![Expr::string("SICP")])))
            .unwrap();
    }

    // A fresh interpreter over the same file discovers the table.
    let db = Database::open(&uri, false).unwrap();
    let mut interp = Interpreter::new(db, Options::default());
    assert!(!interp.has_var("books"));
    interp.load_all_tables().unwrap();
    let count = Expr::name("count").call(vec![NamedField::unnamed(Expr::name("books"))]);
    assert_eq!(value_of(&mut interp, &count), Literal::Int(1));

    let _ = std::fs::remove_file(&path);
}

#[test]
fn or_returns_last_inspected_when_all_falsy() {
    let mut interp = Interpreter::in_memory().unwrap();
    let expr = Expr::new(ExprKind::Or(vec![
        Expr::int(0),
        Expr::string(""),
    ]));
    assert_eq!(value_of(&mut interp, &expr), Literal::String(String::new()));

    let expr = Expr::new(ExprKind::Or(vec![Expr::int(0), Expr::int(7), Expr::int(9)]));
    assert_eq!(value_of(&mut interp, &expr), Literal::Int(7));
}

#[test]
fn string_slice_and_repeat() {
    let mut interp = Interpreter::in_memory().unwrap();
    let expr = Expr::string("interpreter").slice(Some(Expr::int(0)), Some(Expr::int(5)));
    assert_eq!(
        value_of(&mut interp, &expr),
        Literal::String("inter".to_string())
    );

    let expr = Expr::string("ab").binop(BinOp::Mul, Expr::int(3));
    assert_eq!(
        value_of(&mut interp, &expr),
        Literal::String("ababab".to_string())
    );
}

#[test]
fn contains_checks_element_types() {
    let mut interp = Interpreter::in_memory().unwrap();
    let expr = Expr::int(3).compare(
        CompareOp::In,
        Expr::list(vec![Expr::int(1), Expr::int(3)]),
    );
    assert_eq!(value_of(&mut interp, &expr), Literal::Int(1));

    let mismatched = Expr::string("x").compare(
        CompareOp::In,
        Expr::list(vec![Expr::int(1), Expr::int(3)]),
    );
    let error = relq::downcast(interp.evaluate(&mismatched).unwrap_err());
    assert_eq!(error.inner[0].kind, ErrorKind::Type);
}
