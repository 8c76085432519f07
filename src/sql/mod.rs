//! The provider-neutral SQL intermediate representation.
//!
//! The evaluator builds these nodes; [codegen] renders them per-dialect into
//! `(sql_text, params)` pairs. Literal constants always become positional
//! parameters; [SqlExpr::Primitive] exists for internal constants that must
//! stay inline (GROUP BY ordinals).

mod codegen;
pub mod dialect;

pub use codegen::{compile, Query};
pub use dialect::Dialect;

use enum_as_inner::EnumAsInner;
use serde::{Deserialize, Serialize};

use crate::ast::{CompareOp, Literal};
use crate::types::Ty;

/// Named query fragments hoisted alongside an instance and emitted once as a
/// `WITH` prefix. Merging is a union; a repeated alias always carries the
/// same fragment (aliases are minted from a monotonic tick).
pub type Subqueries = Vec<(String, SqlExpr)>;

pub fn merge_subqueries(maps: &[&Subqueries]) -> Subqueries {
    let mut merged: Subqueries = Vec::new();
    for map in maps {
        for (name, code) in map.iter() {
            if !merged.iter().any(|(n, _)| n == name) {
                merged.push((name.clone(), code.clone()));
            }
        }
    }
    merged
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EnumAsInner)]
pub enum SqlExpr {
    Null,
    /// `*`
    All,
    /// A constant that renders as a positional parameter.
    Literal(Ty, Literal),
    /// Inline text; internal constants only.
    Primitive(Ty, String),
    Name(Ty, String),
    TableName(Ty, String),
    ColumnAlias { value: Box<SqlExpr>, alias: String },
    Select(Box<Select>),
    Compare {
        op: CompareOp,
        left: Box<SqlExpr>,
        right: Box<SqlExpr>,
    },
    IsNull { expr: Box<SqlExpr>, negated: bool },
    Arith {
        ty: Ty,
        op: ArithOp,
        left: Box<SqlExpr>,
        right: Box<SqlExpr>,
    },
    Like { expr: Box<SqlExpr>, pattern: Box<SqlExpr> },
    Not(Box<SqlExpr>),
    Neg(Box<SqlExpr>),
    Desc(Box<SqlExpr>),
    /// 1-based `substr`; bounds stay 0-based in the IR.
    StringSlice {
        expr: Box<SqlExpr>,
        start: Box<SqlExpr>,
        stop: Option<Box<SqlExpr>>,
    },
    Contains {
        negated: bool,
        elem: Box<SqlExpr>,
        list: Box<SqlExpr>,
    },
    /// Collapses a vectorized element into an array literal per dialect.
    MakeArray { ty: Ty, expr: Box<SqlExpr> },
    TableOp {
        op: SetOp,
        left: Box<SqlExpr>,
        right: Box<SqlExpr>,
    },
    Join {
        kind: JoinKind,
        left: Box<SqlExpr>,
        right: Box<SqlExpr>,
        using: String,
    },
    FuncCall { name: String, args: Vec<SqlExpr> },
    Cast { ty: Ty, expr: Box<SqlExpr> },
    Insert {
        table: String,
        columns: Vec<String>,
        source: Box<SqlExpr>,
    },
    InsertValues {
        table: String,
        columns: Vec<String>,
        values: Vec<Vec<SqlExpr>>,
    },
    Update {
        table: String,
        assignments: Vec<(String, SqlExpr)>,
        conds: Vec<SqlExpr>,
    },
    Delete { table: String, conds: Vec<SqlExpr> },
    CreateTable {
        table: String,
        columns: Vec<(String, Ty)>,
        primary_key: Vec<String>,
    },
    LastRowId,
    /// A typed placeholder surviving to the rendered text; produced when
    /// compiling below EVALUATE access.
    Parameter(Ty, String),
    RawSql { ty: Ty, text: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Select {
    pub ty: Ty,
    pub source: Option<Box<SqlExpr>>,
    /// Column aliases or raw expressions; empty means `*`.
    pub fields: Vec<SqlExpr>,
    /// WHERE conjunction.
    pub conds: Vec<SqlExpr>,
    pub group_by: Vec<SqlExpr>,
    pub order_by: Vec<SqlExpr>,
    pub limit: Option<SqlExpr>,
    pub offset: Option<SqlExpr>,
    pub distinct: bool,
}

impl Select {
    pub fn from_source(ty: Ty, source: SqlExpr) -> Self {
        Select {
            ty,
            source: Some(Box::new(source)),
            fields: vec![],
            conds: vec![],
            group_by: vec![],
            order_by: vec![],
            limit: None,
            offset: None,
            distinct: false,
        }
    }
}

impl From<Select> for SqlExpr {
    fn from(select: Select) -> Self {
        SqlExpr::Select(Box::new(select))
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum ArithOp {
    #[strum(to_string = "+")]
    Add,
    #[strum(to_string = "-")]
    Sub,
    #[strum(to_string = "*")]
    Mul,
    #[strum(to_string = "/")]
    Div,
    #[strum(to_string = "/~")]
    FloorDiv,
    #[strum(to_string = "||")]
    Concat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum SetOp {
    #[strum(to_string = "UNION ALL")]
    UnionAll,
    #[strum(to_string = "UNION")]
    Union,
    #[strum(to_string = "INTERSECT")]
    Intersect,
    #[strum(to_string = "EXCEPT")]
    Except,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinKind {
    Inner,
    Left,
}

/// `table WHERE conds`
pub fn table_selection(ty: Ty, source: SqlExpr, conds: Vec<SqlExpr>) -> SqlExpr {
    let mut select = Select::from_source(ty, source);
    select.conds = conds;
    select.into()
}

/// `table ORDER BY fields`
pub fn table_order(ty: Ty, source: SqlExpr, order_by: Vec<SqlExpr>) -> SqlExpr {
    let mut select = Select::from_source(ty, source);
    select.order_by = order_by;
    select.into()
}

/// `table LIMIT .. OFFSET ..`
pub fn table_slice(
    ty: Ty,
    source: SqlExpr,
    limit: Option<SqlExpr>,
    offset: Option<SqlExpr>,
) -> SqlExpr {
    let mut select = Select::from_source(ty, source);
    select.limit = limit;
    select.offset = offset;
    select.into()
}

/// A one-column relation of the given constant elements, as a UNION ALL
/// chain of parameterized single-row selects. Becomes the body of a hoisted
/// subquery.
pub fn create_list(list_ty: Ty, elems: Vec<SqlExpr>) -> SqlExpr {
    let selects: Vec<SqlExpr> = elems
        .into_iter()
        .map(|code| {
            Select {
                ty: list_ty.clone(),
                source: None,
                fields: vec![SqlExpr::ColumnAlias {
                    value: Box::new(code),
                    alias: "value".to_string(),
                }],
                conds: vec![],
                group_by: vec![],
                order_by: vec![],
                limit: None,
                offset: None,
                distinct: false,
            }
            .into()
        })
        .collect();

    selects
        .into_iter()
        .reduce(|left, right| SqlExpr::TableOp {
            op: SetOp::UnionAll,
            left: Box::new(left),
            right: Box::new(right),
        })
        .unwrap_or(SqlExpr::Null)
}

impl SqlExpr {
    /// Whether this node is a full statement, as opposed to an expression
    /// that must be wrapped in `SELECT` to be submitted.
    pub fn is_statement(&self) -> bool {
        matches!(
            self,
            SqlExpr::Select(_)
                | SqlExpr::TableOp { .. }
                | SqlExpr::Insert { .. }
                | SqlExpr::InsertValues { .. }
                | SqlExpr::Update { .. }
                | SqlExpr::Delete { .. }
                | SqlExpr::CreateTable { .. }
                | SqlExpr::TableName(..)
        )
    }

    /// Whether submitting this node returns rows.
    pub fn returns_rows(&self) -> bool {
        !matches!(
            self,
            SqlExpr::Insert { .. }
                | SqlExpr::InsertValues { .. }
                | SqlExpr::Update { .. }
                | SqlExpr::Delete { .. }
                | SqlExpr::CreateTable { .. }
        )
    }
}
