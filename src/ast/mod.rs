//! The abstract syntax tree the interpreter consumes.
//!
//! The grammar and parser live outside this crate; a front end produces
//! these nodes (with source spans attached) and hands them to
//! [crate::interpreter::Interpreter]. The constructors on [Expr] and [Stmt]
//! exist for front ends and for embedding programs built in Rust.

use enum_as_inner::EnumAsInner;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

use crate::error::Span;
use crate::types::Ty;
use crate::utils::OrMap;

/// A constant value, both in source programs and in materialized rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EnumAsInner)]
pub enum Literal {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
}

impl Display for Literal {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Null => write!(f, "null"),
            Literal::Int(i) => write!(f, "{i}"),
            Literal::Float(v) => write!(f, "{v}"),
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::String(s) => write!(f, "\"{s}\""),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    #[serde(flatten)]
    pub kind: ExprKind,
    #[serde(skip)]
    pub span: Option<Span>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EnumAsInner)]
pub enum ExprKind {
    /// Reference to a bound object (table, instance, type, function, ...).
    Name(String),
    Const(Literal),
    /// Attribute access, usually a column or a struct field.
    Attr { expr: Box<Expr>, name: String },
    /// A typed placeholder; compiles to a SQL parameter at COMPILE access.
    Parameter { name: String, ty: Ty },
    FuncCall { func: Box<Expr>, args: Vec<NamedField> },
    BinOp { op: BinOp, left: Box<Expr>, right: Box<Expr> },
    Compare { op: CompareOp, left: Box<Expr>, right: Box<Expr> },
    Like { expr: Box<Expr>, pattern: Box<Expr> },
    Not(Box<Expr>),
    Neg(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    List(Vec<Expr>),
    /// A row literal; field names default to automatic names.
    Dict(Vec<(Option<String>, Expr)>),
    /// `...` inside a projection: every column not named and not excluded.
    Ellipsis { exclude: Vec<String> },

    // Table operations
    Projection {
        table: Box<Expr>,
        fields: Vec<NamedField>,
        groupby: bool,
        agg_fields: Vec<NamedField>,
    },
    Selection { table: Box<Expr>, conds: Vec<Expr> },
    Order { table: Box<Expr>, fields: Vec<Expr> },
    Desc(Box<Expr>),
    Slice {
        expr: Box<Expr>,
        start: Option<Box<Expr>>,
        stop: Option<Box<Expr>>,
    },
    Update { table: Box<Expr>, fields: Vec<NamedField> },
    Delete { table: Box<Expr>, conds: Vec<Expr> },

    /// Row construction: `new P("Ada", 40)`.
    New { type_name: String, args: Vec<NamedField> },
    /// Bulk row construction from a table-shaped argument.
    NewRows { type_name: String, args: Vec<NamedField> },
    /// Materialize exactly one row; the nullable form yields null for none.
    One { expr: Box<Expr>, nullable: bool },
}

/// An optionally named expression: a projection field or a call argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedField {
    pub name: Option<String>,
    pub value: Expr,
}

impl NamedField {
    pub fn named<S: Into<String>>(name: S, value: Expr) -> Self {
        NamedField {
            name: Some(name.into()),
            value,
        }
    }

    pub fn unnamed(value: Expr) -> Self {
        NamedField { name: None, value }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum BinOp {
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
    #[strum(to_string = "&")]
    Intersect,
    #[strum(to_string = "|")]
    Union,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum CompareOp {
    #[strum(to_string = "=")]
    Eq,
    #[strum(to_string = "!=")]
    Ne,
    #[strum(to_string = "<")]
    Lt,
    #[strum(to_string = "<=")]
    Le,
    #[strum(to_string = ">")]
    Gt,
    #[strum(to_string = ">=")]
    Ge,
    #[strum(to_string = "in")]
    In,
    #[strum(to_string = "!in")]
    NotIn,
}

impl CompareOp {
    pub fn is_containment(&self) -> bool {
        matches!(self, CompareOp::In | CompareOp::NotIn)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stmt {
    #[serde(flatten)]
    pub kind: StmtKind,
    #[serde(skip)]
    pub span: Option<Span>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EnumAsInner)]
pub enum StmtKind {
    /// A bare expression; its value is the value of the statement.
    Expr(Expr),
    SetValue { target: Expr, value: Expr },
    /// `Table += rows`
    InsertRows { target: Expr, value: Expr },
    CodeBlock(Vec<Stmt>),
    If {
        cond: Expr,
        then: Box<Stmt>,
        else_: Option<Box<Stmt>>,
    },
    For { var: String, iterable: Expr, body: Box<Stmt> },
    While { cond: Expr, body: Box<Stmt> },
    Try {
        block: Box<Stmt>,
        catch_name: Option<String>,
        catch_expr: Expr,
        handler: Box<Stmt>,
    },
    Throw { value: Expr },
    Return { value: Expr },
    Print { values: Vec<Expr> },
    Assert { cond: Expr },
    TableDef { name: String, columns: Vec<ColumnDef> },
    StructDef { name: String, members: Vec<(String, Expr)> },
    FuncDef(FuncDef),
    Import { module: String, as_name: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    /// Evaluates to a type object when the table is defined.
    pub type_expr: Expr,
}

/// A user function definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuncDef {
    pub name: String,
    pub params: Vec<ParamDef>,
    /// A trailing variadic parameter absorbing unmatched keyword arguments.
    pub param_collector: Option<ParamDef>,
    pub body: FuncBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDef {
    pub name: String,
    /// Type annotation; carried for documentation and parameter compilation.
    pub ty: Option<Expr>,
    pub default: Option<Expr>,
}

impl ParamDef {
    pub fn new<S: Into<String>>(name: S) -> Self {
        ParamDef {
            name: name.into(),
            ty: None,
            default: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FuncBody {
    Expr(Box<Expr>),
    Block(Vec<Stmt>),
}

impl Expr {
    pub fn new(kind: ExprKind) -> Self {
        Expr { kind, span: None }
    }

    pub fn with_span(mut self, span: Option<Span>) -> Self {
        self.span = span;
        self
    }

    pub fn name<S: Into<String>>(name: S) -> Self {
        Expr::new(ExprKind::Name(name.into()))
    }

    pub fn null() -> Self {
        Expr::new(ExprKind::Const(Literal::Null))
    }

    pub fn int(value: i64) -> Self {
        Expr::new(ExprKind::Const(Literal::Int(value)))
    }

    pub fn float(value: f64) -> Self {
        Expr::new(ExprKind::Const(Literal::Float(value)))
    }

    pub fn bool(value: bool) -> Self {
        Expr::new(ExprKind::Const(Literal::Bool(value)))
    }

    pub fn string<S: Into<String>>(value: S) -> Self {
        Expr::new(ExprKind::Const(Literal::String(value.into())))
    }

    pub fn attr<S: Into<String>>(self, name: S) -> Self {
        Expr::new(ExprKind::Attr {
            expr: Box::new(self),
            name: name.into(),
        })
    }

    pub fn binop(self, op: BinOp, right: Expr) -> Self {
        // A compound expression spans both operands.
        let span = self.span.or_map(right.span, |a, b| a + b);
        Expr::new(ExprKind::BinOp {
            op,
            left: Box::new(self),
            right: Box::new(right),
        })
        .with_span(span)
    }

    pub fn compare(self, op: CompareOp, right: Expr) -> Self {
        let span = self.span.or_map(right.span, |a, b| a + b);
        Expr::new(ExprKind::Compare {
            op,
            left: Box::new(self),
            right: Box::new(right),
        })
        .with_span(span)
    }

    pub fn call(self, args: Vec<NamedField>) -> Self {
        Expr::new(ExprKind::FuncCall {
            func: Box::new(self),
            args,
        })
    }

    /// `table { fields }`
    pub fn project(self, fields: Vec<NamedField>) -> Self {
        Expr::new(ExprKind::Projection {
            table: Box::new(self),
            fields,
            groupby: false,
            agg_fields: vec![],
        })
    }

    /// `table { keys => aggregates }`
    pub fn group(self, fields: Vec<NamedField>, agg_fields: Vec<NamedField>) -> Self {
        Expr::new(ExprKind::Projection {
            table: Box::new(self),
            fields,
            groupby: true,
            agg_fields,
        })
    }

    /// `table [ conds ]`
    pub fn select(self, conds: Vec<Expr>) -> Self {
        Expr::new(ExprKind::Selection {
            table: Box::new(self),
            conds,
        })
    }

    /// `table order { fields }`
    pub fn order(self, fields: Vec<Expr>) -> Self {
        Expr::new(ExprKind::Order {
            table: Box::new(self),
            fields,
        })
    }

    pub fn slice(self, start: Option<Expr>, stop: Option<Expr>) -> Self {
        Expr::new(ExprKind::Slice {
            expr: Box::new(self),
            start: start.map(Box::new),
            stop: stop.map(Box::new),
        })
    }

    pub fn list(elems: Vec<Expr>) -> Self {
        Expr::new(ExprKind::List(elems))
    }
}

impl Stmt {
    pub fn new(kind: StmtKind) -> Self {
        Stmt { kind, span: None }
    }

    pub fn with_span(mut self, span: Option<Span>) -> Self {
        self.span = span;
        self
    }

    pub fn expr(expr: Expr) -> Self {
        Stmt::new(StmtKind::Expr(expr))
    }

    pub fn set<S: Into<String>>(name: S, value: Expr) -> Self {
        Stmt::new(StmtKind::SetValue {
            target: Expr::name(name),
            value,
        })
    }
}

impl From<ExprKind> for Expr {
    fn from(kind: ExprKind) -> Self {
        Expr::new(kind)
    }
}

impl From<StmtKind> for Stmt {
    fn from(kind: StmtKind) -> Self {
        Stmt::new(kind)
    }
}
