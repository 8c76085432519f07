//! Renders the SQL IR into dialect-specific text.
//!
//! Every [SqlExpr::Literal] becomes a positional parameter; the returned
//! [Query] pairs the text with the parameter values in placeholder order.
//! Hoisted subqueries are emitted once, as a `WITH` prefix, in insertion
//! order, so composed instances never re-embed their inputs.

use itertools::Itertools;

use super::dialect::{Dialect, DialectHandler};
use super::{ArithOp, Select, SqlExpr, Subqueries};
use crate::ast::{CompareOp, Literal};
use crate::error::{Error, ErrorKind, Result};
use crate::utils::NameGenerator;

/// A rendered statement: dialect text plus positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub text: String,
    pub params: Vec<Literal>,
}

pub fn compile(code: &SqlExpr, subqueries: &Subqueries, dialect: Dialect) -> Result<Query> {
    let mut renderer = Renderer::new(dialect);

    let mut text = String::new();
    if !subqueries.is_empty() {
        text.push_str("WITH ");
        for (i, (name, subquery)) in subqueries.iter().enumerate() {
            if i > 0 {
                text.push_str(", ");
            }
            let body = renderer.select_form(subquery)?;
            text.push_str(&format!("{} AS ({})", renderer.quote(name), body));
        }
        text.push(' ');
    }

    let main = match code {
        _ if code.is_select_like() => renderer.select_form(code)?,
        _ if code.is_statement() => renderer.expr(code)?,
        _ => format!("SELECT {}", renderer.expr(code)?),
    };
    text.push_str(&main);

    Ok(Query {
        text,
        params: renderer.params,
    })
}

impl SqlExpr {
    fn is_select_like(&self) -> bool {
        matches!(
            self,
            SqlExpr::Select(_) | SqlExpr::TableOp { .. } | SqlExpr::TableName(..)
        )
    }
}

struct Renderer {
    handler: Box<dyn DialectHandler>,
    params: Vec<Literal>,
    derived_aliases: NameGenerator,
}

impl Renderer {
    fn new(dialect: Dialect) -> Self {
        Renderer {
            handler: dialect.handler(),
            params: Vec::new(),
            derived_aliases: NameGenerator::new("t"),
        }
    }

    fn quote(&self, ident: &str) -> String {
        let q = self.handler.ident_quote();
        format!("{q}{ident}{q}")
    }

    fn placeholder(&mut self, value: &Literal) -> String {
        self.params.push(value.clone());
        self.handler.placeholder(self.params.len())
    }

    /// Renders `code` as an expression operand, parenthesized when compound.
    fn atom(&mut self, code: &SqlExpr) -> Result<String> {
        let text = self.expr(code)?;
        let compound = matches!(
            code,
            SqlExpr::Arith { .. }
                | SqlExpr::Compare { .. }
                | SqlExpr::IsNull { .. }
                | SqlExpr::Like { .. }
                | SqlExpr::Not(_)
                | SqlExpr::Contains { .. }
                | SqlExpr::Select(_)
                | SqlExpr::TableOp { .. }
        );
        Ok(if compound { format!("({text})") } else { text })
    }

    /// Renders `code` as a statement returning rows; bare table references
    /// become `SELECT *` scans.
    fn select_form(&mut self, code: &SqlExpr) -> Result<String> {
        match code {
            SqlExpr::Select(select) => self.select(select),
            SqlExpr::TableOp { op, left, right } => {
                let left = self.select_form(left)?;
                let right = self.select_form(right)?;
                Ok(format!("{left} {op} {right}"))
            }
            SqlExpr::TableName(_, name) | SqlExpr::Name(_, name) => {
                Ok(format!("SELECT * FROM {}", self.quote(name)))
            }
            _ => Err(Error::new(
                ErrorKind::Compile,
                format!("cannot render {code:?} as a relation"),
            )
            .into()),
        }
    }

    /// Renders `code` as a FROM item; derived tables get a fresh alias.
    fn from_item(&mut self, code: &SqlExpr) -> Result<String> {
        match code {
            SqlExpr::TableName(_, name) | SqlExpr::Name(_, name) => Ok(self.quote(name)),
            SqlExpr::Join {
                kind,
                left,
                right,
                using,
            } => {
                let keyword = match kind {
                    super::JoinKind::Inner => "JOIN",
                    super::JoinKind::Left => "LEFT JOIN",
                };
                let left = self.from_item(left)?;
                let right = self.from_item(right)?;
                let using = self.quote(using);
                Ok(format!("{left} {keyword} {right} USING ({using})"))
            }
            _ => {
                let inner = self.select_form(code)?;
                let alias = self.derived_aliases.gen();
                let alias = self.quote(&alias);
                Ok(format!("({inner}) AS {alias}"))
            }
        }
    }

    fn select(&mut self, select: &Select) -> Result<String> {
        let mut text = String::from("SELECT ");
        if select.distinct {
            text.push_str("DISTINCT ");
        }

        if select.fields.is_empty() {
            text.push('*');
        } else {
            let fields: Vec<String> = select
                .fields
                .iter()
                .map(|f| self.expr(f))
                .try_collect()?;
            text.push_str(&fields.join(", "));
        }

        if let Some(source) = &select.source {
            let from = self.from_item(source)?;
            text.push_str(&format!(" FROM {from}"));
        }

        if !select.conds.is_empty() {
            let conds: Vec<String> = select.conds.iter().map(|c| self.expr(c)).try_collect()?;
            text.push_str(&format!(" WHERE {}", conds.join(" AND ")));
        }

        if !select.group_by.is_empty() {
            let keys: Vec<String> = select.group_by.iter().map(|k| self.expr(k)).try_collect()?;
            text.push_str(&format!(" GROUP BY {}", keys.join(", ")));
        }

        if !select.order_by.is_empty() {
            let keys: Vec<String> = select.order_by.iter().map(|k| self.expr(k)).try_collect()?;
            text.push_str(&format!(" ORDER BY {}", keys.join(", ")));
        }

        match (&select.limit, &select.offset) {
            (Some(limit), offset) => {
                let limit = self.atom(limit)?;
                text.push_str(&format!(" LIMIT {limit}"));
                if let Some(offset) = offset {
                    let offset = self.atom(offset)?;
                    text.push_str(&format!(" OFFSET {offset}"));
                }
            }
            (None, Some(offset)) => {
                if let Some(filler) = self.handler.limit_for_offset_only() {
                    text.push_str(&format!(" LIMIT {filler}"));
                }
                let offset = self.atom(offset)?;
                text.push_str(&format!(" OFFSET {offset}"));
            }
            (None, None) => {}
        }

        Ok(text)
    }

    fn expr(&mut self, code: &SqlExpr) -> Result<String> {
        Ok(match code {
            SqlExpr::Null => "NULL".to_string(),
            SqlExpr::All => "*".to_string(),
            SqlExpr::Literal(_, value) => self.placeholder(value),
            SqlExpr::Primitive(_, text) => text.clone(),
            SqlExpr::Name(_, name) | SqlExpr::TableName(_, name) => self.quote(name),
            SqlExpr::ColumnAlias { value, alias } => {
                format!("{} AS {}", self.atom(value)?, self.quote(alias))
            }
            SqlExpr::Select(select) => self.select(select)?,
            SqlExpr::Compare { op, left, right } => {
                if op.is_containment() {
                    return Err(Error::new(
                        ErrorKind::Compile,
                        "containment must be lowered to Contains",
                    )
                    .into());
                }
                format!("{} {} {}", self.atom(left)?, op, self.atom(right)?)
            }
            SqlExpr::IsNull { expr, negated } => {
                let op = if *negated { "IS NOT NULL" } else { "IS NULL" };
                format!("{} {}", self.atom(expr)?, op)
            }
            SqlExpr::Arith {
                op, left, right, ..
            } => {
                let left = self.atom(left)?;
                let right = self.atom(right)?;
                match op {
                    ArithOp::Concat => self.handler.concat(&left, &right),
                    ArithOp::FloorDiv => self.handler.floor_div(&left, &right),
                    // Division always yields a float, also on integer inputs.
                    ArithOp::Div => format!("{left} * 1.0 / {right}"),
                    _ => format!("{left} {op} {right}"),
                }
            }
            SqlExpr::Like { expr, pattern } => {
                format!("{} LIKE {}", self.atom(expr)?, self.atom(pattern)?)
            }
            SqlExpr::Not(expr) => format!("NOT ({})", self.expr(expr)?),
            SqlExpr::Neg(expr) => format!("-{}", self.atom(expr)?),
            SqlExpr::Desc(expr) => format!("{} DESC", self.atom(expr)?),
            SqlExpr::StringSlice { expr, start, stop } => {
                let s = self.atom(expr)?;
                let start_pos = self.atom(start)?;
                match stop {
                    Some(stop) => {
                        let stop = self.atom(stop)?;
                        // The bound expression is rendered again for the
                        // length argument, re-binding its parameters.
                        let start_again = self.atom(start)?;
                        format!("substr({s}, {start_pos} + 1, {stop} - {start_again})")
                    }
                    None => format!("substr({s}, {start_pos} + 1)"),
                }
            }
            SqlExpr::Contains {
                negated,
                elem,
                list,
            } => {
                let elem = self.atom(elem)?;
                let list = self.select_form(list)?;
                let op = if *negated { "NOT IN" } else { "IN" };
                format!("{elem} {op} ({list})")
            }
            SqlExpr::MakeArray { expr, .. } => {
                let inner = self.expr(expr)?;
                self.handler.make_array(&inner)
            }
            SqlExpr::TableOp { .. } => self.select_form(code)?,
            SqlExpr::Join { .. } => {
                return Err(Error::new(
                    ErrorKind::Compile,
                    "a join can only appear as a query source",
                )
                .into())
            }
            SqlExpr::FuncCall { name, args } => {
                let args: Vec<String> = args.iter().map(|a| self.expr(a)).try_collect()?;
                self.handler.function(name, &args)?
            }
            SqlExpr::Cast { ty, expr } => {
                let type_name = self.handler.type_name(ty)?;
                format!("CAST({} AS {})", self.expr(expr)?, type_name)
            }
            SqlExpr::Insert {
                table,
                columns,
                source,
            } => {
                let columns = columns.iter().map(|c| self.quote(c)).join(", ");
                let source = self.select_form(source)?;
                format!("INSERT INTO {} ({}) {}", self.quote(table), columns, source)
            }
            SqlExpr::InsertValues {
                table,
                columns,
                values,
            } => {
                let columns = columns.iter().map(|c| self.quote(c)).join(", ");
                let mut rows = Vec::with_capacity(values.len());
                for row in values {
                    let row: Vec<String> = row.iter().map(|v| self.expr(v)).try_collect()?;
                    rows.push(format!("({})", row.join(", ")));
                }
                format!(
                    "INSERT INTO {} ({}) VALUES {}",
                    self.quote(table),
                    columns,
                    rows.join(", ")
                )
            }
            SqlExpr::Update {
                table,
                assignments,
                conds,
            } => {
                let mut sets = Vec::with_capacity(assignments.len());
                for (name, value) in assignments {
                    sets.push(format!("{} = {}", self.quote(name), self.expr(value)?));
                }
                let conds: Vec<String> = conds.iter().map(|c| self.expr(c)).try_collect()?;
                format!(
                    "UPDATE {} SET {} WHERE {}",
                    self.quote(table),
                    sets.join(", "),
                    conds.join(" AND ")
                )
            }
            SqlExpr::Delete { table, conds } => {
                let conds: Vec<String> = conds.iter().map(|c| self.expr(c)).try_collect()?;
                format!(
                    "DELETE FROM {} WHERE {}",
                    self.quote(table),
                    conds.join(" AND ")
                )
            }
            SqlExpr::CreateTable {
                table,
                columns,
                primary_key,
            } => {
                let mut defs = Vec::with_capacity(columns.len());
                for (name, ty) in columns {
                    if primary_key.contains(name) {
                        defs.push(format!(
                            "{} {}",
                            self.quote(name),
                            self.handler.id_column_def()
                        ));
                    } else {
                        defs.push(format!(
                            "{} {}",
                            self.quote(name),
                            self.handler.type_name(ty)?
                        ));
                    }
                }
                format!(
                    "CREATE TABLE IF NOT EXISTS {} ({})",
                    self.quote(table),
                    defs.join(", ")
                )
            }
            SqlExpr::LastRowId => self.handler.last_row_id().to_string(),
            SqlExpr::Parameter(_, name) => format!(":{name}"),
            SqlExpr::RawSql { text, .. } => text.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TableTy, Ty};
    use insta::assert_snapshot;

    fn table_p() -> SqlExpr {
        SqlExpr::TableName(
            Ty::table(TableTy::stored(
                "P",
                vec![
                    ("id".to_string(), Ty::int()),
                    ("name".to_string(), Ty::string()),
                    ("age".to_string(), Ty::int()),
                ],
            )),
            "P".to_string(),
        )
    }

    #[test]
    fn renders_selection_with_params() {
        let code = super::super::table_selection(
            Ty::collection(),
            table_p(),
            vec![SqlExpr::Compare {
                op: CompareOp::Gt,
                left: Box::new(SqlExpr::Name(Ty::int(), "age".to_string())),
                right: Box::new(SqlExpr::Literal(Ty::int(), Literal::Int(18))),
            }],
        );
        let query = compile(&code, &vec![], Dialect::SQLite).unwrap();
        assert_snapshot!(query.text, @r###"SELECT * FROM "P" WHERE "age" > ?"###);
        assert_eq!(query.params, vec![Literal::Int(18)]);
    }

    #[test]
    fn renders_offset_without_limit_per_dialect() {
        let code = super::super::table_slice(
            Ty::collection(),
            table_p(),
            None,
            Some(SqlExpr::Literal(Ty::int(), Literal::Int(2))),
        );
        let sqlite = compile(&code, &vec![], Dialect::SQLite).unwrap();
        assert_snapshot!(sqlite.text, @r###"SELECT * FROM "P" LIMIT -1 OFFSET ?"###);

        let postgres = compile(&code, &vec![], Dialect::Postgres).unwrap();
        assert_snapshot!(postgres.text, @r###"SELECT * FROM "P" OFFSET $1"###);
    }

    #[test]
    fn postgres_numbers_placeholders() {
        let code = super::super::table_selection(
            Ty::collection(),
            table_p(),
            vec![
                SqlExpr::Compare {
                    op: CompareOp::Gt,
                    left: Box::new(SqlExpr::Name(Ty::int(), "age".to_string())),
                    right: Box::new(SqlExpr::Literal(Ty::int(), Literal::Int(18))),
                },
                SqlExpr::Compare {
                    op: CompareOp::Ne,
                    left: Box::new(SqlExpr::Name(Ty::string(), "name".to_string())),
                    right: Box::new(SqlExpr::Literal(
                        Ty::string(),
                        Literal::String("Ada".to_string()),
                    )),
                },
            ],
        );
        let query = compile(&code, &vec![], Dialect::Postgres).unwrap();
        assert_snapshot!(
            query.text,
            @r###"SELECT * FROM "P" WHERE "age" > $1 AND "name" != $2"###
        );
        assert_eq!(query.params.len(), 2);
    }

    #[test]
    fn hoisted_subqueries_prefix_once() {
        let list = super::super::create_list(
            Ty::list(Ty::int()),
            vec![
                SqlExpr::Literal(Ty::int(), Literal::Int(1)),
                SqlExpr::Literal(Ty::int(), Literal::Int(2)),
            ],
        );
        let subqueries = vec![("list_1".to_string(), list)];
        let code = SqlExpr::TableName(Ty::list(Ty::int()), "list_1".to_string());
        let query = compile(&code, &subqueries, Dialect::SQLite).unwrap();
        assert_snapshot!(
            query.text,
            @r###"WITH "list_1" AS (SELECT ? AS "value" UNION ALL SELECT ? AS "value") SELECT * FROM "list_1""###
        );
        assert_eq!(query.params, vec![Literal::Int(1), Literal::Int(2)]);
    }

    #[test]
    fn mysql_quotes_with_backticks() {
        let code = table_p();
        let query = compile(&code, &vec![], Dialect::MySql).unwrap();
        assert_snapshot!(query.text, @"SELECT * FROM `P`");
    }

    #[test]
    fn create_table_uses_dialect_id_column() {
        let code = SqlExpr::CreateTable {
            table: "P".to_string(),
            columns: vec![
                ("id".to_string(), Ty::int()),
                ("name".to_string(), Ty::string()),
            ],
            primary_key: vec!["id".to_string()],
        };
        let sqlite = compile(&code, &vec![], Dialect::SQLite).unwrap();
        assert_snapshot!(
            sqlite.text,
            @r###"CREATE TABLE IF NOT EXISTS "P" ("id" INTEGER PRIMARY KEY, "name" TEXT)"###
        );
        let postgres = compile(&code, &vec![], Dialect::Postgres).unwrap();
        assert_snapshot!(
            postgres.text,
            @r###"CREATE TABLE IF NOT EXISTS "P" ("id" SERIAL PRIMARY KEY, "name" TEXT)"###
        );
    }
}
