//! The database interface: query submission, row decoding, and schema
//! introspection.
//!
//! The SQLite driver is always available (bundled); postgres and mysql
//! connections are behind the `postgres-db` / `mysql-db` features. All three
//! dialects render unconditionally.

use log::{debug, info};

use crate::ast::Literal;
use crate::error::{Error, ErrorKind, Result};
use crate::sql::{self, Dialect, SqlExpr, Subqueries};
use crate::types::{TableTy, Ty};

/// A materialized row, keyed by the query's declared aliases, in order.
pub type Row = Vec<(String, Literal)>;

#[derive(Debug)]
pub struct Database {
    connection: Connection,
    dialect: Dialect,
    print_sql: bool,
}

#[derive(Debug)]
enum Connection {
    Sqlite(rusqlite::Connection),
    #[cfg(feature = "postgres")]
    Postgres(postgres::Client),
    #[cfg(feature = "mysql")]
    MySql(mysql::Pool),
}

impl Database {
    /// An in-memory SQLite database; the default backend for tests and
    /// embedding.
    pub fn memory() -> Result<Database, Error> {
        let conn = rusqlite::Connection::open_in_memory().map_err(connect_error)?;
        Ok(Database {
            connection: Connection::Sqlite(conn),
            dialect: Dialect::SQLite,
            print_sql: false,
        })
    }

    /// Opens a connection for a `scheme://...` URI.
    ///
    /// Supported schemes: `sqlite` (a path, or `:memory:`), `postgres` and
    /// `mysql` (when their driver features are compiled in).
    pub fn open(uri: &str, print_sql: bool) -> Result<Database, Error> {
        let (scheme, rest) = uri.split_once("://").ok_or_else(|| {
            Error::new(ErrorKind::Value, format!("bad value for uri: {uri}"))
        })?;
        info!("connecting to {scheme} database");
        let db = match scheme {
            "sqlite" => {
                // `sqlite:///abs/path` and `sqlite://rel.db` both work; the
                // path after the authority separator is taken verbatim.
                let path = if rest.is_empty() { ":memory:" } else { rest };
                let conn = if path == ":memory:" {
                    rusqlite::Connection::open_in_memory()
                } else {
                    rusqlite::Connection::open(path)
                }
                .map_err(connect_error)?;
                Database {
                    connection: Connection::Sqlite(conn),
                    dialect: Dialect::SQLite,
                    print_sql,
                }
            }
            #[cfg(feature = "postgres")]
            "postgres" => {
                let client =
                    postgres::Client::connect(uri, postgres::NoTls).map_err(connect_error)?;
                Database {
                    connection: Connection::Postgres(client),
                    dialect: Dialect::Postgres,
                    print_sql,
                }
            }
            #[cfg(feature = "mysql")]
            "mysql" => {
                let pool = mysql::Pool::new(uri).map_err(connect_error)?;
                Database {
                    connection: Connection::MySql(pool),
                    dialect: Dialect::MySql,
                    print_sql,
                }
            }
            other => {
                return Err(Error::new(
                    ErrorKind::NotImplemented,
                    format!("scheme '{other}' currently not supported"),
                ))
            }
        };
        Ok(db)
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Renders and submits `code` (with its hoisted subqueries); returns the
    /// materialized rows for row-returning statements, an empty vec
    /// otherwise.
    pub fn query(&mut self, code: &SqlExpr, subqueries: &Subqueries) -> Result<Vec<Row>> {
        let query = sql::compile(code, subqueries, self.dialect)?;
        self.echo(&query.text);

        let returns_rows = code.returns_rows();
        match &mut self.connection {
            Connection::Sqlite(conn) => {
                sqlite_query(conn, &query.text, &query.params, returns_rows)
            }
            #[cfg(feature = "postgres")]
            Connection::Postgres(client) => {
                pg::query(client, &query.text, &query.params, returns_rows)
            }
            #[cfg(feature = "mysql")]
            Connection::MySql(pool) => my::query(pool, &query.text, &query.params, returns_rows),
        }
    }

    /// The id generated by the last insert on this connection.
    pub fn last_row_id(&mut self) -> Result<i64> {
        match &mut self.connection {
            Connection::Sqlite(conn) => Ok(conn.last_insert_rowid()),
            #[cfg(feature = "postgres")]
            Connection::Postgres(client) => {
                let q = sql::compile(&SqlExpr::LastRowId, &vec![], Dialect::Postgres)?;
                first_int(pg::query(client, &q.text, &q.params, true)?)
            }
            #[cfg(feature = "mysql")]
            Connection::MySql(pool) => {
                let q = sql::compile(&SqlExpr::LastRowId, &vec![], Dialect::MySql)?;
                first_int(my::query(pool, &q.text, &q.params, true)?)
            }
        }
    }

    pub fn list_tables(&mut self) -> Result<Vec<String>> {
        match &mut self.connection {
            Connection::Sqlite(conn) => {
                let rows = sqlite_query(
                    conn,
                    "SELECT name FROM sqlite_master WHERE type = 'table' \
                     AND name NOT LIKE 'sqlite_%' ORDER BY name",
                    &[],
                    true,
                )?;
                Ok(rows
                    .into_iter()
                    .filter_map(|row| match row.into_iter().next() {
                        Some((_, Literal::String(name))) => Some(name),
                        _ => None,
                    })
                    .collect())
            }
            #[cfg(feature = "postgres")]
            Connection::Postgres(client) => {
                let rows = pg::query(
                    client,
                    "SELECT table_name FROM information_schema.tables \
                     WHERE table_schema = 'public' ORDER BY table_name",
                    &[],
                    true,
                )?;
                Ok(rows
                    .into_iter()
                    .filter_map(|row| match row.into_iter().next() {
                        Some((_, Literal::String(name))) => Some(name),
                        _ => None,
                    })
                    .collect())
            }
            #[cfg(feature = "mysql")]
            Connection::MySql(pool) => {
                let rows = my::query(pool, "SHOW TABLES", &[], true)?;
                Ok(rows
                    .into_iter()
                    .filter_map(|row| match row.into_iter().next() {
                        Some((_, Literal::String(name))) => Some(name),
                        _ => None,
                    })
                    .collect())
            }
        }
    }

    /// Schema namespaces visible on this connection. SQLite has a single,
    /// unnamed one.
    pub fn list_namespaces(&mut self) -> Result<Vec<String>> {
        match &mut self.connection {
            Connection::Sqlite(_) => Ok(vec![String::new()]),
            #[cfg(feature = "postgres")]
            Connection::Postgres(client) => {
                let rows = pg::query(
                    client,
                    "SELECT schema_name FROM information_schema.schemata",
                    &[],
                    true,
                )?;
                Ok(rows
                    .into_iter()
                    .filter_map(|row| match row.into_iter().next() {
                        Some((_, Literal::String(name))) => Some(name),
                        _ => None,
                    })
                    .collect())
            }
            #[cfg(feature = "mysql")]
            Connection::MySql(_) => Ok(vec![String::new()]),
        }
    }

    /// Reads back table shapes as types: `(namespace, table_name, type)`.
    pub fn import_table_types(&mut self) -> Result<Vec<(String, String, TableTy)>> {
        let names = self.list_tables()?;
        let mut types = Vec::with_capacity(names.len());
        for name in names {
            let table = self.introspect_table(&name)?;
            types.push((String::new(), name, table));
        }
        Ok(types)
    }

    fn introspect_table(&mut self, name: &str) -> Result<TableTy> {
        match &mut self.connection {
            Connection::Sqlite(conn) => {
                let rows = sqlite_query(
                    conn,
                    // Identifiers cannot be parameterized; quote by hand.
                    &format!("PRAGMA table_info(\"{}\")", name.replace('"', "\"\"")),
                    &[],
                    true,
                )?;
                let mut columns = Vec::new();
                let mut primary_key = Vec::new();
                for row in rows {
                    let col_name = match row.iter().find(|(n, _)| n == "name") {
                        Some((_, Literal::String(s))) => s.clone(),
                        _ => continue,
                    };
                    let decl = match row.iter().find(|(n, _)| n == "type") {
                        Some((_, Literal::String(s))) => s.clone(),
                        _ => String::new(),
                    };
                    if let Some((_, Literal::Int(pk))) = row.iter().find(|(n, _)| n == "pk") {
                        if *pk > 0 {
                            primary_key.push(col_name.clone());
                        }
                    }
                    columns.push((col_name, decl_to_ty(&decl)));
                }
                let mut table = TableTy::stored(name, columns);
                table.primary_key = primary_key;
                Ok(table)
            }
            #[cfg(feature = "postgres")]
            Connection::Postgres(client) => {
                let rows = pg::query(
                    client,
                    &format!(
                        "SELECT column_name, data_type FROM information_schema.columns \
                         WHERE table_name = '{}' ORDER BY ordinal_position",
                        name.replace('\'', "''")
                    ),
                    &[],
                    true,
                )?;
                let columns = rows
                    .into_iter()
                    .filter_map(|row| {
                        let mut iter = row.into_iter();
                        match (iter.next(), iter.next()) {
                            (
                                Some((_, Literal::String(col))),
                                Some((_, Literal::String(decl))),
                            ) => Some((col, decl_to_ty(&decl))),
                            _ => None,
                        }
                    })
                    .collect();
                Ok(TableTy::stored(name, columns))
            }
            #[cfg(feature = "mysql")]
            Connection::MySql(pool) => {
                let rows = my::query(
                    pool,
                    &format!("DESCRIBE `{}`", name.replace('`', "``")),
                    &[],
                    true,
                )?;
                let columns = rows
                    .into_iter()
                    .filter_map(|row| {
                        let mut iter = row.into_iter();
                        match (iter.next(), iter.next()) {
                            (
                                Some((_, Literal::String(col))),
                                Some((_, Literal::String(decl))),
                            ) => Some((col, decl_to_ty(&decl))),
                            _ => None,
                        }
                    })
                    .collect();
                Ok(TableTy::stored(name, columns))
            }
        }
    }

    fn echo(&self, text: &str) {
        let pretty = sqlformat::format(
            text,
            &sqlformat::QueryParams::None,
            sqlformat::FormatOptions::default(),
        );
        if self.print_sql {
            info!("submitting:\n{pretty}");
        } else {
            debug!("submitting:\n{pretty}");
        }
    }
}

/// Maps a column declaration from introspection onto the lattice.
fn decl_to_ty(decl: &str) -> Ty {
    let decl = decl.to_ascii_uppercase();
    if decl.contains("INT") {
        Ty::int()
    } else if decl.contains("REAL") || decl.contains("FLOA") || decl.contains("DOUB") {
        Ty::float()
    } else if decl.contains("BOOL") {
        Ty::bool()
    } else {
        Ty::string()
    }
}

#[cfg(any(feature = "postgres", feature = "mysql"))]
fn first_int(rows: Vec<Row>) -> Result<i64> {
    match rows.first().and_then(|r| r.first()) {
        Some((_, Literal::Int(id))) => Ok(*id),
        _ => Err(Error::new(ErrorKind::DatabaseQuery, "backend returned no last row id").into()),
    }
}

fn connect_error<E: std::fmt::Display>(e: E) -> Error {
    Error::new(ErrorKind::DatabaseConnect, format!("{e}"))
}

fn query_error<E: std::fmt::Display>(e: E, sql: &str) -> Error {
    let snippet: String = sql.chars().take(120).collect();
    Error::new(ErrorKind::DatabaseQuery, format!("{e}")).with_help(format!("in query: {snippet}"))
}

fn sqlite_query(
    conn: &mut rusqlite::Connection,
    text: &str,
    params: &[Literal],
    returns_rows: bool,
) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare(text).map_err(|e| query_error(e, text))?;
    let params = rusqlite::params_from_iter(params.iter().map(sqlite_value));

    if !returns_rows {
        stmt.execute(params).map_err(|e| query_error(e, text))?;
        return Ok(vec![]);
    }

    let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let mut rows = stmt.query(params).map_err(|e| query_error(e, text))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(|e| query_error(e, text))? {
        let mut columns = Vec::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            let value = match row.get_ref(i).map_err(|e| query_error(e, text))? {
                rusqlite::types::ValueRef::Null => Literal::Null,
                rusqlite::types::ValueRef::Integer(v) => Literal::Int(v),
                rusqlite::types::ValueRef::Real(v) => Literal::Float(v),
                rusqlite::types::ValueRef::Text(v) => {
                    Literal::String(String::from_utf8_lossy(v).into_owned())
                }
                rusqlite::types::ValueRef::Blob(v) => {
                    Literal::String(String::from_utf8_lossy(v).into_owned())
                }
            };
            columns.push((name.clone(), value));
        }
        out.push(columns);
    }
    Ok(out)
}

fn sqlite_value(literal: &Literal) -> rusqlite::types::Value {
    match literal {
        Literal::Null => rusqlite::types::Value::Null,
        Literal::Int(v) => rusqlite::types::Value::Integer(*v),
        Literal::Float(v) => rusqlite::types::Value::Real(*v),
        Literal::Bool(v) => rusqlite::types::Value::Integer(i64::from(*v)),
        Literal::String(v) => rusqlite::types::Value::Text(v.clone()),
    }
}

#[cfg(feature = "postgres")]
mod pg {
    use super::{query_error, Literal, Result, Row};
    use postgres::types::Type;

    pub fn query(
        client: &mut postgres::Client,
        text: &str,
        params: &[Literal],
        returns_rows: bool,
    ) -> Result<Vec<Row>> {
        let mut owned: Vec<Box<dyn postgres::types::ToSql + Sync>> = Vec::new();
        for p in params {
            owned.push(match p {
                Literal::Null => Box::new(Option::<i64>::None),
                Literal::Int(v) => Box::new(*v),
                Literal::Float(v) => Box::new(*v),
                Literal::Bool(v) => Box::new(*v),
                Literal::String(v) => Box::new(v.clone()),
            });
        }
        let refs: Vec<&(dyn postgres::types::ToSql + Sync)> =
            owned.iter().map(|b| b.as_ref()).collect();

        if !returns_rows {
            client
                .execute(text, &refs)
                .map_err(|e| query_error(e, text))?;
            return Ok(vec![]);
        }

        let rows = client
            .query(text, &refs)
            .map_err(|e| query_error(e, text))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut columns = Vec::with_capacity(row.len());
            for (i, col) in row.columns().iter().enumerate() {
                let value = match col.type_() {
                    &Type::BOOL => row
                        .try_get::<usize, Option<bool>>(i)
                        .map_err(|e| query_error(e, text))?
                        .map(Literal::Bool),
                    &Type::INT2 => row
                        .try_get::<usize, Option<i16>>(i)
                        .map_err(|e| query_error(e, text))?
                        .map(|v| Literal::Int(v as i64)),
                    &Type::INT4 => row
                        .try_get::<usize, Option<i32>>(i)
                        .map_err(|e| query_error(e, text))?
                        .map(|v| Literal::Int(v as i64)),
                    &Type::INT8 => row
                        .try_get::<usize, Option<i64>>(i)
                        .map_err(|e| query_error(e, text))?
                        .map(Literal::Int),
                    &Type::FLOAT4 => row
                        .try_get::<usize, Option<f32>>(i)
                        .map_err(|e| query_error(e, text))?
                        .map(|v| Literal::Float(v as f64)),
                    &Type::FLOAT8 => row
                        .try_get::<usize, Option<f64>>(i)
                        .map_err(|e| query_error(e, text))?
                        .map(Literal::Float),
                    _ => row
                        .try_get::<usize, Option<String>>(i)
                        .map_err(|e| query_error(e, text))?
                        .map(Literal::String),
                }
                .unwrap_or(Literal::Null);
                columns.push((col.name().to_string(), value));
            }
            out.push(columns);
        }
        Ok(out)
    }
}

#[cfg(feature = "mysql")]
mod my {
    use super::{query_error, Literal, Result, Row};
    use mysql::prelude::Queryable;

    pub fn query(
        pool: &mut mysql::Pool,
        text: &str,
        params: &[Literal],
        returns_rows: bool,
    ) -> Result<Vec<Row>> {
        let mut conn = pool.get_conn().map_err(|e| query_error(e, text))?;
        let values: Vec<mysql::Value> = params
            .iter()
            .map(|p| match p {
                Literal::Null => mysql::Value::NULL,
                Literal::Int(v) => mysql::Value::Int(*v),
                Literal::Float(v) => mysql::Value::Double(*v),
                Literal::Bool(v) => mysql::Value::Int(i64::from(*v)),
                Literal::String(v) => mysql::Value::Bytes(v.clone().into_bytes()),
            })
            .collect();
        let params = if values.is_empty() {
            mysql::Params::Empty
        } else {
            mysql::Params::Positional(values)
        };

        let result: Vec<mysql::Row> = conn
            .exec(text, params)
            .map_err(|e| query_error(e, text))?;
        if !returns_rows {
            return Ok(vec![]);
        }

        let mut out = Vec::with_capacity(result.len());
        for row in result {
            let names: Vec<String> = row
                .columns_ref()
                .iter()
                .map(|c| c.name_str().into_owned())
                .collect();
            let mut columns = Vec::with_capacity(names.len());
            for (i, name) in names.iter().enumerate() {
                let value = match row.as_ref(i) {
                    Some(mysql::Value::NULL) | None => Literal::Null,
                    Some(mysql::Value::Int(v)) => Literal::Int(*v),
                    Some(mysql::Value::UInt(v)) => Literal::Int(*v as i64),
                    Some(mysql::Value::Float(v)) => Literal::Float(*v as f64),
                    Some(mysql::Value::Double(v)) => Literal::Float(*v),
                    Some(mysql::Value::Bytes(v)) => {
                        Literal::String(String::from_utf8_lossy(v).into_owned())
                    }
                    Some(other) => Literal::String(format!("{other:?}")),
                };
                columns.push((name.clone(), value));
            }
            out.push(columns);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::Select;

    #[test]
    fn create_insert_and_read_back() {
        let mut db = Database::memory().unwrap();
        let table = TableTy::stored(
            "P",
            vec![
                ("id".to_string(), Ty::int()),
                ("name".to_string(), Ty::string()),
            ],
        );
        db.query(
            &SqlExpr::CreateTable {
                table: "P".to_string(),
                columns: table.columns.clone(),
                primary_key: table.primary_key.clone(),
            },
            &vec![],
        )
        .unwrap();
        db.query(
            &SqlExpr::InsertValues {
                table: "P".to_string(),
                columns: vec!["name".to_string()],
                values: vec![vec![SqlExpr::Literal(
                    Ty::string(),
                    Literal::String("Ada".to_string()),
                )]],
            },
            &vec![],
        )
        .unwrap();
        assert_eq!(db.last_row_id().unwrap(), 1);

        let select: SqlExpr = Select::from_source(
            Ty::table(table.clone()),
            SqlExpr::TableName(Ty::table(table), "P".to_string()),
        )
        .into();
        let rows = db.query(&select, &vec![]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][1], ("name".to_string(), Literal::String("Ada".to_string())));
    }

    #[test]
    fn introspection_reads_table_types() {
        let mut db = Database::memory().unwrap();
        db.query(
            &SqlExpr::CreateTable {
                table: "books".to_string(),
                columns: vec![
                    ("id".to_string(), Ty::int()),
                    ("title".to_string(), Ty::string()),
                    ("rating".to_string(), Ty::float()),
                ],
                primary_key: vec!["id".to_string()],
            },
            &vec![],
        )
        .unwrap();

        assert_eq!(db.list_tables().unwrap(), vec!["books".to_string()]);
        let types = db.import_table_types().unwrap();
        assert_eq!(types.len(), 1);
        let (_, name, table) = &types[0];
        assert_eq!(name, "books");
        assert_eq!(table.column("title"), Some(&Ty::string()));
        assert_eq!(table.column("rating"), Some(&Ty::float()));
        assert_eq!(table.primary_key, vec!["id".to_string()]);
    }

    #[test]
    fn bad_uri_is_a_value_error() {
        let err = Database::open("not-a-uri", false).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Value);
        let err = Database::open("voltdb://x", false).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotImplemented);
    }

    #[test]
    fn query_errors_carry_the_sql() {
        let mut db = Database::memory().unwrap();
        let err = db
            .query(
                &SqlExpr::TableName(Ty::collection(), "missing".to_string()),
                &vec![],
            )
            .unwrap_err();
        let err = crate::error::downcast(err);
        assert_eq!(err.inner[0].kind, ErrorKind::DatabaseQuery);
        assert!(err.inner[0].hint.as_deref().unwrap().contains("missing"));
    }
}
