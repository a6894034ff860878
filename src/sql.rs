use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SelectItem, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::calendar::parse_timestamp;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertReservation {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        window: Option<(Ms, Ms)>,
    },
    UpdateReservation {
        id: Ulid,
        start: Ms,
        end: Ms,
        resource_id: Option<Ulid>,
    },
    DeleteReservation {
        token: String,
    },
    SelectReservations,
    SelectCalendar {
        start: Ms,
        end: Ms,
    },
    SelectResources,
    SelectDepartmentReservations,
    SelectAllReservations {
        start: Ms,
        end: Ms,
    },
    SelectUsers,
    InsertResource {
        id: Ulid,
        room: String,
        title: String,
    },
    InsertBlock {
        id: Ulid,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        note: Option<String>,
    },
    DeleteBlock {
        id: Ulid,
    },
    InsertUser {
        account: String,
        role: Role,
    },
    DeleteUser {
        account: String,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if trimmed.is_empty() {
        return Err(SqlError::Empty);
    }
    if trimmed.to_ascii_uppercase().starts_with("UPDATE ") {
        return parse_update(trimmed);
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "reservations" => {
            if values.len() != 3 && values.len() != 5 {
                return Err(SqlError::WrongArity("reservations", 3, values.len()));
            }
            let window = if values.len() == 5 {
                Some((parse_ts_expr(&values[3])?, parse_ts_expr(&values[4])?))
            } else {
                None
            };
            Ok(Command::InsertReservation {
                resource_id: parse_ulid_expr(&values[0])?,
                start: parse_ts_expr(&values[1])?,
                end: parse_ts_expr(&values[2])?,
                window,
            })
        }
        "resources" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("resources", 3, values.len()));
            }
            Ok(Command::InsertResource {
                id: parse_ulid_expr(&values[0])?,
                room: parse_string_expr(&values[1])?,
                title: parse_string_expr(&values[2])?,
            })
        }
        "blocks" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("blocks", 4, values.len()));
            }
            let note = match values.get(4) {
                Some(expr) => parse_string_or_null(expr)?,
                None => None,
            };
            Ok(Command::InsertBlock {
                id: parse_ulid_expr(&values[0])?,
                resource_id: parse_ulid_expr(&values[1])?,
                start: parse_ts_expr(&values[2])?,
                end: parse_ts_expr(&values[3])?,
                note,
            })
        }
        "users" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("users", 2, values.len()));
            }
            let role = parse_string_expr(&values[1])?
                .parse::<Role>()
                .map_err(SqlError::Parse)?;
            Ok(Command::InsertUser {
                account: parse_string_expr(&values[0])?,
                role,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;

    match table.as_str() {
        "reservations" => Ok(Command::DeleteReservation {
            token: parse_string_expr(where_eq(&delete.selection, "token")?)?,
        }),
        "blocks" => Ok(Command::DeleteBlock {
            id: parse_ulid_expr(where_eq(&delete.selection, "id")?)?,
        }),
        "users" => Ok(Command::DeleteUser {
            account: parse_string_expr(where_eq(&delete.selection, "account")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `UPDATE t SET a = x, b = y WHERE id = z` is re-parsed as
/// `SELECT a = x, b = y FROM t WHERE id = z`, reusing the SELECT walkers.
fn parse_update(sql: &str) -> Result<Command, SqlError> {
    let upper = sql.to_ascii_uppercase();
    let set_at = upper
        .find(" SET ")
        .ok_or_else(|| SqlError::Parse("UPDATE without SET".into()))?;
    let where_at = upper.rfind(" WHERE ").ok_or(SqlError::MissingFilter("id"))?;
    if where_at < set_at {
        return Err(SqlError::Parse("WHERE before SET".into()));
    }
    // The keywords can share a space ("UPDATE SET", "SET WHERE"), leaving
    // an empty or inverted range.
    let part = |from: usize, to: usize, what: &str| {
        sql.get(from..to)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SqlError::Parse(format!("UPDATE without {what}")))
    };
    let table = part("UPDATE ".len(), set_at, "table")?;
    let assignments = part(set_at + " SET ".len(), where_at, "assignments")?;
    let selection = part(where_at + " WHERE ".len(), sql.len(), "filter")?;

    let rewritten = format!("SELECT {assignments} FROM {table} WHERE {selection}");
    let dialect = PostgreSqlDialect {};
    let stmts =
        Parser::parse_sql(&dialect, &rewritten).map_err(|e| SqlError::Parse(e.to_string()))?;
    let select = match stmts.first() {
        Some(Statement::Query(query)) => match query.body.as_ref() {
            SetExpr::Select(s) => s,
            _ => return Err(SqlError::Parse("malformed UPDATE".into())),
        },
        _ => return Err(SqlError::Parse("malformed UPDATE".into())),
    };

    let table = match select.from.first() {
        Some(from) => table_factor_name(&from.relation)?,
        None => return Err(SqlError::Parse("UPDATE without table".into())),
    };
    if table != "reservations" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = parse_ulid_expr(where_eq(&select.selection, "id")?)?;

    let (mut start, mut end, mut resource_id) = (None, None, None);
    for item in &select.projection {
        let SelectItem::UnnamedExpr(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        }) = item
        else {
            return Err(SqlError::Parse(format!("bad assignment: {item}")));
        };
        match expr_column_name(left).as_deref() {
            Some("start") => start = Some(parse_ts_expr(right)?),
            Some("end") => end = Some(parse_ts_expr(right)?),
            Some("resource_id") => resource_id = Some(parse_ulid_expr(right)?),
            Some(other) => return Err(SqlError::Unsupported(format!("cannot set {other}"))),
            None => return Err(SqlError::Parse(format!("bad assignment: {item}"))),
        }
    }

    Ok(Command::UpdateReservation {
        id,
        start: start.ok_or(SqlError::MissingFilter("start"))?,
        end: end.ok_or(SqlError::MissingFilter("end"))?,
        resource_id,
    })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    match table.as_str() {
        "reservations" => Ok(Command::SelectReservations),
        "resources" => Ok(Command::SelectResources),
        "department_reservations" => Ok(Command::SelectDepartmentReservations),
        "users" => Ok(Command::SelectUsers),
        "calendar" => {
            let (start, end) = range_filters(&select.selection)?;
            Ok(Command::SelectCalendar { start, end })
        }
        "all_reservations" => {
            let (start, end) = range_filters(&select.selection)?;
            Ok(Command::SelectAllReservations { start, end })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `start >= a AND "end" <= b`, both required.
fn range_filters(selection: &Option<Expr>) -> Result<(Ms, Ms), SqlError> {
    let (mut start, mut end) = (None, None);
    if let Some(selection) = selection {
        extract_range_filters(selection, &mut start, &mut end)?;
    }
    Ok((
        start.ok_or(SqlError::MissingFilter("start"))?,
        end.ok_or(SqlError::MissingFilter("end"))?,
    ))
}

fn extract_range_filters(
    expr: &Expr,
    start: &mut Option<Ms>,
    end: &mut Option<Ms>,
) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_range_filters(left, start, end)?;
                extract_range_filters(right, start, end)?;
            }
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    *start = Some(parse_ts_expr(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    *end = Some(parse_ts_expr(right)?);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// Right-hand side of `WHERE <column> = <value>`.
fn where_eq<'a>(selection: &'a Option<Expr>, column: &'static str) -> Result<&'a Expr, SqlError> {
    match selection {
        Some(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some(column) => Ok(right),
        _ => Err(SqlError::MissingFilter(column)),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string_expr(expr).map(Some),
    }
}

/// Integer milliseconds, or a quoted integer or RFC 3339 timestamp.
fn parse_ts_expr(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad timestamp: {e}"))),
            Value::SingleQuotedString(s) => parse_timestamp(s).map_err(SqlError::Parse),
            _ => Err(SqlError::Parse(format!("expected timestamp, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_ts_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
