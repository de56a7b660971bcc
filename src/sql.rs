use chrono::NaiveDate;
use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        resource: Resource,
    },
    DeleteResource {
        id: Ulid,
    },
    SelectResources {
        id: Option<Ulid>,
    },
    SelectAvailability {
        date: NaiveDate,
        start: TimeOfDay,
        end: TimeOfDay,
        filter: AvailabilityFilter,
    },
    InsertReservation {
        resource_id: Ulid,
        date: NaiveDate,
        start: TimeOfDay,
        end: TimeOfDay,
        motif: Option<String>,
    },
    DeleteReservation {
        id: Ulid,
    },
    SelectReservations {
        resource_id: Ulid,
        date: NaiveDate,
    },
    SelectReservation {
        id: Ulid,
    },
    SelectFreeWindows {
        resource_id: Ulid,
        date: NaiveDate,
        start: Option<TimeOfDay>,
        end: Option<TimeOfDay>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
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
        "resources" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("resources", 4, values.len()));
            }
            let equipment = match values.get(4) {
                Some(expr) => parse_equipment(expr)?,
                None => Vec::new(),
            };
            Ok(Command::InsertResource {
                resource: Resource {
                    id: parse_ulid_expr(&values[0])?,
                    name: parse_string(&values[1])?,
                    kind: parse_string(&values[2])?,
                    capacity: parse_u32(&values[3])?,
                    equipment,
                },
            })
        }
        "reservations" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("reservations", 4, values.len()));
            }
            let motif = match values.get(4) {
                Some(expr) => parse_string_or_null(expr)?,
                None => None,
            };
            Ok(Command::InsertReservation {
                resource_id: parse_ulid_expr(&values[0])?,
                date: parse_date_expr(&values[1])?,
                start: parse_time_expr(&values[2])?,
                end: parse_time_expr(&values[3])?,
                motif,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "resources" => Ok(Command::DeleteResource { id }),
        "reservations" => Ok(Command::DeleteReservation { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err(SqlError::Unsupported("non-SELECT query".into()));
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut preds = Vec::new();
    if let Some(selection) = &select.selection {
        collect_predicates(selection, &mut preds)?;
    }
    let find = |col: &str, ops: &[BinaryOperator]| {
        preds
            .iter()
            .find(|(c, op, _)| c == col && ops.contains(op))
            .map(|(_, _, e)| *e)
    };
    let eq = [BinaryOperator::Eq];
    let lower = [BinaryOperator::GtEq, BinaryOperator::Eq];
    let upper = [BinaryOperator::LtEq, BinaryOperator::Eq];

    match table.as_str() {
        "resources" => Ok(Command::SelectResources {
            id: find("id", &eq).map(parse_ulid_expr).transpose()?,
        }),
        "availability" => {
            let date = find("date", &eq).ok_or(SqlError::MissingFilter("date"))?;
            let start = find("start", &lower).ok_or(SqlError::MissingFilter("start"))?;
            let end = find("end", &upper).ok_or(SqlError::MissingFilter("end"))?;
            Ok(Command::SelectAvailability {
                date: parse_date_expr(date)?,
                start: parse_time_expr(start)?,
                end: parse_time_expr(end)?,
                filter: AvailabilityFilter {
                    kind: find("kind", &eq).map(parse_string).transpose()?,
                    min_capacity: find("capacity", &lower).map(parse_u32).transpose()?,
                },
            })
        }
        "reservations" => {
            if let Some(id) = find("id", &eq) {
                return Ok(Command::SelectReservation {
                    id: parse_ulid_expr(id)?,
                });
            }
            let resource_id = find("resource_id", &eq).ok_or(SqlError::MissingFilter("resource_id"))?;
            let date = find("date", &eq).ok_or(SqlError::MissingFilter("date"))?;
            Ok(Command::SelectReservations {
                resource_id: parse_ulid_expr(resource_id)?,
                date: parse_date_expr(date)?,
            })
        }
        "free_windows" => {
            let resource_id = find("resource_id", &eq).ok_or(SqlError::MissingFilter("resource_id"))?;
            let date = find("date", &eq).ok_or(SqlError::MissingFilter("date"))?;
            Ok(Command::SelectFreeWindows {
                resource_id: parse_ulid_expr(resource_id)?,
                date: parse_date_expr(date)?,
                start: find("start", &lower).map(parse_time_expr).transpose()?,
                end: find("end", &upper).map(parse_time_expr).transpose()?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten an AND-tree of `column <op> value` comparisons.
fn collect_predicates<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, BinaryOperator, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_predicates(left, out)?;
            collect_predicates(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("predicate {expr}")))?;
            out.push((col, op.clone(), right.as_ref()));
            Ok(())
        }
        Expr::Nested(inner) => collect_predicates(inner, out),
        other => Err(SqlError::Unsupported(format!("predicate {other}"))),
    }
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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection {
        Some(Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
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

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string or NULL, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad unsigned integer {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    parse_date(&parse_string(expr)?).map_err(SqlError::InvalidValue)
}

fn parse_time_expr(expr: &Expr) -> Result<TimeOfDay, SqlError> {
    parse_string(expr)?.parse().map_err(SqlError::InvalidValue)
}

/// Equipment is passed as JSON text: `'[{"name": "...", "quantity": 1}]'`.
fn parse_equipment(expr: &Expr) -> Result<Vec<Equipment>, SqlError> {
    match parse_string_or_null(expr)? {
        None => Ok(Vec::new()),
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| SqlError::InvalidValue(format!("bad equipment JSON: {e}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    /// Well-formed SQL carrying a malformed date, time or JSON literal.
    InvalidValue(String),
}

impl SqlError {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SqlError::InvalidValue(_) => "22007",
            SqlError::UnknownTable(_) => "42P01",
            _ => "42601",
        }
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at least {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::InvalidValue(s) => write!(f, "invalid value: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}
