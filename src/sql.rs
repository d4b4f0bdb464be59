use sqlparser::ast::{
    self, AssignmentTarget, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject,
    Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

const VEHICLE_COLUMNS: [&str; 3] = ["id", "model", "plate"];
const RESERVATION_COLUMNS: [&str; 8] = [
    "vehicle_id",
    "departure",
    "arrival",
    "driver_name",
    "registration",
    "phone",
    "destination",
    "notes",
];

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertVehicle {
        id: Ulid,
        model: String,
        plate: String,
    },
    /// Fields left out or given as NULL stay unset; the validator reports them.
    InsertReservation {
        request: ReservationRequest,
        returning: bool,
    },
    CompleteReservation {
        id: Ulid,
    },
    SelectVehicles {
        /// Reference instant, `None` for now.
        at: Option<Ms>,
        only_available: bool,
    },
    SelectReservations {
        vehicle_id: Option<Ulid>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "vehicles" => {
            let (mut id, mut model, mut plate) = (None, String::new(), String::new());
            for (column, value) in bind_columns(insert, &values, &VEHICLE_COLUMNS, "vehicles")? {
                match column.as_str() {
                    "id" => id = parse_ulid_or_null(value)?,
                    "model" => model = parse_text_or_null(value)?,
                    "plate" => plate = parse_text_or_null(value)?,
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::InsertVehicle {
                id: id.ok_or(SqlError::MissingColumn("id"))?,
                model,
                plate,
            })
        }
        "reservations" => {
            let mut request = ReservationRequest::default();
            for (column, value) in
                bind_columns(insert, &values, &RESERVATION_COLUMNS, "reservations")?
            {
                match column.as_str() {
                    "vehicle_id" => request.vehicle_id = parse_ulid_or_null(value)?,
                    "departure" => request.departure = parse_instant_or_null(value)?,
                    "arrival" => request.arrival = parse_instant_or_null(value)?,
                    "driver_name" => request.driver_name = parse_text_or_null(value)?,
                    "registration" => request.registration = parse_text_or_null(value)?,
                    "phone" => request.phone = parse_text_or_null(value)?,
                    "destination" => request.destination = parse_text_or_null(value)?,
                    "notes" => request.notes = parse_text_or_null(value)?,
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::InsertReservation {
                request,
                returning: insert.returning.is_some(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Pair each VALUES entry with its column: the listed columns when given,
/// otherwise the table's declared order.
fn bind_columns<'a>(
    insert: &ast::Insert,
    values: &'a [Expr],
    declared: &[&str],
    table: &'static str,
) -> Result<Vec<(String, &'a Expr)>, SqlError> {
    let columns: Vec<String> = if insert.columns.is_empty() {
        if values.len() > declared.len() {
            return Err(SqlError::WrongArity(table, declared.len(), values.len()));
        }
        declared.iter().map(|c| c.to_string()).collect()
    } else {
        if insert.columns.len() != values.len() {
            return Err(SqlError::WrongArity(table, insert.columns.len(), values.len()));
        }
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    Ok(columns.into_iter().zip(values.iter()).collect())
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "reservations" {
        return Err(SqlError::UnknownTable(table));
    }
    let [assignment] = assignments else {
        return Err(SqlError::Unsupported("UPDATE must set exactly one column".into()));
    };
    let column = match &assignment.target {
        AssignmentTarget::ColumnName(name) => object_name_last(name),
        AssignmentTarget::Tuple(_) => None,
    };
    if column.as_deref() != Some("completed") {
        return Err(SqlError::Unsupported("only `completed` can be updated".into()));
    }
    if !parse_bool(&assignment.value)? {
        return Err(SqlError::Unsupported("a completed reservation cannot be reopened".into()));
    }
    let id = extract_where_id(selection)?;
    Ok(Command::CompleteReservation { id })
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

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "vehicles" => {
            if filters.available == Some(false) {
                return Err(SqlError::Unsupported("available = false".into()));
            }
            Ok(Command::SelectVehicles {
                at: filters.at,
                only_available: filters.available == Some(true),
            })
        }
        "reservations" => Ok(Command::SelectReservations {
            vehicle_id: filters.vehicle_id,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct Filters {
    at: Option<Ms>,
    available: Option<bool>,
    vehicle_id: Option<Ulid>,
}

fn extract_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_filters(inner, filters)?,
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_filters(left, filters)?;
                extract_filters(right, filters)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("at") => filters.at = Some(parse_instant_expr(right)?),
                Some("available") => filters.available = Some(parse_bool(right)?),
                Some("vehicle_id") => filters.vehicle_id = Some(parse_ulid_expr(right)?),
                _ => {}
            },
            _ => {}
        },
        _ => {}
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
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid_expr(expr).map(Some)
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

/// Epoch milliseconds, or ISO-8601 text.
fn parse_instant_expr(expr: &Expr) -> Result<Ms, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => match s.trim().parse::<i64>() {
            Ok(ms) => Ok(ms),
            Err(_) => parse_instant(s).ok_or_else(|| SqlError::Parse(format!("bad instant: {s}"))),
        },
        _ => parse_i64_expr(expr),
    }
}

fn parse_instant_or_null(expr: &Expr) -> Result<Option<Ms>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_instant_expr(expr).map(Some)
}

/// Text column. NULL reads as empty; bare numbers are taken as written.
fn parse_text_or_null(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(String::new()),
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected text, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
