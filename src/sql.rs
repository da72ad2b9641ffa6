use chrono::{DateTime, NaiveDate, NaiveDateTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertSpace {
        id: Ulid,
        terminal: String,
        active: bool,
    },
    UpdateSpace {
        id: Ulid,
        terminal: Option<String>,
        active: Option<bool>,
    },
    DeleteSpace {
        id: Ulid,
    },
    /// The allocator picks the space and the id.
    InsertReservation {
        from: Ms,
        to: Ms,
    },
    UpdateReservation {
        id: Ulid,
        from: Ms,
        to: Ms,
    },
    DeleteReservation {
        id: Ulid,
    },
    SelectSpaces {
        id: Option<Ulid>,
    },
    SelectReservations {
        id: Option<Ulid>,
        space_id: Option<Ulid>,
    },
    SelectAvailableSpaces {
        from: Ms,
        to: Ms,
        exclude_id: Option<Ulid>,
    },
    SelectPrice {
        from: Ms,
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
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let row = InsertRow::new(insert)?;

    match table.as_str() {
        "spaces" => {
            let row = row.with_default_columns(&["id", "terminal", "active"]);
            let id = parse_ulid(row.require("id")?)?;
            let terminal = row.get("terminal").map(parse_text).transpose()?.unwrap_or_default();
            let active = row.get("active").map(parse_bool).transpose()?.unwrap_or(true);
            Ok(Command::InsertSpace { id, terminal, active })
        }
        "reservations" => {
            let row = row.with_default_columns(&["from", "to"]);
            Ok(Command::InsertReservation {
                from: parse_instant(row.require("from")?)?,
                to: parse_instant(row.require("to")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(relation: &TableFactor, assignments: &[ast::Assignment], selection: &Option<Expr>) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;

    let mut set: Vec<(String, &Expr)> = Vec::with_capacity(assignments.len());
    for a in assignments {
        let column = match &a.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => return Err(SqlError::Unsupported("tuple assignment".into())),
        };
        set.push((column, &a.value));
    }
    let lookup = |col: &str| set.iter().find(|(c, _)| c == col).map(|(_, e)| *e);

    match table.as_str() {
        "spaces" => {
            let terminal = lookup("terminal").map(parse_text).transpose()?;
            let active = lookup("active").map(parse_bool).transpose()?;
            if terminal.is_none() && active.is_none() {
                return Err(SqlError::MissingAssignment("terminal or active"));
            }
            Ok(Command::UpdateSpace { id, terminal, active })
        }
        "reservations" => Ok(Command::UpdateReservation {
            id,
            from: parse_instant(lookup("from").ok_or(SqlError::MissingAssignment("from"))?)?,
            to: parse_instant(lookup("to").ok_or(SqlError::MissingAssignment("to"))?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "spaces" => Ok(Command::DeleteSpace { id }),
        "reservations" => Ok(Command::DeleteReservation { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        filters.collect(selection)?;
    }

    match table.as_str() {
        "spaces" => Ok(Command::SelectSpaces {
            id: filters.get("id").map(parse_ulid).transpose()?,
        }),
        "reservations" => Ok(Command::SelectReservations {
            id: filters.get("id").map(parse_ulid).transpose()?,
            space_id: filters.get("space_id").map(parse_ulid).transpose()?,
        }),
        "available_spaces" => Ok(Command::SelectAvailableSpaces {
            from: parse_instant(filters.require("from")?)?,
            to: parse_instant(filters.require("to")?)?,
            exclude_id: filters.get("exclude_id").map(parse_ulid).transpose()?,
        }),
        // A "to" filter is accepted for symmetry and ignored: price depends on "from" only.
        "price" => Ok(Command::SelectPrice {
            from: parse_instant(filters.require("from")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── INSERT rows ───────────────────────────────────────────────

/// First VALUES row of an INSERT, paired with its column list.
struct InsertRow {
    columns: Vec<String>,
    values: Vec<Expr>,
}

impl InsertRow {
    fn new(insert: &ast::Insert) -> Result<Self, SqlError> {
        let body = insert.source.as_ref().ok_or(SqlError::Parse("no VALUES".into()))?;
        let SetExpr::Values(values) = body.body.as_ref() else {
            return Err(SqlError::Parse("expected VALUES".into()));
        };
        let Some(first) = values.rows.first() else {
            return Err(SqlError::Parse("empty VALUES".into()));
        };
        if values.rows.len() > 1 {
            return Err(SqlError::Unsupported("multi-row INSERT".into()));
        }
        let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
        if !columns.is_empty() && columns.len() != first.len() {
            return Err(SqlError::WrongArity(columns.len(), first.len()));
        }
        Ok(Self {
            columns,
            values: first.clone(),
        })
    }

    /// Without an explicit column list, values are positional in `defaults` order.
    fn with_default_columns(mut self, defaults: &[&str]) -> Self {
        if self.columns.is_empty() {
            self.columns = defaults
                .iter()
                .take(self.values.len())
                .map(|c| c.to_string())
                .collect();
        }
        self
    }

    fn get(&self, column: &str) -> Option<&Expr> {
        let pos = self.columns.iter().position(|c| c == column)?;
        self.values.get(pos)
    }

    fn require(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }
}

// ── WHERE filters ─────────────────────────────────────────────

/// `col = value` terms of a conjunction. `"from" >= v` and `"to" <= v` are
/// read as equality on the window bounds.
#[derive(Default)]
struct Filters {
    terms: Vec<(String, Expr)>,
}

impl Filters {
    fn collect(&mut self, expr: &Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner),
            Expr::BinaryOp { left, op, right } => {
                let column = expr_column_name(left);
                match (op, column.as_deref()) {
                    (ast::BinaryOperator::And, _) => {
                        self.collect(left)?;
                        self.collect(right)
                    }
                    (ast::BinaryOperator::Eq, Some(col))
                    | (ast::BinaryOperator::GtEq, Some(col @ "from"))
                    | (ast::BinaryOperator::LtEq, Some(col @ "to")) => {
                        self.terms.push((col.to_string(), right.as_ref().clone()));
                        Ok(())
                    }
                    _ => Err(SqlError::Unsupported(format!("filter: {expr}"))),
                }
            }
            _ => Err(SqlError::Unsupported(format!("filter: {expr}"))),
        }
    }

    fn get(&self, column: &str) -> Option<&Expr> {
        self.terms.iter().find(|(c, _)| c == column).map(|(_, e)| e)
    }

    fn require(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingFilter(column))
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

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let mut filters = Filters::default();
    if let Some(sel) = selection {
        filters.collect(sel)?;
    }
    parse_ulid(filters.require("id")?)
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Null) => Ok(String::new()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => {
            s.parse().map_err(|e| SqlError::Parse(format!("bad i64: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// Unix milliseconds, or a string holding milliseconds, an RFC 3339
/// timestamp, `YYYY-MM-DD HH:MM:SS` (UTC) or `YYYY-MM-DD` (UTC midnight).
fn parse_instant(expr: &Expr) -> Result<Ms, SqlError> {
    let Some(Value::SingleQuotedString(s)) = extract_value(expr) else {
        return parse_i64(expr);
    };
    parse_instant_str(s).ok_or_else(|| SqlError::Parse(format!("bad instant: {s}")))
}

fn parse_instant_str(s: &str) -> Option<Ms> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<i64>() {
        return Some(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc().timestamp_millis());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    /// Column list and VALUES row differ in length: (columns, values).
    WrongArity(usize, usize),
    MissingColumn(&'static str),
    MissingAssignment(&'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(cols, vals) => {
                write!(f, "{cols} columns but {vals} values")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingAssignment(col) => write!(f, "missing SET {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
