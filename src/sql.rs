use std::str::FromStr;

use sqlparser::ast::{
    self, Assignment, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, TableWithJoins, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input. Every command runs as the connection's
/// principal; none of them names the acting user.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// `id` is `None` when the statement leaves it to the principal.
    InsertUser {
        id: Option<Ulid>,
        name: String,
    },
    InsertSlot {
        title: String,
        start: Ms,
        end: Ms,
        status: Option<SlotStatus>,
    },
    UpdateSlot {
        id: Ulid,
        patch: SlotPatch,
    },
    DeleteSlot {
        id: Ulid,
    },
    InsertSwapRequest {
        my_slot_id: Ulid,
        their_slot_id: Ulid,
    },
    RespondSwap {
        id: Ulid,
        accept: bool,
    },
    SelectSlots,
    SelectSwappableSlots,
    SelectIncoming,
    SelectOutgoing,
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
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// Known insert targets and their column order when the INSERT omits a
/// column list.
fn insert_target(table: &str) -> Option<(&'static str, &'static [&'static str])> {
    match table {
        "users" => Some(("users", &["id", "name"])),
        "slots" => Some(("slots", &["title", "start", "end", "status"])),
        "swap_requests" => Some(("swap_requests", &["my_slot_id", "their_slot_id"])),
        _ => None,
    }
}

/// The first VALUES row, keyed by column name.
struct Row {
    table: &'static str,
    cells: Vec<(String, Expr)>,
}

impl Row {
    fn get(&self, column: &str) -> Option<&Expr> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, expr)| expr)
    }

    fn require(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let name = insert_table_name(insert)?;
    let Some((table, defaults)) = insert_target(&name) else {
        return Err(SqlError::UnknownTable(name));
    };
    let values = extract_insert_values(insert)?;

    // Without a column list, trailing optional columns may be left off.
    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    let arity_ok = if insert.columns.is_empty() {
        values.len() <= columns.len()
    } else {
        values.len() == columns.len()
    };
    if !arity_ok {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }
    let row = Row {
        table,
        cells: columns.into_iter().zip(values).collect(),
    };

    match table {
        "users" => Ok(Command::InsertUser {
            id: row.get("id").map(parse_ulid_or_null).transpose()?.flatten(),
            name: parse_string(row.require("name")?)?,
        }),
        "slots" => Ok(Command::InsertSlot {
            title: parse_string(row.require("title")?)?,
            start: parse_i64_expr(row.require("start")?)?,
            end: parse_i64_expr(row.require("end")?)?,
            status: row.get("status").map(parse_slot_status_or_null).transpose()?.flatten(),
        }),
        "swap_requests" => Ok(Command::InsertSwapRequest {
            my_slot_id: parse_ulid_expr(row.require("my_slot_id")?)?,
            their_slot_id: parse_ulid_expr(row.require("their_slot_id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(name)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &TableWithJoins,
    assignments: &[Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    let mut sets = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        sets.push((column, &assignment.value));
    }

    match table.as_str() {
        "slots" => {
            let mut patch = SlotPatch::default();
            for (column, value) in sets {
                match column.as_str() {
                    "title" => patch.title = Some(parse_string(value)?),
                    "start" => patch.start = Some(parse_i64_expr(value)?),
                    "end" => patch.end = Some(parse_i64_expr(value)?),
                    "status" => patch.status = Some(parse_slot_status(value)?),
                    other => return Err(SqlError::ReadOnlyColumn("slots", other.to_string())),
                }
            }
            if patch.is_empty() {
                return Err(SqlError::Parse("UPDATE slots sets nothing".into()));
            }
            Ok(Command::UpdateSlot { id, patch })
        }
        "swap_requests" => {
            let [(column, value)] = sets.as_slice() else {
                return Err(SqlError::Parse("UPDATE swap_requests must set only status".into()));
            };
            if column != "status" {
                return Err(SqlError::ReadOnlyColumn("swap_requests", column.clone()));
            }
            let accept = match SwapStatus::from_str(&parse_string(value)?).map_err(SqlError::Parse)? {
                SwapStatus::Accepted => true,
                SwapStatus::Rejected => false,
                SwapStatus::Pending => {
                    return Err(SqlError::Parse("status must be ACCEPTED or REJECTED".into()));
                }
            };
            Ok(Command::RespondSwap { id, accept })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE / SELECT ───────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "slots" => Ok(Command::DeleteSlot { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
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
    if select.selection.is_some() {
        return Err(SqlError::Unsupported(format!("WHERE on {table}")));
    }

    match table.as_str() {
        "slots" => Ok(Command::SelectSlots),
        "swappable_slots" => Ok(Command::SelectSwappableSlots),
        "incoming_requests" => Ok(Command::SelectIncoming),
        "outgoing_requests" => Ok(Command::SelectOutgoing),
        _ => Err(SqlError::UnknownTable(table)),
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
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

fn parse_slot_status(expr: &Expr) -> Result<SlotStatus, SqlError> {
    SlotStatus::from_str(&parse_string(expr)?).map_err(SqlError::Parse)
}

fn parse_slot_status_or_null(expr: &Expr) -> Result<Option<SlotStatus>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_slot_status(expr).map(Some)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    ReadOnlyColumn(&'static str, String),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing column {col}"),
            SqlError::ReadOnlyColumn(t, col) => write!(f, "{t}: column {col} cannot be set"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
