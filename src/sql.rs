use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Row filter for `SELECT ... FROM <bookings>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingFilter {
    All,
    Id(Ulid),
    Owner(String),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    UpsertResource(Resource),
    DeleteResource {
        id: Ulid,
    },
    SelectResources {
        kind: Option<AmenityKind>,
    },
    UpsertUser(User),
    InsertBooking {
        kind: AmenityKind,
        proposal: BookingProposal,
    },
    UpdateBooking {
        kind: AmenityKind,
        id: Ulid,
        patch: BookingPatch,
    },
    DeleteBooking {
        kind: AmenityKind,
        id: Ulid,
    },
    SelectBookings {
        kind: AmenityKind,
        filter: BookingFilter,
    },
    SelectAvailability {
        kind: AmenityKind,
        at: Option<Ms>,
    },
    SelectFreeResources {
        kind: AmenityKind,
        query: AvailabilityQuery,
    },
    SelectLedger {
        owner: String,
    },
    DeleteLedgerEntry {
        id: Ulid,
    },
    InsertNotification {
        time: Ms,
        title: String,
        message: String,
        token: String,
    },
    SelectNotifications {
        token: Option<String>,
    },
    /// Push to every user with a push token, right away.
    Broadcast {
        title: String,
        message: String,
    },
}

/// What a statement does to its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Select,
    Insert,
    Update,
    Delete,
}

/// Verb and target table of a statement, readable before its `$n`
/// parameters are bound. `None` for anything `parse_sql` would reject
/// outright.
pub fn statement_target(sql: &str) -> Option<(Verb, String)> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    match stmts.first()? {
        Statement::Insert(insert) => Some((Verb::Insert, insert_table_name(insert).ok()?)),
        Statement::Update { table, .. } => Some((Verb::Update, table_factor_name(&table.relation).ok()?)),
        Statement::Delete(delete) => Some((Verb::Delete, delete_table_name(delete).ok()?)),
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => {
                let from = select.from.first()?;
                Some((Verb::Select, table_factor_name(&from.relation).ok()?))
            }
            _ => None,
        },
        _ => None,
    }
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

/// Column order assumed when an INSERT lists no columns.
fn default_columns(table: &str) -> &'static [&'static str] {
    match table {
        "resources" => &["id", "amenity", "label", "capacity", "floor_id"],
        "users" => &["token", "email", "push_token"],
        "notifications" => &["time", "title", "message", "token"],
        "broadcasts" => &["title", "message"],
        _ => &["resource_id", "start", "end", "occupants", "owner", "date", "status"],
    }
}

/// One VALUES row keyed by column name.
struct Row {
    table: String,
    cells: Vec<(String, Expr)>,
}

impl Row {
    fn get(&self, column: &str) -> Option<&Expr> {
        self.cells.iter().find(|(c, _)| c == column).map(|(_, e)| e)
    }

    fn require(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column)
            .ok_or_else(|| SqlError::MissingColumn(self.table.clone(), column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let row = insert_row(insert, &table)?;

    match table.as_str() {
        "resources" => Ok(Command::UpsertResource(Resource {
            id: parse_ulid(row.require("id")?)?,
            kind: parse_amenity(row.require("amenity")?)?,
            label: parse_string(row.require("label")?)?,
            capacity: row.get("capacity").map(parse_u32).transpose()?.unwrap_or(1),
            floor_id: row.get("floor_id").map(parse_u32).transpose()?.unwrap_or(0),
        })),
        "users" => Ok(Command::UpsertUser(User {
            token: parse_string(row.require("token")?)?,
            email: parse_string(row.require("email")?)?,
            push_token: row.get("push_token").map(parse_string_or_null).transpose()?.flatten(),
        })),
        "notifications" => Ok(Command::InsertNotification {
            time: parse_i64(row.require("time")?)?,
            title: parse_string(row.require("title")?)?,
            message: parse_string(row.require("message")?)?,
            token: parse_string(row.require("token")?)?,
        }),
        "broadcasts" => Ok(Command::Broadcast {
            title: parse_string(row.require("title")?)?,
            message: parse_string(row.require("message")?)?,
        }),
        other => {
            let kind = AmenityKind::from_table_name(other).ok_or_else(|| SqlError::UnknownTable(table.clone()))?;
            let proposal = BookingProposal {
                resource_id: parse_ulid(row.require("resource_id")?)?,
                date: row.get("date").map(parse_date_or_null).transpose()?.flatten(),
                start: parse_i64(row.require("start")?)?,
                end: parse_i64(row.require("end")?)?,
                occupants: row.get("occupants").map(parse_occupants).transpose()?.unwrap_or_default(),
                owner: parse_string(row.require("owner")?)?,
                status: row.get("status").map(parse_string_or_null).transpose()?.flatten(),
            };
            Ok(Command::InsertBooking { kind, proposal })
        }
    }
}

fn insert_row(insert: &ast::Insert, table: &str) -> Result<Row, SqlError> {
    let rows = extract_insert_rows(insert)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported("multi-row INSERT".into()));
    }
    let values = rows.into_iter().next().unwrap_or_default();
    let columns: Vec<String> = if insert.columns.is_empty() {
        default_columns(table).iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if values.len() != columns.len() {
        return Err(SqlError::WrongArity(table.to_string(), columns.len(), values.len()));
    }
    Ok(Row {
        table: table.to_string(),
        cells: columns.into_iter().zip(values).collect(),
    })
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let name = table_factor_name(&table.relation)?;
    let kind = AmenityKind::from_table_name(&name).ok_or(SqlError::UnknownTable(name))?;
    let id = extract_where_id(selection)?;

    let mut patch = BookingPatch::default();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => return Err(SqlError::Unsupported("tuple assignment".into())),
        };
        let value = &assignment.value;
        match column.as_str() {
            "date" => patch.date = Some(parse_date(value)?),
            "start" => patch.start = Some(parse_i64(value)?),
            "end" => patch.end = Some(parse_i64(value)?),
            "resource_id" => patch.resource_id = Some(parse_ulid(value)?),
            "resource_label" | "label" => patch.resource_label = Some(parse_string(value)?),
            "floor_id" => patch.floor_id = Some(parse_u32(value)?),
            "occupants" => patch.occupants = Some(parse_occupants(value)?),
            "status" => patch.status = Some(parse_string(value)?),
            _ => return Err(SqlError::ReadOnlyColumn(column)),
        }
    }
    Ok(Command::UpdateBooking { kind, id, patch })
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "resources" => Ok(Command::DeleteResource { id }),
        "ledger" => Ok(Command::DeleteLedgerEntry { id }),
        other => match AmenityKind::from_table_name(other) {
            Some(kind) => Ok(Command::DeleteBooking { kind, id }),
            None => Err(SqlError::UnknownTable(table)),
        },
    }
}

// ── SELECT ────────────────────────────────────────────────────

/// `column op value` terms of an AND-chain.
struct Filters(Vec<(String, BinaryOperator, Expr)>);

impl Filters {
    fn collect(selection: &Option<Expr>) -> Result<Self, SqlError> {
        let mut terms = Vec::new();
        if let Some(expr) = selection {
            collect_terms(expr, &mut terms)?;
        }
        Ok(Self(terms))
    }

    fn find(&self, column: &str, op: BinaryOperator) -> Option<&Expr> {
        self.0
            .iter()
            .find(|(c, o, _)| c == column && *o == op)
            .map(|(_, _, e)| e)
    }

    fn eq(&self, column: &str) -> Option<&Expr> {
        self.find(column, BinaryOperator::Eq)
    }
}

fn collect_terms(expr: &Expr, terms: &mut Vec<(String, BinaryOperator, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_terms(left, terms)?;
            collect_terms(right, terms)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            terms.push((column, op.clone(), right.as_ref().clone()));
            Ok(())
        }
        Expr::Nested(inner) => collect_terms(inner, terms),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
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
    let filters = Filters::collect(&select.selection)?;

    match table.as_str() {
        "resources" => Ok(Command::SelectResources {
            kind: filters.eq("amenity").map(parse_amenity).transpose()?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            kind: parse_amenity(filters.eq("amenity").ok_or(SqlError::MissingFilter("amenity"))?)?,
            at: filters.eq("at").map(parse_i64).transpose()?,
        }),
        "free_resources" => {
            let kind = parse_amenity(filters.eq("amenity").ok_or(SqlError::MissingFilter("amenity"))?)?;
            let date = parse_date(filters.eq("date").ok_or(SqlError::MissingFilter("date"))?)?;
            let start = filters
                .find("start", BinaryOperator::GtEq)
                .ok_or(SqlError::MissingFilter("start"))?;
            let end = filters
                .find("end", BinaryOperator::LtEq)
                .ok_or(SqlError::MissingFilter("end"))?;
            let min_capacity = filters
                .find("capacity", BinaryOperator::GtEq)
                .map(parse_u32)
                .transpose()?
                .unwrap_or(0);
            Ok(Command::SelectFreeResources {
                kind,
                query: AvailabilityQuery {
                    date,
                    start: parse_i64(start)?,
                    end: parse_i64(end)?,
                    min_capacity,
                },
            })
        }
        "ledger" => Ok(Command::SelectLedger {
            owner: parse_string(filters.eq("owner").ok_or(SqlError::MissingFilter("owner"))?)?,
        }),
        "notifications" => Ok(Command::SelectNotifications {
            token: filters.eq("token").map(parse_string).transpose()?,
        }),
        other => {
            let kind = AmenityKind::from_table_name(other).ok_or_else(|| SqlError::UnknownTable(table.clone()))?;
            let filter = if let Some(id) = filters.eq("id") {
                BookingFilter::Id(parse_ulid(id)?)
            } else if let Some(owner) = filters.eq("owner") {
                BookingFilter::Owner(parse_string(owner)?)
            } else {
                BookingFilter::All
            };
            Ok(Command::SelectBookings { kind, filter })
        }
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
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
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_amenity(expr: &Expr) -> Result<AmenityKind, SqlError> {
    parse_string(expr)?.parse().map_err(SqlError::Parse)
}

fn parse_date_or_null(expr: &Expr) -> Result<Option<NaiveDate>, SqlError> {
    parse_string_or_null(expr)?
        .map(|s| {
            NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
        })
        .transpose()
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    parse_date_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

/// Occupants travel as one comma-separated string.
fn parse_occupants(expr: &Expr) -> Result<Vec<String>, SqlError> {
    Ok(parse_string_or_null(expr)?
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default())
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        parse_i64(expr)?
            .checked_neg()
            .ok_or_else(|| SqlError::Parse("i64 overflow".into()))
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(String, usize, usize),
    MissingColumn(String, &'static str),
    ReadOnlyColumn(String),
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
            SqlError::ReadOnlyColumn(col) => write!(f, "column {col} cannot be updated"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
