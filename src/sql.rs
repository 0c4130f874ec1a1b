use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, NaiveTime};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectSlots {
        professional_id: String,
        date: NaiveDate,
        duration_minutes: i64,
    },
    UpsertAvailability {
        availability: Availability,
    },
    SelectAvailability {
        professional_id: String,
    },
    DeleteAvailability {
        professional_id: String,
    },
    InsertException {
        professional_id: String,
        exception: ExceptionDate,
    },
    DeleteException {
        professional_id: String,
        date: NaiveDate,
    },
    InsertBlockedTime {
        blocked: BlockedTime,
    },
    DeleteBlockedTime {
        id: Ulid,
    },
    SelectBlockedTime {
        professional_id: String,
    },
    InsertBooking {
        request: BookingRequest,
    },
    UpdateBookingStatus {
        id: Ulid,
        status: BookingStatus,
    },
    SelectBookings {
        filter: BookingFilter,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingFilter {
    Professional(String),
    Id(Ulid),
}

const AVAILABILITY_COLUMNS: &[&str] = &["professional_id", "days", "start_time", "end_time", "buffer_minutes"];
const EXCEPTION_COLUMNS: &[&str] = &["professional_id", "date", "reason"];
const BLOCKED_TIME_COLUMNS: &[&str] = &["id", "professional_id", "start", "end", "reason"];
const BOOKING_COLUMNS: &[&str] = &["id", "professional_id", "client_id", "service", "start", "end"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if trimmed.is_empty() {
        return Err(SqlError::Empty);
    }
    if first_word_is(trimmed, "UPDATE") {
        return parse_update(trimmed);
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, trimmed).map_err(|e| SqlError::Parse(e.to_string()))?;
    match stmts.as_slice() {
        [] => Err(SqlError::Empty),
        [Statement::Insert(insert)] => parse_insert(insert),
        [Statement::Delete(delete)] => parse_delete(delete),
        [Statement::Query(query)] => parse_select(query),
        [other] => Err(SqlError::Unsupported(format!("{other}"))),
        _ => Err(SqlError::Unsupported("multiple statements".into())),
    }
}

fn first_word_is(sql: &str, keyword: &str) -> bool {
    sql.split_whitespace()
        .next()
        .is_some_and(|w| w.eq_ignore_ascii_case(keyword))
}

// ── INSERT ───────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "availability" => {
            let row = insert_row(insert, "availability", AVAILABILITY_COLUMNS)?;
            let buffer_minutes = match row.get("buffer_minutes") {
                Some(expr) => parse_i64_or_null(expr)?.unwrap_or(0),
                None => 0,
            };
            Ok(Command::UpsertAvailability {
                availability: Availability {
                    professional_id: parse_string(row.require("professional_id")?)?,
                    days: parse_days(row.require("days")?)?,
                    start_time: parse_time(row.require("start_time")?)?,
                    end_time: parse_time(row.require("end_time")?)?,
                    buffer_minutes,
                    exceptions: Vec::new(),
                },
            })
        }
        "exceptions" => {
            let row = insert_row(insert, "exceptions", EXCEPTION_COLUMNS)?;
            Ok(Command::InsertException {
                professional_id: parse_string(row.require("professional_id")?)?,
                exception: ExceptionDate {
                    date: parse_date(row.require("date")?)?,
                    reason: row.optional_string("reason")?,
                },
            })
        }
        "blocked_time" => {
            let row = insert_row(insert, "blocked_time", BLOCKED_TIME_COLUMNS)?;
            Ok(Command::InsertBlockedTime {
                blocked: BlockedTime {
                    id: parse_ulid_expr(row.require("id")?)?,
                    professional_id: parse_string(row.require("professional_id")?)?,
                    // Unchecked: the engine rejects empty or reversed ranges.
                    span: Span {
                        start: parse_timestamp(row.require("start")?)?,
                        end: parse_timestamp(row.require("end")?)?,
                    },
                    reason: row.optional_string("reason")?,
                },
            })
        }
        "bookings" => {
            let row = insert_row(insert, "bookings", BOOKING_COLUMNS)?;
            Ok(Command::InsertBooking {
                request: BookingRequest {
                    id: parse_ulid_expr(row.require("id")?)?,
                    professional_id: parse_string(row.require("professional_id")?)?,
                    client_id: row.optional_string("client_id")?,
                    service: parse_string(row.require("service")?)?,
                    start: parse_timestamp(row.require("start")?)?,
                    end: parse_timestamp(row.require("end")?)?,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// One VALUES row keyed by column name. Without a column list the values are
/// taken positionally in the table's canonical order.
struct Row {
    table: &'static str,
    fields: Vec<(String, Expr)>,
}

impl Row {
    fn get(&self, column: &str) -> Option<&Expr> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, expr)| expr)
    }

    fn require(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(self.table, column))
    }

    fn optional_string(&self, column: &str) -> Result<Option<String>, SqlError> {
        match self.get(column) {
            Some(expr) => parse_string_or_null(expr),
            None => Ok(None),
        }
    }
}

fn insert_row(insert: &ast::Insert, table: &'static str, canonical: &[&str]) -> Result<Row, SqlError> {
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        if values.len() > canonical.len() {
            return Err(SqlError::WrongArity(table, canonical.len(), values.len()));
        }
        canonical[..values.len()].iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }
    if let Some(unknown) = columns.iter().find(|c| !canonical.contains(&c.as_str())) {
        return Err(SqlError::UnknownColumn(table, unknown.clone()));
    }
    Ok(Row {
        table,
        fields: columns.into_iter().zip(values).collect(),
    })
}

// ── DELETE ───────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let mut filters = Filters::from_selection(delete.selection.as_ref())?;

    let cmd = match table.as_str() {
        "availability" => Command::DeleteAvailability {
            professional_id: parse_string(filters.require("professional_id")?)?,
        },
        "exceptions" => Command::DeleteException {
            professional_id: parse_string(filters.require("professional_id")?)?,
            date: parse_date(filters.require("date")?)?,
        },
        "blocked_time" => Command::DeleteBlockedTime {
            id: parse_ulid_expr(filters.require("id")?)?,
        },
        "bookings" => {
            return Err(SqlError::Unsupported(
                "bookings are never deleted; UPDATE bookings SET status = 'cancelled'".into(),
            ));
        }
        _ => return Err(SqlError::UnknownTable(table)),
    };
    filters.finish()?;
    Ok(cmd)
}

// ── SELECT ───────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let mut filters = Filters::from_selection(select.selection.as_ref())?;

    let cmd = match table.as_str() {
        "slots" => Command::SelectSlots {
            professional_id: parse_string(filters.require("professional_id")?)?,
            date: parse_date(filters.require("date")?)?,
            duration_minutes: parse_i64_expr(filters.require("duration")?)?,
        },
        "availability" => Command::SelectAvailability {
            professional_id: parse_string(filters.require("professional_id")?)?,
        },
        "blocked_time" => Command::SelectBlockedTime {
            professional_id: parse_string(filters.require("professional_id")?)?,
        },
        "bookings" => {
            let filter = if let Some(id) = filters.take("id") {
                BookingFilter::Id(parse_ulid_expr(id)?)
            } else {
                BookingFilter::Professional(parse_string(filters.require("professional_id")?)?)
            };
            Command::SelectBookings { filter }
        }
        _ => return Err(SqlError::UnknownTable(table)),
    };
    filters.finish()?;
    Ok(cmd)
}

/// `col = value` terms of a WHERE clause joined by AND. Every term must be
/// consumed by the statement, so an unknown filter is an error rather than
/// silently ignored.
struct Filters<'a> {
    terms: Vec<(String, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn from_selection(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut terms = Vec::new();
        if let Some(expr) = selection {
            collect_eq_terms(expr, &mut terms)?;
        }
        Ok(Self { terms })
    }

    fn take(&mut self, column: &str) -> Option<&'a Expr> {
        let pos = self.terms.iter().position(|(name, _)| name == column)?;
        Some(self.terms.remove(pos).1)
    }

    fn require(&mut self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.take(column).ok_or(SqlError::MissingFilter(column))
    }

    fn finish(self) -> Result<(), SqlError> {
        match self.terms.first() {
            Some((name, _)) => Err(SqlError::Unsupported(format!("filter on {name}"))),
            None => Ok(()),
        }
    }
}

fn collect_eq_terms<'a>(expr: &'a Expr, terms: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_terms(inner, terms),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_terms(left, terms)?;
            collect_eq_terms(right, terms)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            terms.push((column, right));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
}

// ── UPDATE ───────────────────────────────────────────────────

/// `UPDATE bookings SET status = <status> WHERE id = <id>`, the one update
/// the engine accepts. Read straight off the token stream.
fn parse_update(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize()
        .map_err(|e| SqlError::Parse(e.to_string()))?;
    let tokens: Vec<Token> = tokens
        .into_iter()
        .filter(|t| !matches!(t, Token::Whitespace(_) | Token::SemiColon))
        .collect();

    let [update, table, set, column, Token::Eq, status, where_kw, id_column, Token::Eq, id] = tokens.as_slice()
    else {
        return Err(SqlError::Unsupported(
            "expected UPDATE bookings SET status = ... WHERE id = ...".into(),
        ));
    };
    if !is_word(update, "update") || !is_word(set, "set") || !is_word(where_kw, "where") {
        return Err(SqlError::Parse("malformed UPDATE".into()));
    }
    let table = word(table).ok_or_else(|| SqlError::Parse("malformed UPDATE".into()))?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }
    if !is_word(column, "status") {
        return Err(SqlError::Unsupported("only status can be updated".into()));
    }
    if !is_word(id_column, "id") {
        return Err(SqlError::MissingFilter("id"));
    }

    let status = token_text(status)
        .ok_or_else(|| SqlError::InvalidValue("status must be a string".into()))?
        .parse::<BookingStatus>()
        .map_err(SqlError::InvalidValue)?;
    let id = token_text(id).ok_or_else(|| SqlError::InvalidValue("id must be a string".into()))?;
    let id = Ulid::from_string(id).map_err(|e| SqlError::InvalidValue(format!("bad ULID: {e}")))?;
    Ok(Command::UpdateBookingStatus { id, status })
}

fn word(token: &Token) -> Option<String> {
    match token {
        Token::Word(w) => Some(w.value.to_lowercase()),
        _ => None,
    }
}

fn is_word(token: &Token, expected: &str) -> bool {
    word(token).is_some_and(|w| w == expected)
}

fn token_text(token: &Token) -> Option<&str> {
    match token {
        Token::SingleQuotedString(s) | Token::Number(s, _) => Some(s),
        _ => None,
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

/// A string or bare number literal as text.
fn literal_text(expr: &Expr) -> Result<&str, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s),
        Some(value) => Err(SqlError::InvalidValue(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    literal_text(expr).map(str::to_string)
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = literal_text(expr)?;
    Ulid::from_string(s).map_err(|e| SqlError::InvalidValue(format!("bad ULID: {e}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64_expr(expr)?);
    }
    let s = literal_text(expr)?;
    s.trim()
        .parse()
        .map_err(|e| SqlError::InvalidValue(format!("bad integer {s:?}: {e}")))
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_i64_expr(expr).map(Some)
}

/// Unix milliseconds, or an RFC 3339 string such as `2026-10-26T09:00:00Z`.
fn parse_timestamp(expr: &Expr) -> Result<Ms, SqlError> {
    if let Ok(ms) = parse_i64_expr(expr) {
        return Ok(ms);
    }
    let s = literal_text(expr)?;
    DateTime::parse_from_rfc3339(s.trim())
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| SqlError::InvalidValue(format!("bad timestamp {s:?}: {e}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = literal_text(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::InvalidValue(format!("bad date {s:?}: {e}")))
}

fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = literal_text(expr)?.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|e| SqlError::InvalidValue(format!("bad time {s:?}: {e}")))
}

/// Weekday list such as `'1,2,3,4,5'` (0 = Sunday). Range checks are the
/// engine's job.
fn parse_days(expr: &Expr) -> Result<BTreeSet<u8>, SqlError> {
    let s = literal_text(expr)?;
    s.split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|d| {
            d.parse::<u8>()
                .map_err(|e| SqlError::InvalidValue(format!("bad weekday {d:?}: {e}")))
        })
        .collect()
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
    #[error("{0}: unknown column {1}")]
    UnknownColumn(&'static str, String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("invalid value: {0}")]
    InvalidValue(String),
}
