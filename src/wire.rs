use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::SlotdAuthSource;
use crate::engine::{ConflictReason, Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, BookingFilter, Command, SqlError};

pub struct SlotdHandler {
    engine: Arc<Engine>,
    query_parser: Arc<SlotdQueryParser>,
}

impl SlotdHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(SlotdQueryParser),
        }
    }

    /// Parse, execute and record RED metrics for one statement.
    async fn run(&self, query: &str, format: Option<&Format>) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd, format).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command, format: Option<&Format>) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::SelectSlots {
                professional_id,
                date,
                duration_minutes,
            } => {
                let slots = engine
                    .compute_slots(&professional_id, date, duration_minutes)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(ResultTable::Slots.schema(format));
                let rows: Vec<PgWireResult<DataRow>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&professional_id)?;
                        encoder.encode_field(&slot.start)?;
                        encoder.encode_field(&slot.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::UpsertAvailability { availability } => {
                engine.upsert_availability(availability).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectAvailability { professional_id } => {
                let schema = Arc::new(ResultTable::Availability.schema(format));
                let rows = match engine.get_availability(&professional_id).await {
                    Ok(availability) => vec![availability_row(&schema, &availability)],
                    Err(EngineError::NotFound(_)) => Vec::new(),
                    Err(e) => return Err(engine_err(e)),
                };
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::DeleteAvailability { professional_id } => {
                engine
                    .delete_availability(&professional_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertException {
                professional_id,
                exception,
            } => {
                engine
                    .add_exception(&professional_id, exception)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteException {
                professional_id,
                date,
            } => {
                engine
                    .remove_exception(&professional_id, date)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertBlockedTime { blocked } => {
                engine.add_blocked_time(blocked).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteBlockedTime { id } => {
                engine.remove_blocked_time(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectBlockedTime { professional_id } => {
                let blocked = engine.list_blocked_time(&professional_id).await;
                let schema = Arc::new(ResultTable::BlockedTime.schema(format));
                let rows: Vec<_> = blocked.iter().map(|b| blocked_row(&schema, b)).collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::InsertBooking { request } => {
                engine.request_booking(request).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateBookingStatus { id, status } => {
                engine
                    .update_booking_status(id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::SelectBookings { filter } => {
                let bookings = match filter {
                    BookingFilter::Professional(pid) => engine.list_bookings(&pid).await,
                    BookingFilter::Id(id) => match engine.get_booking(id).await {
                        Ok(booking) => vec![booking],
                        Err(EngineError::NotFound(_)) => Vec::new(),
                        Err(e) => return Err(engine_err(e)),
                    },
                };
                let schema = Arc::new(ResultTable::Bookings.schema(format));
                let rows: Vec<_> = bookings.iter().map(|b| booking_row(&schema, b)).collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

// ── Result rows ──────────────────────────────────────────────────

/// Tables that produce rows, with their column layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResultTable {
    Slots,
    Availability,
    BlockedTime,
    Bookings,
}

impl ResultTable {
    /// Table read by a SELECT, judged from the text alone so that it works
    /// before parameters are bound.
    fn for_select(sql: &str) -> Option<Self> {
        let mut words = sql.split_whitespace();
        if !words.next()?.eq_ignore_ascii_case("SELECT") {
            return None;
        }
        let table = words
            .skip_while(|w| !w.eq_ignore_ascii_case("FROM"))
            .nth(1)?
            .trim_matches(|c: char| c == '"' || c == ';')
            .to_lowercase();
        match table.as_str() {
            "slots" => Some(Self::Slots),
            "availability" => Some(Self::Availability),
            "blocked_time" => Some(Self::BlockedTime),
            "bookings" => Some(Self::Bookings),
            _ => None,
        }
    }

    fn columns(self) -> &'static [(&'static str, Type)] {
        match self {
            Self::Slots => &[
                ("professional_id", Type::VARCHAR),
                ("start", Type::INT8),
                ("end", Type::INT8),
            ],
            Self::Availability => &[
                ("professional_id", Type::VARCHAR),
                ("days", Type::VARCHAR),
                ("start_time", Type::VARCHAR),
                ("end_time", Type::VARCHAR),
                ("buffer_minutes", Type::INT8),
                ("exceptions", Type::VARCHAR),
            ],
            Self::BlockedTime => &[
                ("id", Type::VARCHAR),
                ("professional_id", Type::VARCHAR),
                ("start", Type::INT8),
                ("end", Type::INT8),
                ("reason", Type::VARCHAR),
            ],
            Self::Bookings => &[
                ("id", Type::VARCHAR),
                ("professional_id", Type::VARCHAR),
                ("client_id", Type::VARCHAR),
                ("service", Type::VARCHAR),
                ("start", Type::INT8),
                ("end", Type::INT8),
                ("status", Type::VARCHAR),
                ("created_at", Type::INT8),
            ],
        }
    }

    /// Field list; binary columns only where the client asked for them.
    fn schema(self, format: Option<&Format>) -> Vec<FieldInfo> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(i, (name, ty))| {
                let field_format = format.map_or(FieldFormat::Text, |f| f.format_for(i));
                FieldInfo::new((*name).into(), None, None, ty.clone(), field_format)
            })
            .collect()
    }
}

fn availability_row(schema: &Arc<Vec<FieldInfo>>, availability: &Availability) -> PgWireResult<DataRow> {
    let days = serde_json::to_string(&availability.days).map_err(json_err)?;
    let exceptions = serde_json::to_string(&availability.exceptions).map_err(json_err)?;
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&availability.professional_id)?;
    encoder.encode_field(&days)?;
    encoder.encode_field(&availability.start_time.format("%H:%M").to_string())?;
    encoder.encode_field(&availability.end_time.format("%H:%M").to_string())?;
    encoder.encode_field(&availability.buffer_minutes)?;
    encoder.encode_field(&exceptions)?;
    Ok(encoder.take_row())
}

fn blocked_row(schema: &Arc<Vec<FieldInfo>>, blocked: &BlockedTime) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&blocked.id.to_string())?;
    encoder.encode_field(&blocked.professional_id)?;
    encoder.encode_field(&blocked.span.start)?;
    encoder.encode_field(&blocked.span.end)?;
    encoder.encode_field(&blocked.reason)?;
    Ok(encoder.take_row())
}

fn booking_row(schema: &Arc<Vec<FieldInfo>>, booking: &Booking) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&booking.id.to_string())?;
    encoder.encode_field(&booking.professional_id)?;
    encoder.encode_field(&booking.client_id)?;
    encoder.encode_field(&booking.service)?;
    encoder.encode_field(&booking.span.start)?;
    encoder.encode_field(&booking.span.end)?;
    encoder.encode_field(&booking.status.to_string())?;
    encoder.encode_field(&booking.created_at)?;
    Ok(encoder.take_row())
}

#[async_trait]
impl SimpleQueryHandler for SlotdHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query, None).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotdQueryParser;

#[async_trait]
impl QueryParser for SlotdQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(ResultTable::for_select(stmt)
            .map(|t| t.schema(column_format))
            .unwrap_or_default())
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotdHandler {
    type Statement = String;
    type QueryParser = SlotdQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        self.run(&sql, Some(&portal.result_column_format)).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        // Formats are not known until Bind; describe as text.
        let fields = ResultTable::for_select(&target.statement)
            .map(|t| t.schema(None))
            .unwrap_or_default();
        Ok(DescribeStatementResponse::new(param_types, fields))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let fields = ResultTable::for_select(&target.statement.statement)
            .map(|t| t.schema(Some(&target.result_column_format)))
            .unwrap_or_default();
        Ok(DescribePortalResponse::new(fields))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>() {
                    max = max.max(n);
                }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotdFactory {
    handler: Arc<SlotdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotdFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = SlotdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotdHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotdFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    factory: Arc<SlotdFactory>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for an engine error. Both conflict reasons share `23P01`
/// (exclusion_violation) and differ in the message.
fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::Conflict(ConflictReason::AlreadyBooked { .. })
        | EngineError::Conflict(ConflictReason::Blocked { .. }) => "23P01",
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Store(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::InvalidValue(_) => "22P02",
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(..) => "42703",
        SqlError::Unsupported(_) => "0A000",
        _ => "42601",
    }
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(sql_sqlstate(&e), e.to_string())
}

fn json_err(e: serde_json::Error) -> PgWireError {
    user_error("XX000", format!("encoding error: {e}"))
}
