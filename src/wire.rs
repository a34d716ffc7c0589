use std::fmt::Debug;
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
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::RoomSlotAuthSource;
use crate::dispatch::{self, PushSender};
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, BookingFilter, Command, Verb};
use crate::store::{MemoryStore, StoreError};

pub struct RoomSlotHandler {
    engine: Arc<Engine>,
    store: Arc<MemoryStore>,
    sender: Arc<dyn PushSender>,
    query_parser: Arc<RoomSlotQueryParser>,
}

impl RoomSlotHandler {
    pub fn new(engine: Arc<Engine>, store: Arc<MemoryStore>, sender: Arc<dyn PushSender>) -> Self {
        Self {
            engine,
            store,
            sender,
            query_parser: Arc::new(RoomSlotQueryParser),
        }
    }

    async fn run(&self, sql: &str, format: &Format) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label).record(started.elapsed().as_secs_f64());
        debug!("{label} {status} in {:?}", started.elapsed());
        result
    }

    async fn execute_command(&self, cmd: Command, format: &Format) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::UpsertResource(resource) => {
                self.store.upsert_resource(resource).await.map_err(store_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteResource { id } => {
                if !self.store.delete_resource(id).await.map_err(store_err)? {
                    return Err(engine_err(EngineError::ResourceNotFound(id)));
                }
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectResources { kind } => {
                let resources = self.store.resources(kind).await;
                Ok(vec![resource_rows(resources, format)])
            }
            Command::UpsertUser(user) => {
                self.store.upsert_user(user).await.map_err(store_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertBooking { kind, proposal } => {
                let record = engine.create(kind, proposal).await.map_err(engine_err)?;
                Ok(vec![booking_rows(vec![record.booking], format)])
            }
            Command::UpdateBooking { kind, id, patch } => {
                let record = engine.update(kind, id, patch).await.map_err(engine_err)?;
                Ok(vec![booking_rows(vec![record.booking], format)])
            }
            Command::DeleteBooking { kind, id } => {
                engine.remove(kind, id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectBookings { kind, filter } => {
                let bookings = match filter {
                    BookingFilter::All => engine.find_all(kind).await,
                    BookingFilter::Id(id) => engine.find_one(kind, id).await.map(|b| vec![b]),
                    BookingFilter::Owner(token) => engine.find_by_owner(kind, &token).await,
                }
                .map_err(engine_err)?;
                Ok(vec![booking_rows(bookings, format)])
            }
            Command::SelectAvailability { kind, at } => {
                let at = at.unwrap_or_else(now_ms);
                let free = engine.count_free(kind, at).await.map_err(engine_err)?;

                let schema = Arc::new(fields(AVAILABILITY_COLUMNS, format));
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&kind.as_str())?;
                encoder.encode_field(&at)?;
                encoder.encode_field(&(free as i64))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectFreeResources { kind, query } => {
                let resources = engine.list_free(kind, query).await.map_err(engine_err)?;
                Ok(vec![resource_rows(resources, format)])
            }
            Command::SelectLedger { owner } => {
                let entries = engine.ledger_for_owner(&owner).await.map_err(engine_err)?;
                Ok(vec![ledger_rows(entries, format)])
            }
            Command::DeleteLedgerEntry { id } => {
                engine.cancel_entry(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertNotification {
                time,
                title,
                message,
                token,
            } => {
                let notification = self
                    .store
                    .schedule_notification(time, title, message, token)
                    .await
                    .map_err(store_err)?;
                Ok(vec![notification_rows(vec![notification], format)])
            }
            Command::SelectNotifications { token } => {
                let pending = self.store.notifications(token.as_deref()).await;
                if token.is_some() && pending.is_empty() {
                    return Err(engine_err(EngineError::NotificationsNotFound));
                }
                Ok(vec![notification_rows(pending, format)])
            }
            Command::Broadcast { title, message } => {
                let report = dispatch::broadcast(self.store.as_ref(), self.sender.as_ref(), &title, &message)
                    .await
                    .map_err(store_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(report.sent))])
            }
        }
    }
}

// ── Row schemas ──────────────────────────────────────────────────

type Columns = &'static [(&'static str, Type)];

/// Field descriptions for `columns` in the result format the client asked for.
fn fields(columns: Columns, format: &Format) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(idx, (name, ty))| FieldInfo::new(name.to_string(), None, None, ty.clone(), format.format_for(idx)))
        .collect()
}

const BOOKING_COLUMNS: Columns = &[
    ("id", Type::VARCHAR),
    ("amenity", Type::VARCHAR),
    ("resource_id", Type::VARCHAR),
    ("resource_label", Type::VARCHAR),
    ("floor_id", Type::INT8),
    ("date", Type::VARCHAR),
    ("start", Type::INT8),
    ("end", Type::INT8),
    ("occupants", Type::VARCHAR),
    ("owner", Type::VARCHAR),
    ("status", Type::VARCHAR),
];

const LEDGER_COLUMNS: Columns = &[
    ("id", Type::VARCHAR),
    ("amenity", Type::VARCHAR),
    ("booking_id", Type::VARCHAR),
    ("date", Type::VARCHAR),
    ("owner", Type::VARCHAR),
    ("details", Type::VARCHAR),
];

const AVAILABILITY_COLUMNS: Columns = &[
    ("amenity", Type::VARCHAR),
    ("at", Type::INT8),
    ("free", Type::INT8),
];

const RESOURCE_COLUMNS: Columns = &[
    ("id", Type::VARCHAR),
    ("amenity", Type::VARCHAR),
    ("label", Type::VARCHAR),
    ("capacity", Type::INT8),
    ("floor_id", Type::INT8),
];

const NOTIFICATION_COLUMNS: Columns = &[
    ("id", Type::VARCHAR),
    ("time", Type::INT8),
    ("title", Type::VARCHAR),
    ("message", Type::VARCHAR),
    ("token", Type::VARCHAR),
    ("booking_id", Type::VARCHAR),
];

fn booking_rows(bookings: Vec<Booking>, format: &Format) -> Response {
    let schema = Arc::new(fields(BOOKING_COLUMNS, format));
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.kind.as_str())?;
            encoder.encode_field(&b.resource_id.to_string())?;
            encoder.encode_field(&b.resource_label)?;
            encoder.encode_field(&i64::from(b.floor_id))?;
            encoder.encode_field(&b.date.to_string())?;
            encoder.encode_field(&b.span.start)?;
            encoder.encode_field(&b.span.end)?;
            encoder.encode_field(&b.occupants.join(","))?;
            encoder.encode_field(&b.owner)?;
            encoder.encode_field(&b.status)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn ledger_rows(entries: Vec<LedgerEntry>, format: &Format) -> Response {
    let schema = Arc::new(fields(LEDGER_COLUMNS, format));
    let rows: Vec<PgWireResult<_>> = entries
        .into_iter()
        .map(|e| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&e.id.to_string())?;
            encoder.encode_field(&e.kind.as_str())?;
            encoder.encode_field(&e.booking_id.to_string())?;
            encoder.encode_field(&e.date.to_string())?;
            encoder.encode_field(&e.owner)?;
            // JSON array: the occupants slot may itself contain commas.
            encoder.encode_field(&serde_json::Value::from(e.details).to_string())?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn resource_rows(resources: Vec<Resource>, format: &Format) -> Response {
    let schema = Arc::new(fields(RESOURCE_COLUMNS, format));
    let rows: Vec<PgWireResult<_>> = resources
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.kind.as_str())?;
            encoder.encode_field(&r.label)?;
            encoder.encode_field(&i64::from(r.capacity))?;
            encoder.encode_field(&i64::from(r.floor_id))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn notification_rows(notifications: Vec<Notification>, format: &Format) -> Response {
    let schema = Arc::new(fields(NOTIFICATION_COLUMNS, format));
    let rows: Vec<PgWireResult<_>> = notifications
        .into_iter()
        .map(|n| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&n.id.to_string())?;
            encoder.encode_field(&n.time)?;
            encoder.encode_field(&n.title)?;
            encoder.encode_field(&n.message)?;
            encoder.encode_field(&n.token)?;
            encoder.encode_field(&n.booking_id.map(|id| id.to_string()))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Result columns a statement will produce, read from its verb and target
/// table since parameters are not bound yet at describe time.
fn statement_columns(sql: &str) -> Columns {
    let Some((verb, table)) = sql::statement_target(sql) else {
        return &[];
    };
    match (verb, table.as_str()) {
        (Verb::Delete, _) => &[],
        (Verb::Select, "resources" | "free_resources") => RESOURCE_COLUMNS,
        (Verb::Select, "availability") => AVAILABILITY_COLUMNS,
        (Verb::Select, "ledger") => LEDGER_COLUMNS,
        (Verb::Select | Verb::Insert, "notifications") => NOTIFICATION_COLUMNS,
        (_, name) if AmenityKind::from_table_name(name).is_some() => BOOKING_COLUMNS,
        _ => &[],
    }
}

#[async_trait]
impl SimpleQueryHandler for RoomSlotHandler {
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
        self.run(query, &Format::UnifiedText).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoomSlotQueryParser;

#[async_trait]
impl QueryParser for RoomSlotQueryParser {
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
        let format = column_format.unwrap_or(&Format::UnifiedText);
        Ok(fields(statement_columns(stmt), format))
    }
}

#[async_trait]
impl ExtendedQueryHandler for RoomSlotHandler {
    type Statement = String;
    type QueryParser = RoomSlotQueryParser;

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
        let mut responses = self.run(&sql, &portal.result_column_format).await?;
        Ok(responses.remove(0))
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
        Ok(DescribeStatementResponse::new(
            param_types,
            fields(statement_columns(&target.statement), &Format::UnifiedText),
        ))
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
        Ok(DescribePortalResponse::new(fields(
            statement_columns(&target.statement.statement),
            &target.result_column_format,
        )))
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
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    substitute_text_params(&portal.statement.statement, &portal.parameters)
}

/// One left-to-right pass over the statement text. A `$N` is replaced only
/// where it appears in `sql`; substituted values are never rescanned.
/// Placeholders with no bound parameter are left as written.
fn substitute_text_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        result.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let param = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| params.get(idx));
        match param {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            Some(None) => result.push_str("NULL"),
            None => result.push_str(&rest[pos..pos + 1 + digits]),
        }
        rest = &after[digits..];
    }
    result.push_str(rest);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RoomSlotFactory {
    handler: Arc<RoomSlotHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<RoomSlotAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RoomSlotFactory {
    pub fn new(
        engine: Arc<Engine>,
        store: Arc<MemoryStore>,
        sender: Arc<dyn PushSender>,
        password: String,
    ) -> Self {
        let auth_source = RoomSlotAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(RoomSlotHandler::new(engine, store, sender)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoomSlotFactory {
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
    engine: Arc<Engine>,
    store: Arc<MemoryStore>,
    sender: Arc<dyn PushSender>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = RoomSlotFactory::new(engine, store, sender, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

fn store_err(e: StoreError) -> PgWireError {
    engine_err(EngineError::from(e))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM ledger WHERE owner = $1"), 1);
        assert_eq!(count_params("INSERT INTO users VALUES ($2, $1, $10)"), 10);
        assert_eq!(count_params("SELECT * FROM cafeteria_bookings"), 0);
    }

    #[test]
    fn describe_columns_by_statement() {
        let third = |sql: &str| statement_columns(sql)[2].0;
        assert_eq!(third("select * from availability where amenity = $1"), "free");
        assert_eq!(third("SELECT * FROM free_resources WHERE amenity = $1"), "label");
        assert_eq!(third("SELECT * FROM ledger WHERE owner = $1"), "booking_id");
        assert_eq!(
            statement_columns("INSERT INTO meeting_room_bookings VALUES ($1)").len(),
            BOOKING_COLUMNS.len()
        );
        assert!(statement_columns("DELETE FROM cafeteria_bookings WHERE id = $1").is_empty());
        assert!(statement_columns("INSERT INTO users VALUES ($1, $2)").is_empty());
        assert!(statement_columns("INSERT INTO broadcasts VALUES ($1, $2)").is_empty());
    }

    #[test]
    fn describe_ignores_table_names_inside_literals() {
        let sql = "SELECT * FROM meeting_room_bookings WHERE owner = 'ledger resources notifications'";
        assert_eq!(statement_columns(sql).len(), BOOKING_COLUMNS.len());
        let sql = "UPDATE cafeteria_bookings SET status = 'see availability' WHERE id = $1";
        assert_eq!(statement_columns(sql)[0].0, "id");
        assert_eq!(statement_columns(sql).len(), BOOKING_COLUMNS.len());
    }

    #[test]
    fn substitutes_quoted_text_params() {
        let params = vec![Some(b"o'brien".to_vec()), None, Some(b"x".to_vec())];
        assert_eq!(
            substitute_text_params("VALUES ($1, $2, $3)", &params),
            "VALUES ('o''brien', NULL, 'x')"
        );
        let mut many: Vec<Option<Vec<u8>>> = (1..=10).map(|i| Some(i.to_string().into_bytes())).collect();
        many[0] = Some(b"first".to_vec());
        assert_eq!(substitute_text_params("$1 $10", &many), "'first' '10'");
    }

    #[test]
    fn substituted_values_are_not_rescanned() {
        let params = vec![Some(b"tok".to_vec()), Some(b"costs $1 extra".to_vec())];
        assert_eq!(
            substitute_text_params("VALUES ($1, $2)", &params),
            "VALUES ('tok', 'costs $1 extra')"
        );
        let breakout = vec![Some(b"x".to_vec()), Some(b"$1) --".to_vec())];
        assert_eq!(
            substitute_text_params("VALUES ($2, $1)", &breakout),
            "VALUES ('$1) --', 'x')"
        );
        assert_eq!(substitute_text_params::<Vec<u8>>("cost $ and $9", &[]), "cost $ and $9");
    }
}
