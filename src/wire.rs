use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
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
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::{TlsAcceptor, process_socket};
use tokio::net::TcpStream;

use crate::auth::WardbookAuthSource;
use crate::engine::{BookingRequest, Engine, EngineError};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, SqlError};

/// Actor recorded on reservations when the client sent no user name.
const ANONYMOUS_ACTOR: &str = "anonymous";

pub struct WardbookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<WardbookQueryParser>,
}

impl WardbookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(WardbookQueryParser),
        }
    }

    async fn run<C: ClientInfo>(&self, client: &C, sql: &str) -> PgWireResult<Response> {
        let actor = client
            .metadata()
            .get("user")
            .cloned()
            .unwrap_or_else(|| ANONYMOUS_ACTOR.to_string());
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);

        let started = Instant::now();
        let result = self.execute_command(cmd, actor).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);

        result.map_err(engine_err)
    }

    async fn execute_command(&self, cmd: Command, actor: String) -> Result<Response, EngineError> {
        let engine = &self.engine;
        match cmd {
            Command::InsertResource { resource } => {
                engine.register_resource(resource).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteResource { id } => {
                engine.remove_resource(id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectResources { id } => {
                let resources = match id {
                    Some(id) => vec![engine.get_resource(id).await?],
                    None => engine.list_resources().await,
                };
                Ok(resource_rows(&resources))
            }
            Command::SelectAvailability {
                date,
                start,
                end,
                filter,
            } => {
                let resources = engine.find_available(date, start, end, &filter).await?;
                Ok(resource_rows(&resources))
            }
            Command::InsertReservation {
                resource_id,
                date,
                start,
                end,
                motif,
            } => {
                let reservation = engine
                    .book(BookingRequest {
                        resource_id,
                        date,
                        start,
                        end,
                        motif,
                        actor,
                    })
                    .await?;
                Ok(reservation_rows(std::slice::from_ref(&reservation)))
            }
            Command::DeleteReservation { id } => {
                engine.cancel(id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectReservations { resource_id, date } => {
                let reservations = engine.reservations_for(resource_id, date).await;
                Ok(reservation_rows(&reservations))
            }
            Command::SelectReservation { id } => {
                let reservation = engine.get_reservation(id).await?;
                Ok(reservation_rows(std::slice::from_ref(&reservation)))
            }
            Command::SelectFreeWindows {
                resource_id,
                date,
                start,
                end,
            } => {
                let window = match (start, end) {
                    (None, None) => Span::whole_day(),
                    _ => Span::try_new(
                        start.unwrap_or(TimeOfDay::MIDNIGHT),
                        end.unwrap_or(TimeOfDay::END_OF_DAY),
                    )
                    .ok_or_else(|| EngineError::InvalidRange("start must be before end".into()))?,
                };
                let windows = engine.free_windows(resource_id, date, window).await?;
                Ok(window_rows(resource_id, date, &windows))
            }
        }
    }
}

// ── Row encoding ─────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn resource_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        text_field("kind"),
        FieldInfo::new("capacity".into(), None, None, Type::INT4, FieldFormat::Text),
        text_field("equipment"),
    ]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("resource_id"),
        text_field("date"),
        text_field("start"),
        text_field("end"),
        text_field("motif"),
        text_field("created_by"),
        text_field("status"),
        text_field("created_at"),
    ]
}

fn window_schema() -> Vec<FieldInfo> {
    vec![
        text_field("resource_id"),
        text_field("date"),
        text_field("start"),
        text_field("end"),
    ]
}

fn resource_rows(resources: &[Resource]) -> Response {
    let schema = Arc::new(resource_schema());
    let rows: Vec<PgWireResult<_>> = resources
        .iter()
        .map(|r| {
            let equipment = serde_json::to_string(&r.equipment)
                .map_err(|e| PgWireError::ApiError(Box::new(e)))?;
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.name)?;
            encoder.encode_field(&r.kind)?;
            encoder.encode_field(&i32::try_from(r.capacity).unwrap_or(i32::MAX))?;
            encoder.encode_field(&equipment)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn reservation_rows(reservations: &[Reservation]) -> Response {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<_>> = reservations
        .iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.resource_id.to_string())?;
            encoder.encode_field(&r.date.to_string())?;
            encoder.encode_field(&r.span.start.to_string())?;
            encoder.encode_field(&r.span.end.to_string())?;
            encoder.encode_field(&r.motif)?;
            encoder.encode_field(&r.created_by)?;
            encoder.encode_field(&r.status.as_str().to_string())?;
            encoder.encode_field(&r.created_at.to_rfc3339())?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn window_rows(resource_id: ulid::Ulid, date: chrono::NaiveDate, windows: &[Span]) -> Response {
    let schema = Arc::new(window_schema());
    let rid = resource_id.to_string();
    let day = date.to_string();
    let rows: Vec<PgWireResult<_>> = windows
        .iter()
        .map(|w| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&rid)?;
            encoder.encode_field(&day)?;
            encoder.encode_field(&w.start.to_string())?;
            encoder.encode_field(&w.end.to_string())?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Result columns for a statement, judged from its text before parameters are bound.
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let is_select = upper.trim_start().starts_with("SELECT");
    if upper.contains("FREE_WINDOWS") {
        window_schema()
    } else if upper.contains("RESERVATIONS") && (is_select || upper.trim_start().starts_with("INSERT")) {
        reservation_schema()
    } else if is_select && (upper.contains("AVAILABILITY") || upper.contains("RESOURCES")) {
        resource_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for WardbookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct WardbookQueryParser;

#[async_trait]
impl QueryParser for WardbookQueryParser {
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
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for WardbookHandler {
    type Statement = String;
    type QueryParser = WardbookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
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
        self.run(client, &sql).await
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
            schema_for(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for(
            &target.statement.statement,
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
            if let Ok(n) = sql[start..i].parse::<usize>() {
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
    bind_params(&portal.statement.statement, &portal.parameters)
}

/// One left-to-right pass over the statement text. Bound values are emitted
/// as quoted literals and never rescanned, so a `$2` inside a value stays text.
/// Placeholders with no bound parameter are left as written.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let bytes = sql.as_bytes();
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let digits = i + 1;
        let mut j = digits;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        let param = sql[digits..j]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| params.get(idx));
        if let Some(param) = param {
            out.push_str(&sql[copied..i]);
            match param {
                Some(value) => {
                    let text = String::from_utf8_lossy(value.as_ref());
                    out.push('\'');
                    out.push_str(&text.replace('\'', "''"));
                    out.push('\'');
                }
                None => out.push_str("NULL"),
            }
            copied = j;
        }
        i = j;
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct WardbookFactory {
    handler: Arc<WardbookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<WardbookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl WardbookFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = WardbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(WardbookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for WardbookFactory {
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

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(WardbookFactory::new(engine, password));
    process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}
