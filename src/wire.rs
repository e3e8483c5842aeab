use std::fmt::Debug;
use std::sync::Arc;

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
use pgwire::messages::PgWireBackendMessage;
use ulid::Ulid;

use crate::auth::LendhubAuthSource;
use crate::engine::{now_ms, Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

pub struct LendhubHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<LendhubQueryParser>,
}

impl LendhubHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(LendhubQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        // One clock read per command so every classification in this request
        // agrees on "now".
        let now = now_ms();
        match cmd {
            Command::RegisterUser { id, name } => {
                engine.register_user(id, name).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::ListItem {
                id,
                owner_id,
                name,
                available,
            } => {
                engine
                    .list_item(id, owner_id, name, available)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SetItemAvailability { id, available } => {
                engine
                    .set_item_availability(id, available)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::RequestBooking {
                id,
                item_id,
                booker_id,
                start,
                end,
            } => {
                engine
                    .request_booking(id, item_id, booker_id, start, end, now)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DecideBooking {
                id,
                owner_id,
                approve,
            } => {
                engine
                    .decide_booking(id, owner_id, approve)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectBooking { id, viewer_id } => {
                let record = engine
                    .booking_for_participant(id, viewer_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![booking_rows(vec![record])?])
            }
            Command::SelectByBooker {
                booker_id,
                state,
                from,
                size,
            } => {
                let records = engine
                    .bookings_by_booker(booker_id, &state, from, size, now)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![booking_rows(records)?])
            }
            Command::SelectByOwner {
                owner_id,
                state,
                from,
                size,
            } => {
                let records = engine
                    .bookings_by_owner(owner_id, &state, from, size, now)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![booking_rows(records)?])
            }
            Command::SelectItemSchedule { item_id } => {
                let schedule = engine.item_schedule(item_id, now).await.map_err(engine_err)?;
                Ok(vec![schedule_rows(vec![schedule])?])
            }
            Command::SelectOwnerSchedules { owner_id } => {
                let schedules = engine
                    .owner_schedules(owner_id, now)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![schedule_rows(schedules)?])
            }
            Command::Listen { channel } => {
                parse_item_channel(&channel)?;
                // TODO: forward NotifyHub broadcasts to this session as
                // NotificationResponse frames; needs a per-connection task
                // with access to the backend message sink.
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                if let Some(channel) = channel {
                    parse_item_channel(&channel)?;
                }
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }
}

fn parse_item_channel(channel: &str) -> PgWireResult<Ulid> {
    let item_id_str = channel.strip_prefix("item_").ok_or_else(|| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!("invalid channel: {channel} (expected item_{{id}})"),
        )))
    })?;
    Ulid::from_string(item_id_str).map_err(|e| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!("bad ULID in channel: {e}"),
        )))
    })
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("item_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("booker_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("start".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("end".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("status".into(), None, None, Type::VARCHAR, FieldFormat::Text),
    ]
}

fn schedule_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("item_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("last_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("last_start".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("last_end".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("next_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("next_start".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("next_end".into(), None, None, Type::INT8, FieldFormat::Text),
    ]
}

fn booking_rows(records: Vec<BookingRecord>) -> PgWireResult<Response> {
    let schema = Arc::new(booking_schema());
    let rows: Vec<PgWireResult<_>> = records
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.item_id.to_string())?;
            encoder.encode_field(&r.booker_id.to_string())?;
            encoder.encode_field(&r.start)?;
            encoder.encode_field(&r.end)?;
            encoder.encode_field(&r.status.as_str())?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn schedule_rows(schedules: Vec<ItemSchedule>) -> PgWireResult<Response> {
    let schema = Arc::new(schedule_schema());
    let rows: Vec<PgWireResult<_>> = schedules
        .into_iter()
        .map(|s| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&s.item_id.to_string())?;
            encoder.encode_field(&s.last.as_ref().map(|b| b.id.to_string()))?;
            encoder.encode_field(&s.last.as_ref().map(|b| b.start))?;
            encoder.encode_field(&s.last.as_ref().map(|b| b.end))?;
            encoder.encode_field(&s.next.as_ref().map(|b| b.id.to_string()))?;
            encoder.encode_field(&s.next.as_ref().map(|b| b.start))?;
            encoder.encode_field(&s.next.as_ref().map(|b| b.end))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

#[async_trait]
impl SimpleQueryHandler for LendhubHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = std::time::Instant::now();
        let result = self.execute_command(&engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct LendhubQueryParser;

#[async_trait]
impl QueryParser for LendhubQueryParser {
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
        Ok(result_schema_for(stmt))
    }
}

/// Describe-time schema guess from the SQL text; the engine has not parsed
/// the statement yet at this point.
fn result_schema_for(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.contains("SELECT") {
        return vec![];
    }
    if upper.contains("SCHEDULE") {
        schedule_schema()
    } else if upper.contains("BOOKINGS") {
        booking_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl ExtendedQueryHandler for LendhubHandler {
    type Statement = String;
    type QueryParser = LendhubQueryParser;

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
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.execute_command(&engine, cmd).await?;
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
            result_schema_for(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema_for(
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
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    if n > max {
                        max = n;
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
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

pub struct LendhubFactory {
    handler: Arc<LendhubHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<LendhubAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl LendhubFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = LendhubAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(LendhubHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for LendhubFactory {
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

/// Serve one TCP connection through the pgwire machinery.
pub async fn process_connection(
    socket: tokio::net::TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<pgwire::tokio::TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = LendhubFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

/// SQLSTATE mapping: engine failures become ordinary Postgres errors that
/// client drivers already know how to surface.
fn engine_err(e: EngineError) -> PgWireError {
    let code = match &e {
        EngineError::NotFound(_) => "P0002",
        EngineError::Validation(_)
        | EngineError::Pagination { .. }
        | EngineError::UnsupportedState(_) => "22023",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::AlreadyDecided(_) | EngineError::SameParty(_) | EngineError::Unavailable(_) => {
            "55000"
        }
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
