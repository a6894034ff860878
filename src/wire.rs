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
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::info;

use crate::auth::RoombookAuthSource;
use crate::calendar::format_local;
use crate::department::{DepartmentEngine, DepartmentManager};
use crate::engine::{EngineError, NewReservation, ReservationChange};
use crate::model::*;
use crate::observability::{self, command_label};
use crate::sql::{self, Command};

pub struct RoombookHandler {
    departments: Arc<DepartmentManager>,
    query_parser: Arc<RoombookQueryParser>,
}

impl RoombookHandler {
    pub fn new(departments: Arc<DepartmentManager>) -> Self {
        Self {
            departments,
            query_parser: Arc::new(RoombookQueryParser),
        }
    }

    /// Department engine and caller account for this connection.
    async fn resolve<C: ClientInfo>(
        &self,
        client: &C,
    ) -> PgWireResult<(Arc<DepartmentEngine>, Account)> {
        let metadata = client.metadata();
        let user = metadata.get("user").cloned().unwrap_or_default();
        let db = metadata.get("database").cloned().unwrap_or_else(|| user.clone());
        let engine = self.departments.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("department error: {e}"),
            )))
        })?;
        let account = engine
            .account(&user, self.departments.is_admin(&user))
            .await
            .map_err(engine_err)?;
        Ok((engine, account))
    }

    async fn execute(&self, engine: &DepartmentEngine, account: &Account, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, account, cmd).await;

        let granted = !matches!(&result, Err(e) if denies_access(e));
        info!(
            target: "access",
            account = %account.id,
            department = engine.department(),
            route = label,
            granted,
        );
        metrics::counter!(
            observability::ACCESS_TOTAL,
            "route" => label,
            "granted" => if granted { "true" } else { "false" }
        )
        .increment(1);
        metrics::counter!(
            observability::QUERIES_TOTAL,
            "command" => label,
            "status" => if result.is_ok() { "ok" } else { "error" }
        )
        .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());

        result.map_err(engine_err)
    }

    async fn execute_command(
        &self,
        engine: &DepartmentEngine,
        account: &Account,
        cmd: Command,
    ) -> Result<Vec<Response>, EngineError> {
        let tz = engine.config().tz;
        match cmd {
            Command::InsertReservation {
                resource_id,
                start,
                end,
                window,
            } => {
                let reservation = engine
                    .create_reservation(
                        account,
                        NewReservation {
                            resource_id,
                            start,
                            end,
                            window,
                        },
                    )
                    .await?;
                reservation_rows(engine, tz, vec![reservation])
            }
            Command::UpdateReservation {
                id,
                start,
                end,
                resource_id,
            } => {
                engine
                    .modify_reservation(
                        account,
                        id,
                        ReservationChange {
                            start,
                            end,
                            resource_id,
                        },
                    )
                    .await?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteReservation { token } => {
                engine.delete_reservation(account, &token).await?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectReservations => {
                let mine = engine.my_reservations(account).await?;
                reservation_rows(engine, tz, mine)
            }
            Command::SelectDepartmentReservations => {
                let all = engine.department_reservations(account).await?;
                reservation_rows(engine, tz, all)
            }
            Command::SelectCalendar { start, end } => {
                let items = engine.calendar(account, start, end).await?;
                calendar_rows(items)
            }
            Command::SelectAllReservations { start, end } => {
                let items = self.departments.oversight_calendar(account, start, end).await?;
                calendar_rows(items)
            }
            Command::SelectResources => {
                let schema = Arc::new(resource_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .resources()
                    .await?
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.room)?;
                        encoder.encode_field(&r.title)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectUsers => {
                let schema = Arc::new(user_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .roster(account)
                    .await?
                    .into_iter()
                    .map(|m| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&m.account)?;
                        encoder.encode_field(&m.role.as_str())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::InsertResource { id, room, title } => {
                engine
                    .add_resource(account, Resource { id, room, title })
                    .await?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertBlock {
                id,
                resource_id,
                start,
                end,
                note,
            } => {
                engine
                    .add_block(account, id, resource_id, start, end, note)
                    .await?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteBlock { id } => {
                engine.remove_block(account, id).await?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertUser { account: member, role } => {
                engine
                    .set_member(account, Member { account: member, role })
                    .await?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteUser { account: member } => {
                let removed = engine.remove_member(account, &member).await?;
                Ok(vec![Response::Execution(
                    Tag::new("DELETE").with_rows(usize::from(removed)),
                )])
            }
        }
    }
}

fn reservation_rows(
    engine: &DepartmentEngine,
    tz: chrono_tz::Tz,
    reservations: Vec<Reservation>,
) -> Result<Vec<Response>, EngineError> {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<_>> = reservations
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&engine.token_for(r.id))?;
            encoder.encode_field(&r.owner)?;
            encoder.encode_field(&r.resource_id.to_string())?;
            encoder.encode_field(&r.resource_name)?;
            encoder.encode_field(&r.span.start)?;
            encoder.encode_field(&r.span.end)?;
            encoder.encode_field(&format_local(r.span.start, tz))?;
            encoder.encode_field(&r.active)?;
            encoder.encode_field(&r.created_at)?;
            encoder.encode_field(&r.changed_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
}

fn calendar_rows(items: Vec<CalendarItem>) -> Result<Vec<Response>, EngineError> {
    let schema = Arc::new(calendar_schema());
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            match item {
                CalendarItem::Reservation(r) => {
                    encoder.encode_field(&"reservation")?;
                    encoder.encode_field(&r.id.to_string())?;
                    encoder.encode_field(&r.department)?;
                    encoder.encode_field(&r.resource_id.to_string())?;
                    encoder.encode_field(&r.owner)?;
                    encoder.encode_field(&r.span.start)?;
                    encoder.encode_field(&r.span.end)?;
                }
                CalendarItem::Block { department, block } => {
                    encoder.encode_field(&"block")?;
                    encoder.encode_field(&block.id.to_string())?;
                    encoder.encode_field(&department)?;
                    encoder.encode_field(&block.resource_id.to_string())?;
                    encoder.encode_field(&block.note)?;
                    encoder.encode_field(&block.span.start)?;
                    encoder.encode_field(&block.span.end)?;
                }
            }
            Ok(encoder.take_row())
        })
        .collect();
    Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
}

fn text(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        text("id", Type::VARCHAR),
        text("token", Type::VARCHAR),
        text("owner", Type::VARCHAR),
        text("resource_id", Type::VARCHAR),
        text("resource_name", Type::VARCHAR),
        text("start", Type::INT8),
        text("end", Type::INT8),
        text("start_local", Type::VARCHAR),
        text("active", Type::BOOL),
        text("created_at", Type::INT8),
        text("changed_at", Type::INT8),
    ]
}

fn calendar_schema() -> Vec<FieldInfo> {
    vec![
        text("kind", Type::VARCHAR),
        text("id", Type::VARCHAR),
        text("department", Type::VARCHAR),
        text("resource_id", Type::VARCHAR),
        text("title", Type::VARCHAR),
        text("start", Type::INT8),
        text("end", Type::INT8),
    ]
}

fn resource_schema() -> Vec<FieldInfo> {
    vec![
        text("id", Type::VARCHAR),
        text("room", Type::VARCHAR),
        text("title", Type::VARCHAR),
    ]
}

fn user_schema() -> Vec<FieldInfo> {
    vec![text("account", Type::VARCHAR), text("role", Type::VARCHAR)]
}

/// Result columns for a statement, before parameters are bound.
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if upper.contains("CALENDAR") || upper.contains("ALL_RESERVATIONS") {
        calendar_schema()
    } else if upper.contains("RESERVATIONS")
        && (upper.trim_start().starts_with("SELECT") || upper.trim_start().starts_with("INSERT"))
    {
        reservation_schema()
    } else if upper.trim_start().starts_with("SELECT") && upper.contains("RESOURCES") {
        resource_schema()
    } else if upper.trim_start().starts_with("SELECT") && upper.contains("USERS") {
        user_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for RoombookHandler {
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
        let (engine, account) = self.resolve(client).await?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.execute(&engine, &account, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoombookQueryParser;

#[async_trait]
impl QueryParser for RoombookQueryParser {
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
impl ExtendedQueryHandler for RoombookHandler {
    type Statement = String;
    type QueryParser = RoombookQueryParser;

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
        let (engine, account) = self.resolve(client).await?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.execute(&engine, &account, cmd)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PgWireError::ApiError("command produced no response".into()))
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
    bind_params(&portal.statement.statement, &portal.parameters)
}

/// One left-to-right pass, so bound text is never rescanned. Placeholders
/// inside string literals and unknown indexes are left as written.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_literal = false;
    let mut chars = sql.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '\'' {
            in_literal = !in_literal;
        }
        if c != '$' || in_literal {
            out.push(c);
            continue;
        }
        let mut end = i + 1;
        while let Some(&(j, d)) = chars.peek() {
            if !d.is_ascii_digit() {
                break;
            }
            end = j + 1;
            chars.next();
        }
        let param = sql[i + 1..end]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| params.get(idx));
        match param {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&sql[i..end]),
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RoombookFactory {
    handler: Arc<RoombookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<RoombookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl RoombookFactory {
    pub fn new(departments: Arc<DepartmentManager>, password: String) -> Self {
        let auth_source = RoombookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(RoombookHandler::new(departments)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoombookFactory {
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
    departments: Arc<DepartmentManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = RoombookFactory::new(departments, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

/// Rejections recorded as refused access rather than as failed requests.
fn denies_access(e: &EngineError) -> bool {
    matches!(e, EngineError::Forbidden(_) | EngineError::BadIntegrityToken)
}

/// SQLSTATE for each rejection kind.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Overlap(_) => "23P01",
        EngineError::QuotaExceeded { .. } => "53400",
        EngineError::Forbidden(_) => "42501",
        EngineError::BadIntegrityToken => "22023",
        EngineError::Validation(_) => "22000",
        EngineError::NotFound(_) => "02000",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::StorageFailure(_) => "58000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.user_message(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
