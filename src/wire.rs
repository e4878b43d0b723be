use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
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
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::SlotSwapAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{self, AUTH_FAILURES_TOTAL, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct SlotSwapHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotSwapQueryParser>,
}

impl SlotSwapHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotSwapQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    /// The acting user: the login name, which must be a ULID.
    fn resolve_principal<C: ClientInfo>(&self, client: &C) -> PgWireResult<Ulid> {
        let user = client.metadata().get("user").cloned().unwrap_or_default();
        Ulid::from_string(&user).map_err(|_| {
            metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
            user_error("28000", format!("login user {user:?} is not a ULID user id"))
        })
    }

    /// Parse, execute and record metrics for one statement.
    async fn run<C: ClientInfo>(&self, client: &C, sql: &str) -> PgWireResult<Response> {
        let engine = self.resolve_engine(client)?;
        let principal = self.resolve_principal(client)?;
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;

        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&engine, principal, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        principal: Ulid,
        cmd: Command,
    ) -> PgWireResult<Response> {
        match cmd {
            Command::InsertUser { id, name } => {
                if id.is_some_and(|id| id != principal) {
                    return Err(user_error("42501", "users can only register themselves".into()));
                }
                engine.register_user(principal, name).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertSlot { title, start, end, status } => {
                let slot = engine
                    .create_slot(principal, title, start, end, status)
                    .await
                    .map_err(engine_err)?;
                slot_rows(vec![slot])
            }
            Command::UpdateSlot { id, patch } => {
                let slot = engine.update_slot(principal, id, patch).await.map_err(engine_err)?;
                slot_rows(vec![slot])
            }
            Command::DeleteSlot { id } => {
                engine.delete_slot(principal, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertSwapRequest { my_slot_id, their_slot_id } => {
                let request = engine
                    .propose(principal, my_slot_id, their_slot_id)
                    .await
                    .map_err(engine_err)?;
                request_rows(vec![request])
            }
            Command::RespondSwap { id, accept } => {
                let request = engine.respond(principal, id, accept).await.map_err(engine_err)?;
                request_rows(vec![request])
            }
            Command::SelectSlots => slot_rows(engine.list_slots(principal).await),
            Command::SelectSwappableSlots => swappable_rows(engine.list_swappable().await),
            Command::SelectIncoming => view_rows(engine.list_incoming(principal).await),
            Command::SelectOutgoing => view_rows(engine.list_outgoing(principal).await),
        }
    }
}

// ── Row schemas ──────────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("owner_id"),
        text("title"),
        int8("start"),
        int8("end"),
        text("status"),
    ]
}

fn swappable_schema() -> Vec<FieldInfo> {
    let mut schema = slot_schema();
    schema.push(text("owner_name"));
    schema
}

fn request_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("requester_id"),
        text("offered_slot_id"),
        text("requested_slot_id"),
        text("status"),
        int8("created_at"),
    ]
}

fn view_schema() -> Vec<FieldInfo> {
    let mut schema = request_schema();
    schema.push(text("requester_name"));
    for side in ["offered", "requested"] {
        schema.push(text(&format!("{side}_title")));
        schema.push(int8(&format!("{side}_start")));
        schema.push(int8(&format!("{side}_end")));
        schema.push(text(&format!("{side}_owner_id")));
        schema.push(text(&format!("{side}_status")));
    }
    schema
}

/// Result columns for a statement, from its table name. Used by Describe,
/// before parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if upper.trim_start().starts_with("DELETE") || upper.contains("USERS") {
        vec![]
    } else if upper.contains("SWAPPABLE_SLOTS") {
        swappable_schema()
    } else if upper.contains("INCOMING_REQUESTS") || upper.contains("OUTGOING_REQUESTS") {
        view_schema()
    } else if upper.contains("SWAP_REQUESTS") {
        request_schema()
    } else if upper.contains("SLOTS") {
        slot_schema()
    } else {
        vec![]
    }
}

// ── Row encoding ─────────────────────────────────────────────────

fn encode_slot(encoder: &mut DataRowEncoder, slot: &Slot) -> PgWireResult<()> {
    encoder.encode_field(&slot.id.to_string())?;
    encoder.encode_field(&slot.owner.to_string())?;
    encoder.encode_field(&slot.title)?;
    encoder.encode_field(&slot.span.start)?;
    encoder.encode_field(&slot.span.end)?;
    encoder.encode_field(&slot.status.to_string())?;
    Ok(())
}

fn encode_request(encoder: &mut DataRowEncoder, request: &SwapRequest) -> PgWireResult<()> {
    encoder.encode_field(&request.id.to_string())?;
    encoder.encode_field(&request.requester.to_string())?;
    encoder.encode_field(&request.offered_slot.to_string())?;
    encoder.encode_field(&request.requested_slot.to_string())?;
    encoder.encode_field(&request.status.to_string())?;
    encoder.encode_field(&request.created_at)?;
    Ok(())
}

/// One side of a swap view; all NULL once the slot is deleted.
fn encode_side(encoder: &mut DataRowEncoder, slot: Option<&Slot>) -> PgWireResult<()> {
    encoder.encode_field(&slot.map(|s| s.title.clone()))?;
    encoder.encode_field(&slot.map(|s| s.span.start))?;
    encoder.encode_field(&slot.map(|s| s.span.end))?;
    encoder.encode_field(&slot.map(|s| s.owner.to_string()))?;
    encoder.encode_field(&slot.map(|s| s.status.to_string()))?;
    Ok(())
}

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn slot_rows(slots: Vec<Slot>) -> PgWireResult<Response> {
    rows(slot_schema(), slots, encode_slot)
}

fn swappable_rows(slots: Vec<SwappableSlot>) -> PgWireResult<Response> {
    rows(swappable_schema(), slots, |encoder, s| {
        encode_slot(encoder, &s.slot)?;
        encoder.encode_field(&s.owner_name)
    })
}

fn request_rows(requests: Vec<SwapRequest>) -> PgWireResult<Response> {
    rows(request_schema(), requests, encode_request)
}

fn view_rows(views: Vec<SwapView>) -> PgWireResult<Response> {
    rows(view_schema(), views, |encoder, v| {
        encode_request(encoder, &v.request)?;
        encoder.encode_field(&v.requester_name)?;
        encode_side(encoder, v.offered.as_ref())?;
        encode_side(encoder, v.requested.as_ref())
    })
}

// ── Simple Query Protocol ────────────────────────────────────────

#[async_trait]
impl SimpleQueryHandler for SlotSwapHandler {
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
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotSwapQueryParser;

#[async_trait]
impl QueryParser for SlotSwapQueryParser {
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotSwapHandler {
    type Statement = String;
    type QueryParser = SlotSwapQueryParser;

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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// Highest `$N` placeholder in the SQL string.
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

/// Substitute $1, $2, ... with bound parameter values as quoted text.
fn substitute_params(portal: &Portal<String>) -> String {
    bind_text_params(&portal.statement.statement, &portal.parameters)
}

/// One left-to-right pass over the statement: each `$N` outside a string
/// literal is replaced once, and bound text is never rescanned.
fn bind_text_params(sql: &str, params: &[Option<Bytes>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut in_literal = false;
    let mut rest = sql;
    while let Some(c) = rest.chars().next() {
        if c == '\'' {
            in_literal = !in_literal;
        }
        if c == '$' && !in_literal {
            let digits = rest[1..].bytes().take_while(u8::is_ascii_digit).count();
            if let Ok(n) = rest[1..1 + digits].parse::<usize>()
                && let Some(param) = n.checked_sub(1).and_then(|i| params.get(i))
            {
                match param {
                    Some(bytes) => {
                        let text = String::from_utf8_lossy(bytes);
                        result.push('\'');
                        result.push_str(&text.replace('\'', "''"));
                        result.push('\'');
                    }
                    None => result.push_str("NULL"),
                }
                rest = &rest[1 + digits..];
                continue;
            }
        }
        result.push(c);
        rest = &rest[c.len_utf8()..];
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotSwapFactory {
    handler: Arc<SlotSwapHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SlotSwapAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SlotSwapFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SlotSwapAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotSwapHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotSwapFactory {
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

/// Serve one client connection to completion.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(SlotSwapFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for an engine failure. `40001` (serialization_failure) is the
/// only code a client should retry.
pub fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::InvalidSlot { .. } => "22023",
        EngineError::Forbidden(_) => "42501",
        EngineError::AlreadyResolved { .. } => "55000",
        EngineError::Conflict(_) => "40001",
        EngineError::SlotPending(_) => "55006",
        EngineError::InvalidTransition { .. } => "22023",
        EngineError::InvalidSpan { .. } => "22008",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflict_is_retryable_sqlstate() {
        let id = Ulid::new();
        let errors = [
            EngineError::NotFound(id),
            EngineError::InvalidSlot { id, reason: "x" },
            EngineError::Forbidden(id),
            EngineError::AlreadyResolved { id, status: SwapStatus::Accepted },
            EngineError::Conflict(id),
            EngineError::SlotPending(id),
            EngineError::LimitExceeded("x"),
        ];
        for e in &errors {
            assert_eq!(engine_sqlstate(e) == "40001", e.is_retryable(), "{e}");
        }
        assert_eq!(engine_sqlstate(&EngineError::NotFound(id)), "P0002");
        assert_eq!(engine_sqlstate(&EngineError::Forbidden(id)), "42501");
    }

    #[test]
    fn schema_by_table() {
        assert_eq!(result_schema("SELECT * FROM slots").len(), 6);
        assert_eq!(result_schema("SELECT * FROM swappable_slots").len(), 7);
        assert_eq!(result_schema("SELECT * FROM incoming_requests").len(), 17);
        assert_eq!(
            result_schema("INSERT INTO swap_requests (my_slot_id, their_slot_id) VALUES ($1, $2)")
                .len(),
            6
        );
        assert!(result_schema("DELETE FROM slots WHERE id = $1").is_empty());
        assert!(result_schema("INSERT INTO users (name) VALUES ($1)").is_empty());
    }

    #[test]
    fn params_counted_and_bound() {
        let sql = "UPDATE swap_requests SET status = $2 WHERE id = $1";
        assert_eq!(count_params(sql), 2);
        let params = vec![
            Some(Bytes::from_static(b"01ARZ3NDEKTSV4RRFFQ69G5FAV")),
            Some(Bytes::from_static(b"ACCEPTED")),
        ];
        assert_eq!(
            bind_text_params(sql, &params),
            "UPDATE swap_requests SET status = 'ACCEPTED' WHERE id = '01ARZ3NDEKTSV4RRFFQ69G5FAV'"
        );
    }

    #[test]
    fn bound_params_are_quoted() {
        let params = vec![Some(Bytes::from_static(b"o'clock")), None];
        assert_eq!(
            bind_text_params("VALUES ($1, $2)", &params),
            "VALUES ('o''clock', NULL)"
        );
    }

    #[test]
    fn bound_text_is_not_rebound() {
        let sql = "UPDATE slots SET title = $2 WHERE id = $1";
        let params = vec![
            Some(Bytes::from_static(b"01ARZ3NDEKTSV4RRFFQ69G5FAV")),
            Some(Bytes::from_static(b"Pay $1 fee")),
        ];
        let bound = bind_text_params(sql, &params);
        assert_eq!(
            bound,
            "UPDATE slots SET title = 'Pay $1 fee' WHERE id = '01ARZ3NDEKTSV4RRFFQ69G5FAV'"
        );
        match crate::sql::parse_sql(&bound) {
            Ok(Command::UpdateSlot { patch, .. }) => {
                assert_eq!(patch.title.as_deref(), Some("Pay $1 fee"))
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn double_digit_and_literal_placeholders() {
        let params: Vec<_> = (1..=10).map(|i| Some(Bytes::from(format!("v{i}")))).collect();
        assert_eq!(bind_text_params("($10, $1, '$2')", &params), "('v10', 'v1', '$2')");
        assert_eq!(bind_text_params("($3)", &params[..1]), "($3)");
    }
}
