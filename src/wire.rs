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

use crate::auth::ExambookAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, ReservationFilter, ResultSet};
use crate::tenant::TenantManager;

pub struct ExambookHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<ExambookQueryParser>,
}

impl ExambookHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(ExambookQueryParser),
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

    /// Parse and run one statement, recording RED metrics.
    async fn run(&self, engine: &Engine, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        let result_set = cmd.result_set();
        match cmd {
            // ── Plans ───────────────────────────────────────
            Command::InsertPlan(req) => {
                engine.create_plan(req).await.map_err(engine_err)?;
                Ok(insert_tag())
            }
            Command::UpdatePlan { id, changes } => {
                engine.update_plan(id, changes).await.map_err(engine_err)?;
                Ok(update_tag())
            }
            Command::ApprovePlan { id, approver } => {
                engine.approve_plan(id, approver).await.map_err(engine_err)?;
                Ok(update_tag())
            }
            Command::StartPlan { id } => {
                engine.start_plan(id).await.map_err(engine_err)?;
                Ok(update_tag())
            }
            Command::CompletePlan { id } => {
                engine.complete_plan(id).await.map_err(engine_err)?;
                Ok(update_tag())
            }
            Command::CancelPlan { id, reason } => {
                engine.cancel_plan(id, reason).await.map_err(engine_err)?;
                Ok(update_tag())
            }
            Command::SelectPlans { id, year } => {
                let plans = match id {
                    Some(id) => vec![engine.get_plan(id).await.map_err(engine_err)?],
                    None => engine.list_plans(year).await,
                };
                Ok(encode_rows(ResultSet::Plans, &plans, encode_plan))
            }

            // ── Schedules ───────────────────────────────────
            Command::InsertSchedule(req) => {
                engine.create_schedule(req).await.map_err(engine_err)?;
                Ok(insert_tag())
            }
            Command::UpdateCapacity { id, capacity } => {
                engine.update_capacity(id, capacity).await.map_err(engine_err)?;
                Ok(update_tag())
            }
            Command::SetScheduleActive { id, active } => {
                if active {
                    engine.reactivate_schedule(id).await.map_err(engine_err)?;
                } else {
                    engine.deactivate_schedule(id).await.map_err(engine_err)?;
                }
                Ok(update_tag())
            }
            Command::SelectSchedules { id, plan_id }
            | Command::SelectAvailability {
                schedule_id: id,
                plan_id,
            } => {
                let schedules = match (id, plan_id) {
                    (Some(id), _) => vec![engine.get_schedule(id).await.map_err(engine_err)?],
                    (None, Some(plan_id)) => {
                        engine.list_schedules(plan_id).await.map_err(engine_err)?
                    }
                    (None, None) => Vec::new(),
                };
                let rs = result_set.unwrap_or(ResultSet::Schedules);
                if rs == ResultSet::Availability {
                    Ok(encode_rows(rs, &schedules, encode_availability))
                } else {
                    Ok(encode_rows(rs, &schedules, encode_schedule))
                }
            }

            // ── Reservations ────────────────────────────────
            Command::InsertReservation {
                reservation,
                returning,
            } => {
                let created = engine
                    .create_reservation(reservation)
                    .await
                    .map_err(engine_err)?;
                if returning {
                    Ok(encode_rows(ResultSet::Reservations, &[created], encode_reservation))
                } else {
                    Ok(insert_tag())
                }
            }
            Command::CheckIn { id } => {
                engine.check_in(id).await.map_err(engine_err)?;
                Ok(update_tag())
            }
            Command::CheckOut { id } => {
                engine.check_out(id).await.map_err(engine_err)?;
                Ok(update_tag())
            }
            Command::CancelReservation { id, reason } => {
                engine
                    .cancel_reservation(id, reason)
                    .await
                    .map_err(engine_err)?;
                Ok(update_tag())
            }
            Command::SelectReservations(filter) => {
                let reservations = match filter {
                    ReservationFilter::Id(id) => {
                        vec![engine.get_reservation(id).await.map_err(engine_err)?]
                    }
                    ReservationFilter::Number(number) => engine
                        .get_reservation_by_number(&number)
                        .await
                        .into_iter()
                        .collect(),
                    ReservationFilter::Schedule(sid) => {
                        engine.list_reservations(sid).await.map_err(engine_err)?
                    }
                    ReservationFilter::Worker(worker) => {
                        engine.list_reservations_for_worker(&worker).await
                    }
                };
                Ok(encode_rows(
                    ResultSet::Reservations,
                    &reservations,
                    encode_reservation,
                ))
            }
            Command::SelectPlanProgress { plan_id } => {
                let progress = engine.plan_progress(plan_id).await.map_err(engine_err)?;
                Ok(encode_rows(ResultSet::PlanProgress, &[progress], encode_progress))
            }
        }
    }
}

fn insert_tag() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn update_tag() -> Response {
    Response::Execution(Tag::new("UPDATE").with_rows(1))
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn schema(rs: ResultSet) -> Vec<FieldInfo> {
    match rs {
        ResultSet::Plans => vec![
            field("id", Type::VARCHAR),
            field("year", Type::INT4),
            field("name", Type::VARCHAR),
            field("status", Type::VARCHAR),
            field("target_total", Type::INT8),
            field("target_general", Type::INT8),
            field("target_special", Type::INT8),
            field("target_night", Type::INT8),
            field("period_start", Type::INT8),
            field("period_end", Type::INT8),
            field("approver", Type::VARCHAR),
            field("notes", Type::VARCHAR),
            field("created_at", Type::INT8),
            field("approved_at", Type::INT8),
            field("started_at", Type::INT8),
            field("completed_at", Type::INT8),
            field("cancelled_at", Type::INT8),
            field("cancellation_reason", Type::VARCHAR),
        ],
        ResultSet::Schedules => vec![
            field("id", Type::VARCHAR),
            field("plan_id", Type::VARCHAR),
            field("start", Type::INT8),
            field("end", Type::INT8),
            field("institution", Type::VARCHAR),
            field("institution_address", Type::VARCHAR),
            field("institution_phone", Type::VARCHAR),
            field("exam_types", Type::VARCHAR),
            field("capacity", Type::INT8),
            field("reserved", Type::INT8),
            field("available", Type::INT8),
            field("active", Type::BOOL),
        ],
        ResultSet::Availability => vec![
            field("schedule_id", Type::VARCHAR),
            field("plan_id", Type::VARCHAR),
            field("start", Type::INT8),
            field("end", Type::INT8),
            field("capacity", Type::INT8),
            field("reserved", Type::INT8),
            field("available", Type::INT8),
            field("active", Type::BOOL),
        ],
        ResultSet::Reservations => vec![
            field("id", Type::VARCHAR),
            field("reservation_number", Type::VARCHAR),
            field("schedule_id", Type::VARCHAR),
            field("worker_ref", Type::VARCHAR),
            field("exam_types", Type::VARCHAR),
            field("status", Type::VARCHAR),
            field("delivery", Type::VARCHAR),
            field("phone", Type::VARCHAR),
            field("email", Type::VARCHAR),
            field("address", Type::VARCHAR),
            field("reserved_at", Type::INT8),
            field("checked_in_at", Type::INT8),
            field("checked_out_at", Type::INT8),
            field("cancelled_at", Type::INT8),
            field("cancellation_reason", Type::VARCHAR),
        ],
        ResultSet::PlanProgress => vec![
            field("plan_id", Type::VARCHAR),
            field("status", Type::VARCHAR),
            field("target_total", Type::INT8),
            field("schedules", Type::INT8),
            field("capacity", Type::INT8),
            field("reserved", Type::INT8),
            field("completed", Type::INT8),
            field("occupancy_pct", Type::FLOAT8),
        ],
    }
}

fn encode_rows<T>(
    rs: ResultSet,
    items: &[T],
    encode: fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema(rs));
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_plan(e: &mut DataRowEncoder, p: &Plan) -> PgWireResult<()> {
    e.encode_field(&p.id.to_string())?;
    e.encode_field(&p.year)?;
    e.encode_field(&p.name)?;
    e.encode_field(&p.status.as_str().to_string())?;
    e.encode_field(&i64::from(p.targets.total))?;
    e.encode_field(&i64::from(p.targets.general))?;
    e.encode_field(&i64::from(p.targets.special))?;
    e.encode_field(&i64::from(p.targets.night_work))?;
    e.encode_field(&p.period.start)?;
    e.encode_field(&p.period.end)?;
    e.encode_field(&p.approver)?;
    e.encode_field(&p.notes)?;
    e.encode_field(&p.created_at)?;
    e.encode_field(&p.approved_at)?;
    e.encode_field(&p.started_at)?;
    e.encode_field(&p.completed_at)?;
    e.encode_field(&p.cancelled_at)?;
    e.encode_field(&p.cancellation_reason)
}

fn encode_schedule(e: &mut DataRowEncoder, s: &ScheduleInfo) -> PgWireResult<()> {
    e.encode_field(&s.id.to_string())?;
    e.encode_field(&s.plan_id.to_string())?;
    e.encode_field(&s.window.start)?;
    e.encode_field(&s.window.end)?;
    e.encode_field(&s.institution.name)?;
    e.encode_field(&s.institution.address)?;
    e.encode_field(&s.institution.phone)?;
    e.encode_field(&format_exam_types(&s.exam_types))?;
    e.encode_field(&i64::from(s.total_capacity))?;
    e.encode_field(&i64::from(s.reserved_count))?;
    e.encode_field(&i64::from(s.available()))?;
    e.encode_field(&s.is_active)
}

fn encode_availability(e: &mut DataRowEncoder, s: &ScheduleInfo) -> PgWireResult<()> {
    e.encode_field(&s.id.to_string())?;
    e.encode_field(&s.plan_id.to_string())?;
    e.encode_field(&s.window.start)?;
    e.encode_field(&s.window.end)?;
    e.encode_field(&i64::from(s.total_capacity))?;
    e.encode_field(&i64::from(s.reserved_count))?;
    e.encode_field(&i64::from(s.available()))?;
    e.encode_field(&s.is_active)
}

fn encode_reservation(e: &mut DataRowEncoder, r: &Reservation) -> PgWireResult<()> {
    e.encode_field(&r.id.to_string())?;
    e.encode_field(&r.number)?;
    e.encode_field(&r.schedule_id.to_string())?;
    e.encode_field(&r.worker_ref)?;
    e.encode_field(&format_exam_types(&r.exam_types))?;
    e.encode_field(&r.status.as_str().to_string())?;
    e.encode_field(&r.delivery.as_str().to_string())?;
    e.encode_field(&r.contact.phone)?;
    e.encode_field(&r.contact.email)?;
    e.encode_field(&r.contact.address)?;
    e.encode_field(&r.reserved_at)?;
    e.encode_field(&r.checked_in_at)?;
    e.encode_field(&r.checked_out_at)?;
    e.encode_field(&r.cancelled_at)?;
    e.encode_field(&r.cancellation_reason)
}

fn encode_progress(e: &mut DataRowEncoder, p: &PlanProgress) -> PgWireResult<()> {
    e.encode_field(&p.plan_id.to_string())?;
    e.encode_field(&p.status.as_str().to_string())?;
    e.encode_field(&i64::from(p.target_total))?;
    e.encode_field(&(p.schedules as i64))?;
    e.encode_field(&(p.capacity as i64))?;
    e.encode_field(&(p.reserved as i64))?;
    e.encode_field(&(p.completed as i64))?;
    e.encode_field(&p.occupancy_pct())
}

fn describe_schema(sql: &str) -> Vec<FieldInfo> {
    sql::describe(sql).map(schema).unwrap_or_default()
}

#[async_trait]
impl SimpleQueryHandler for ExambookHandler {
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
        Ok(vec![self.run(&engine, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ExambookQueryParser;

#[async_trait]
impl QueryParser for ExambookQueryParser {
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
        Ok(describe_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ExambookHandler {
    type Statement = String;
    type QueryParser = ExambookQueryParser;

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
        self.run(&engine, &sql).await
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
            describe_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(describe_schema(
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
/// Highest index first, so `$1` never clobbers the prefix of `$10`.
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

pub struct ExambookFactory {
    handler: Arc<ExambookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<ExambookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl ExambookFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = ExambookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ExambookHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ExambookFactory {
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
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(ExambookFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

/// SQLSTATE for each engine error, so clients can tell "fully booked" from
/// "bad request" without parsing messages.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::NotFound(_) | EngineError::WorkerNotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::CapacityExceeded { .. } => "53400",
        EngineError::ConcurrencyConflict(_) => "40001",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
