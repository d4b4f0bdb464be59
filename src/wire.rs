use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
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

use crate::engine::{Engine, EngineError, Rejection};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};
use crate::store::VehicleScope;

pub struct FleetbookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<FleetbookQueryParser>,
}

impl FleetbookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(FleetbookQueryParser),
        }
    }

    /// Parse and run one statement, recording query metrics.
    async fn run(&self, query: &str, format: Option<&Format>) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        cmd: Command,
        format: Option<&Format>,
    ) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertVehicle { id, model, plate } => {
                engine
                    .register_vehicle(id, model, plate)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertReservation { request, returning } => {
                let id = engine.submit(request).await.map_err(engine_err)?;
                if !returning {
                    return Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))]);
                }
                let schema = Arc::new(returning_schema(format));
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&id.to_string())?;
                let rows: Vec<PgWireResult<_>> = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::CompleteReservation { id } => {
                engine.complete_reservation(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectVehicles { at, only_available } => {
                let reference = at.unwrap_or_else(|| engine.now());
                let listed = engine
                    .list_vehicles(reference, only_available)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(vehicles_schema(format));
                let rows: Vec<PgWireResult<_>> = listed
                    .into_iter()
                    .map(|v| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&v.vehicle.id.to_string())?;
                        encoder.encode_field(&v.vehicle.model)?;
                        encoder.encode_field(&v.vehicle.plate)?;
                        encoder.encode_field(&v.status.available)?;
                        encoder.encode_field(&v.status.unavailable_until.map(format_instant))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectReservations { vehicle_id } => {
                let scope = vehicle_id.map_or(VehicleScope::All, VehicleScope::One);
                let trips = engine.list_reservations(scope).await.map_err(engine_err)?;
                let buffer = engine.buffer();

                let schema = Arc::new(reservations_schema(format));
                let rows: Vec<PgWireResult<_>> = trips
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.vehicle_id.to_string())?;
                        encoder.encode_field(&format_instant(r.departure))?;
                        encoder.encode_field(&format_instant(r.arrival))?;
                        encoder.encode_field(&format_instant(r.delivery_deadline(buffer)))?;
                        encoder.encode_field(&r.driver_name)?;
                        encoder.encode_field(&r.registration)?;
                        encoder.encode_field(&r.phone)?;
                        encoder.encode_field(&r.destination)?;
                        encoder.encode_field(&r.notes)?;
                        encoder.encode_field(&r.completed)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
        }
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn fields(columns: &[(&str, Type)], format: Option<&Format>) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| {
            let field_format = format.map_or(FieldFormat::Text, |f| f.format_for(i));
            FieldInfo::new((*name).into(), None, None, ty.clone(), field_format)
        })
        .collect()
}

fn vehicles_schema(format: Option<&Format>) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("model", Type::VARCHAR),
            ("plate", Type::VARCHAR),
            ("available", Type::BOOL),
            ("unavailable_until", Type::VARCHAR),
        ],
        format,
    )
}

fn reservations_schema(format: Option<&Format>) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("vehicle_id", Type::VARCHAR),
            ("departure", Type::VARCHAR),
            ("arrival", Type::VARCHAR),
            ("delivery_deadline", Type::VARCHAR),
            ("driver_name", Type::VARCHAR),
            ("registration", Type::VARCHAR),
            ("phone", Type::VARCHAR),
            ("destination", Type::VARCHAR),
            ("notes", Type::VARCHAR),
            ("completed", Type::BOOL),
        ],
        format,
    )
}

fn returning_schema(format: Option<&Format>) -> Vec<FieldInfo> {
    fields(&[("id", Type::VARCHAR)], format)
}

/// Row description for a statement that has not run yet.
fn result_schema(sql: &str, format: Option<&Format>) -> Vec<FieldInfo> {
    let words: Vec<String> = sql
        .split_whitespace()
        .map(|w| w.trim_end_matches(';').to_uppercase())
        .collect();
    let from = words
        .windows(2)
        .find(|w| w[0] == "FROM")
        .map(|w| w[1].as_str());
    match words.first().map(String::as_str) {
        Some("SELECT") => match from {
            Some("VEHICLES") => vehicles_schema(format),
            Some("RESERVATIONS") => reservations_schema(format),
            _ => vec![],
        },
        Some("INSERT") if words.iter().any(|w| w == "RETURNING") => returning_schema(format),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for FleetbookHandler {
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
        self.run(query, None).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct FleetbookQueryParser;

#[async_trait]
impl QueryParser for FleetbookQueryParser {
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
        Ok(result_schema(stmt, column_format))
    }
}

#[async_trait]
impl ExtendedQueryHandler for FleetbookHandler {
    type Statement = String;
    type QueryParser = FleetbookQueryParser;

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
        let mut responses = self
            .run(&sql, Some(&portal.result_column_format))
            .await?;
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
            result_schema(&target.statement, None),
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
            Some(&target.result_column_format),
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
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute(&portal.statement.statement, &params)
}

/// Highest placeholder first, so `$1` never clobbers the prefix of `$10`.
fn substitute(sql: &str, params: &[Option<String>]) -> String {
    let mut result = sql.to_string();
    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(text) => format!("'{}'", text.replace('\'', "''")),
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Auth ─────────────────────────────────────────────────────────

/// A single shared password for every login.
#[derive(Debug)]
pub struct SharedPassword {
    password: String,
}

impl SharedPassword {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SharedPassword {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct FleetbookFactory {
    handler: Arc<FleetbookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SharedPassword, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl FleetbookFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(FleetbookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SharedPassword::new(password),
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for FleetbookFactory {
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
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(FleetbookFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Rejected(r) => match r {
            Rejection::MissingFields(_) => "23502",
            Rejection::DepartureInPast | Rejection::ArrivalNotAfterDeparture => "23514",
            Rejection::InvalidPhoneLength => "22023",
            Rejection::VehicleConflict { .. } => "23P01",
            Rejection::VehicleUnavailable => "55000",
        },
        EngineError::StoreUnavailable(_) => "58030",
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Field;
    use ulid::Ulid;

    #[test]
    fn placeholders_counted() {
        assert_eq!(count_params("SELECT * FROM vehicles"), 0);
        assert_eq!(
            count_params("INSERT INTO vehicles (id, model, plate) VALUES ($1, $2, $3)"),
            3
        );
        assert_eq!(count_params("SELECT * FROM reservations WHERE vehicle_id = $12"), 12);
    }

    #[test]
    fn substitution_quotes_and_nulls() {
        let sql = "INSERT INTO reservations (vehicle_id, notes, destination) VALUES ($1, $2, $3)";
        let out = substitute(
            sql,
            &[Some("01ARZ3NDEKTSV4RRFFQ69G5FAV".into()), None, Some("D'Ávila".into())],
        );
        assert_eq!(
            out,
            "INSERT INTO reservations (vehicle_id, notes, destination) VALUES ('01ARZ3NDEKTSV4RRFFQ69G5FAV', NULL, 'D''Ávila')"
        );
    }

    #[test]
    fn substitution_handles_double_digit_placeholders() {
        let params: Vec<Option<String>> = (1..=10).map(|i| Some(i.to_string())).collect();
        assert_eq!(substitute("$1,$10", &params), "'1','10'");
    }

    #[test]
    fn describe_schemas() {
        let names = |fields: Vec<FieldInfo>| -> Vec<String> {
            fields.iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(
            names(result_schema("select * from vehicles where at = $1", None)),
            ["id", "model", "plate", "available", "unavailable_until"]
        );
        assert_eq!(
            names(result_schema("SELECT * FROM reservations WHERE vehicle_id = $1", None)).len(),
            11
        );
        assert_eq!(
            names(result_schema(
                "INSERT INTO reservations (vehicle_id) VALUES ($1) RETURNING id",
                None
            )),
            ["id"]
        );
        assert!(result_schema("UPDATE reservations SET completed = true WHERE id = $1", None).is_empty());
    }

    #[test]
    fn rejections_map_to_sqlstates() {
        let cases = [
            (Rejection::MissingFields(vec![Field::Phone]), "23502"),
            (Rejection::DepartureInPast, "23514"),
            (Rejection::ArrivalNotAfterDeparture, "23514"),
            (Rejection::InvalidPhoneLength, "22023"),
            (
                Rejection::VehicleConflict {
                    reservation_id: Ulid::new(),
                    existing_departure: 0,
                    existing_arrival: 1,
                    delivery_deadline: 0,
                },
                "23P01",
            ),
            (Rejection::VehicleUnavailable, "55000"),
        ];
        for (rejection, code) in cases {
            assert_eq!(sqlstate(&EngineError::Rejected(rejection)), code);
        }
        assert_eq!(sqlstate(&EngineError::StoreUnavailable("down".into())), "58030");
        assert_eq!(sqlstate(&EngineError::NotFound(Ulid::new())), "P0002");
        assert_eq!(sqlstate(&EngineError::AlreadyExists(Ulid::new())), "23505");
        assert_eq!(sqlstate(&EngineError::LimitExceeded("x")), "54000");
    }
}
