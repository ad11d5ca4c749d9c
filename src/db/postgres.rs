//! PostgreSQL template-call client over sqlx.
//!
//! Each pooled connection is one `PgConnection`. Template calls are rendered to
//! `$n` SQL and run through the extended protocol; zero-value calls use the
//! simple protocol so multi-statement SQL keeps working.
//!
//! Text values are sent as text. When the server expects another type at a text
//! slot (an array column, `jsonb`, a timestamp), the slot is wrapped in an
//! explicit conversion to the type the server infers for it, so text input is
//! interpreted the same way an untyped literal would be.

use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use futures_util::TryStreamExt;
use sqlx::encode::IsNull;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{
    PgArgumentBuffer, PgArguments, PgConnectOptions, PgConnection, PgRow, PgSslMode, PgTypeInfo,
    PgValueFormat, PgValueRef,
};
use sqlx::query::Query;
use sqlx::{Column, Connection, Decode, Either, Encode, Executor, Postgres, Row, Type, TypeInfo, ValueRef};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, trace, warn};

use crate::config::{AdapterConfig, TlsOptions};
use crate::db::client::{Connector, NativeClient, NativeResult, ReservedClient, TemplateExecutor};
use crate::db::executor::Adapter;
use crate::db::placeholders::render_numbered;
use crate::error::{DbError, DbResult};
use crate::models::Value;

/// Create a Postgres adapter. Connections are opened lazily on first use.
pub fn connect(config: AdapterConfig) -> Adapter<PgConnector> {
    let connector = PgConnector::new(config.tls.clone());
    Adapter::with_connector(connector, &config)
}

// =============================================================================
// Connector
// =============================================================================

/// Opens `PgConnection`s with the configured TLS material.
#[derive(Debug, Clone, Default)]
pub struct PgConnector {
    tls: TlsOptions,
}

impl PgConnector {
    pub fn new(tls: TlsOptions) -> Self {
        Self { tls }
    }

    /// Parse `url` and apply TLS overrides. Without TLS enabled, the URL's own
    /// `sslmode` is left untouched.
    pub fn connect_options(&self, url: &str) -> DbResult<PgConnectOptions> {
        let mut options = PgConnectOptions::from_str(url)?;

        if self.tls.enabled {
            let mode = if self.tls.reject_unauthorized {
                PgSslMode::VerifyFull
            } else {
                PgSslMode::Require
            };
            options = options.ssl_mode(mode);

            if let Some(ca) = &self.tls.ca {
                options = options.ssl_root_cert_from_pem(ca.as_bytes().to_vec());
            }
            if let Some(cert) = &self.tls.cert {
                options = options.ssl_client_cert_from_pem(cert.as_bytes().to_vec());
            }
            if let Some(key) = &self.tls.key {
                options = options.ssl_client_key_from_pem(key.as_bytes().to_vec());
            }
        }

        Ok(options)
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Client = PgClient;

    async fn connect(&self, connection_string: &str) -> DbResult<PgClient> {
        let options = self.connect_options(connection_string)?;
        let conn = PgConnection::connect_with(&options).await?;
        debug!(host = options.get_host(), "Postgres connection opened");
        Ok(PgClient::new(conn))
    }
}

// =============================================================================
// Client
// =============================================================================

type SharedConnection = Arc<Mutex<Option<PgConnection>>>;

/// One physical Postgres connection.
pub struct PgClient {
    conn: SharedConnection,
    /// Set by `close` while someone else holds the connection; the holder
    /// closes it when done.
    close_requested: Arc<AtomicBool>,
}

impl PgClient {
    pub fn new(conn: PgConnection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            close_requested: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl TemplateExecutor for PgClient {
    async fn call(&self, fragments: &[String], values: Vec<Value>) -> DbResult<NativeResult> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(closed_error)?;
        let result = run_template(conn, fragments, values).await;
        if self.close_requested.load(Ordering::Acquire) {
            close_session(&mut guard).await;
        }
        result
    }
}

#[async_trait]
impl NativeClient for PgClient {
    type Reserved = PgReserved;

    async fn reserve(&self) -> DbResult<PgReserved> {
        let guard = Arc::clone(&self.conn).lock_owned().await;
        if guard.is_none() {
            return Err(closed_error());
        }
        Ok(PgReserved {
            session: Mutex::new(Some(guard)),
            close_requested: Arc::clone(&self.close_requested),
        })
    }

    /// Close now, or hand the close to whoever holds the connection so a
    /// reserved session never blocks disposal.
    async fn close(&self) -> DbResult<()> {
        self.close_requested.store(true, Ordering::Release);
        match self.conn.try_lock() {
            Ok(mut guard) => {
                if let Some(conn) = guard.take() {
                    conn.close().await?;
                }
            }
            Err(_) => debug!("Connection busy, closing once released"),
        }
        Ok(())
    }
}

/// Exclusive session on a [`PgClient`], held until released.
pub struct PgReserved {
    session: Mutex<Option<OwnedMutexGuard<Option<PgConnection>>>>,
    close_requested: Arc<AtomicBool>,
}

#[async_trait]
impl TemplateExecutor for PgReserved {
    async fn call(&self, fragments: &[String], values: Vec<Value>) -> DbResult<NativeResult> {
        let mut session = self.session.lock().await;
        let conn = session
            .as_deref_mut()
            .and_then(Option::as_mut)
            .ok_or_else(closed_error)?;
        run_template(conn, fragments, values).await
    }
}

#[async_trait]
impl ReservedClient for PgReserved {
    async fn release(&self) {
        let session = self.session.lock().await.take();
        if let Some(mut session) = session {
            if self.close_requested.load(Ordering::Acquire) {
                close_session(&mut session).await;
            }
        }
    }
}

async fn close_session(slot: &mut Option<PgConnection>) {
    if let Some(conn) = slot.take() {
        if let Err(e) = conn.close().await {
            debug!(error = %e, "Failed to close connection");
        }
    }
}

fn closed_error() -> DbError {
    DbError::connection(
        "Connection is closed",
        "Acquire a new connection from the adapter",
    )
}

// =============================================================================
// Execution
// =============================================================================

async fn run_template(
    conn: &mut PgConnection,
    fragments: &[String],
    values: Vec<Value>,
) -> DbResult<NativeResult> {
    let mut sql = if fragments.len() == 1 {
        fragments[0].clone()
    } else {
        render_numbered(fragments)
    };

    if fragments.len() == values.len() + 1 && values.iter().any(binds_as_text) {
        let types = infer_parameter_types(conn, &sql, &values).await?;
        if let Some(converted) = cast_text_slots(fragments, &values, &types) {
            sql = converted;
        }
    }
    trace!(sql = %sql, params = values.len(), "Running statement");

    // Bound types vary between calls of the same SQL, so nothing is cached per statement.
    let mut stream = if values.is_empty() {
        conn.fetch_many(sql.as_str())
    } else {
        let query = values
            .into_iter()
            .fold(sqlx::query(sql.as_str()).persistent(false), bind_value);
        conn.fetch_many(query)
    };

    let mut result = NativeResult::default();
    let mut affected: u64 = 0;
    let mut saw_command = false;

    while let Some(item) = stream.try_next().await? {
        match item {
            Either::Left(done) => {
                affected += done.rows_affected();
                saw_command = true;
            }
            Either::Right(row) => {
                if result.columns.is_empty() {
                    result.columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                }
                result.rows.push(decode_row(&row));
            }
        }
    }

    let returned = result.rows.len() as u64;
    result.count = if returned > 0 { returned } else { affected };
    if saw_command {
        result.affected_rows = Some(affected);
    }
    Ok(result)
}

/// Type names whose input needs no conversion from text.
const STRING_TYPES: [&str; 6] = [
    "text",
    "character varying",
    "character",
    "name",
    "citext",
    "unknown",
];

/// Whether a value is sent as text.
fn binds_as_text(value: &Value) -> bool {
    match value {
        Value::Text(_) => true,
        Value::BigInt(n) => i64::try_from(*n).is_err(),
        _ => false,
    }
}

/// Parameter type declared for `value` when asking the server for slot types.
fn declared_type(value: &Value) -> &'static str {
    match value {
        Value::Bool(_) => "boolean",
        Value::Int(_) => "bigint",
        Value::BigInt(n) if i64::try_from(*n).is_ok() => "bigint",
        Value::Float(_) => "double precision",
        Value::DateTime(_) => "timestamptz",
        Value::Bytes(_) => "bytea",
        Value::Array(_) | Value::Json(_) => "jsonb",
        Value::Null | Value::Text(_) | Value::BigInt(_) => "unknown",
    }
}

/// Ask the server which type it infers for every `$n` of `sql`, with text and
/// NULL slots left open. Output is `regtype` text, usable verbatim in a cast.
async fn infer_parameter_types(
    conn: &mut PgConnection,
    sql: &str,
    values: &[Value],
) -> DbResult<Vec<String>> {
    let name = format!("tagsql_{}", uuid::Uuid::new_v4().simple());
    let declared = values
        .iter()
        .map(declared_type)
        .collect::<Vec<_>>()
        .join(", ");
    let batch = format!(
        "PREPARE {name} ({declared}) AS {body}\n;\n\
         SELECT p.t::text FROM pg_prepared_statements, \
         unnest(parameter_types) WITH ORDINALITY AS p(t, n) \
         WHERE name = '{name}' ORDER BY p.n;\n\
         DEALLOCATE {name}",
        body = sql.trim_end().trim_end_matches(';'),
    );

    let rows: Vec<PgRow> = conn.fetch(batch.as_str()).try_collect().await?;
    rows.iter()
        .map(|row| row.try_get::<String, _>(0).map_err(DbError::from))
        .collect()
}

/// Re-render `fragments`, converting each text slot whose inferred type is not
/// a string type. `None` when no slot needs it.
pub fn cast_text_slots(fragments: &[String], values: &[Value], types: &[String]) -> Option<String> {
    let mut sql = String::new();
    let mut converted = false;

    for (i, fragment) in fragments.iter().enumerate() {
        if i > 0 {
            let target = types.get(i - 1).filter(|ty| {
                values.get(i - 1).is_some_and(binds_as_text)
                    && !STRING_TYPES.contains(&ty.as_str())
            });
            match target {
                Some(ty) => {
                    let _ = write!(sql, "(${i}::text::{ty})");
                    converted = true;
                }
                None => {
                    let _ = write!(sql, "${i}");
                }
            }
        }
        sql.push_str(fragment);
    }

    converted.then_some(sql)
}

/// A NULL whose type the server infers from the statement.
struct UntypedNull;

impl Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl Encode<'_, Postgres> for UntypedNull {
    fn encode_by_ref(
        &self,
        _buf: &mut PgArgumentBuffer,
    ) -> Result<IsNull, sqlx::error::BoxDynError> {
        Ok(IsNull::Yes)
    }
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(UntypedNull),
        Value::Bool(b) => query.bind(b),
        Value::Int(n) => query.bind(n),
        Value::Float(f) => query.bind(f),
        Value::BigInt(n) => match i64::try_from(n) {
            Ok(n) => query.bind(n),
            Err(_) => query.bind(n.to_string()),
        },
        Value::Text(s) => query.bind(s),
        Value::DateTime(dt) => query.bind(dt),
        Value::Bytes(bytes) => query.bind(bytes),
        value @ (Value::Array(_) | Value::Json(_)) => {
            query.bind(sqlx::types::Json(value.to_json()))
        }
    }
}

// =============================================================================
// Row Decoding
// =============================================================================

/// Logical category for Postgres column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    SmallInt,
    Integer,
    BigInt,
    Float,
    Double,
    Decimal,
    Boolean,
    Text,
    Uuid,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Json,
    Binary,
    Unknown,
}

/// Classify a Postgres type name (as sqlx reports it, e.g. `INT4`).
pub fn categorize_type(type_name: &str) -> TypeCategory {
    match type_name.to_ascii_uppercase().as_str() {
        "INT2" | "SMALLINT" | "SMALLSERIAL" => TypeCategory::SmallInt,
        "INT4" | "INT" | "INTEGER" | "SERIAL" => TypeCategory::Integer,
        "INT8" | "BIGINT" | "BIGSERIAL" => TypeCategory::BigInt,
        "FLOAT4" | "REAL" => TypeCategory::Float,
        "FLOAT8" | "DOUBLE PRECISION" => TypeCategory::Double,
        "NUMERIC" | "DECIMAL" | "MONEY" => TypeCategory::Decimal,
        "BOOL" | "BOOLEAN" => TypeCategory::Boolean,
        "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" | "CITEXT" => TypeCategory::Text,
        "UUID" => TypeCategory::Uuid,
        "DATE" => TypeCategory::Date,
        "TIME" | "TIMETZ" => TypeCategory::Time,
        "TIMESTAMP" => TypeCategory::Timestamp,
        "TIMESTAMPTZ" => TypeCategory::TimestampTz,
        "JSON" | "JSONB" => TypeCategory::Json,
        "BYTEA" => TypeCategory::Binary,
        _ => TypeCategory::Unknown,
    }
}

fn decode_row(row: &PgRow) -> Vec<Value> {
    (0..row.columns().len())
        .map(|idx| decode_column(row, idx))
        .collect()
}

fn decode_column(row: &PgRow, idx: usize) -> Value {
    let type_name = row.columns()[idx].type_info().name().to_string();

    if let Some(element) = type_name.strip_suffix("[]") {
        return decode_array(row, idx, categorize_type(element));
    }

    match categorize_type(&type_name) {
        TypeCategory::SmallInt => scalar(row, idx, |v: i16| Value::Int(v.into())),
        TypeCategory::Integer => scalar(row, idx, |v: i32| Value::Int(v.into())),
        TypeCategory::BigInt => scalar(row, idx, |v: i64| Value::BigInt(v.into())),
        TypeCategory::Float => scalar(row, idx, |v: f32| Value::Float(v.into())),
        TypeCategory::Double => scalar(row, idx, Value::Float),
        TypeCategory::Decimal => scalar(row, idx, |v: RawNumeric| Value::Text(v.0)),
        TypeCategory::Boolean => scalar(row, idx, Value::Bool),
        TypeCategory::Text => scalar(row, idx, Value::Text),
        TypeCategory::Uuid => scalar(row, idx, |v: uuid::Uuid| Value::Text(v.to_string())),
        TypeCategory::Date => scalar(row, idx, date_value),
        TypeCategory::Time => match row.columns()[idx].type_info().name() {
            "TIME" => scalar(row, idx, |v: NaiveTime| Value::Text(v.to_string())),
            _ => raw_text(row, idx),
        },
        TypeCategory::Timestamp => scalar(row, idx, |v: NaiveDateTime| Value::DateTime(v.and_utc())),
        TypeCategory::TimestampTz => scalar(row, idx, Value::DateTime),
        TypeCategory::Json => scalar(row, idx, Value::Json),
        TypeCategory::Binary => scalar(row, idx, Value::Bytes),
        TypeCategory::Unknown => raw_text(row, idx),
    }
}

fn decode_array(row: &PgRow, idx: usize, element: TypeCategory) -> Value {
    match element {
        TypeCategory::SmallInt => array(row, idx, |v: i16| Value::Int(v.into())),
        TypeCategory::Integer => array(row, idx, |v: i32| Value::Int(v.into())),
        TypeCategory::BigInt => array(row, idx, |v: i64| Value::BigInt(v.into())),
        TypeCategory::Float => array(row, idx, |v: f32| Value::Float(v.into())),
        TypeCategory::Double => array(row, idx, Value::Float),
        TypeCategory::Boolean => array(row, idx, Value::Bool),
        TypeCategory::Text => array(row, idx, Value::Text),
        TypeCategory::Uuid => array(row, idx, |v: uuid::Uuid| Value::Text(v.to_string())),
        TypeCategory::Date => array(row, idx, date_value),
        TypeCategory::Timestamp => array(row, idx, |v: NaiveDateTime| Value::DateTime(v.and_utc())),
        TypeCategory::TimestampTz => array(row, idx, Value::DateTime),
        TypeCategory::Json => array(row, idx, Value::Json),
        TypeCategory::Binary => array(row, idx, Value::Bytes),
        _ => raw_text(row, idx),
    }
}

fn date_value(date: NaiveDate) -> Value {
    Value::Text(date.format("%Y-%m-%d").to_string())
}

fn scalar<T, F>(row: &PgRow, idx: usize, map: F) -> Value
where
    T: for<'r> Decode<'r, Postgres> + Type<Postgres>,
    F: Fn(T) -> Value,
{
    match row.try_get::<Option<T>, _>(idx) {
        Ok(Some(v)) => map(v),
        Ok(None) => Value::Null,
        Err(e) => {
            warn!(column = idx, error = %e, "Falling back to text decoding");
            raw_text(row, idx)
        }
    }
}

fn array<T, F>(row: &PgRow, idx: usize, map: F) -> Value
where
    Vec<Option<T>>: for<'r> Decode<'r, Postgres> + Type<Postgres>,
    F: Fn(T) -> Value,
{
    match row.try_get::<Option<Vec<Option<T>>>, _>(idx) {
        Ok(Some(items)) => Value::Array(
            items
                .into_iter()
                .map(|item| item.map(&map).unwrap_or(Value::Null))
                .collect(),
        ),
        Ok(None) => Value::Null,
        Err(e) => {
            warn!(column = idx, error = %e, "Falling back to text decoding");
            raw_text(row, idx)
        }
    }
}

/// Text form of a value the typed decoders do not cover. Binary-format values
/// of unknown types decode to NULL.
fn raw_text(row: &PgRow, idx: usize) -> Value {
    match row.try_get_raw(idx) {
        Ok(raw) if raw.is_null() => Value::Null,
        Ok(raw) if matches!(raw.format(), PgValueFormat::Text) => raw
            .as_str()
            .map(|s| Value::Text(s.to_string()))
            .unwrap_or(Value::Null),
        Ok(_) => Value::Null,
        Err(e) => {
            warn!(column = idx, error = %e, "Failed to read raw column");
            Value::Null
        }
    }
}

// =============================================================================
// Numeric Support
// =============================================================================

/// NUMERIC value in its exact decimal text form.
#[derive(Debug)]
pub struct RawNumeric(pub String);

impl Type<Postgres> for RawNumeric {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("NUMERIC")
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        ty.name().eq_ignore_ascii_case("NUMERIC")
    }
}

impl<'r> Decode<'r, Postgres> for RawNumeric {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        match value.format() {
            PgValueFormat::Text => Ok(RawNumeric(value.as_str()?.to_string())),
            PgValueFormat::Binary => Ok(RawNumeric(numeric_to_string(value.as_bytes()?)?)),
        }
    }
}

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Render the binary NUMERIC wire format (base-10000 digits) as decimal text.
pub fn numeric_to_string(bytes: &[u8]) -> Result<String, sqlx::error::BoxDynError> {
    let word = |i: usize| -> Result<[u8; 2], sqlx::error::BoxDynError> {
        bytes
            .get(i * 2..i * 2 + 2)
            .and_then(|w| w.try_into().ok())
            .ok_or_else(|| "truncated NUMERIC value".into())
    };

    let ndigits = i16::from_be_bytes(word(0)?).max(0) as usize;
    let weight = i16::from_be_bytes(word(1)?) as i32;
    let sign = u16::from_be_bytes(word(2)?);
    let dscale = u16::from_be_bytes(word(3)?) as usize;

    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        _ => {}
    }

    let mut digits = Vec::with_capacity(ndigits);
    for i in 0..ndigits {
        digits.push(i16::from_be_bytes(word(4 + i)?));
    }
    let digit = |pos: i32| -> i16 {
        usize::try_from(pos)
            .ok()
            .and_then(|p| digits.get(p).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }

    if weight < 0 {
        out.push('0');
    } else {
        for pos in 0..=weight {
            if pos == 0 {
                let _ = write!(out, "{}", digit(pos));
            } else {
                let _ = write!(out, "{:04}", digit(pos));
            }
        }
    }

    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut pos = weight + 1;
        while fraction.len() < dscale {
            let _ = write!(fraction, "{:04}", digit(pos));
            pos += 1;
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }

    Ok(out)
}
