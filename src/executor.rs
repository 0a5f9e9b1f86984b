use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures_util::stream::BoxStream;
use futures_util::TryStreamExt;
use log::{debug, error, info};
use serde::Serialize;
use serde_json::{json, Map, Value};
use sqlx::mysql::{MySqlArguments, MySqlConnection, MySqlRow};
use sqlx::query::Query;
use sqlx::{Column, MySql, Row, TypeInfo};
use std::time::{Duration, Instant};

use crate::db::Checkout;
use crate::error::DbError;

#[derive(Debug, Clone)]
pub struct QueryLimits {
    pub row_limit: usize,
    pub timeout: Duration,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            row_limit: 1000,
            timeout: Duration::from_millis(10_000),
        }
    }
}

/// One statement to run on behalf of a tool call.
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub sql: String,
    pub database: Option<String>,
    pub params: Vec<Value>,
}

impl QueryRequest {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            ..Self::default()
        }
    }

    pub fn in_database(mut self, database: Option<String>) -> Self {
        self.database = database;
        self
    }

    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<Map<String, Value>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryResult {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            ..Self::default()
        }
    }

    fn from_rows(rows: FetchedRows, elapsed: Duration) -> Self {
        Self {
            success: true,
            row_count: Some(rows.rows.len()),
            truncated: Some(rows.total > rows.rows.len()),
            results: Some(rows.rows),
            fields: Some(rows.fields),
            execution_time_ms: Some(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)),
            error: None,
        }
    }
}

#[derive(Debug, Default)]
struct FetchedRows {
    rows: Vec<Map<String, Value>>,
    fields: Vec<String>,
    total: usize,
}

/// Keeps the first `limit` rows and counts everything it is offered.
struct RowCap {
    limit: usize,
    fetched: FetchedRows,
}

impl RowCap {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            fetched: FetchedRows::default(),
        }
    }

    fn offer(&mut self, fields: impl FnOnce() -> Vec<String>, row: impl FnOnce() -> Map<String, Value>) {
        if self.fetched.total == 0 {
            self.fetched.fields = fields();
        }
        self.fetched.total += 1;
        if self.fetched.rows.len() < self.limit {
            self.fetched.rows.push(row());
        }
    }

    fn finish(self) -> FetchedRows {
        self.fetched
    }
}

/// Run `request` on `checkout` and shape the outcome.
///
/// The checkout is always released before this returns, and driver errors
/// come back as a failed [`QueryResult`] rather than an `Err`.
pub async fn execute(mut checkout: Checkout, request: &QueryRequest, limits: &QueryLimits) -> QueryResult {
    let outcome = run(&mut checkout, request, limits).await;
    checkout.release().await;

    match outcome {
        Ok(result) => result,
        Err(e) => {
            error!("Query execution failed: {e}");
            QueryResult::failure(e.to_string())
        }
    }
}

async fn run(checkout: &mut Checkout, request: &QueryRequest, limits: &QueryLimits) -> Result<QueryResult, DbError> {
    if let Some(db) = &request.database {
        checkout.use_database(db).await?;
    }

    debug!("Executing query: {}", request.sql);
    let started = Instant::now();
    let fetch = fetch_rows(checkout.connection()?, &request.sql, &request.params, limits.row_limit);
    let outcome = tokio::time::timeout(limits.timeout, fetch).await;
    let fetched = match outcome {
        Ok(fetched) => fetched?,
        Err(_) => {
            checkout.mark_broken();
            return Err(DbError::Timeout(
                u64::try_from(limits.timeout.as_millis()).unwrap_or(u64::MAX),
            ));
        }
    };
    let elapsed = started.elapsed();

    if fetched.total > fetched.rows.len() {
        info!(
            "Query returned {} rows, truncated to {}",
            fetched.total,
            fetched.rows.len()
        );
    } else {
        debug!("Query returned {} rows in {elapsed:?}", fetched.total);
    }

    Ok(QueryResult::from_rows(fetched, elapsed))
}

async fn fetch_rows(
    conn: &mut MySqlConnection,
    sql: &str,
    params: &[Value],
    row_limit: usize,
) -> Result<FetchedRows, sqlx::Error> {
    // Without parameters use the text protocol: not every SHOW/DESCRIBE form can be prepared.
    let mut stream: BoxStream<'_, Result<MySqlRow, sqlx::Error>> = if params.is_empty() {
        sqlx::raw_sql(sql).fetch(conn)
    } else {
        bind_params(sqlx::query(sql), params).fetch(conn)
    };

    let mut cap = RowCap::new(row_limit);
    while let Some(row) = stream.try_next().await? {
        cap.offer(|| column_names(&row), || row_to_json(&row));
    }
    Ok(cap.finish())
}

fn bind_params<'q>(
    mut query: Query<'q, MySql, MySqlArguments>,
    params: &[Value],
) -> Query<'q, MySql, MySqlArguments> {
    for param in params {
        query = match param {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    query.bind(i)
                } else if let Some(u) = n.as_u64() {
                    query.bind(u)
                } else {
                    query.bind(n.as_f64().unwrap_or_default())
                }
            }
            Value::String(s) => query.bind(s.clone()),
            other => query.bind(other.to_string()),
        };
    }
    query
}

fn column_names(row: &MySqlRow) -> Vec<String> {
    row.columns().iter().map(|c| c.name().to_string()).collect()
}

fn row_to_json(row: &MySqlRow) -> Map<String, Value> {
    let mut row_data = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let value = decode_column(row, i, column.type_info().name());
        row_data.insert(column.name().to_string(), value);
    }
    row_data
}

fn decode_column(row: &MySqlRow, i: usize, type_name: &str) -> Value {
    let typed = match type_name {
        "NULL" => Some(Value::Null),
        "BOOLEAN" => decode::<bool>(row, i),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "INTEGER" | "BIGINT" => decode::<i64>(row, i),
        "YEAR" | "BIT" => decode::<u64>(row, i),
        name if name.ends_with("UNSIGNED") => decode::<u64>(row, i),
        "FLOAT" => row
            .try_get::<Option<f32>, _>(i)
            .ok()
            .map(|v| json!(v.map(f64::from))),
        "DOUBLE" | "REAL" => decode::<f64>(row, i),
        // Strings keep the full precision of DECIMAL columns.
        "DECIMAL" | "NUMERIC" => row
            .try_get::<Option<BigDecimal>, _>(i)
            .ok()
            .map(|v| json!(v.map(|d| d.to_string()))),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(i)
            .ok()
            .map(|v| json!(v.map(|d| d.to_string()))),
        "DATETIME" => row
            .try_get::<Option<NaiveDateTime>, _>(i)
            .ok()
            .map(|v| json!(v.map(|d| d.format("%Y-%m-%d %H:%M:%S%.f").to_string()))),
        "TIMESTAMP" => row
            .try_get::<Option<DateTime<Utc>>, _>(i)
            .ok()
            .map(|v| json!(v.map(|d| d.format("%Y-%m-%d %H:%M:%S%.f").to_string()))),
        "TIME" => row
            .try_get::<Option<NaiveTime>, _>(i)
            .ok()
            .map(|v| json!(v.map(|t| t.to_string()))),
        "JSON" => decode::<Value>(row, i),
        _ => None,
    };

    typed.unwrap_or_else(|| fallback(row, i))
}

fn decode<'r, T>(row: &'r MySqlRow, i: usize) -> Option<Value>
where
    T: sqlx::Decode<'r, MySql> + sqlx::Type<MySql> + Serialize,
{
    row.try_get::<Option<T>, _>(i).ok().map(|v| json!(v))
}

/// Text first, then raw bytes. Anything undecodable becomes null.
fn fallback(row: &MySqlRow, i: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<String>, _>(i) {
        return json!(v);
    }
    match row.try_get::<Option<Vec<u8>>, _>(i) {
        Ok(Some(bytes)) => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
        _ => Value::Null,
    }
}
