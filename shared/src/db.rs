//! SQL action execution (§4.D): renders a [`DbTemplate`] against the request
//! bag, runs it against Postgres, and shapes the result according to the
//! route's declared [`DbResult`] mode.
//!
//! Every entry point takes `&mut PgConnection` rather than a pool, so a
//! standalone SQL route borrows one connection for its single statement
//! while the pipeline executor can thread a single transaction's connection
//! through an entire run (§4.E: "all nodes within a single pipeline
//! execution share the same DB transaction").

use crate::error::AppError;
use crate::route::{DbQuery, DbResult};
use bigdecimal::BigDecimal;
use serde_json::{Map, Value};
use sqlx::{Column, PgConnection, Row, TypeInfo};

/// Executes `query` against `conn` with `bag` supplying the template's
/// holes, shaping the outcome according to `query.result` (§4.D).
pub async fn execute(
    conn: &mut PgConnection,
    query: &DbQuery,
    bag: &Map<String, Value>,
) -> Result<Value, AppError> {
    // A bare `--`/`><` route (no SQL body at all, §8 E3's `DELETE photo --`)
    // has nothing to render or run: `None` is unconditionally `{"status":"ok"}`
    // and `Count` degrades to zero without touching the database. The route
    // parser only ever leaves the template empty for these two result modes.
    if query.template.is_empty() {
        return match &query.result {
            DbResult::None => Ok(serde_json::json!({"status": "ok"})),
            DbResult::Count => Ok(serde_json::json!({"rowsAffected": 0})),
            other => unreachable!("route parser never leaves an empty template for {other:?}"),
        };
    }

    let sql = query.template.render(bag).map_err(|e| AppError::BadRequest(e.to_string()))?;

    match &query.result {
        DbResult::None => {
            sqlx::query(&sql).execute(conn).await?;
            Ok(serde_json::json!({"status": "ok"}))
        }
        DbResult::Count => {
            let result = sqlx::query(&sql).execute(conn).await?;
            Ok(serde_json::json!({"rowsAffected": result.rows_affected()}))
        }
        DbResult::Item { .. } => single_row(conn, &sql, false).await,
        DbResult::ItemOk { .. } => single_row(conn, &sql, true).await,
        DbResult::Collection { .. } => {
            let rows = sqlx::query(&sql).fetch_all(conn).await?;
            Ok(Value::Array(rows.into_iter().map(row_to_json).collect()))
        }
        DbResult::LastInsert { table, sequence } => {
            sqlx::query(&sql).execute(&mut *conn).await?;
            let seq_name = format!("{table}_{sequence}_seq");
            let row = sqlx::query(&format!("SELECT currval('{seq_name}') AS currval"))
                .fetch_one(conn)
                .await?;
            let id = row_to_json(row).get("currval").cloned().unwrap_or(Value::Null);
            Ok(Value::Object(Map::from_iter([(table.clone(), id)])))
        }
    }
}

/// Shared logic for `Item`/`ItemOk`: zero rows is `NotFound`, more than one
/// row is a configuration mistake the route author needs to fix (§4.D).
async fn single_row(conn: &mut PgConnection, sql: &str, mark_ok: bool) -> Result<Value, AppError> {
    let mut rows = sqlx::query(sql).fetch_all(conn).await?;
    match rows.len() {
        0 => Err(AppError::NotFound),
        1 => {
            let mut obj = match row_to_json(rows.remove(0)) {
                Value::Object(obj) => obj,
                _ => unreachable!("row_to_json always returns an object"),
            };
            if mark_ok {
                obj.insert("status".to_string(), Value::String("ok".to_string()));
            }
            Ok(Value::Object(obj))
        }
        n => Err(AppError::DbError(format!("expected at most one row, got {n}"))),
    }
}

/// Converts a full row into a JSON object, keyed by column name.
fn row_to_json(row: sqlx::postgres::PgRow) -> Value {
    let mut obj = Map::new();
    for (idx, column) in row.columns().iter().enumerate() {
        obj.insert(column.name().to_string(), column_value_to_json(&row, idx));
    }
    Value::Object(obj)
}

/// Decodes a single column by its Postgres type name (§4.D's result
/// conversion table): numeric/text/boolean map directly, arrays recurse
/// element-by-element, dates/times/intervals become ISO-ish strings, and
/// anything this gateway doesn't recognise becomes the literal string
/// `"[unsupported SQL type]"` rather than silently turning into `null`.
fn column_value_to_json(row: &sqlx::postgres::PgRow, idx: usize) -> Value {
    let type_name = row.column(idx).type_info().name();
    if let Some(element) = type_name.strip_prefix('_') {
        return decode_array(row, idx, element);
    }
    decode_scalar(row, idx, type_name).unwrap_or_else(|| Value::String("[unsupported SQL type]".into()))
}

/// Decodes one scalar column. `None` means "this type has no decoder here";
/// the caller turns that into the unsupported-type marker string. A value
/// that decodes successfully but is SQL `NULL` still yields `Some(Value::Null)`.
fn decode_scalar(row: &sqlx::postgres::PgRow, idx: usize, type_name: &str) -> Option<Value> {
    match type_name {
        "INT2" => Some(row.try_get::<Option<i16>, _>(idx).ok()?.map(Value::from).unwrap_or(Value::Null)),
        "INT4" => Some(row.try_get::<Option<i32>, _>(idx).ok()?.map(Value::from).unwrap_or(Value::Null)),
        "INT8" => Some(row.try_get::<Option<i64>, _>(idx).ok()?.map(Value::from).unwrap_or(Value::Null)),
        "FLOAT4" => Some(
            row.try_get::<Option<f32>, _>(idx)
                .ok()?
                .map(|v| Value::from(v as f64))
                .unwrap_or(Value::Null),
        ),
        "FLOAT8" => {
            Some(row.try_get::<Option<f64>, _>(idx).ok()?.map(Value::from).unwrap_or(Value::Null))
        }
        // sqlx has no `f64: Type<Postgres>` decoder for NUMERIC; it only
        // maps cleanly to `BigDecimal` (requires the `bigdecimal` sqlx
        // feature, enabled in Cargo.toml).
        "NUMERIC" => Some(
            row.try_get::<Option<BigDecimal>, _>(idx)
                .ok()?
                .map(|v| bigdecimal_to_json(&v))
                .unwrap_or(Value::Null),
        ),
        "BOOL" => Some(row.try_get::<Option<bool>, _>(idx).ok()?.map(Value::from).unwrap_or(Value::Null)),
        "JSON" | "JSONB" => Some(row.try_get::<Option<Value>, _>(idx).ok()?.unwrap_or(Value::Null)),
        "TIMESTAMPTZ" => Some(
            row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx)
                .ok()?
                .map(|v| Value::String(v.to_rfc3339()))
                .unwrap_or(Value::Null),
        ),
        "TIMESTAMP" => Some(
            row.try_get::<Option<chrono::NaiveDateTime>, _>(idx)
                .ok()?
                .map(|v| Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
                .unwrap_or(Value::Null),
        ),
        "DATE" => Some(
            row.try_get::<Option<chrono::NaiveDate>, _>(idx)
                .ok()?
                .map(|v| Value::String(v.format("%Y-%m-%d").to_string()))
                .unwrap_or(Value::Null),
        ),
        "TIME" => Some(
            row.try_get::<Option<chrono::NaiveTime>, _>(idx)
                .ok()?
                .map(|v| Value::String(v.format("%H:%M:%S%.f").to_string()))
                .unwrap_or(Value::Null),
        ),
        "INTERVAL" => Some(
            row.try_get::<Option<sqlx::postgres::types::PgInterval>, _>(idx)
                .ok()?
                .map(|v| Value::String(interval_to_iso8601(&v)))
                .unwrap_or(Value::Null),
        ),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "UUID" | "CHAR" => {
            Some(row.try_get::<Option<String>, _>(idx).ok()?.map(Value::String).unwrap_or(Value::Null))
        }
        "BYTEA" => Some(
            row.try_get::<Option<Vec<u8>>, _>(idx)
                .ok()?
                .map(|bytes| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
                .unwrap_or(Value::Null),
        ),
        _ => None,
    }
}

/// Decodes a Postgres array column (type name `_<element>`, e.g. `_int4`)
/// into a recursive JSON array (§4.D). Falls back to the unsupported-type
/// marker per element when the element type has no scalar decoder.
fn decode_array(row: &sqlx::postgres::PgRow, idx: usize, element: &str) -> Value {
    macro_rules! decode_as {
        ($ty:ty) => {
            row.try_get::<Option<Vec<Option<$ty>>>, _>(idx)
                .ok()
                .flatten()
                .map(|items| Value::Array(items.into_iter().map(|v| v.map(Value::from).unwrap_or(Value::Null)).collect()))
        };
    }

    let decoded = match element {
        "INT2" => decode_as!(i16),
        "INT4" => decode_as!(i32),
        "INT8" => decode_as!(i64),
        "FLOAT8" => decode_as!(f64),
        "NUMERIC" => row
            .try_get::<Option<Vec<Option<BigDecimal>>>, _>(idx)
            .ok()
            .flatten()
            .map(|items| {
                Value::Array(items.into_iter().map(|v| v.map(|d| bigdecimal_to_json(&d)).unwrap_or(Value::Null)).collect())
            }),
        "BOOL" => decode_as!(bool),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "UUID" | "CHAR" => decode_as!(String),
        _ => None,
    };
    decoded.unwrap_or_else(|| {
        row.try_get::<Option<Vec<Option<String>>>, _>(idx)
            .ok()
            .flatten()
            .map(|items| {
                Value::Array(items.into_iter().map(|v| v.map(Value::String).unwrap_or(Value::Null)).collect())
            })
            .unwrap_or(Value::Null)
    })
}

/// Renders a `NUMERIC` column as a JSON number (§4.D: "numeric ... -> number")
/// when its decimal string parses as one, falling back to the decimal string
/// itself for values JSON's number grammar can't represent exactly.
fn bigdecimal_to_json(value: &BigDecimal) -> Value {
    value
        .to_string()
        .parse::<serde_json::Number>()
        .map(Value::Number)
        .unwrap_or_else(|_| Value::String(value.to_string()))
}

/// Best-effort ISO-8601 duration rendering (`P<months>M<days>DT<micros>S`)
/// for `INTERVAL` columns; Postgres stores months/days/microseconds
/// separately rather than as one scalar duration.
fn interval_to_iso8601(interval: &sqlx::postgres::types::PgInterval) -> String {
    let seconds = interval.microseconds as f64 / 1_000_000.0;
    format!("P{}M{}DT{}S", interval.months, interval.days, seconds)
}
