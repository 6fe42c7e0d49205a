//! The pipeline executor (§4.E): runs a [`Pipeline`] to completion using the
//! topological order computed by [`Pipeline::topological_order`], wiring each
//! processor's declared connections into its input object before dispatching
//! it to the matching primitive (SQL, static, nested pipeline, Node.js).
//!
//! All nodes within a single pipeline execution share one DB transaction
//! (§4.E, §5): `execute` opens it, every SQL processor, including those
//! inside a nested pipeline, runs against the same borrowed connection, and
//! the transaction commits on success or rolls back on the first node
//! failure.

use crate::db;
use crate::error::AppError;
use crate::nodejs;
use crate::pipeline::{Pipeline, PipelineRef, ProcessorKind, AGGREGATOR, ROOT_INPUT};
use serde_json::{Map, Value};
use sqlx::{PgConnection, Postgres, Transaction};
use std::collections::HashMap;
use std::time::Duration;

/// Read-only dependencies a pipeline needs to run any of its processors.
/// Borrowed for the duration of one request; never owned by the pipeline
/// data model itself (§3 keeps processors declarative).
pub struct PipelineContext<'a> {
    pub pool: &'a sqlx::PgPool,
    pub node_binary: &'a str,
    pub action_timeout: Duration,
    /// Named pipelines available to `pipeline`-typed processors (§4.D), keyed
    /// by the name used in the route DSL.
    pub mesh: &'a HashMap<String, Pipeline>,
}

/// Runs `pipeline` against `input_bag` (the request parameter bag for a
/// top-level pipeline action, or the request bag re-used unmodified for a
/// nested one; §4.E does not give nested pipelines a different root).
/// Returns the aggregator's assembled object. Owns the one connection
/// borrowed for the whole run and commits or rolls back around it.
pub async fn execute(
    pipeline: &Pipeline,
    input_bag: &Map<String, Value>,
    ctx: &PipelineContext<'_>,
) -> Result<Value, AppError> {
    let mut tx: Transaction<'_, Postgres> = ctx.pool.begin().await?;
    match run(pipeline, input_bag, ctx, &mut tx).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            let _ = tx.rollback().await;
            Err(err)
        }
    }
}

/// Recursive worker shared by top-level and nested pipeline execution; takes
/// the already-open transaction rather than opening its own, so nested
/// pipelines never acquire a second connection (§4.E, §9).
async fn run(
    pipeline: &Pipeline,
    input_bag: &Map<String, Value>,
    ctx: &PipelineContext<'_>,
    conn: &mut PgConnection,
) -> Result<Value, AppError> {
    let order = pipeline.topological_order()?;
    let mut outputs: HashMap<String, Value> = HashMap::new();
    outputs.insert(ROOT_INPUT.to_string(), Value::Object(input_bag.clone()));

    for name in &order {
        let processor = pipeline
            .processors
            .get(name)
            .ok_or_else(|| AppError::ServerConfiguration(format!("unknown processor '{name}'")))?;
        let node_input = gather_input(pipeline, name, &outputs);
        let result = run_processor(processor, &node_input, ctx, conn).await;
        match result {
            Ok(value) => {
                outputs.insert(name.clone(), value);
            }
            Err(source) => {
                return Err(AppError::PipelineError { node: name.clone(), source: Box::new(source) });
            }
        }
    }

    Ok(Value::Object(gather_input(pipeline, AGGREGATOR, &outputs)))
}

/// Assembles `target`'s input object from every connection whose `to_node`
/// is `target`, pulling each field out of its source processor's already
/// computed output (§4.E step 4).
fn gather_input(pipeline: &Pipeline, target: &str, outputs: &HashMap<String, Value>) -> Map<String, Value> {
    let mut input = Map::new();
    for conn in &pipeline.connections {
        if conn.to_node != target {
            continue;
        }
        let value = outputs
            .get(&conn.from_node)
            .map(|v| field_of(v, &conn.from_field))
            .unwrap_or(Value::Null);
        input.insert(conn.to_field.clone(), value);
    }
    input
}

/// Extracts `field` from `value`. An empty field name means "the whole
/// value"; a non-object value with a non-empty field name yields `null`.
fn field_of(value: &Value, field: &str) -> Value {
    if field.is_empty() {
        return value.clone();
    }
    match value {
        Value::Object(map) => map.get(field).cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

async fn run_processor(
    processor: &crate::pipeline::Processor,
    input: &Map<String, Value>,
    ctx: &PipelineContext<'_>,
    conn: &mut PgConnection,
) -> Result<Value, AppError> {
    match &processor.kind {
        ProcessorKind::Sql(query) => db::execute(conn, query, input).await,
        ProcessorKind::Static(value) => Ok(value.clone()),
        ProcessorKind::NodeJs(script) => {
            let response =
                nodejs::invoke(ctx.node_binary, script, &Value::Object(input.clone()), ctx.action_timeout)
                    .await?;
            if response.status >= 400 {
                return Err(AppError::NodeJsError(format!(
                    "script '{script}' returned status {}",
                    response.status
                )));
            }
            Ok(response.body)
        }
        ProcessorKind::Pipeline(reference) => {
            let nested = match reference {
                PipelineRef::Inline(inner) => inner.as_ref(),
                PipelineRef::Named(name) => ctx.mesh.get(name).ok_or_else(|| {
                    AppError::ServerConfiguration(format!("unknown pipeline '{name}'"))
                })?,
            };
            Box::pin(run(nested, input, ctx, conn)).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Connection, Processor};
    use serde_json::json;

    fn conn(from_node: &str, from_field: &str, to_node: &str, to_field: &str) -> Connection {
        Connection {
            from_node: from_node.into(),
            from_field: from_field.into(),
            to_node: to_node.into(),
            to_field: to_field.into(),
        }
    }

    #[test]
    fn gather_input_pulls_named_field_from_source_output() {
        let pipeline = Pipeline {
            processors: HashMap::new(),
            connections: vec![conn(ROOT_INPUT, "id", "a", "photoId")],
        };
        let mut outputs = HashMap::new();
        outputs.insert(ROOT_INPUT.to_string(), json!({"id": 42, "other": "x"}));
        let input = gather_input(&pipeline, "a", &outputs);
        assert_eq!(input.get("photoId"), Some(&json!(42)));
        assert_eq!(input.len(), 1);
    }

    #[test]
    fn gather_input_passes_whole_value_for_empty_field_name() {
        let pipeline = Pipeline {
            processors: HashMap::new(),
            connections: vec![conn("a", "", AGGREGATOR, "result")],
        };
        let mut outputs = HashMap::new();
        outputs.insert("a".to_string(), json!({"x": 1}));
        let input = gather_input(&pipeline, AGGREGATOR, &outputs);
        assert_eq!(input.get("result"), Some(&json!({"x": 1})));
    }

    #[test]
    fn field_of_returns_null_for_missing_or_non_object() {
        assert_eq!(field_of(&json!(5), "x"), Value::Null);
        assert_eq!(field_of(&json!({"a": 1}), "b"), Value::Null);
        assert_eq!(field_of(&json!(5), ""), json!(5));
    }

    #[tokio::test]
    async fn execute_runs_static_nodes_through_to_aggregator() {
        let mut processors = HashMap::new();
        processors.insert(
            "greeting".to_string(),
            Processor { name: "greeting".into(), kind: ProcessorKind::Static(json!({"hello": "world"})) },
        );
        let pipeline = Pipeline {
            processors,
            connections: vec![conn("greeting", "hello", AGGREGATOR, "greeting")],
        };
        let mesh = HashMap::new();
        // A pool is required by the context type but unused by this all-static
        // pipeline's queries; `begin()` still needs a reachable Postgres to
        // open a transaction, so this test is skipped without one rather than
        // failing the whole suite.
        let Ok(pool) = sqlx::PgPool::connect("postgres://localhost/unused").await else {
            return;
        };
        let ctx = PipelineContext {
            pool: &pool,
            node_binary: "node",
            action_timeout: Duration::from_secs(5),
            mesh: &mesh,
        };
        let result = execute(&pipeline, &Map::new(), &ctx).await.unwrap();
        assert_eq!(result, json!({"greeting": "world"}));
    }
}
