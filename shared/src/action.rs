//! The action executor (§4.D): runs one resolved [`Action`] against its
//! parameter bag and produces a [`RouteResponse`].

use crate::db;
use crate::error::AppError;
use crate::nodejs;
use crate::pipeline_executor::{self, PipelineContext};
use crate::route::{Action, DbResult, RouteResponse};
use serde_json::{Map, Value};

pub async fn execute(
    action: &Action,
    bag: &Map<String, Value>,
    ctx: &PipelineContext<'_>,
) -> Result<RouteResponse, AppError> {
    match action {
        Action::Sql(query) => {
            let status = match query.result {
                DbResult::LastInsert { .. } => 201,
                _ => 200,
            };
            let mut conn = ctx.pool.acquire().await?;
            let body = db::execute(&mut conn, query, bag).await?;
            Ok(RouteResponse::new(status, body))
        }
        Action::Pipeline(name) => {
            let pipeline = ctx
                .mesh
                .get(name)
                .ok_or_else(|| AppError::ServerConfiguration(format!("unknown pipeline '{name}'")))?;
            let body = pipeline_executor::execute(pipeline, bag, ctx).await?;
            Ok(RouteResponse::new(200, body))
        }
        Action::InlinePipeline(pipeline) => {
            let body = pipeline_executor::execute(pipeline, bag, ctx).await?;
            Ok(RouteResponse::new(200, body))
        }
        Action::NodeJs(script) => {
            let response =
                nodejs::invoke(ctx.node_binary, script, &Value::Object(bag.clone()), ctx.action_timeout)
                    .await?;
            let mut route_response = RouteResponse::new(response.status, response.body);
            for (name, value) in response.headers {
                route_response = route_response.with_header(name, value);
            }
            Ok(route_response)
        }
        Action::Static(value) => Ok(static_response(value.clone())),
    }
}

/// Returns a static action's response verbatim, except for the special
/// `"<Allow>"` key, which is lifted into an `Allow` response header and
/// removed from the body (§4.D).
fn static_response(mut value: Value) -> RouteResponse {
    let mut response = RouteResponse::new(200, Value::Null);
    if let Value::Object(obj) = &mut value {
        if let Some(Value::String(allow)) = obj.remove("<Allow>") {
            response = response.with_header("Allow", allow);
        }
    }
    response.body = value;
    response
}
