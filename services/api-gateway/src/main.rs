//! The dispatcher (§4.F): the one HTTP entry point every request passes
//! through. Reads the body, authenticates, matches the custom routing table
//! built at startup (§4.B/§4.C), executes the resolved action (§4.D/§4.E),
//! and marshals the result to HTTP. Everything actix-web itself would
//! normally route on (method, path) is instead handled by `shared`'s own
//! matcher, since the routing table's shape is defined by the DSL file, not
//! by `.route(...)` calls.

use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use shared::action;
use shared::auth::{self, Keystore};
use shared::config::Settings;
use shared::error::AppError;
use shared::mesh;
use shared::pipeline::Pipeline;
use shared::pipeline_executor::PipelineContext;
use shared::plugins::{
    HeaderAccumulator, NoopHeaderAccumulator, NoopPostSuccessHook, NoopPreFilter, PostSuccessHook, PreFilter,
};
use shared::route::{Method, Route};
use shared::route_matcher;
use shared::route_parser;
use serde_json::{Map, Value};
use sqlx::postgres::PgPoolOptions;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const PRODUCT: &str = concat!("route-gateway/", env!("CARGO_PKG_VERSION"));

struct AppState {
    settings: Settings,
    routes: Vec<Route>,
    mesh: HashMap<String, Pipeline>,
    pool: sqlx::PgPool,
    keystore: Keystore,
    pre_filter: Arc<dyn PreFilter>,
    post_success_hook: Arc<dyn PostSuccessHook>,
    header_accumulator: Arc<dyn HeaderAccumulator>,
}

/// The single catch-all handler every method/path converges on (§4.F).
async fn dispatch(req: HttpRequest, body: web::Bytes, state: web::Data<AppState>) -> HttpResponse {
    let method_str = req.method().as_str();
    let path = req.path().to_string();

    if let Some(response) = state.pre_filter.filter(method_str, &path, &header_pairs(&req)) {
        return to_http(response);
    }

    if body.len() > state.settings.max_body_bytes {
        return error_response(&AppError::BadRequest("request body exceeds maximum size".into()));
    }

    let bag = match parse_request_bag(&body) {
        Ok(bag) => bag,
        Err(err) => return error_response(&err),
    };

    if let Err(err) = authenticate(&req, &state, method_str, &path, &body) {
        return error_response(&err);
    }

    let Some(method) = Method::from_actix(req.method()) else {
        return error_response(&AppError::NotFound);
    };

    let (route, path_vars) = match route_matcher::find(&state.routes, method, &path) {
        Some(found) => found,
        None => return error_response(&AppError::NotFound),
    };

    let merged_bag = merge_bag(path_vars, bag);

    let ctx = PipelineContext {
        pool: &state.pool,
        node_binary: &state.settings.node_binary,
        action_timeout: Duration::from_secs(state.settings.action_timeout_secs),
        mesh: &state.mesh,
    };

    let timeout = Duration::from_secs(state.settings.action_timeout_secs);
    let result = match tokio::time::timeout(timeout, action::execute(&route.action, &merged_bag, &ctx)).await {
        Ok(result) => result,
        Err(_) => Err(AppError::Timeout),
    };

    match result {
        Ok(response) => {
            state.post_success_hook.on_success(route, &response.body);
            to_http_with_extra_headers(response, &state.header_accumulator)
        }
        Err(err) => {
            error!(method = method_str, path = %path, error = err.kind(), "action failed");
            error_response(&err)
        }
    }
}

fn header_pairs(req: &HttpRequest) -> Vec<(String, String)> {
    req.headers()
        .iter()
        .filter_map(|(name, value)| {
            value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// §4.F step 1: decode the body as a JSON object; any other top-level JSON
/// (array, scalar, ...) is a 400. An empty body is treated as `{}`.
fn parse_request_bag(body: &[u8]) -> Result<Map<String, Value>, AppError> {
    if body.is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(AppError::BadRequest("request body must be a JSON object".into())),
        Err(e) => Err(AppError::BadRequest(format!("malformed JSON body: {e}"))),
    }
}

/// §4.F step 2: verify the HMAC signature unless the request comes from a
/// trusted loopback address or signing is disabled entirely.
fn authenticate(
    req: &HttpRequest,
    state: &AppState,
    method: &str,
    path: &str,
    body: &[u8],
) -> Result<(), AppError> {
    if !state.settings.hmac_enabled {
        return Ok(());
    }
    if auth::is_trusted_loopback(req.peer_addr().map(|a| a.ip())) {
        return Ok(());
    }
    let public_key = req.headers().get("X-Public-Key").and_then(|v| v.to_str().ok());
    let signature = req.headers().get("X-Request-Signature").and_then(|v| v.to_str().ok());
    auth::verify(&state.keystore, public_key, signature, method, path, body)
}

/// §4.F step 4: path variables (as strings), overlaid by the request body's
/// top-level fields ("body wins on conflict").
fn merge_bag(path_vars: HashMap<String, String>, body: Map<String, Value>) -> Map<String, Value> {
    let mut bag = Map::new();
    for (name, value) in path_vars {
        // Path variables are addressable both bare (body-field style) and
        // with the `:` prefix the template engine's holes use (§4.A).
        bag.insert(format!(":{name}"), Value::String(value.clone()));
        bag.insert(name, Value::String(value));
    }
    for (key, value) in body {
        bag.insert(key, value);
    }
    bag
}

fn error_response(err: &AppError) -> HttpResponse {
    to_http(shared::route::RouteResponse::new(err.status_code().as_u16(), err.body()))
}

fn to_http(response: shared::route::RouteResponse) -> HttpResponse {
    let mut builder = HttpResponse::build(
        actix_web::http::StatusCode::from_u16(response.status).unwrap_or(actix_web::http::StatusCode::OK),
    );
    builder.insert_header(("Server", PRODUCT));
    for (name, value) in &response.headers {
        builder.insert_header((name.as_str(), value.as_str()));
    }
    builder.content_type("application/json; charset=utf-8").json(response.body)
}

fn to_http_with_extra_headers(
    response: shared::route::RouteResponse,
    accumulator: &Arc<dyn HeaderAccumulator>,
) -> HttpResponse {
    let mut response = response;
    response.headers.extend(accumulator.headers());
    to_http(response)
}

async fn load_state(settings: Settings) -> AppState {
    let pool = match PgPoolOptions::new()
        .max_connections(settings.pool_size)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&settings.database_url)
        .await
    {
        Ok(p) => p,
        Err(e) => {
            error!(%e, "failed to connect to Postgres");
            std::process::exit(1);
        }
    };

    let routes_text = match tokio::fs::read_to_string(&settings.routes_file).await {
        Ok(t) => t,
        Err(e) => {
            error!(%e, file = %settings.routes_file, "failed to read routes configuration file");
            std::process::exit(1);
        }
    };
    let routes = match route_parser::parse_routes(&routes_text) {
        Ok(r) => r,
        Err(e) => {
            error!(%e, "failed to parse routes configuration");
            std::process::exit(1);
        }
    };
    info!(count = routes.len(), "loaded routing table");

    let mesh = match mesh::load_dir(&settings.pipelines_dir).await {
        Ok(m) => m,
        Err(e) => {
            error!(%e, "failed to load pipeline mesh");
            std::process::exit(1);
        }
    };
    info!(count = mesh.len(), "loaded pipeline mesh");

    if !settings.hmac_enabled {
        warn!("HMAC authentication is disabled; do not expose this gateway directly to the internet");
    }

    let keystore = settings.keystore();
    AppState {
        pool,
        routes,
        mesh,
        keystore,
        pre_filter: Arc::new(NoopPreFilter),
        post_success_hook: Arc::new(NoopPostSuccessHook),
        header_accumulator: Arc::new(NoopHeaderAccumulator),
        settings,
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt::init();

    let settings = match Settings::new() {
        Ok(s) => s,
        Err(e) => {
            error!(%e, "failed to load settings");
            std::process::exit(1);
        }
    };
    let bind_addr = settings.bind_addr.clone();
    let max_body_bytes = settings.max_body_bytes;

    let state = web::Data::new(load_state(settings).await);

    info!(%bind_addr, "starting route gateway");
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .app_data(web::PayloadConfig::new(max_body_bytes))
            .default_service(web::route().to(dispatch))
    })
    .bind(&bind_addr)?
    .run()
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test;
    use shared::route::{Action, Pattern};
    use serde_json::json;

    fn test_state(routes: Vec<Route>) -> web::Data<AppState> {
        let settings = Settings {
            database_url: "postgres://localhost/unused".into(),
            routes_file: "routes.conf".into(),
            pipelines_dir: "pipelines".into(),
            pool_size: 1,
            node_binary: "node".into(),
            max_body_bytes: 1024 * 1024,
            action_timeout_secs: 5,
            hmac_enabled: false,
            hmac_keys: "{}".into(),
            bind_addr: "0.0.0.0:0".into(),
        };
        web::Data::new(AppState {
            pool: sqlx::PgPool::connect_lazy(&settings.database_url).unwrap(),
            routes,
            mesh: HashMap::new(),
            keystore: settings.keystore(),
            pre_filter: Arc::new(NoopPreFilter),
            post_success_hook: Arc::new(NoopPostSuccessHook),
            header_accumulator: Arc::new(NoopHeaderAccumulator),
            settings,
        })
    }

    #[actix_web::test]
    async fn unknown_path_returns_404_with_error_body() {
        let state = test_state(vec![]);
        let app = test::init_service(
            App::new().app_data(state).default_service(web::route().to(dispatch)),
        )
        .await;
        let req = test::TestRequest::get().uri("/nowhere").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 404);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], json!("NotFound"));
    }

    #[actix_web::test]
    async fn static_action_lifts_allow_header_and_strips_body_key() {
        let route = Route {
            method: Method::Options,
            pattern: Pattern::parse("/photo"),
            action: Action::Static(json!({"<Allow>": "GET,POST", "GET": {}})),
        };
        let state = test_state(vec![route]);
        let app = test::init_service(
            App::new().app_data(state).default_service(web::route().to(dispatch)),
        )
        .await;
        let req = test::TestRequest::with_uri("/photo").method(actix_web::http::Method::OPTIONS).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers().get("Allow").unwrap(), "GET,POST");
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body, json!({"GET": {}}));
    }

    #[actix_web::test]
    async fn malformed_json_body_is_400() {
        let route = Route {
            method: Method::Post,
            pattern: Pattern::parse("/echo"),
            action: Action::Static(json!({})),
        };
        let state = test_state(vec![route]);
        let app = test::init_service(
            App::new().app_data(state).default_service(web::route().to(dispatch)),
        )
        .await;
        let req = test::TestRequest::post()
            .uri("/echo")
            .set_payload("not json")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400);
    }

    #[actix_web::test]
    async fn non_object_json_body_is_400() {
        let route = Route {
            method: Method::Post,
            pattern: Pattern::parse("/echo"),
            action: Action::Static(json!({})),
        };
        let state = test_state(vec![route]);
        let app = test::init_service(
            App::new().app_data(state).default_service(web::route().to(dispatch)),
        )
        .await;
        let req = test::TestRequest::post().uri("/echo").set_payload("[1,2,3]").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400);
    }

    #[actix_web::test]
    async fn every_response_carries_the_server_header() {
        let route = Route {
            method: Method::Get,
            pattern: Pattern::parse("/ping"),
            action: Action::Static(json!({"pong": true})),
        };
        let state = test_state(vec![route]);
        let app = test::init_service(
            App::new().app_data(state).default_service(web::route().to(dispatch)),
        )
        .await;
        let req = test::TestRequest::get().uri("/ping").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.headers().get("Server").unwrap().to_str().unwrap().starts_with("route-gateway/"));
    }

    #[test]
    fn merge_bag_lets_body_win_over_path_variables() {
        let mut path_vars = HashMap::new();
        path_vars.insert("id".to_string(), "42".to_string());
        let mut body = Map::new();
        body.insert("id".to_string(), json!(99));
        let bag = merge_bag(path_vars, body);
        assert_eq!(bag.get("id"), Some(&json!(99)));
        assert_eq!(bag.get(":id"), Some(&json!("42")));
    }

    #[test]
    fn parse_request_bag_accepts_empty_body_as_empty_object() {
        assert_eq!(parse_request_bag(b"").unwrap(), Map::new());
    }

    #[test]
    fn parse_request_bag_rejects_non_object_top_level_json() {
        assert!(parse_request_bag(b"[1,2]").is_err());
        assert!(parse_request_bag(b"\"hello\"").is_err());
    }
}
