//! The three plug points the core exposes to its out-of-scope collaborators
//! (§6): a request pre-filter that may short-circuit with a response, a
//! post-success hook that observes a completed route + response (e.g. for
//! AMQP publishing), and a response header accumulator. The core ships
//! no-op default implementations so the gateway runs standalone; a real
//! deployment wires in the CORS/AMQP/CLI collaborators named in §6 by
//! supplying its own `Arc<dyn ...>`.

use crate::route::{Route, RouteResponse};
use serde_json::Value;

/// Runs before routing. `Some(response)` short-circuits the request (e.g. a
/// CORS preflight answer); `None` lets the dispatcher continue to matching.
pub trait PreFilter: Send + Sync {
    fn filter(&self, method: &str, path: &str, headers: &[(String, String)]) -> Option<RouteResponse>;
}

/// Runs once an action has produced a successful [`RouteResponse`], after
/// the HTTP boundary has decided to return 2xx. Receives the matched route
/// and the response body so a collaborator can publish it (e.g. over AMQP)
/// without being able to alter what's already been sent to the client.
pub trait PostSuccessHook: Send + Sync {
    fn on_success(&self, route: &Route, body: &Value);
}

/// Accumulates additional response headers (e.g. a rotating access log
/// middleware stamping a request id) independently of what the action
/// itself set via `RouteResponse::with_header`.
pub trait HeaderAccumulator: Send + Sync {
    fn headers(&self) -> Vec<(String, String)>;
}

/// No-op pre-filter: never short-circuits.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPreFilter;

impl PreFilter for NoopPreFilter {
    fn filter(&self, _method: &str, _path: &str, _headers: &[(String, String)]) -> Option<RouteResponse> {
        None
    }
}

/// No-op post-success hook: observes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPostSuccessHook;

impl PostSuccessHook for NoopPostSuccessHook {
    fn on_success(&self, _route: &Route, _body: &Value) {}
}

/// No-op header accumulator: contributes no extra headers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHeaderAccumulator;

impl HeaderAccumulator for NoopHeaderAccumulator {
    fn headers(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{Action, Method, Pattern};
    use serde_json::json;

    #[test]
    fn noop_plug_points_do_nothing() {
        assert!(NoopPreFilter.filter("GET", "/x", &[]).is_none());
        assert!(NoopHeaderAccumulator.headers().is_empty());
        let route = Route { method: Method::Get, pattern: Pattern::parse("/x"), action: Action::Static(json!({})) };
        NoopPostSuccessHook.on_success(&route, &json!({"ok": true}));
    }
}
