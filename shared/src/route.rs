//! The route data model (§3): `Route`, `Method`, `Pattern`/`Segment`,
//! `Action`, `DbResult`, `DbQuery`, and the `RouteResponse` an action
//! produces.

use crate::pipeline::Pipeline;
use crate::template::DbTemplate;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Options,
}

impl FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            "OPTIONS" => Ok(Method::Options),
            other => Err(format!("unknown HTTP method: {other}")),
        }
    }
}

impl Method {
    /// Maps from `actix_web::http::Method`; used by the gateway's catch-all
    /// handler when looking a request up in the routing table.
    pub fn from_actix(m: &actix_web::http::Method) -> Option<Method> {
        match m.as_str() {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "PATCH" => Some(Method::Patch),
            "DELETE" => Some(Method::Delete),
            "OPTIONS" => Some(Method::Options),
            _ => None,
        }
    }
}

/// One segment of a URI pattern (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Atom(String),
    Variable(String),
}

/// An ordered list of path segments (§3). The leading `/` is not stored.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Pattern {
    pub segments: Vec<Segment>,
}

impl Pattern {
    pub fn parse(uri: &str) -> Pattern {
        let trimmed = uri.strip_prefix('/').unwrap_or(uri);
        let segments = trimmed
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| {
                if let Some(name) = s.strip_prefix(':') {
                    Segment::Variable(name.to_string())
                } else {
                    Segment::Atom(s.to_string())
                }
            })
            .collect();
        Pattern { segments }
    }
}

/// Result-shaping mode for a SQL action (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbResult {
    None,
    Item { columns: Vec<String> },
    ItemOk { columns: Vec<String> },
    Collection { columns: Vec<String> },
    LastInsert { table: String, sequence: String },
    Count,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbQuery {
    pub result: DbResult,
    pub template: DbTemplate,
}

/// A tagged action variant (§3).
#[derive(Debug, Clone)]
pub enum Action {
    Sql(DbQuery),
    Pipeline(String),
    InlinePipeline(Pipeline),
    NodeJs(String),
    Static(serde_json::Value),
}

#[derive(Debug, Clone)]
pub struct Route {
    pub method: Method,
    pub pattern: Pattern,
    pub action: Action,
}

/// Headers + HTTP status + JSON value (§3), produced by an action and
/// marshalled to HTTP by the dispatcher (§4.F step 6).
#[derive(Debug, Clone)]
pub struct RouteResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: serde_json::Value,
}

impl RouteResponse {
    pub fn new(status: u16, body: serde_json::Value) -> RouteResponse {
        RouteResponse { status, headers: Vec::new(), body }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> RouteResponse {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_parse_ignores_leading_slash_and_empty_segments() {
        let p = Pattern::parse("/photo/:id");
        assert_eq!(
            p.segments,
            vec![Segment::Atom("photo".into()), Segment::Variable("id".into())]
        );
    }

    #[test]
    fn pattern_parse_without_leading_slash() {
        let p = Pattern::parse("photo/:id");
        assert_eq!(
            p.segments,
            vec![Segment::Atom("photo".into()), Segment::Variable("id".into())]
        );
    }

    #[test]
    fn method_parses_case_insensitively() {
        assert_eq!("get".parse::<Method>().unwrap(), Method::Get);
        assert_eq!("DELETE".parse::<Method>().unwrap(), Method::Delete);
        assert!("TRACE".parse::<Method>().is_err());
    }
}
