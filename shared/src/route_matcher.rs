//! The route matcher (§4.C): walks the routing table in declaration order
//! and returns the first route whose method and segment shape match the
//! request, along with the bound path-variable map.

use crate::route::{Method, Route, Segment};
use std::collections::HashMap;

/// Splits a request path on `/`, discarding empty segments (leading,
/// trailing, or doubled slashes all collapse away).
fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| urlencoding::decode(s).map(|c| c.into_owned()).unwrap_or_else(|_| s.to_string()))
        .collect()
}

/// Finds the first route matching `method`/`path`. First match wins; no
/// specificity scoring (§4.C, §8 property 2).
pub fn find<'a>(routes: &'a [Route], method: Method, path: &str) -> Option<(&'a Route, HashMap<String, String>)> {
    let segments = split_path(path);
    for route in routes {
        if route.method != method {
            continue;
        }
        if route.pattern.segments.len() != segments.len() {
            continue;
        }
        let mut bindings = HashMap::new();
        let mut matched = true;
        for (seg, value) in route.pattern.segments.iter().zip(segments.iter()) {
            match seg {
                Segment::Atom(atom) => {
                    if atom != value {
                        matched = false;
                        break;
                    }
                }
                Segment::Variable(name) => {
                    bindings.insert(name.clone(), value.clone());
                }
            }
        }
        if matched {
            return Some((route, bindings));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{Action, Pattern};
    use serde_json::json;

    fn route(method: Method, uri: &str) -> Route {
        Route { method, pattern: Pattern::parse(uri), action: Action::Static(json!({})) }
    }

    #[test]
    fn matches_atoms_and_binds_variables() {
        let routes = vec![route(Method::Get, "photo/:id")];
        let (matched, bindings) = find(&routes, Method::Get, "/photo/42").unwrap();
        assert_eq!(matched.pattern.segments.len(), 2);
        assert_eq!(bindings.get("id"), Some(&"42".to_string()));
    }

    #[test]
    fn rejects_mismatched_method_or_segment_count() {
        let routes = vec![route(Method::Get, "photo/:id")];
        assert!(find(&routes, Method::Post, "/photo/42").is_none());
        assert!(find(&routes, Method::Get, "/photo/42/extra").is_none());
    }

    #[test]
    fn first_declared_match_wins() {
        let routes = vec![route(Method::Get, "photo/:id"), route(Method::Get, "photo/special")];
        let (matched, bindings) = find(&routes, Method::Get, "/photo/special").unwrap();
        assert!(matches!(matched.pattern.segments[1], Segment::Variable(_)));
        assert_eq!(bindings.get("id"), Some(&"special".to_string()));
    }

    #[test]
    fn url_decodes_variable_segments() {
        let routes = vec![route(Method::Get, "search/:term")];
        let (_, bindings) = find(&routes, Method::Get, "/search/hello%20world").unwrap();
        assert_eq!(bindings.get("term"), Some(&"hello world".to_string()));
    }

    #[test]
    fn no_match_returns_none() {
        let routes = vec![route(Method::Get, "photo/:id")];
        assert!(find(&routes, Method::Get, "/unknown").is_none());
    }
}
