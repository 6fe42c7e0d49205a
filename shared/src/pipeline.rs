//! The pipeline data model (§3): processors (nodes), connections (edges)
//! between named fields, and the two reserved processor names that bound a
//! pipeline execution: the request bag (`_in`) and the aggregator (`_out`).

use crate::error::AppError;
use crate::route::DbQuery;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};

/// Synthetic processor exposing the request JSON bag as its output (§4.E).
pub const ROOT_INPUT: &str = "_in";
/// Synthetic processor whose input object becomes the pipeline's result (§4.E).
pub const AGGREGATOR: &str = "_out";

/// A pipeline processor may itself reference another pipeline, either by
/// name (looked up in the mesh at execution time) or inline.
#[derive(Debug, Clone)]
pub enum PipelineRef {
    Named(String),
    Inline(Box<Pipeline>),
}

#[derive(Debug, Clone)]
pub enum ProcessorKind {
    Sql(DbQuery),
    Static(Value),
    Pipeline(PipelineRef),
    NodeJs(String),
}

#[derive(Debug, Clone)]
pub struct Processor {
    pub name: String,
    pub kind: ProcessorKind,
}

/// `(source-processor, source-field) -> (target-processor, target-field)`.
#[derive(Debug, Clone)]
pub struct Connection {
    pub from_node: String,
    pub from_field: String,
    pub to_node: String,
    pub to_field: String,
}

#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    pub processors: HashMap<String, Processor>,
    pub connections: Vec<Connection>,
}

impl Pipeline {
    fn node_exists(&self, name: &str) -> bool {
        name == ROOT_INPUT || name == AGGREGATOR || self.processors.contains_key(name)
    }

    /// Validates that every connection endpoint names a real processor or
    /// one of the two reserved boundary names, and that the subgraph over
    /// real processors is acyclic (§8.5). `_in`/`_out` are excluded from the
    /// cycle check: they are boundary nodes, not scheduled processors.
    pub fn validate(&self) -> Result<(), AppError> {
        for conn in &self.connections {
            if !self.node_exists(&conn.from_node) {
                return Err(AppError::ServerConfiguration(format!(
                    "pipeline connection references unknown processor '{}'",
                    conn.from_node
                )));
            }
            if !self.node_exists(&conn.to_node) {
                return Err(AppError::ServerConfiguration(format!(
                    "pipeline connection references unknown processor '{}'",
                    conn.to_node
                )));
            }
            if conn.to_node == ROOT_INPUT {
                return Err(AppError::ServerConfiguration(
                    "pipeline connection cannot target the request bag '_in'".into(),
                ));
            }
            if conn.from_node == AGGREGATOR {
                return Err(AppError::ServerConfiguration(
                    "pipeline connection cannot source from the aggregator '_out'".into(),
                ));
            }
        }
        self.topological_order().map(|_| ())
    }

    /// Topological order over the real (non-boundary) processors via Kahn's
    /// algorithm, per the design notes in §9. Cycles surface as processors
    /// remaining with a non-zero in-degree once the queue drains.
    pub fn topological_order(&self) -> Result<Vec<String>, AppError> {
        let mut in_degree: HashMap<&str, usize> =
            self.processors.keys().map(|k| (k.as_str(), 0usize)).collect();
        let mut adjacency: HashMap<&str, Vec<&str>> =
            self.processors.keys().map(|k| (k.as_str(), Vec::new())).collect();

        for conn in &self.connections {
            if conn.from_node == ROOT_INPUT || conn.to_node == AGGREGATOR {
                continue;
            }
            adjacency.get_mut(conn.from_node.as_str()).unwrap().push(conn.to_node.as_str());
            *in_degree.get_mut(conn.to_node.as_str()).unwrap() += 1;
        }

        let mut queue: VecDeque<&str> = VecDeque::new();
        let mut ready: Vec<&str> =
            in_degree.iter().filter(|(_, &deg)| deg == 0).map(|(name, _)| *name).collect();
        ready.sort_unstable();
        queue.extend(ready);

        let mut order = Vec::with_capacity(self.processors.len());
        let mut remaining = in_degree.clone();
        while let Some(node) = queue.pop_front() {
            order.push(node.to_string());
            let mut newly_ready: Vec<&str> = Vec::new();
            for &next in &adjacency[node] {
                let deg = remaining.get_mut(next).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    newly_ready.push(next);
                }
            }
            newly_ready.sort_unstable();
            for n in newly_ready {
                queue.push_back(n);
            }
        }

        if order.len() != self.processors.len() {
            let stuck: HashSet<&str> =
                remaining.iter().filter(|(_, &deg)| deg != 0).map(|(n, _)| *n).collect();
            let mut stuck: Vec<&str> = stuck.into_iter().collect();
            stuck.sort_unstable();
            return Err(AppError::ServerConfiguration(format!(
                "pipeline contains a cycle involving: {}",
                stuck.join(", ")
            )));
        }
        Ok(order)
    }
}
