//! The route configuration parser (§4.B): turns the line-oriented DSL into
//! an ordered routing table, and the related JSON pipeline literal grammar
//! shared by inline pipeline actions and named pipeline files.
//!
//! Comment stripping and continuation-line merging both track quote state so
//! that `#` or `{`/`}` inside a JSON string literal in an inline pipeline
//! body is never mistaken for DSL syntax (§9's open question on this point
//! is resolved here: we always scan quote-aware rather than forbidding `#`
//! in inline JSON).

use crate::error::AppError;
use crate::pipeline::{Connection, Pipeline, PipelineRef, Processor, ProcessorKind};
use crate::route::{Action, DbQuery, DbResult, Method, Pattern, Route};
use crate::template::DbTemplate;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;

/// Parses a full routes configuration file into an ordered table. Returns
/// `Ok(vec![])` for an empty or all-comment file; any syntactic error aborts
/// loading with the offending line number (§4.B, §9).
pub fn parse_routes(text: &str) -> Result<Vec<Route>, AppError> {
    logical_lines(text)
        .into_iter()
        .map(|(line_no, line)| parse_route_line(&line, line_no))
        .collect()
}

/// Parses a standalone JSON pipeline document, the contents of a named
/// pipeline file loaded into the mesh.
pub fn load_named_pipeline(text: &str) -> Result<Pipeline, AppError> {
    parse_pipeline_json(text, "pipeline file")
}

fn parse_route_line(text: &str, line_no: usize) -> Result<Route, AppError> {
    let context = format!("line {line_no}");
    let (method_str, rest) = split_first_token(text)
        .ok_or_else(|| AppError::ServerConfiguration(format!("{context}: missing method")))?;
    let method = Method::from_str(method_str)
        .map_err(|e| AppError::ServerConfiguration(format!("{context}: {e}")))?;
    let (uri, rest) = split_first_token(rest)
        .ok_or_else(|| AppError::ServerConfiguration(format!("{context}: missing URI pattern")))?;
    let pattern = Pattern::parse(uri);
    let action_text = rest.trim();
    if action_text.is_empty() {
        return Err(AppError::ServerConfiguration(format!("{context}: missing action")));
    }
    let action = parse_action(action_text, &context)?;
    Ok(Route { method, pattern, action })
}

fn split_first_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.find(char::is_whitespace) {
        Some(idx) => Some((&s[..idx], &s[idx..])),
        None => Some((s, "")),
    }
}

/// Internal, symbol-agnostic counterpart of [`DbResult`] used while a route
/// or pipeline processor's declared result mode is still being resolved
/// against its hints (or lack thereof).
enum DbResultKind {
    None,
    Item,
    ItemOk,
    Collection,
    LastInsert,
    Count,
}

fn parse_action(text: &str, context: &str) -> Result<Action, AppError> {
    if let Some(rest) = text.strip_prefix("||") {
        let name = rest.trim();
        if name.is_empty() {
            return Err(AppError::ServerConfiguration(format!("{context}: missing pipeline name")));
        }
        return Ok(Action::Pipeline(name.to_string()));
    }
    if let Some(rest) = text.strip_prefix("|>") {
        let pipeline = parse_pipeline_json(rest.trim(), context)?;
        return Ok(Action::InlinePipeline(pipeline));
    }
    if let Some(rest) = text.strip_prefix("{..}") {
        let value: Value = serde_json::from_str(rest.trim())
            .map_err(|e| AppError::ServerConfiguration(format!("{context}: invalid static JSON: {e}")))?;
        return Ok(Action::Static(value));
    }
    if let Some(rest) = text.strip_prefix("<js>") {
        let path = rest.trim();
        if path.is_empty() {
            return Err(AppError::ServerConfiguration(format!("{context}: missing script path")));
        }
        return Ok(Action::NodeJs(path.to_string()));
    }

    // `text.get(..2)` rather than `&text[..2]`: a malformed action starting
    // with a multi-byte character (e.g. a stray `€`) must fall through to
    // the "unrecognised action" diagnostic below, not panic on a non-char
    // boundary (§4.B: a malformed line aborts loading with line context, not
    // a crash).
    if let Some(symbol) = text.get(..2) {
        let kind = match symbol {
            "--" => Some(DbResultKind::None),
            "~>" => Some(DbResultKind::Item),
            "->" => Some(DbResultKind::ItemOk),
            ">>" => Some(DbResultKind::Collection),
            "<>" => Some(DbResultKind::LastInsert),
            "><" => Some(DbResultKind::Count),
            _ => None,
        };
        if let Some(kind) = kind {
            let mut rest = text[2..].trim_start();
            let hints = if let Some(stripped) = rest.strip_prefix('(') {
                let close = stripped
                    .find(')')
                    .ok_or_else(|| AppError::ServerConfiguration(format!("{context}: unterminated hint list")))?;
                let hint_text = &stripped[..close];
                let hints: Vec<String> =
                    hint_text.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
                rest = stripped[close + 1..].trim_start();
                Some(hints)
            } else {
                None
            };
            let template = DbTemplate::parse(rest);
            // `--`/`><` need no SQL body at all (e.g. the bare `DELETE photo  --`
            // route, §8 E3): `None` never touches the database and `Count`
            // degrades to zero. Every other symbol needs a body to probe or
            // render, so an empty template there is still a load error.
            if template.is_empty() && !matches!(kind, DbResultKind::None | DbResultKind::Count) {
                return Err(AppError::ServerConfiguration(format!("{context}: empty SQL body")));
            }
            let result = build_db_result(kind, hints, &template, context)?;
            return Ok(Action::Sql(DbQuery { result, template }));
        }
    }

    Err(AppError::ServerConfiguration(format!("{context}: unrecognised action '{text}'")))
}

/// Resolves a `DbResultKind` plus optional hints into a concrete
/// [`DbResult`], falling back to [`DbTemplate::probe`] when hints are
/// omitted (§4.B).
fn build_db_result(
    kind: DbResultKind,
    hints: Option<Vec<String>>,
    template: &DbTemplate,
    context: &str,
) -> Result<DbResult, AppError> {
    match kind {
        DbResultKind::None => Ok(DbResult::None),
        DbResultKind::Count => Ok(DbResult::Count),
        DbResultKind::Item | DbResultKind::ItemOk | DbResultKind::Collection => {
            let columns = match hints {
                Some(h) if !h.is_empty() => h,
                _ => template.probe().columns.ok_or_else(|| {
                    AppError::ServerConfiguration(format!(
                        "{context}: cannot infer columns; add explicit (col,...) hints"
                    ))
                })?,
            };
            Ok(match kind {
                DbResultKind::Item => DbResult::Item { columns },
                DbResultKind::ItemOk => DbResult::ItemOk { columns },
                DbResultKind::Collection => DbResult::Collection { columns },
                _ => unreachable!(),
            })
        }
        DbResultKind::LastInsert => {
            let (table, sequence) = match hints {
                Some(h) if !h.is_empty() => {
                    let table = h[0].clone();
                    let sequence = h.get(1).cloned().unwrap_or_else(|| "id".to_string());
                    (table, sequence)
                }
                _ => {
                    let table = template.probe().table.ok_or_else(|| {
                        AppError::ServerConfiguration(format!(
                            "{context}: cannot infer table; add explicit (table,sequence) hints"
                        ))
                    })?;
                    (table, "id".to_string())
                }
            };
            Ok(DbResult::LastInsert { table, sequence })
        }
    }
}

/// Strips trailing `#` comments (quote-aware) and merges lines so that a
/// `{ … }` block opened mid-line stays together as one logical line,
/// returning each logical line tagged with the physical line number it
/// started on.
fn logical_lines(text: &str) -> Vec<(usize, String)> {
    let normalised = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = Vec::new();
    let mut current = String::new();
    let mut depth: i32 = 0;
    let mut start_line = 0usize;

    for (idx, raw) in normalised.split('\n').enumerate() {
        let line_no = idx + 1;
        let stripped = strip_comment(raw);
        if depth == 0 && stripped.trim().is_empty() {
            continue;
        }
        if current.is_empty() {
            start_line = line_no;
        } else {
            current.push(' ');
        }
        current.push_str(stripped.trim());
        depth += brace_delta(stripped);
        if depth <= 0 {
            out.push((start_line, std::mem::take(&mut current)));
            depth = 0;
        }
    }
    if !current.trim().is_empty() {
        out.push((start_line, current));
    }
    out
}

fn strip_comment(line: &str) -> &str {
    let mut in_string: Option<char> = None;
    let mut escaped = false;
    for (idx, ch) in line.char_indices() {
        if let Some(quote) = in_string {
            if escaped {
                escaped = false;
                continue;
            }
            if ch == '\\' {
                escaped = true;
                continue;
            }
            if ch == quote {
                in_string = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => in_string = Some(ch),
            '#' => return &line[..idx],
            _ => {}
        }
    }
    line
}

fn brace_delta(line: &str) -> i32 {
    let mut depth = 0i32;
    let mut in_string: Option<char> = None;
    let mut escaped = false;
    for ch in line.chars() {
        if let Some(quote) = in_string {
            if escaped {
                escaped = false;
                continue;
            }
            if ch == '\\' {
                escaped = true;
                continue;
            }
            if ch == quote {
                in_string = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => in_string = Some(ch),
            '{' => depth += 1,
            '}' => depth -= 1,
            _ => {}
        }
    }
    depth
}

// --- JSON pipeline literal grammar, shared by `|>` inline bodies and named
// pipeline files loaded into the mesh. ---

#[derive(Debug, Deserialize)]
struct PipelineDsl {
    #[serde(default)]
    processors: HashMap<String, ProcessorDsl>,
    #[serde(default)]
    connections: Vec<ConnectionDsl>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ProcessorDsl {
    Sql {
        result: String,
        #[serde(default)]
        hints: Vec<String>,
        sql: String,
    },
    Static {
        value: Value,
    },
    Pipeline {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        inline: Option<Box<PipelineDsl>>,
    },
    Nodejs {
        script: String,
    },
}

#[derive(Debug, Deserialize)]
struct ConnectionDsl {
    from: String,
    to: String,
}

fn parse_pipeline_json(text: &str, context: &str) -> Result<Pipeline, AppError> {
    let dsl: PipelineDsl = serde_json::from_str(text)
        .map_err(|e| AppError::ServerConfiguration(format!("{context}: invalid pipeline JSON: {e}")))?;
    pipeline_from_dsl(dsl, context)
}

fn pipeline_from_dsl(dsl: PipelineDsl, context: &str) -> Result<Pipeline, AppError> {
    let mut processors = HashMap::with_capacity(dsl.processors.len());
    for (name, processor_dsl) in dsl.processors {
        let kind = processor_kind_from_dsl(&name, processor_dsl, context)?;
        processors.insert(name.clone(), Processor { name, kind });
    }
    let connections = dsl.connections.iter().map(connection_from_dsl).collect();
    let pipeline = Pipeline { processors, connections };
    pipeline.validate()?;
    Ok(pipeline)
}

fn processor_kind_from_dsl(name: &str, dsl: ProcessorDsl, context: &str) -> Result<ProcessorKind, AppError> {
    match dsl {
        ProcessorDsl::Sql { result, hints, sql } => {
            let template = DbTemplate::parse(&sql);
            let kind = match result.to_lowercase().as_str() {
                "none" => DbResultKind::None,
                "item" => DbResultKind::Item,
                "itemok" => DbResultKind::ItemOk,
                "collection" => DbResultKind::Collection,
                "lastinsert" => DbResultKind::LastInsert,
                "count" => DbResultKind::Count,
                other => {
                    return Err(AppError::ServerConfiguration(format!(
                        "{context}: processor '{name}' has unknown result mode '{other}'"
                    )))
                }
            };
            // Same allowance as a route's `--`/`><` symbol (§8 E3): a `none`
            // or `count` processor needs no SQL body.
            if template.is_empty() && !matches!(kind, DbResultKind::None | DbResultKind::Count) {
                return Err(AppError::ServerConfiguration(format!(
                    "{context}: processor '{name}' has an empty SQL body"
                )));
            }
            let hints = if hints.is_empty() { None } else { Some(hints) };
            let processor_context = format!("{context} processor '{name}'");
            let db_result = build_db_result(kind, hints, &template, &processor_context)?;
            Ok(ProcessorKind::Sql(DbQuery { result: db_result, template }))
        }
        ProcessorDsl::Static { value } => Ok(ProcessorKind::Static(value)),
        ProcessorDsl::Nodejs { script } => Ok(ProcessorKind::NodeJs(script)),
        ProcessorDsl::Pipeline { name: named, inline } => match (named, inline) {
            (Some(n), None) => Ok(ProcessorKind::Pipeline(PipelineRef::Named(n))),
            (None, Some(inner)) => {
                Ok(ProcessorKind::Pipeline(PipelineRef::Inline(Box::new(pipeline_from_dsl(*inner, context)?))))
            }
            _ => Err(AppError::ServerConfiguration(format!(
                "{context}: processor '{name}' must set exactly one of 'name' or 'inline'"
            ))),
        },
    }
}

fn connection_from_dsl(dsl: &ConnectionDsl) -> Connection {
    let (from_node, from_field) = split_node_field(&dsl.from);
    let (to_node, to_field) = split_node_field(&dsl.to);
    Connection { from_node, from_field, to_node, to_field }
}

fn split_node_field(s: &str) -> (String, String) {
    match s.split_once('.') {
        Some((node, field)) => (node.to_string(), field.to_string()),
        None => (s.to_string(), String::new()),
    }
}
