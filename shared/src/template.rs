//! The SQL template engine (§4.A).
//!
//! Parses `{{ name }}`-bearing SQL fragments into an ordered list of
//! fragments, renders them against a JSON parameter bag with a single safe
//! quoting rule, and makes a best-effort guess at the table/columns a
//! template touches so the route parser can fill in omitted `(cols)` hints.

use serde_json::Value;

/// One piece of a parsed template: either literal SQL text or a hole that
/// must be bound from the parameter bag before rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Literal(String),
    /// Name of the hole. Path variables are written `:name` in the DSL and
    /// keep the `:` prefix here so `render` can look them up as ordinary
    /// bag keys (the bag is pre-populated with `:`-prefixed aliases for path
    /// variables, see `dispatcher::build_bag`).
    Hole(String),
}

/// A parsed SQL template: an ordered list of fragments.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DbTemplate {
    pub fragments: Vec<Fragment>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("unbound template hole: {0}")]
    Missing(String),
    #[error("empty template")]
    Empty,
}

impl DbTemplate {
    /// Parses `text`, scanning for `{{ name }}` holes. Whitespace inside the
    /// braces is stripped; an unmatched `{{` (no closing `}}`) is treated as
    /// literal text.
    pub fn parse(text: &str) -> DbTemplate {
        let mut fragments = Vec::new();
        let mut literal = String::new();
        let bytes = text.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'{' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
                if let Some(end) = text[i..].find("}}") {
                    let hole_text = &text[i + 2..i + end];
                    let name: String = hole_text.chars().filter(|c| !c.is_whitespace()).collect();
                    if is_valid_hole_name(&name) {
                        if !literal.is_empty() {
                            fragments.push(Fragment::Literal(std::mem::take(&mut literal)));
                        }
                        fragments.push(Fragment::Hole(name));
                        i += end + 2;
                        continue;
                    }
                }
            }
            // Not a recognised hole (or unmatched `{{`): keep as literal.
            let ch = text[i..].chars().next().unwrap();
            literal.push(ch);
            i += ch.len_utf8();
        }
        if !literal.is_empty() {
            fragments.push(Fragment::Literal(literal));
        }
        DbTemplate { fragments }
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Renders the template against `bag`, quoting every bound value into
    /// safe SQL literal syntax (§4.A, §8.3/§8.4). Returns the first unbound
    /// hole name in source order on failure.
    pub fn render(&self, bag: &serde_json::Map<String, Value>) -> Result<String, RenderError> {
        if self.is_empty() {
            return Err(RenderError::Empty);
        }
        let mut sql = String::new();
        for frag in &self.fragments {
            match frag {
                Fragment::Literal(s) => sql.push_str(s),
                Fragment::Hole(name) => {
                    let lookup_key = name.strip_prefix(':').unwrap_or(name);
                    let value = bag
                        .get(name)
                        .or_else(|| bag.get(lookup_key))
                        .ok_or_else(|| RenderError::Missing(name.clone()))?;
                    sql.push_str(&quote_value(value));
                }
            }
        }
        Ok(sql)
    }

    /// Best-effort reflection over the template's literal fragments (§4.A).
    /// Only looks at literal text, never at bound values, since this runs at
    /// parse time before any request exists.
    pub fn probe(&self) -> ProbeResult {
        let literal: String = self
            .fragments
            .iter()
            .map(|f| match f {
                Fragment::Literal(s) => s.clone(),
                Fragment::Hole(_) => " ".to_string(),
            })
            .collect();
        probe_literal(&literal)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResult {
    pub table: Option<String>,
    pub columns: Option<Vec<String>>,
}

fn is_valid_hole_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// Converts a JSON value into the single SQL literal syntax this engine
/// trusts as its sole line of injection defence (§4.A, §9).
fn quote_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        // Arrays/objects bound into a template are stringified as JSON text,
        // then quoted like any other string literal.
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

fn probe_literal(sql: &str) -> ProbeResult {
    let normalised = sql.trim();
    let upper = normalised.to_uppercase();

    if let Some(rest) = upper.strip_prefix("INSERT INTO ") {
        let table = first_token(rest, normalised.len() - rest.len());
        return ProbeResult { table: table_of(normalised, &upper, "INSERT INTO "), columns: None }
            .with_table_fallback(table);
    }
    if upper.starts_with("UPDATE ") {
        let table = table_of(normalised, &upper, "UPDATE ");
        return ProbeResult { table, columns: None };
    }
    if upper.starts_with("DELETE FROM ") {
        let table = table_of(normalised, &upper, "DELETE FROM ");
        return ProbeResult { table, columns: None };
    }
    if upper.starts_with("SELECT ") {
        if let Some(from_idx) = upper.find(" FROM ") {
            let cols_part = &normalised[7..from_idx];
            let rest = &normalised[from_idx + 6..];
            let table = first_word(rest);
            let columns = if cols_part.trim() == "*" {
                Some(vec!["*".to_string()])
            } else {
                Some(split_columns(cols_part))
            };
            return ProbeResult { table: Some(table), columns };
        }
    }
    ProbeResult::default()
}

/// Helper retained for readability: wraps a bare table-name guess so the
/// `INSERT INTO` branch above can share the same return shape as the others.
impl ProbeResult {
    fn with_table_fallback(self, table: Option<String>) -> ProbeResult {
        ProbeResult { table: table.or(self.table), columns: self.columns }
    }
}

fn table_of(normalised: &str, upper: &str, prefix: &str) -> Option<String> {
    let rest = &normalised[prefix.len().min(normalised.len())..];
    let _ = upper;
    if rest.is_empty() {
        None
    } else {
        Some(first_word(rest))
    }
}

fn first_token(s: &str, _skip: usize) -> Option<String> {
    Some(first_word(s))
}

fn first_word(s: &str) -> String {
    s.trim()
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("")
        .trim_matches(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .to_string()
}

/// Splits a `SELECT` column list on commas that are not nested inside
/// parentheses, so `count(a, b), c` yields `["count(a, b)", "c"]`.
fn split_columns(cols: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for c in cols.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 => {
                out.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bag(pairs: &[(&str, Value)]) -> serde_json::Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn parses_holes_and_strips_whitespace() {
        let t = DbTemplate::parse("select * from photo where id = {{ :id }}");
        assert_eq!(
            t.fragments,
            vec![
                Fragment::Literal("select * from photo where id = ".into()),
                Fragment::Hole(":id".into()),
            ]
        );
    }

    #[test]
    fn unmatched_brace_is_literal() {
        let t = DbTemplate::parse("foo {{ bar");
        assert_eq!(t.fragments, vec![Fragment::Literal("foo {{ bar".into())]);
    }

    #[test]
    fn render_quotes_strings_and_doubles_apostrophes() {
        let t = DbTemplate::parse("insert into photo(url) values ({{url}})");
        let b = bag(&[("url", json!("O'Reilly"))]);
        let sql = t.render(&b).unwrap();
        assert_eq!(sql, "insert into photo(url) values ('O''Reilly')");
    }

    #[test]
    fn render_emits_numbers_and_null_verbatim() {
        let t = DbTemplate::parse("select {{a}}, {{b}}");
        let b = bag(&[("a", json!(42)), ("b", json!(Value::Null))]);
        assert_eq!(t.render(&b).unwrap(), "select 42, NULL");
    }

    #[test]
    fn render_reports_first_missing_hole_in_source_order() {
        let t = DbTemplate::parse("{{first}} {{second}}");
        let b = bag(&[("second", json!(1))]);
        assert_eq!(t.render(&b), Err(RenderError::Missing("first".into())));
    }

    #[test]
    fn render_rejects_empty_template() {
        let t = DbTemplate::parse("");
        assert_eq!(t.render(&bag(&[])), Err(RenderError::Empty));
    }

    #[test]
    fn probe_infers_select_star_table() {
        let t = DbTemplate::parse("select * from photo where id = {{:id}}");
        let p = t.probe();
        assert_eq!(p.table.as_deref(), Some("photo"));
        assert_eq!(p.columns, Some(vec!["*".to_string()]));
    }

    #[test]
    fn probe_infers_select_columns() {
        let t = DbTemplate::parse("select id, url from photo");
        let p = t.probe();
        assert_eq!(p.table.as_deref(), Some("photo"));
        assert_eq!(p.columns, Some(vec!["id".to_string(), "url".to_string()]));
    }

    #[test]
    fn probe_splits_columns_outside_parens() {
        let t = DbTemplate::parse("select count(a, b), c from t");
        let p = t.probe();
        assert_eq!(p.columns, Some(vec!["count(a, b)".to_string(), "c".to_string()]));
    }

    #[test]
    fn probe_infers_insert_table() {
        let t = DbTemplate::parse("insert into photo(url) values ('{{url}}')");
        assert_eq!(t.probe().table.as_deref(), Some("photo"));
    }

    #[test]
    fn probe_infers_update_and_delete_table() {
        assert_eq!(DbTemplate::parse("update photo set url = {{url}}").probe().table.as_deref(), Some("photo"));
        assert_eq!(DbTemplate::parse("delete from photo where id = {{:id}}").probe().table.as_deref(), Some("photo"));
    }
}
