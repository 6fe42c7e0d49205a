//! Loads the pipeline mesh (§3, §4.D): the named table of externally
//! defined pipelines a route's `Pipeline(name)` action or a processor's
//! `PipelineRef::Named` resolves against. Built once at startup from a
//! directory of `*.json` pipeline documents and never mutated afterwards
//! (§5: "routing table and pipeline mesh are initialised once at startup
//! and read-only thereafter").

use crate::error::AppError;
use crate::pipeline::Pipeline;
use crate::route_parser::load_named_pipeline;
use std::collections::HashMap;
use std::path::Path;

/// Reads every `*.json` file directly under `dir`, keying each parsed
/// [`Pipeline`] by its file stem (so `pipelines/submitPhoto.json` becomes
/// the name `submitPhoto` a route file's `|| submitPhoto` resolves). A
/// missing directory yields an empty mesh rather than an error, since a
/// gateway with no pipeline-backed routes need not configure one.
pub async fn load_dir(dir: &str) -> Result<HashMap<String, Pipeline>, AppError> {
    let mut mesh = HashMap::new();
    let path = Path::new(dir);
    if !path.is_dir() {
        return Ok(mesh);
    }

    let mut entries = tokio::fs::read_dir(path)
        .await
        .map_err(|e| AppError::ServerConfiguration(format!("reading pipeline mesh dir '{dir}': {e}")))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| AppError::ServerConfiguration(format!("reading pipeline mesh dir '{dir}': {e}")))?
    {
        let entry_path = entry.path();
        if entry_path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let name = entry_path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| AppError::ServerConfiguration(format!("non-UTF8 pipeline filename in '{dir}'")))?
            .to_string();
        let text = tokio::fs::read_to_string(&entry_path)
            .await
            .map_err(|e| AppError::ServerConfiguration(format!("reading '{}': {e}", entry_path.display())))?;
        let pipeline = load_named_pipeline(&text)
            .map_err(|e| AppError::ServerConfiguration(format!("pipeline '{name}': {e}")))?;
        mesh.insert(name, pipeline);
    }
    Ok(mesh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn loads_every_json_file_keyed_by_stem() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("greet.json")).unwrap();
        write!(file, r#"{{"processors":{{"a":{{"type":"static","value":{{"hi":true}}}}}},"connections":[]}}"#)
            .unwrap();
        std::fs::File::create(dir.path().join("notes.txt")).unwrap();

        let mesh = load_dir(dir.path().to_str().unwrap()).await.unwrap();
        assert_eq!(mesh.len(), 1);
        assert!(mesh.contains_key("greet"));
    }

    #[tokio::test]
    async fn missing_directory_yields_empty_mesh() {
        let mesh = load_dir("/does/not/exist").await.unwrap();
        assert!(mesh.is_empty());
    }

    #[tokio::test]
    async fn malformed_pipeline_file_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("bad.json")).unwrap();
        write!(file, "not json").unwrap();
        let err = load_dir(dir.path().to_str().unwrap()).await.unwrap_err();
        assert_eq!(err.kind(), "ServerConfiguration");
    }
}
