//! Builds a request file from a directory of JSON request bodies.
//!
//! Each `*.json` file becomes one request with id `id_{file name}`. A body wrapped in a
//! top-level `request` key is unwrapped. Files that are not valid JSON are skipped and
//! reported.

use std::path::{Path, PathBuf};

use crate::error::{BarrageError, Result};
use crate::request::{Request, RequestSet};

/// What `make` produced.
#[derive(Debug)]
pub struct MakeReport {
    pub path: PathBuf,
    pub written: usize,
    /// Files that could not be read as JSON, with the reason
    pub skipped: Vec<(PathBuf, String)>,
}

/// Name of the request file for a batch name.
pub fn requests_file_name(batch_name: &str) -> String {
    format!("{}-requests.jsonl", batch_name)
}

/// Name of the outcome file for a batch name.
pub fn responses_file_name(batch_name: &str) -> String {
    format!("{}-responses.jsonl", batch_name)
}

/// Write `{out_dir}/{batch_name}-requests.jsonl` from the JSON files in `in_dir`.
///
/// Files are taken in name order.
pub async fn make(in_dir: &Path, out_dir: &Path, batch_name: &str) -> Result<MakeReport> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(in_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") && entry.file_type().await?.is_file() {
            files.push(path);
        }
    }
    if files.is_empty() {
        return Err(BarrageError::Validation(format!(
            "no JSON files found in {}",
            in_dir.display()
        )));
    }
    files.sort();

    let mut requests = Vec::with_capacity(files.len());
    let mut skipped = Vec::new();
    for file in files {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let content = tokio::fs::read_to_string(&file).await?;
        let body: serde_json::Value = match serde_json::from_str(&content) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(file = %file.display(), error = %e, "Skipping file with invalid JSON");
                skipped.push((file, e.to_string()));
                continue;
            }
        };
        let body = match body {
            serde_json::Value::Object(mut map) if map.contains_key("request") => {
                map.remove("request").unwrap_or_default()
            }
            other => other,
        };
        tracing::debug!(file = %file.display(), "Adding request");
        requests.push(Request {
            id: format!("id_{}", name).into(),
            method: Some("POST".to_string()),
            url: Some("/v1/chat/completions".to_string()),
            payload: body,
        });
    }

    let set = RequestSet::new(requests)?;
    tokio::fs::create_dir_all(out_dir).await?;
    let path = out_dir.join(requests_file_name(batch_name));
    tokio::fs::write(&path, set.to_jsonl()?).await?;

    tracing::info!(path = %path.display(), requests = set.len(), skipped = skipped.len(), "Request file written");
    Ok(MakeReport {
        path,
        written: set.len(),
        skipped,
    })
}
