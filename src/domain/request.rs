//! Requests and request sets.
//!
//! A request set is read from a JSONL file in the OpenAI batch line format
//! (`custom_id`, `method`, `url`, `body`). Each adapter translates the body into its
//! provider's native shape at submission time.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BarrageError, Result};

/// Identifier of a request, unique within its request set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId(id.to_string())
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        RequestId(id)
    }
}

impl std::ops::Deref for RequestId {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One completion request. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "custom_id", alias = "id")]
    pub id: RequestId,

    /// HTTP method from the OpenAI line format, usually "POST"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Endpoint from the OpenAI line format, e.g. "/v1/chat/completions"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// OpenAI-style chat completion body
    #[serde(rename = "body", alias = "payload")]
    pub payload: serde_json::Value,
}

impl Request {
    pub fn new(id: impl Into<RequestId>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            method: None,
            url: None,
            payload,
        }
    }

    /// Model named in the payload, if any.
    pub fn model(&self) -> Option<&str> {
        self.payload.get("model").and_then(|m| m.as_str())
    }
}

/// Ordered collection of requests for one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestSet {
    requests: Vec<Request>,
}

impl RequestSet {
    /// Build a request set, rejecting duplicate ids.
    pub fn new(requests: Vec<Request>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(requests.len());
        for request in &requests {
            if !seen.insert(&request.id) {
                return Err(BarrageError::Validation(format!(
                    "duplicate request id '{}'",
                    request.id
                )));
            }
        }
        Ok(Self { requests })
    }

    /// Parse one request per non-blank line.
    pub fn from_jsonl(content: &str) -> Result<Self> {
        let mut requests = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let request: Request = serde_json::from_str(line).map_err(|e| {
                BarrageError::Validation(format!("line {}: invalid request: {}", line_no + 1, e))
            })?;
            requests.push(request);
        }
        Self::new(requests)
    }

    pub async fn read(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let set = Self::from_jsonl(&content)?;
        tracing::debug!(path = %path.display(), requests = set.len(), "Loaded request file");
        Ok(set)
    }

    pub fn to_jsonl(&self) -> Result<String> {
        let mut out = String::new();
        for request in &self.requests {
            out.push_str(&serde_json::to_string(request)?);
            out.push('\n');
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Request> {
        self.requests.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &RequestId> {
        self.requests.iter().map(|r| &r.id)
    }
}

impl<'a> IntoIterator for &'a RequestSet {
    type Item = &'a Request;
    type IntoIter = std::slice::Iter<'a, Request>;

    fn into_iter(self) -> Self::IntoIter {
        self.requests.iter()
    }
}
