//! Splitting a request set into provider-sized chunks.
//!
//! Requests are grouped by partition key (in order of first appearance), keeping input
//! order inside each group. Each group is then cut greedily into chunks bounded by both
//! the request count and the encoded byte size. A request that cannot be encoded, or
//! whose encoding alone exceeds the byte limit, becomes a chunk of its own that is
//! rejected before any network call.

use std::collections::HashMap;

use super::BatchLimits;
use crate::error::Result;
use crate::request::{Request, RequestId, RequestSet};

/// One unit of submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Position in the partitioning of the request set
    pub index: usize,
    pub partition: Option<String>,
    /// Requests in submission order
    pub request_ids: Vec<RequestId>,
    /// Provider-native encoding of each request, same order as `request_ids`
    pub lines: Vec<serde_json::Value>,
    /// Encoded size including one newline per line
    pub bytes: usize,
    /// Set when the chunk must not be sent
    pub rejection: Option<String>,
}

impl Chunk {
    fn new(index: usize, partition: Option<String>) -> Self {
        Self {
            index,
            partition,
            request_ids: Vec::new(),
            lines: Vec::new(),
            bytes: 0,
            rejection: None,
        }
    }

    fn rejected(index: usize, partition: Option<String>, id: RequestId, reason: String) -> Self {
        Self {
            request_ids: vec![id],
            rejection: Some(reason),
            ..Self::new(index, partition)
        }
    }

    pub fn len(&self) -> usize {
        self.request_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.request_ids.is_empty()
    }

    /// The chunk as JSONL, one line per request.
    pub fn to_jsonl(&self) -> String {
        let mut out = String::with_capacity(self.bytes);
        for line in &self.lines {
            out.push_str(&line.to_string());
            out.push('\n');
        }
        out
    }
}

fn line_size(line: &serde_json::Value) -> usize {
    line.to_string().len() + 1
}

/// Partition `requests` into chunks that respect `limits`.
///
/// Every request of the set lands in exactly one chunk.
pub fn partition(
    requests: &RequestSet,
    limits: BatchLimits,
    key: impl Fn(&Request) -> Option<String>,
    encode: impl Fn(&Request, usize) -> Result<serde_json::Value>,
) -> Vec<Chunk> {
    let max_requests = limits.max_requests.max(1);

    let mut groups: Vec<(Option<String>, Vec<&Request>)> = Vec::new();
    let mut group_index: HashMap<Option<String>, usize> = HashMap::new();
    for request in requests {
        let k = key(request);
        let idx = *group_index.entry(k.clone()).or_insert_with(|| {
            groups.push((k, Vec::new()));
            groups.len() - 1
        });
        groups[idx].1.push(request);
    }

    let mut chunks = Vec::new();
    for (partition_key, members) in groups {
        let mut current = Chunk::new(0, partition_key.clone());

        for request in members {
            let encoded = match encode(request, current.len()) {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(request_id = %request.id, error = %e, "Request cannot be encoded");
                    chunks.push(Chunk::rejected(
                        0,
                        partition_key.clone(),
                        request.id.clone(),
                        format!("request {} cannot be encoded: {}", request.id, e),
                    ));
                    continue;
                }
            };
            let size = line_size(&encoded);

            let full = current.len() >= max_requests || current.bytes + size > limits.max_bytes;
            let (line, size) = if full && !current.is_empty() {
                chunks.push(std::mem::replace(
                    &mut current,
                    Chunk::new(0, partition_key.clone()),
                ));
                // Positional encodings change once the request moves to a fresh chunk
                match encode(request, 0) {
                    Ok(line) => {
                        let size = line_size(&line);
                        (line, size)
                    }
                    Err(e) => {
                        chunks.push(Chunk::rejected(
                            0,
                            partition_key.clone(),
                            request.id.clone(),
                            format!("request {} cannot be encoded: {}", request.id, e),
                        ));
                        continue;
                    }
                }
            } else {
                (encoded, size)
            };

            if size > limits.max_bytes {
                tracing::warn!(
                    request_id = %request.id,
                    bytes = size,
                    max_bytes = limits.max_bytes,
                    "Request exceeds the batch byte limit on its own"
                );
                chunks.push(Chunk::rejected(
                    0,
                    partition_key.clone(),
                    request.id.clone(),
                    format!(
                        "request {} is {} bytes encoded, over the {} byte batch limit",
                        request.id, size, limits.max_bytes
                    ),
                ));
                continue;
            }

            current.request_ids.push(request.id.clone());
            current.lines.push(line);
            current.bytes += size;
        }

        if !current.is_empty() {
            chunks.push(current);
        }
    }

    for (index, chunk) in chunks.iter_mut().enumerate() {
        chunk.index = index;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BarrageError;
    use serde_json::json;
    use std::collections::HashSet;

    fn request_set(ids: &[&str], model: &str) -> RequestSet {
        RequestSet::new(
            ids.iter()
                .map(|id| Request::new(*id, json!({"model": model, "messages": []})))
                .collect(),
        )
        .unwrap()
    }

    fn plain(request: &Request, _position: usize) -> Result<serde_json::Value> {
        Ok(json!({"custom_id": request.id.to_string(), "body": request.payload}))
    }

    fn unlimited_bytes(max_requests: usize) -> BatchLimits {
        BatchLimits {
            max_requests,
            max_bytes: usize::MAX,
        }
    }

    fn ids(chunk: &Chunk) -> Vec<&str> {
        chunk.request_ids.iter().map(|id| &**id).collect()
    }

    #[test]
    fn test_count_cap_yields_ceil_chunks() {
        for (n, k) in [(1usize, 1usize), (5, 2), (6, 3), (7, 3), (10, 10), (11, 10), (100, 7)] {
            let names: Vec<String> = (0..n).map(|i| format!("r{i}")).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let set = request_set(&refs, "m");

            let chunks = partition(&set, unlimited_bytes(k), |_| None, plain);

            assert_eq!(chunks.len(), n.div_ceil(k), "n={n} k={k}");
            let mut seen = HashSet::new();
            for chunk in &chunks {
                assert!(chunk.len() <= k);
                assert!(chunk.rejection.is_none());
                for id in &chunk.request_ids {
                    assert!(seen.insert(id.clone()), "duplicate {id}");
                }
            }
            assert_eq!(seen.len(), n);
        }
    }

    #[test]
    fn test_chunks_keep_input_order_and_indices() {
        let set = request_set(&["a", "b", "c"], "m");
        let chunks = partition(&set, unlimited_bytes(2), |_| None, plain);
        assert_eq!(ids(&chunks[0]), vec!["a", "b"]);
        assert_eq!(ids(&chunks[1]), vec!["c"]);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[1].index, 1);
    }

    #[test]
    fn test_partition_keys_never_share_a_chunk() {
        let set = RequestSet::new(vec![
            Request::new("a", json!({"model": "x"})),
            Request::new("b", json!({"model": "y"})),
            Request::new("c", json!({"model": "x"})),
        ])
        .unwrap();

        let chunks = partition(
            &set,
            unlimited_bytes(10),
            |r| r.model().map(str::to_string),
            plain,
        );

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].partition.as_deref(), Some("x"));
        assert_eq!(ids(&chunks[0]), vec!["a", "c"]);
        assert_eq!(ids(&chunks[1]), vec!["b"]);
    }

    #[test]
    fn test_byte_limit_splits_and_counts_newlines() {
        let set = request_set(&["a", "b", "c"], "m");
        let line = plain(set.iter().next().unwrap(), 0).unwrap();
        let size = line_size(&line);

        // Room for exactly two lines
        let limits = BatchLimits {
            max_requests: 100,
            max_bytes: size * 2,
        };
        let chunks = partition(&set, limits, |_| None, plain);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].bytes, size * 2);
        assert_eq!(chunks[0].to_jsonl().len(), chunks[0].bytes);
    }

    #[test]
    fn test_oversized_request_is_rejected_alone() {
        let set = RequestSet::new(vec![
            Request::new("small", json!({"model": "m"})),
            Request::new("huge", json!({"model": "m", "pad": "x".repeat(500)})),
            Request::new("tiny", json!({"model": "m"})),
        ])
        .unwrap();
        let limits = BatchLimits {
            max_requests: 100,
            max_bytes: 200,
        };

        let chunks = partition(&set, limits, |_| None, plain);

        let rejected: Vec<_> = chunks.iter().filter(|c| c.rejection.is_some()).collect();
        assert_eq!(rejected.len(), 1);
        assert_eq!(ids(rejected[0]), vec!["huge"]);
        assert!(rejected[0].lines.is_empty());
        assert!(
            rejected[0]
                .rejection
                .as_ref()
                .unwrap()
                .contains("over the 200 byte batch limit")
        );

        let accepted: Vec<&str> = chunks
            .iter()
            .filter(|c| c.rejection.is_none())
            .flat_map(ids)
            .collect();
        assert_eq!(accepted, vec!["small", "tiny"]);
    }

    #[test]
    fn test_unencodable_request_is_rejected_alone() {
        let set = request_set(&["a", "bad", "c"], "m");
        let chunks = partition(&set, unlimited_bytes(10), |_| None, |request, position| {
            if &*request.id == "bad" {
                return Err(BarrageError::Validation("no messages".to_string()));
            }
            plain(request, position)
        });

        assert_eq!(chunks.len(), 2);
        assert_eq!(ids(&chunks[0]), vec!["bad"]);
        assert!(chunks[0].rejection.as_ref().unwrap().contains("no messages"));
        assert_eq!(ids(&chunks[1]), vec!["a", "c"]);
    }

    #[test]
    fn test_positions_restart_in_each_chunk() {
        let set = request_set(&["a", "b", "c"], "m");
        let chunks = partition(&set, unlimited_bytes(2), |_| None, |request, position| {
            Ok(json!({"custom_id": format!("req-{position}"), "id": request.id.to_string()}))
        });
        assert_eq!(chunks[0].lines[1]["custom_id"], "req-1");
        assert_eq!(chunks[1].lines[0]["custom_id"], "req-0");
    }

    #[test]
    fn test_empty_set_has_no_chunks() {
        let set = RequestSet::new(vec![]).unwrap();
        assert!(partition(&set, unlimited_bytes(5), |_| None, plain).is_empty());
    }
}
