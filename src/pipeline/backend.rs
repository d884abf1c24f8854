//! Backend Interaction agent
//!
//! Pure HTTP execution of a fully rendered request descriptor; no policy
//! lives here. Bodies are read up to 1 MiB per page (the remainder is
//! truncated, not an error). JSON bodies are parsed with numeric
//! normalization so condition comparisons are stable across platforms:
//! integral numbers become integers, everything else a decimal string.
//! `Link: <url>; rel="next"` pagination is followed up to the configured
//! page bound with a visited-URL cycle guard.

use reqwest::Url;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;

use crate::cache::key::BackendDescriptor;
use crate::pipeline::state::PageSnapshot;
use crate::rules::compile::Pagination;

/// Per-response body cap in bytes
pub const BODY_CAP: usize = 1024 * 1024;

/// Result of executing one descriptor (all pages)
#[derive(Debug, Default)]
pub struct BackendResult {
    /// One snapshot per fetched page, in fetch order
    pub pages: Vec<PageSnapshot>,

    /// Network, read, or decode failure, when one occurred
    pub error: Option<String>,
}

/// HTTP executor shared by all rules
#[derive(Debug, Clone)]
pub struct BackendExecutor {
    client: reqwest::Client,
    timeout: Duration,
}

impl BackendExecutor {
    /// Build the executor with the configured per-page timeout
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    /// Execute a rendered descriptor, following pagination when enabled
    pub async fn execute(
        &self,
        descriptor: &BackendDescriptor,
        accepted_status: &BTreeSet<u16>,
        pagination: Option<Pagination>,
    ) -> BackendResult {
        let mut result = BackendResult::default();
        let max_pages = pagination.map(|p| p.max_pages).unwrap_or(1).max(1);
        let mut visited: HashSet<String> = HashSet::new();

        let mut url = match build_url(&descriptor.url, &descriptor.query) {
            Ok(url) => url,
            Err(e) => {
                result.error = Some(e);
                return result;
            }
        };

        loop {
            if !visited.insert(url.to_string()) {
                // Cycle guard: a repeated next link ends pagination.
                tracing::debug!(url = %url, "pagination cycle detected");
                break;
            }

            match self.fetch_page(url.clone(), descriptor, accepted_status).await {
                Ok(page) => {
                    let next = next_link(&page.headers);
                    result.pages.push(page);

                    let Some(next) = next else { break };
                    if result.pages.len() >= max_pages {
                        break;
                    }
                    url = match merge_next_url(&next, &descriptor.query) {
                        Ok(url) => url,
                        Err(e) => {
                            result.error = Some(e);
                            break;
                        }
                    };
                }
                Err(e) => {
                    result.error = Some(e);
                    break;
                }
            }
        }

        result
    }

    async fn fetch_page(
        &self,
        url: Url,
        descriptor: &BackendDescriptor,
        accepted_status: &BTreeSet<u16>,
    ) -> std::result::Result<PageSnapshot, String> {
        let method: reqwest::Method = descriptor
            .method
            .parse()
            .map_err(|_| format!("invalid method {:?}", descriptor.method))?;

        let mut request = self
            .client
            .request(method, url.clone())
            .timeout(self.timeout);
        for (name, value) in &descriptor.headers {
            request = request.header(name, value);
        }
        if let Some(body) = &descriptor.body {
            request = request.body(body.clone());
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();

        let mut headers = BTreeMap::new();
        for (name, value) in response.headers() {
            let name = name.as_str().to_ascii_lowercase();
            if let Ok(value) = value.to_str() {
                headers.entry(name).or_insert_with(|| value.to_string());
            }
        }

        let body_text = read_capped(response).await.map_err(|e| e.to_string())?;

        let is_json = headers
            .get("content-type")
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("json"));
        let body = if is_json && !body_text.is_empty() {
            let parsed: Value =
                serde_json::from_str(&body_text).map_err(|e| format!("JSON decode: {e}"))?;
            normalize_numbers(parsed)
        } else {
            Value::Null
        };

        Ok(PageSnapshot {
            url: url.to_string(),
            status,
            headers,
            body,
            body_text,
            accepted: accepted_status.contains(&status),
        })
    }
}

/// Read the response body, truncating at [`BODY_CAP`]
async fn read_capped(mut response: reqwest::Response) -> reqwest::Result<String> {
    let mut bytes: Vec<u8> = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let remaining = BODY_CAP - bytes.len();
        if chunk.len() >= remaining {
            bytes.extend_from_slice(&chunk[..remaining]);
            break;
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn build_url(base: &str, query: &BTreeMap<String, String>) -> std::result::Result<Url, String> {
    let mut url = Url::parse(base).map_err(|e| format!("invalid URL {base:?}: {e}"))?;
    append_missing_query(&mut url, query);
    Ok(url)
}

/// Resolve a pagination link; its own query parameters win over the descriptor's
fn merge_next_url(
    next: &str,
    query: &BTreeMap<String, String>,
) -> std::result::Result<Url, String> {
    let mut url = Url::parse(next).map_err(|e| format!("invalid next link {next:?}: {e}"))?;
    append_missing_query(&mut url, query);
    Ok(url)
}

fn append_missing_query(url: &mut Url, query: &BTreeMap<String, String>) {
    let present: HashSet<String> = url.query_pairs().map(|(k, _)| k.into_owned()).collect();
    let mut pairs = url.query_pairs_mut();
    for (name, value) in query {
        if !present.contains(name) {
            pairs.append_pair(name, value);
        }
    }
    drop(pairs);
    if url.query() == Some("") {
        url.set_query(None);
    }
}

/// `Link: <url>; rel="next"` — the subset of RFC 8288 pagination follows
pub fn next_link(headers: &BTreeMap<String, String>) -> Option<String> {
    let header = headers.get("link")?;
    for entry in header.split(',') {
        let mut parts = entry.split(';');
        let target = parts.next()?.trim();
        let url = target.strip_prefix('<')?.strip_suffix('>')?;
        for param in parts {
            let (name, value) = match param.trim().split_once('=') {
                Some(pair) => pair,
                None => continue,
            };
            if name.trim().eq_ignore_ascii_case("rel")
                && value.trim().trim_matches('"').eq_ignore_ascii_case("next")
            {
                return Some(url.to_string());
            }
        }
    }
    None
}

/// Integers stay integers; every other number becomes its decimal string
pub fn normalize_numbers(value: Value) -> Value {
    match value {
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                Value::Number(n)
            } else {
                Value::String(n.to_string())
            }
        }
        Value::Array(items) => {
            Value::Array(items.into_iter().map(normalize_numbers).collect())
        }
        Value::Object(entries) => Value::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k, normalize_numbers(v)))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_numbers() {
        let input = json!({
            "count": 3,
            "big": 9007199254740993i64,
            "ratio": 0.25,
            "nested": [{"score": 1.5}, {"score": 2}]
        });
        let normalized = normalize_numbers(input);
        assert_eq!(normalized["count"], json!(3));
        assert_eq!(normalized["big"], json!(9007199254740993i64));
        assert_eq!(normalized["ratio"], json!("0.25"));
        assert_eq!(normalized["nested"][0]["score"], json!("1.5"));
        assert_eq!(normalized["nested"][1]["score"], json!(2));
    }

    #[test]
    fn test_next_link_parsing() {
        let mut headers = BTreeMap::new();
        headers.insert(
            "link".to_string(),
            "<https://api.example.com/items?page=3>; rel=\"next\", \
             <https://api.example.com/items?page=1>; rel=\"prev\""
                .to_string(),
        );
        assert_eq!(
            next_link(&headers).as_deref(),
            Some("https://api.example.com/items?page=3")
        );

        headers.insert(
            "link".to_string(),
            "<https://api.example.com/items?page=1>; rel=\"prev\"".to_string(),
        );
        assert_eq!(next_link(&headers), None);

        headers.remove("link");
        assert_eq!(next_link(&headers), None);
    }

    #[test]
    fn test_build_url_appends_descriptor_query() {
        let mut query = BTreeMap::new();
        query.insert("per_page".to_string(), "100".to_string());
        let url = build_url("https://api.example.com/items", &query).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/items?per_page=100");
    }

    #[test]
    fn test_next_url_params_win_over_descriptor() {
        let mut query = BTreeMap::new();
        query.insert("page".to_string(), "1".to_string());
        query.insert("per_page".to_string(), "100".to_string());
        let url = merge_next_url("https://api.example.com/items?page=3", &query).unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.com/items?page=3&per_page=100"
        );
    }

    #[test]
    fn test_invalid_url_is_a_backend_error() {
        let query = BTreeMap::new();
        assert!(build_url("not a url", &query).is_err());
    }
}
