//! HTTP client for the Canvas REST API.

use std::net::IpAddr;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, LINK, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::debug;
use url::Url;

use coursepipe_shared::{PipelineError, Result};

use crate::source::{Download, SourceApi};

/// User-Agent string for API requests.
const USER_AGENT: &str = concat!("coursepipe/", env!("CARGO_PKG_VERSION"));

/// Page size requested from paginated endpoints.
const PER_PAGE: &str = "100";

/// Canvas API client authenticated with a bearer token.
pub struct CanvasClient {
    client: Client,
    api_root: Url,
    token: String,
    /// Allow downloads from localhost/private IPs (for tests with mock servers).
    allow_localhost: bool,
}

impl CanvasClient {
    /// Create a client for the LMS at `base` (e.g. `https://canvas.example.edu/`).
    pub fn new(base: &Url, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Source(format!("failed to build HTTP client: {e}")))?;

        let api_root = base
            .join("api/v1/")
            .map_err(|e| PipelineError::config(format!("invalid API base {base}: {e}")))?;

        Ok(Self {
            client,
            api_root,
            token: token.into(),
            allow_localhost: false,
        })
    }

    /// Allow downloading from localhost/private IPs (for integration tests).
    pub fn allow_localhost(mut self) -> Self {
        self.allow_localhost = true;
        self
    }

    fn api_url(&self, path: &str) -> Result<Url> {
        self.api_root
            .join(path.trim_start_matches('/'))
            .map_err(|e| PipelineError::parse(format!("bad API path '{path}': {e}")))
    }

    async fn send(&self, url: &Url) -> Result<reqwest::Response> {
        debug!(%url, "GET");
        let response = self
            .client
            .get(url.as_str())
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .send()
            .await
            .map_err(|e| PipelineError::Fetch(format!("{url}: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(url, status, &headers, &body))
    }

    async fn json(&self, url: &Url) -> Result<(Value, HeaderMap)> {
        let response = self.send(url).await?;
        let headers = response.headers().clone();
        let value = response
            .json::<Value>()
            .await
            .map_err(|e| PipelineError::Fetch(format!("{url}: body read failed: {e}")))?;
        Ok((value, headers))
    }
}

#[async_trait]
impl SourceApi for CanvasClient {
    async fn get_collection(&self, path: &str) -> Result<Vec<Value>> {
        let mut url = self.api_url(path)?;
        url.query_pairs_mut().append_pair("per_page", PER_PAGE);

        let mut items = Vec::new();
        let mut next = Some(url);
        while let Some(url) = next.take() {
            let (value, headers) = self.json(&url).await?;
            match value {
                Value::Array(page) => items.extend(page),
                other => {
                    return Err(PipelineError::parse(format!(
                        "{url}: expected a JSON array, got {}",
                        type_name(&other)
                    )));
                }
            }
            next = next_link(&headers);
        }
        Ok(items)
    }

    async fn get_object(&self, path: &str) -> Result<Value> {
        let url = self.api_url(path)?;
        let (value, _) = self.json(&url).await?;
        if !value.is_object() {
            return Err(PipelineError::parse(format!(
                "{url}: expected a JSON object, got {}",
                type_name(&value)
            )));
        }
        Ok(value)
    }

    async fn download(&self, url: &str) -> Result<Download> {
        let url = Url::parse(url)
            .map_err(|e| PipelineError::parse(format!("bad download URL '{url}': {e}")))?;
        if !self.allow_localhost && is_ssrf_target(&url) {
            return Err(PipelineError::NotFound(format!(
                "{url}: download target blocked"
            )));
        }

        let response = self.send(&url).await?;
        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let bytes = response
            .bytes()
            .await
            .map_err(|e| PipelineError::Fetch(format!("{url}: body read failed: {e}")))?;

        Ok(Download {
            mime_type,
            bytes: bytes.to_vec(),
        })
    }
}

// ---------------------------------------------------------------------------
// Response classification
// ---------------------------------------------------------------------------

/// Map a non-success status onto the error taxonomy.
///
/// Canvas throttles with `403 Forbidden (Rate Limit Exceeded)` as well as 429.
fn classify_status(url: &Url, status: StatusCode, headers: &HeaderMap, body: &str) -> PipelineError {
    let retry_after = headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64);

    match status {
        StatusCode::TOO_MANY_REQUESTS => PipelineError::RateLimited { retry_after },
        StatusCode::FORBIDDEN if body.contains("Rate Limit Exceeded") => {
            PipelineError::RateLimited { retry_after }
        }
        StatusCode::UNAUTHORIZED => PipelineError::Source(format!(
            "{url}: HTTP 401, the access token was rejected"
        )),
        StatusCode::NOT_FOUND | StatusCode::FORBIDDEN | StatusCode::GONE => {
            PipelineError::NotFound(format!("{url}: HTTP {status}"))
        }
        s if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => {
            PipelineError::Fetch(format!("{url}: HTTP {status}"))
        }
        _ => PipelineError::NotFound(format!("{url}: HTTP {status}")),
    }
}

/// Extract the `rel="next"` target from a `Link` header.
fn next_link(headers: &HeaderMap) -> Option<Url> {
    static NEXT_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"<([^>]+)>\s*;\s*rel="?next"?"#).expect("valid regex")
    });

    headers
        .get_all(LINK)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .find_map(|part| NEXT_RE.captures(part.trim()))
        .and_then(|c| Url::parse(&c[1]).ok())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a download URL targets a potentially dangerous resource.
fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    if let Some(host) = url.host_str() {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return is_private_ip(&ip);
        }
        if host == "localhost" || host.ends_with(".local") || host.ends_with(".internal") {
            return true;
        }
    }

    false
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> CanvasClient {
        let base = Url::parse(&server.uri()).unwrap();
        CanvasClient::new(&base, "secret-token", Duration::from_secs(5))
            .unwrap()
            .allow_localhost()
    }

    #[tokio::test]
    async fn collection_follows_link_pagination() {
        let server = MockServer::start().await;
        let next = format!(
            "<{}/api/v1/courses/1/pages?page=2&per_page=100>; rel=\"next\"",
            server.uri()
        );

        Mock::given(method("GET"))
            .and(path("/api/v1/courses/1/pages"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{"url": "b"}])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/courses/1/pages"))
            .and(header("authorization", "Bearer secret-token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("link", next.as_str())
                    .set_body_json(serde_json::json!([{"url": "a"}])),
            )
            .mount(&server)
            .await;

        let items = client_for(&server)
            .get_collection("courses/1/pages")
            .await
            .unwrap();
        let urls: Vec<&str> = items.iter().filter_map(|v| v["url"].as_str()).collect();
        assert_eq!(urls, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn status_codes_map_to_error_taxonomy() {
        let server = MockServer::start().await;
        Mock::given(path("/api/v1/throttled"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "2"))
            .mount(&server)
            .await;
        Mock::given(path("/api/v1/canvas-throttled"))
            .respond_with(ResponseTemplate::new(403).set_body_string("403 Forbidden (Rate Limit Exceeded)"))
            .mount(&server)
            .await;
        Mock::given(path("/api/v1/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(path("/api/v1/denied"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(path("/api/v1/broken"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let client = client_for(&server);
        match client.get_object("throttled").await.unwrap_err() {
            PipelineError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(2)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(
            client.get_object("canvas-throttled").await.unwrap_err(),
            PipelineError::RateLimited { .. }
        ));
        assert!(matches!(
            client.get_object("gone").await.unwrap_err(),
            PipelineError::NotFound(_)
        ));
        assert!(matches!(
            client.get_object("denied").await.unwrap_err(),
            PipelineError::Source(_)
        ));
        assert!(client.get_object("broken").await.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn download_reports_mime_type() {
        let server = MockServer::start().await;
        Mock::given(path("/files/9/download"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/pdf; qs=0.001")
                    .set_body_bytes(b"%PDF-1.4".to_vec()),
            )
            .mount(&server)
            .await;

        let download = client_for(&server)
            .download(&format!("{}/files/9/download", server.uri()))
            .await
            .unwrap();
        assert_eq!(download.mime_type, "application/pdf");
        assert_eq!(download.bytes, b"%PDF-1.4");
    }

    #[test]
    fn ssrf_protection() {
        assert!(is_ssrf_target(&Url::parse("file:///etc/passwd").unwrap()));
        assert!(is_ssrf_target(&Url::parse("http://10.0.0.1/").unwrap()));
        assert!(is_ssrf_target(&Url::parse("http://localhost:8080/").unwrap()));
        assert!(!is_ssrf_target(&Url::parse("https://canvas.example.edu/files/1").unwrap()));
    }
}
