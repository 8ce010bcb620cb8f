//! The boundary between handlers and the LMS: list a collection, fetch one
//! object, download a file. Paths are relative to the API root.

use async_trait::async_trait;
use serde_json::Value;

use coursepipe_shared::Result;

/// A downloaded binary body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Authenticated access to the course-management API.
///
/// Implementations map transport problems onto the error taxonomy:
/// `Fetch`/`RateLimited` for retryable failures, `NotFound` for a resource
/// that is gone or forbidden, and `Source` when the API is unusable.
#[async_trait]
pub trait SourceApi: Send + Sync {
    /// Every element of a paginated collection, pages followed internally.
    async fn get_collection(&self, path: &str) -> Result<Vec<Value>>;

    /// A single JSON object.
    async fn get_object(&self, path: &str) -> Result<Value>;

    /// The raw body behind an absolute download URL.
    async fn download(&self, url: &str) -> Result<Download>;
}
