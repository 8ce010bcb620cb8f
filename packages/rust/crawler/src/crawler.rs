//! Course enumeration and per-resource fetching with retry.
//!
//! [`Crawler::list_resources`] walks the course structure once and returns
//! the student-visible resources in traversal order. [`Crawler::fetch_with_retry`]
//! pulls one resource's payload, retrying transient failures with exponential
//! backoff and honoring `Retry-After` on throttling.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tokio_retry::RetryIf;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{debug, info, instrument, warn};

use coursepipe_shared::{
    CourseRef, CrawlSection, IncludeFilter, PipelineError, RawPayload, Resource, Result,
    Visibility,
};

use crate::handlers::{Handler, module};
use crate::source::SourceApi;

// ---------------------------------------------------------------------------
// FetchPolicy
// ---------------------------------------------------------------------------

/// Retry, timeout, and pacing settings for API calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPolicy {
    /// Retries after the first attempt.
    pub retry_budget: usize,
    /// First backoff delay; doubles on every retry.
    pub backoff: Duration,
    pub max_backoff: Duration,
    pub unit_timeout: Duration,
    /// Pause before every attempt.
    pub rate_limit: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self::from(&CrawlSection::default())
    }
}

impl From<&CrawlSection> for FetchPolicy {
    fn from(section: &CrawlSection) -> Self {
        Self {
            retry_budget: section.retry_budget,
            backoff: Duration::from_millis(section.backoff_ms),
            max_backoff: Duration::from_millis(section.max_backoff_ms),
            unit_timeout: Duration::from_secs(section.unit_timeout_secs),
            rate_limit: Duration::from_millis(section.rate_limit_ms),
        }
    }
}

impl FetchPolicy {
    /// Backoff delays: `backoff`, `2 * backoff`, `4 * backoff`, ... capped at
    /// `max_backoff`, jittered, and limited to the retry budget.
    fn strategy(&self) -> impl Iterator<Item = Duration> + use<> {
        let base_ms = u64::try_from(self.backoff.as_millis()).unwrap_or(u64::MAX);
        ExponentialBackoff::from_millis(2)
            .factor(base_ms / 2)
            .max_delay(self.max_backoff)
            .map(jitter)
            .take(self.retry_budget)
    }
}

// ---------------------------------------------------------------------------
// Crawler
// ---------------------------------------------------------------------------

/// Enumerates and fetches one course through a [`SourceApi`].
pub struct Crawler {
    api: Arc<dyn SourceApi>,
    course: CourseRef,
    policy: FetchPolicy,
}

impl Crawler {
    pub fn new(api: Arc<dyn SourceApi>, course: CourseRef, policy: FetchPolicy) -> Self {
        Self {
            api,
            course,
            policy,
        }
    }

    pub fn course(&self) -> &CourseRef {
        &self.course
    }

    /// Enumerate every student-visible resource admitted by `include`.
    ///
    /// Modules are listed first so course structure fixes both crawl order and
    /// `parent_id`. Kind listings then either enrich those entries or append
    /// resources reachable outside any module. A kind whose listing endpoint
    /// is missing or forbidden is skipped with a warning.
    #[instrument(skip_all, fields(course_id = %self.course.course_id, include = %include))]
    pub async fn list_resources(&self, include: &IncludeFilter) -> Result<Vec<Resource>> {
        let mut resources: Vec<Resource> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        let structure = self.list_handler(Handler::Modules).await?;
        match include {
            IncludeFilter::Module(module_native) => {
                let root = module::module_id(module_native);
                if !structure.iter().any(|r| r.id == root) {
                    return Err(PipelineError::NotFound(format!(
                        "module {module_native} not found in course {}",
                        self.course.course_id
                    )));
                }
                for resource in structure {
                    if resource.id == root || resource.parent_id.as_ref() == Some(&root) {
                        merge(&mut resources, &mut index, resource, true);
                    }
                }
            }
            _ => {
                for resource in structure {
                    merge(&mut resources, &mut index, resource, true);
                }
            }
        }

        let subtree_only = matches!(include, IncludeFilter::Module(_));
        for handler in Handler::LISTING_ORDER {
            if handler == Handler::Modules {
                continue;
            }
            for resource in self.list_handler(handler).await? {
                merge(&mut resources, &mut index, resource, !subtree_only);
            }
        }

        let total = resources.len();
        let visible: Vec<Resource> = resources
            .into_iter()
            .filter(|r| r.visibility == Visibility::StudentVisible)
            .filter(|r| include.admits_kind(r.kind))
            .collect();
        info!(
            listed = total,
            selected = visible.len(),
            "course enumeration complete"
        );
        Ok(visible)
    }

    /// One handler's listing, retried; a `NotFound` yields an empty listing.
    async fn list_handler(&self, handler: Handler) -> Result<Vec<Resource>> {
        let api = Arc::clone(&self.api);
        let course_id = self.course.course_id.clone();
        let (result, attempts) = self
            .with_retry(move || {
                let api = Arc::clone(&api);
                let course_id = course_id.clone();
                async move { handler.list(api.as_ref(), &course_id).await }
            })
            .await;

        match result {
            Ok(resources) => {
                debug!(handler = handler.name(), count = resources.len(), attempts, "listed");
                Ok(resources)
            }
            Err(PipelineError::NotFound(reason)) => {
                warn!(handler = handler.name(), %reason, "listing unavailable, skipping");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch one resource's payload, retrying transient failures.
    ///
    /// Returns the final outcome and the number of attempts made.
    #[instrument(skip_all, fields(resource_id = %resource.id))]
    pub async fn fetch_with_retry(&self, resource: &Resource) -> (Result<RawPayload>, u32) {
        let api = Arc::clone(&self.api);
        let resource = resource.clone();
        self.with_retry(move || {
            let api = Arc::clone(&api);
            let resource = resource.clone();
            async move {
                Handler::for_kind(resource.kind)
                    .fetch(api.as_ref(), &resource)
                    .await
            }
        })
        .await
    }

    /// Run `action` under the policy: rate-limit pause and timeout per
    /// attempt, backoff between retryable failures.
    async fn with_retry<T, F, Fut>(&self, mut action: F) -> (Result<T>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = Arc::new(AtomicU32::new(0));
        // Extra wait requested by the server's last Retry-After, in millis.
        let server_wait = Arc::new(AtomicU64::new(0));
        let policy = self.policy.clone();

        let result = RetryIf::start(
            policy.strategy(),
            || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                let wait = Duration::from_millis(server_wait.swap(0, Ordering::SeqCst))
                    .min(policy.max_backoff);
                let rate_limit = policy.rate_limit;
                let timeout = policy.unit_timeout;
                let server_wait = Arc::clone(&server_wait);
                let fut = action();
                async move {
                    let pause = wait + rate_limit;
                    if !pause.is_zero() {
                        tokio::time::sleep(pause).await;
                    }
                    let outcome = match tokio::time::timeout(timeout, fut).await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(PipelineError::Fetch(format!(
                            "attempt {attempt} timed out after {}s",
                            timeout.as_secs()
                        ))),
                    };
                    if let Err(PipelineError::RateLimited {
                        retry_after: Some(after),
                    }) = &outcome
                    {
                        let millis = u64::try_from(after.as_millis()).unwrap_or(u64::MAX);
                        server_wait.store(millis, Ordering::SeqCst);
                    }
                    if let Err(e) = &outcome {
                        debug!(attempt, error = %e, "attempt failed");
                    }
                    outcome
                }
            },
            |e: &PipelineError| e.is_retryable(),
        )
        .await;

        (result, attempts.load(Ordering::SeqCst))
    }
}

/// Insert `resource` or fold it into an earlier entry with the same id.
///
/// The later record carries the richer kind-specific title and locator; the
/// earlier one keeps its position and parent. Either source hiding the
/// resource hides it.
fn merge(
    resources: &mut Vec<Resource>,
    index: &mut HashMap<String, usize>,
    resource: Resource,
    allow_new: bool,
) {
    match index.get(resource.id.as_str()) {
        Some(&at) => {
            let existing = &resources[at];
            let hidden = existing.visibility == Visibility::InstructorOnly
                || resource.visibility == Visibility::InstructorOnly;
            let parent_id = existing.parent_id.clone().or(resource.parent_id.clone());
            resources[at] = Resource {
                parent_id,
                visibility: if hidden {
                    Visibility::InstructorOnly
                } else {
                    Visibility::StudentVisible
                },
                ..resource
            };
        }
        None if allow_new => {
            index.insert(resource.id.as_str().to_string(), resources.len());
            resources.push(resource);
        }
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Download;
    use async_trait::async_trait;
    use serde_json::{Value, json};

    /// In-memory course: collections and objects keyed by API path.
    struct FakeCourse {
        collections: HashMap<String, Vec<Value>>,
        objects: HashMap<String, Value>,
    }

    #[async_trait]
    impl SourceApi for FakeCourse {
        async fn get_collection(&self, path: &str) -> Result<Vec<Value>> {
            let key = path.split('?').next().unwrap_or(path);
            self.collections
                .get(key)
                .cloned()
                .ok_or_else(|| PipelineError::NotFound(path.to_string()))
        }

        async fn get_object(&self, path: &str) -> Result<Value> {
            let key = path.split('?').next().unwrap_or(path);
            self.objects
                .get(key)
                .cloned()
                .ok_or_else(|| PipelineError::NotFound(path.to_string()))
        }

        async fn download(&self, url: &str) -> Result<Download> {
            Err(PipelineError::NotFound(url.to_string()))
        }
    }

    fn fake_course() -> FakeCourse {
        let mut collections = HashMap::new();
        collections.insert(
            "courses/7/modules".to_string(),
            vec![
                json!({"id": 1, "name": "Week 1", "published": true}),
                json!({"id": 2, "name": "Drafts", "published": false}),
            ],
        );
        collections.insert(
            "courses/7/modules/1/items".to_string(),
            vec![
                json!({"id": 10, "type": "Page", "title": "Welcome", "page_url": "welcome"}),
                json!({"id": 11, "type": "SubHeader", "title": "Readings"}),
                json!({"id": 12, "type": "Assignment", "title": "HW1", "content_id": 300}),
            ],
        );
        collections.insert(
            "courses/7/modules/2/items".to_string(),
            vec![json!({"id": 20, "type": "Page", "title": "Answer key", "page_url": "key"})],
        );
        collections.insert(
            "courses/7/pages".to_string(),
            vec![
                json!({"url": "welcome", "title": "Welcome!", "published": true}),
                json!({"url": "key", "title": "Answer key", "published": true}),
                json!({"url": "loose", "title": "Loose page", "published": true}),
                json!({"url": "secret", "title": "Secret", "published": false}),
            ],
        );
        collections.insert(
            "courses/7/assignments".to_string(),
            vec![
                json!({"id": 300, "name": "Homework 1", "published": true}),
                json!({"id": 301, "name": "New quiz", "published": true, "quiz_lti": true}),
            ],
        );
        FakeCourse {
            collections,
            objects: HashMap::new(),
        }
    }

    fn crawler(api: impl SourceApi + 'static) -> Crawler {
        let course = CourseRef::parse("https://canvas.example.edu/courses/7").unwrap();
        let policy = FetchPolicy {
            retry_budget: 0,
            backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            unit_timeout: Duration::from_secs(5),
            rate_limit: Duration::ZERO,
        };
        Crawler::new(Arc::new(api), course, policy)
    }

    #[tokio::test]
    async fn listing_returns_only_student_visible_resources_in_module_order() {
        let resources = crawler(fake_course())
            .list_resources(&IncludeFilter::All)
            .await
            .unwrap();

        let ids: Vec<&str> = resources.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["module-1", "page-welcome", "assignment-300", "page-loose"]
        );
        assert!(
            resources
                .iter()
                .all(|r| r.visibility == Visibility::StudentVisible)
        );

        let welcome = &resources[1];
        assert_eq!(welcome.title, "Welcome!");
        assert_eq!(welcome.parent_id.as_ref().map(|p| p.as_str()), Some("module-1"));
    }

    #[tokio::test]
    async fn kind_filter_keeps_structure_order() {
        let include: IncludeFilter = "pages".parse().unwrap();
        let resources = crawler(fake_course()).list_resources(&include).await.unwrap();
        let ids: Vec<&str> = resources.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["page-welcome", "page-loose"]);
    }

    #[tokio::test]
    async fn module_filter_selects_one_subtree() {
        let include = IncludeFilter::Module("1".into());
        let resources = crawler(fake_course()).list_resources(&include).await.unwrap();
        let ids: Vec<&str> = resources.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["module-1", "page-welcome", "assignment-300"]);

        let missing = crawler(fake_course())
            .list_resources(&IncludeFilter::Module("99".into()))
            .await;
        assert!(matches!(missing, Err(PipelineError::NotFound(_))));
    }

    mod http {
        use super::super::*;
        use crate::client::CanvasClient;
        use coursepipe_shared::{ResourceKind, Visibility};
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        fn page() -> Resource {
            Resource {
                id: coursepipe_shared::ResourceId::new(ResourceKind::Page, "intro"),
                kind: ResourceKind::Page,
                title: "Intro".into(),
                parent_id: None,
                visibility: Visibility::StudentVisible,
                source_ref: "courses/7/pages/intro".into(),
                content_hash: None,
            }
        }

        fn crawler_for(server: &MockServer, retry_budget: usize) -> Crawler {
            let course =
                CourseRef::parse(&format!("{}/courses/7", server.uri())).unwrap();
            let client = CanvasClient::new(&course.base, "token", Duration::from_secs(5))
                .unwrap()
                .allow_localhost();
            let policy = FetchPolicy {
                retry_budget,
                backoff: Duration::from_millis(2),
                max_backoff: Duration::from_millis(10),
                unit_timeout: Duration::from_secs(5),
                rate_limit: Duration::ZERO,
            };
            Crawler::new(Arc::new(client), course, policy)
        }

        #[tokio::test]
        async fn throttled_fetch_succeeds_after_retries() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/api/v1/courses/7/pages/intro"))
                .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
                .up_to_n_times(2)
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path("/api/v1/courses/7/pages/intro"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "title": "Intro",
                    "body": "<p>Hello</p>",
                    "published": true
                })))
                .mount(&server)
                .await;

            let (result, attempts) = crawler_for(&server, 3).fetch_with_retry(&page()).await;
            let payload = result.unwrap();
            assert_eq!(attempts, 3);
            assert_eq!(payload.mime_type, "text/html");
            assert!(String::from_utf8_lossy(&payload.bytes).contains("<p>Hello</p>"));
        }

        #[tokio::test]
        async fn persistent_throttling_exhausts_the_budget() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/api/v1/courses/7/pages/intro"))
                .respond_with(ResponseTemplate::new(429))
                .expect(4)
                .mount(&server)
                .await;

            let (result, attempts) = crawler_for(&server, 3).fetch_with_retry(&page()).await;
            assert!(matches!(result, Err(PipelineError::RateLimited { .. })));
            assert_eq!(attempts, 4);
        }

        #[tokio::test]
        async fn missing_resource_is_not_retried() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/api/v1/courses/7/pages/intro"))
                .respond_with(ResponseTemplate::new(404))
                .expect(1)
                .mount(&server)
                .await;

            let (result, attempts) = crawler_for(&server, 3).fetch_with_retry(&page()).await;
            assert!(matches!(result, Err(PipelineError::NotFound(_))));
            assert_eq!(attempts, 1);
        }
    }

    #[test]
    fn backoff_doubles_and_respects_budget() {
        let policy = FetchPolicy {
            retry_budget: 3,
            backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(250),
            unit_timeout: Duration::from_secs(1),
            rate_limit: Duration::ZERO,
        };
        let delays: Vec<Duration> = policy.strategy().collect();
        assert_eq!(delays.len(), 3);
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(250)));
    }
}
