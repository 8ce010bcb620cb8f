//! One handler per Canvas resource kind, selected by [`Handler::for_kind`].
//!
//! Each handler knows its kind's endpoints, pagination, field names, and
//! visibility rules. Adding a kind means adding a variant here and a module
//! next to this file.

mod assignment;
mod discussion;
mod file;
pub(crate) mod module;
mod page;
mod quiz;
mod syllabus;

use serde_json::Value;

use coursepipe_shared::{PipelineError, RawPayload, Resource, ResourceKind, Result, Visibility};

use crate::source::SourceApi;

/// MIME type of the HTML documents handlers synthesize from API fields.
pub(crate) const HTML_MIME: &str = "text/html";

/// Crawler variant for one listing endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Handler {
    Syllabus,
    Modules,
    Pages,
    Assignments,
    Quizzes,
    Discussions,
    Announcements,
    Files,
}

impl Handler {
    /// Listing order. Modules come first so course structure fixes crawl order.
    pub const LISTING_ORDER: [Handler; 8] = [
        Handler::Syllabus,
        Handler::Modules,
        Handler::Pages,
        Handler::Assignments,
        Handler::Quizzes,
        Handler::Discussions,
        Handler::Announcements,
        Handler::Files,
    ];

    /// The handler responsible for fetching resources of `kind`.
    pub fn for_kind(kind: ResourceKind) -> Self {
        match kind {
            ResourceKind::Syllabus => Self::Syllabus,
            ResourceKind::Module | ResourceKind::ModuleItem => Self::Modules,
            ResourceKind::Page => Self::Pages,
            ResourceKind::Assignment => Self::Assignments,
            ResourceKind::Quiz => Self::Quizzes,
            ResourceKind::Discussion => Self::Discussions,
            ResourceKind::Announcement => Self::Announcements,
            ResourceKind::File => Self::Files,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Syllabus => "syllabus",
            Self::Modules => "modules",
            Self::Pages => "pages",
            Self::Assignments => "assignments",
            Self::Quizzes => "quizzes",
            Self::Discussions => "discussions",
            Self::Announcements => "announcements",
            Self::Files => "files",
        }
    }

    /// Enumerate this handler's resources, instructor-only ones included and
    /// marked through [`Resource::visibility`].
    pub async fn list(&self, api: &dyn SourceApi, course_id: &str) -> Result<Vec<Resource>> {
        match self {
            Self::Syllabus => syllabus::list(api, course_id).await,
            Self::Modules => module::list(api, course_id).await,
            Self::Pages => page::list(api, course_id).await,
            Self::Assignments => assignment::list(api, course_id).await,
            Self::Quizzes => quiz::list(api, course_id).await,
            Self::Discussions => discussion::list(api, course_id, false).await,
            Self::Announcements => discussion::list(api, course_id, true).await,
            Self::Files => file::list(api, course_id).await,
        }
    }

    /// Fetch the raw payload of one listed resource.
    pub async fn fetch(&self, api: &dyn SourceApi, resource: &Resource) -> Result<RawPayload> {
        match self {
            Self::Syllabus => syllabus::fetch(api, resource).await,
            Self::Modules => module::fetch(api, resource).await,
            Self::Pages => page::fetch(api, resource).await,
            Self::Assignments => assignment::fetch(api, resource).await,
            Self::Quizzes => quiz::fetch(api, resource).await,
            Self::Discussions | Self::Announcements => discussion::fetch(api, resource).await,
            Self::Files => file::fetch(api, resource).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

/// An id field that Canvas may encode as a number or a string.
pub(crate) fn id_of(v: &Value, key: &str) -> Option<String> {
    match v.get(key)? {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

pub(crate) fn str_of<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str)
}

/// `true` only when the field is present and literally `true`.
pub(crate) fn flag(v: &Value, key: &str) -> bool {
    v.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// `published: false` hides an item from students; a missing field does not.
pub(crate) fn published(v: &Value) -> bool {
    v.get("published").and_then(Value::as_bool).unwrap_or(true)
}

pub(crate) fn visibility_if(student_visible: bool) -> Visibility {
    if student_visible {
        Visibility::StudentVisible
    } else {
        Visibility::InstructorOnly
    }
}

/// Reject content the current user cannot open.
pub(crate) fn ensure_unlocked(resource: &Resource, data: &Value) -> Result<()> {
    if flag(data, "locked_for_user") {
        let reason = str_of(data, "lock_explanation").unwrap_or("locked for this user");
        return Err(PipelineError::NotFound(format!("{}: {reason}", resource.id)));
    }
    Ok(())
}

/// Render an API object as a small HTML document: title, a definition list
/// of metadata, then the body HTML.
pub(crate) fn html_document(title: &str, meta: &[(&str, String)], body: &str) -> Vec<u8> {
    let title = escape_html(title);
    let mut html = format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{title}</title></head>\n<body>\n<h1>{title}</h1>\n"
    );
    let meta: Vec<&(&str, String)> = meta.iter().filter(|(_, v)| !v.is_empty()).collect();
    if !meta.is_empty() {
        html.push_str("<ul>\n");
        for (label, value) in meta {
            html.push_str(&format!(
                "<li><strong>{}:</strong> {}</li>\n",
                escape_html(label),
                escape_html(value)
            ));
        }
        html.push_str("</ul>\n");
    }
    html.push_str(body);
    html.push_str("\n</body></html>\n");
    html.into_bytes()
}

/// A scalar field rendered for [`html_document`] metadata, empty when absent.
pub(crate) fn scalar(v: &Value, key: &str) -> String {
    match v.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

pub(crate) fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Build a resource from a listing row.
pub(crate) fn listed(
    kind: ResourceKind,
    native_id: &str,
    title: &str,
    visibility: Visibility,
    source_ref: String,
) -> Resource {
    Resource {
        id: coursepipe_shared::ResourceId::new(kind, native_id),
        kind,
        title: title.trim().to_string(),
        parent_id: None,
        visibility,
        source_ref,
        content_hash: None,
    }
}

/// Fetch a resource's object, rejecting it when locked for the user.
pub(crate) async fn get_checked(
    api: &dyn SourceApi,
    resource: &Resource,
) -> Result<Value> {
    let data = api.get_object(&resource.source_ref).await?;
    ensure_unlocked(resource, &data)?;
    Ok(data)
}
