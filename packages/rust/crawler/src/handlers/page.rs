//! Wiki pages. Identified by their URL slug, which module items also use.

use serde_json::Value;
use tracing::debug;

use coursepipe_shared::{PipelineError, RawPayload, Resource, ResourceKind, Result, Visibility};

use super::{HTML_MIME, get_checked, html_document, listed, published, str_of, visibility_if};
use crate::source::SourceApi;

pub(super) fn source_ref(course_id: &str, slug: &str) -> String {
    format!("courses/{course_id}/pages/{slug}")
}

pub(super) fn visibility(v: &Value) -> Visibility {
    visibility_if(published(v) && !super::flag(v, "hide_from_students"))
}

pub(super) async fn list(api: &dyn SourceApi, course_id: &str) -> Result<Vec<Resource>> {
    let rows = api
        .get_collection(&format!("courses/{course_id}/pages?sort=created_at"))
        .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        let Some(slug) = str_of(row, "url") else {
            debug!("page row without url slug, skipping");
            continue;
        };
        out.push(listed(
            ResourceKind::Page,
            slug,
            str_of(row, "title").unwrap_or(slug),
            visibility(row),
            source_ref(course_id, slug),
        ));
    }
    Ok(out)
}

pub(super) async fn fetch(api: &dyn SourceApi, resource: &Resource) -> Result<RawPayload> {
    let data = get_checked(api, resource).await?;
    if visibility(&data) == Visibility::InstructorOnly {
        return Err(PipelineError::NotFound(format!(
            "{} is no longer visible to students",
            resource.id
        )));
    }

    let title = str_of(&data, "title").unwrap_or(resource.title.as_str());
    let body = str_of(&data, "body").unwrap_or_default();
    let bytes = html_document(
        title,
        &[("Updated", super::scalar(&data, "updated_at"))],
        body,
    );
    Ok(RawPayload::new(resource.id.clone(), HTML_MIME, bytes))
}
