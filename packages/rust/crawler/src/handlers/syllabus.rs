//! The course syllabus, stored on the course object itself.

use coursepipe_shared::{PipelineError, RawPayload, Resource, ResourceKind, Result, Visibility};

use super::{HTML_MIME, html_document, listed, str_of};
use crate::source::SourceApi;

fn source_ref(course_id: &str) -> String {
    format!("courses/{course_id}?include[]=syllabus_body")
}

pub(super) async fn list(api: &dyn SourceApi, course_id: &str) -> Result<Vec<Resource>> {
    let course = api.get_object(&source_ref(course_id)).await?;
    let body = str_of(&course, "syllabus_body").unwrap_or_default();
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }

    let name = str_of(&course, "name").unwrap_or("Course");
    Ok(vec![listed(
        ResourceKind::Syllabus,
        course_id,
        &format!("{name} Syllabus"),
        Visibility::StudentVisible,
        source_ref(course_id),
    )])
}

pub(super) async fn fetch(api: &dyn SourceApi, resource: &Resource) -> Result<RawPayload> {
    let course = api.get_object(&resource.source_ref).await?;
    let body = str_of(&course, "syllabus_body")
        .filter(|b| !b.trim().is_empty())
        .ok_or_else(|| PipelineError::NotFound(format!("{}: syllabus is empty", resource.id)))?;

    let bytes = html_document(&resource.title, &[], body);
    Ok(RawPayload::new(resource.id.clone(), HTML_MIME, bytes))
}
