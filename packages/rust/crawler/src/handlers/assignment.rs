//! Assignments. New-Quiz assignments (`quiz_lti`) and assignments that only
//! wrap a classic quiz are skipped here; the quiz handler owns the latter.

use serde_json::Value;
use tracing::{debug, info};

use coursepipe_shared::{PipelineError, RawPayload, Resource, ResourceKind, Result, Visibility};

use super::{
    HTML_MIME, flag, get_checked, html_document, id_of, listed, published, scalar, str_of,
    visibility_if,
};
use crate::source::SourceApi;

pub(super) fn source_ref(course_id: &str, id: &str) -> String {
    format!("courses/{course_id}/assignments/{id}")
}

pub(super) fn visibility(v: &Value) -> Visibility {
    visibility_if(published(v))
}

pub(super) async fn list(api: &dyn SourceApi, course_id: &str) -> Result<Vec<Resource>> {
    let rows = api
        .get_collection(&format!("courses/{course_id}/assignments?order_by=position"))
        .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        let Some(id) = id_of(row, "id") else {
            continue;
        };
        if flag(row, "quiz_lti") {
            info!(assignment_id = %id, "skipping New Quiz assignment");
            continue;
        }
        if row.get("quiz_id").is_some_and(|q| !q.is_null()) {
            debug!(assignment_id = %id, "assignment wraps a classic quiz, skipping");
            continue;
        }
        out.push(listed(
            ResourceKind::Assignment,
            &id,
            str_of(row, "name").unwrap_or("Untitled assignment"),
            visibility(row),
            source_ref(course_id, &id),
        ));
    }
    Ok(out)
}

pub(super) async fn fetch(api: &dyn SourceApi, resource: &Resource) -> Result<RawPayload> {
    let data = get_checked(api, resource).await?;
    if flag(&data, "quiz_lti") {
        return Err(PipelineError::NotFound(format!(
            "{} is a New Quiz and has no readable body",
            resource.id
        )));
    }

    let bytes = html_document(
        str_of(&data, "name").unwrap_or(resource.title.as_str()),
        &[
            ("Due", scalar(&data, "due_at")),
            ("Points possible", scalar(&data, "points_possible")),
        ],
        str_of(&data, "description").unwrap_or_default(),
    );
    Ok(RawPayload::new(resource.id.clone(), HTML_MIME, bytes))
}
