//! Classic quizzes: the description and settings, never the questions.

use serde_json::Value;

use coursepipe_shared::{RawPayload, Resource, ResourceKind, Result, Visibility};

use super::{HTML_MIME, get_checked, html_document, id_of, listed, published, scalar, str_of, visibility_if};
use crate::source::SourceApi;

pub(super) fn source_ref(course_id: &str, id: &str) -> String {
    format!("courses/{course_id}/quizzes/{id}")
}

pub(super) fn visibility(v: &Value) -> Visibility {
    visibility_if(published(v))
}

pub(super) async fn list(api: &dyn SourceApi, course_id: &str) -> Result<Vec<Resource>> {
    let rows = api
        .get_collection(&format!("courses/{course_id}/quizzes"))
        .await?;

    Ok(rows
        .iter()
        .filter_map(|row| {
            let id = id_of(row, "id")?;
            Some(listed(
                ResourceKind::Quiz,
                &id,
                str_of(row, "title").unwrap_or("Untitled quiz"),
                visibility(row),
                source_ref(course_id, &id),
            ))
        })
        .collect())
}

pub(super) async fn fetch(api: &dyn SourceApi, resource: &Resource) -> Result<RawPayload> {
    let data = get_checked(api, resource).await?;
    let bytes = html_document(
        str_of(&data, "title").unwrap_or(resource.title.as_str()),
        &[
            ("Quiz type", scalar(&data, "quiz_type")),
            ("Due", scalar(&data, "due_at")),
            ("Points possible", scalar(&data, "points_possible")),
            ("Questions", scalar(&data, "question_count")),
            ("Allowed attempts", scalar(&data, "allowed_attempts")),
            ("Time limit (minutes)", scalar(&data, "time_limit")),
            ("Scoring policy", scalar(&data, "scoring_policy")),
        ],
        str_of(&data, "description").unwrap_or_default(),
    );
    Ok(RawPayload::new(resource.id.clone(), HTML_MIME, bytes))
}
