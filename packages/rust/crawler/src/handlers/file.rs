//! Course files. The listing row carries a signed download URL; the bytes are
//! fetched as-is and converted downstream by MIME type.

use serde_json::Value;

use coursepipe_shared::{PipelineError, RawPayload, Resource, ResourceKind, Result, Visibility};

use super::{flag, get_checked, id_of, listed, str_of, visibility_if};
use crate::source::SourceApi;

pub(super) fn source_ref(course_id: &str, id: &str) -> String {
    format!("courses/{course_id}/files/{id}")
}

pub(super) fn visibility(v: &Value) -> Visibility {
    visibility_if(!(flag(v, "hidden") || flag(v, "locked") || flag(v, "hidden_for_user")))
}

pub(super) async fn list(api: &dyn SourceApi, course_id: &str) -> Result<Vec<Resource>> {
    let rows = api
        .get_collection(&format!("courses/{course_id}/files"))
        .await?;

    Ok(rows
        .iter()
        .filter_map(|row| {
            let id = id_of(row, "id")?;
            let title = str_of(row, "display_name")
                .or_else(|| str_of(row, "filename"))
                .unwrap_or("Untitled file");
            Some(listed(
                ResourceKind::File,
                &id,
                title,
                visibility(row),
                source_ref(course_id, &id),
            ))
        })
        .collect())
}

pub(super) async fn fetch(api: &dyn SourceApi, resource: &Resource) -> Result<RawPayload> {
    let data = get_checked(api, resource).await?;
    if visibility(&data) == Visibility::InstructorOnly {
        return Err(PipelineError::NotFound(format!(
            "{} is hidden from students",
            resource.id
        )));
    }
    let url = str_of(&data, "url")
        .filter(|u| !u.is_empty())
        .ok_or_else(|| PipelineError::NotFound(format!("{} has no download url", resource.id)))?;

    let download = api.download(url).await?;
    let mime_type = str_of(&data, "content-type")
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .unwrap_or(download.mime_type);
    Ok(RawPayload::new(resource.id.clone(), mime_type, download.bytes))
}
