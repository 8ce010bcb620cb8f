//! Discussion topics and announcements. Both live under
//! `discussion_topics`; announcements are selected with `only_announcements`.

use serde_json::Value;
use tracing::debug;

use coursepipe_shared::{PipelineError, RawPayload, Resource, ResourceKind, Result, Visibility};

use super::{
    HTML_MIME, escape_html, get_checked, html_document, id_of, listed, published, scalar, str_of,
    visibility_if,
};
use crate::source::SourceApi;

pub(super) fn source_ref(course_id: &str, id: &str) -> String {
    format!("courses/{course_id}/discussion_topics/{id}")
}

pub(super) fn visibility(v: &Value) -> Visibility {
    visibility_if(published(v))
}

pub(super) async fn list(
    api: &dyn SourceApi,
    course_id: &str,
    announcements: bool,
) -> Result<Vec<Resource>> {
    let (path, kind) = if announcements {
        (
            format!("courses/{course_id}/discussion_topics?only_announcements=true"),
            ResourceKind::Announcement,
        )
    } else {
        (
            format!("courses/{course_id}/discussion_topics"),
            ResourceKind::Discussion,
        )
    };
    let rows = api.get_collection(&path).await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        let Some(id) = id_of(row, "id") else {
            continue;
        };
        // The plain listing also returns announcements on some instances.
        if !announcements && super::flag(row, "is_announcement") {
            continue;
        }
        out.push(listed(
            kind,
            &id,
            str_of(row, "title").unwrap_or("Untitled discussion"),
            visibility(row),
            source_ref(course_id, &id),
        ));
    }
    Ok(out)
}

pub(super) async fn fetch(api: &dyn SourceApi, resource: &Resource) -> Result<RawPayload> {
    let data = get_checked(api, resource).await?;

    let mut body = str_of(&data, "message").unwrap_or_default().to_string();
    match api
        .get_collection(&format!("{}/entries", resource.source_ref))
        .await
    {
        Ok(entries) => append_entries(&mut body, &entries),
        Err(PipelineError::NotFound(reason)) => {
            debug!(resource_id = %resource.id, %reason, "discussion entries unavailable");
        }
        Err(e) => return Err(e),
    }

    let bytes = html_document(
        str_of(&data, "title").unwrap_or(resource.title.as_str()),
        &[
            ("Posted", scalar(&data, "posted_at")),
            ("Author", author_name(&data)),
        ],
        &body,
    );
    Ok(RawPayload::new(resource.id.clone(), HTML_MIME, bytes))
}

fn author_name(v: &Value) -> String {
    v.get("author")
        .and_then(|a| str_of(a, "display_name"))
        .or_else(|| str_of(v, "user_name"))
        .unwrap_or_default()
        .to_string()
}

fn append_entries(body: &mut String, entries: &[Value]) {
    let entries: Vec<&Value> = entries
        .iter()
        .filter(|e| !super::flag(e, "deleted"))
        .filter(|e| str_of(e, "message").is_some_and(|m| !m.trim().is_empty()))
        .collect();
    if entries.is_empty() {
        return;
    }
    body.push_str("\n<h2>Replies</h2>\n");
    for entry in entries {
        let author = author_name(entry);
        if !author.is_empty() {
            body.push_str(&format!("<h3>{}</h3>\n", escape_html(&author)));
        }
        body.push_str(str_of(entry, "message").unwrap_or_default());
        body.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn replies_skip_deleted_and_empty_entries() {
        let mut body = "<p>Topic</p>".to_string();
        append_entries(
            &mut body,
            &[
                json!({"user_name": "Ana", "message": "<p>First</p>"}),
                json!({"user_name": "Bo", "message": "", "deleted": true}),
                json!({"user_name": "Cy", "message": "   "}),
            ],
        );
        assert!(body.contains("<h2>Replies</h2>"));
        assert!(body.contains("<h3>Ana</h3>"));
        assert!(!body.contains("Bo"));
        assert!(!body.contains("Cy"));
    }

    #[test]
    fn no_replies_leaves_body_untouched() {
        let mut body = "<p>Topic</p>".to_string();
        append_entries(&mut body, &[]);
        assert_eq!(body, "<p>Topic</p>");
    }
}
