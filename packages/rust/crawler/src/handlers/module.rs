//! Course modules and their items.
//!
//! Listing walks every module in position order and emits the module followed
//! by the resources its items point at, each parented to the module. Items
//! that reference a page, file, assignment, quiz, or discussion are emitted as
//! that kind so a later kind listing merges into the same id. External links
//! become `module-item` resources of their own.

use serde_json::Value;
use tracing::{debug, warn};

use coursepipe_shared::{
    PipelineError, RawPayload, Resource, ResourceId, ResourceKind, Result, Visibility,
};

use super::{
    HTML_MIME, escape_html, get_checked, html_document, id_of, listed, published, str_of,
    visibility_if,
};
use crate::source::SourceApi;

fn source_ref(course_id: &str, id: &str) -> String {
    format!("courses/{course_id}/modules/{id}")
}

fn items_path(module_ref: &str) -> String {
    format!("{module_ref}/items")
}

pub(super) async fn list(api: &dyn SourceApi, course_id: &str) -> Result<Vec<Resource>> {
    let modules = api
        .get_collection(&format!("courses/{course_id}/modules"))
        .await?;

    let mut out = Vec::new();
    for module in &modules {
        let Some(module_id) = id_of(module, "id") else {
            continue;
        };
        let module_visibility = visibility_if(published(module));
        let module_resource = listed(
            ResourceKind::Module,
            &module_id,
            str_of(module, "name").unwrap_or("Untitled module"),
            module_visibility,
            source_ref(course_id, &module_id),
        );

        // One unreadable module must not hide the rest of the structure.
        let items = match api
            .get_collection(&items_path(&module_resource.source_ref))
            .await
        {
            Ok(items) => items,
            Err(PipelineError::NotFound(reason)) => {
                warn!(module_id = %module_id, %reason, "module items unavailable, skipping");
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        let parent = module_resource.id.clone();
        out.push(module_resource);

        for item in &items {
            let Some(mut resource) = item_resource(course_id, item) else {
                continue;
            };
            resource.parent_id = Some(parent.clone());
            // An item inside a hidden module is hidden too.
            if module_visibility == Visibility::InstructorOnly {
                resource.visibility = Visibility::InstructorOnly;
            }
            out.push(resource);
        }
    }
    Ok(out)
}

/// Map one module item to the resource it references.
fn item_resource(course_id: &str, item: &Value) -> Option<Resource> {
    let item_type = str_of(item, "type").unwrap_or_default();
    let title = str_of(item, "title").unwrap_or("Untitled item");
    let visibility = visibility_if(published(item));

    let (kind, native_id, source) = match item_type {
        "Page" => {
            let slug = str_of(item, "page_url")?.to_string();
            let source = super::page::source_ref(course_id, &slug);
            (ResourceKind::Page, slug, source)
        }
        "File" => {
            let id = id_of(item, "content_id")?;
            let source = super::file::source_ref(course_id, &id);
            (ResourceKind::File, id, source)
        }
        "Assignment" => {
            let id = id_of(item, "content_id")?;
            let source = super::assignment::source_ref(course_id, &id);
            (ResourceKind::Assignment, id, source)
        }
        "Quiz" => {
            let id = id_of(item, "content_id")?;
            let source = super::quiz::source_ref(course_id, &id);
            (ResourceKind::Quiz, id, source)
        }
        "Discussion" => {
            let id = id_of(item, "content_id")?;
            let source = super::discussion::source_ref(course_id, &id);
            (ResourceKind::Discussion, id, source)
        }
        "ExternalUrl" => {
            let id = id_of(item, "id")?;
            let url = str_of(item, "external_url")?.to_string();
            (ResourceKind::ModuleItem, id, url)
        }
        other => {
            debug!(item_type = other, title, "module item has no crawlable content");
            return None;
        }
    };

    Some(listed(kind, &native_id, title, visibility, source))
}

pub(super) async fn fetch(api: &dyn SourceApi, resource: &Resource) -> Result<RawPayload> {
    match resource.kind {
        ResourceKind::Module => fetch_module(api, resource).await,
        ResourceKind::ModuleItem => Ok(external_link(resource)),
        other => Err(PipelineError::Source(format!(
            "module handler cannot fetch {other} resource {}",
            resource.id
        ))),
    }
}

async fn fetch_module(api: &dyn SourceApi, resource: &Resource) -> Result<RawPayload> {
    let module = get_checked(api, resource).await?;
    let items = api.get_collection(&items_path(&resource.source_ref)).await?;

    let mut body = String::new();
    let mut open_list = false;
    for item in items.iter().filter(|i| published(i)) {
        let title = escape_html(str_of(item, "title").unwrap_or("Untitled item"));
        if str_of(item, "type") == Some("SubHeader") {
            if open_list {
                body.push_str("</ul>\n");
                open_list = false;
            }
            body.push_str(&format!("<h2>{title}</h2>\n"));
            continue;
        }
        if !open_list {
            body.push_str("<ul>\n");
            open_list = true;
        }
        body.push_str(&format!("<li>{title}</li>\n"));
    }
    if open_list {
        body.push_str("</ul>\n");
    }

    let bytes = html_document(
        str_of(&module, "name").unwrap_or(resource.title.as_str()),
        &[("Unlocks", super::scalar(&module, "unlock_at"))],
        &body,
    );
    Ok(RawPayload::new(resource.id.clone(), HTML_MIME, bytes))
}

/// External links are not fetched; the payload records the link itself.
fn external_link(resource: &Resource) -> RawPayload {
    let href = escape_html(&resource.source_ref);
    let body = format!("<p><a href=\"{href}\">{href}</a></p>");
    RawPayload::new(
        resource.id.clone(),
        HTML_MIME,
        html_document(&resource.title, &[], &body),
    )
}

/// Id a module item would receive, for callers selecting one module subtree.
pub(crate) fn module_id(native_id: &str) -> ResourceId {
    ResourceId::new(ResourceKind::Module, native_id)
}
