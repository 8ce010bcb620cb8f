//! Markdown chunking with token overlap.
//!
//! Splitting is delegated to `text-splitter`'s Markdown splitter, which
//! prefers heading, paragraph, and code-fence boundaries and only falls back
//! to sentence/word splits when one structural unit exceeds the budget.
//! Tokens are whitespace-delimited words ([`count_tokens`]), the same unit the
//! filter's threshold uses.
//!
//! Chunks are slices of the source text with recorded byte offsets, so the
//! document is rebuilt exactly by [`reconstruct`].

use text_splitter::{ChunkConfig, ChunkSizer, MarkdownSplitter};
use tracing::debug;

use coursepipe_shared::{Chunk, PipelineError, Resource, ResourceId, Result, count_tokens};

/// Sizes chunks in whitespace-delimited tokens.
#[derive(Debug, Clone, Copy, Default)]
struct WordSizer;

impl ChunkSizer for WordSizer {
    fn size(&self, chunk: &str) -> usize {
        count_tokens(chunk)
    }
}

/// Split `markdown` into chunks of at most `max_tokens` tokens, with up to
/// `overlap_tokens` tokens repeated between neighbours.
pub fn split(
    resource_id: &ResourceId,
    markdown: &str,
    max_tokens: usize,
    overlap_tokens: usize,
) -> Result<Vec<Chunk>> {
    let config = ChunkConfig::new(max_tokens)
        .with_overlap(overlap_tokens)
        .map_err(|e| PipelineError::config(format!("invalid chunk overlap: {e}")))?
        .with_sizer(WordSizer)
        .with_trim(false);
    let splitter = MarkdownSplitter::new(config);

    let spans: Vec<(usize, usize)> = splitter
        .chunk_indices(markdown)
        .map(|(start, text)| (start, start + text.len()))
        .collect();
    let spans = close_gaps(spans, markdown.len());

    let mut chunks = Vec::with_capacity(spans.len());
    let mut prev_end = 0usize;
    for (index, (start, end)) in spans.into_iter().enumerate() {
        let text = &markdown[start..end];
        chunks.push(Chunk {
            resource_id: resource_id.clone(),
            chunk_index: u32::try_from(index)
                .map_err(|_| PipelineError::Conversion("too many chunks".into()))?,
            text: text.to_string(),
            token_count: count_tokens(text),
            start_offset: start,
            overlap_len: prev_end.saturating_sub(start),
        });
        prev_end = prev_end.max(end);
    }

    debug!(resource_id = %resource_id, chunks = chunks.len(), "split document");
    Ok(chunks)
}

/// Extend spans so that together they cover `0..len` with no holes.
///
/// Whitespace between structural units can fall outside every chunk; it is
/// attached to the following chunk (or the last one, at the tail).
fn close_gaps(mut spans: Vec<(usize, usize)>, len: usize) -> Vec<(usize, usize)> {
    let mut covered = 0usize;
    for span in &mut spans {
        if span.0 > covered {
            span.0 = covered;
        }
        covered = covered.max(span.1);
    }
    if let Some(last) = spans.last_mut() {
        if last.1 < len {
            last.1 = len;
        }
    }
    spans
}

/// Concatenate chunks in index order, dropping each chunk's overlap prefix.
pub fn reconstruct(chunks: &[Chunk]) -> String {
    let mut ordered: Vec<&Chunk> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.chunk_index);
    ordered
        .iter()
        .map(|c| c.text.get(c.overlap_len..).unwrap_or_default())
        .collect()
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Render one chunk as a Markdown file, optionally behind YAML frontmatter.
pub fn render_chunk_file(resource: &Resource, chunk: &Chunk, frontmatter: bool) -> String {
    if !frontmatter {
        return chunk.text.clone();
    }
    // JSON strings are valid YAML scalars and take care of quoting.
    let quote = |s: &str| serde_json::to_string(s).unwrap_or_else(|_| format!("\"{s}\""));
    let mut out = String::from("---\n");
    out.push_str(&format!("id: {}\n", quote(resource.id.as_str())));
    out.push_str(&format!("kind: {}\n", resource.kind.as_str()));
    out.push_str(&format!("title: {}\n", quote(&resource.title)));
    if let Some(parent) = &resource.parent_id {
        out.push_str(&format!("parent: {}\n", quote(parent.as_str())));
    }
    out.push_str(&format!("chunk_index: {}\n", chunk.chunk_index));
    out.push_str(&format!("token_count: {}\n", chunk.token_count));
    out.push_str("---\n\n");
    out.push_str(&chunk.text);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use coursepipe_shared::{ResourceKind, Visibility};

    fn id() -> ResourceId {
        ResourceId::from("page-week-1")
    }

    fn sample_doc() -> String {
        let mut md = String::from("# Week 1\n\n");
        for section in 1..=6 {
            md.push_str(&format!("## Section {section}\n\n"));
            for para in 0..3 {
                md.push_str(&format!(
                    "Paragraph {para} of section {section} covers the reading in some detail with several words.\n\n"
                ));
            }
        }
        md.push_str("```python\nprint('hello world')\n```\n");
        md
    }

    #[test]
    fn chunks_stay_within_budget_and_rebuild_the_document() {
        let md = sample_doc();
        let chunks = split(&id(), &md, 40, 8).unwrap();

        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index as usize, i);
            assert_eq!(chunk.resource_id, id());
            assert_eq!(chunk.token_count, count_tokens(&chunk.text));
        }
        assert_eq!(reconstruct(&chunks), md);
    }

    #[test]
    fn reconstruction_without_overlap() {
        let md = sample_doc();
        let chunks = split(&id(), &md, 30, 0).unwrap();
        assert!(chunks.iter().all(|c| c.overlap_len == 0));
        assert_eq!(reconstruct(&chunks), md);
    }

    #[test]
    fn offsets_increase_and_cover_start_to_end() {
        let md = sample_doc();
        let chunks = split(&id(), &md, 25, 5).unwrap();
        assert_eq!(chunks[0].start_offset, 0);
        for pair in chunks.windows(2) {
            assert!(pair[1].start_offset > pair[0].start_offset);
            assert!(pair[1].start_offset <= pair[0].start_offset + pair[0].text.len());
        }
        let last = chunks.last().unwrap();
        assert_eq!(last.start_offset + last.text.len(), md.len());
    }

    #[test]
    fn reconstruct_accepts_shuffled_input() {
        let md = sample_doc();
        let mut chunks = split(&id(), &md, 30, 5).unwrap();
        chunks.reverse();
        assert_eq!(reconstruct(&chunks), md);
    }

    #[test]
    fn short_document_is_one_chunk() {
        let chunks = split(&id(), "# Hi\n\nShort body.\n", 400, 50).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "# Hi\n\nShort body.\n");
        assert_eq!(chunks[0].overlap_len, 0);
    }

    #[test]
    fn empty_document_has_no_chunks() {
        assert!(split(&id(), "", 400, 50).unwrap().is_empty());
    }

    #[test]
    fn overlap_must_be_below_capacity() {
        assert!(split(&id(), "text", 10, 10).is_err());
    }

    #[test]
    fn frontmatter_quotes_titles() {
        let resource = Resource {
            id: id(),
            kind: ResourceKind::Page,
            title: "Week 1: \"Intro\"".into(),
            parent_id: Some(ResourceId::from("module-1")),
            visibility: Visibility::StudentVisible,
            source_ref: "courses/1/pages/week-1".into(),
            content_hash: None,
        };
        let chunk = split(&id(), "Body text.\n", 400, 50).unwrap().remove(0);
        let rendered = render_chunk_file(&resource, &chunk, true);
        assert!(rendered.starts_with("---\nid: \"page-week-1\"\nkind: page\n"));
        assert!(rendered.contains("title: \"Week 1: \\\"Intro\\\"\"\n"));
        assert!(rendered.contains("parent: \"module-1\"\n"));
        assert!(rendered.ends_with("---\n\nBody text.\n"));
        assert_eq!(render_chunk_file(&resource, &chunk, false), "Body text.\n");
    }
}
