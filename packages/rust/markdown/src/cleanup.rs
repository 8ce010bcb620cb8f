//! Post-conversion cleanup passes for Markdown produced from LMS HTML.
//!
//! Each pass is `&str -> String` and runs in the order listed in
//! [`run_pipeline`]. Fenced code blocks are left untouched by the passes that
//! rewrite line content.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

/// Run every cleanup pass over raw converter output.
pub(crate) fn run_pipeline(md: &str, base_url: Option<&Url>) -> String {
    let md = strip_lms_chrome(md);
    let md = demote_extra_h1(&md);
    let md = fix_code_fence_languages(&md);
    let md = strip_leftover_html(&md);
    let md = resolve_links(&md, base_url);
    let md = normalize_whitespace(&md);
    let md = collapse_blank_lines(&md);
    ensure_trailing_newline(&md)
}

// ---------------------------------------------------------------------------
// LMS chrome
// ---------------------------------------------------------------------------

/// Remove the screen-reader hints the rich content editor injects after
/// every external link.
fn strip_lms_chrome(md: &str) -> String {
    static HINT_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\s*(?:Links to an external site\.|\(opens in a new window\))")
            .expect("valid regex")
    });
    HINT_RE.replace_all(md, "").into_owned()
}

// ---------------------------------------------------------------------------
// Headings
// ---------------------------------------------------------------------------

/// Keep the first H1 (the document title) and demote any later H1 to H2.
fn demote_extra_h1(md: &str) -> String {
    let mut seen_h1 = false;
    let mut in_fence = false;
    md.lines()
        .map(|line| {
            if line.trim_start().starts_with("```") {
                in_fence = !in_fence;
            }
            if in_fence {
                return line.to_string();
            }
            match line.strip_prefix("# ") {
                Some(text) if seen_h1 => format!("## {text}"),
                Some(_) => {
                    seen_h1 = true;
                    line.to_string()
                }
                None => line.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Code fences
// ---------------------------------------------------------------------------

/// `language-python` style class names leak into fence info strings.
fn fix_code_fence_languages(md: &str) -> String {
    static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?m)^```(?:language-|lang-|brush:\s*)(\w+)").expect("valid regex")
    });
    FENCE_RE.replace_all(md, "```$1").into_owned()
}

// ---------------------------------------------------------------------------
// Leftover HTML
// ---------------------------------------------------------------------------

/// Drop layout tags htmd passes through, keeping their text.
fn strip_leftover_html(md: &str) -> String {
    static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"</?(?:div|span|section|article|aside|header|footer|figure|figcaption|details|summary|font|center|u|colgroup|col|tbody|thead|tfoot)(?:\s[^>]*)?/?>",
        )
        .expect("valid regex")
    });

    let mut in_fence = false;
    md.lines()
        .map(|line| {
            if line.trim_start().starts_with("```") {
                in_fence = !in_fence;
                return line.to_string();
            }
            if in_fence {
                line.to_string()
            } else {
                TAG_RE.replace_all(line, "").into_owned()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

/// Make course-relative links (`/courses/1/pages/x`) absolute.
fn resolve_links(md: &str, base_url: Option<&Url>) -> String {
    static LINK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(!?)\[([^\]]*)\]\(([^)\s]+)\)").expect("valid regex"));

    let Some(base) = base_url else {
        return md.to_string();
    };

    LINK_RE
        .replace_all(md, |caps: &regex::Captures| {
            let bang = &caps[1];
            let text = &caps[2];
            let href = &caps[3];
            let is_relative = !(href.contains("://")
                || href.starts_with('#')
                || href.starts_with("mailto:")
                || href.starts_with("data:"));
            match base.join(href) {
                Ok(resolved) if is_relative => format!("{bang}[{text}]({resolved})"),
                _ => caps[0].to_string(),
            }
        })
        .into_owned()
}

// ---------------------------------------------------------------------------
// Whitespace
// ---------------------------------------------------------------------------

/// Non-breaking spaces become spaces; trailing whitespace goes.
fn normalize_whitespace(md: &str) -> String {
    md.replace(['\u{a0}', '\u{202f}'], " ")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

/// At most one blank line between blocks.
fn collapse_blank_lines(md: &str) -> String {
    static BLANKS_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));
    BLANKS_RE.replace_all(md.trim_start_matches('\n'), "\n\n").into_owned()
}

fn ensure_trailing_newline(md: &str) -> String {
    format!("{}\n", md.trim_end_matches('\n'))
}
