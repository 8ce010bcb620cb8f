//! Payload format detection from the declared MIME type and magic bytes.

use coursepipe_shared::RawPayload;

pub const DOCX_MIME: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const PPTX_MIME: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";

/// Formats the converters know about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Html,
    PlainText,
    Markdown,
    Pdf,
    Docx,
    Pptx,
    Unknown,
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Html => "html",
            Self::PlainText => "text",
            Self::Markdown => "markdown",
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Pptx => "pptx",
            Self::Unknown => "unknown format",
        })
    }
}

/// Classify a payload. The declared type wins; generic binary types fall
/// back to sniffing the first bytes.
pub fn classify(payload: &RawPayload) -> Format {
    let mime = payload.mime_type.trim().to_ascii_lowercase();
    match mime.as_str() {
        "text/html" | "application/xhtml+xml" => Format::Html,
        "text/plain" | "text/csv" => Format::PlainText,
        "text/markdown" | "text/x-markdown" => Format::Markdown,
        "application/pdf" => Format::Pdf,
        DOCX_MIME => Format::Docx,
        PPTX_MIME => Format::Pptx,
        _ => sniff(&payload.bytes),
    }
}

fn sniff(bytes: &[u8]) -> Format {
    if bytes.starts_with(b"%PDF-") {
        return Format::Pdf;
    }
    if bytes.starts_with(b"PK\x03\x04") {
        // Office containers name their main part early in the central directory.
        if contains(bytes, b"word/document.xml") {
            return Format::Docx;
        }
        if contains(bytes, b"ppt/slides/") {
            return Format::Pptx;
        }
        return Format::Unknown;
    }
    let head = &bytes[..bytes.len().min(512)];
    let head = String::from_utf8_lossy(head).to_ascii_lowercase();
    if head.trim_start().starts_with("<!doctype html") || head.contains("<html") {
        return Format::Html;
    }
    Format::Unknown
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use coursepipe_shared::ResourceId;

    fn payload(mime: &str, bytes: &[u8]) -> RawPayload {
        RawPayload::new(ResourceId::from("file-1"), mime, bytes.to_vec())
    }

    #[test]
    fn declared_type_wins() {
        assert_eq!(classify(&payload("text/html", b"")), Format::Html);
        assert_eq!(classify(&payload("application/pdf", b"")), Format::Pdf);
        assert_eq!(classify(&payload(DOCX_MIME, b"")), Format::Docx);
    }

    #[test]
    fn octet_stream_is_sniffed() {
        assert_eq!(
            classify(&payload("application/octet-stream", b"%PDF-1.7\n...")),
            Format::Pdf
        );
        assert_eq!(
            classify(&payload("application/octet-stream", b"<!DOCTYPE html><html>")),
            Format::Html
        );
        assert_eq!(
            classify(&payload("application/octet-stream", b"\x00\x01")),
            Format::Unknown
        );
    }
}
