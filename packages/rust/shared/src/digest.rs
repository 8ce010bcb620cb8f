//! Content hashing helpers.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Normalize Markdown for duplicate detection: unify line endings, trim
/// trailing whitespace per line, collapse runs of blank lines, and
/// lowercase the result.
pub fn normalize_markdown(md: &str) -> String {
    let mut out = String::with_capacity(md.len());
    let mut blank_run = 0usize;

    for line in md.replace("\r\n", "\n").replace('\r', "\n").lines() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            blank_run += 1;
            continue;
        }
        if !out.is_empty() {
            out.push_str(if blank_run > 0 { "\n\n" } else { "\n" });
        }
        blank_run = 0;
        out.push_str(&line.to_lowercase());
    }

    out
}

/// Hash of the normalized form of `md`.
pub fn markdown_hash(md: &str) -> String {
    sha256_hex(normalize_markdown(md).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_value() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn normalization_ignores_cosmetic_differences() {
        let a = "# Week 1\r\n\r\n\r\nRead chapter 2.   \n";
        let b = "# week 1\n\nRead Chapter 2.";
        assert_eq!(markdown_hash(a), markdown_hash(b));
        assert_ne!(markdown_hash(a), markdown_hash("# Week 2\n\nRead chapter 2."));
    }
}
