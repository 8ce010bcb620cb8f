//! Token estimate shared by the filter threshold and the chunk sizer.
//!
//! A token is a maximal run of non-whitespace characters. This keeps
//! `min_tokens`, `max_chunk_tokens`, and `overlap_tokens` in one unit.

/// Count whitespace-delimited tokens in `text`.
pub fn count_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_whitespace_runs() {
        assert_eq!(count_tokens(""), 0);
        assert_eq!(count_tokens("   \n\t "), 0);
        assert_eq!(count_tokens("# Title\n\nOne two  three."), 5);
    }
}
