//! Token estimation.
//!
//! Budgets throughout the crate (segment limits, context and history
//! cutoffs) are expressed in tokens. An exact tokenizer is model specific,
//! so this uses the common approximation of four characters per token.

/// Approximate chars-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimated token count of `text`, rounded up. Empty text is 0 tokens.
pub fn count_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up() {
        assert_eq!(count_tokens(""), 0);
        assert_eq!(count_tokens("a"), 1);
        assert_eq!(count_tokens("abcd"), 1);
        assert_eq!(count_tokens("abcde"), 2);
    }

    #[test]
    fn counts_chars_not_bytes() {
        assert_eq!(count_tokens("ééééé"), 2);
    }
}
