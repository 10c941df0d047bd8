//! Token estimation
//!
//! Clients may report an exact token count for a message; when they don't,
//! the store falls back to a character heuristic of roughly four characters
//! per token.

/// Characters per token used by the heuristic estimate
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimate the token count of a piece of text.
///
/// Non-empty text always costs at least one token so that every message
/// contributes to the budget.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    if chars == 0 {
        return 0;
    }
    u32::try_from(chars.div_ceil(CHARS_PER_TOKEN)).unwrap_or(u32::MAX)
}

/// Sum token counts, saturating at `u32::MAX`
pub fn total_tokens<I>(counts: I) -> u32
where
    I: IntoIterator<Item = u32>,
{
    counts.into_iter().fold(0u32, |acc, n| acc.saturating_add(n))
}
