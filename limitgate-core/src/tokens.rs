//! Token accounting for admission decisions.
//!
//! The tokenizer here is deliberately simple: a fixed per-message overhead
//! plus a byte-ratio estimate of the content. What matters for admission
//! correctness is not accuracy against any real model vocabulary but that
//! the function is pure and is used both before admission and when the mock
//! generator reports `prompt_tokens`, so the two can never disagree.

use rand::Rng;

use crate::endpoints::chat_completions::ChatMessage;

/// Fixed token overhead charged per message (role framing, separators).
pub const MESSAGE_OVERHEAD_TOKENS: u64 = 4;

/// We estimate one token per four bytes of content. This matches the rough
/// upper bound used across the industry for English text.
const BYTES_PER_TOKEN: u64 = 4;

/// Count the input tokens for a sequence of chat messages.
///
/// Pure and deterministic: identical messages yield identical counts on any
/// node. Returns at least 1.
pub fn count_input(messages: &[ChatMessage]) -> u64 {
    let total: u64 = messages
        .iter()
        .map(|message| {
            MESSAGE_OVERHEAD_TOKENS + (message.content.len() as u64).div_ceil(BYTES_PER_TOKEN)
        })
        .sum();
    total.max(1)
}

/// Sample a completion length for the mock generator.
///
/// Uniform over `[min_tokens, max_tokens]` after capping both ends at the
/// request's `max_tokens`, bounded below by 1.
pub fn sample_output(min_tokens: u64, max_tokens: u64, request_cap: u64) -> u64 {
    let high = max_tokens.min(request_cap).max(1);
    let low = min_tokens.min(high).max(1);
    rand::rng().random_range(low..=high)
}
